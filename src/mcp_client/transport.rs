//! Line-delimited JSON transport.
//!
//! One JSON document per line in each direction. The writer flushes after
//! every line; callers that share a writer must hold a lock around
//! [`LineWriter::write_line`], the transport itself does no interleaving
//! protection.

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

use super::errors::McpError;

// ─── Writer ──────────────────────────────────────────────────────────────────

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Write half of the transport (the child's stdin).
pub struct LineWriter {
    server_name: String,
    /// `None` once closed.
    inner: Option<BoxedWrite>,
}

impl LineWriter {
    pub fn new<W>(server_name: &str, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            server_name: server_name.to_string(),
            inner: Some(Box::new(writer)),
        }
    }

    /// Write one line plus terminator and flush before returning.
    pub async fn write_line(&mut self, text: &str) -> Result<(), McpError> {
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text.trim_end_matches(['\r', '\n']));
        line.push('\n');

        let Some(inner) = self.inner.as_mut() else {
            return Err(transport_error(&self.server_name, "stdin is closed".into()));
        };
        inner
            .write_all(line.as_bytes())
            .await
            .map_err(|e| transport_error(&self.server_name, format!("failed to write to stdin: {e}")))?;
        inner
            .flush()
            .await
            .map_err(|e| transport_error(&self.server_name, format!("failed to flush stdin: {e}")))?;
        Ok(())
    }

    /// Serialize a message and write it as one line.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), McpError> {
        let json = serde_json::to_string(message)
            .map_err(|e| transport_error(&self.server_name, format!("failed to serialize message: {e}")))?;
        tracing::trace!(server = %self.server_name, line = %json, "-> stdin");
        self.write_line(&json).await
    }

    /// Close the stream. A well-behaved server exits on stdin EOF.
    ///
    /// The handle is dropped: for a child's stdin, `shutdown` alone does not
    /// close the pipe.
    pub async fn close(&mut self) {
        let Some(mut inner) = self.inner.take() else {
            return;
        };
        if let Err(e) = inner.shutdown().await {
            tracing::debug!(server = %self.server_name, error = %e, "stdin shutdown failed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

fn transport_error(server_name: &str, reason: String) -> McpError {
    McpError::TransportFailure {
        server: server_name.to_string(),
        tool: None,
        attempts: 0,
        process_alive: false,
        reason,
    }
}

// ─── Reader ──────────────────────────────────────────────────────────────────

/// Read half of the transport (the child's stdout).
pub struct LineReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R> LineReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Next non-empty line, or `None` on EOF.
    pub async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            match self.lines.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(line)),
                None => return Ok(None),
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
