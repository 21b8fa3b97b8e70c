//! Line-delimited object channel.
//!
//! One JSON document per line in each direction. The same channel type is
//! used for the worker pipe (child stdio on one side, process handles on the
//! other), for replication streams and for control connections.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{MasterError, MasterResult};

/// Bidirectional channel exchanging one encoded object per line.
pub struct ObjectChannel<R, W> {
    reader: BufReader<R>,
    writer: W,
    line: String,
}

impl<R, W> ObjectChannel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Wraps the two halves of a connection.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            line: String::new(),
        }
    }

    /// Encodes `obj` and writes it as one line, flushing immediately.
    pub async fn send<T: Serialize + ?Sized>(&mut self, obj: &T) -> MasterResult<()> {
        let mut line = serde_json::to_string(obj)?;
        line.push('\n');
        self.send_line(line.as_bytes()).await
    }

    /// Writes an already encoded line (including its terminator).
    pub async fn send_line(&mut self, line: &[u8]) -> MasterResult<()> {
        self.writer.write_all(line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Reads the next object. Returns `Ok(None)` on a clean end of stream.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> MasterResult<Option<T>> {
        self.line.clear();
        let n = self.reader.read_line(&mut self.line).await?;
        if n == 0 {
            return Ok(None);
        }
        let text = self.line.trim_end_matches(['\n', '\r']);
        Ok(Some(serde_json::from_str(text)?))
    }

    /// Reads the next object, treating end of stream as a protocol error.
    pub async fn expect<T: DeserializeOwned>(&mut self) -> MasterResult<T> {
        self.recv()
            .await?
            .ok_or_else(|| MasterError::Protocol("channel closed by peer".to_string()))
    }

    /// Reads one raw line of at most `limit` bytes (terminator included).
    ///
    /// Used for the replication preamble, which is not an encoded object.
    pub async fn recv_raw_line(&mut self, limit: usize) -> MasterResult<Vec<u8>> {
        let mut buf = Vec::new();
        let mut bounded = (&mut self.reader).take(limit as u64);
        bounded.read_until(b'\n', &mut buf).await?;
        Ok(buf)
    }

    /// Shuts down the write half so the peer observes end of stream.
    pub async fn shutdown(&mut self) -> MasterResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    /// Gives back the reader and writer. Buffered input is lost.
    pub fn into_inner(self) -> (R, W) {
        (self.reader.into_inner(), self.writer)
    }
}
