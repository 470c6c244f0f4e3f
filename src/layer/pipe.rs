//! In-memory byte pipe between the layer producer and its consumer: a
//! bounded channel of chunks with a close-with-error sentinel. Single
//! writer, single reader; closing either side propagates to the peer.

use std::io;
use std::io::{Read, Write};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

/// Chunks in flight before the writer stalls.
const PIPE_DEPTH: usize = 16;

pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = sync_channel(PIPE_DEPTH);
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            chunk: Vec::new(),
            pos: 0,
            failed: None,
        },
    )
}

pub struct PipeWriter {
    tx: SyncSender<io::Result<Vec<u8>>>,
}

impl PipeWriter {
    /// A handle that can still fail the stream after the writer itself has
    /// been consumed by a tar builder or an encoder. Dropping both the
    /// writer and the sentinel without an error is a clean EOF.
    pub fn sentinel(&self) -> PipeSentinel {
        PipeSentinel {
            tx: self.tx.clone(),
        }
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(Ok(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "layer reader dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct PipeSentinel {
    tx: SyncSender<io::Result<Vec<u8>>>,
}

impl PipeSentinel {
    pub fn close_with_error(&self, err: io::Error) {
        let _ = self.tx.send(Err(err));
    }
}

pub struct PipeReader {
    rx: Receiver<io::Result<Vec<u8>>>,
    chunk: Vec<u8>,
    pos: usize,
    failed: Option<String>,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(message) = &self.failed {
            return Err(io::Error::other(message.clone()));
        }
        while self.pos == self.chunk.len() {
            match self.rx.recv() {
                Ok(Ok(chunk)) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Ok(Err(err)) => {
                    self.failed = Some(err.to_string());
                    return Err(err);
                }
                // All writers gone: end of stream.
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
