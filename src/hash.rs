use const_hex::Buffer;
use sha2::{Digest, Sha256};
use std::io;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct HashAndSize {
    hash: String,
    pub size: u64,
}

impl HashAndSize {
    pub fn prefixed_hash(&self) -> String {
        format!("sha256:{}", self.hash.as_str())
    }

    pub fn raw_hash(&self) -> &str {
        self.hash.as_str()
    }
}

pub fn hex_digest(digest: [u8; 32]) -> String {
    let mut buffer = Buffer::<32>::new();
    buffer.format(&digest);
    buffer.to_string()
}

#[derive(Debug)]
pub struct HashedWriter<W: Write> {
    writer: W,
    total_bytes_written: u64,
    hasher: Sha256,
}

impl<W: Write> HashedWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: Sha256::new(),
            total_bytes_written: 0,
        }
    }

    pub fn into_inner(self) -> (W, HashAndSize) {
        (
            self.writer,
            HashAndSize {
                size: self.total_bytes_written,
                hash: hex_digest(self.hasher.finalize().into()),
            },
        )
    }
}

impl<W: Write> Write for HashedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let bytes_written = self.writer.write(buf)?;
        self.hasher.update(&buf[..bytes_written]);
        self.total_bytes_written += bytes_written as u64;
        Ok(bytes_written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Read-side counterpart of [`HashedWriter`]. The returned handle stays
/// usable after the reader has been moved into a compressor thread, which is
/// how layer diff IDs are computed without a second pass over the stream.
pub fn digest_reader<R: Read>(inner: R) -> (DigestReader<R>, DigestHandle) {
    let hasher = Arc::new(Mutex::new(Sha256::new()));
    (
        DigestReader {
            inner,
            hasher: hasher.clone(),
        },
        DigestHandle(hasher),
    )
}

pub struct DigestReader<R: Read> {
    inner: R,
    hasher: Arc<Mutex<Sha256>>,
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let bytes_read = self.inner.read(buf)?;
        self.hasher.lock().unwrap().update(&buf[..bytes_read]);
        Ok(bytes_read)
    }
}

pub struct DigestHandle(Arc<Mutex<Sha256>>);

impl DigestHandle {
    pub fn prefixed_hash(&self) -> String {
        let hasher = self.0.lock().unwrap().clone();
        format!("sha256:{}", hex_digest(hasher.finalize().into()))
    }
}
