//! Sequential chunked reads and whole-file digests.
use crate::transport::MAX_PAYLOAD;
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::fs::File;
use std::io::{self, BufReader, Read};

/// Calculates the SHA-256 hash of a file at the given path.
pub fn get_file_sha256_hash(file_path: &std::path::Path) -> Result<[u8; 32], std::io::Error> {
    let file = File::open(file_path)?;
    let mut reader = ChunkReader::new(BufReader::new(file));
    let mut hasher = Sha256::new();

    // Use a thread-local buffer to avoid reallocating the buffer on each call
    thread_local! {
        static BUFFER: RefCell<Vec<u8>> = RefCell::new(vec![0u8; 64 * MAX_PAYLOAD]);
    }

    loop {
        let is_eof_result: io::Result<bool> = BUFFER.with(|buffer_cell| {
            let mut buffer = buffer_cell.borrow_mut();
            let bytes_read = reader.fill(&mut buffer)?;

            if bytes_read == 0 {
                return Ok(true);
            }

            hasher.update(&buffer[..bytes_read]);
            Ok(false)
        });

        match is_eof_result {
            Ok(true) => break,       // EOF reached
            Ok(false) => continue,   // Processed a chunk, continue reading
            Err(e) => return Err(e), // Propagate any I/O errors
        }
    }

    let result = hasher.finalize();
    let mut hash_array = [0u8; 32];
    hash_array.copy_from_slice(&result);
    Ok(hash_array)
}

/// Lowercase hex rendering of a digest, for logs.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Splits a byte source into successive chunks.
///
/// Every chunk except the last is exactly the requested size; short reads
/// from the underlying reader are retried until the chunk is full or the
/// source ends.
#[derive(Debug)]
pub struct ChunkReader<R> {
    inner: R,
    bytes_read: u64,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            bytes_read: 0,
        }
    }

    /// Reads the next chunk of at most `max_len` bytes.
    ///
    /// An empty vector means the source is exhausted.
    pub fn read_chunk(&mut self, max_len: usize) -> io::Result<Vec<u8>> {
        let mut buffer = vec![0u8; max_len];
        let filled = self.fill(&mut buffer)?;
        buffer.truncate(filled);
        Ok(buffer)
    }

    /// Total bytes handed out so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn fill(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buffer.len() {
            match self.inner.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(read) => filled += read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.bytes_read += filled as u64;
        Ok(filled)
    }
}
