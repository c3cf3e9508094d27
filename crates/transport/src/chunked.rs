use std::io::Read;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::DEFAULT_CHUNK_SIZE;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub fn calculate_file_checksum(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Reads a file front to back in fixed-size chunks.
pub struct ChunkReader {
    file: std::fs::File,
    chunk_size: usize,
    consumed: u64,
    file_size: u64,
}

impl ChunkReader {
    /// Opens `path` for chunked reading.
    ///
    /// If `chunk_size` is 0, [`DEFAULT_CHUNK_SIZE`] is used.
    pub fn new(path: &Path, chunk_size: usize) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let file_size = file.metadata()?.len();
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Ok(Self {
            file,
            chunk_size,
            consumed: 0,
            file_size,
        })
    }

    /// Reads the next chunk. Returns `None` at EOF.
    pub fn next_chunk(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        let remaining = self.remaining();
        if remaining == 0 {
            return Ok(None);
        }

        let read_size = remaining.min(self.chunk_size as u64) as usize;
        let mut buf = vec![0u8; read_size];
        let n = self.file.read(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        self.consumed += n as u64;
        Ok(Some(buf))
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn remaining(&self) -> u64 {
        self.file_size.saturating_sub(self.consumed)
    }
}

// ---------------------------------------------------------------------------
// Throttle
// ---------------------------------------------------------------------------

/// Paces writers so their combined throughput stays under a byte rate.
///
/// Shared by every stream of a session. Blocks the calling thread, so it is
/// only meant for engine worker threads.
pub struct Throttle {
    rate: Option<u64>,
    inner: Mutex<ThrottleInner>,
}

struct ThrottleInner {
    started: Instant,
    sent: u64,
}

impl Throttle {
    /// Creates a throttle limited to `rate` bytes per second (`None` = unlimited).
    pub fn new(rate: Option<u64>) -> Self {
        Self {
            rate: rate.filter(|r| *r > 0),
            inner: Mutex::new(ThrottleInner {
                started: Instant::now(),
                sent: 0,
            }),
        }
    }

    /// Accounts for `bytes` just sent and sleeps if the sender is ahead of
    /// the allowed rate.
    pub fn pace(&self, bytes: u64) {
        if let Some(wait) = self.record(bytes) {
            std::thread::sleep(wait);
        }
    }

    /// Returns how long the sender must wait after `bytes` more.
    fn record(&self, bytes: u64) -> Option<Duration> {
        let rate = self.rate?;
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.sent += bytes;
        let due = Duration::from_secs_f64(inner.sent as f64 / rate as f64);
        let elapsed = inner.started.elapsed();
        due.checked_sub(elapsed).filter(|d| !d.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn create_test_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    #[test]
    fn checksum_bytes_deterministic() {
        let c1 = checksum_bytes(b"hello world");
        assert_eq!(c1, checksum_bytes(b"hello world"));
        assert_eq!(c1.len(), 64);
        assert_ne!(c1, checksum_bytes(b"hello"));
    }

    #[test]
    fn calculate_file_checksum_matches_bytes() {
        let dir = TempDir::new().unwrap();
        let data = b"ACGTACGTNNNN";
        let path = create_test_file(dir.path(), "reads.fa", data);
        assert_eq!(calculate_file_checksum(&path).unwrap(), checksum_bytes(data));
    }

    #[test]
    fn chunk_reader_reads_all() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"AABBCCDDEE");

        let mut reader = ChunkReader::new(&path, 4).unwrap();
        assert_eq!(reader.file_size(), 10);

        assert_eq!(reader.next_chunk().unwrap().unwrap(), b"AABB");
        assert_eq!(reader.remaining(), 6);
        assert_eq!(reader.next_chunk().unwrap().unwrap(), b"CCDD");
        assert_eq!(reader.next_chunk().unwrap().unwrap(), b"EE");
        assert_eq!(reader.remaining(), 0);
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn unlimited_throttle_never_waits() {
        let throttle = Throttle::new(None);
        assert!(throttle.record(u64::MAX / 2).is_none());
        let zero = Throttle::new(Some(0));
        assert!(zero.record(1024).is_none());
    }

    #[test]
    fn throttle_asks_fast_sender_to_wait() {
        let throttle = Throttle::new(Some(1_000));
        let wait = throttle.record(2_000).expect("sender is ahead");
        assert!(wait > Duration::from_millis(1_500));
        assert!(wait <= Duration::from_secs(2));
    }
}
