// BLAKE3 content hashing
use anyhow::{Context, Result};
use blake3::{Hash, Hasher};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;

/// Digest of a file's bytes, used to decide whether a local image and a
/// remote object hold the same content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(Hash);

impl ContentHash {
    /// Hash a file with streaming I/O
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("Failed to open file: {}", path.display()))?;

        let reader = BufReader::with_capacity(1024 * 1024, file);
        Self::from_reader(reader).with_context(|| format!("Failed to hash file: {}", path.display()))
    }

    /// Hash a file on the blocking pool so async callers don't stall the runtime
    pub async fn from_file_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || Self::from_file(&path))
            .await
            .context("Hashing task panicked")?
    }

    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut hasher = Hasher::new();
        let mut buffer = [0u8; 16384];

        loop {
            let bytes_read = reader
                .read(&mut buffer)
                .context("Failed to read data for hashing")?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(ContentHash(hasher.finalize()))
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        ContentHash(blake3::hash(data))
    }

    /// Lowercase hex, 64 chars
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// First 8 hex chars, used to disambiguate remote object names
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }

    /// Compare against a hash string as stored in cache or object metadata.
    /// Accepts raw hex or a `blake3:` prefixed form.
    pub fn matches(&self, other: &str) -> bool {
        Self::from_str(other.trim()).is_ok_and(|parsed| parsed == *self)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let hex = s.strip_prefix("blake3:").unwrap_or(s);

        if hex.len() != 64 {
            anyhow::bail!("Invalid content hash length: expected 64 hex chars, got {}", hex.len());
        }

        let bytes = hex::decode(hex).with_context(|| format!("Failed to decode hex hash: {}", hex))?;

        let mut hash_bytes = [0u8; 32];
        hash_bytes.copy_from_slice(&bytes);

        Ok(ContentHash(Hash::from(hash_bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn test_hash_hello_world() {
        let hash = ContentHash::from_bytes(b"hello world");
        // Known BLAKE3 hash for "hello world"
        assert_eq!(
            hash.to_hex(),
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
        assert_eq!(hash.short(), "d74981ef");
    }

    #[test]
    fn test_hash_from_reader_large() {
        // Larger than the read buffer
        let data = vec![0xAB; 100_000];
        let hash = ContentHash::from_reader(Cursor::new(&data)).unwrap();
        assert_eq!(hash, ContentHash::from_bytes(&data));
    }

    #[test]
    fn test_hash_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("logo.png");
        std::fs::write(&path, b"png bytes").unwrap();

        let hash = ContentHash::from_file(&path).unwrap();
        assert_eq!(hash, ContentHash::from_bytes(b"png bytes"));
    }

    #[test]
    fn test_hash_from_missing_file() {
        let err = ContentHash::from_file("/definitely/not/here.png").unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to open file"));
    }

    #[test]
    fn test_matches_accepts_prefixed_and_raw() {
        let hash = ContentHash::from_bytes(b"verify test");
        assert!(hash.matches(&hash.to_hex()));
        assert!(hash.matches(&format!("blake3:{}", hash.to_hex())));
        assert!(!hash.matches("invalid"));
        assert!(!hash.matches(&ContentHash::from_bytes(b"other").to_hex()));
    }

    #[test]
    fn test_from_str_rejects_bad_hex() {
        assert!(ContentHash::from_str("blake3:tooshort").is_err());
        assert!(ContentHash::from_str(&"z".repeat(64)).is_err());
    }

    #[tokio::test]
    async fn test_from_file_async() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.bin");
        std::fs::write(&path, b"async").unwrap();

        let hash = ContentHash::from_file_async(&path).await.unwrap();
        assert_eq!(hash, ContentHash::from_bytes(b"async"));
    }
}
