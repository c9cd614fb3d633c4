//! Per-entry metadata persisted next to each cached artifact.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// File name of the metadata document inside an entry directory.
pub const METADATA_FILE: &str = "entry.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub key: String,
    /// File name of the artifact inside the entry directory; keeps the
    /// platform library extension so the loader recognizes it.
    pub artifact: String,
    /// Sha1 of the artifact bytes; a mismatch turns the lookup into a miss.
    pub checksum: String,
    /// Unix seconds at persist time; drives age-based cleanup.
    pub created_at: u64,
    /// Symbols the artifact exports, recorded so a loaded module can be
    /// cross-checked without re-running extraction.
    pub symbols: Vec<String>,
}

impl EntryMetadata {
    pub fn new(key: String, artifact: String, checksum: String, symbols: Vec<String>) -> Self {
        Self {
            key,
            artifact,
            checksum,
            created_at: unix_now(),
            symbols,
        }
    }

    pub fn age_secs(&self) -> u64 {
        unix_now().saturating_sub(self.created_at)
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Streaming Sha1 of a file's contents.
pub fn checksum_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        std::fs::write(&path, b"artifact bytes").unwrap();
        let a = checksum_file(&path).unwrap();
        let b = checksum_file(&path).unwrap();
        assert_eq!(a, b);
        std::fs::write(&path, b"other bytes").unwrap();
        assert_ne!(checksum_file(&path).unwrap(), a);
    }

    #[test]
    fn test_metadata_round_trip() {
        let meta = EntryMetadata::new(
            "abc123".into(),
            "libferrule_unit.so".into(),
            "deadbeef".into(),
            vec!["add".into()],
        );
        let json = serde_json::to_string(&meta).unwrap();
        let back: EntryMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.key, "abc123");
        assert_eq!(back.symbols, vec!["add".to_string()]);
    }
}
