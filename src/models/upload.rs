//! Upload descriptors, identifiers and the JSON bodies of the upload API.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

const MAX_NAME_LEN: usize = 255;

/// Upper bound on `chunks`; keeps a session's presence bitmap at 128 KiB.
pub const MAX_CHUNKS: u32 = 1 << 20;

/// Identifier of an in-flight upload session.
///
/// Always non-zero; zero is reserved so that a default-initialised value can
/// never collide with a live session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadId(u32);

impl UploadId {
    /// Wrap a raw value, rejecting zero.
    pub fn new(raw: u32) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UploadId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .parse::<u32>()
            .map_err(|_| format!("`{}` is not a valid upload id", s))?;
        Self::new(raw).ok_or_else(|| "upload id must be non-zero".to_string())
    }
}

/// Caller-supplied description of an upload, immutable after creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadDescriptor {
    /// Logical file name.
    pub name: String,

    /// Declared total size in bytes.
    pub size: u64,

    /// Declared number of chunks.
    pub chunks: u32,

    /// Declared size of every chunk but possibly the last.
    pub chunk_size: u64,
}

impl UploadDescriptor {
    /// Check the declared layout before a session is allocated for it.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("name must not be empty".into());
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(format!("name must be at most {} bytes", MAX_NAME_LEN));
        }
        if self
            .name
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'/' || b == b'\\')
        {
            return Err("name must not contain path separators or control characters".into());
        }
        if self.chunks == 0 {
            return Err("chunks must be at least 1".into());
        }
        if self.chunks > MAX_CHUNKS {
            return Err(format!("chunks must be at most {}", MAX_CHUNKS));
        }
        if self.chunk_size == 0 {
            return Err("chunk_size must be at least 1".into());
        }
        let capacity = u64::from(self.chunks)
            .checked_mul(self.chunk_size)
            .ok_or_else(|| "chunks * chunk_size overflows".to_string())?;
        if self.size > capacity {
            return Err(format!(
                "size {} exceeds chunks * chunk_size ({})",
                self.size, capacity
            ));
        }
        let last_offset = self.offset_of(self.chunks - 1);
        if self.chunks > 1 && self.size <= last_offset {
            return Err(format!(
                "size {} leaves chunk {} empty",
                self.size,
                self.chunks - 1
            ));
        }
        Ok(())
    }

    /// Exact byte length chunk `index` must have: `chunk_size` for every
    /// chunk but the last, which holds the remainder of `size`.
    pub fn chunk_len(&self, index: u32) -> u64 {
        self.chunk_size
            .min(self.size.saturating_sub(self.offset_of(index)))
    }

    /// Byte offset of chunk `index` inside the assembled file.
    pub fn offset_of(&self, index: u32) -> u64 {
        u64::from(index) * self.chunk_size
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            name: self.name.clone(),
            size: self.size,
            chunks: self.chunks,
            chunk_size: self.chunk_size,
        }
    }
}

/// The descriptor fields that must be jointly unique among active uploads.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    name: String,
    size: u64,
    chunks: u32,
    chunk_size: u64,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} bytes, {} x {})",
            self.name, self.size, self.chunks, self.chunk_size
        )
    }
}

/// Response body of `POST /api/upload`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateUploadResponse {
    pub upload_id: UploadId,
    pub status: String,
}

/// Response body of a successful chunk write.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkResponse {
    pub upload_id: UploadId,
    pub chunk: u32,
}

/// Response body of `GET /api/upload/{id}/status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Received chunk indices, ascending.
    pub status: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> UploadDescriptor {
        UploadDescriptor {
            name: "a.bin".into(),
            size: 4096,
            chunks: 4,
            chunk_size: 1024,
        }
    }

    #[test]
    fn upload_id_rejects_zero_and_garbage() {
        assert!("0".parse::<UploadId>().is_err());
        assert!("abc".parse::<UploadId>().is_err());
        assert!("-4".parse::<UploadId>().is_err());
        assert_eq!("42".parse::<UploadId>().unwrap().get(), 42);
    }

    #[test]
    fn validate_accepts_well_formed_descriptor() {
        assert!(descriptor().validate().is_ok());

        let short_tail = UploadDescriptor {
            size: 3000,
            ..descriptor()
        };
        assert!(short_tail.validate().is_ok());

        let empty_file = UploadDescriptor {
            size: 0,
            chunks: 1,
            ..descriptor()
        };
        assert!(empty_file.validate().is_ok());

        let most_chunks = UploadDescriptor {
            size: u64::from(MAX_CHUNKS),
            chunks: MAX_CHUNKS,
            chunk_size: 1,
            ..descriptor()
        };
        assert!(most_chunks.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_layouts() {
        let cases = [
            UploadDescriptor {
                name: String::new(),
                ..descriptor()
            },
            UploadDescriptor {
                name: "../etc/passwd".into(),
                ..descriptor()
            },
            UploadDescriptor {
                chunks: 0,
                ..descriptor()
            },
            UploadDescriptor {
                chunk_size: 0,
                ..descriptor()
            },
            UploadDescriptor {
                size: 4097,
                ..descriptor()
            },
            // The last chunk would be empty.
            UploadDescriptor {
                size: 3072,
                ..descriptor()
            },
            UploadDescriptor {
                size: 0,
                ..descriptor()
            },
            UploadDescriptor {
                chunks: MAX_CHUNKS + 1,
                chunk_size: 1,
                size: u64::from(MAX_CHUNKS) + 1,
                ..descriptor()
            },
            UploadDescriptor {
                chunks: u32::MAX,
                chunk_size: 1,
                size: 0,
                ..descriptor()
            },
        ];
        for case in cases {
            assert!(case.validate().is_err(), "{:?} should be rejected", case);
        }
    }

    #[test]
    fn fingerprint_covers_every_layout_field() {
        let base = descriptor().fingerprint();
        assert_eq!(base, descriptor().fingerprint());
        let other = UploadDescriptor {
            chunks: 2,
            chunk_size: 2048,
            ..descriptor()
        };
        assert_ne!(base, other.fingerprint());
    }

    #[test]
    fn offsets_follow_chunk_size() {
        let d = descriptor();
        assert_eq!(d.offset_of(0), 0);
        assert_eq!(d.offset_of(3), 3072);
    }

    #[test]
    fn chunk_lengths_follow_declared_size() {
        let d = UploadDescriptor {
            size: 3000,
            ..descriptor()
        };
        assert_eq!(d.chunk_len(0), 1024);
        assert_eq!(d.chunk_len(2), 1024);
        assert_eq!(d.chunk_len(3), 952);
        assert_eq!(descriptor().chunk_len(3), 1024);
    }

    #[test]
    fn size_is_required_on_the_wire() {
        let missing = serde_json::from_str::<UploadDescriptor>(
            r#"{"name":"a.bin","chunks":1,"chunk_size":4}"#,
        );
        assert!(missing.is_err());
    }
}
