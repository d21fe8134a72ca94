//! Content-addressed file records

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::codec;
use crate::error::{Error, Result};

/// SHA-256 digest of a blob
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    /// Lowercase hex
    pub hash: String,
    pub size_bytes: u64,
}

impl Digest {
    pub fn compute(data: &[u8]) -> Self {
        Self {
            hash: format!("{:x}", Sha256::digest(data)),
            size_bytes: data.len() as u64,
        }
    }

    pub fn matches(&self, data: &[u8]) -> bool {
        *self == Digest::compute(data)
    }
}

/// A blob stored under a group
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRecord {
    pub group_id: String,
    pub digest: Digest,
}

impl FileRecord {
    pub fn new(group_id: impl Into<String>, digest: Digest) -> Self {
        Self {
            group_id: group_id.into(),
            digest,
        }
    }

    /// Key under which the record's metadata and bytes are registered
    pub fn metadata_key(&self) -> Result<Vec<u8>> {
        self.validate()?;
        Ok(format!("{}/{}", self.group_id, self.digest.hash).into_bytes())
    }

    fn validate(&self) -> Result<()> {
        let group_ok = !self.group_id.is_empty()
            && self
                .group_id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !group_ok {
            return Err(Error::InvalidArgument(format!(
                "invalid group id {:?}",
                self.group_id
            )));
        }
        let hash_ok = self.digest.hash.len() == 64
            && self
                .digest
                .hash
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !hash_ok {
            return Err(Error::InvalidArgument(format!(
                "invalid digest {:?}",
                self.digest.hash
            )));
        }
        Ok(())
    }
}

/// Value stored at a record's metadata key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub record: FileRecord,
    /// Committed bytes; `None` when this replica never received the staged bytes
    pub data: Option<Vec<u8>>,
}

impl StoredRecord {
    pub fn encode(&self) -> Result<Vec<u8>> {
        codec::encode(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        codec::decode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest() {
        let d = Digest::compute(b"hello");
        assert_eq!(
            d.hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(d.size_bytes, 5);
        assert!(d.matches(b"hello"));
        assert!(!d.matches(b"hellO"));
    }

    #[test]
    fn test_metadata_key() {
        let fr = FileRecord::new("grp1", Digest::compute(b"x"));
        let key = fr.metadata_key().unwrap();
        assert!(key.starts_with(b"grp1/"));
        assert!(!crate::keys::is_unsplittable(&key));

        assert!(FileRecord::new("", Digest::compute(b"x")).metadata_key().is_err());
        assert!(FileRecord::new("a/b", Digest::compute(b"x")).metadata_key().is_err());
        let bad = FileRecord::new(
            "g",
            Digest {
                hash: "zz".into(),
                size_bytes: 1,
            },
        );
        assert!(bad.metadata_key().is_err());
    }
}
