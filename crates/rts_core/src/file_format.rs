//! Framing shared by save and replay files.
//!
//! A file is a fixed `(magic, version)` header followed by the bincode body.
//! The header is checked before the body is touched, so a file from another
//! layout fails with [`GameError::VersionMismatch`] rather than a decode error.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{GameError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct FileHeader {
    magic: [u8; 4],
    version: u32,
}

/// Identifies one kind of file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FileKind {
    pub name: &'static str,
    pub magic: [u8; 4],
    pub version: u32,
}

impl FileKind {
    pub(crate) fn encode<T: Serialize>(&self, body: &T) -> Result<Vec<u8>> {
        self.encode_as(self.version, body)
    }

    pub(crate) fn encode_as<T: Serialize>(&self, version: u32, body: &T) -> Result<Vec<u8>> {
        let header = FileHeader {
            magic: self.magic,
            version,
        };
        let mut bytes = bincode::serialize(&header)?;
        bytes.extend(bincode::serialize(body)?);
        Ok(bytes)
    }

    pub(crate) fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        let mut reader = bytes;
        let header: FileHeader = bincode::deserialize_from(&mut reader)
            .map_err(|_| GameError::Serialization(format!("truncated {} header", self.name)))?;
        if header.magic != self.magic {
            return Err(GameError::Serialization(format!("not a {} file", self.name)));
        }
        if header.version != self.version {
            return Err(GameError::VersionMismatch {
                kind: self.name,
                expected: self.version,
                found: header.version,
            });
        }
        Ok(bincode::deserialize(reader)?)
    }
}
