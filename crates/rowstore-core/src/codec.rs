//! Object converter: bincode payloads framed with a CRC32C
//!
//! Frame layout:
//! ```text
//! [crc32c: u32 LE][payload: bincode]
//! ```
//!
//! Used for row bytes in row files and for every persisted state blob (model,
//! ledger, field keepers). Whole-state files are written through a `.tmp`
//! sibling and renamed into place.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::files::{tmp_path, FileHelper};

/// Bytes of frame header in front of every payload.
pub const FRAME_HEADER: usize = 4;

/// Serialize, deserialize, persist and deep-copy engine objects.
#[derive(Clone)]
pub struct ObjectConverter {
    files: FileHelper,
    verify_checksums: bool,
}

impl ObjectConverter {
    pub fn new(config: &Config) -> Self {
        Self::with_files(FileHelper::new(config), config.verify_checksums)
    }

    pub fn with_files(files: FileHelper, verify_checksums: bool) -> Self {
        Self { files, verify_checksums }
    }

    pub fn files(&self) -> &FileHelper {
        &self.files
    }

    pub fn to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> StoreResult<Vec<u8>> {
        let payload = bincode::serialize(value)?;
        let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
        frame.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> StoreResult<T> {
        self.decode(bytes, None)
    }

    /// Replace the contents of `path` with the encoded value.
    pub fn to_file<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> StoreResult<()> {
        let bytes = self.to_bytes(value)?;
        let tmp = tmp_path(path);
        self.files.write(&tmp, &bytes, false)?;
        if !self.files.replace(&tmp, path) {
            self.files.delete(&tmp);
            return Err(StoreError::Io {
                path: Some(path.to_path_buf()),
                kind: std::io::ErrorKind::Other,
                message: "cannot move encoded state into place".into(),
            });
        }
        Ok(())
    }

    /// Decode the value stored at `path`; `None` if the file does not exist.
    pub fn from_file<T: DeserializeOwned>(&self, path: &Path) -> StoreResult<Option<T>> {
        match self.files.read_all(path)? {
            Some(bytes) => self.decode(&bytes, Some(path)).map(Some),
            None => Ok(None),
        }
    }

    /// Deep copy through an encode/decode round trip.
    pub fn deep_clone<T: Serialize + DeserializeOwned>(&self, value: &T) -> StoreResult<T> {
        let payload = bincode::serialize(value)?;
        Ok(bincode::deserialize(&payload)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8], path: Option<&Path>) -> StoreResult<T> {
        if bytes.len() < FRAME_HEADER {
            return Err(StoreError::Codec(format!(
                "frame of {} bytes is shorter than its header{}",
                bytes.len(),
                path.map(|p| format!(" in {}", p.display())).unwrap_or_default()
            )));
        }
        let (header, payload) = bytes.split_at(FRAME_HEADER);
        if self.verify_checksums {
            let expected = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let actual = crc32c::crc32c(payload);
            if expected != actual {
                return Err(StoreError::ChecksumMismatch {
                    path: path.map(Path::to_path_buf),
                    expected,
                    actual,
                });
            }
        }
        Ok(bincode::deserialize(payload)?)
    }
}
