//! Model file checks
//!
//! Cheap header validation run before a model is handed to the backend, so a
//! wrong path or a non-GGUF file fails fast with a readable error.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const HEADER_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model file not found: {0}")]
    NotFound(String),

    #[error("Failed to read model file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be a GGUF model")]
    Truncated,
}

/// Fixed-size GGUF header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

impl GgufHeader {
    fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self, ModelError> {
        let (magic, rest) = bytes.split_at(4);
        let (version, rest) = rest.split_at(4);
        let (tensors, kvs) = rest.split_at(8);

        let magic = u32::from_le_bytes(magic.try_into().map_err(|_| ModelError::Truncated)?);
        if magic != GGUF_MAGIC {
            return Err(ModelError::InvalidMagic(magic));
        }

        let version = u32::from_le_bytes(version.try_into().map_err(|_| ModelError::Truncated)?);
        if !(2..=3).contains(&version) {
            return Err(ModelError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            tensor_count: u64::from_le_bytes(tensors.try_into().map_err(|_| ModelError::Truncated)?),
            metadata_kv_count: u64::from_le_bytes(kvs.try_into().map_err(|_| ModelError::Truncated)?),
        })
    }
}

/// Reads and validates the GGUF header of `path`
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufHeader, ModelError> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(ModelError::NotFound(path.display().to_string()));
    }

    let mut header = [0u8; HEADER_LEN];
    let mut file = File::open(path)?;
    file.read_exact(&mut header).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => ModelError::Truncated,
        _ => ModelError::Io(e),
    })?;

    GgufHeader::parse(&header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_header(magic: u32, version: u32) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(&magic.to_le_bytes()).unwrap();
        file.write_all(&version.to_le_bytes()).unwrap();
        file.write_all(&291u64.to_le_bytes()).unwrap();
        file.write_all(&24u64.to_le_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_valid_header() {
        let file = write_header(GGUF_MAGIC, 3);
        let header = validate_gguf(file.path()).unwrap();
        assert_eq!(header.version, 3);
        assert_eq!(header.tensor_count, 291);
        assert_eq!(header.metadata_kv_count, 24);
    }

    #[test]
    fn test_legacy_ggml_file_rejected() {
        // "ggjt" container used by pre-GGUF llama.cpp models
        let file = write_header(0x6767_6a74, 3);
        assert!(matches!(
            validate_gguf(file.path()),
            Err(ModelError::InvalidMagic(0x6767_6a74))
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let file = write_header(GGUF_MAGIC, 1);
        assert!(matches!(
            validate_gguf(file.path()),
            Err(ModelError::UnsupportedVersion(1))
        ));
    }

    #[test]
    fn test_truncated_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
        file.flush().unwrap();
        assert!(matches!(validate_gguf(file.path()), Err(ModelError::Truncated)));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("nope.gguf");
        assert!(matches!(validate_gguf(&missing), Err(ModelError::NotFound(_))));
    }
}
