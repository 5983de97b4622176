//! Model asset inspection.
//!
//! Checks that the weight file exists and reads enough of its header to tell
//! a GGUF file from anything else, before the engine is asked to load it.

use std::io::Read;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::info;

const GGUF_MAGIC: &[u8; 4] = b"GGUF";

#[derive(Error, Debug)]
pub enum ModelLoaderError {
    #[error("Model file not found: {}", .0.display())]
    AssetMissing(PathBuf),

    #[error("Invalid GGUF format: {0}")]
    InvalidFormat(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// On-disk container format of a weight file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ModelFormat {
    Gguf { version: u32 },
    Unknown,
}

/// What we know about a weight file without loading it.
#[derive(Debug, Clone, Serialize)]
pub struct ModelAsset {
    pub path: PathBuf,

    /// File size in bytes.
    pub file_size: u64,

    pub format: ModelFormat,
}

impl ModelAsset {
    pub fn is_gguf(&self) -> bool {
        matches!(self.format, ModelFormat::Gguf { .. })
    }
}

/// Inspect a weight file.
///
/// Fails with [`ModelLoaderError::AssetMissing`] when the path does not point
/// at a regular file.
pub fn inspect(path: &Path) -> Result<ModelAsset, ModelLoaderError> {
    if !path.is_file() {
        return Err(ModelLoaderError::AssetMissing(path.to_path_buf()));
    }

    let file_size = std::fs::metadata(path)?.len();

    let mut header = [0u8; 8];
    let mut file = std::fs::File::open(path)?;
    let read = read_up_to(&mut file, &mut header)?;

    let format = if read == header.len() && &header[..4] == GGUF_MAGIC {
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        ModelFormat::Gguf { version }
    } else {
        ModelFormat::Unknown
    };

    let asset = ModelAsset {
        path: path.to_path_buf(),
        file_size,
        format,
    };

    info!(
        path = %asset.path.display(),
        size = asset.file_size,
        format = ?asset.format,
        "Inspected model asset"
    );

    Ok(asset)
}

/// Inspect a weight file and require the GGUF container.
pub fn require_gguf(path: &Path) -> Result<ModelAsset, ModelLoaderError> {
    let asset = inspect(path)?;
    if !asset.is_gguf() {
        return Err(ModelLoaderError::InvalidFormat(format!(
            "{} does not start with the GGUF magic",
            path.display()
        )));
    }
    Ok(asset)
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file() {
        let tmp = TempDir::new().unwrap();
        let err = inspect(&tmp.path().join("absent.gguf")).unwrap_err();
        assert!(matches!(err, ModelLoaderError::AssetMissing(_)));
    }

    #[test]
    fn test_gguf_header_detected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("model.gguf");
        let mut data = b"GGUF".to_vec();
        data.extend_from_slice(&3u32.to_le_bytes());
        data.extend_from_slice(&[0u8; 56]);
        std::fs::write(&path, &data).unwrap();

        let asset = require_gguf(&path).unwrap();
        assert_eq!(asset.format, ModelFormat::Gguf { version: 3 });
        assert_eq!(asset.file_size, 64);
    }

    #[test]
    fn test_short_file_is_not_gguf() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tiny.gguf");
        std::fs::write(&path, b"GGU").unwrap();

        assert_eq!(inspect(&path).unwrap().format, ModelFormat::Unknown);
        assert!(matches!(
            require_gguf(&path),
            Err(ModelLoaderError::InvalidFormat(_))
        ));
    }
}
