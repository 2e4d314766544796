//! Firmware images, normalised to the device flash geometry.

use std::convert::TryFrom;
use std::fs::File;
use std::io::{ErrorKind as IoErrorKind, Read};
use std::path::Path;

use crate::protocol::{IMAGE_SIZE, PAD_BYTE, PAGE_COUNT, PAGE_SIZE};

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum ImageError {
    #[error("firmware source unavailable: {0:?}")]
    Unavailable(IoErrorKind),

    #[error("unable to allocate firmware buffer")]
    Allocation,
}

impl From<std::io::Error> for ImageError {
    fn from(e: std::io::Error) -> Self {
        ImageError::Unavailable(e.kind())
    }
}

/// A firmware image of exactly [`IMAGE_SIZE`] bytes.
///
/// Sources shorter than the flash are padded with [`PAD_BYTE`], longer
/// sources are truncated.
#[derive(Clone, PartialEq)]
pub struct Image {
    data: Vec<u8>,
    source_len: usize,
}

impl Image {
    /// Build an image from an in-memory firmware binary
    pub fn from_bytes(source: &[u8]) -> Result<Self, ImageError> {
        let mut data = alloc_image()?;

        let n = source.len().min(IMAGE_SIZE);
        data[..n].copy_from_slice(&source[..n]);

        if source.len() > IMAGE_SIZE {
            debug!(
                "Truncating firmware from {} to {} bytes",
                source.len(),
                IMAGE_SIZE
            );
        }

        Ok(Self {
            data,
            source_len: source.len(),
        })
    }

    /// Build an image from a reader providing `len` bytes
    pub fn from_reader<R: Read>(mut r: R, len: usize) -> Result<Self, ImageError> {
        let mut data = alloc_image()?;

        let n = len.min(IMAGE_SIZE);
        r.read_exact(&mut data[..n])?;

        Ok(Self {
            data,
            source_len: len,
        })
    }

    /// Load a raw firmware binary from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ImageError> {
        let path = path.as_ref();

        let len = std::fs::metadata(path)
            .map_err(|e| {
                error!("Unable to stat firmware '{}': {}", path.display(), e);
                ImageError::from(e)
            })?
            .len();
        let len = file_len(len);

        let f = File::open(path).map_err(|e| {
            error!("Unable to open firmware '{}': {}", path.display(), e);
            ImageError::from(e)
        })?;

        debug!("Loading {} byte firmware from '{}'", len, path.display());

        Self::from_reader(f, len)
    }

    /// Image contents, always [`IMAGE_SIZE`] bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Length of the firmware source prior to padding
    pub fn source_len(&self) -> usize {
        self.source_len
    }

    /// Fetch the contents of a page
    pub fn page(&self, index: usize) -> Option<&[u8]> {
        if index >= PAGE_COUNT {
            return None;
        }
        let offset = index * PAGE_SIZE;
        Some(&self.data[offset..offset + PAGE_SIZE])
    }

    /// Iterate over image pages in ascending order
    pub fn pages(&self) -> core::slice::Chunks<'_, u8> {
        self.data.chunks(PAGE_SIZE)
    }
}

impl core::fmt::Debug for Image {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Image")
            .field("source_len", &self.source_len)
            .finish()
    }
}

/// Convert a file length, clamping to [`IMAGE_SIZE`] where it exceeds `usize`
fn file_len(len: u64) -> usize {
    usize::try_from(len).unwrap_or(IMAGE_SIZE)
}

fn alloc_image() -> Result<Vec<u8>, ImageError> {
    let mut data = Vec::new();
    data.try_reserve_exact(IMAGE_SIZE).map_err(|_| {
        error!("Failed to allocate {} byte image", IMAGE_SIZE);
        ImageError::Allocation
    })?;
    data.resize(IMAGE_SIZE, PAD_BYTE);

    Ok(data)
}
