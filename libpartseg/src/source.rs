//! Seekable byte sources accepted by the image reader and the archive codec.

use std::fs::File;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Anything that can be read from and repositioned
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek> ReadSeek for T {}

/// A readable, seekable input
///
/// A `Path` source is opened and closed by the consumer. A `Stream` is only
/// borrowed: the consumer reads from its current position and never closes it.
pub enum ByteSource<'a> {
    Path(PathBuf),
    Stream(&'a mut dyn ReadSeek),
}

impl<'a> ByteSource<'a> {
    /// Whether the consumer owns the underlying handle and must close it
    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Path(_))
    }

    /// File path, if the source is a path
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Path(path) => Some(path),
            Self::Stream(_) => None,
        }
    }

    /// Read everything the source has left
    pub fn read_all(self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        match self {
            Self::Path(path) => {
                let mut file = File::open(&path)?;
                file.read_to_end(&mut buffer)?;
            }
            Self::Stream(stream) => {
                stream.read_to_end(&mut buffer)?;
            }
        }
        Ok(buffer)
    }
}

impl std::fmt::Debug for ByteSource<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<PathBuf> for ByteSource<'_> {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for ByteSource<'_> {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<&str> for ByteSource<'_> {
    fn from(path: &str) -> Self {
        Self::Path(PathBuf::from(path))
    }
}

impl<'a, R: ReadSeek> From<&'a mut R> for ByteSource<'a> {
    fn from(stream: &'a mut R) -> Self {
        Self::Stream(stream)
    }
}
