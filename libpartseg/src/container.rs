use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::error::{PartSegError, Result};
use crate::source::ByteSource;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const BZIP2_MAGIC: &[u8; 3] = b"BZh";

/// Compression applied around the tar stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveCompression {
    Gzip { level: u32 },
    Bzip2 { level: u32 },
    None,
}

impl Default for ArchiveCompression {
    fn default() -> Self {
        Self::Gzip { level: 6 }
    }
}

/// A project archive read fully into memory
///
/// Members are addressed by their path inside the archive. An open archive
/// is immutable and can be loaded from any number of times.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenArchive {
    members: BTreeMap<String, Vec<u8>>,
}

impl OpenArchive {
    /// Read an archive from a path or a borrowed stream
    pub fn open(source: ByteSource<'_>) -> Result<Self> {
        let bytes = source.read_all()?;
        Self::from_bytes(&bytes)
    }

    /// Parse a gzip or bzip2 compressed, or plain, tar archive
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.starts_with(&GZIP_MAGIC) {
            trace!("Reading gzip compressed archive");
            Self::read_tar(GzDecoder::new(data))
        } else if data.starts_with(BZIP2_MAGIC) {
            trace!("Reading bzip2 compressed archive");
            Self::read_tar(BzDecoder::new(data))
        } else {
            Self::read_tar(data)
        }
    }

    fn read_tar<R: Read>(reader: R) -> Result<Self> {
        let corrupt = |err: std::io::Error| PartSegError::CorruptArchive(err.to_string());
        let mut archive = tar::Archive::new(reader);
        let mut members = BTreeMap::new();
        for entry in archive.entries().map_err(corrupt)? {
            let mut entry = entry.map_err(corrupt)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = normalize(&entry.path().map_err(corrupt)?.to_string_lossy());
            let mut content = Vec::new();
            entry.read_to_end(&mut content).map_err(corrupt)?;
            trace!("Archive member {name} ({} bytes)", content.len());
            members.insert(name, content);
        }
        if members.is_empty() {
            return Err(PartSegError::CorruptArchive("archive holds no files".to_string()));
        }
        Ok(Self { members })
    }

    pub fn member(&self, name: &str) -> Option<&[u8]> {
        self.members.get(name).map(Vec::as_slice)
    }

    /// Member content, or `CorruptArchive` naming the missing member
    pub fn require(&self, name: &str) -> Result<&[u8]> {
        self.member(name)
            .ok_or_else(|| PartSegError::CorruptArchive(format!("missing member `{name}`")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

fn normalize(name: &str) -> String {
    name.trim_start_matches("./").replace('\\', "/")
}

/// Collects members and writes them as one tar stream
#[derive(Debug, Default)]
pub struct ArchiveWriter {
    compression: ArchiveCompression,
    members: Vec<(String, Vec<u8>)>,
}

impl ArchiveWriter {
    pub fn new(compression: ArchiveCompression) -> Self {
        Self {
            compression,
            members: Vec::new(),
        }
    }

    pub fn add(&mut self, name: &str, content: Vec<u8>) {
        self.members.push((name.to_string(), content));
    }

    /// Serialize every member into `writer`
    ///
    /// Headers carry a zero timestamp so that equal projects produce equal bytes.
    pub fn finish<W: Write>(self, writer: W) -> Result<W> {
        match self.compression {
            ArchiveCompression::Gzip { level } => {
                let encoder = GzEncoder::new(writer, Compression::new(level.min(9)));
                let encoder = write_tar(encoder, &self.members)?;
                Ok(encoder.finish()?)
            }
            ArchiveCompression::Bzip2 { level } => {
                let encoder = BzEncoder::new(writer, bzip2::Compression::new(level.clamp(1, 9)));
                let encoder = write_tar(encoder, &self.members)?;
                Ok(encoder.finish()?)
            }
            ArchiveCompression::None => write_tar(writer, &self.members),
        }
    }

    /// Serialize into an in-memory buffer
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        Ok(self.finish(Cursor::new(Vec::new()))?.into_inner())
    }
}

fn write_tar<W: Write>(writer: W, members: &[(String, Vec<u8>)]) -> Result<W> {
    let mut builder = tar::Builder::new(writer);
    for (name, content) in members {
        debug!("Writing archive member {name} ({} bytes)", content.len());
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, name, content.as_slice())?;
    }
    Ok(builder.into_inner()?)
}
