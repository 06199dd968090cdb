//! Project archive codec.
//!
//! A project is stored as one (by default gzip-compressed) tar archive:
//!
//! | member                      | content                                        |
//! |-----------------------------|------------------------------------------------|
//! | `image.tif`                 | the image, see [`crate::tiff_image`]           |
//! | `segmentation.npz`          | `segmentation`, `full_segmentation`, `mask`?   |
//! | `algorithm.json`            | selected algorithm and its parameters          |
//! | `history/history.json`      | one entry per recorded step                    |
//! | `history/arrays_<i>.npz`    | arrays of step `i`                             |
//!
//! Loading is all-or-nothing: any missing mandatory member, broken JSON or
//! missing history bundle fails the whole load with `CorruptArchive`.

use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::arrays::{check_shape, shape3, ArrayBundle, LabelArray, MaskArray};
use crate::container::{ArchiveCompression, ArchiveWriter, OpenArchive};
use crate::encoding::{decode_map, decode_value, encode_map, encode_mask_property};
use crate::error::{PartSegError, Result};
use crate::history::{verify_records, HistoryElement};
use crate::image::Image;
use crate::mask::MaskProperty;
use crate::parameters::{AlgorithmChoice, ParameterValue, Version};
use crate::source::{ByteSource, ReadSeek};
use crate::tiff_image::{decode_image, encode_image};

pub const IMAGE_MEMBER: &str = "image.tif";
pub const SEGMENTATION_MEMBER: &str = "segmentation.npz";
pub const ALGORITHM_MEMBER: &str = "algorithm.json";
pub const HISTORY_MEMBER: &str = "history/history.json";

/// Member holding the arrays of history step `index`
pub fn history_arrays_member(index: usize) -> String {
    format!("history/arrays_{index}.npz")
}

/// Everything persisted for one project
///
/// `image` carries no mask; the mask travels in `mask`. Equality ignores
/// `file_path`, so a project compares equal to its reloaded copy.
#[derive(Debug, Clone)]
pub struct ProjectTuple {
    pub file_path: PathBuf,
    pub image: Image,
    pub segmentation: Option<LabelArray>,
    pub full_segmentation: Option<LabelArray>,
    pub mask: Option<MaskArray>,
    pub history: Vec<HistoryElement>,
    pub algorithm: Option<AlgorithmChoice>,
}

impl ProjectTuple {
    /// Project holding only an image; a mask attached to it is moved to `mask`
    pub fn new(image: Image) -> Self {
        let mask = image.mask().cloned();
        let image = image.with_mask(None).unwrap_or_else(|_| image.clone());
        Self {
            file_path: image.file_path().to_path_buf(),
            image,
            segmentation: None,
            full_segmentation: None,
            mask,
            history: Vec::new(),
            algorithm: None,
        }
    }

    pub fn with_segmentation(mut self, segmentation: LabelArray, full_segmentation: Option<LabelArray>) -> Self {
        self.segmentation = Some(segmentation);
        self.full_segmentation = full_segmentation;
        self
    }

    pub fn with_mask(mut self, mask: Option<MaskArray>) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_history(mut self, history: Vec<HistoryElement>) -> Self {
        self.history = history;
        self
    }

    pub fn with_algorithm(mut self, algorithm: AlgorithmChoice) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    /// Image with the project mask attached
    pub fn masked_image(&self) -> Result<Image> {
        self.image.with_mask(self.mask.clone())
    }

    /// Check every array covers the image
    pub fn check_shapes(&self) -> Result<()> {
        let expected = self.image.spatial_shape();
        let arrays = [self.segmentation.as_ref(), self.full_segmentation.as_ref()];
        for array in arrays.into_iter().flatten() {
            check_shape(expected, shape3(array))?;
        }
        if let Some(mask) = &self.mask {
            check_shape(expected, shape3(mask))?;
        }
        Ok(())
    }
}

impl PartialEq for ProjectTuple {
    fn eq(&self, other: &Self) -> bool {
        self.image == other.image
            && self.segmentation == other.segmentation
            && self.full_segmentation == other.full_segmentation
            && self.mask == other.mask
            && self.history == other.history
            && self.algorithm == other.algorithm
    }
}

/// How a project archive is written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveOptions {
    pub compression: ArchiveCompression,
}

impl ArchiveOptions {
    pub fn with_compression(mut self, compression: ArchiveCompression) -> Self {
        self.compression = compression;
        self
    }
}

/// Where a project is loaded from
#[derive(Debug)]
pub enum ArchiveSource<'a> {
    /// A path (opened and closed here) or a borrowed stream (left open)
    Bytes(ByteSource<'a>),
    /// An archive the caller already opened
    Handle(&'a OpenArchive),
}

impl<'a> From<ByteSource<'a>> for ArchiveSource<'a> {
    fn from(source: ByteSource<'a>) -> Self {
        Self::Bytes(source)
    }
}

impl<'a> From<&'a OpenArchive> for ArchiveSource<'a> {
    fn from(archive: &'a OpenArchive) -> Self {
        Self::Handle(archive)
    }
}

impl From<PathBuf> for ArchiveSource<'_> {
    fn from(path: PathBuf) -> Self {
        Self::Bytes(ByteSource::Path(path))
    }
}

impl From<&Path> for ArchiveSource<'_> {
    fn from(path: &Path) -> Self {
        Self::Bytes(ByteSource::from(path))
    }
}

impl From<&str> for ArchiveSource<'_> {
    fn from(path: &str) -> Self {
        Self::Bytes(ByteSource::from(path))
    }
}

impl<'a, R: ReadSeek> From<&'a mut R> for ArchiveSource<'a> {
    fn from(stream: &'a mut R) -> Self {
        Self::Bytes(ByteSource::Stream(stream))
    }
}

/// Serialize a project into `writer`
///
/// Every member is encoded before the first byte is written, so a failing
/// save leaves `writer` untouched.
pub fn save_project<W: Write>(project: &ProjectTuple, writer: &mut W, options: &ArchiveOptions) -> Result<()> {
    let archive = build_archive(project, options)?;
    archive.finish(writer)?;
    Ok(())
}

/// Serialize a project into an in-memory archive
pub fn save_project_to_bytes(project: &ProjectTuple, options: &ArchiveOptions) -> Result<Vec<u8>> {
    build_archive(project, options)?.into_bytes()
}

/// Save to `path`, replacing it only once the archive is complete
pub fn save_project_to_path(project: &ProjectTuple, path: &Path, options: &ArchiveOptions) -> Result<()> {
    let archive = build_archive(project, options)?;
    let partial = partial_path(path);
    let written = File::create(&partial)
        .map_err(PartSegError::from)
        .and_then(|file| archive.finish(BufWriter::new(file)))
        .and_then(|mut writer| writer.flush().map_err(PartSegError::from))
        .and_then(|()| fs::rename(&partial, path).map_err(PartSegError::from));
    if written.is_err() {
        let _ = fs::remove_file(&partial);
    }
    written?;
    info!("Saved project to {}", path.display());
    Ok(())
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

fn build_archive(project: &ProjectTuple, options: &ArchiveOptions) -> Result<ArchiveWriter> {
    let segmentation = project
        .segmentation
        .as_ref()
        .ok_or(PartSegError::MissingData("segmentation"))?;
    project.check_shapes()?;

    let full = project.full_segmentation.as_ref().unwrap_or(segmentation);
    let bundle = ArrayBundle::new(segmentation.clone(), full.clone(), project.mask.clone());

    let mut archive = ArchiveWriter::new(options.compression);
    archive.add(IMAGE_MEMBER, encode_image(&project.image)?);
    archive.add(SEGMENTATION_MEMBER, bundle.to_npz_bytes()?);
    if let Some(algorithm) = &project.algorithm {
        archive.add(ALGORITHM_MEMBER, serde_json::to_vec_pretty(&encode_algorithm(algorithm))?);
    }
    if !project.history.is_empty() {
        let entries: Vec<Value> = project
            .history
            .iter()
            .enumerate()
            .map(|(index, element)| encode_history_entry(index, element))
            .collect();
        archive.add(HISTORY_MEMBER, serde_json::to_vec_pretty(&entries)?);
        for (index, element) in project.history.iter().enumerate() {
            archive.add(&history_arrays_member(index), element.array_bytes().to_vec());
        }
    }
    Ok(archive)
}

fn encode_algorithm(choice: &AlgorithmChoice) -> Value {
    let mut value = json!({
        "algorithm_name": choice.name,
        "values": encode_map(&choice.values),
    });
    if let (Some(version), Value::Object(object)) = (&choice.version, &mut value) {
        object.insert("version".to_string(), Value::String(version.to_string()));
    }
    value
}

fn encode_history_entry(index: usize, element: &HistoryElement) -> Value {
    let mut value = encode_algorithm(element.algorithm());
    if let Value::Object(object) = &mut value {
        object.insert("index".to_string(), Value::from(index));
        object.insert("mask_property".to_string(), encode_mask_property(element.mask_property()));
    }
    value
}

/// Load a project from a path, a borrowed stream or an open archive
///
/// Streams are read from their current position and left open; an open
/// archive is only borrowed.
pub fn load_project<'a>(source: impl Into<ArchiveSource<'a>>) -> Result<ProjectTuple> {
    match source.into() {
        ArchiveSource::Handle(archive) => read_project(archive, PathBuf::new()),
        ArchiveSource::Bytes(bytes) => {
            let path = bytes.path().map(Path::to_path_buf).unwrap_or_default();
            let archive = OpenArchive::open(bytes)?;
            let project = read_project(&archive, path)?;
            info!("Loaded project {}", project.file_path.display());
            Ok(project)
        }
    }
}

fn read_project(archive: &OpenArchive, file_path: PathBuf) -> Result<ProjectTuple> {
    let image = decode_image(Cursor::new(archive.require(IMAGE_MEMBER)?))
        .map_err(|e| e.into_corrupt(IMAGE_MEMBER))?
        .with_file_path(file_path.clone());

    let bundle = ArrayBundle::from_npz_bytes(archive.require(SEGMENTATION_MEMBER)?)
        .and_then(|bundle| {
            check_shape(image.spatial_shape(), bundle.shape())?;
            Ok(bundle)
        })
        .map_err(|e| e.into_corrupt(SEGMENTATION_MEMBER))?;

    let algorithm = match archive.member(ALGORITHM_MEMBER) {
        Some(bytes) => Some(
            parse_json(bytes)
                .and_then(|value| decode_algorithm(&value))
                .map_err(|e| e.into_corrupt(ALGORITHM_MEMBER))?,
        ),
        None => {
            warn!("Project has no {ALGORITHM_MEMBER}");
            None
        }
    };

    let history = match archive.member(HISTORY_MEMBER) {
        Some(bytes) => read_history(archive, bytes)?,
        None => Vec::new(),
    };

    Ok(ProjectTuple {
        file_path,
        image,
        segmentation: Some(bundle.segmentation),
        full_segmentation: Some(bundle.full_segmentation),
        mask: bundle.mask,
        history,
        algorithm,
    })
}

fn parse_json(bytes: &[u8]) -> Result<Value> {
    Ok(serde_json::from_slice(bytes)?)
}

fn decode_algorithm(value: &Value) -> Result<AlgorithmChoice> {
    let name = value
        .get("algorithm_name")
        .and_then(Value::as_str)
        .ok_or_else(|| PartSegError::Json("missing `algorithm_name`".to_string()))?;
    let values = match value.get("values") {
        Some(values) => decode_map(values.clone())?,
        None => Default::default(),
    };
    let version = value
        .get("version")
        .and_then(Value::as_str)
        .map(str::parse::<Version>)
        .transpose()?;
    Ok(AlgorithmChoice {
        name: name.to_string(),
        version,
        values,
    })
}

fn decode_mask_property_entry(value: Option<&Value>) -> Result<MaskProperty> {
    match value.cloned().map(decode_value) {
        None | Some(ParameterValue::Null) => Ok(MaskProperty::default()),
        Some(ParameterValue::MaskProperty(property)) => Ok(property),
        Some(other) => Err(PartSegError::Json(format!("invalid mask property {other}"))),
    }
}

fn read_history(archive: &OpenArchive, bytes: &[u8]) -> Result<Vec<HistoryElement>> {
    let corrupt = |e: PartSegError| e.into_corrupt(HISTORY_MEMBER);
    let entries = match parse_json(bytes).map_err(corrupt)? {
        Value::Array(entries) => entries,
        _ => return Err(corrupt(PartSegError::Json("expected a list of steps".to_string()))),
    };

    let mut history = Vec::with_capacity(entries.len());
    for (position, entry) in entries.iter().enumerate() {
        let index = match entry.get("index") {
            Some(index) => index
                .as_u64()
                .and_then(|i| usize::try_from(i).ok())
                .ok_or_else(|| corrupt(PartSegError::Json(format!("invalid index {index}"))))?,
            None => position,
        };
        let algorithm = decode_algorithm(entry).map_err(corrupt)?;
        let mask_property = decode_mask_property_entry(entry.get("mask_property")).map_err(corrupt)?;
        let member = history_arrays_member(index);
        let arrays = archive.require(&member)?;
        history.push(HistoryElement::from_parts(algorithm, mask_property, arrays.to_vec()));
    }
    verify_records(&history).map_err(|e| e.into_corrupt("history"))?;
    Ok(history)
}

/// [`load_project`] on tokio's blocking pool
#[cfg(feature = "async")]
pub async fn load_project_async(path: PathBuf) -> Result<ProjectTuple> {
    tokio::task::spawn_blocking(move || load_project(path))
        .await
        .map_err(|e| PartSegError::Background(e.to_string()))?
}

/// [`save_project_to_path`] on tokio's blocking pool
#[cfg(feature = "async")]
pub async fn save_project_async(project: ProjectTuple, path: PathBuf, options: ArchiveOptions) -> Result<()> {
    tokio::task::spawn_blocking(move || save_project_to_path(&project, &path, &options))
        .await
        .map_err(|e| PartSegError::Background(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::image::DEFAULT_SPACING;
    use crate::parameters::parameter_map;
    use ndarray::{Array3, Array4};

    fn project() -> ProjectTuple {
        let image = Image::new(Array4::from_elem((2, 4, 4, 1), 7u16), DEFAULT_SPACING).unwrap();
        let seg = Array3::from_shape_fn((2, 4, 4), |(z, _, x)| u32::from(x > 1) + z as u32);
        let choice = AlgorithmChoice::new(
            "Threshold",
            parameter_map([
                ("channel", ParameterValue::Channel(Channel::Index(0))),
                ("minimum_size", ParameterValue::Int(10)),
            ]),
        )
        .with_version(Version::new(0, 0, 1));
        let step = HistoryElement::create(choice.clone(), MaskProperty::default(), &seg, &seg, None).unwrap();
        ProjectTuple::new(image)
            .with_segmentation(seg.clone(), Some(seg))
            .with_algorithm(choice)
            .with_history(vec![step])
    }

    #[test]
    fn test_bytes_roundtrip() {
        let project = project();
        let bytes = save_project_to_bytes(&project, &ArchiveOptions::default()).unwrap();
        let loaded = load_project(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(loaded, project);
    }

    #[test]
    fn test_save_without_segmentation_fails() {
        let mut project = project();
        project.segmentation = None;
        let mut sink = Vec::new();
        let err = save_project(&project, &mut sink, &ArchiveOptions::default()).unwrap_err();
        assert!(matches!(err, PartSegError::MissingData("segmentation")));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_full_segmentation_defaults_to_segmentation() {
        let mut project = project();
        project.full_segmentation = None;
        let bytes = save_project_to_bytes(&project, &ArchiveOptions::default()).unwrap();
        let loaded = load_project(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(loaded.full_segmentation, project.segmentation);
    }

    #[test]
    fn test_mask_shape_checked_before_writing() {
        let project = project().with_mask(Some(Array3::zeros((1, 1, 1))));
        assert!(matches!(
            save_project_to_bytes(&project, &ArchiveOptions::default()),
            Err(PartSegError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_algorithm_json_layout() {
        let encoded = encode_algorithm(project().algorithm.as_ref().unwrap());
        assert_eq!(encoded["algorithm_name"], "Threshold");
        assert_eq!(encoded["version"], "0.0.1");
        assert_eq!(encoded["values"]["channel"]["__class__"], "Channel");
    }

    #[test]
    fn test_partial_path_is_sibling() {
        assert_eq!(
            partial_path(Path::new("/tmp/a/project.tgz")),
            PathBuf::from("/tmp/a/project.tgz.partial")
        );
    }
}
