#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

//! PartSeg - project persistence for microscopy segmentation
//!
//! This library holds the state behind a segmentation session: the image,
//! its segmentation and mask, an undo/redo history of algorithm steps, and
//! the registry of algorithms with their validated parameters. Projects are
//! saved to and loaded from a single tar archive that round-trips every piece
//! of that state.

pub mod algorithm;
pub mod archive;
pub mod arrays;
pub mod channel;
pub mod config;
pub mod container;
pub mod encoding;
pub mod error;
pub mod history;
pub mod image;
pub mod mask;
pub mod parameters;
pub mod settings;
pub mod source;
pub mod tiff_image;

pub use algorithm::{Algorithm, AlgorithmDescriptor, AlgorithmOutput, AlgorithmRegistry};
pub use archive::{
    load_project, save_project, save_project_to_bytes, save_project_to_path, ArchiveOptions, ArchiveSource,
    ProjectTuple,
};
#[cfg(feature = "async")]
pub use archive::{load_project_async, save_project_async};
pub use arrays::{ArrayBundle, LabelArray, MaskArray};
pub use channel::Channel;
pub use config::{SegmentationProfile, SettingsStore};
pub use container::{ArchiveCompression, OpenArchive};
pub use error::{PartSegError, Result};
pub use history::{HistoryElement, HistoryLog, Step};
pub use image::{Image, ImageReader};
pub use mask::{MaskProperty, RadiusType};
pub use parameters::{
    build, build_versioned, migrate, parameter_map, AlgorithmChoice, FieldKind, FieldSchema, ParameterMap,
    ParameterSet, ParameterValue, Version,
};
pub use settings::{ChangeEvent, Notifier, ObserverId, Settings};
pub use source::ByteSource;
pub use tiff_image::TiffImageReader;

/// Conventional file extension of project archives
pub const PROJECT_EXTENSION: &str = "tgz";
