#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

//! Built-in PartSeg segmentation algorithms
//!
//! Two registries are involved: the threshold methods (`Manual`, `Mean`),
//! which turn one channel into a binary image, and the ROI algorithms, whose
//! `threshold` parameter selects one of those methods.

pub mod components;

use std::sync::Arc;

use log::debug;
use ndarray::{Axis, Zip};
use partseg::{
    AlgorithmDescriptor, AlgorithmOutput, AlgorithmRegistry, FieldSchema, Image, ParameterMap, ParameterSet,
    PartSegError, Result, Version,
};

pub use components::{component_sizes, filter_small, label_components};

/// Name of the built-in ROI algorithm
pub const THRESHOLD_ALGORITHM: &str = "Threshold";
/// Threshold method with a fixed level
pub const MANUAL_METHOD: &str = "Manual";
/// Threshold method using the mean intensity
pub const MEAN_METHOD: &str = "Mean";

/// Registry of the threshold methods
pub fn threshold_methods() -> Result<Arc<AlgorithmRegistry>> {
    let methods = Arc::new(AlgorithmRegistry::new());
    methods.register(
        AlgorithmDescriptor::new(MANUAL_METHOD, Arc::new(manual_threshold))
            .with_help("Foreground is every voxel at or above a fixed level")
            .with_field(FieldSchema::int("threshold", "Threshold", 8000, 0..=65535)),
        &["Fixed"],
    )?;
    methods.register(
        AlgorithmDescriptor::new(MEAN_METHOD, Arc::new(mean_threshold))
            .with_help("Foreground is every voxel at or above the mean intensity inside the mask"),
        &[],
    )?;
    Ok(methods)
}

/// Register the built-in ROI algorithms into `registry`
///
/// Fails with `DuplicateName` when called twice on the same registry.
pub fn register_builtin(registry: &AlgorithmRegistry) -> Result<()> {
    let methods = threshold_methods()?;
    let entry_methods = Arc::clone(&methods);
    let entry = Arc::new(move |image: &Image, parameters: &ParameterSet| {
        threshold_roi(&entry_methods, image, parameters)
    });
    registry.register(
        AlgorithmDescriptor::new(THRESHOLD_ALGORITHM, entry)
            .with_help("Threshold one channel and keep connected components above a minimum size")
            .with_field(FieldSchema::channel("channel", "Channel"))
            .with_field(FieldSchema::algorithm("threshold", "Threshold", methods, MANUAL_METHOD))
            .with_field(
                FieldSchema::int("minimum_size", "Minimum size (pix)", 8000, 0..=1_000_000_000)
                    .with_help("Smaller components are removed"),
            )
            .with_migration(Version::new(0, 0, 1), rename_size),
        &["Lower threshold"],
    )?;
    debug!("Registered built-in algorithms: {:?}", registry.list());
    Ok(())
}

/// New registry holding the built-in algorithms
pub fn builtin_registry() -> Result<Arc<AlgorithmRegistry>> {
    let registry = Arc::new(AlgorithmRegistry::new());
    register_builtin(&registry)?;
    Ok(registry)
}

fn rename_size(mut values: ParameterMap) -> ParameterMap {
    if let Some(size) = values.remove("size") {
        values.insert("minimum_size".to_string(), size);
    }
    values
}

/// Binary image of the voxels accepted by `above`, restricted to the image mask
fn binarize(image: &Image, above: impl Fn(u16) -> bool) -> Result<AlgorithmOutput> {
    let channel = image
        .channel(0)
        .ok_or_else(|| PartSegError::Algorithm("image has no channel".to_string()))?;
    let mut binary = channel.mapv(|v| u32::from(above(v)));
    if let Some(mask) = image.mask() {
        Zip::from(&mut binary).and(mask).for_each(|b, &m| {
            if m == 0 {
                *b = 0;
            }
        });
    }
    Ok(AlgorithmOutput::new(binary))
}

fn manual_threshold(image: &Image, parameters: &ParameterSet) -> Result<AlgorithmOutput> {
    let level = parameters.int("threshold")?;
    binarize(image, |v| i64::from(v) >= level)
}

fn mean_threshold(image: &Image, _: &ParameterSet) -> Result<AlgorithmOutput> {
    let channel = image
        .channel(0)
        .ok_or_else(|| PartSegError::Algorithm("image has no channel".to_string()))?;
    let (sum, count) = match image.mask() {
        Some(mask) => channel
            .iter()
            .zip(mask.iter())
            .filter(|(_, m)| **m != 0)
            .fold((0u64, 0u64), |(s, c), (v, _)| (s + u64::from(*v), c + 1)),
        None => channel
            .iter()
            .fold((0u64, 0u64), |(s, c), v| (s + u64::from(*v), c + 1)),
    };
    if count == 0 {
        return Ok(AlgorithmOutput::new(ndarray::Array3::zeros(channel.dim())));
    }
    #[allow(clippy::cast_precision_loss)]
    let mean = sum as f64 / count as f64;
    debug!("Mean threshold level {mean:.2}");
    binarize(image, |v| f64::from(v) >= mean)
}

/// Copy of `image` reduced to channel `index`, keeping mask and spacing
fn single_channel(image: &Image, index: usize) -> Result<Image> {
    let data = image
        .channel(index)
        .ok_or_else(|| PartSegError::validation("channel", format!("channel {index} does not exist")))?
        .to_owned()
        .insert_axis(Axis(3));
    Image::new(data, image.spacing())?.with_mask(image.mask().cloned())
}

fn threshold_roi(methods: &AlgorithmRegistry, image: &Image, parameters: &ParameterSet) -> Result<AlgorithmOutput> {
    let channel = parameters.channel("channel")?;
    let index = image
        .channel_index(channel)
        .ok_or_else(|| PartSegError::validation("channel", format!("channel {channel} does not exist")))?;
    let single = single_channel(image, index)?;

    let choice = parameters.choice("threshold")?;
    let method = methods.resolve(&choice.name)?;
    let method_parameters = method.build(&choice.values)?;
    let binary = method.run(&single, &method_parameters)?.segmentation;

    let minimum_size = usize::try_from(parameters.int("minimum_size")?).unwrap_or(0);
    let components = label_components(&binary);
    let segmentation = filter_small(&components, minimum_size);
    Ok(AlgorithmOutput::new(segmentation).with_full_segmentation(components))
}
