//! In-memory microscopy image.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{Array4, ArrayView3, Axis};

use crate::arrays::{check_shape, shape3, MaskArray};
use crate::channel::Channel;
use crate::error::{PartSegError, Result};
use crate::source::ByteSource;

/// Physical voxel size (z, y, x) in metres used when a file carries none
pub const DEFAULT_SPACING: [f64; 3] = [1e-6, 1e-6, 1e-6];

/// Multi-channel, multi-layer voxel image
///
/// Voxel data is laid out as (layer, y, x, channel). The image is immutable
/// once built: clones share storage and every "modification" returns a new
/// image.
#[derive(Debug, Clone)]
pub struct Image {
    data: Arc<Array4<u16>>,
    spacing: [f64; 3],
    mask: Option<Arc<MaskArray>>,
    channel_names: Vec<String>,
    file_path: PathBuf,
}

impl Image {
    /// Create an image from voxel data and spacing
    pub fn new(data: Array4<u16>, spacing: [f64; 3]) -> Result<Self> {
        let (layers, height, width, channels) = data.dim();
        if layers == 0 || height == 0 || width == 0 || channels == 0 {
            return Err(PartSegError::Image(format!(
                "image dimensions must be non-zero, got {:?}",
                data.dim()
            )));
        }
        if spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(PartSegError::Image(format!(
                "spacing must be positive, got {spacing:?}"
            )));
        }
        Ok(Self {
            data: Arc::new(data),
            spacing,
            mask: None,
            channel_names: default_channel_names(channels),
            file_path: PathBuf::new(),
        })
    }

    /// Voxel data as (layer, y, x, channel)
    pub fn data(&self) -> &Array4<u16> {
        &self.data
    }

    /// One channel as (layer, y, x)
    pub fn channel(&self, index: usize) -> Option<ArrayView3<'_, u16>> {
        (index < self.channels()).then(|| self.data.index_axis(Axis(3), index))
    }

    pub fn channels(&self) -> usize {
        self.data.dim().3
    }

    pub fn layers(&self) -> usize {
        self.data.dim().0
    }

    /// (layer, y, x)
    pub fn spatial_shape(&self) -> [usize; 3] {
        let (z, y, x, _) = self.data.dim();
        [z, y, x]
    }

    /// Physical voxel size (z, y, x) in metres
    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    pub fn mask(&self) -> Option<&MaskArray> {
        self.mask.as_deref()
    }

    pub fn channel_names(&self) -> &[String] {
        &self.channel_names
    }

    /// Index of a channel reference, if it exists in this image
    pub fn channel_index(&self, channel: &Channel) -> Option<usize> {
        channel.resolve(&self.channel_names)
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Copy of the image with `mask` attached (or removed)
    ///
    /// Fails with `ShapeMismatch` if the mask does not cover the image's
    /// spatial shape; `self` is left untouched in that case.
    pub fn with_mask(&self, mask: Option<MaskArray>) -> Result<Self> {
        if let Some(mask) = &mask {
            check_shape(self.spatial_shape(), shape3(mask))?;
        }
        Ok(Self {
            mask: mask.map(Arc::new),
            ..self.clone()
        })
    }

    pub fn with_file_path(&self, path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: path.into(),
            ..self.clone()
        }
    }

    pub fn with_channel_names(&self, names: Vec<String>) -> Result<Self> {
        if names.len() != self.channels() {
            return Err(PartSegError::Image(format!(
                "expected {} channel names, got {}",
                self.channels(),
                names.len()
            )));
        }
        Ok(Self {
            channel_names: names,
            ..self.clone()
        })
    }

    /// CRC32 of shape, spacing and voxel data
    ///
    /// Used as the image identity: a reload of the same pixels keeps history,
    /// a different image does not. Mask and path are not part of it.
    pub fn fingerprint(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for dim in self.data.shape() {
            hasher.update(&(*dim as u64).to_le_bytes());
        }
        for spacing in self.spacing {
            hasher.update(&spacing.to_bits().to_le_bytes());
        }
        for layer in layer_hashers(&self.data) {
            hasher.combine(&layer);
        }
        hasher.finalize()
    }
}

impl PartialEq for Image {
    fn eq(&self, other: &Self) -> bool {
        self.spacing == other.spacing
            && self.channel_names == other.channel_names
            && self.mask == other.mask
            && self.data == other.data
    }
}

fn default_channel_names(channels: usize) -> Vec<String> {
    (1..=channels).map(|c| c.to_string()).collect()
}

fn hash_layer(data: &Array4<u16>, layer: usize) -> crc32fast::Hasher {
    let mut hasher = crc32fast::Hasher::new();
    let bytes: Vec<u8> = data
        .index_axis(Axis(0), layer)
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    hasher.update(&bytes);
    hasher
}

#[cfg(feature = "performance")]
fn layer_hashers(data: &Array4<u16>) -> Vec<crc32fast::Hasher> {
    use rayon::prelude::*;
    (0..data.dim().0)
        .into_par_iter()
        .map(|layer| hash_layer(data, layer))
        .collect()
}

#[cfg(not(feature = "performance"))]
fn layer_hashers(data: &Array4<u16>) -> Vec<crc32fast::Hasher> {
    (0..data.dim().0).map(|layer| hash_layer(data, layer)).collect()
}

/// Source of image pixels
///
/// Implementations decode a file format into an [`Image`]. The optional second
/// source is a mask file whose spatial shape must match the image.
pub trait ImageReader {
    /// Decode an image without a mask
    fn read_image(&self, source: ByteSource<'_>) -> Result<Image>;

    /// Decode an image and attach the mask read from `mask`
    fn read(&self, source: ByteSource<'_>, mask: Option<ByteSource<'_>>) -> Result<Image> {
        let path = source.path().map(Path::to_path_buf);
        let mut image = self.read_image(source)?;
        if let Some(path) = path {
            image = image.with_file_path(path);
        }
        match mask {
            None => Ok(image),
            Some(mask_source) => {
                let mask_image = self.read_image(mask_source)?;
                let mask = mask_from_image(&mask_image)?;
                image.with_mask(Some(mask))
            }
        }
    }
}

/// Collapse a single-channel image into a mask array
pub fn mask_from_image(image: &Image) -> Result<MaskArray> {
    if image.channels() != 1 {
        return Err(PartSegError::Image(format!(
            "mask must have a single channel, found {}",
            image.channels()
        )));
    }
    let data = image.data().index_axis(Axis(3), 0);
    if let Some(value) = data.iter().find(|v| **v > u16::from(u8::MAX)) {
        return Err(PartSegError::Image(format!(
            "mask value {value} does not fit in 8 bits"
        )));
    }
    #[allow(clippy::cast_possible_truncation)]
    Ok(data.mapv(|v| v as u8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn sample_image() -> Image {
        let data = Array4::from_shape_fn((2, 3, 4, 2), |(z, y, x, c)| (z * 100 + y * 10 + x + c * 1000) as u16);
        Image::new(data, [2e-6, 1e-7, 1e-7]).unwrap()
    }

    #[test]
    fn test_dimensions() {
        let image = sample_image();
        assert_eq!(image.channels(), 2);
        assert_eq!(image.layers(), 2);
        assert_eq!(image.spatial_shape(), [2, 3, 4]);
        assert_eq!(image.channel(1).unwrap()[[1, 2, 3]], 1123);
        assert!(image.channel(2).is_none());
    }

    #[test]
    fn test_with_mask_checks_shape() {
        let image = sample_image();
        assert!(image.with_mask(Some(Array3::zeros((2, 3, 4)))).is_ok());
        let err = image.with_mask(Some(Array3::zeros((1, 3, 4)))).unwrap_err();
        assert!(matches!(err, PartSegError::ShapeMismatch { .. }));
        assert!(image.mask().is_none());
    }

    #[test]
    fn test_fingerprint_ignores_mask_and_path() {
        let image = sample_image();
        let masked = image
            .with_mask(Some(Array3::from_elem((2, 3, 4), 1)))
            .unwrap()
            .with_file_path("a.tif");
        assert_eq!(image.fingerprint(), masked.fingerprint());

        let mut data = image.data().clone();
        data[[0, 0, 0, 0]] += 1;
        let other = Image::new(data, image.spacing()).unwrap();
        assert_ne!(image.fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_zero_dimension_rejected() {
        assert!(Image::new(Array4::zeros((0, 2, 2, 1)), DEFAULT_SPACING).is_err());
        assert!(Image::new(Array4::zeros((1, 2, 2, 1)), [0.0, 1.0, 1.0]).is_err());
    }
}
