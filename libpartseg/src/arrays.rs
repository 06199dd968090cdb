//! Segmentation arrays and their npz bundle encoding.
//!
//! Bundles use numpy's `savez_compressed` layout: a deflate-compressed zip with
//! one `<name>.npy` member per array, so projects stay readable from numpy.

use std::io::Cursor;

use ndarray::{Array3, Ix3, OwnedRepr};
use ndarray_npy::{NpzReader, NpzWriter};

use crate::error::{PartSegError, Result};

/// Labelled segmentation: 0 is background, every other value is an object id
pub type LabelArray = Array3<u32>;

/// Mask over the spatial axes (layer, y, x); 0 means outside
pub type MaskArray = Array3<u8>;

/// Bundle key of the current segmentation
pub const SEGMENTATION_KEY: &str = "segmentation";
/// Bundle key of the full (pre-filter) segmentation
pub const FULL_SEGMENTATION_KEY: &str = "full_segmentation";
/// Bundle key of the optional mask
pub const MASK_KEY: &str = "mask";

/// Arrays produced or consumed by one segmentation step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayBundle {
    pub segmentation: LabelArray,
    pub full_segmentation: LabelArray,
    pub mask: Option<MaskArray>,
}

impl ArrayBundle {
    pub fn new(segmentation: LabelArray, full_segmentation: LabelArray, mask: Option<MaskArray>) -> Self {
        Self {
            segmentation,
            full_segmentation,
            mask,
        }
    }

    /// Serialize as a compressed npz archive
    pub fn to_npz_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = NpzWriter::new_compressed(Cursor::new(Vec::new()));
        writer.add_array(npy_name(SEGMENTATION_KEY), &self.segmentation)?;
        writer.add_array(npy_name(FULL_SEGMENTATION_KEY), &self.full_segmentation)?;
        if let Some(mask) = &self.mask {
            writer.add_array(npy_name(MASK_KEY), mask)?;
        }
        Ok(writer.finish()?.into_inner())
    }

    /// Decode an npz archive; the `mask` member is optional
    pub fn from_npz_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = NpzReader::new(Cursor::new(data))?;
        let names = reader.names()?;

        let segmentation = read_labels(&mut reader, &names, SEGMENTATION_KEY)?
            .ok_or_else(|| PartSegError::Npz(format!("missing `{SEGMENTATION_KEY}` array")))?;
        let full_segmentation = read_labels(&mut reader, &names, FULL_SEGMENTATION_KEY)?
            .ok_or_else(|| PartSegError::Npz(format!("missing `{FULL_SEGMENTATION_KEY}` array")))?;
        let mask = match member_name(&names, MASK_KEY) {
            Some(name) => Some(reader.by_name::<OwnedRepr<u8>, Ix3>(name)?),
            None => None,
        };

        let bundle = Self::new(segmentation, full_segmentation, mask);
        bundle.check_shapes()?;
        Ok(bundle)
    }

    /// Spatial shape shared by every array of the bundle
    pub fn shape(&self) -> [usize; 3] {
        shape3(&self.segmentation)
    }

    /// All arrays of a bundle must cover the same voxels
    pub fn check_shapes(&self) -> Result<()> {
        let expected = self.shape();
        check_shape(expected, shape3(&self.full_segmentation))?;
        if let Some(mask) = &self.mask {
            check_shape(expected, shape3(mask))?;
        }
        Ok(())
    }
}

/// Shape of a 3D array as a fixed-size array
pub fn shape3<T>(array: &Array3<T>) -> [usize; 3] {
    let (z, y, x) = array.dim();
    [z, y, x]
}

/// Fail with `ShapeMismatch` unless both shapes are equal
pub fn check_shape(expected: [usize; 3], found: [usize; 3]) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(PartSegError::ShapeMismatch {
            expected: expected.to_vec(),
            found: found.to_vec(),
        })
    }
}

fn npy_name(key: &str) -> String {
    format!("{key}.npy")
}

/// numpy writes `<key>.npy`; bare keys are accepted as well
fn member_name<'n>(names: &'n [String], key: &str) -> Option<&'n str> {
    let with_suffix = npy_name(key);
    names
        .iter()
        .find(|name| **name == with_suffix)
        .or_else(|| names.iter().find(|name| *name == key))
        .map(String::as_str)
}

macro_rules! try_widen {
    ($reader:expr, $name:expr, $($ty:ty),+) => {
        $(
            if let Ok(array) = $reader.by_name::<OwnedRepr<$ty>, Ix3>($name) {
                let mut overflow = false;
                let widened = array.mapv(|v| {
                    u32::try_from(v).unwrap_or_else(|_| {
                        overflow = true;
                        0
                    })
                });
                if overflow {
                    return Err(PartSegError::Npz(format!(
                        "`{}` holds labels outside the u32 range",
                        $name
                    )));
                }
                return Ok(Some(widened));
            }
        )+
    };
}

/// Label arrays written by other tools may use any integer dtype
fn read_labels(
    reader: &mut NpzReader<Cursor<&[u8]>>,
    names: &[String],
    key: &str,
) -> Result<Option<LabelArray>> {
    let Some(name) = member_name(names, key) else {
        return Ok(None);
    };
    let native = reader.by_name::<OwnedRepr<u32>, Ix3>(name);
    let first_error = match native {
        Ok(array) => return Ok(Some(array)),
        Err(err) => err,
    };
    try_widen!(reader, name, u8, u16, i8, i16, i32, i64, u64);
    Err(first_error.into())
}
