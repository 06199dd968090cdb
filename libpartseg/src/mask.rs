//! Deriving the next mask from a segmentation.

use std::collections::VecDeque;

use ndarray::{Array3, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::arrays::{check_shape, shape3, LabelArray, MaskArray};
use crate::error::Result;

/// Neighbourhood used by a morphological operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RadiusType {
    #[default]
    None,
    /// Layer by layer
    R2D,
    /// Across layers
    R3D,
}

/// How a segmentation becomes the mask of the next step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskProperty {
    pub dilate: RadiusType,
    pub dilate_radius: i32,
    pub fill_holes: RadiusType,
    /// Largest hole (in voxels) that is filled; 0 or less fills every hole
    pub max_holes_size: i32,
    /// Keep component labels instead of binarising
    pub save_components: bool,
    pub clip_to_mask: bool,
    pub reversed_mask: bool,
}

impl Default for MaskProperty {
    fn default() -> Self {
        Self {
            dilate: RadiusType::None,
            dilate_radius: 0,
            fill_holes: RadiusType::None,
            max_holes_size: 0,
            save_components: false,
            clip_to_mask: false,
            reversed_mask: false,
        }
    }
}

impl MaskProperty {
    /// Property that turns a segmentation into a binary mask unchanged
    pub fn simple() -> Self {
        Self::default()
    }

    /// Compute a mask from `segmentation`
    ///
    /// Order: labels (or binary), hole filling, dilation, clipping to the
    /// previous mask, reversal.
    pub fn derive_mask(
        &self,
        segmentation: &LabelArray,
        previous_mask: Option<&MaskArray>,
    ) -> Result<MaskArray> {
        if let Some(previous) = previous_mask {
            check_shape(shape3(segmentation), shape3(previous))?;
        }

        let mut mask: MaskArray = if self.save_components {
            #[allow(clippy::cast_possible_truncation)]
            segmentation.mapv(|v| v.min(u32::from(u8::MAX)) as u8)
        } else {
            segmentation.mapv(|v| u8::from(v > 0))
        };

        if self.fill_holes != RadiusType::None {
            let max_size = usize::try_from(self.max_holes_size).unwrap_or(0);
            fill_holes(&mut mask, self.fill_holes, max_size);
        }

        if self.dilate != RadiusType::None && self.dilate_radius > 0 {
            for _ in 0..self.dilate_radius {
                mask = dilate_once(&mask, self.dilate);
            }
        }

        if self.clip_to_mask {
            if let Some(previous) = previous_mask {
                Zip::from(&mut mask).and(previous).for_each(|m, &p| {
                    if p == 0 {
                        *m = 0;
                    }
                });
            }
        }

        if self.reversed_mask {
            mask.mapv_inplace(|v| u8::from(v == 0));
        }
        Ok(mask)
    }
}

fn neighbours(
    (z, y, x): (usize, usize, usize),
    shape: (usize, usize, usize),
    radius: RadiusType,
) -> impl Iterator<Item = (usize, usize, usize)> {
    let mut result = Vec::with_capacity(6);
    if radius == RadiusType::R3D {
        if z > 0 {
            result.push((z - 1, y, x));
        }
        if z + 1 < shape.0 {
            result.push((z + 1, y, x));
        }
    }
    if y > 0 {
        result.push((z, y - 1, x));
    }
    if y + 1 < shape.1 {
        result.push((z, y + 1, x));
    }
    if x > 0 {
        result.push((z, y, x - 1));
    }
    if x + 1 < shape.2 {
        result.push((z, y, x + 1));
    }
    result.into_iter()
}

/// Grow every object by one voxel into background, keeping its label
fn dilate_once(mask: &MaskArray, radius: RadiusType) -> MaskArray {
    let shape = mask.dim();
    let mut out = mask.clone();
    for ((z, y, x), value) in out.indexed_iter_mut() {
        if *value != 0 {
            continue;
        }
        if let Some(label) = neighbours((z, y, x), shape, radius)
            .map(|idx| mask[idx])
            .find(|v| *v != 0)
        {
            *value = label;
        }
    }
    out
}

/// Fill background regions not connected to the border
fn fill_holes(mask: &mut MaskArray, radius: RadiusType, max_size: usize) {
    match radius {
        RadiusType::None => {}
        RadiusType::R3D => fill_holes_3d(mask, radius, max_size),
        RadiusType::R2D => {
            for mut layer in mask.axis_iter_mut(Axis(0)) {
                let mut single = layer.to_owned().insert_axis(Axis(0));
                fill_holes_3d(&mut single, RadiusType::R2D, max_size);
                layer.assign(&single.index_axis(Axis(0), 0));
            }
        }
    }
}

fn fill_holes_3d(mask: &mut MaskArray, radius: RadiusType, max_size: usize) {
    let shape = mask.dim();
    let mut visited = Array3::<bool>::from_elem(shape, false);

    for start in ndarray::indices(shape) {
        let start = (start.0, start.1, start.2);
        if mask[start] != 0 || visited[start] {
            continue;
        }
        // flood one background component
        let mut component = Vec::new();
        let mut touches_border = false;
        let mut queue = VecDeque::from([start]);
        visited[start] = true;
        while let Some(idx) = queue.pop_front() {
            component.push(idx);
            touches_border |= on_border(idx, shape, radius);
            for next in neighbours(idx, shape, radius) {
                if mask[next] == 0 && !visited[next] {
                    visited[next] = true;
                    queue.push_back(next);
                }
            }
        }
        if touches_border || (max_size > 0 && component.len() > max_size) {
            continue;
        }
        let fill = component
            .iter()
            .flat_map(|idx| neighbours(*idx, shape, radius))
            .map(|idx| mask[idx])
            .find(|v| *v != 0)
            .unwrap_or(1);
        for idx in component {
            mask[idx] = fill;
        }
    }
}

fn on_border((z, y, x): (usize, usize, usize), shape: (usize, usize, usize), radius: RadiusType) -> bool {
    let z_border = radius == RadiusType::R3D && (z == 0 || z + 1 == shape.0);
    z_border || y == 0 || x == 0 || y + 1 == shape.1 || x + 1 == shape.2
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn ring() -> LabelArray {
        // 1 layer, 5x5 square ring of label 2 around a single background voxel
        let mut seg = Array3::<u32>::zeros((1, 5, 5));
        for y in 1..4 {
            for x in 1..4 {
                seg[[0, y, x]] = 2;
            }
        }
        seg[[0, 2, 2]] = 0;
        seg
    }

    #[test]
    fn test_binarise() {
        let mask = MaskProperty::simple().derive_mask(&ring(), None).unwrap();
        assert_eq!(mask[[0, 1, 1]], 1);
        assert_eq!(mask[[0, 2, 2]], 0);
        assert_eq!(mask[[0, 0, 0]], 0);
    }

    #[test]
    fn test_fill_holes_and_components() {
        let property = MaskProperty {
            fill_holes: RadiusType::R2D,
            save_components: true,
            ..MaskProperty::default()
        };
        let mask = property.derive_mask(&ring(), None).unwrap();
        assert_eq!(mask[[0, 2, 2]], 2);
        assert_eq!(mask[[0, 0, 0]], 0);
    }

    #[test]
    fn test_hole_larger_than_limit_kept() {
        let property = MaskProperty {
            fill_holes: RadiusType::R2D,
            max_holes_size: 1,
            ..MaskProperty::default()
        };
        let mut seg = Array3::<u32>::from_elem((1, 6, 6), 1);
        seg[[0, 2, 2]] = 0;
        seg[[0, 2, 3]] = 0;
        let mask = property.derive_mask(&seg, None).unwrap();
        assert_eq!(mask[[0, 2, 2]], 0);
    }

    #[test]
    fn test_dilate_clip_and_reverse() {
        let mut seg = Array3::<u32>::zeros((1, 3, 3));
        seg[[0, 1, 1]] = 1;
        let mut previous = Array3::<u8>::from_elem((1, 3, 3), 1);
        previous[[0, 0, 1]] = 0;

        let property = MaskProperty {
            dilate: RadiusType::R2D,
            dilate_radius: 1,
            clip_to_mask: true,
            ..MaskProperty::default()
        };
        let mask = property.derive_mask(&seg, Some(&previous)).unwrap();
        assert_eq!(mask[[0, 1, 0]], 1);
        assert_eq!(mask[[0, 0, 1]], 0);
        assert_eq!(mask[[0, 0, 0]], 0);

        let reversed = MaskProperty {
            reversed_mask: true,
            ..property
        }
        .derive_mask(&seg, Some(&previous))
        .unwrap();
        assert_eq!(reversed[[0, 0, 0]], 1);
        assert_eq!(reversed[[0, 1, 1]], 0);
    }

    #[test]
    fn test_shape_mismatch() {
        let previous = Array3::<u8>::zeros((2, 5, 5));
        assert!(MaskProperty::simple().derive_mask(&ring(), Some(&previous)).is_err());
    }
}
