//! Connected component labelling.

use std::collections::VecDeque;

use ndarray::Array3;
use partseg::LabelArray;

/// Label 6-connected foreground regions of `binary`
///
/// Labels are ordered by component size, largest first; equal sizes keep
/// scan order.
pub fn label_components(binary: &LabelArray) -> LabelArray {
    let shape = binary.dim();
    let mut provisional = Array3::<u32>::zeros(shape);
    let mut sizes: Vec<usize> = Vec::new();
    let mut queue = VecDeque::new();

    for start in ndarray::indices(shape) {
        if binary[start] == 0 || provisional[start] != 0 {
            continue;
        }
        let label = u32::try_from(sizes.len() + 1).unwrap_or(u32::MAX);
        let mut size = 0;
        provisional[start] = label;
        queue.push_back(start);
        while let Some(index) = queue.pop_front() {
            size += 1;
            for next in neighbours(index, shape) {
                if binary[next] != 0 && provisional[next] == 0 {
                    provisional[next] = label;
                    queue.push_back(next);
                }
            }
        }
        sizes.push(size);
    }

    let mut order: Vec<usize> = (0..sizes.len()).collect();
    order.sort_by(|a, b| sizes[*b].cmp(&sizes[*a]).then(a.cmp(b)));
    let mut remap = vec![0u32; sizes.len() + 1];
    for (rank, old) in order.into_iter().enumerate() {
        remap[old + 1] = u32::try_from(rank + 1).unwrap_or(u32::MAX);
    }
    provisional.mapv_inplace(|v| remap[v as usize]);
    provisional
}

/// Voxel count per label; index 0 is background
pub fn component_sizes(labels: &LabelArray) -> Vec<usize> {
    let max = labels.iter().copied().max().unwrap_or(0) as usize;
    let mut sizes = vec![0; max + 1];
    for label in labels {
        sizes[*label as usize] += 1;
    }
    sizes
}

/// Drop components smaller than `minimum_size` from a size-ordered labelling
pub fn filter_small(labels: &LabelArray, minimum_size: usize) -> LabelArray {
    let sizes = component_sizes(labels);
    let kept = sizes
        .iter()
        .skip(1)
        .take_while(|size| **size >= minimum_size)
        .count();
    let kept = u32::try_from(kept).unwrap_or(u32::MAX);
    labels.mapv(|v| if v <= kept { v } else { 0 })
}

fn neighbours(
    (z, y, x): (usize, usize, usize),
    (depth, height, width): (usize, usize, usize),
) -> impl Iterator<Item = (usize, usize, usize)> {
    let candidates = [
        z.checked_sub(1).map(|z| (z, y, x)),
        (z + 1 < depth).then_some((z + 1, y, x)),
        y.checked_sub(1).map(|y| (z, y, x)),
        (y + 1 < height).then_some((z, y + 1, x)),
        x.checked_sub(1).map(|x| (z, y, x)),
        (x + 1 < width).then_some((z, y, x + 1)),
    ];
    candidates.into_iter().flatten()
}
