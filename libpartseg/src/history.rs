//! Undo/redo log of segmentation steps.
//!
//! The log is a flat list of records plus a cursor. Records before the cursor
//! are "done", records at and after it are "undone" and still redoable until a
//! new step is pushed.

use std::sync::Arc;

use log::debug;

use crate::arrays::{ArrayBundle, LabelArray, MaskArray};
use crate::error::Result;
use crate::mask::MaskProperty;
use crate::parameters::AlgorithmChoice;

/// Snapshot of one segmentation step
///
/// Holds the algorithm with its parameters, the mask property used to derive
/// the next mask, and the arrays as an encoded npz bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryElement {
    algorithm: AlgorithmChoice,
    mask_property: MaskProperty,
    arrays: Arc<[u8]>,
}

impl HistoryElement {
    /// Snapshot the arrays of a step
    pub fn create(
        algorithm: AlgorithmChoice,
        mask_property: MaskProperty,
        segmentation: &LabelArray,
        full_segmentation: &LabelArray,
        mask: Option<&MaskArray>,
    ) -> Result<Self> {
        let bundle = ArrayBundle::new(segmentation.clone(), full_segmentation.clone(), mask.cloned());
        bundle.check_shapes()?;
        Ok(Self::from_parts(algorithm, mask_property, bundle.to_npz_bytes()?))
    }

    /// Wrap already encoded npz bytes, e.g. read from an archive
    pub fn from_parts(algorithm: AlgorithmChoice, mask_property: MaskProperty, arrays: impl Into<Arc<[u8]>>) -> Self {
        Self {
            algorithm,
            mask_property,
            arrays: arrays.into(),
        }
    }

    pub fn algorithm(&self) -> &AlgorithmChoice {
        &self.algorithm
    }

    pub fn mask_property(&self) -> &MaskProperty {
        &self.mask_property
    }

    /// Encoded npz bundle
    pub fn array_bytes(&self) -> &[u8] {
        &self.arrays
    }

    /// Decode the stored arrays
    pub fn arrays(&self) -> Result<ArrayBundle> {
        ArrayBundle::from_npz_bytes(&self.arrays)
    }
}

/// Result of an undo or redo request
#[derive(Debug, PartialEq)]
pub enum Step<'a> {
    /// Nothing to move over; the log is unchanged
    AtBoundary,
    /// Restore the state recorded by this element
    Restore(&'a HistoryElement),
    /// Every step was undone; restore the state before the first one
    Pristine,
}

/// Linear undo/redo log
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryLog {
    records: Vec<HistoryElement>,
    cursor: usize,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log with every record done
    pub fn from_records(records: Vec<HistoryElement>) -> Self {
        let cursor = records.len();
        Self { records, cursor }
    }

    /// Append a step, discarding everything undone
    pub fn push(&mut self, element: HistoryElement) {
        let discarded = self.records.len() - self.cursor;
        if discarded > 0 {
            debug!("Discarding {discarded} undone history steps");
        }
        self.records.truncate(self.cursor);
        self.records.push(element);
        self.cursor = self.records.len();
    }

    /// Move the cursor back one step
    pub fn undo(&mut self) -> Step<'_> {
        if self.cursor == 0 {
            return Step::AtBoundary;
        }
        self.cursor -= 1;
        match self.cursor.checked_sub(1) {
            Some(index) => Step::Restore(&self.records[index]),
            None => Step::Pristine,
        }
    }

    /// Move the cursor forward one step
    pub fn redo(&mut self) -> Step<'_> {
        if self.cursor == self.records.len() {
            return Step::AtBoundary;
        }
        self.cursor += 1;
        Step::Restore(&self.records[self.cursor - 1])
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor < self.records.len()
    }

    /// Steps currently applied, oldest first
    pub fn done(&self) -> &[HistoryElement] {
        &self.records[..self.cursor]
    }

    /// Undone steps still available for redo
    pub fn undone(&self) -> &[HistoryElement] {
        &self.records[self.cursor..]
    }

    /// Most recent applied step
    pub fn current(&self) -> Option<&HistoryElement> {
        self.done().last()
    }

    pub fn get(&self, index: usize) -> Option<&HistoryElement> {
        self.records.get(index)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Drop everything; used when a different image is loaded
    pub fn truncate_on_new_image(&mut self) {
        self.records.clear();
        self.cursor = 0;
    }

    /// Replace the log with `records`, all marked done
    pub fn replace(&mut self, records: Vec<HistoryElement>) {
        *self = Self::from_records(records);
    }

    /// Decode every stored bundle, failing on the first broken one
    pub fn verify(&self) -> Result<()> {
        verify_records(&self.records)
    }
}

#[cfg(feature = "performance")]
pub(crate) fn verify_records(records: &[HistoryElement]) -> Result<()> {
    use rayon::prelude::*;
    records.par_iter().try_for_each(|record| record.arrays().map(drop))
}

#[cfg(not(feature = "performance"))]
pub(crate) fn verify_records(records: &[HistoryElement]) -> Result<()> {
    records.iter().try_for_each(|record| record.arrays().map(drop))
}
