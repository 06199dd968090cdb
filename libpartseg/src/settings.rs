//! Current project state and its change notifications.
//!
//! [`Settings`] owns the single live project: image, mask, segmentation,
//! history and the selected algorithm. Every mutation validates first and
//! assigns afterwards, so a failed call leaves the state untouched, and
//! observers are only called once the new state is complete.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info};

use crate::algorithm::{AlgorithmOutput, AlgorithmRegistry};
use crate::archive::ProjectTuple;
use crate::arrays::{check_shape, shape3, ArrayBundle, LabelArray, MaskArray};
use crate::config::SettingsStore;
use crate::error::{PartSegError, Result};
use crate::history::{HistoryElement, HistoryLog, Step};
use crate::image::Image;
use crate::mask::MaskProperty;
use crate::parameters::{build_versioned, AlgorithmChoice, ParameterMap, ParameterSet};

/// What part of the project changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeEvent {
    ImageChanged,
    MaskChanged,
    SegmentationChanged,
    HistoryChanged,
}

/// Handle returned by [`Notifier::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

#[derive(Default)]
struct NotifierInner {
    next_id: u64,
    observers: Vec<(ObserverId, Observer)>,
}

/// Observer list shared between the state owner and its observers
///
/// Clones share the list. Subscribing or unsubscribing from inside a
/// callback is allowed and takes effect from the next notification.
#[derive(Clone, Default)]
pub struct Notifier {
    inner: Arc<Mutex<NotifierInner>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = ObserverId(inner.next_id);
        inner.next_id += 1;
        inner.observers.push((id, Arc::new(observer)));
        id
    }

    /// Returns false if `id` was not subscribed
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let before = inner.observers.len();
        inner.observers.retain(|(observer_id, _)| *observer_id != id);
        inner.observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every observer with every event, in order
    pub fn notify(&self, events: &[ChangeEvent]) {
        let observers: Vec<Observer> = {
            let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.observers.iter().map(|(_, o)| Arc::clone(o)).collect()
        };
        for event in events {
            for observer in &observers {
                observer(*event);
            }
        }
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier").field("observers", &self.len()).finish()
    }
}

/// State before the first recorded step
#[derive(Debug, Clone, Default)]
struct Baseline {
    segmentation: Option<LabelArray>,
    full_segmentation: Option<LabelArray>,
    mask: Option<MaskArray>,
    algorithm: Option<AlgorithmChoice>,
}

/// Mask in effect at one history position
///
/// A step stores the mask it ran with; a mask derived afterwards exists only
/// here.
#[derive(Debug, Clone)]
struct MaskState {
    mask: Option<MaskArray>,
    property: MaskProperty,
}

/// The single current project
#[derive(Debug)]
pub struct Settings {
    registry: Arc<AlgorithmRegistry>,
    image: Option<Image>,
    mask: Option<MaskArray>,
    segmentation: Option<LabelArray>,
    full_segmentation: Option<LabelArray>,
    algorithm: Option<AlgorithmChoice>,
    mask_property: MaskProperty,
    history: HistoryLog,
    baseline: Baseline,
    mask_states: BTreeMap<usize, MaskState>,
    store: SettingsStore,
    notifier: Notifier,
}

impl Settings {
    pub fn new(registry: Arc<AlgorithmRegistry>) -> Self {
        Self {
            registry,
            image: None,
            mask: None,
            segmentation: None,
            full_segmentation: None,
            algorithm: None,
            mask_property: MaskProperty::default(),
            history: HistoryLog::new(),
            baseline: Baseline::default(),
            mask_states: BTreeMap::new(),
            store: SettingsStore::default(),
            notifier: Notifier::new(),
        }
    }

    pub fn with_store(mut self, store: SettingsStore) -> Self {
        self.store = store;
        self
    }

    pub fn registry(&self) -> &Arc<AlgorithmRegistry> {
        &self.registry
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        self.notifier.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.notifier.unsubscribe(id)
    }

    pub fn store(&self) -> &SettingsStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SettingsStore {
        &mut self.store
    }

    /// Current image, without mask
    pub fn image(&self) -> Option<&Image> {
        self.image.as_ref()
    }

    /// Current image with the current mask attached
    pub fn masked_image(&self) -> Result<Image> {
        let image = self.image.as_ref().ok_or(PartSegError::MissingData("image"))?;
        image.with_mask(self.mask.clone())
    }

    pub fn mask(&self) -> Option<&MaskArray> {
        self.mask.as_ref()
    }

    pub fn segmentation(&self) -> Option<&LabelArray> {
        self.segmentation.as_ref()
    }

    pub fn full_segmentation(&self) -> Option<&LabelArray> {
        self.full_segmentation.as_ref()
    }

    /// Algorithm and parameters of the current segmentation
    pub fn algorithm(&self) -> Option<&AlgorithmChoice> {
        self.algorithm.as_ref()
    }

    /// Property recorded with the next committed step
    pub fn mask_property(&self) -> &MaskProperty {
        &self.mask_property
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    /// Replace the whole state with a loaded project
    ///
    /// History is dropped when the image differs from the current one; a
    /// reload of the same pixels keeps it. A non-empty incoming history
    /// always replaces the current one.
    pub fn adopt(&mut self, project: ProjectTuple) -> Result<()> {
        project.check_shapes()?;
        let first_mask = match project.history.first() {
            Some(first) => first.arrays()?.mask,
            None => None,
        };

        let same_image = self
            .image
            .as_ref()
            .is_some_and(|current| current.fingerprint() == project.image.fingerprint());
        let mask = project.mask.or_else(|| project.image.mask().cloned());
        let image = project.image.with_mask(None)?.with_file_path(project.file_path);

        let mut events = vec![ChangeEvent::MaskChanged, ChangeEvent::SegmentationChanged];
        if !same_image {
            events.insert(0, ChangeEvent::ImageChanged);
        }
        if !project.history.is_empty() {
            self.history.replace(project.history);
            self.baseline = Baseline {
                mask: first_mask,
                ..Baseline::default()
            };
            self.mask_states.clear();
            events.push(ChangeEvent::HistoryChanged);
        } else if !same_image {
            if !self.history.is_empty() {
                events.push(ChangeEvent::HistoryChanged);
            }
            self.history.truncate_on_new_image();
            self.baseline = Baseline::default();
            self.mask_states.clear();
        }

        info!(
            "Adopted project {} ({} history steps, same image: {same_image})",
            image.file_path().display(),
            self.history.len()
        );
        self.image = Some(image);
        self.mask = mask;
        self.segmentation = project.segmentation;
        self.full_segmentation = project.full_segmentation;
        self.algorithm = project.algorithm;
        self.notifier.notify(&events);
        Ok(())
    }

    /// Start over with a bare image
    pub fn set_image(&mut self, image: Image) -> Result<()> {
        self.adopt(ProjectTuple::new(image))
    }

    /// Replace the mask; it must cover the image
    pub fn set_mask(&mut self, mask: Option<MaskArray>) -> Result<()> {
        let image = self.image.as_ref().ok_or(PartSegError::MissingData("image"))?;
        if let Some(mask) = &mask {
            check_shape(image.spatial_shape(), shape3(mask))?;
        }
        self.mask = mask;
        self.notifier.notify(&[ChangeEvent::MaskChanged]);
        Ok(())
    }

    /// Turn the current segmentation into the mask of the next step
    pub fn derive_mask(&mut self, property: MaskProperty) -> Result<()> {
        let segmentation = self
            .segmentation
            .as_ref()
            .ok_or(PartSegError::MissingData("segmentation"))?;
        let mask = property.derive_mask(segmentation, self.mask.as_ref())?;
        self.mask = Some(mask);
        self.mask_property = property;
        self.notifier.notify(&[ChangeEvent::MaskChanged]);
        Ok(())
    }

    /// Resolve, validate and run an algorithm, then record the result
    pub fn run_step(&mut self, name: &str, raw: &ParameterMap) -> Result<()> {
        let image = self.masked_image()?;
        let descriptor = self.registry.resolve(name)?;
        let parameters = descriptor.build(raw)?;
        check_channels(&image, &parameters)?;
        let output = descriptor.run(&image, &parameters)?;

        self.store
            .set_algorithm_values(descriptor.name(), parameters.values().clone());
        self.store.set_last_executed_algorithm(descriptor.name());
        self.commit_step(descriptor.name(), &parameters, output)
    }

    /// Record an already computed result as a new history step
    pub fn commit_step(&mut self, name: &str, parameters: &ParameterSet, output: AlgorithmOutput) -> Result<()> {
        let image = self.image.as_ref().ok_or(PartSegError::MissingData("image"))?;
        let descriptor = self.registry.resolve(name)?;
        if parameters.algorithm() != descriptor.name() {
            return Err(PartSegError::Algorithm(format!(
                "parameters of `{}` committed as `{}`",
                parameters.algorithm(),
                descriptor.name()
            )));
        }
        let AlgorithmOutput {
            segmentation,
            full_segmentation,
        } = output;
        let full_segmentation = full_segmentation.unwrap_or_else(|| segmentation.clone());
        check_shape(image.spatial_shape(), shape3(&segmentation))?;

        let choice = parameters.to_choice();
        let element = HistoryElement::create(
            choice.clone(),
            self.mask_property.clone(),
            &segmentation,
            &full_segmentation,
            self.mask.as_ref(),
        )?;

        if !self.history.can_undo() {
            self.baseline = Baseline {
                segmentation: self.segmentation.take(),
                full_segmentation: self.full_segmentation.take(),
                mask: self.mask.clone(),
                algorithm: self.algorithm.take(),
            };
        }
        let cursor = self.history.cursor();
        let state = self.mask_state();
        self.mask_states.retain(|position, _| *position <= cursor);
        self.mask_states.insert(cursor, state);
        self.history.push(element);
        debug!("Committed step {} ({})", self.history.len(), descriptor.name());
        self.segmentation = Some(segmentation);
        self.full_segmentation = Some(full_segmentation);
        self.algorithm = Some(choice);
        self.notifier
            .notify(&[ChangeEvent::SegmentationChanged, ChangeEvent::HistoryChanged]);
        Ok(())
    }

    fn mask_state(&self) -> MaskState {
        MaskState {
            mask: self.mask.clone(),
            property: self.mask_property.clone(),
        }
    }

    /// Step back; returns false when there is nothing to undo
    pub fn undo(&mut self) -> Result<bool> {
        let left = self.history.cursor();
        let restored = match self.history.undo() {
            Step::AtBoundary => return Ok(false),
            Step::Restore(element) => Restored::from_element(element),
            Step::Pristine => Ok(Restored::from_baseline(&self.baseline)),
        };
        match restored {
            Ok(restored) => {
                debug!("Undo to step {}", self.history.cursor());
                self.move_to(left, restored);
                Ok(true)
            }
            Err(err) => {
                self.history.redo();
                Err(err)
            }
        }
    }

    /// Step forward; returns false when there is nothing to redo
    pub fn redo(&mut self) -> Result<bool> {
        let left = self.history.cursor();
        let restored = match self.history.redo() {
            Step::AtBoundary => return Ok(false),
            Step::Restore(element) => Restored::from_element(element),
            Step::Pristine => Ok(Restored::from_baseline(&self.baseline)),
        };
        match restored {
            Ok(restored) => {
                debug!("Redo to step {}", self.history.cursor());
                self.move_to(left, restored);
                Ok(true)
            }
            Err(err) => {
                self.history.undo();
                Err(err)
            }
        }
    }

    /// Remember the mask of position `left`, then install `restored` with
    /// the mask last seen at the new position
    fn move_to(&mut self, left: usize, mut restored: Restored) {
        let leaving = self.mask_state();
        self.mask_states.insert(left, leaving);
        if let Some(state) = self.mask_states.get(&self.history.cursor()) {
            restored.mask = state.mask.clone();
            restored.mask_property = Some(state.property.clone());
        }
        self.restore(restored);
    }

    fn restore(&mut self, restored: Restored) {
        self.segmentation = restored.segmentation;
        self.full_segmentation = restored.full_segmentation;
        self.mask = restored.mask;
        self.algorithm = restored.algorithm;
        if let Some(property) = restored.mask_property {
            self.mask_property = property;
        }
        self.notifier.notify(&[
            ChangeEvent::MaskChanged,
            ChangeEvent::SegmentationChanged,
            ChangeEvent::HistoryChanged,
        ]);
    }

    /// Re-run recorded step `index` from its stored parameters and mask
    pub fn replay_step(&self, index: usize) -> Result<AlgorithmOutput> {
        let element = self
            .history
            .get(index)
            .ok_or_else(|| PartSegError::Settings(format!("no history step {index}")))?;
        let bundle = element.arrays()?;
        let image = self
            .image
            .as_ref()
            .ok_or(PartSegError::MissingData("image"))?
            .with_mask(bundle.mask)?;
        let choice = element.algorithm();
        let descriptor = self.registry.resolve(&choice.name)?;
        let parameters = build_versioned(&descriptor, choice.version.as_ref(), &choice.values)?;
        check_channels(&image, &parameters)?;
        descriptor.run(&image, &parameters)
    }

    /// Whether replaying step `index` reproduces its stored segmentation
    pub fn verify_step(&self, index: usize) -> Result<bool> {
        let output = self.replay_step(index)?;
        let stored = self
            .history
            .get(index)
            .ok_or_else(|| PartSegError::Settings(format!("no history step {index}")))?
            .arrays()?;
        Ok(output.segmentation == stored.segmentation)
    }

    /// Snapshot of everything needed to resume this project
    pub fn current_project_tuple(&self) -> Result<ProjectTuple> {
        let image = self.image.clone().ok_or(PartSegError::MissingData("image"))?;
        Ok(ProjectTuple {
            file_path: image.file_path().to_path_buf(),
            image,
            segmentation: self.segmentation.clone(),
            full_segmentation: self.full_segmentation.clone(),
            mask: self.mask.clone(),
            history: self.history.done().to_vec(),
            algorithm: self.algorithm.clone(),
        })
    }
}

/// State to install after an undo or redo
struct Restored {
    segmentation: Option<LabelArray>,
    full_segmentation: Option<LabelArray>,
    mask: Option<MaskArray>,
    algorithm: Option<AlgorithmChoice>,
    mask_property: Option<MaskProperty>,
}

impl Restored {
    fn from_element(element: &HistoryElement) -> Result<Self> {
        let ArrayBundle {
            segmentation,
            full_segmentation,
            mask,
        } = element.arrays()?;
        Ok(Self {
            segmentation: Some(segmentation),
            full_segmentation: Some(full_segmentation),
            mask,
            algorithm: Some(element.algorithm().clone()),
            mask_property: Some(element.mask_property().clone()),
        })
    }

    fn from_baseline(baseline: &Baseline) -> Self {
        Self {
            segmentation: baseline.segmentation.clone(),
            full_segmentation: baseline.full_segmentation.clone(),
            mask: baseline.mask.clone(),
            algorithm: baseline.algorithm.clone(),
            mask_property: None,
        }
    }
}

/// Every channel parameter must name a channel of `image`
fn check_channels(image: &Image, parameters: &ParameterSet) -> Result<()> {
    for (path, channel) in parameters.channels() {
        if image.channel_index(channel).is_none() {
            return Err(PartSegError::validation(
                path,
                format!("channel {channel} does not exist, image has {}", image.channels()),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::AlgorithmDescriptor;
    use crate::image::DEFAULT_SPACING;
    use crate::parameters::{parameter_map, FieldSchema};
    use ndarray::{Array3, Array4};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> Arc<AlgorithmRegistry> {
        let registry = Arc::new(AlgorithmRegistry::new());
        let threshold = |image: &Image, parameters: &ParameterSet| -> Result<AlgorithmOutput> {
            let level = parameters.int("value")?;
            let channel = image.channel(0).ok_or(PartSegError::MissingData("channel"))?;
            Ok(AlgorithmOutput::new(channel.mapv(|v| u32::from(i64::from(v) >= level))))
        };
        registry
            .register(
                AlgorithmDescriptor::new("threshold", Arc::new(threshold))
                    .with_field(FieldSchema::int("value", "Value", 8000, 0..=65535))
                    .with_field(FieldSchema::channel("channel", "Channel")),
                &[],
            )
            .unwrap();
        registry
    }

    fn image(offset: u16) -> Image {
        Image::new(
            Array4::from_shape_fn((1, 3, 3, 1), |(_, y, x, _)| (y * 3 + x) as u16 + offset),
            DEFAULT_SPACING,
        )
        .unwrap()
    }

    fn settings() -> Settings {
        let mut settings = Settings::new(registry());
        settings.set_image(image(0)).unwrap();
        settings
    }

    #[test]
    fn test_run_step_and_undo_to_pristine() {
        let mut settings = settings();
        settings.run_step("threshold", &parameter_map([("value", 4)])).unwrap();
        assert_eq!(settings.segmentation().unwrap()[[0, 1, 1]], 1);
        settings.run_step("threshold", &parameter_map([("value", 8)])).unwrap();
        assert_eq!(settings.segmentation().unwrap()[[0, 1, 1]], 0);

        assert!(settings.undo().unwrap());
        assert_eq!(settings.segmentation().unwrap()[[0, 1, 1]], 1);
        assert!(settings.undo().unwrap());
        assert!(settings.segmentation().is_none());
        assert!(!settings.undo().unwrap());
        assert!(settings.redo().unwrap());
        assert_eq!(settings.segmentation().unwrap()[[0, 1, 1]], 1);
        assert_eq!(settings.store().last_executed_algorithm(), Some("threshold"));
    }

    #[test]
    fn test_channel_out_of_range_leaves_state() {
        let mut settings = settings();
        let err = settings
            .run_step("threshold", &parameter_map([("channel", 3)]))
            .unwrap_err();
        assert_eq!(err.field(), Some("channel"));
        assert!(settings.history().is_empty());
    }

    #[test]
    fn test_new_image_truncates_history_same_image_keeps_it() {
        let mut settings = settings();
        settings.run_step("threshold", &ParameterMap::new()).unwrap();
        settings.set_image(image(0)).unwrap();
        assert_eq!(settings.history().len(), 1);
        settings.set_image(image(1)).unwrap();
        assert!(settings.history().is_empty());
    }

    #[test]
    fn test_mask_shape_rejected_before_mutation() {
        let mut settings = settings();
        assert!(settings.set_mask(Some(Array3::zeros((2, 3, 3)))).is_err());
        assert!(settings.mask().is_none());
    }

    #[test]
    fn test_observers_see_complete_updates() {
        let mut settings = settings();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let id = settings.subscribe(move |event| {
            if event == ChangeEvent::SegmentationChanged {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        settings.run_step("threshold", &ParameterMap::new()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(settings.unsubscribe(id));
        settings.run_step("threshold", &ParameterMap::new()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_from_callback() {
        let notifier = Notifier::new();
        let inner = notifier.clone();
        notifier.subscribe(move |_| {
            inner.subscribe(|_| {});
        });
        notifier.notify(&[ChangeEvent::ImageChanged]);
        assert_eq!(notifier.len(), 2);
    }

    #[test]
    fn test_derived_mask_survives_undo_redo() {
        let mut settings = settings();
        settings.run_step("threshold", &parameter_map([("value", 2)])).unwrap();
        settings.run_step("threshold", &parameter_map([("value", 4)])).unwrap();
        let property = MaskProperty {
            reversed_mask: true,
            ..MaskProperty::simple()
        };
        settings.derive_mask(property.clone()).unwrap();
        let derived = settings.mask().cloned();
        assert!(derived.is_some());

        assert!(settings.undo().unwrap());
        assert!(settings.mask().is_none());
        assert!(settings.redo().unwrap());
        assert_eq!(settings.mask(), derived.as_ref());
        assert_eq!(settings.mask_property(), &property);
    }

    #[test]
    fn test_mask_derived_between_steps_restored_on_undo() {
        let mut settings = settings();
        settings.run_step("threshold", &parameter_map([("value", 2)])).unwrap();
        settings.derive_mask(MaskProperty::simple()).unwrap();
        let derived = settings.mask().cloned();
        settings.run_step("threshold", &parameter_map([("value", 4)])).unwrap();

        assert!(settings.undo().unwrap());
        assert_eq!(settings.mask(), derived.as_ref());
        assert!(settings.undo().unwrap());
        assert!(settings.mask().is_none());
        assert!(settings.redo().unwrap());
        assert_eq!(settings.mask(), derived.as_ref());
    }

    #[test]
    fn test_adopt_keeps_mask_attached_to_image() {
        let mut settings = Settings::new(registry());
        let mask = Array3::from_elem((1, 3, 3), 1u8);
        let mut project = ProjectTuple::new(image(0));
        project.image = image(0).with_mask(Some(mask.clone())).unwrap();
        settings.adopt(project).unwrap();
        assert_eq!(settings.mask(), Some(&mask));
        assert!(settings.image().unwrap().mask().is_none());
    }

    #[test]
    fn test_derive_mask_and_replay() {
        let mut settings = settings();
        settings.run_step("threshold", &parameter_map([("value", 3)])).unwrap();
        settings.derive_mask(MaskProperty::simple()).unwrap();
        assert_eq!(settings.mask().unwrap()[[0, 0, 0]], 0);
        settings.run_step("threshold", &parameter_map([("value", 5)])).unwrap();
        assert!(settings.verify_step(0).unwrap());
        assert!(settings.verify_step(1).unwrap());
        assert!(settings.replay_step(5).is_err());
    }
}
