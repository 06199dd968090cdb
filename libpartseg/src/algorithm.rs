//! Segmentation algorithm descriptors and the name-based registry.
//!
//! A registry is a plain value owned by whoever builds it (the application,
//! a test, a nested parameter field). Registries are shared through `Arc`
//! and safe to register into and resolve from concurrently.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info};

use crate::arrays::{check_shape, shape3, LabelArray};
use crate::error::{PartSegError, Result};
use crate::image::Image;
use crate::parameters::{self, FieldSchema, ParameterMap, ParameterSet, ParameterValue, Version};

/// Arrays returned by one algorithm run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmOutput {
    /// Final labelling
    pub segmentation: LabelArray,
    /// Auxiliary labelling before filtering, if the algorithm has one
    pub full_segmentation: Option<LabelArray>,
}

impl AlgorithmOutput {
    pub fn new(segmentation: LabelArray) -> Self {
        Self {
            segmentation,
            full_segmentation: None,
        }
    }

    pub fn with_full_segmentation(mut self, full: LabelArray) -> Self {
        self.full_segmentation = Some(full);
        self
    }

    /// Full segmentation, falling back to the final one
    pub fn full_or_segmentation(&self) -> &LabelArray {
        self.full_segmentation.as_ref().unwrap_or(&self.segmentation)
    }
}

/// Entry point of a segmentation algorithm
pub trait Algorithm: Send + Sync {
    /// Segment `image` with validated `parameters`
    fn run(&self, image: &Image, parameters: &ParameterSet) -> Result<AlgorithmOutput>;
}

impl<F> Algorithm for F
where
    F: Fn(&Image, &ParameterSet) -> Result<AlgorithmOutput> + Send + Sync,
{
    fn run(&self, image: &Image, parameters: &ParameterSet) -> Result<AlgorithmOutput> {
        self(image, parameters)
    }
}

type MigrationFn = dyn Fn(ParameterMap) -> ParameterMap + Send + Sync;

/// Parameter upgrade to `version` from the version before it
#[derive(Clone)]
pub struct Migration {
    pub version: Version,
    transform: Arc<MigrationFn>,
}

impl Migration {
    pub fn apply(&self, values: ParameterMap) -> ParameterMap {
        (self.transform)(values)
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration").field("version", &self.version).finish()
    }
}

/// Everything the registry knows about one algorithm
#[derive(Clone)]
pub struct AlgorithmDescriptor {
    name: String,
    fields: Vec<FieldSchema>,
    version: Version,
    migrations: Vec<Migration>,
    help: String,
    entry: Arc<dyn Algorithm>,
}

impl AlgorithmDescriptor {
    pub fn new(name: &str, entry: Arc<dyn Algorithm>) -> Self {
        Self {
            name: name.to_string(),
            fields: Vec::new(),
            version: Version::default(),
            migrations: Vec::new(),
            help: String::new(),
            entry,
        }
    }

    pub fn with_field(mut self, field: FieldSchema) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_help(mut self, help: &str) -> Self {
        self.help = help.to_string();
        self
    }

    /// Register an upgrade step; the descriptor version becomes the newest step
    pub fn with_migration<F>(mut self, version: Version, transform: F) -> Self
    where
        F: Fn(ParameterMap) -> ParameterMap + Send + Sync + 'static,
    {
        self.migrations.push(Migration {
            version,
            transform: Arc::new(transform),
        });
        self.migrations.sort_by_key(|m| m.version);
        self.version = self.version.max(version);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldSchema] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Current schema version
    pub fn version(&self) -> Version {
        self.version
    }

    /// Migrations in ascending version order
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Whether values may have been written under `version`
    pub fn knows_version(&self, version: &Version) -> bool {
        *version == Version::default()
            || *version == self.version
            || self.migrations.iter().any(|m| m.version == *version)
    }

    /// Parameter map holding every field's default
    pub fn default_values(&self) -> ParameterMap {
        self.fields
            .iter()
            .map(|f| (f.name.clone(), f.default.clone()))
            .collect()
    }

    /// Human readable help text listing fields and defaults
    pub fn documentation(&self) -> String {
        let mut text = String::new();
        if !self.help.is_empty() {
            text.push_str(&self.help);
            text.push_str("\n\n");
        }
        for field in &self.fields {
            text.push_str(&format!("{}: {}", field.label, describe_default(&field.default)));
            if !field.help.is_empty() {
                text.push_str(&format!(" {}", field.help));
            }
            text.push('\n');
        }
        text.push_str(&format!(
            "(default values: {})",
            ParameterValue::Mapping(self.default_values())
        ));
        text
    }

    /// Validate `raw` and build a parameter set for this algorithm
    pub fn build(&self, raw: &ParameterMap) -> Result<ParameterSet> {
        parameters::build(self, raw)
    }

    /// Run the algorithm, checking the parameters belong to it and the output covers the image
    pub fn run(&self, image: &Image, parameters: &ParameterSet) -> Result<AlgorithmOutput> {
        if parameters.algorithm() != self.name {
            return Err(PartSegError::Algorithm(format!(
                "parameters of `{}` passed to `{}`",
                parameters.algorithm(),
                self.name
            )));
        }
        debug!("Running algorithm `{}`", self.name);
        let output = self.entry.run(image, parameters)?;
        check_shape(image.spatial_shape(), shape3(&output.segmentation))?;
        if let Some(full) = &output.full_segmentation {
            check_shape(image.spatial_shape(), shape3(full))?;
        }
        Ok(output)
    }

    fn same_as(&self, other: &Self) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.fields == other.fields
            && Arc::ptr_eq(&self.entry, &other.entry)
    }
}

fn describe_default(value: &ParameterValue) -> String {
    format!("default {value}")
}

impl fmt::Debug for AlgorithmDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlgorithmDescriptor")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("fields", &self.fields)
            .field("migrations", &self.migrations)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RegistryInner {
    order: Vec<String>,
    entries: HashMap<String, Arc<AlgorithmDescriptor>>,
    aliases: HashMap<String, String>,
}

impl RegistryInner {
    fn canonical<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        if self.entries.contains_key(name) {
            Some(name)
        } else {
            self.aliases.get(name).map(String::as_str)
        }
    }
}

/// Name to algorithm lookup, preserving registration order
#[derive(Default)]
pub struct AlgorithmRegistry {
    inner: RwLock<RegistryInner>,
}

impl AlgorithmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an algorithm under its name and any former names
    ///
    /// Registering the same descriptor again is a no-op. A different
    /// descriptor under a taken name, or an old name already pointing at
    /// another algorithm, fails with `DuplicateName` and changes nothing.
    pub fn register(&self, descriptor: AlgorithmDescriptor, old_names: &[&str]) -> Result<Arc<AlgorithmDescriptor>> {
        let mut inner = self.write();
        let name = descriptor.name().to_string();

        if let Some(existing) = inner.entries.get(&name) {
            if !existing.same_as(&descriptor) {
                return Err(PartSegError::DuplicateName(name));
            }
        } else if inner.aliases.contains_key(&name) {
            return Err(PartSegError::DuplicateName(name));
        }
        for old in old_names {
            let taken = match inner.canonical(old) {
                Some(target) => target != name,
                None => false,
            };
            if taken {
                return Err(PartSegError::DuplicateName((*old).to_string()));
            }
        }

        let descriptor = match inner.entries.get(&name) {
            Some(existing) => Arc::clone(existing),
            None => {
                info!("Registering algorithm `{name}`");
                let descriptor = Arc::new(descriptor);
                inner.entries.insert(name.clone(), Arc::clone(&descriptor));
                inner.order.push(name.clone());
                descriptor
            }
        };
        for old in old_names {
            if *old != name {
                inner.aliases.insert((*old).to_string(), name.clone());
            }
        }
        Ok(descriptor)
    }

    /// Look up an algorithm by current or former name
    pub fn resolve(&self, name: &str) -> Result<Arc<AlgorithmDescriptor>> {
        let inner = self.read();
        inner
            .canonical(name)
            .and_then(|canonical| inner.entries.get(canonical))
            .cloned()
            .ok_or_else(|| PartSegError::UnknownAlgorithm(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().canonical(name).is_some()
    }

    /// Canonical names in registration order
    pub fn list(&self) -> Vec<String> {
        self.read().order.clone()
    }

    /// Descriptors in registration order
    pub fn descriptors(&self) -> Vec<Arc<AlgorithmDescriptor>> {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter_map(|name| inner.entries.get(name).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every registration
    pub fn clear(&self) {
        let mut inner = self.write();
        inner.order.clear();
        inner.entries.clear();
        inner.aliases.clear();
    }
}

impl fmt::Debug for AlgorithmRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlgorithmRegistry")
            .field("algorithms", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Array4};

    fn zeros() -> Arc<dyn Algorithm> {
        Arc::new(|image: &Image, _: &ParameterSet| Ok(AlgorithmOutput::new(Array3::zeros(image.spatial_shape()))))
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = AlgorithmRegistry::new();
        registry
            .register(AlgorithmDescriptor::new("Lower threshold", zeros()), &["Threshold"])
            .unwrap();
        registry.register(AlgorithmDescriptor::new("Otsu", zeros()), &[]).unwrap();

        assert_eq!(registry.list(), vec!["Lower threshold", "Otsu"]);
        assert_eq!(registry.resolve("Threshold").unwrap().name(), "Lower threshold");
        assert!(matches!(
            registry.resolve("missing"),
            Err(PartSegError::UnknownAlgorithm(_))
        ));
    }

    #[test]
    fn test_duplicate_rejected_but_identical_is_idempotent() {
        let registry = AlgorithmRegistry::new();
        let entry = zeros();
        registry
            .register(AlgorithmDescriptor::new("A", Arc::clone(&entry)), &[])
            .unwrap();
        registry
            .register(AlgorithmDescriptor::new("A", Arc::clone(&entry)), &[])
            .unwrap();
        assert_eq!(registry.len(), 1);

        let err = registry.register(AlgorithmDescriptor::new("A", zeros()), &[]).unwrap_err();
        assert!(err.is_programming_error());

        registry.register(AlgorithmDescriptor::new("B", zeros()), &["Old"]).unwrap();
        let err = registry.register(AlgorithmDescriptor::new("C", zeros()), &["Old"]).unwrap_err();
        assert!(matches!(err, PartSegError::DuplicateName(ref n) if n == "Old"));
        assert!(!registry.contains("C"));
    }

    #[test]
    fn test_clear() {
        let registry = AlgorithmRegistry::new();
        registry.register(AlgorithmDescriptor::new("A", zeros()), &["B"]).unwrap();
        registry.clear();
        assert!(registry.is_empty());
        assert!(!registry.contains("B"));
    }

    #[test]
    fn test_documentation_lists_defaults() {
        let descriptor = AlgorithmDescriptor::new("threshold", zeros())
            .with_help("Keep bright voxels")
            .with_field(FieldSchema::int("value", "Value", 8000, 0..=65535));
        let doc = descriptor.documentation();
        assert!(doc.starts_with("Keep bright voxels"));
        assert!(doc.contains("(default values: {value: 8000})"));
    }

    #[test]
    fn test_run_checks_output_shape() {
        let wrong: Arc<dyn Algorithm> =
            Arc::new(|_: &Image, _: &ParameterSet| Ok(AlgorithmOutput::new(Array3::zeros((1, 1, 1)))));
        let descriptor = AlgorithmDescriptor::new("wrong", wrong);
        let image = Image::new(Array4::zeros((2, 2, 2, 1)), crate::image::DEFAULT_SPACING).unwrap();
        let params = descriptor.build(&ParameterMap::new()).unwrap();
        assert!(matches!(
            descriptor.run(&image, &params),
            Err(PartSegError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = Arc::new(AlgorithmRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry
                        .register(AlgorithmDescriptor::new(&format!("alg{i}"), zeros()), &[])
                        .unwrap();
                    registry.resolve(&format!("alg{i}")).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 8);
    }
}
