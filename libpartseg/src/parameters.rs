//! Parameter values, field schemas and the validating parameter builder.
//!
//! Raw parameters (from a caller or from disk) are plain [`ParameterMap`]s.
//! [`build`] checks them against an algorithm's schema and produces an
//! immutable [`ParameterSet`]; [`migrate`] upgrades maps written under an
//! older schema version first.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::sync::Arc;

use log::debug;

use crate::algorithm::{AlgorithmDescriptor, AlgorithmRegistry};
use crate::channel::Channel;
use crate::error::{PartSegError, Result};
use crate::mask::MaskProperty;

/// Parameter name to value
pub type ParameterMap = BTreeMap<String, ParameterValue>;

/// Schema version, `major.minor.patch`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = PartSegError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<u32> = s
            .split('.')
            .map(str::parse)
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| PartSegError::Json(format!("invalid version `{s}`")))?;
        match parts.as_slice() {
            [major] => Ok(Self::new(*major, 0, 0)),
            [major, minor] => Ok(Self::new(*major, *minor, 0)),
            [major, minor, patch] => Ok(Self::new(*major, *minor, *patch)),
            _ => Err(PartSegError::Json(format!("invalid version `{s}`"))),
        }
    }
}

/// A single parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Channel(Channel),
    MaskProperty(MaskProperty),
    /// Nested selection of another algorithm with its own parameters
    Algorithm(AlgorithmChoice),
    List(Vec<ParameterValue>),
    Mapping(ParameterMap),
}

impl ParameterValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            #[allow(clippy::cast_precision_loss)]
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_channel(&self) -> Option<&Channel> {
        match self {
            Self::Channel(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_choice(&self) -> Option<&AlgorithmChoice> {
        match self {
            Self::Algorithm(v) => Some(v),
            _ => None,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "a boolean",
            Self::Int(_) => "an integer",
            Self::Float(_) => "a float",
            Self::Text(_) => "a string",
            Self::Channel(_) => "a channel",
            Self::MaskProperty(_) => "a mask property",
            Self::Algorithm(_) => "an algorithm selection",
            Self::List(_) => "a list",
            Self::Mapping(_) => "a mapping",
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("None"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v:?}"),
            Self::Text(v) => f.write_str(v),
            Self::Channel(v) => write!(f, "{v}"),
            Self::MaskProperty(v) => write!(f, "{v:?}"),
            Self::Algorithm(v) => f.write_str(&v.name),
            Self::List(items) => {
                let parts: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Self::Mapping(map) => {
                let parts: Vec<String> = map.iter().map(|(k, v)| format!("{k}: {v}")).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for ParameterValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Channel> for ParameterValue {
    fn from(v: Channel) -> Self {
        Self::Channel(v)
    }
}

impl From<MaskProperty> for ParameterValue {
    fn from(v: MaskProperty) -> Self {
        Self::MaskProperty(v)
    }
}

impl From<AlgorithmChoice> for ParameterValue {
    fn from(v: AlgorithmChoice) -> Self {
        Self::Algorithm(v)
    }
}

/// Algorithm name plus the parameter values chosen for it
///
/// `version` is the schema version the values were written under; `None`
/// means "current". Inside a built [`ParameterSet`] nested choices are
/// validated and carry the current version.
#[derive(Debug, Clone, PartialEq)]
pub struct AlgorithmChoice {
    pub name: String,
    pub version: Option<Version>,
    pub values: ParameterMap,
}

impl AlgorithmChoice {
    pub fn new(name: impl Into<String>, values: ParameterMap) -> Self {
        Self {
            name: name.into(),
            version: None,
            values,
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }
}

/// Validated, immutable parameters of one algorithm
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSet {
    algorithm: String,
    version: Version,
    values: ParameterMap,
}

impl ParameterSet {
    /// Canonical name of the algorithm these parameters belong to
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn values(&self) -> &ParameterMap {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    pub fn int(&self, name: &str) -> Result<i64> {
        self.typed(name, ParameterValue::as_int)
    }

    pub fn float(&self, name: &str) -> Result<f64> {
        self.typed(name, ParameterValue::as_float)
    }

    pub fn boolean(&self, name: &str) -> Result<bool> {
        self.typed(name, ParameterValue::as_bool)
    }

    pub fn text(&self, name: &str) -> Result<&str> {
        self.typed(name, ParameterValue::as_str)
    }

    pub fn channel(&self, name: &str) -> Result<&Channel> {
        self.typed(name, ParameterValue::as_channel)
    }

    pub fn choice(&self, name: &str) -> Result<&AlgorithmChoice> {
        self.typed(name, ParameterValue::as_choice)
    }

    fn typed<'a, T>(&'a self, name: &str, get: impl Fn(&'a ParameterValue) -> Option<T>) -> Result<T> {
        self.values
            .get(name)
            .and_then(get)
            .ok_or_else(|| PartSegError::validation(name, "missing or of unexpected type"))
    }

    /// Every channel reference, including nested selections, with its dotted path
    pub fn channels(&self) -> Vec<(String, &Channel)> {
        let mut found = Vec::new();
        collect_channels("", &self.values, &mut found);
        found
    }

    /// Convert back into a raw choice (for storing or nesting)
    pub fn to_choice(&self) -> AlgorithmChoice {
        AlgorithmChoice {
            name: self.algorithm.clone(),
            version: Some(self.version),
            values: self.values.clone(),
        }
    }
}

fn collect_channels<'a>(prefix: &str, values: &'a ParameterMap, found: &mut Vec<(String, &'a Channel)>) {
    for (name, value) in values {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        match value {
            ParameterValue::Channel(channel) => found.push((path, channel)),
            ParameterValue::Algorithm(choice) => collect_channels(&path, &choice.values, found),
            _ => {}
        }
    }
}

/// Type and constraints of one schema field
#[derive(Clone)]
pub enum FieldKind {
    Int { min: i64, max: i64 },
    Float { min: f64, max: f64 },
    Bool,
    Choice(Vec<String>),
    Text,
    Channel,
    MaskProperty,
    /// Pick one algorithm from another registry, with its own parameters
    Algorithm(Arc<AlgorithmRegistry>),
}

impl fmt::Debug for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int { min, max } => write!(f, "Int({min}..={max})"),
            Self::Float { min, max } => write!(f, "Float({min}..={max})"),
            Self::Bool => f.write_str("Bool"),
            Self::Choice(options) => write!(f, "Choice({options:?})"),
            Self::Text => f.write_str("Text"),
            Self::Channel => f.write_str("Channel"),
            Self::MaskProperty => f.write_str("MaskProperty"),
            Self::Algorithm(registry) => write!(f, "Algorithm({:?})", registry.list()),
        }
    }
}

impl PartialEq for FieldKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int { min: a, max: b }, Self::Int { min: c, max: d }) => a == c && b == d,
            (Self::Float { min: a, max: b }, Self::Float { min: c, max: d }) => a == c && b == d,
            (Self::Choice(a), Self::Choice(b)) => a == b,
            (Self::Algorithm(a), Self::Algorithm(b)) => Arc::ptr_eq(a, b),
            (Self::Bool, Self::Bool)
            | (Self::Text, Self::Text)
            | (Self::Channel, Self::Channel)
            | (Self::MaskProperty, Self::MaskProperty) => true,
            _ => false,
        }
    }
}

/// Declaration of one algorithm parameter
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    pub name: String,
    pub label: String,
    pub default: ParameterValue,
    pub kind: FieldKind,
    pub help: String,
}

impl FieldSchema {
    pub fn new(name: &str, label: &str, default: ParameterValue, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            default,
            kind,
            help: String::new(),
        }
    }

    pub fn int(name: &str, label: &str, default: i64, range: RangeInclusive<i64>) -> Self {
        let (min, max) = range.into_inner();
        Self::new(name, label, ParameterValue::Int(default), FieldKind::Int { min, max })
    }

    pub fn float(name: &str, label: &str, default: f64, range: RangeInclusive<f64>) -> Self {
        let (min, max) = range.into_inner();
        Self::new(name, label, ParameterValue::Float(default), FieldKind::Float { min, max })
    }

    pub fn boolean(name: &str, label: &str, default: bool) -> Self {
        Self::new(name, label, ParameterValue::Bool(default), FieldKind::Bool)
    }

    pub fn choice(name: &str, label: &str, default: &str, options: &[&str]) -> Self {
        let options = options.iter().map(ToString::to_string).collect();
        Self::new(name, label, ParameterValue::from(default), FieldKind::Choice(options))
    }

    pub fn text(name: &str, label: &str, default: &str) -> Self {
        Self::new(name, label, ParameterValue::from(default), FieldKind::Text)
    }

    pub fn channel(name: &str, label: &str) -> Self {
        Self::new(name, label, ParameterValue::Channel(Channel::default()), FieldKind::Channel)
    }

    pub fn mask_property(name: &str, label: &str) -> Self {
        Self::new(
            name,
            label,
            ParameterValue::MaskProperty(MaskProperty::default()),
            FieldKind::MaskProperty,
        )
    }

    pub fn algorithm(name: &str, label: &str, registry: Arc<AlgorithmRegistry>, default: &str) -> Self {
        Self::new(name, label, ParameterValue::from(default), FieldKind::Algorithm(registry))
    }

    pub fn with_help(mut self, help: &str) -> Self {
        self.help = help.to_string();
        self
    }

    /// Check `value` against this field, returning the normalised value
    fn check(&self, value: &ParameterValue) -> Result<ParameterValue> {
        let fail = |reason: String| Err(PartSegError::validation(&self.name, reason));
        match (&self.kind, value) {
            (FieldKind::Int { min, max }, ParameterValue::Int(v)) => {
                if (*min..=*max).contains(v) {
                    Ok(value.clone())
                } else {
                    fail(format!("{v} is outside {min}..={max}"))
                }
            }
            (FieldKind::Float { min, max }, ParameterValue::Float(_) | ParameterValue::Int(_)) => {
                let v = value.as_float().unwrap_or(f64::NAN);
                if v.is_finite() && (*min..=*max).contains(&v) {
                    Ok(ParameterValue::Float(v))
                } else {
                    fail(format!("{v} is outside {min}..={max}"))
                }
            }
            (FieldKind::Bool, ParameterValue::Bool(_))
            | (FieldKind::Text, ParameterValue::Text(_))
            | (FieldKind::Channel, ParameterValue::Channel(_))
            | (FieldKind::MaskProperty, ParameterValue::MaskProperty(_)) => Ok(value.clone()),
            (FieldKind::Choice(options), ParameterValue::Text(v)) => {
                if options.contains(v) {
                    Ok(value.clone())
                } else {
                    fail(format!("`{v}` is not one of {options:?}"))
                }
            }
            (FieldKind::Channel, ParameterValue::Int(v)) => match usize::try_from(*v) {
                Ok(index) => Ok(ParameterValue::Channel(Channel::Index(index))),
                Err(_) => fail(format!("channel index {v} is negative")),
            },
            (FieldKind::Channel, ParameterValue::Text(name)) => {
                Ok(ParameterValue::Channel(Channel::Name(name.clone())))
            }
            (FieldKind::Algorithm(registry), _) => self.check_selection(registry, value),
            (kind, other) => fail(format!("expected {kind:?}, got {}", other.kind_name())),
        }
    }

    fn check_selection(&self, registry: &AlgorithmRegistry, value: &ParameterValue) -> Result<ParameterValue> {
        let choice = match value {
            ParameterValue::Algorithm(choice) => choice.clone(),
            ParameterValue::Text(name) => AlgorithmChoice::new(name.clone(), ParameterMap::new()),
            ParameterValue::Mapping(map) => choice_from_mapping(map)
                .ok_or_else(|| PartSegError::validation(&self.name, "expected {name, values} mapping"))?,
            other => {
                return Err(PartSegError::validation(
                    &self.name,
                    format!("expected an algorithm selection, got {}", other.kind_name()),
                ))
            }
        };
        let descriptor = registry.resolve(&choice.name).map_err(|_| {
            PartSegError::validation(&self.name, format!("unknown algorithm `{}`", choice.name))
        })?;
        let nested = build_versioned(&descriptor, choice.version.as_ref(), &choice.values)
            .map_err(|err| prefix_field(&self.name, err))?;
        Ok(ParameterValue::Algorithm(nested.to_choice()))
    }
}

fn choice_from_mapping(map: &ParameterMap) -> Option<AlgorithmChoice> {
    let name = map.get("name")?.as_str()?;
    let values = match map.get("values") {
        None | Some(ParameterValue::Null) => ParameterMap::new(),
        Some(ParameterValue::Mapping(values)) => values.clone(),
        Some(_) => return None,
    };
    Some(AlgorithmChoice::new(name, values))
}

fn prefix_field(prefix: &str, err: PartSegError) -> PartSegError {
    match err {
        PartSegError::ParameterValidation { field, reason } => PartSegError::ParameterValidation {
            field: format!("{prefix}.{field}"),
            reason,
        },
        other => other,
    }
}

/// Validate `raw` against the descriptor's schema
///
/// Unknown keys are rejected, missing fields take their declared defaults.
/// Fails on the first violation; nothing is returned on failure.
pub fn build(descriptor: &AlgorithmDescriptor, raw: &ParameterMap) -> Result<ParameterSet> {
    if let Some(unknown) = raw.keys().find(|key| descriptor.field(key).is_none()) {
        return Err(PartSegError::validation(
            unknown.as_str(),
            format!("unknown field for algorithm `{}`", descriptor.name()),
        ));
    }

    let mut values = ParameterMap::new();
    for field in descriptor.fields() {
        let value = raw.get(&field.name).unwrap_or(&field.default);
        values.insert(field.name.clone(), field.check(value)?);
    }

    Ok(ParameterSet {
        algorithm: descriptor.name().to_string(),
        version: descriptor.version(),
        values,
    })
}

/// Upgrade values written under `version` to the descriptor's current schema
///
/// Migrations newer than `version` run in ascending order. A mapping already
/// at the current version is returned unchanged.
pub fn migrate(descriptor: &AlgorithmDescriptor, version: &Version, raw: ParameterMap) -> Result<ParameterMap> {
    let current = descriptor.version();
    if *version == current {
        return Ok(raw);
    }
    if *version > current || !descriptor.knows_version(version) {
        return Err(PartSegError::UnsupportedVersion {
            algorithm: descriptor.name().to_string(),
            version: version.to_string(),
        });
    }

    let mut values = raw;
    for migration in descriptor.migrations().iter().filter(|m| m.version > *version) {
        debug!(
            "Migrating parameters of `{}` to {}",
            descriptor.name(),
            migration.version
        );
        values = migration.apply(values);
    }
    Ok(values)
}

/// [`migrate`] (when a version is known) followed by [`build`]
pub fn build_versioned(
    descriptor: &AlgorithmDescriptor,
    version: Option<&Version>,
    raw: &ParameterMap,
) -> Result<ParameterSet> {
    match version {
        Some(version) => build(descriptor, &migrate(descriptor, version, raw.clone())?),
        None => build(descriptor, raw),
    }
}

/// Build a parameter map from name/value pairs
pub fn parameter_map<I, K, V>(pairs: I) -> ParameterMap
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<ParameterValue>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}
