//! JSON encoding of parameter values.
//!
//! Plain values map to plain JSON. Structured values are written as an object
//! carrying a class marker:
//!
//! ```json
//! {"__class__": "Channel", "__values__": {"value": 0}}
//! ```
//!
//! Decoding walks the document bottom-up and rebuilds every marked object it
//! recognises. Objects with an unknown marker are kept as plain mappings.

use log::warn;
use serde_json::{Map, Value};

use crate::channel::Channel;
use crate::error::{PartSegError, Result};
use crate::mask::MaskProperty;
use crate::parameters::{AlgorithmChoice, ParameterMap, ParameterValue, Version};

pub const CLASS_KEY: &str = "__class__";
pub const VALUES_KEY: &str = "__values__";
pub const VERSION_KEY: &str = "__version__";

const CHANNEL_CLASS: &str = "Channel";
const CHOICE_CLASS: &str = "AlgorithmChoice";
const MASK_PROPERTY_CLASS: &str = "MaskProperty";

pub fn encode_value(value: &ParameterValue) -> Value {
    match value {
        ParameterValue::Null => Value::Null,
        ParameterValue::Bool(v) => Value::Bool(*v),
        ParameterValue::Int(v) => Value::from(*v),
        ParameterValue::Float(v) => Value::from(*v),
        ParameterValue::Text(v) => Value::String(v.clone()),
        ParameterValue::Channel(channel) => encode_channel(channel),
        ParameterValue::MaskProperty(property) => encode_mask_property(property),
        ParameterValue::Algorithm(choice) => encode_choice(choice),
        ParameterValue::List(items) => Value::Array(items.iter().map(encode_value).collect()),
        ParameterValue::Mapping(map) => encode_map(map),
    }
}

pub fn encode_map(map: &ParameterMap) -> Value {
    Value::Object(map.iter().map(|(k, v)| (k.clone(), encode_value(v))).collect())
}

pub fn encode_choice(choice: &AlgorithmChoice) -> Value {
    let mut values = Map::new();
    values.insert("name".to_string(), Value::String(choice.name.clone()));
    values.insert("values".to_string(), encode_map(&choice.values));
    marked(CHOICE_CLASS, choice.version.as_ref(), Value::Object(values))
}

pub fn encode_channel(channel: &Channel) -> Value {
    let value = match channel {
        Channel::Index(index) => Value::from(*index),
        Channel::Name(name) => Value::String(name.clone()),
    };
    let mut values = Map::new();
    values.insert("value".to_string(), value);
    marked(CHANNEL_CLASS, None, Value::Object(values))
}

pub fn encode_mask_property(property: &MaskProperty) -> Value {
    let values = serde_json::to_value(property).unwrap_or(Value::Null);
    marked(MASK_PROPERTY_CLASS, None, values)
}

fn marked(class: &str, version: Option<&Version>, values: Value) -> Value {
    let mut object = Map::new();
    object.insert(CLASS_KEY.to_string(), Value::String(class.to_string()));
    if let Some(version) = version {
        object.insert(VERSION_KEY.to_string(), Value::String(version.to_string()));
    }
    object.insert(VALUES_KEY.to_string(), values);
    Value::Object(object)
}

/// Decode a JSON document, rebuilding marked objects
pub fn decode_value(value: Value) -> ParameterValue {
    match value {
        Value::Null => ParameterValue::Null,
        Value::Bool(v) => ParameterValue::Bool(v),
        Value::Number(n) => match n.as_i64() {
            Some(v) => ParameterValue::Int(v),
            None => ParameterValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(v) => ParameterValue::Text(v),
        Value::Array(items) => ParameterValue::List(items.into_iter().map(decode_value).collect()),
        Value::Object(object) => {
            let map = object.into_iter().map(|(k, v)| (k, decode_value(v))).collect();
            decode_hook(map)
        }
    }
}

/// Decode a JSON object into a parameter map
pub fn decode_map(value: Value) -> Result<ParameterMap> {
    match decode_value(value) {
        ParameterValue::Mapping(map) => Ok(map),
        other => Err(PartSegError::Json(format!("expected a parameter mapping, got {other}"))),
    }
}

/// Rebuild one object whose children are already decoded
///
/// Unrecognised or malformed markers leave the object as a mapping.
pub fn decode_hook(object: ParameterMap) -> ParameterValue {
    let Some(class) = object.get(CLASS_KEY).and_then(ParameterValue::as_str) else {
        return ParameterValue::Mapping(object);
    };
    let decoded = match class {
        CHANNEL_CLASS => decode_channel(&object).map(ParameterValue::Channel),
        CHOICE_CLASS => decode_choice(&object).map(ParameterValue::Algorithm),
        MASK_PROPERTY_CLASS => decode_mask_property(&object).map(ParameterValue::MaskProperty),
        other => {
            warn!("Unknown class marker `{other}`, keeping plain mapping");
            None
        }
    };
    decoded.unwrap_or(ParameterValue::Mapping(object))
}

fn marked_values(object: &ParameterMap) -> Option<&ParameterMap> {
    match object.get(VALUES_KEY)? {
        ParameterValue::Mapping(values) => Some(values),
        _ => None,
    }
}

fn decode_channel(object: &ParameterMap) -> Option<Channel> {
    match marked_values(object)?.get("value")? {
        ParameterValue::Int(index) => usize::try_from(*index).ok().map(Channel::Index),
        ParameterValue::Text(name) => Some(Channel::Name(name.clone())),
        _ => None,
    }
}

fn decode_choice(object: &ParameterMap) -> Option<AlgorithmChoice> {
    let values = marked_values(object)?;
    let name = values.get("name")?.as_str()?;
    let parameters = match values.get("values") {
        Some(ParameterValue::Mapping(map)) => map.clone(),
        None | Some(ParameterValue::Null) => ParameterMap::new(),
        Some(_) => return None,
    };
    let version = match object.get(VERSION_KEY) {
        Some(ParameterValue::Text(text)) => Some(text.parse().ok()?),
        _ => None,
    };
    Some(AlgorithmChoice {
        name: name.to_string(),
        version,
        values: parameters,
    })
}

fn decode_mask_property(object: &ParameterMap) -> Option<MaskProperty> {
    serde_json::from_value(encode_map(marked_values(object)?)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::RadiusType;
    use crate::parameters::parameter_map;
    use serde_json::json;

    #[test]
    fn test_channel_marker() {
        let encoded = encode_value(&ParameterValue::Channel(Channel::Index(1)));
        assert_eq!(encoded, json!({"__class__": "Channel", "__values__": {"value": 1}}));
        assert_eq!(decode_value(encoded), ParameterValue::Channel(Channel::Index(1)));
    }

    #[test]
    fn test_nested_choice_keeps_version_and_float() {
        let inner = AlgorithmChoice::new(
            "Manual",
            parameter_map([("threshold", ParameterValue::Float(8000.0))]),
        )
        .with_version(Version::new(0, 0, 1));
        let outer = parameter_map([
            ("threshold", ParameterValue::Algorithm(inner)),
            ("channel", ParameterValue::Channel(Channel::from("GFP"))),
        ]);
        let text = serde_json::to_string(&encode_map(&outer)).unwrap();
        let decoded = decode_map(serde_json::from_str(&text).unwrap()).unwrap();
        assert_eq!(decoded, outer);
    }

    #[test]
    fn test_mask_property_marker() {
        let property = MaskProperty {
            dilate: RadiusType::R3D,
            dilate_radius: 2,
            ..MaskProperty::default()
        };
        let decoded = decode_value(encode_mask_property(&property));
        assert_eq!(decoded, ParameterValue::MaskProperty(property));
    }

    #[test]
    fn test_unknown_marker_passes_through() {
        let raw = json!({"__class__": "PartSegCore.Unknown", "__values__": {"a": 1}});
        match decode_value(raw) {
            ParameterValue::Mapping(map) => {
                assert_eq!(map.get(CLASS_KEY), Some(&ParameterValue::from("PartSegCore.Unknown")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_malformed_channel_kept_as_mapping() {
        let raw = json!({"__class__": "Channel", "__values__": {"value": -3}});
        assert!(matches!(decode_value(raw), ParameterValue::Mapping(_)));
    }

    #[test]
    fn test_decode_map_rejects_scalar() {
        assert!(decode_map(json!(3)).is_err());
    }
}
