use std::fmt;

use serde::{Deserialize, Serialize};

/// Reference to one image channel, by index or by name
///
/// Distinguishes "choose a channel" parameters from plain numbers so that the
/// value can be bounded by the channel count of the loaded image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Channel {
    Index(usize),
    Name(String),
}

impl Channel {
    /// Resolve to a channel index given the image's channel names
    pub fn resolve(&self, channel_names: &[String]) -> Option<usize> {
        match self {
            Self::Index(index) => (*index < channel_names.len()).then_some(*index),
            Self::Name(name) => channel_names.iter().position(|n| n == name),
        }
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::Index(0)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // shown 1-based, like in the channel selector
            Self::Index(index) => write!(f, "{}", index + 1),
            Self::Name(name) => f.write_str(name),
        }
    }
}

impl From<usize> for Channel {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl From<&str> for Channel {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Channel::Index(0).to_string(), "1");
        assert_eq!(Channel::from("DAPI").to_string(), "DAPI");
    }

    #[test]
    fn test_resolve() {
        let names = vec!["DAPI".to_string(), "GFP".to_string()];
        assert_eq!(Channel::Index(1).resolve(&names), Some(1));
        assert_eq!(Channel::Index(2).resolve(&names), None);
        assert_eq!(Channel::from("GFP").resolve(&names), Some(1));
        assert_eq!(Channel::from("RFP").resolve(&names), None);
    }
}
