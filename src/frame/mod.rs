//! Frames
//!
//! A frame is a named, versioned schema for bundles: required fields, field
//! validators, and the resolution/policy defaults filled into bundles that
//! omit them. A frame version is immutable once registered.

pub mod registry;
pub mod validate;

pub use registry::{FrameRegistry, InMemoryFrameRegistry};
pub use validate::{validate, ValidBundle};

use crate::bundle::ResolutionLimits;
use crate::error::FrameError;
use crate::policy::PolicyRule;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A validator regex, compiled when the frame definition is built or parsed.
#[derive(Clone)]
pub struct Pattern(regex::Regex);

impl Pattern {
    pub fn new(source: &str) -> Result<Self, regex::Error> {
        regex::Regex::new(source).map(Pattern)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.0.is_match(value)
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.as_str()).finish()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Pattern::new(&source)
            .map_err(|e| serde::de::Error::custom(format!("invalid pattern '{}': {}", source, e)))
    }
}

/// Closed set of field validators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ValidatorRule {
    /// Value must be one of the listed strings.
    OneOf { values: Vec<String> },
    /// Strings must be non-blank; arrays and objects non-empty.
    NonEmpty,
    /// String must match the regex.
    Pattern { regex: Pattern },
    /// String must be an RFC 3339 timestamp or an ISO-8601 date.
    IsoDate,
    /// Array must hold at least `min` items.
    MinItems { min: usize },
    /// Number must fall within the inclusive bounds.
    NumberRange {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
}

/// A validator bound to a dotted field path (e.g. `content.status`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValidator {
    pub field: String,
    #[serde(flatten)]
    pub rule: ValidatorRule,
}

/// Values merged into bundles that omit them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameDefaults {
    #[serde(default)]
    pub resolution: ResolutionLimits,
    #[serde(default)]
    pub read: Vec<PolicyRule>,
    #[serde(default)]
    pub purposes: Vec<String>,
}

/// Frame definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameDef {
    pub name: String,
    pub version: u32,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub validators: Vec<FieldValidator>,
    #[serde(default)]
    pub defaults: FrameDefaults,
    /// Registry policy name; the frame name when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
}

impl FrameDef {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        FrameDef {
            name: name.into(),
            version,
            required: Vec::new(),
            validators: Vec::new(),
            defaults: FrameDefaults::default(),
            policy: None,
        }
    }

    pub fn require(mut self, field: impl Into<String>) -> Self {
        self.required.push(field.into());
        self
    }

    pub fn validator(mut self, field: impl Into<String>, rule: ValidatorRule) -> Self {
        self.validators.push(FieldValidator {
            field: field.into(),
            rule,
        });
        self
    }

    /// Add a `pattern` validator, compiling `regex` now.
    pub fn pattern(self, field: impl Into<String>, regex: &str) -> Result<Self, FrameError> {
        let regex = Pattern::new(regex).map_err(|e| FrameError::InvalidDefinition {
            name: self.name.clone(),
            message: format!("invalid pattern: {}", e),
        })?;
        Ok(self.validator(field, ValidatorRule::Pattern { regex }))
    }

    pub fn with_defaults(mut self, defaults: FrameDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Name under which the registry holds this frame's policy.
    pub fn policy_name(&self) -> &str {
        self.policy.as_deref().unwrap_or(&self.name)
    }

    /// Structural checks on the definition itself.
    pub fn check(&self) -> Result<(), FrameError> {
        if self.name.trim().is_empty() {
            return Err(FrameError::InvalidDefinition {
                name: self.name.clone(),
                message: "frame name cannot be empty".to_string(),
            });
        }
        Ok(())
    }
}
