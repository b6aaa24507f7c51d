//! Context Bundles
//!
//! The canonical evidence unit. A bundle is created once (by ingestion or by a
//! transform) and never mutated in place; corrections are new bundles that
//! name their predecessors in `lineage.parents`.

pub mod arena;
pub mod content;
pub mod id;
pub mod persistence;
pub mod store;

pub use arena::BundleArena;
pub use content::{ContentSource, InMemoryContentSource};
pub use persistence::SledBundleStore;
pub use store::BundleStore;

use crate::policy::PolicyRule;
use crate::types::BundleId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use unicode_normalization::UnicodeNormalization;

/// Frame binding. `version` is frozen when the bundle is validated and persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

/// Bundle payload: inline typed JSON, or an opaque external reference
/// located by `refs.content_ref`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum BundleContent {
    Inline(Value),
    Reference,
}

/// Where a bundle came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Explicit domain tag; wins over the uri host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl Origin {
    pub fn from_uri(uri: impl Into<String>) -> Self {
        Origin {
            uri: Some(uri.into()),
            domain: None,
        }
    }

    pub fn from_domain(domain: impl Into<String>) -> Self {
        Origin {
            uri: None,
            domain: Some(domain.into()),
        }
    }

    /// Diversity unit for support counting.
    pub fn domain(&self) -> Option<String> {
        if let Some(tag) = self.domain.as_deref() {
            return Some(normalize_domain(tag)).filter(|d| !d.is_empty());
        }
        self.uri
            .as_deref()
            .and_then(uri_host)
            .map(normalize_domain)
            .filter(|d| !d.is_empty())
    }
}

/// Record of the transform that produced a derived bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRecord {
    pub kind: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lineage {
    #[serde(default)]
    pub origin: Origin,
    #[serde(default)]
    pub parents: Vec<BundleId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<TransformRecord>,
}

/// Per-bundle access policy. Rules are evaluated top-to-bottom, first match wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BundlePolicy {
    #[serde(default)]
    pub read: Vec<PolicyRule>,
    #[serde(default)]
    pub write: Vec<PolicyRule>,
    #[serde(default)]
    pub purposes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Semantics {
    #[serde(default)]
    pub keywords: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<String>,
}

impl Semantics {
    /// NFKC-normalized, lowercased, trimmed keywords; empties removed.
    pub fn normalized(&self) -> Semantics {
        Semantics {
            keywords: self
                .keywords
                .iter()
                .map(|k| k.nfkc().collect::<String>().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            embedding: self.embedding.clone(),
        }
    }
}

/// Named confidence levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    Exploratory,
    Working,
    Validated,
}

impl ConfidenceLevel {
    pub fn score(self) -> f64 {
        match self {
            ConfidenceLevel::Exploratory => 0.3,
            ConfidenceLevel::Working => 0.6,
            ConfidenceLevel::Validated => 0.9,
        }
    }
}

/// Confidence floor: a number in [0,1] or a named level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Confidence {
    Score(f64),
    Level(ConfidenceLevel),
}

impl Confidence {
    pub fn value(self) -> f64 {
        match self {
            Confidence::Score(score) => score,
            Confidence::Level(level) => level.score(),
        }
    }
}

/// Declared statistical floor. Absent fields fall back to the next layer
/// (request → bundle → frame default → zero).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_separation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_support: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
}

impl ResolutionLimits {
    /// Fill absent fields from `fallback`; present fields win.
    pub fn or(self, fallback: ResolutionLimits) -> ResolutionLimits {
        ResolutionLimits {
            min_separation: self.min_separation.or(fallback.min_separation),
            min_support: self.min_support.or(fallback.min_support),
            confidence: self.confidence.or(fallback.confidence),
        }
    }

    pub fn min_support_or_zero(&self) -> u32 {
        self.min_support.unwrap_or(0)
    }

    pub fn min_separation_or_zero(&self) -> f64 {
        self.min_separation.unwrap_or(0.0)
    }

    pub fn confidence_or_zero(&self) -> f64 {
        self.confidence.map(Confidence::value).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplainNote {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRefs {
    /// Hex BLAKE3 of the content bytes.
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_ref: Option<String>,
}

/// ContextBundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub id: BundleId,
    #[serde(default = "default_version")]
    pub version: u32,
    pub frame: FrameRef,
    pub content: BundleContent,
    #[serde(default)]
    pub lineage: Lineage,
    #[serde(default)]
    pub policy: BundlePolicy,
    #[serde(default)]
    pub semantics: Semantics,
    #[serde(default)]
    pub resolution: ResolutionLimits,
    #[serde(default)]
    pub explain: ExplainNote,
    pub refs: ContentRefs,
}

fn default_version() -> u32 {
    1
}

impl ContextBundle {
    /// Create a bundle with inline content and a freshly computed content hash.
    pub fn inline(frame: impl Into<String>, content: Value) -> Self {
        let content_hash = id::inline_content_hash_hex(&content);
        ContextBundle {
            id: BundleId::generate(),
            version: default_version(),
            frame: FrameRef {
                name: frame.into(),
                version: None,
            },
            content: BundleContent::Inline(content),
            lineage: Lineage::default(),
            policy: BundlePolicy::default(),
            semantics: Semantics::default(),
            resolution: ResolutionLimits::default(),
            explain: ExplainNote::default(),
            refs: ContentRefs {
                content_hash,
                content_ref: None,
            },
        }
    }

    /// Create a bundle whose content lives behind `content_ref`.
    pub fn referenced(
        frame: impl Into<String>,
        content_ref: impl Into<String>,
        content_bytes: &[u8],
    ) -> Self {
        let mut bundle = ContextBundle::inline(frame, Value::Null);
        bundle.content = BundleContent::Reference;
        bundle.refs = ContentRefs {
            content_hash: hex::encode(id::compute_content_hash(content_bytes)),
            content_ref: Some(content_ref.into()),
        };
        bundle
    }

    pub fn with_id(mut self, id: impl Into<BundleId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.lineage.origin = origin;
        self
    }

    pub fn with_parents(mut self, parents: Vec<BundleId>) -> Self {
        self.lineage.parents = parents;
        self
    }

    pub fn with_read_rules(mut self, rules: Vec<PolicyRule>) -> Self {
        self.policy.read = rules;
        self
    }

    pub fn with_resolution(mut self, resolution: ResolutionLimits) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.semantics.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    /// Inline payload, if any.
    pub fn inline_content(&self) -> Option<&Value> {
        match &self.content {
            BundleContent::Inline(value) => Some(value),
            BundleContent::Reference => None,
        }
    }

    pub fn origin_domain(&self) -> Option<String> {
        self.lineage.origin.domain()
    }
}

/// Host part of a uri: scheme, userinfo, port, and path are stripped.
pub fn uri_host(uri: &str) -> Option<&str> {
    let rest = match uri.find("://") {
        Some(idx) => &uri[idx + 3..],
        None => uri,
    };
    let authority = rest.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit('@').next()?;
    let host = match host_port.rfind(':') {
        Some(idx) if !host_port.ends_with(']') => &host_port[..idx],
        _ => host_port,
    };
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// NFKC, lowercase, trim, and strip one leading `www.`.
pub fn normalize_domain(raw: &str) -> String {
    let normalized: String = raw.nfkc().collect::<String>().trim().to_lowercase();
    normalized
        .strip_prefix("www.")
        .map(str::to_string)
        .unwrap_or(normalized)
}
