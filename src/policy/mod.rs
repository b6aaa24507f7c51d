//! Policy Membrane
//!
//! Least-privilege filter over candidate content. A rule list is an ordered set
//! of predicate+effect pairs; the first rule whose roles intersect the
//! requester's and whose predicates all hold is applied, and its transforms
//! redact the content before it leaves the broker.

pub mod membrane;
pub mod redact;
pub mod requester;

pub use membrane::{effective_read_rules, DenialReason, PolicyMembrane, PolicyOutcome, RuleSet, ViewResolution};
pub use requester::Requester;

use crate::frame::validate::lookup_path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role that matches any requester.
pub const ANY_ROLE: &str = "*";

/// Which operation a rule governs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    #[default]
    Read,
    Write,
}

/// Requested policy view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyView {
    /// Content after redaction transforms.
    #[default]
    Effective,
    /// Content without redaction; admin capability only.
    Raw,
}

impl std::fmt::Display for PolicyView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyView::Effective => write!(f, "effective"),
            PolicyView::Raw => write!(f, "raw"),
        }
    }
}

/// Closed set of rule conditions. Predicates gate the rule; transforms always
/// hold and are applied to content when the rule is chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    PurposeIn { purposes: Vec<String> },
    FieldEquals { field: String, value: Value },
    FieldPresent { field: String },
    NotExpired,
    ViewIs { view: PolicyView },
    MaskField { field: String },
    DropField { field: String },
}

/// Inputs a predicate may inspect.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub requester: &'a Requester,
    pub view: PolicyView,
    pub content: Option<&'a Value>,
    pub expires_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

impl Condition {
    pub fn is_transform(&self) -> bool {
        matches!(self, Condition::MaskField { .. } | Condition::DropField { .. })
    }

    pub fn holds(&self, ctx: &EvalContext<'_>) -> bool {
        match self {
            Condition::PurposeIn { purposes } => ctx
                .requester
                .purpose
                .as_ref()
                .map_or(false, |p| purposes.iter().any(|allowed| allowed == p)),
            Condition::FieldEquals { field, value } => ctx
                .content
                .and_then(|content| lookup_path(content, field))
                .map_or(false, |actual| actual == value),
            Condition::FieldPresent { field } => ctx
                .content
                .and_then(|content| lookup_path(content, field))
                .map_or(false, |actual| !actual.is_null()),
            Condition::NotExpired => ctx.expires_at.map_or(true, |at| ctx.now < at),
            Condition::ViewIs { view } => ctx.view == *view,
            Condition::MaskField { .. } | Condition::DropField { .. } => true,
        }
    }
}

/// PolicyRule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub roles: Vec<String>,
    #[serde(default)]
    pub conds: Vec<Condition>,
    #[serde(default)]
    pub applies: Access,
}

impl PolicyRule {
    /// Read rule for the given roles, no conditions.
    pub fn for_roles<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PolicyRule {
            roles: roles.into_iter().map(Into::into).collect(),
            conds: Vec::new(),
            applies: Access::Read,
        }
    }

    pub fn with_cond(mut self, cond: Condition) -> Self {
        self.conds.push(cond);
        self
    }

    pub fn applies_to_roles(&self, requester: &Requester) -> bool {
        self.roles
            .iter()
            .any(|role| role == ANY_ROLE || requester.has_role(role))
    }

    /// Role intersection plus every predicate.
    pub fn matches(&self, ctx: &EvalContext<'_>) -> bool {
        self.applies_to_roles(ctx.requester) && self.conds.iter().all(|c| c.holds(ctx))
    }

    pub fn transforms(&self) -> impl Iterator<Item = &Condition> {
        self.conds.iter().filter(|c| c.is_transform())
    }
}
