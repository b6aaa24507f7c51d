//! Rule evaluation and redaction for one candidate.

use crate::bundle::ContextBundle;
use crate::frame::{FrameDef, FrameRegistry};
use crate::policy::redact::{drop_path, mask_path};
use crate::policy::{Access, Condition, EvalContext, PolicyRule, PolicyView, Requester};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Policy class recorded for expiry denials.
pub const EXPIRY_CLASS: &str = "expiry";
/// Policy class recorded for purpose-tag denials.
pub const PURPOSE_CLASS: &str = "purpose";

/// Read rules in force for one bundle, with the policy name used in denial classes.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet {
    pub name: String,
    pub rules: Vec<PolicyRule>,
}

impl RuleSet {
    pub fn read_class(&self) -> String {
        format!("{}/read", self.name)
    }
}

/// Pick the effective read rules: the bundle's own, else the registry policy
/// for the frame, else the frame defaults.
pub fn effective_read_rules(
    bundle: &ContextBundle,
    frame: Option<&FrameDef>,
    registry: &dyn FrameRegistry,
) -> RuleSet {
    let name = frame
        .map(|f| f.policy_name().to_string())
        .unwrap_or_else(|| bundle.frame.name.clone());
    let rules = if !bundle.policy.read.is_empty() {
        bundle.policy.read.clone()
    } else if let Some(rules) = registry.get_policy(&name).filter(|r| !r.is_empty()) {
        rules
    } else {
        frame.map(|f| f.defaults.read.clone()).unwrap_or_default()
    };
    RuleSet { name, rules }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    NoMatchingRule,
    Expired,
    Purpose,
}

/// Result of authorizing one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyOutcome {
    Allowed {
        content: Option<Value>,
        /// Paths masked or dropped, in rule order.
        redacted_fields: Vec<String>,
        /// `None` when the bundle carries no read rules.
        policy_class: Option<String>,
        raw: bool,
    },
    Denied {
        policy_class: String,
        reason: DenialReason,
    },
}

impl PolicyOutcome {
    pub fn is_denied(&self) -> bool {
        matches!(self, PolicyOutcome::Denied { .. })
    }

    pub fn is_redacted(&self) -> bool {
        matches!(self, PolicyOutcome::Allowed { redacted_fields, .. } if !redacted_fields.is_empty())
    }

    pub fn policy_class(&self) -> Option<&str> {
        match self {
            PolicyOutcome::Allowed { policy_class, .. } => policy_class.as_deref(),
            PolicyOutcome::Denied { policy_class, .. } => Some(policy_class),
        }
    }
}

/// The view a request is actually served under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewResolution {
    pub view: PolicyView,
    pub downgraded: bool,
}

#[derive(Debug, Clone)]
pub struct PolicyMembrane {
    admin_capability: String,
}

impl PolicyMembrane {
    pub fn new(admin_capability: impl Into<String>) -> Self {
        PolicyMembrane {
            admin_capability: admin_capability.into(),
        }
    }

    /// `raw` requires the admin capability; otherwise it is served as `effective`.
    pub fn resolve_view(&self, requester: &Requester, requested: PolicyView) -> ViewResolution {
        match requested {
            PolicyView::Raw if !requester.has_capability(&self.admin_capability) => {
                debug!(requester = %requester.id, "Raw view downgraded to effective");
                ViewResolution {
                    view: PolicyView::Effective,
                    downgraded: true,
                }
            }
            view => ViewResolution {
                view,
                downgraded: false,
            },
        }
    }

    /// Authorize one candidate's content for `requester` under `view`.
    ///
    /// `view` must already be resolved through [`PolicyMembrane::resolve_view`].
    pub fn authorize(
        &self,
        bundle: &ContextBundle,
        content: Option<Value>,
        rule_set: &RuleSet,
        requester: &Requester,
        view: PolicyView,
        now: DateTime<Utc>,
    ) -> PolicyOutcome {
        if bundle.policy.expires_at.map_or(false, |at| at <= now) {
            return PolicyOutcome::Denied {
                policy_class: EXPIRY_CLASS.to_string(),
                reason: DenialReason::Expired,
            };
        }
        let purposes = &bundle.policy.purposes;
        if !purposes.is_empty()
            && !requester
                .purpose
                .as_ref()
                .map_or(false, |p| purposes.contains(p))
        {
            return PolicyOutcome::Denied {
                policy_class: PURPOSE_CLASS.to_string(),
                reason: DenialReason::Purpose,
            };
        }

        let read_rules: Vec<&PolicyRule> = rule_set
            .rules
            .iter()
            .filter(|rule| rule.applies == Access::Read)
            .collect();
        if read_rules.is_empty() {
            return PolicyOutcome::Allowed {
                content,
                redacted_fields: Vec::new(),
                policy_class: None,
                raw: view == PolicyView::Raw,
            };
        }

        let ctx = EvalContext {
            requester,
            view,
            content: content.as_ref(),
            expires_at: bundle.policy.expires_at,
            now,
        };
        let Some(rule) = read_rules.into_iter().find(|rule| rule.matches(&ctx)) else {
            return PolicyOutcome::Denied {
                policy_class: rule_set.read_class(),
                reason: DenialReason::NoMatchingRule,
            };
        };

        let raw = view == PolicyView::Raw;
        let mut content = content;
        let mut redacted_fields = Vec::new();
        if !raw {
            if let Some(value) = content.as_mut() {
                for transform in rule.transforms() {
                    let applied = match transform {
                        Condition::MaskField { field } => mask_path(value, field).then(|| field),
                        Condition::DropField { field } => drop_path(value, field).then(|| field),
                        _ => None,
                    };
                    if let Some(field) = applied {
                        redacted_fields.push(field.clone());
                    }
                }
            }
        }
        PolicyOutcome::Allowed {
            content,
            redacted_fields,
            policy_class: Some(rule_set.read_class()),
            raw,
        }
    }
}
