//! Confirmation Gate
//!
//! Destructive operations ask a gate first and do nothing without a yes.

use crate::projection::Granularity;
use crate::targets::TargetKind;
use serde::Serialize;

/// What the caller is about to destroy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationPrompt {
    pub action: String,
    pub targets: Vec<TargetKind>,
    pub granularity: Granularity,
    pub options: Vec<Granularity>,
}

impl ConfirmationPrompt {
    pub fn teardown(targets: &[TargetKind], granularity: Granularity) -> Self {
        let what = match granularity {
            Granularity::Data => "remove all projected data from",
            Granularity::Structure => "drop every projected structure in",
        };
        let names: Vec<&str> = targets.iter().map(TargetKind::as_str).collect();
        Self {
            action: format!("{} {}", what, names.join(", ")),
            targets: targets.to_vec(),
            granularity,
            options: Granularity::ALL.to_vec(),
        }
    }

    /// Prompt for an action on the canonical store itself
    pub fn source(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            targets: Vec::new(),
            granularity: Granularity::Structure,
            options: vec![Granularity::Structure],
        }
    }
}

pub trait ConfirmationGate: Send + Sync {
    fn confirm(&self, prompt: &ConfirmationPrompt) -> bool;
}

/// A decision the caller already made, e.g. a `confirm` request flag
#[derive(Debug, Clone, Copy)]
pub struct Decision(pub bool);

impl ConfirmationGate for Decision {
    fn confirm(&self, _prompt: &ConfirmationPrompt) -> bool {
        self.0
    }
}

/// Refuses everything
#[cfg(test)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Deny;

#[cfg(test)]
impl ConfirmationGate for Deny {
    fn confirm(&self, _prompt: &ConfirmationPrompt) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_names_targets_and_options() {
        let prompt = ConfirmationPrompt::teardown(&[TargetKind::Graph, TargetKind::Cache], Granularity::Structure);
        assert_eq!(prompt.action, "drop every projected structure in graph, cache");
        assert_eq!(prompt.options, vec![Granularity::Data, Granularity::Structure]);
        assert!(!Deny.confirm(&prompt));
        assert!(Decision(true).confirm(&prompt));
    }
}
