//! Decomposition policy: decides whether a card is oversized and should be
//! split into subtasks before planning.

use serde::{Deserialize, Serialize};

/// Observable card facts the policy judges, read from the job payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CardFacts {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub checklist_items: usize,
}

/// Pluggable "should this card be decomposed" decision.
pub trait DecomposePolicy: Send + Sync {
    fn should_decompose(&self, facts: &CardFacts) -> bool;
}

/// Default policy: decompose when the description or checklist crosses a
/// size threshold.
#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    pub max_description_chars: usize,
    pub max_checklist_items: usize,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            max_description_chars: 2000,
            max_checklist_items: 8,
        }
    }
}

impl DecomposePolicy for ThresholdPolicy {
    fn should_decompose(&self, facts: &CardFacts) -> bool {
        facts.description.chars().count() > self.max_description_chars
            || facts.checklist_items > self.max_checklist_items
    }
}

/// Never decomposes; for job types that are already atomic.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverDecompose;

impl DecomposePolicy for NeverDecompose {
    fn should_decompose(&self, _facts: &CardFacts) -> bool {
        false
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn small_card_is_not_decomposed() {
        let policy = ThresholdPolicy::default();
        let facts = CardFacts {
            description: "fix the login button".into(),
            checklist_items: 2,
        };
        assert!(!policy.should_decompose(&facts));
    }

    #[test]
    fn long_description_triggers_decomposition() {
        let policy = ThresholdPolicy {
            max_description_chars: 10,
            max_checklist_items: 8,
        };
        let facts = CardFacts {
            description: "a much longer description".into(),
            checklist_items: 0,
        };
        assert!(policy.should_decompose(&facts));
    }

    #[test]
    fn checklist_size_triggers_decomposition() {
        let policy = ThresholdPolicy::default();
        let facts = CardFacts {
            description: String::new(),
            checklist_items: 9,
        };
        assert!(policy.should_decompose(&facts));
    }

    #[test]
    fn facts_deserialize_with_defaults() {
        let facts: CardFacts = serde_json::from_str("{}").unwrap();
        assert!(facts.description.is_empty());
        assert_eq!(facts.checklist_items, 0);
    }
}
