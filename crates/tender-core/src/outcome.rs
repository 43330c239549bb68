//! Structured answer of the enqueue operations.
//!
//! Expected business conditions (queue disabled, invalid input, duplicate
//! work) are reported here. Only infrastructure failures, such as a publish
//! that fails after every retry, surface as [`Error`](crate::Error).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnqueueErrorKind {
    /// The target queue is not configured.
    Disabled,
    /// Equivalent work is already queued or done.
    Duplicate,
    /// The request failed validation.
    Invalid,
}

/// Outcome of an enqueue call, optionally carrying what the caller should
/// see next (a status snapshot, a computed vector).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueOutcome<T = ()> {
    pub enqueued: bool,
    pub error_kind: Option<EnqueueErrorKind>,
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
}

impl<T> EnqueueOutcome<T> {
    pub fn enqueued(value: T) -> Self {
        Self {
            enqueued: true,
            error_kind: None,
            message: None,
            value: Some(value),
        }
    }

    pub fn rejected(kind: EnqueueErrorKind, message: impl Into<String>) -> Self {
        Self {
            enqueued: false,
            error_kind: Some(kind),
            message: Some(message.into()),
            value: None,
        }
    }

    /// Attach a value to a rejection.
    pub fn with_value(mut self, value: T) -> Self {
        self.value = Some(value);
        self
    }

    pub fn is_rejected(&self) -> bool {
        self.error_kind.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serializes_camel_case() {
        let rejected: EnqueueOutcome = EnqueueOutcome::rejected(EnqueueErrorKind::Invalid, "bad");
        assert_eq!(
            serde_json::to_value(&rejected).unwrap(),
            serde_json::json!({"enqueued": false, "errorKind": "Invalid", "message": "bad"})
        );
        assert!(rejected.is_rejected());

        let enqueued = EnqueueOutcome::enqueued(7);
        assert_eq!(
            serde_json::to_value(&enqueued).unwrap(),
            serde_json::json!({"enqueued": true, "errorKind": null, "message": null, "value": 7})
        );
    }

    #[test]
    fn test_rejection_can_carry_value() {
        let outcome = EnqueueOutcome::rejected(EnqueueErrorKind::Duplicate, "already done")
            .with_value("Completed");
        assert!(!outcome.enqueued);
        assert_eq!(outcome.value, Some("Completed"));
    }
}
