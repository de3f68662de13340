//! Status conditions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tri-state condition status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A single observation about an object's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition<T> {
    #[serde(rename = "type")]
    pub type_: T,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl<T> Condition<T> {
    /// A `True` condition stamped with the current time.
    pub fn now(type_: T, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_,
            status: ConditionStatus::True,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Some(Utc::now()),
        }
    }
}

/// Lookup helpers over a condition list.
pub trait Conditions<T> {
    /// Returns true if a condition of this type is present.
    fn has_condition(&self, type_: &T) -> bool;

    /// Returns true if a condition of this type is present with `status`.
    fn has_condition_with_status(&self, type_: &T, status: ConditionStatus) -> bool;

    /// Returns true if a condition of this type has both `status` and `reason`.
    fn has_condition_with_reason(&self, type_: &T, status: ConditionStatus, reason: &str)
        -> bool;

    /// Insert or replace the condition of the same type.
    fn update_condition(&mut self, condition: Condition<T>);

    /// Remove all conditions of this type.
    fn remove_condition(&mut self, type_: &T);
}

impl<T: PartialEq> Conditions<T> for Vec<Condition<T>> {
    fn has_condition(&self, type_: &T) -> bool {
        self.iter().any(|c| &c.type_ == type_)
    }

    fn has_condition_with_status(&self, type_: &T, status: ConditionStatus) -> bool {
        self.iter().any(|c| &c.type_ == type_ && c.status == status)
    }

    fn has_condition_with_reason(
        &self,
        type_: &T,
        status: ConditionStatus,
        reason: &str,
    ) -> bool {
        self.iter()
            .any(|c| &c.type_ == type_ && c.status == status && c.reason == reason)
    }

    fn update_condition(&mut self, condition: Condition<T>) {
        match self.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => *existing = condition,
            None => self.push(condition),
        }
    }

    fn remove_condition(&mut self, type_: &T) {
        self.retain(|c| &c.type_ != type_);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Kind {
        A,
        B,
    }

    #[test]
    fn test_update_replaces_same_type() {
        let mut conds = vec![Condition::now(Kind::A, "r1", "m1")];
        conds.update_condition(Condition::now(Kind::A, "r2", "m2"));
        conds.update_condition(Condition::now(Kind::B, "r3", "m3"));

        assert_eq!(conds.len(), 2);
        assert_eq!(conds[0].reason, "r2");
        assert!(conds.has_condition_with_reason(&Kind::B, ConditionStatus::True, "r3"));
    }

    #[test]
    fn test_remove_condition() {
        let mut conds = vec![Condition::now(Kind::A, "", ""), Condition::now(Kind::B, "", "")];
        conds.remove_condition(&Kind::A);
        assert!(!conds.has_condition(&Kind::A));
        assert!(conds.has_condition_with_status(&Kind::B, ConditionStatus::True));
    }
}
