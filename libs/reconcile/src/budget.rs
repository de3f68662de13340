//! Disruption budget for proactive updates.

use std::num::ParseIntError;

use vmfleet_api::IntOrPercent;

/// Resolve `maxUnavailable` against `total` replicas.
///
/// Unset means `"100%"`. Percentages are floored and the result is never
/// below one, so a rollout always makes progress.
pub fn max_unavailable_int(value: Option<&IntOrPercent>, total: i32) -> Result<i32, ParseIntError> {
    let resolved = match value {
        Some(v) => v.scaled_value(total)?,
        None => IntOrPercent::default().scaled_value(total)?,
    };
    Ok(resolved.max(1))
}

/// Remaining number of disruptive updates allowed in one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisruptionBudget {
    remaining: i32,
}

impl DisruptionBudget {
    /// Budget of `max_unavailable - unavailable`, floored at zero.
    pub fn new(max_unavailable: i32, unavailable: i32) -> Self {
        Self {
            remaining: (max_unavailable - unavailable).max(0),
        }
    }

    /// Consume one unit; false once exhausted.
    pub fn try_take(&mut self) -> bool {
        if self.remaining > 0 {
            self.remaining -= 1;
            true
        } else {
            false
        }
    }

    /// Disruptions still allowed.
    pub fn remaining(&self) -> i32 {
        self.remaining
    }

    /// Whether no further disruption is allowed.
    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}
