//! Integer-or-percentage values (e.g. `maxUnavailable`).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Either an absolute count or a percentage string such as `"25%"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntOrPercent {
    Int(i32),
    Percent(String),
}

impl IntOrPercent {
    /// Resolve against `total`.
    ///
    /// Percentages are floored (`total * pct / 100`) and saturate at the
    /// `i32` bounds. A string without a trailing `%` is still read as a
    /// percentage.
    pub fn scaled_value(&self, total: i32) -> Result<i32, std::num::ParseIntError> {
        match self {
            Self::Int(v) => Ok(*v),
            Self::Percent(s) => {
                let pct: i64 = s.trim_end_matches('%').trim().parse()?;
                let scaled = i64::from(total).saturating_mul(pct) / 100;
                Ok(i32::try_from(scaled).unwrap_or(if scaled < 0 { i32::MIN } else { i32::MAX }))
            }
        }
    }
}

impl Default for IntOrPercent {
    fn default() -> Self {
        Self::Percent("100%".to_string())
    }
}

impl fmt::Display for IntOrPercent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Percent(s) => f.write_str(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(IntOrPercent::Int(3), 10, 3)]
    #[case(IntOrPercent::Percent("25%".into()), 10, 2)]
    #[case(IntOrPercent::Percent("100%".into()), 7, 7)]
    #[case(IntOrPercent::Percent("5%".into()), 10, 0)]
    #[case(IntOrPercent::Percent("50".into()), 4, 2)]
    fn test_scaled_value(#[case] value: IntOrPercent, #[case] total: i32, #[case] expected: i32) {
        assert_eq!(value.scaled_value(total).unwrap(), expected);
    }

    #[rstest]
    #[case("100000000000%", i32::MAX, i32::MAX)]
    #[case("-100000000000%", i32::MAX, i32::MIN)]
    fn test_scaled_value_saturates(#[case] pct: &str, #[case] total: i32, #[case] expected: i32) {
        let value = IntOrPercent::Percent(pct.into());
        assert_eq!(value.scaled_value(total).unwrap(), expected);
    }

    #[test]
    fn test_invalid_percentage() {
        assert!(IntOrPercent::Percent("abc%".into()).scaled_value(10).is_err());
    }

    #[test]
    fn test_deserialize_both_forms() {
        let v: IntOrPercent = serde_json::from_str("2").unwrap();
        assert_eq!(v, IntOrPercent::Int(2));
        let v: IntOrPercent = serde_json::from_str("\"30%\"").unwrap();
        assert_eq!(v, IntOrPercent::Percent("30%".into()));
    }
}
