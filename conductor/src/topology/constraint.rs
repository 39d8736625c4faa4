//! Component host-count constraints.
//!
//! Accepted forms: `[n]`, `["+"]`, `["odd"]`, `[min, max]`, `[min, "+"]`,
//! `[min, "odd"]`.

use anyhow::{anyhow, Result};
use std::fmt;

use crate::catalog::definition::ConstraintItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpperBound {
    Count(u64),
    Unbounded,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostConstraint {
    Exact(u64),
    /// Component must be on every host of the cluster
    AllHosts,
    Range { min: u64, max: UpperBound },
}

fn count(item: &ConstraintItem) -> Result<u64> {
    match item {
        ConstraintItem::Count(n) if *n >= 0 => Ok(*n as u64),
        other => Err(anyhow!("expected a non-negative count, got {}", other)),
    }
}

impl HostConstraint {
    pub fn parse(items: &[ConstraintItem]) -> Result<Self> {
        match items {
            [ConstraintItem::Keyword(k)] if k == "+" => Ok(HostConstraint::AllHosts),
            [ConstraintItem::Keyword(k)] if k == "odd" => Ok(HostConstraint::Range {
                min: 1,
                max: UpperBound::Odd,
            }),
            [single] => Ok(HostConstraint::Exact(count(single)?)),
            [min, ConstraintItem::Keyword(k)] if k == "+" => Ok(HostConstraint::Range {
                min: count(min)?,
                max: UpperBound::Unbounded,
            }),
            [min, ConstraintItem::Keyword(k)] if k == "odd" => Ok(HostConstraint::Range {
                min: count(min)?,
                max: UpperBound::Odd,
            }),
            [min, max] => {
                let min = count(min)?;
                let max = count(max)?;
                if max < min {
                    return Err(anyhow!("upper bound {} is below lower bound {}", max, min));
                }
                Ok(HostConstraint::Range {
                    min,
                    max: UpperBound::Count(max),
                })
            }
            _ => Err(anyhow!("constraint must have one or two items")),
        }
    }

    /// Check `mapped` host count against the constraint; `total` is the
    /// number of hosts attached to the cluster.
    pub fn check(&self, mapped: u64, total: u64) -> Result<(), String> {
        match *self {
            HostConstraint::Exact(n) if mapped != n => {
                Err(format!("requires exactly {} hosts, mapped {}", n, mapped))
            }
            HostConstraint::AllHosts if mapped != total => Err(format!(
                "must be mapped on all {} cluster hosts, mapped {}",
                total, mapped
            )),
            HostConstraint::Range { min, .. } if mapped < min => Err(format!(
                "requires at least {} hosts, mapped {}",
                min, mapped
            )),
            HostConstraint::Range {
                max: UpperBound::Count(max),
                ..
            } if mapped > max => Err(format!(
                "allows at most {} hosts, mapped {}",
                max, mapped
            )),
            HostConstraint::Range {
                max: UpperBound::Odd,
                ..
            } if mapped != 0 && mapped % 2 == 0 => {
                Err(format!("requires an odd number of hosts, mapped {}", mapped))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for HostConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostConstraint::Exact(n) => write!(f, "[{}]", n),
            HostConstraint::AllHosts => write!(f, "[+]"),
            HostConstraint::Range { min, max } => match max {
                UpperBound::Count(max) => write!(f, "[{}, {}]", min, max),
                UpperBound::Unbounded => write!(f, "[{}, +]", min),
                UpperBound::Odd => write!(f, "[{}, odd]", min),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(items: serde_json::Value) -> HostConstraint {
        let items: Vec<ConstraintItem> = serde_json::from_value(items).unwrap();
        HostConstraint::parse(&items).unwrap()
    }

    #[rstest]
    #[case(serde_json::json!([1]), 1, 3, true)]
    #[case(serde_json::json!([1]), 2, 3, false)]
    #[case(serde_json::json!(["+"]), 3, 3, true)]
    #[case(serde_json::json!(["+"]), 2, 3, false)]
    #[case(serde_json::json!(["odd"]), 0, 3, false)]
    #[case(serde_json::json!(["odd"]), 3, 3, true)]
    #[case(serde_json::json!([0, "odd"]), 0, 3, true)]
    #[case(serde_json::json!([0, "odd"]), 2, 3, false)]
    #[case(serde_json::json!([1, "+"]), 0, 3, false)]
    #[case(serde_json::json!([1, "+"]), 5, 5, true)]
    #[case(serde_json::json!([0, 1]), 2, 3, false)]
    fn test_check(
        #[case] items: serde_json::Value,
        #[case] mapped: u64,
        #[case] total: u64,
        #[case] ok: bool,
    ) {
        assert_eq!(parse(items).check(mapped, total).is_ok(), ok);
    }

    #[test]
    fn test_rejects_malformed() {
        let items: Vec<ConstraintItem> =
            serde_json::from_value(serde_json::json!([3, 1])).unwrap();
        assert!(HostConstraint::parse(&items).is_err());
        assert!(HostConstraint::parse(&[]).is_err());
    }
}
