//! Resource limit parsing
//!
//! Turns the runner's CPU and memory strings into the `limits` map of a
//! container's `ResourceRequirements`.

use crate::error::{Error, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;

/// Key of the CPU limit
pub const RESOURCE_CPU: &str = "cpu";
/// Key of the memory limit
pub const RESOURCE_MEMORY: &str = "memory";

/// Parsed limits keyed by resource kind
pub type ResourceLimits = BTreeMap<String, Quantity>;

lazy_static! {
    // <sign><digits>[.<digits>][<binarySI>|<decimalExponent>|<decimalSI>]
    static ref QUANTITY_RE: Regex = Regex::new(
        r"^[+-]?(?:[0-9]+(?:\.[0-9]*)?|\.[0-9]+)(?:Ki|Mi|Gi|Ti|Pi|Ei|[eE][+-]?[0-9]+|[numkMGTPE])?$"
    )
    .expect("quantity pattern is valid");
}

/// Validate a single quantity string such as "100m" or "1.5Gi".
pub fn parse_quantity(raw: &str) -> Result<Quantity> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidQuantity {
            raw: raw.to_string(),
            message: "quantity must not be empty".to_string(),
        });
    }
    if !QUANTITY_RE.is_match(trimmed) {
        return Err(Error::InvalidQuantity {
            raw: raw.to_string(),
            message: "quantities must match the regular expression \
                      '^([+-]?[0-9.]+)([eEinumkKMGTP]*[-+]?[0-9]*)$'"
                .to_string(),
        });
    }
    Ok(Quantity(trimmed.to_string()))
}

/// Build the limit set for one container role.
///
/// Empty inputs leave their kind out entirely. Any malformed input fails the
/// whole call; nothing is substituted.
pub fn parse_limits(cpu: &str, memory: &str) -> Result<ResourceLimits> {
    let mut limits = ResourceLimits::new();

    for (kind, raw) in [(RESOURCE_CPU, cpu), (RESOURCE_MEMORY, memory)] {
        if raw.trim().is_empty() {
            continue;
        }
        limits.insert(kind.to_string(), parse_quantity(raw)?);
    }

    Ok(limits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    #[test]
    fn test_limits() {
        struct Case {
            cpu: &'static str,
            memory: &'static str,
            expected: Option<Vec<(&'static str, &'static str)>>,
        }

        let cases = [
            Case {
                cpu: "100m",
                memory: "100Mi",
                expected: Some(vec![(RESOURCE_CPU, "100m"), (RESOURCE_MEMORY, "100Mi")]),
            },
            Case {
                cpu: "100m",
                memory: "",
                expected: Some(vec![(RESOURCE_CPU, "100m")]),
            },
            Case {
                cpu: "",
                memory: "100Mi",
                expected: Some(vec![(RESOURCE_MEMORY, "100Mi")]),
            },
            Case {
                cpu: "100j",
                memory: "",
                expected: None,
            },
            Case {
                cpu: "",
                memory: "100j",
                expected: None,
            },
            Case {
                cpu: "",
                memory: "",
                expected: Some(vec![]),
            },
        ];

        for case in cases {
            let result = parse_limits(case.cpu, case.memory);
            match case.expected {
                Some(expected) => {
                    let expected: ResourceLimits = expected
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), q(v)))
                        .collect();
                    assert_eq!(result.unwrap(), expected, "cpu={:?} memory={:?}", case.cpu, case.memory);
                }
                None => {
                    assert!(result.is_err(), "cpu={:?} memory={:?}", case.cpu, case.memory);
                }
            }
        }
    }

    #[test]
    fn parse_error_carries_raw_input() {
        match parse_limits("100j", "") {
            Err(Error::InvalidQuantity { raw, message }) => {
                assert_eq!(raw, "100j");
                assert!(!message.is_empty());
            }
            other => panic!("expected InvalidQuantity, got {other:?}"),
        }
    }

    #[test]
    fn accepts_standard_notations() {
        for raw in ["1", "0.5", ".5", "2", "250m", "1Gi", "128974848", "129e6", "129M", "1E3", "+1k", "1.5Ti", "100n"] {
            assert!(parse_quantity(raw).is_ok(), "{raw} should parse");
        }
    }

    #[test]
    fn rejects_garbage() {
        for raw in ["Mi", "1..5", "1 Gi", "1KiB", "abc", "1mi", "-", "1e"] {
            assert!(parse_quantity(raw).is_err(), "{raw} should not parse");
        }
    }
}
