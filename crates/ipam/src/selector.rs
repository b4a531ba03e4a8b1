//! Label selector matching for pool affinities.

use crate::error::IpamError;
use crds::{LabelSelector, LabelSelectorRequirement};
use std::collections::BTreeMap;

/// Whether `labels` satisfy `selector`.
///
/// An empty selector matches everything. An unknown operator is a
/// configuration error, not a mismatch.
pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> Result<bool, IpamError> {
    for (key, value) in &selector.match_labels {
        if labels.get(key) != Some(value) {
            return Ok(false);
        }
    }

    for requirement in &selector.match_expressions {
        if !requirement_matches(requirement, labels)? {
            return Ok(false);
        }
    }

    Ok(true)
}

fn requirement_matches(
    requirement: &LabelSelectorRequirement,
    labels: &BTreeMap<String, String>,
) -> Result<bool, IpamError> {
    let value = labels.get(&requirement.key);
    match requirement.operator.as_str() {
        "In" => Ok(value.is_some_and(|v| requirement.values.contains(v))),
        "NotIn" => Ok(value.is_none_or(|v| !requirement.values.contains(v))),
        "Exists" => Ok(value.is_some()),
        "DoesNotExist" => Ok(value.is_none()),
        other => Err(IpamError::WrongInput(format!(
            "unsupported label selector operator {other} for key {}",
            requirement.key
        ))),
    }
}
