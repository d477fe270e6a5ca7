//! Node selector and required node affinity evaluation.
//!
//! Only a pool's representative labels are known at planning time, so
//! field selectors are evaluated against a node whose name is empty.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
};

use crate::error::MatchError;

/// The only field a node field selector may reference.
const NODE_NAME_FIELD: &str = "metadata.name";

/// Reports whether a workload may schedule onto a node carrying `node_labels`.
///
/// The plain `node_selector` must match exactly, and when the affinity has a
/// required-during-scheduling selector at least one of its terms must match.
pub fn matches(
    node_labels: &BTreeMap<String, String>,
    node_affinity: Option<&NodeAffinity>,
    node_selector: Option<&BTreeMap<String, String>>,
) -> Result<bool, MatchError> {
    if let Some(selector) = node_selector {
        let selected = selector
            .iter()
            .all(|(key, value)| node_labels.get(key) == Some(value));
        if !selected {
            return Ok(false);
        }
    }

    match node_affinity.and_then(|a| a.required_during_scheduling_ignored_during_execution.as_ref()) {
        Some(required) => match_node_selector(node_labels, required),
        None => Ok(true),
    }
}

/// Terms are OR'd. A malformed term is skipped; its error is only returned
/// when no other term matched.
pub fn match_node_selector(
    node_labels: &BTreeMap<String, String>,
    selector: &NodeSelector,
) -> Result<bool, MatchError> {
    let mut errors = Vec::new();

    for term in &selector.node_selector_terms {
        match match_term(node_labels, term) {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(err) => errors.push(err),
        }
    }

    match errors.len() {
        0 => Ok(false),
        1 => Err(errors.remove(0)),
        _ => Err(MatchError::Terms(
            errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        )),
    }
}

fn match_term(
    node_labels: &BTreeMap<String, String>,
    term: &NodeSelectorTerm,
) -> Result<bool, MatchError> {
    let expressions = term.match_expressions.as_deref().unwrap_or_default();
    let fields = term.match_fields.as_deref().unwrap_or_default();

    // An empty term selects nothing.
    if expressions.is_empty() && fields.is_empty() {
        return Ok(false);
    }

    // Validate everything before evaluating so a malformed requirement
    // later in the term is not hidden by an earlier mismatch.
    let mut matched = true;
    for requirement in expressions {
        if !match_label_requirement(node_labels, requirement)? {
            matched = false;
        }
    }
    for requirement in fields {
        if !match_field_requirement("", requirement)? {
            matched = false;
        }
    }
    Ok(matched)
}

fn values(requirement: &NodeSelectorRequirement) -> &[String] {
    requirement.values.as_deref().unwrap_or_default()
}

fn match_label_requirement(
    node_labels: &BTreeMap<String, String>,
    requirement: &NodeSelectorRequirement,
) -> Result<bool, MatchError> {
    let key = requirement.key.as_str();
    let values = values(requirement);
    let label = node_labels.get(key);

    match requirement.operator.as_str() {
        "In" => {
            require_values(requirement, values, "at least one")?;
            Ok(label.is_some_and(|l| values.contains(l)))
        }
        "NotIn" => {
            require_values(requirement, values, "at least one")?;
            Ok(label.is_none_or(|l| !values.contains(l)))
        }
        "Exists" => {
            require_no_values(requirement, values)?;
            Ok(label.is_some())
        }
        "DoesNotExist" => {
            require_no_values(requirement, values)?;
            Ok(label.is_none())
        }
        op @ ("Gt" | "Lt") => {
            let bound = single_integer(requirement, values)?;
            // A label that is not an integer never satisfies Gt/Lt.
            let Some(actual) = label.and_then(|l| l.parse::<i64>().ok()) else {
                return Ok(false);
            };
            Ok(if op == "Gt" {
                actual > bound
            } else {
                actual < bound
            })
        }
        other => Err(MatchError::InvalidOperator {
            key: key.to_string(),
            operator: other.to_string(),
        }),
    }
}

fn match_field_requirement(
    node_name: &str,
    requirement: &NodeSelectorRequirement,
) -> Result<bool, MatchError> {
    if requirement.key != NODE_NAME_FIELD {
        return Err(MatchError::UnsupportedField(requirement.key.clone()));
    }
    let values = values(requirement);

    match requirement.operator.as_str() {
        "In" => {
            require_exactly_one(requirement, values)?;
            Ok(values[0] == node_name)
        }
        "NotIn" => {
            require_exactly_one(requirement, values)?;
            Ok(values[0] != node_name)
        }
        other => Err(MatchError::InvalidOperator {
            key: requirement.key.clone(),
            operator: other.to_string(),
        }),
    }
}

fn require_values(
    requirement: &NodeSelectorRequirement,
    values: &[String],
    expected: &'static str,
) -> Result<(), MatchError> {
    if values.is_empty() {
        return Err(value_count_error(requirement, expected, 0));
    }
    Ok(())
}

fn require_no_values(
    requirement: &NodeSelectorRequirement,
    values: &[String],
) -> Result<(), MatchError> {
    if !values.is_empty() {
        return Err(value_count_error(requirement, "no", values.len()));
    }
    Ok(())
}

fn require_exactly_one(
    requirement: &NodeSelectorRequirement,
    values: &[String],
) -> Result<(), MatchError> {
    if values.len() != 1 {
        return Err(value_count_error(requirement, "exactly one", values.len()));
    }
    Ok(())
}

fn single_integer(
    requirement: &NodeSelectorRequirement,
    values: &[String],
) -> Result<i64, MatchError> {
    require_exactly_one(requirement, values)?;
    values[0]
        .parse::<i64>()
        .map_err(|_| MatchError::NonIntegerValue {
            key: requirement.key.clone(),
            operator: requirement.operator.clone(),
            value: values[0].clone(),
        })
}

fn value_count_error(
    requirement: &NodeSelectorRequirement,
    expected: &'static str,
    got: usize,
) -> MatchError {
    MatchError::InvalidValueCount {
        key: requirement.key.clone(),
        operator: requirement.operator.clone(),
        expected,
        got,
    }
}
