//! String, choice and module-reference validators.

use std::collections::HashMap;
use std::sync::Mutex;

use regex::Regex;

use super::{constraint_str, constraint_usize, Constraints};
use crate::error::{Error, Result};
use crate::Value;

lazy_static::lazy_static! {
    // Patterns are compiled once per distinct source string.
    static ref PATTERNS: Mutex<HashMap<String, Regex>> = Mutex::new(HashMap::new());
}

/// Compile `pattern` anchored at both ends, caching the result.
fn compiled(pattern: &str) -> Result<Regex> {
    let mut cache = PATTERNS
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    if let Some(re) = cache.get(pattern) {
        return Ok(re.clone());
    }
    let re = Regex::new(&format!("^(?:{})$", pattern))
        .map_err(|e| Error::invalid_constraint(format!("invalid pattern: {}", e)))?;
    cache.insert(pattern.to_string(), re.clone());
    Ok(re)
}

pub(super) fn check_string_spec(constraints: &Constraints) -> Result<()> {
    let min = constraint_usize(constraints, "min_length")?;
    let max = constraint_usize(constraints, "max_length")?;
    if let (Some(min), Some(max)) = (min, max) {
        if min > max {
            return Err(Error::invalid_constraint(format!(
                "min_length {} is greater than max_length {}",
                min, max
            )));
        }
    }
    if let Some(pattern) = constraint_str(constraints, "pattern")? {
        compiled(pattern)?;
    }
    Ok(())
}

pub(super) fn check_string(value: &Value, constraints: &Constraints) -> Result<()> {
    let Some(s) = value.as_str() else {
        return Err(Error::type_error("string", value));
    };
    let len = s.chars().count();

    if let Some(min) = constraint_usize(constraints, "min_length")? {
        if len < min {
            return Err(Error::violation(format!(
                "length {} is below min_length {}",
                len, min
            )));
        }
    }
    if let Some(max) = constraint_usize(constraints, "max_length")? {
        if len > max {
            return Err(Error::violation(format!(
                "length {} is above max_length {}",
                len, max
            )));
        }
    }
    if let Some(pattern) = constraint_str(constraints, "pattern")? {
        if !compiled(pattern)?.is_match(s) {
            return Err(Error::violation(format!(
                "'{}' does not match pattern '{}'",
                s, pattern
            )));
        }
    }
    Ok(())
}

fn choices(constraints: &Constraints) -> Result<Vec<&str>> {
    let Some(list) = constraints.get("choices").and_then(Value::as_array) else {
        return Err(Error::invalid_constraint(
            "'choices' must be a list of strings",
        ));
    };
    list.iter()
        .map(|choice| {
            choice
                .as_str()
                .ok_or_else(|| Error::invalid_constraint("'choices' must be a list of strings"))
        })
        .collect()
}

pub(super) fn check_choice_spec(constraints: &Constraints) -> Result<()> {
    if choices(constraints)?.is_empty() {
        return Err(Error::invalid_constraint("'choices' must not be empty"));
    }
    Ok(())
}

pub(super) fn check_choice(value: &Value, constraints: &Constraints) -> Result<()> {
    let Some(s) = value.as_str() else {
        return Err(Error::type_error("string", value));
    };
    let allowed = choices(constraints)?;
    if !allowed.contains(&s) {
        return Err(Error::violation(format!(
            "'{}' is not one of [{}]",
            s,
            allowed.join(", ")
        )));
    }
    Ok(())
}
