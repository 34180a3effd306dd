//! Float and integer validators.

use std::cmp::Ordering;

use super::{constraint_f64, Constraints};
use crate::error::{Error, Result};
use crate::Value;

const STEP_TOLERANCE: f64 = 1e-9;

/// 2^63, the first magnitude an `i64` cannot hold.
const I64_LIMIT: f64 = 9_223_372_036_854_775_808.0;

pub(super) fn coerce_float(raw: Value) -> Result<Value> {
    match raw {
        Value::Float(f) if f.is_finite() => Ok(Value::Float(f)),
        Value::Float(f) => Err(Error::violation(format!("{} is not a finite number", f))),
        Value::Integer(i) => Ok(Value::Float(i as f64)),
        other => Err(Error::type_error("float", &other)),
    }
}

pub(super) fn coerce_integer(raw: Value) -> Result<Value> {
    match raw {
        Value::Integer(_) => Ok(raw),
        // Whole numbers past i64 arrive as floats.
        Value::Float(f) if f.fract() == 0.0 && f.abs() >= I64_LIMIT => {
            Err(Error::type_error("integer within the i64 range", &raw))
        }
        other => Err(Error::type_error("integer", &other)),
    }
}

pub(super) fn check_spec(constraints: &Constraints) -> Result<()> {
    let min = constraint_f64(constraints, "min")?;
    let max = constraint_f64(constraints, "max")?;
    let step = constraint_f64(constraints, "step")?;

    if let (Some(min), Some(max)) = (min, max) {
        if min > max {
            return Err(Error::invalid_constraint(format!(
                "min {} is greater than max {}",
                min, max
            )));
        }
    }
    if let Some(step) = step {
        if !(step > 0.0 && step.is_finite()) {
            return Err(Error::invalid_constraint("step must be a positive number"));
        }
    }
    Ok(())
}

/// Integers compare exactly against integer bounds; anything else as `f64`.
fn compare(value: &Value, bound: Option<&Value>, v: f64, b: f64) -> Option<Ordering> {
    match (value, bound) {
        (Value::Integer(a), Some(Value::Integer(b))) => Some(a.cmp(b)),
        _ => v.partial_cmp(&b),
    }
}

pub(super) fn check_value(value: &Value, constraints: &Constraints) -> Result<()> {
    let Some(v) = value.as_f64() else {
        return Err(Error::type_error("number", value));
    };

    let min = constraint_f64(constraints, "min")?;
    let max = constraint_f64(constraints, "max")?;

    if let Some(min) = min {
        if compare(value, constraints.get("min"), v, min) == Some(Ordering::Less) {
            return Err(Error::violation(format!("{} is below minimum {}", v, min)));
        }
    }
    if let Some(max) = max {
        if compare(value, constraints.get("max"), v, max) == Some(Ordering::Greater) {
            return Err(Error::violation(format!("{} is above maximum {}", v, max)));
        }
    }

    // Step only applies when anchored to a minimum.
    if let (Some(min), Some(step)) = (min, constraint_f64(constraints, "step")?) {
        let steps = (v - min) / step;
        if (steps - steps.round()).abs() > STEP_TOLERANCE * steps.abs().max(1.0) {
            return Err(Error::violation(format!(
                "{} is not min {} plus a multiple of step {}",
                v, min, step
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(pairs: &[(&str, f64)]) -> Constraints {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::Float(*v)))
            .collect()
    }

    #[test]
    fn bounds_are_inclusive() {
        let bounds = c(&[("min", 0.0), ("max", 2.0)]);
        assert!(check_value(&Value::Float(0.0), &bounds).is_ok());
        assert!(check_value(&Value::Float(2.0), &bounds).is_ok());
        assert!(check_value(&Value::Float(2.0001), &bounds).is_err());
        assert!(check_value(&Value::Integer(-1), &bounds).is_err());
    }

    #[test]
    fn integer_out_of_range_names_the_range() {
        let big: Value = serde_json::from_str("18446744073709551615").unwrap();
        assert!(matches!(big, Value::Float(_)));
        match coerce_integer(big).unwrap_err() {
            Error::TypeError { expected, .. } => assert!(expected.contains("i64")),
            other => panic!("unexpected error: {other:?}"),
        }
        match coerce_integer(Value::Float(1.5)).unwrap_err() {
            Error::TypeError { expected, .. } => assert_eq!(expected, "integer"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn integer_bounds_compare_exactly() {
        let max = (1i64 << 53) as f64;
        let bounds: Constraints = [("max".to_string(), Value::Integer(1 << 53))]
            .into_iter()
            .collect();
        assert!(check_value(&Value::Integer(1 << 53), &bounds).is_ok());
        assert!(check_value(&Value::Integer((1 << 53) + 1), &bounds).is_err());
        // Float values still compare as floats.
        assert!(check_value(&Value::Float(max), &bounds).is_ok());
    }

    #[test]
    fn step_is_relative_to_min() {
        let stepped = c(&[("min", 0.1), ("step", 0.2)]);
        assert!(check_value(&Value::Float(0.5), &stepped).is_ok());
        assert!(check_value(&Value::Float(0.7000000000000001), &stepped).is_ok());
        assert!(check_value(&Value::Float(0.6), &stepped).is_err());
    }

    #[test]
    fn step_without_min_is_not_enforced() {
        let stepped = c(&[("step", 5.0)]);
        assert!(check_value(&Value::Integer(7), &stepped).is_ok());
    }

    #[test]
    fn spec_rejects_inverted_bounds_and_bad_step() {
        assert!(check_spec(&c(&[("min", 3.0), ("max", 1.0)])).is_err());
        assert!(check_spec(&c(&[("step", 0.0)])).is_err());
        assert!(check_spec(&c(&[("min", 1.0), ("max", 1.0), ("step", 0.5)])).is_ok());
    }

    #[test]
    fn float_rejects_non_finite() {
        assert!(coerce_float(Value::Float(f64::NAN)).is_err());
        assert!(coerce_float(Value::Float(f64::INFINITY)).is_err());
    }
}
