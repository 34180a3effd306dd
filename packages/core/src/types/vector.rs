//! Embedding and tensor validators.
//!
//! A tensor value is a map `{shape: [usize], data: [..], dtype: str}` with
//! `data` stored flat in row-major order. `dtype` defaults to `float32`.

use std::collections::BTreeMap;

use super::{constraint_bool, constraint_str, constraint_usize, Constraints};
use crate::error::{Error, Result};
use crate::Value;

const NORM_TOLERANCE: f64 = 1e-4;
const DEFAULT_DTYPE: &str = "float32";
const DTYPES: &[&str] = &[
    "float16", "float32", "float64", "int8", "int16", "int32", "int64", "bool",
];

#[derive(Clone, Copy, PartialEq)]
enum Element {
    Float,
    Int,
    Bool,
}

fn element_of(dtype: &str) -> Result<Element> {
    match dtype {
        "float16" | "float32" | "float64" => Ok(Element::Float),
        "int8" | "int16" | "int32" | "int64" => Ok(Element::Int),
        "bool" => Ok(Element::Bool),
        other => Err(Error::violation(format!(
            "unsupported dtype '{}' (expected one of {})",
            other,
            DTYPES.join(", ")
        ))),
    }
}

fn coerce_float_item(item: Value, what: &str) -> Result<Value> {
    match item {
        Value::Float(f) if f.is_finite() => Ok(Value::Float(f)),
        Value::Integer(i) => Ok(Value::Float(i as f64)),
        other => Err(Error::type_error(format!("{} of floats", what), &other)),
    }
}

pub(super) fn coerce_embedding(raw: Value) -> Result<Value> {
    match raw {
        Value::Array(items) => items
            .into_iter()
            .map(|item| coerce_float_item(item, "embedding"))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        other => Err(Error::type_error("embedding", &other)),
    }
}

pub(super) fn check_embedding_spec(constraints: &Constraints) -> Result<()> {
    if constraint_usize(constraints, "dimensions")? == Some(0) {
        return Err(Error::invalid_constraint("dimensions must be positive"));
    }
    constraint_bool(constraints, "normalize")?;
    Ok(())
}

pub(super) fn check_embedding(value: &Value, constraints: &Constraints) -> Result<()> {
    let Some(items) = value.as_array() else {
        return Err(Error::type_error("embedding", value));
    };
    if let Some(dims) = constraint_usize(constraints, "dimensions")? {
        if items.len() != dims {
            return Err(Error::violation(format!(
                "embedding has {} dimensions, expected {}",
                items.len(),
                dims
            )));
        }
    }
    if constraint_bool(constraints, "normalize")? == Some(true) {
        let norm = items
            .iter()
            .filter_map(Value::as_f64)
            .map(|x| x * x)
            .sum::<f64>()
            .sqrt();
        if (norm - 1.0).abs() > NORM_TOLERANCE {
            return Err(Error::violation(format!(
                "embedding is not unit-normalized (norm {:.6})",
                norm
            )));
        }
    }
    Ok(())
}

fn shape_of(value: &Value) -> Result<Vec<usize>> {
    let Some(dims) = value.as_array() else {
        return Err(Error::type_error("tensor shape", value));
    };
    dims.iter()
        .map(|d| match d {
            Value::Integer(n) => usize::try_from(*n)
                .map_err(|_| Error::type_error("non-negative integer dimension", d)),
            other => Err(Error::type_error("non-negative integer dimension", other)),
        })
        .collect()
}

pub(super) fn coerce_tensor(raw: Value) -> Result<Value> {
    let mut map = match raw {
        Value::Map(map) => map,
        other => return Err(Error::type_error("tensor", &other)),
    };
    let shape = shape_of(map.get("shape").unwrap_or(&Value::Null))?;

    let dtype = match map.remove("dtype") {
        None | Some(Value::Null) => DEFAULT_DTYPE.to_string(),
        Some(Value::String(s)) => s,
        Some(other) => return Err(Error::type_error("dtype string", &other)),
    };
    let element = element_of(&dtype)?;

    let data = match map.remove("data") {
        Some(Value::Array(items)) => items,
        Some(other) => return Err(Error::type_error("tensor data array", &other)),
        None => return Err(Error::violation("tensor is missing 'data'")),
    };

    let expected = shape
        .iter()
        .try_fold(1usize, |acc, d| acc.checked_mul(*d))
        .ok_or_else(|| Error::violation(format!("tensor shape {:?} is too large", shape)))?;
    if data.len() != expected {
        return Err(Error::violation(format!(
            "tensor data has {} elements, shape {:?} needs {}",
            data.len(),
            shape,
            expected
        )));
    }

    let data = data
        .into_iter()
        .map(|item| match (element, item) {
            (Element::Float, item) => coerce_float_item(item, "tensor"),
            (Element::Int, item @ Value::Integer(_)) => Ok(item),
            (Element::Bool, item @ Value::Bool(_)) => Ok(item),
            (_, other) => Err(Error::type_error(format!("{} element", dtype), &other)),
        })
        .collect::<Result<Vec<_>>>()?;

    let mut tensor = BTreeMap::new();
    tensor.insert(
        "shape".to_string(),
        Value::Array(shape.into_iter().map(|d| Value::Integer(d as i64)).collect()),
    );
    tensor.insert("data".to_string(), Value::Array(data));
    tensor.insert("dtype".to_string(), Value::String(dtype));
    Ok(Value::Map(tensor))
}

/// Declared shape; `-1` marks a free dimension.
fn declared_shape(constraints: &Constraints) -> Result<Option<Vec<Option<usize>>>> {
    match constraints.get("shape") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(dims)) => dims
            .iter()
            .map(|d| match d {
                Value::Integer(-1) => Ok(None),
                Value::Integer(n) if *n >= 0 => Ok(Some(*n as usize)),
                _ => Err(Error::invalid_constraint(
                    "shape dimensions must be non-negative integers or -1",
                )),
            })
            .collect::<Result<Vec<_>>>()
            .map(Some),
        Some(_) => Err(Error::invalid_constraint("'shape' must be a list")),
    }
}

pub(super) fn check_tensor_spec(constraints: &Constraints) -> Result<()> {
    declared_shape(constraints)?;
    if let Some(dtype) = constraint_str(constraints, "dtype")? {
        element_of(dtype).map_err(|_| {
            Error::invalid_constraint(format!("unsupported dtype '{}'", dtype))
        })?;
    }
    Ok(())
}

pub(super) fn check_tensor(value: &Value, constraints: &Constraints) -> Result<()> {
    let shape = shape_of(value.get("shape").unwrap_or(&Value::Null))?;

    if let Some(declared) = declared_shape(constraints)? {
        let matches = declared.len() == shape.len()
            && declared
                .iter()
                .zip(&shape)
                .all(|(want, got)| want.map_or(true, |w| w == *got));
        if !matches {
            return Err(Error::violation(format!(
                "tensor shape {:?} does not match declared shape",
                shape
            )));
        }
    }

    if let Some(dtype) = constraint_str(constraints, "dtype")? {
        let actual = value.get("dtype").and_then(Value::as_str).unwrap_or(DEFAULT_DTYPE);
        if actual != dtype {
            return Err(Error::violation(format!(
                "tensor dtype '{}' does not match declared '{}'",
                actual, dtype
            )));
        }
    }
    Ok(())
}
