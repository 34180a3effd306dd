//! Type registry: one validator per variable type tag.
//!
//! Types form a closed set. Adding a type means adding a [`VarType`] variant,
//! its tag in the lookup table, and the arms in `coerce`/`check_value`/
//! `check_spec`.
//!
//! Validation is split in two steps:
//!
//! - [`VarType::coerce`] checks the value's kind and performs the only
//!   implicit conversion the store allows (integer to float for float-typed
//!   fields, including embedding components and float tensors).
//! - [`VarType::check_value`] checks a coerced value against the variable's
//!   constraint map.
//!
//! [`VarType::check_spec`] validates the constraint map itself, once, when a
//! variable is registered.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::Value;

mod numeric;
mod text;
mod vector;

/// Type-specific constraint map, e.g. `{min, max}` or `{choices}`.
pub type Constraints = BTreeMap<String, Value>;

/// The declared type of a variable. Immutable after registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum VarType {
    Float,
    Integer,
    String,
    Boolean,
    /// A string drawn from the `choices` constraint.
    Choice,
    /// The name of a module drawn from `choices`. Never loaded or called.
    Module,
    /// A fixed-length vector of floats.
    Embedding,
    /// A shaped numeric array: `{shape, data, dtype}`.
    Tensor,
}

lazy_static::lazy_static! {
    static ref TYPE_TAGS: BTreeMap<&'static str, VarType> = {
        let mut tags = BTreeMap::new();
        tags.insert("float", VarType::Float);
        tags.insert("integer", VarType::Integer);
        tags.insert("int", VarType::Integer);
        tags.insert("string", VarType::String);
        tags.insert("boolean", VarType::Boolean);
        tags.insert("bool", VarType::Boolean);
        tags.insert("choice", VarType::Choice);
        tags.insert("module", VarType::Module);
        tags.insert("module_reference", VarType::Module);
        tags.insert("embedding", VarType::Embedding);
        tags.insert("tensor", VarType::Tensor);
        tags
    };
}

/// Lookup table from type tags to validators.
pub struct TypeRegistry;

impl TypeRegistry {
    /// Resolve a tag (case-insensitive, `-` and `_` interchangeable).
    pub fn lookup(tag: &str) -> Result<VarType> {
        let normalized = tag.trim().to_ascii_lowercase().replace('-', "_");
        TYPE_TAGS
            .get(normalized.as_str())
            .copied()
            .ok_or_else(|| Error::UnknownType(tag.to_string()))
    }

    /// All registered tags, aliases included.
    pub fn tags() -> impl Iterator<Item = &'static str> {
        TYPE_TAGS.keys().copied()
    }

    /// `Validate(type, raw_value) -> coerced_value`.
    pub fn validate(tag: &str, raw: Value) -> Result<Value> {
        Self::lookup(tag)?.coerce(raw)
    }

    /// `ValidateConstraints(type, value, constraints)`.
    pub fn validate_constraints(tag: &str, value: &Value, constraints: &Constraints) -> Result<()> {
        let var_type = Self::lookup(tag)?;
        var_type.check_spec(constraints)?;
        var_type.check_value(value, constraints)
    }
}

impl VarType {
    /// Canonical tag.
    pub fn tag(&self) -> &'static str {
        match self {
            VarType::Float => "float",
            VarType::Integer => "integer",
            VarType::String => "string",
            VarType::Boolean => "boolean",
            VarType::Choice => "choice",
            VarType::Module => "module",
            VarType::Embedding => "embedding",
            VarType::Tensor => "tensor",
        }
    }

    /// Check the value's kind and apply the allowed coercions.
    pub fn coerce(&self, raw: Value) -> Result<Value> {
        match self {
            VarType::Float => numeric::coerce_float(raw),
            VarType::Integer => numeric::coerce_integer(raw),
            VarType::String | VarType::Choice | VarType::Module => match raw {
                Value::String(_) => Ok(raw),
                other => Err(Error::type_error(self.tag(), &other)),
            },
            VarType::Boolean => match raw {
                Value::Bool(_) => Ok(raw),
                other => Err(Error::type_error("boolean", &other)),
            },
            VarType::Embedding => vector::coerce_embedding(raw),
            VarType::Tensor => vector::coerce_tensor(raw),
        }
    }

    /// Check an already-coerced value against the constraint map.
    pub fn check_value(&self, value: &Value, constraints: &Constraints) -> Result<()> {
        match self {
            VarType::Float | VarType::Integer => numeric::check_value(value, constraints),
            VarType::String => text::check_string(value, constraints),
            VarType::Choice | VarType::Module => text::check_choice(value, constraints),
            VarType::Boolean => Ok(()),
            VarType::Embedding => vector::check_embedding(value, constraints),
            VarType::Tensor => vector::check_tensor(value, constraints),
        }
    }

    /// Check that the constraint map is well-formed for this type.
    pub fn check_spec(&self, constraints: &Constraints) -> Result<()> {
        match self {
            VarType::Float | VarType::Integer => numeric::check_spec(constraints),
            VarType::String => text::check_string_spec(constraints),
            VarType::Choice | VarType::Module => text::check_choice_spec(constraints),
            VarType::Boolean => Ok(()),
            VarType::Embedding => vector::check_embedding_spec(constraints),
            VarType::Tensor => vector::check_tensor_spec(constraints),
        }
    }

    /// Coerce then check constraints.
    pub fn validate(&self, raw: Value, constraints: &Constraints) -> Result<Value> {
        let value = self.coerce(raw)?;
        self.check_value(&value, constraints)?;
        Ok(value)
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for VarType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TypeRegistry::lookup(s)
    }
}

impl TryFrom<String> for VarType {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        TypeRegistry::lookup(&s)
    }
}

// Shared accessors for constraint maps.

pub(crate) fn constraint_f64(constraints: &Constraints, key: &str) -> Result<Option<f64>> {
    match constraints.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| Error::invalid_constraint(format!("'{}' must be a number", key))),
    }
}

pub(crate) fn constraint_usize(constraints: &Constraints, key: &str) -> Result<Option<usize>> {
    match constraints.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Integer(n)) if *n >= 0 => Ok(Some(*n as usize)),
        Some(_) => Err(Error::invalid_constraint(format!(
            "'{}' must be a non-negative integer",
            key
        ))),
    }
}

pub(crate) fn constraint_bool(constraints: &Constraints, key: &str) -> Result<Option<bool>> {
    match constraints.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(Error::invalid_constraint(format!(
            "'{}' must be a boolean",
            key
        ))),
    }
}

pub(crate) fn constraint_str<'a>(constraints: &'a Constraints, key: &str) -> Result<Option<&'a str>> {
    match constraints.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(Error::invalid_constraint(format!(
            "'{}' must be a string",
            key
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constraints(pairs: &[(&str, Value)]) -> Constraints {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn lookup_accepts_aliases() {
        assert_eq!(TypeRegistry::lookup("float").unwrap(), VarType::Float);
        assert_eq!(TypeRegistry::lookup("Int").unwrap(), VarType::Integer);
        assert_eq!(
            TypeRegistry::lookup("module-reference").unwrap(),
            VarType::Module
        );
        assert_eq!(
            TypeRegistry::lookup("quaternion").unwrap_err(),
            Error::UnknownType("quaternion".into())
        );
    }

    #[test]
    fn integers_widen_to_float_only() {
        assert_eq!(
            TypeRegistry::validate("float", Value::from(2)).unwrap(),
            Value::Float(2.0)
        );
        assert!(matches!(
            TypeRegistry::validate("integer", Value::from(2.0)),
            Err(Error::TypeError { .. })
        ));
        assert!(matches!(
            TypeRegistry::validate("string", Value::from(1)),
            Err(Error::TypeError { .. })
        ));
        assert!(matches!(
            TypeRegistry::validate("boolean", Value::from("true")),
            Err(Error::TypeError { .. })
        ));
    }

    #[test]
    fn validate_constraints_checks_spec_and_value() {
        let c = constraints(&[("min", Value::from(0.0)), ("max", Value::from(2.0))]);
        assert!(TypeRegistry::validate_constraints("float", &Value::from(0.7), &c).is_ok());
        assert!(matches!(
            TypeRegistry::validate_constraints("float", &Value::from(3.0), &c),
            Err(Error::ConstraintViolation { .. })
        ));

        let bad = constraints(&[("min", Value::from("zero"))]);
        assert!(matches!(
            TypeRegistry::validate_constraints("float", &Value::from(1.0), &bad),
            Err(Error::InvalidConstraint { .. })
        ));
    }

    #[test]
    fn serde_uses_tags() {
        let t: VarType = serde_json::from_str("\"module_reference\"").unwrap();
        assert_eq!(t, VarType::Module);
        assert_eq!(serde_json::to_string(&VarType::Embedding).unwrap(), "\"embedding\"");
        assert!(serde_json::from_str::<VarType>("\"blob\"").is_err());
    }

    #[test]
    fn boolean_ignores_constraints() {
        let c = constraints(&[("anything", Value::from(1))]);
        assert!(VarType::Boolean.validate(Value::from(true), &c).is_ok());
    }
}
