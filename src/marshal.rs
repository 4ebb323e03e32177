//! Parameter Marshaller
//!
//! Converts wire parameters (opaque strings) into call-ready [`Argument`]s.
//! The decode path is chosen by the declared parameter type, never by the
//! shape of the raw value:
//!
//! - built-in types pass the raw literal through untouched (after checking it
//!   is admissible for the declared kind);
//! - structured types decode the raw value as a JSON object; an empty raw
//!   value becomes a no-value argument.

use thiserror::Error;

use crate::module::{Argument, TypeRef, Value};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarshalError {
    #[error("parameter count mismatch: expected {expected}, provided {provided}")]
    ParameterCountMismatch { expected: usize, provided: usize },

    #[error("cannot convert parameter {index} to '{expected}' from raw value '{raw}': {cause}")]
    ParameterConversion {
        index: usize,
        expected: String,
        raw: String,
        cause: String,
    },
}

/// Build typed arguments for a declared signature
pub fn marshal(declared: &[TypeRef], raw: &[String]) -> Result<Vec<Argument>, MarshalError> {
    if declared.len() != raw.len() {
        return Err(MarshalError::ParameterCountMismatch {
            expected: declared.len(),
            provided: raw.len(),
        });
    }

    declared
        .iter()
        .zip(raw)
        .enumerate()
        .map(|(index, (ty, value))| {
            marshal_one(ty, value).map_err(|cause| MarshalError::ParameterConversion {
                index,
                expected: ty.name(),
                raw: value.clone(),
                cause,
            })
        })
        .collect()
}

fn marshal_one(ty: &TypeRef, raw: &str) -> Result<Argument, String> {
    match ty {
        TypeRef::Void => Err("parameters cannot be declared void".to_string()),
        TypeRef::Primitive(kind) => {
            kind.admits(raw)?;
            Ok(Argument::Raw(raw.to_string()))
        }
        TypeRef::Struct(_) => {
            if raw.trim().is_empty() {
                return Ok(Argument::Struct(None));
            }
            let json: serde_json::Value =
                serde_json::from_str(raw).map_err(|e| format!("malformed encoding: {}", e))?;
            match ty.decode_json(&json)? {
                Value::Struct(s) => Ok(Argument::Struct(Some(s))),
                // An explicit JSON `null` is the same as an empty value
                Value::Null => Ok(Argument::Struct(None)),
                other => Err(format!("decoded to a non-structure value {}", other)),
            }
        }
    }
}
