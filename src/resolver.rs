//! Method Resolver
//!
//! Finds a (type, method) pair inside a loaded module and snapshots its
//! signature. Lookup is by name only. When several methods share a name, the
//! first public one in declaration order wins; if every candidate is private
//! the method is reported as not invocable.

use std::fmt;

use thiserror::Error;

use crate::module::{Constructor, MethodBody, MethodDef, Module, TypeDef, TypeRef, Visibility};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("type '{type_name}' not found in module '{module}'")]
    TypeNotFound { module: String, type_name: String },

    #[error("method '{method}' not found on type '{type_name}'")]
    MethodNotFound { type_name: String, method: String },

    #[error("method '{type_name}.{method}' is not invocable: {reason}")]
    MethodNotInvocable {
        type_name: String,
        method: String,
        reason: String,
    },
}

/// Immutable snapshot of a resolved method's signature and body
#[derive(Clone)]
pub struct ResolvedMethod {
    pub module: String,
    pub declaring_type: String,
    pub name: String,
    /// Declared parameter types, in declaration order
    pub params: Vec<TypeRef>,
    pub returns: TypeRef,
    pub(crate) body: MethodBody,
    pub(crate) constructor: Option<Constructor>,
}

impl ResolvedMethod {
    pub fn is_static(&self) -> bool {
        matches!(self.body, MethodBody::Static(_))
    }

    /// `Type.Method(param, ...) -> return`
    pub fn signature(&self) -> String {
        let params: Vec<String> = self.params.iter().map(TypeRef::name).collect();
        format!(
            "{}.{}({}) -> {}",
            self.declaring_type,
            self.name,
            params.join(", "),
            self.returns
        )
    }

    fn snapshot(module: &Module, ty: &TypeDef, method: &MethodDef) -> Self {
        Self {
            module: module.origin().to_string(),
            declaring_type: ty.name.clone(),
            name: method.name.clone(),
            params: method.params.clone(),
            returns: method.returns.clone(),
            body: method.body.clone(),
            constructor: ty.constructor.clone(),
        }
    }
}

impl fmt::Debug for ResolvedMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedMethod")
            .field("signature", &self.signature())
            .field("is_static", &self.is_static())
            .field("module", &self.module)
            .finish()
    }
}

pub fn resolve(
    module: &Module,
    type_name: &str,
    method_name: &str,
) -> Result<ResolvedMethod, ResolveError> {
    let ty = module
        .find_type(type_name)
        .ok_or_else(|| ResolveError::TypeNotFound {
            module: module.origin().to_string(),
            type_name: type_name.to_string(),
        })?;

    let mut candidates = ty.methods_named(method_name).peekable();
    if candidates.peek().is_none() {
        return Err(ResolveError::MethodNotFound {
            type_name: type_name.to_string(),
            method: method_name.to_string(),
        });
    }

    if ty.visibility != Visibility::Public {
        return Err(ResolveError::MethodNotInvocable {
            type_name: type_name.to_string(),
            method: method_name.to_string(),
            reason: "declaring type is not public".to_string(),
        });
    }

    let method = candidates
        .find(|m| m.visibility == Visibility::Public)
        .ok_or_else(|| ResolveError::MethodNotInvocable {
            type_name: type_name.to_string(),
            method: method_name.to_string(),
            reason: "method is not public".to_string(),
        })?;

    Ok(ResolvedMethod::snapshot(module, ty, method))
}
