//! Invocation Gateway
//!
//! Drives one request through the stages
//!
//! ```text
//! Received → ModuleLoading → Resolving → Marshalling → Invoking → Succeeded
//!                 │              │            │            │
//!                 ▼              ▼            ▼            ▼
//!            LoadFailed   ResolveFailed  MarshalFailed  InvokeFailed
//! ```
//!
//! Every failure short-circuits the remaining stages and is returned with its
//! own [`ErrorKind`]; nothing is retried. The only state shared between
//! requests is the registry's module cache.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span, warn};

use crate::invoker::{self, InvokeError};
use crate::marshal::{self, MarshalError};
use crate::module::{LoadError, MethodDef, ModuleLoader, TypeRef, Value, Visibility};
use crate::registry::ModuleRegistry;
use crate::resolver::{self, ResolveError};

/// Inbound request envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    pub module_path: String,
    pub type_name: String,
    pub method_name: String,
    #[serde(default)]
    pub parameters: Vec<String>,
}

impl InvocationRequest {
    pub fn new(
        module_path: impl Into<String>,
        type_name: impl Into<String>,
        method_name: impl Into<String>,
    ) -> Self {
        Self {
            module_path: module_path.into(),
            type_name: type_name.into(),
            method_name: method_name.into(),
            parameters: Vec::new(),
        }
    }

    /// Append a wire parameter
    pub fn param(mut self, raw: impl Into<String>) -> Self {
        self.parameters.push(raw.into());
        self
    }
}

/// Successful response envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResponse {
    /// Textual form of the return value, `"null"` for no value
    pub result: String,
    /// When the invocation completed
    pub timestamp: DateTime<Utc>,
}

impl InvocationResponse {
    fn from_value(value: Option<Value>, timestamp: DateTime<Utc>) -> Self {
        Self {
            result: value.unwrap_or(Value::Null).to_string(),
            timestamp,
        }
    }
}

/// Per-request state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Received,
    ModuleLoading,
    Resolving,
    Marshalling,
    Invoking,
    Succeeded,
    LoadFailed,
    ResolveFailed,
    MarshalFailed,
    InvokeFailed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Error classification reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ModuleLoadError,
    TypeNotFound,
    MethodNotFound,
    MethodNotInvocable,
    ParameterCountMismatch,
    ParameterConversionError,
    ReceiverConstructionError,
    TargetInvocationError,
}

impl ErrorKind {
    /// Whether the failure originated in the called code rather than the gateway
    pub fn is_target_fault(&self) -> bool {
        matches!(self, ErrorKind::TargetInvocationError)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Failure of a single stage
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error(transparent)]
    Invoke(#[from] InvokeError),
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Load(_) => ErrorKind::ModuleLoadError,
            StageError::Resolve(ResolveError::TypeNotFound { .. }) => ErrorKind::TypeNotFound,
            StageError::Resolve(ResolveError::MethodNotFound { .. }) => ErrorKind::MethodNotFound,
            StageError::Resolve(ResolveError::MethodNotInvocable { .. }) => {
                ErrorKind::MethodNotInvocable
            }
            StageError::Marshal(MarshalError::ParameterCountMismatch { .. }) => {
                ErrorKind::ParameterCountMismatch
            }
            StageError::Marshal(MarshalError::ParameterConversion { .. }) => {
                ErrorKind::ParameterConversionError
            }
            StageError::Invoke(InvokeError::ReceiverConstruction { .. }) => {
                ErrorKind::ReceiverConstructionError
            }
            StageError::Invoke(InvokeError::TargetInvocation { .. }) => {
                ErrorKind::TargetInvocationError
            }
        }
    }

    /// The terminal state the request ended in
    pub fn stage(&self) -> Stage {
        match self {
            StageError::Load(_) => Stage::LoadFailed,
            StageError::Resolve(_) => Stage::ResolveFailed,
            StageError::Marshal(_) => Stage::MarshalFailed,
            StageError::Invoke(_) => Stage::InvokeFailed,
        }
    }
}

/// A stage failure with the module, type and method the request named
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayError {
    pub module_path: String,
    pub type_name: Option<String>,
    pub method_name: Option<String>,
    pub source: StageError,
}

impl GatewayError {
    fn for_request(request: &InvocationRequest, source: StageError) -> Self {
        Self {
            module_path: request.module_path.clone(),
            type_name: Some(request.type_name.clone()),
            method_name: Some(request.method_name.clone()),
            source,
        }
    }

    fn for_module(module_path: &str, source: StageError) -> Self {
        Self {
            module_path: module_path.to_string(),
            type_name: None,
            method_name: None,
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }

    pub fn stage(&self) -> Stage {
        self.source.stage()
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.type_name, &self.method_name) {
            (Some(ty), Some(method)) => write!(
                f,
                "method '{}' of type '{}' in module '{}': {}",
                method, ty, self.module_path, self.source
            ),
            _ => write!(f, "module '{}': {}", self.module_path, self.source),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Failure envelope handed to the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub message: String,
    pub module_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_name: Option<String>,
}

impl From<&GatewayError> for ErrorBody {
    fn from(err: &GatewayError) -> Self {
        Self {
            kind: err.kind(),
            stage: err.stage(),
            message: err.to_string(),
            module_path: err.module_path.clone(),
            type_name: err.type_name.clone(),
            method_name: err.method_name.clone(),
        }
    }
}

/// Outcome of preloading one path
#[derive(Debug)]
pub struct PreloadReport {
    pub path: String,
    pub outcome: Result<(), LoadError>,
}

/// Signature listing of a module, with parameter templates
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDescription {
    pub module_path: String,
    pub types: Vec<TypeDescription>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeDescription {
    pub name: String,
    pub public: bool,
    pub constructible: bool,
    pub methods: Vec<MethodDescription>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodDescription {
    pub name: String,
    #[serde(rename = "static")]
    pub is_static: bool,
    pub public: bool,
    pub params: Vec<ParamDescription>,
    pub returns: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamDescription {
    #[serde(rename = "type")]
    pub ty: String,
    /// Structured parameters only: every writable field at its default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<serde_json::Value>,
}

impl MethodDescription {
    fn of(method: &MethodDef) -> Self {
        Self {
            name: method.name.clone(),
            is_static: method.is_static(),
            public: method.visibility == Visibility::Public,
            params: method
                .params
                .iter()
                .map(|ty| ParamDescription {
                    ty: ty.name(),
                    template: template(ty),
                })
                .collect(),
            returns: method.returns.name(),
        }
    }
}

/// Default-initialised encoding of a structured type
fn template(ty: &TypeRef) -> Option<serde_json::Value> {
    let TypeRef::Struct(schema) = ty else {
        return None;
    };
    let fields = schema
        .fields
        .iter()
        .filter(|f| f.writable)
        .map(|f| {
            let value = template(&f.ty).unwrap_or_else(|| {
                serde_json::to_value(f.ty.default_value()).unwrap_or(serde_json::Value::Null)
            });
            (f.name.clone(), value)
        })
        .collect();
    Some(serde_json::Value::Object(fields))
}

/// The gateway entry point
#[derive(Debug, Clone)]
pub struct Gateway {
    registry: Arc<ModuleRegistry>,
}

impl Gateway {
    pub fn new(loader: impl ModuleLoader + 'static) -> Self {
        Self::with_registry(Arc::new(ModuleRegistry::new(loader)))
    }

    pub fn with_registry(registry: Arc<ModuleRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Run one request through load, resolve, marshal and invoke
    pub fn invoke(&self, request: &InvocationRequest) -> Result<InvocationResponse, GatewayError> {
        let span = info_span!(
            "invoke",
            module = %request.module_path,
            type_name = %request.type_name,
            method = %request.method_name,
        );
        let _guard = span.enter();

        let outcome = self
            .run(request)
            .map_err(|source| GatewayError::for_request(request, source));
        match &outcome {
            Ok(response) => {
                debug!(stage = %Stage::Succeeded, result = %response.result, "invocation completed")
            }
            Err(err) => {
                warn!(stage = %err.stage(), kind = %err.kind(), error = %err, "invocation failed")
            }
        }
        outcome
    }

    fn run(&self, request: &InvocationRequest) -> Result<InvocationResponse, StageError> {
        debug!(stage = %Stage::Received, params = request.parameters.len());

        debug!(stage = %Stage::ModuleLoading);
        let module = self.registry.ensure_loaded(&request.module_path)?;

        debug!(stage = %Stage::Resolving);
        let method = resolver::resolve(&module, &request.type_name, &request.method_name)?;

        debug!(stage = %Stage::Marshalling, signature = %method.signature());
        let args = marshal::marshal(&method.params, &request.parameters)?;

        debug!(stage = %Stage::Invoking, is_static = method.is_static());
        let value = invoker::invoke(&method, &args)?;
        let timestamp = Utc::now();

        Ok(InvocationResponse::from_value(value, timestamp))
    }

    /// Load each path up front, reporting per-path outcomes
    pub fn preload<I, S>(&self, paths: I) -> Vec<PreloadReport>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        paths
            .into_iter()
            .map(|path| {
                let path = path.as_ref();
                let outcome = self.registry.ensure_loaded(path).map(|_| ());
                if let Err(err) = &outcome {
                    warn!(path, error = %err, "preload failed");
                }
                PreloadReport {
                    path: path.to_string(),
                    outcome,
                }
            })
            .collect()
    }

    /// List a module's types and method signatures
    pub fn describe(&self, module_path: &str) -> Result<ModuleDescription, GatewayError> {
        let module = self
            .registry
            .ensure_loaded(module_path)
            .map_err(|e| GatewayError::for_module(module_path, e.into()))?;
        let types = module
            .types()
            .into_iter()
            .map(|ty| TypeDescription {
                name: ty.name.clone(),
                public: ty.visibility == Visibility::Public,
                constructible: ty.constructor.is_some(),
                methods: ty.methods.iter().map(MethodDescription::of).collect(),
            })
            .collect();
        Ok(ModuleDescription {
            module_path: module_path.to_string(),
            types,
        })
    }
}
