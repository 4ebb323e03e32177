//! modgate - Dynamic Method Invocation Gateway
//!
//! Accepts requests naming a module, a type inside it, a method on that type
//! and a list of string-encoded parameters, then loads the module (once per
//! path), resolves the method, converts the parameters to the declared types,
//! invokes it and returns the textual form of the result.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   InvocationRequest
//! │  Transport   │──────────────────────┐
//! └──────────────┘                      ▼
//!                               ┌───────────────┐
//!                               │    Gateway    │
//!                               └───────┬───────┘
//!          ┌──────────────┬─────────────┼──────────────┐
//!          ▼              ▼             ▼              ▼
//!   ┌────────────┐ ┌────────────┐ ┌────────────┐ ┌────────────┐
//!   │  Registry  │ │  Resolver  │ │ Marshaller │ │  Invoker   │
//!   └─────┬──────┘ └────────────┘ └────────────┘ └────────────┘
//!         ▼
//!   ┌────────────┐
//!   │ModuleLoader│  native shared library / in-process catalog
//!   └────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use modgate::module::{CatalogLoader, MethodDef, Module, TypeDef, TypeRef, Value};
//! use modgate::{Gateway, InvocationRequest};
//!
//! let catalog = CatalogLoader::new().with_module("mem://demo", |path| {
//!     Ok(Module::new(path).with_type(TypeDef::new("Demo").method(MethodDef::new_static(
//!         "Echo",
//!         vec![TypeRef::TEXT],
//!         TypeRef::TEXT,
//!         |args| Ok(Some(Value::Text(args[0].text()?.to_string()))),
//!     ))))
//! });
//!
//! let gateway = Gateway::new(catalog);
//! let request = InvocationRequest::new("mem://demo", "Demo", "Echo").param("hello");
//! assert_eq!(gateway.invoke(&request).unwrap().result, "hello");
//! ```

pub mod config;
pub mod gateway;
pub mod invoker;
pub mod marshal;
pub mod module;
pub mod registry;
pub mod resolver;
pub mod server;

pub use config::{ConfigError, GatewayConfig};
pub use gateway::{
    ErrorBody, ErrorKind, Gateway, GatewayError, InvocationRequest, InvocationResponse,
    ModuleDescription, PreloadReport, Stage, StageError,
};
pub use module::{CatalogLoader, LoadError, ModuleLoader, NativeLoader};
pub use registry::ModuleRegistry;
pub use server::Server;
