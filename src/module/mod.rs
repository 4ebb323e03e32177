//! Module Model for Modgate
//!
//! A module is a unit of native code resident in the process, made of named
//! types that own invocable methods. Rust has no runtime reflection, so every
//! module is an explicit table of handlers: either built in-process from
//! closures ([`CatalogLoader`]) or described by a shared library through a
//! small C ABI ([`NativeLoader`]).
//!
//! # Architecture
//!
//! ```text
//! modulePath ──► ModuleLoader ──► Module
//!                                   │
//!                                   ├── TypeDef "Billing.Invoices"
//!                                   │     ├── constructor (optional)
//!                                   │     ├── MethodDef "Total"   (static)
//!                                   │     └── MethodDef "Render"  (instance)
//!                                   └── TypeDef ...
//! ```

mod abi;
mod catalog;
mod loader;
mod types;

pub use abi::{ModuleDescriptor, ABI_VERSION};
pub use catalog::CatalogLoader;
pub use loader::{LoadError, ModuleLoader, NativeLoader};
pub use types::{
    parse_literal, Argument, FieldDef, PrimitiveKind, StructSchema, StructValue, TypeRef, Value,
};

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// A failure raised by target code (a method body or a constructor)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct Fault {
    pub message: String,
}

impl Fault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The instance an instance method runs against
pub type Receiver = Box<dyn Any + Send>;

/// Default construction of a receiver
pub type Constructor = Arc<dyn Fn() -> Result<Receiver, Fault> + Send + Sync>;

/// Body of a static method: (args) -> optional return value
pub type StaticFn = Arc<dyn Fn(&[Argument]) -> Result<Option<Value>, Fault> + Send + Sync>;

/// Body of an instance method: (receiver, args) -> optional return value
pub type InstanceFn =
    Arc<dyn Fn(&mut Receiver, &[Argument]) -> Result<Option<Value>, Fault> + Send + Sync>;

/// Whether a type or method may be invoked from outside the module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Public => write!(f, "public"),
            Visibility::Private => write!(f, "private"),
        }
    }
}

/// A method body, which also fixes whether the method is static
#[derive(Clone)]
pub enum MethodBody {
    Static(StaticFn),
    Instance(InstanceFn),
}

/// A method declared on a type
#[derive(Clone)]
pub struct MethodDef {
    pub name: String,
    pub params: Vec<TypeRef>,
    pub returns: TypeRef,
    pub visibility: Visibility,
    pub body: MethodBody,
}

impl MethodDef {
    /// Declare a public static method
    pub fn new_static<F>(
        name: impl Into<String>,
        params: Vec<TypeRef>,
        returns: TypeRef,
        func: F,
    ) -> Self
    where
        F: Fn(&[Argument]) -> Result<Option<Value>, Fault> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            params,
            returns,
            visibility: Visibility::Public,
            body: MethodBody::Static(Arc::new(func)),
        }
    }

    /// Declare a public instance method on receivers of type `T`
    pub fn new_instance<T, F>(
        name: impl Into<String>,
        params: Vec<TypeRef>,
        returns: TypeRef,
        func: F,
    ) -> Self
    where
        T: Any + Send,
        F: Fn(&mut T, &[Argument]) -> Result<Option<Value>, Fault> + Send + Sync + 'static,
    {
        let body: InstanceFn = Arc::new(move |receiver: &mut Receiver, args: &[Argument]| {
            let this = receiver
                .downcast_mut::<T>()
                .ok_or_else(|| Fault::new("receiver has an unexpected type"))?;
            func(this, args)
        });
        Self {
            name: name.into(),
            params,
            returns,
            visibility: Visibility::Public,
            body: MethodBody::Instance(body),
        }
    }

    /// Hide the method from invocation
    pub fn private(mut self) -> Self {
        self.visibility = Visibility::Private;
        self
    }

    pub fn is_static(&self) -> bool {
        matches!(self.body, MethodBody::Static(_))
    }
}

impl fmt::Debug for MethodDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDef")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .field("visibility", &self.visibility)
            .field("is_static", &self.is_static())
            .finish()
    }
}

/// A named type inside a module
#[derive(Clone)]
pub struct TypeDef {
    pub name: String,
    pub visibility: Visibility,
    pub constructor: Option<Constructor>,
    /// Methods in declaration order
    pub methods: Vec<MethodDef>,
}

impl TypeDef {
    /// A public type with no constructor and no methods
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visibility: Visibility::Public,
            constructor: None,
            methods: Vec::new(),
        }
    }

    /// Construct receivers with `T::default()`
    pub fn with_default<T: Default + Send + 'static>(self) -> Self {
        self.with_constructor(|| Ok(Box::new(T::default()) as Receiver))
    }

    /// Construct receivers with a custom constructor
    pub fn with_constructor<F>(mut self, ctor: F) -> Self
    where
        F: Fn() -> Result<Receiver, Fault> + Send + Sync + 'static,
    {
        self.constructor = Some(Arc::new(ctor));
        self
    }

    /// Add a method
    pub fn method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }

    /// Hide the type from invocation
    pub fn private(mut self) -> Self {
        self.visibility = Visibility::Private;
        self
    }

    /// All methods sharing a name, in declaration order
    pub fn methods_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MethodDef> {
        self.methods.iter().filter(move |m| m.name == name)
    }
}

impl fmt::Debug for TypeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDef")
            .field("name", &self.name)
            .field("visibility", &self.visibility)
            .field("constructible", &self.constructor.is_some())
            .field("methods", &self.methods)
            .finish()
    }
}

/// A module resident in the process
#[derive(Debug)]
pub struct Module {
    /// Path the module was loaded from
    origin: String,
    types: HashMap<String, TypeDef>,
}

impl Module {
    /// Create an empty module
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            types: HashMap::new(),
        }
    }

    /// Add a type (a later type with the same name replaces the earlier one)
    pub fn with_type(mut self, ty: TypeDef) -> Self {
        self.types.insert(ty.name.clone(), ty);
        self
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Look up a type by fully-qualified name
    pub fn find_type(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    /// All types, sorted by name
    pub fn types(&self) -> Vec<&TypeDef> {
        let mut types: Vec<&TypeDef> = self.types.values().collect();
        types.sort_by(|a, b| a.name.cmp(&b.name));
        types
    }
}
