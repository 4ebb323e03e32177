//! In-Process Module Catalog
//!
//! Maps module paths to factories that build [`Module`] values from Rust
//! closures. Paths the catalog does not know are handed to an optional
//! fallback loader (typically [`super::NativeLoader`]).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::loader::{LoadError, ModuleLoader};
use super::Module;

/// Module factory: (path) -> module
pub type ModuleFactory = Arc<dyn Fn(&str) -> Result<Module, LoadError> + Send + Sync>;

#[derive(Default)]
pub struct CatalogLoader {
    factories: HashMap<String, ModuleFactory>,
    fallback: Option<Box<dyn ModuleLoader>>,
}

impl CatalogLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send unknown paths to another loader
    pub fn with_fallback(mut self, loader: impl ModuleLoader + 'static) -> Self {
        self.fallback = Some(Box::new(loader));
        self
    }

    /// Register a factory under a literal path
    pub fn register<F>(&mut self, path: impl Into<String>, factory: F)
    where
        F: Fn(&str) -> Result<Module, LoadError> + Send + Sync + 'static,
    {
        self.factories.insert(path.into(), Arc::new(factory));
    }

    /// Builder-style [`Self::register`]
    pub fn with_module<F>(mut self, path: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&str) -> Result<Module, LoadError> + Send + Sync + 'static,
    {
        self.register(path, factory);
        self
    }

    pub fn contains(&self, path: &str) -> bool {
        self.factories.contains_key(path)
    }

    /// Registered paths, sorted
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }
}

impl ModuleLoader for CatalogLoader {
    fn load(&self, path: &str) -> Result<Module, LoadError> {
        if let Some(factory) = self.factories.get(path) {
            return factory(path);
        }
        match &self.fallback {
            Some(loader) => loader.load(path),
            None => Err(LoadError::NotFound {
                path: path.to_string(),
            }),
        }
    }
}

impl fmt::Debug for CatalogLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogLoader")
            .field("paths", &self.paths())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
