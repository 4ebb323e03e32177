//! Module Registry
//!
//! Caches loaded modules keyed by the literal path string they were requested
//! with. Paths are not normalised: two spellings of the same file load and
//! cache independently.
//!
//! Each path owns a slot initialised at most once. The map lock is held only
//! to find or create a slot; the load itself runs under the slot's own
//! initialisation lock, so concurrent first loads of one path wait for a single
//! loader call while loads of other paths proceed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::module::{LoadError, Module, ModuleLoader};

type Slot = Arc<OnceCell<Arc<Module>>>;

pub struct ModuleRegistry {
    loader: Box<dyn ModuleLoader>,
    slots: RwLock<HashMap<String, Slot>>,
}

impl ModuleRegistry {
    pub fn new(loader: impl ModuleLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Return the cached module for `path`, loading it on first use.
    ///
    /// A failed load leaves nothing cached; the error is returned to the
    /// caller and a later request may try again.
    pub fn ensure_loaded(&self, path: &str) -> Result<Arc<Module>, LoadError> {
        let slot = self.slot(path);
        let loaded = slot
            .get_or_try_init(|| {
                debug!(path, "loading module");
                let module = self.loader.load(path)?;
                info!(path, types = module.types().len(), "module loaded");
                Ok(Arc::new(module))
            })
            .map(Arc::clone);

        if loaded.is_err() {
            self.evict_empty(path, &slot);
        }
        loaded
    }

    /// Check if a module is already resident
    pub fn is_loaded(&self, path: &str) -> bool {
        self.slots
            .read()
            .get(path)
            .is_some_and(|slot| slot.get().is_some())
    }

    /// Paths of resident modules, sorted
    pub fn loaded_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .slots
            .read()
            .iter()
            .filter(|(_, slot)| slot.get().is_some())
            .map(|(path, _)| path.clone())
            .collect();
        paths.sort();
        paths
    }

    fn slot(&self, path: &str) -> Slot {
        if let Some(slot) = self.slots.read().get(path) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write();
        Arc::clone(slots.entry(path.to_string()).or_default())
    }

    /// Drop the slot a failed load left behind, unless another caller has
    /// replaced or filled it meanwhile
    fn evict_empty(&self, path: &str, slot: &Slot) {
        let mut slots = self.slots.write();
        let stale = slots
            .get(path)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && current.get().is_none());
        if stale {
            slots.remove(path);
        }
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("loaded", &self.loaded_paths())
            .finish()
    }
}
