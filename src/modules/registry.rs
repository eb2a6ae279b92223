//! Ordered module registry with atomic snapshots.
//!
//! # Responsibilities
//! - Keep modules in registration order
//! - Publish a new immutable snapshot on every change
//! - Drive the register / unregister lifecycle hooks
//!
//! # Design Decisions
//! - Readers load the current snapshot with a single atomic load and never
//!   block; an in-flight dispatch keeps the snapshot it started with
//! - Writers are serialized by a mutex and copy the list (registration is
//!   rare, dispatch is hot)
//! - A module enters the snapshot only after `on_register` has run and
//!   leaves it before `on_unregister` runs

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;

use crate::error::ServerError;
use crate::modules::Module;

/// Lifecycle state of a registered module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModuleState {
    Registered = 0,
    Active = 1,
    Unregistered = 2,
}

impl ModuleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ModuleState::Registered,
            1 => ModuleState::Active,
            _ => ModuleState::Unregistered,
        }
    }
}

/// A module together with its lifecycle state.
pub struct ModuleEntry {
    module: Arc<dyn Module>,
    state: AtomicU8,
}

impl ModuleEntry {
    fn new(module: Arc<dyn Module>) -> Self {
        Self {
            module,
            state: AtomicU8::new(ModuleState::Registered as u8),
        }
    }

    pub fn name(&self) -> &str {
        self.module.name()
    }

    pub fn module(&self) -> &Arc<dyn Module> {
        &self.module
    }

    pub fn state(&self) -> ModuleState {
        ModuleState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ModuleState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl std::fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleEntry")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("routes", &self.module.routes().len())
            .finish()
    }
}

/// Immutable view of the registry at one instant.
pub type Snapshot = Arc<Vec<Arc<ModuleEntry>>>;

/// Registration-ordered set of modules.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    modules: ArcSwap<Vec<Arc<ModuleEntry>>>,
    writer: Mutex<()>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_lock(&self) -> MutexGuard<'_, ()> {
        // The guarded data is `()`, so a poisoned lock carries no broken state.
        self.inner
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a module. Fails if a module with the same name exists.
    pub fn register(&self, module: Arc<dyn Module>) -> Result<Arc<ModuleEntry>, ServerError> {
        let _writer = self.write_lock();
        let current = self.inner.modules.load_full();

        if current.iter().any(|entry| entry.name() == module.name()) {
            return Err(ServerError::ModuleAlreadyRegistered(module.name().to_string()));
        }

        let entry = Arc::new(ModuleEntry::new(module));
        entry.module.on_register();
        entry.set_state(ModuleState::Active);

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(Arc::clone(&entry));
        self.inner.modules.store(Arc::new(next));

        tracing::info!(
            module = entry.name(),
            routes = entry.module.routes().len(),
            "Module registered"
        );
        Ok(entry)
    }

    /// Remove a module by name.
    ///
    /// Requests that already loaded a snapshot may still finish against it.
    pub fn unregister(&self, name: &str) -> Result<Arc<dyn Module>, ServerError> {
        let _writer = self.write_lock();
        let current = self.inner.modules.load_full();

        let Some(position) = current.iter().position(|entry| entry.name() == name) else {
            return Err(ServerError::ModuleNotRegistered(name.to_string()));
        };

        let mut next: Vec<_> = current.iter().cloned().collect();
        let entry = next.remove(position);
        self.inner.modules.store(Arc::new(next));

        entry.set_state(ModuleState::Unregistered);
        entry.module.on_unregister();

        tracing::info!(module = name, "Module unregistered");
        Ok(Arc::clone(&entry.module))
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.modules.load_full()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModuleEntry>> {
        self.inner
            .modules
            .load()
            .iter()
            .find(|entry| entry.name() == name)
            .cloned()
    }

    /// Module names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.inner
            .modules
            .load()
            .iter()
            .map(|entry| entry.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.modules.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
