//! Registry of objects a resource depends on without owning them.
//!
//! Reconcilers register the secrets they read (user certificates, secure settings,
//! association credentials) under a stable handler name. The controller feeds every
//! secret event through [`DynamicWatches::watchers_for`] to find which resources to requeue.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use kube::ResourceExt;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a namespaced object; cluster scoped objects get an empty namespace.
    pub fn of<K: kube::Resource>(obj: &K) -> Self {
        Self::new(obj.namespace().unwrap_or_default(), obj.name_any())
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Name of a handler registered by `namespace/name`. Object names cannot contain `/`, so
/// handlers of different resources never share a name.
pub fn handler_name(namespace: &str, name: &str, suffix: &str) -> String {
    format!("{namespace}/{name}/{suffix}")
}

/// A set of watched objects and the resource to requeue when one of them changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedWatch {
    pub name: String,
    pub watched: Vec<NamespacedName>,
    pub watcher: NamespacedName,
}

#[derive(Clone, Default)]
pub struct DynamicWatches {
    handlers: Arc<RwLock<BTreeMap<String, NamedWatch>>>,
}

impl DynamicWatches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces the handler with the same name.
    pub fn add_handler(&self, watch: NamedWatch) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(watch.name.clone(), watch);
    }

    /// Removes a handler; unknown names are ignored.
    pub fn remove_handler_for_key(&self, name: &str) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    /// Every resource that asked to be notified about `key`, each listed once.
    pub fn watchers_for(&self, key: &NamespacedName) -> Vec<NamespacedName> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut watchers: Vec<NamespacedName> = handlers
            .values()
            .filter(|w| w.watched.contains(key))
            .map(|w| w.watcher.clone())
            .collect();
        watchers.sort();
        watchers.dedup();
        watchers
    }

    /// Names of the handlers currently registered.
    pub fn registrations(&self) -> Vec<String> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}
