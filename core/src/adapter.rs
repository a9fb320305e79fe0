//! Adapters and the registry that dispatches to them.
//!
//! An adapter is the executable logic behind one `(operation_class,
//! operation_name)` pair. The same adapter runs the operation the first time on
//! the primary store and re-runs it from a replayed envelope on the secondary
//! store, so it only ever sees a connection and the params.
//!
//! The registry is built at startup and read for the rest of the process
//! lifetime. Registration is safe from several initializers at once: for one key
//! exactly one adapter wins and every other distinct adapter gets
//! [`OutboxError::DuplicateAdapterRegistration`].

use crate::envelope::Params;
use crate::error::{AdapterError, OutboxError};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Executable logic for one operation, generic over the connection type `C`.
///
/// The registry performs no validation of params; adapters reject what they
/// cannot handle with [`AdapterError::InvalidParams`].
pub trait Adapter<C>: Send + Sync {
    /// Run the operation against `conn`.
    ///
    /// # Errors
    ///
    /// Returns an [`AdapterError`] if the params are invalid or the operation fails.
    fn execute<'a>(
        &'a self,
        conn: &'a mut C,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Value, AdapterError>>;
}

/// Adapter backed by a function.
pub struct FnAdapter<F> {
    f: F,
}

impl<C, F> Adapter<C> for FnAdapter<F>
where
    F: for<'a> Fn(&'a mut C, &'a Params) -> BoxFuture<'a, Result<Value, AdapterError>>
        + Send
        + Sync,
{
    fn execute<'a>(
        &'a self,
        conn: &'a mut C,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Value, AdapterError>> {
        (self.f)(conn, params)
    }
}

impl<F> fmt::Debug for FnAdapter<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAdapter").finish_non_exhaustive()
    }
}

/// Wrap a function returning a boxed future as a shareable adapter.
///
/// # Examples
///
/// ```
/// use replay_outbox_core::adapter::{adapter_fn, Adapter};
/// use serde_json::Value;
/// use std::sync::Arc;
///
/// let noop: Arc<dyn Adapter<()>> = adapter_fn(|_conn: &mut (), _params| {
///     Box::pin(async { Ok(Value::Null) })
/// });
/// ```
pub fn adapter_fn<C, F>(f: F) -> Arc<dyn Adapter<C>>
where
    C: 'static,
    F: for<'a> Fn(&'a mut C, &'a Params) -> BoxFuture<'a, Result<Value, AdapterError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnAdapter { f })
}

/// Dispatch key of an adapter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AdapterKey {
    /// Operation class.
    pub operation_class: String,
    /// Operation name.
    pub operation_name: String,
}

impl AdapterKey {
    /// New key from its two halves.
    #[must_use]
    pub fn new(operation_class: impl Into<String>, operation_name: impl Into<String>) -> Self {
        Self {
            operation_class: operation_class.into(),
            operation_name: operation_name.into(),
        }
    }
}

impl fmt::Display for AdapterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.operation_class, self.operation_name)
    }
}

// Nested by class then name so `find` can look up with borrowed `&str`s.
type AdapterTable<C> = HashMap<String, HashMap<String, Arc<dyn Adapter<C>>>>;

/// Lookup table from `(operation_class, operation_name)` to an adapter.
///
/// Writers take the lock only while registering; steady-state lookups share a
/// read lock and never contend with each other.
pub struct AdapterRegistry<C> {
    adapters: RwLock<AdapterTable<C>>,
    sealed: AtomicBool,
}

impl<C> AdapterRegistry<C> {
    /// Empty, open registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            sealed: AtomicBool::new(false),
        }
    }

    /// Register `adapter` for `operation_class#operation_name`.
    ///
    /// Registering the identical instance (same `Arc`) again is a no-op.
    ///
    /// # Errors
    ///
    /// - [`OutboxError::DuplicateAdapterRegistration`] if a different adapter
    ///   already holds the key; the existing entry is kept.
    /// - [`OutboxError::RegistrySealed`] after [`seal`](Self::seal).
    pub fn register(
        &self,
        operation_class: &str,
        operation_name: &str,
        adapter: Arc<dyn Adapter<C>>,
    ) -> Result<(), OutboxError> {
        let mut adapters = self
            .adapters
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        // Checked under the write lock so a racing seal() is observed.
        if self.sealed.load(Ordering::Acquire) {
            return Err(OutboxError::RegistrySealed);
        }

        let by_name = adapters.entry(operation_class.to_string()).or_default();
        match by_name.entry(operation_name.to_string()) {
            Entry::Occupied(existing) if Arc::ptr_eq(existing.get(), &adapter) => Ok(()),
            Entry::Occupied(_) => {
                tracing::error!(
                    operation_class,
                    operation_name,
                    "Conflicting adapter registration"
                );
                Err(OutboxError::DuplicateAdapterRegistration {
                    operation_class: operation_class.to_string(),
                    operation_name: operation_name.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(adapter);
                tracing::debug!(operation_class, operation_name, "Adapter registered");
                Ok(())
            }
        }
    }

    /// Register a function adapter; see [`adapter_fn`].
    ///
    /// # Errors
    ///
    /// Same as [`register`](Self::register).
    pub fn register_fn<F>(
        &self,
        operation_class: &str,
        operation_name: &str,
        f: F,
    ) -> Result<(), OutboxError>
    where
        C: 'static,
        F: for<'a> Fn(&'a mut C, &'a Params) -> BoxFuture<'a, Result<Value, AdapterError>>
            + Send
            + Sync
            + 'static,
    {
        self.register(operation_class, operation_name, adapter_fn(f))
    }

    /// The adapter for `operation_class#operation_name`, if any.
    #[must_use]
    pub fn find(&self, operation_class: &str, operation_name: &str) -> Option<Arc<dyn Adapter<C>>> {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation_class)
            .and_then(|by_name| by_name.get(operation_name))
            .cloned()
    }

    /// Like [`find`](Self::find) but failing with [`OutboxError::NoAdapterRegistered`].
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::NoAdapterRegistered`] on a dispatch miss.
    pub fn require(
        &self,
        operation_class: &str,
        operation_name: &str,
    ) -> Result<Arc<dyn Adapter<C>>, OutboxError> {
        self.find(operation_class, operation_name)
            .ok_or_else(|| OutboxError::no_adapter(operation_class, operation_name))
    }

    /// Close the registry; later registrations fail with
    /// [`OutboxError::RegistrySealed`].
    pub fn seal(&self) {
        let _guard = self
            .adapters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.sealed.store(true, Ordering::Release);
    }

    /// Whether [`seal`](Self::seal) was called.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Number of registered adapters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(HashMap::len)
            .sum()
    }

    /// Whether no adapter is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All registered keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<AdapterKey> {
        let adapters = self.adapters.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<AdapterKey> = adapters
            .iter()
            .flat_map(|(class, by_name)| {
                by_name.keys().map(move |name| AdapterKey::new(class.clone(), name.clone()))
            })
            .collect();
        keys.sort();
        keys
    }
}

impl<C> Default for AdapterRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for AdapterRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("keys", &self.keys())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}
