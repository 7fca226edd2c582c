//! Key-value snapshot store for consumer and battery state.
//!
//! The engine reads it once at startup and writes it once per report cycle;
//! it is never consulted during a pass.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Namespace holding consumer snapshots.
pub const CONSUMER_NAMESPACE: &str = "consumers";
/// Namespace holding battery snapshots.
pub const BATTERY_NAMESPACE: &str = "batteries";

/// A record could not be written.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreError {
    pub namespace: String,
    pub id: String,
    pub message: String,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.namespace, self.id, self.message)
    }
}

impl std::error::Error for StoreError {}

/// Storage backend working on JSON values.
pub trait StateStore {
    fn save_value(&mut self, namespace: &str, id: &str, value: Value) -> Result<(), StoreError>;
    fn get_value(&self, namespace: &str, id: &str) -> Option<Value>;
}

/// Typed access on top of any [`StateStore`].
pub trait StateStoreExt: StateStore {
    fn save<T: Serialize>(
        &mut self,
        namespace: &str,
        id: &str,
        record: &T,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_value(record).map_err(|e| StoreError {
            namespace: namespace.to_string(),
            id: id.to_string(),
            message: e.to_string(),
        })?;
        self.save_value(namespace, id, value)
    }

    /// Reads a record. Missing and malformed records both yield `None`; the
    /// latter is logged.
    fn get<T: DeserializeOwned>(&self, namespace: &str, id: &str) -> Option<T> {
        let value = self.get_value(namespace, id)?;
        match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(namespace, id, error = %e, "ignoring malformed stored record");
                None
            }
        }
    }
}

impl<S: StateStore + ?Sized> StateStoreExt for S {}

/// In-memory store. Clones share the same records, so a caller can keep a
/// handle after giving one to the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Rc<RefCell<BTreeMap<(String, String), Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }
}

impl StateStore for MemoryStore {
    fn save_value(&mut self, namespace: &str, id: &str, value: Value) -> Result<(), StoreError> {
        self.records
            .borrow_mut()
            .insert((namespace.to_string(), id.to_string()), value);
        Ok(())
    }

    fn get_value(&self, namespace: &str, id: &str) -> Option<Value> {
        self.records
            .borrow()
            .get(&(namespace.to_string(), id.to_string()))
            .cloned()
    }
}
