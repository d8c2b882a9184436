//! SettingsStore contract (§1, §6): key/value persistent storage
//! (strings and JSON blobs) that emits change notifications.
//!
//! The real storage backend (browser preferences / localStorage) is
//! implemented behind `cfg(target_arch = "wasm32")`; tests use the
//! in-memory fake, which coalesces notifications the same way the
//! spec requires of a real store (§5: "change-notifications are
//! coalesced by the store itself" — here, one notification per `set`).

use async_trait::async_trait;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{AppError, Result};

pub type ChangeCallback = Box<dyn Fn(&str, Option<&str>)>;

#[async_trait(?Send)]
pub trait SettingsStore {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;

    /// Register a callback invoked whenever `key` changes (set or deleted).
    fn watch(&self, key: &str, callback: ChangeCallback);
}

/// In-memory fake used by tests and as the reference implementation for
/// non-browser embeddings.
#[derive(Default)]
pub struct InMemorySettingsStore {
    values: RefCell<HashMap<String, String>>,
    watchers: RefCell<HashMap<String, Vec<ChangeCallback>>>,
}

impl InMemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values(values: HashMap<String, String>) -> Self {
        Self {
            values: RefCell::new(values),
            watchers: RefCell::new(HashMap::new()),
        }
    }

    fn notify(&self, key: &str, value: Option<&str>) {
        if let Some(callbacks) = self.watchers.borrow().get(key) {
            for cb in callbacks {
                cb(key, value);
            }
        }
    }
}

#[async_trait(?Send)]
impl SettingsStore for InMemorySettingsStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.borrow().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        self.notify(key, Some(value));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.borrow_mut().remove(key);
        self.notify(key, None);
        Ok(())
    }

    fn watch(&self, key: &str, callback: ChangeCallback) {
        self.watchers
            .borrow_mut()
            .entry(key.to_string())
            .or_default()
            .push(callback);
    }
}

/// `web_sys::Storage`-backed implementation (browser `localStorage`).
/// Notifications only cover changes made through this handle within the
/// same page, matching `SettingsStore`'s single-process contract.
#[cfg(target_arch = "wasm32")]
pub struct LocalStorageSettingsStore {
    watchers: Rc<RefCell<HashMap<String, Vec<ChangeCallback>>>>,
}

#[cfg(target_arch = "wasm32")]
impl LocalStorageSettingsStore {
    pub fn new() -> Result<Self> {
        // Validate availability eagerly so callers fail fast at init time
        // rather than on the first `get`/`set`.
        Self::storage()?;
        Ok(Self {
            watchers: Rc::new(RefCell::new(HashMap::new())),
        })
    }

    fn storage() -> Result<web_sys::Storage> {
        web_sys::window()
            .ok_or_else(|| AppError::Storage("no window".into()))?
            .local_storage()
            .map_err(|_| AppError::Storage("localStorage not available".into()))?
            .ok_or_else(|| AppError::Storage("localStorage is null".into()))
    }

    fn notify(&self, key: &str, value: Option<&str>) {
        if let Some(callbacks) = self.watchers.borrow().get(key) {
            for cb in callbacks {
                cb(key, value);
            }
        }
    }
}

#[cfg(target_arch = "wasm32")]
#[async_trait(?Send)]
impl SettingsStore for LocalStorageSettingsStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Self::storage()?
            .get_item(key)
            .map_err(|_| AppError::Storage(format!("get_item({key}) failed")))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        Self::storage()?
            .set_item(key, value)
            .map_err(|_| AppError::Storage(format!("set_item({key}) failed")))?;
        self.notify(key, Some(value));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        Self::storage()?
            .remove_item(key)
            .map_err(|_| AppError::Storage(format!("remove_item({key}) failed")))?;
        self.notify(key, None);
        Ok(())
    }

    fn watch(&self, key: &str, callback: ChangeCallback) {
        self.watchers
            .borrow_mut()
            .entry(key.to_string())
            .or_default()
            .push(callback);
    }
}
