//! Lifecycle hooks attached to an instance through its setup record.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use super::instance::InstanceRef;
use crate::core::errors::ClusterError;

pub type ReadyHook = Arc<dyn Fn(&InstanceRef) + Send + Sync>;
pub type DataHook = Arc<dyn Fn(&InstanceRef, &Value) + Send + Sync>;
pub type CloseHook = Arc<dyn Fn(&InstanceRef) + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&InstanceRef, &ClusterError) + Send + Sync>;

/// Optional lifecycle callbacks. Unset hooks are no-ops.
///
/// Every hook receives a reference to the owning instance. Hooks may run
/// on any runtime worker thread, so they must be `Send + Sync`.
#[derive(Clone, Default)]
pub struct Hooks {
    on_ready: Option<ReadyHook>,
    on_data: Option<DataHook>,
    on_close: Option<CloseHook>,
    on_error: Option<ErrorHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_ready<F>(mut self, hook: F) -> Self
    where
        F: Fn(&InstanceRef) + Send + Sync + 'static,
    {
        self.on_ready = Some(Arc::new(hook));
        self
    }

    pub fn on_data<F>(mut self, hook: F) -> Self
    where
        F: Fn(&InstanceRef, &Value) + Send + Sync + 'static,
    {
        self.on_data = Some(Arc::new(hook));
        self
    }

    pub fn on_close<F>(mut self, hook: F) -> Self
    where
        F: Fn(&InstanceRef) + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(hook));
        self
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&InstanceRef, &ClusterError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn ready(&self, owner: &InstanceRef) {
        if let Some(hook) = &self.on_ready {
            hook(owner);
        }
    }

    pub fn data(&self, owner: &InstanceRef, data: &Value) {
        if let Some(hook) = &self.on_data {
            hook(owner, data);
        }
    }

    pub fn close(&self, owner: &InstanceRef) {
        if let Some(hook) = &self.on_close {
            hook(owner);
        }
    }

    pub fn error(&self, owner: &InstanceRef, err: &ClusterError) {
        if let Some(hook) = &self.on_error {
            hook(owner, err);
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_ready", &self.on_ready.is_some())
            .field("on_data", &self.on_data.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn owner() -> InstanceRef {
        InstanceRef {
            id: "abc".to_string(),
            tag_name: "api".to_string(),
        }
    }

    #[test]
    fn test_unset_hooks_are_noops() {
        let hooks = Hooks::new();
        hooks.ready(&owner());
        hooks.data(&owner(), &Value::Null);
        hooks.close(&owner());
        hooks.error(&owner(), &ClusterError::internal("ignored"));
    }

    #[test]
    fn test_hooks_receive_owner() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let hooks = Hooks::new().on_ready(move |owner| {
            assert_eq!(owner.tag_name, "api");
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let cloned = hooks.clone();
        hooks.ready(&owner());
        cloned.ready(&owner());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(format!("{:?}", hooks).contains("on_ready: true"));
    }
}
