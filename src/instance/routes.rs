//! Path → handler registry.
//!
//! A route binds a path to a controller with the fixed contract
//! `(payload, completion)`. At most one route exists per path on an
//! owner; registering a path again replaces the previous route.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::instance::InstanceRef;
use crate::broker::{Broker, Envelope};
use crate::core::errors::{ClusterError, Result};

/// One-shot outcome callback handed to a controller.
///
/// When the originator supplied none, a no-op is substituted, so a
/// controller that never completes cannot block anybody.
pub struct Completion {
    callback: Option<Box<dyn FnOnce(Value) + Send>>,
}

impl Completion {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(Value) + Send + 'static,
    {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    pub fn noop() -> Self {
        Self { callback: None }
    }

    /// Completion that publishes the outcome to `reply_to`
    pub fn publishing(broker: Arc<dyn Broker>, source: String, reply_to: String) -> Self {
        Self::new(move |outcome| broker.publish(Envelope::new(reply_to, source, outcome)))
    }

    pub fn is_noop(&self) -> bool {
        self.callback.is_none()
    }

    /// Deliver a raw outcome value
    pub fn complete(self, outcome: Value) {
        if let Some(callback) = self.callback {
            callback(outcome);
        }
    }

    /// Deliver `{"success": true, ...data}`. Non-object data lands under `data`.
    pub fn succeed(self, data: Value) {
        let outcome = match data {
            Value::Object(mut map) => {
                map.insert("success".to_string(), Value::Bool(true));
                Value::Object(map)
            }
            Value::Null => json!({"success": true}),
            other => json!({"success": true, "data": other}),
        };
        self.complete(outcome);
    }

    /// Deliver `{"success": false, "error": message}`
    pub fn fail(self, err: impl fmt::Display) {
        self.complete(json!({"success": false, "error": err.to_string()}));
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("noop", &self.is_noop())
            .finish()
    }
}

/// Handler behind a route.
///
/// Returning `Err` (or panicking) is an uncaught failure: it is logged and
/// reported to the owner's `on_error` hook, and serving continues. Business
/// failures should go through `completion.fail(..)` instead.
pub trait RouteController: Send + Sync {
    fn call(&self, payload: Value, completion: Completion) -> anyhow::Result<()>;
}

impl<F> RouteController for F
where
    F: Fn(Value, Completion) -> anyhow::Result<()> + Send + Sync,
{
    fn call(&self, payload: Value, completion: Completion) -> anyhow::Result<()> {
        self(payload, completion)
    }
}

/// Declarative description of a route, turned into a [`Route`] when
/// registered on an instance.
#[derive(Clone)]
pub struct RouteSetup {
    pub path: String,
    pub controller: Arc<dyn RouteController>,
    input_schema: Option<Arc<jsonschema::Validator>>,
}

impl RouteSetup {
    pub fn new<F>(path: impl Into<String>, controller: F) -> Self
    where
        F: Fn(Value, Completion) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::from_controller(path, Arc::new(controller))
    }

    pub fn from_controller(path: impl Into<String>, controller: Arc<dyn RouteController>) -> Self {
        Self {
            path: path.into(),
            controller,
            input_schema: None,
        }
    }

    /// Attach a JSON schema that payloads must satisfy before the controller runs
    pub fn with_schema(mut self, schema: &Value) -> Result<Self> {
        let validator = jsonschema::validator_for(schema).map_err(|e| {
            ClusterError::validation(format!(
                "Failed to compile input schema for {}: {}",
                self.path, e
            ))
        })?;
        self.input_schema = Some(Arc::new(validator));
        Ok(self)
    }
}

impl fmt::Debug for RouteSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteSetup")
            .field("path", &self.path)
            .field("input_schema", &self.input_schema.is_some())
            .finish()
    }
}

/// A route bound to its owning instance.
#[derive(Clone)]
pub struct Route {
    path: String,
    controller: Arc<dyn RouteController>,
    owner: InstanceRef,
    input_schema: Option<Arc<jsonschema::Validator>>,
}

impl Route {
    pub fn bind(setup: RouteSetup, owner: InstanceRef) -> Self {
        Self {
            path: setup.path,
            controller: setup.controller,
            owner,
            input_schema: setup.input_schema,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn owner(&self) -> &InstanceRef {
        &self.owner
    }

    pub fn controller(&self) -> &Arc<dyn RouteController> {
        &self.controller
    }

    /// Run the controller. Schema violations are answered through the
    /// completion and never reach the controller.
    pub fn invoke(&self, payload: Value, completion: Completion) -> anyhow::Result<()> {
        if let Some(validator) = &self.input_schema {
            if let Err(error) = validator.validate(&payload) {
                debug!(path = %self.path, error = %error, "Rejected payload failing input schema");
                completion.fail(format!("Invalid input: {}", error));
                return Ok(());
            }
        }
        self.controller.call(payload, completion)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("path", &self.path)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Routes owned by one instance, keyed by path.
#[derive(Clone, Debug, Default)]
pub struct RouteTable {
    routes: HashMap<String, Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a route, returning the one it replaced
    pub fn insert(&mut self, route: Route) -> Option<Route> {
        self.routes.insert(route.path.clone(), route)
    }

    pub fn get(&self, path: &str) -> Option<&Route> {
        self.routes.get(path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn owner() -> InstanceRef {
        InstanceRef {
            id: "owner".to_string(),
            tag_name: "owner".to_string(),
        }
    }

    fn capture() -> (Arc<Mutex<Vec<Value>>>, Completion) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let completion = Completion::new(move |outcome| sink.lock().unwrap().push(outcome));
        (seen, completion)
    }

    #[test]
    fn test_succeed_merges_object() {
        let (seen, completion) = capture();
        completion.succeed(json!({"reply": "pong"}));
        assert_eq!(seen.lock().unwrap()[0], json!({"success": true, "reply": "pong"}));

        let (seen, completion) = capture();
        completion.succeed(json!(42));
        assert_eq!(seen.lock().unwrap()[0], json!({"success": true, "data": 42}));
    }

    #[test]
    fn test_fail_carries_message() {
        let (seen, completion) = capture();
        completion.fail("thread not found");
        assert_eq!(
            seen.lock().unwrap()[0],
            json!({"success": false, "error": "thread not found"})
        );
    }

    #[test]
    fn test_noop_completion() {
        let completion = Completion::default();
        assert!(completion.is_noop());
        completion.succeed(json!({}));
    }

    #[test]
    fn test_reregistration_replaces() {
        let mut table = RouteTable::new();
        let first = RouteSetup::new("/api/ping", |_: Value, c: Completion| {
            c.complete(json!("first"));
            Ok(())
        });
        let second = RouteSetup::new("/api/ping", |_: Value, c: Completion| {
            c.complete(json!("second"));
            Ok(())
        });

        assert!(table.insert(Route::bind(first, owner())).is_none());
        assert!(table.insert(Route::bind(second, owner())).is_some());
        assert_eq!(table.len(), 1);

        let (seen, completion) = capture();
        table.get("/api/ping").unwrap().invoke(Value::Null, completion).unwrap();
        assert_eq!(seen.lock().unwrap()[0], json!("second"));
    }

    #[test]
    fn test_schema_rejects_before_controller() {
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();
        let setup = RouteSetup::new("/chat/send", move |_: Value, c: Completion| {
            *flag.lock().unwrap() = true;
            c.succeed(Value::Null);
            Ok(())
        })
        .with_schema(&json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        }))
        .unwrap();
        let route = Route::bind(setup, owner());

        let (seen, completion) = capture();
        route.invoke(json!({"txt": 1}), completion).unwrap();
        assert!(!*called.lock().unwrap());
        assert_eq!(seen.lock().unwrap()[0]["success"], json!(false));

        let (seen, completion) = capture();
        route.invoke(json!({"text": "hi"}), completion).unwrap();
        assert!(*called.lock().unwrap());
        assert_eq!(seen.lock().unwrap()[0], json!({"success": true}));
    }

    #[test]
    fn test_invalid_schema_is_rejected() {
        let result = RouteSetup::new("/x", |_: Value, _: Completion| Ok(()))
            .with_schema(&json!({"type": 12}));
        assert!(matches!(result, Err(ClusterError::Validation { .. })));
    }
}
