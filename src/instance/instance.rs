use futures::stream::SelectAll;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::hooks::Hooks;
use super::routes::{Completion, Route, RouteSetup, RouteTable};
use crate::broker::{Broker, Envelope, Subscription};
use crate::core::errors::{ClusterError, Result};
use crate::core::task::TaskGuard;

/// Identity of an instance, used as hook receiver, route owner and parent link.
///
/// A child keeps only this descriptor of its parent, never a pointer, so it
/// cannot keep the parent alive and a snapshot of it never walks upwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceRef {
    pub id: String,
    pub tag_name: String,
}

/// Declarative record an instance is built from. Every field is optional.
#[derive(Clone, Debug, Default)]
pub struct InstanceSetup {
    pub tag_name: Option<String>,
    pub file_path: Option<String>,
    pub store: HashMap<String, Value>,
    pub routes: Vec<RouteSetup>,
    pub hooks: Hooks,
}

impl InstanceSetup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag_name(mut self, tag_name: impl Into<String>) -> Self {
        self.tag_name = Some(tag_name.into());
        self
    }

    pub fn file_path(mut self, file_path: impl Into<String>) -> Self {
        self.file_path = Some(file_path.into());
        self
    }

    pub fn value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.store.insert(key.into(), value.into());
        self
    }

    pub fn route(mut self, route: RouteSetup) -> Self {
        self.routes.push(route);
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }
}

/// Base addressable unit: identity, store, routes, hooks and outbound publishing.
pub struct Instance {
    id: String,
    tag_name: String,
    file_path: String,
    store: HashMap<String, Value>,
    routes: RouteTable,
    parent: Option<InstanceRef>,
    hooks: Hooks,
    broker: Arc<dyn Broker>,
    dispatcher: Option<Dispatcher>,
}

/// Running dispatcher: the task serving the routes and the channel that
/// hands it routes registered after `listen`.
struct Dispatcher {
    _task: TaskGuard,
    updates: mpsc::UnboundedSender<RouteUpdate>,
}

/// A route installed while listening, with the subscription for its path
/// when the dispatcher was not subscribed to it yet.
struct RouteUpdate {
    route: Route,
    subscription: Option<Subscription>,
}

impl Instance {
    pub fn new(setup: InstanceSetup, broker: Arc<dyn Broker>) -> Self {
        let id = cuid2::create_id();
        let tag_name = setup.tag_name.unwrap_or_else(|| id.clone());
        let mut instance = Self {
            id,
            tag_name,
            file_path: setup.file_path.unwrap_or_default(),
            store: setup.store,
            routes: RouteTable::new(),
            parent: None,
            hooks: setup.hooks,
            broker,
            dispatcher: None,
        };
        for route in setup.routes {
            instance.register_route(route);
        }
        instance
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tag_name(&self) -> &str {
        &self.tag_name
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn reference(&self) -> InstanceRef {
        InstanceRef {
            id: self.id.clone(),
            tag_name: self.tag_name.clone(),
        }
    }

    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.store.insert(key.into(), value.into());
    }

    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.store.get(key)
    }

    /// Typed read; `None` when the key is missing or holds another shape
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.store.get(key)?;
        match serde_json::from_value(value.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                debug!(instance = %self.tag_name, key = key, error = %e, "Stored value has unexpected shape");
                None
            }
        }
    }

    pub fn delete_value(&mut self, key: &str) -> Option<Value> {
        self.store.remove(key)
    }

    /// Copy of the whole store, used to seed spawned units
    pub fn snapshot_values(&self) -> HashMap<String, Value> {
        self.store.clone()
    }

    /// Merge inherited pairs into the store
    pub fn adopt_values(&mut self, values: HashMap<String, Value>) {
        self.store.extend(values);
    }

    /// Bind `setup` to this instance and install it, replacing any route at
    /// the same path. A listening instance hands the route to its running
    /// dispatcher, so envelopes are never served twice.
    pub fn register_route(&mut self, setup: RouteSetup) -> Option<Route> {
        let route = Route::bind(setup, self.reference());
        let path = route.path().to_string();
        let replaced = self.routes.insert(route.clone());
        if replaced.is_some() {
            debug!(instance = %self.tag_name, path = %path, "Replaced existing route");
        }
        if let Some(dispatcher) = &self.dispatcher {
            // subscribe here so nothing published after this call is missed
            let subscription = replaced.is_none().then(|| self.broker.subscribe(&path));
            if dispatcher.updates.send(RouteUpdate { route, subscription }).is_err() {
                warn!(instance = %self.tag_name, path = %path, "Dispatcher gone, route not served");
            }
        }
        replaced
    }

    pub fn lookup_route(&self, path: &str) -> Option<&Route> {
        self.routes.get(path)
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn parent(&self) -> Option<&InstanceRef> {
        self.parent.as_ref()
    }

    pub fn set_parent(&mut self, parent: InstanceRef) -> Result<()> {
        if parent.id == self.id {
            return Err(ClusterError::validation(format!(
                "Instance {} cannot be its own parent",
                self.tag_name
            )));
        }
        self.parent = Some(parent);
        Ok(())
    }

    /// Best-effort hand-off to the broker. Data that can't be turned into
    /// JSON is dropped without surfacing an error.
    pub fn publish<T: Serialize + ?Sized>(&self, path: &str, data: &T) {
        if let Some(envelope) = self.envelope(path, data) {
            self.broker.publish(envelope);
        }
    }

    /// Like [`publish`](Self::publish), asking the receiving controller to
    /// publish its outcome to `reply_to`.
    pub fn send_to<T: Serialize + ?Sized>(&self, path: &str, data: &T, reply_to: &str) {
        if let Some(envelope) = self.envelope(path, data) {
            self.broker.publish(envelope.with_reply_to(reply_to));
        }
    }

    fn envelope<T: Serialize + ?Sized>(&self, path: &str, data: &T) -> Option<Envelope> {
        match Envelope::encode(path, self.id.clone(), data) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                debug!(instance = %self.tag_name, path = path, error = %e, "Dropping unserializable payload");
                None
            }
        }
    }

    /// Run the `on_error` hook. Never fails.
    pub fn report_error(&self, err: &ClusterError) {
        warn!(instance = %self.tag_name, category = err.category(), error = %err, "Reporting error");
        self.hooks.error(&self.reference(), err);
    }

    /// Invoke a local route directly, bypassing the broker
    pub fn dispatch(&self, path: &str, payload: Value, completion: Completion) -> Result<()> {
        let route = self.routes.get(path).ok_or_else(|| {
            ClusterError::route(path, format!("no route registered on {}", self.tag_name))
        })?;
        serve(&self.reference(), &self.hooks, route, payload, completion);
        Ok(())
    }

    /// Subscribe every registered route on the broker and serve incoming
    /// envelopes from one dispatcher task. Calling it again restarts the
    /// dispatcher with the current route table; envelopes still queued for
    /// the old one are dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn listen(&mut self) {
        self.dispatcher = Some(spawn_dispatcher(
            self.reference(),
            self.routes.clone(),
            self.hooks.clone(),
            self.broker.clone(),
        ));
    }

    pub fn is_listening(&self) -> bool {
        self.dispatcher.is_some()
    }

    pub fn stop_listening(&mut self) {
        self.dispatcher = None;
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("tag_name", &self.tag_name)
            .field("file_path", &self.file_path)
            .field("routes", &self.routes.paths())
            .field("parent", &self.parent)
            .field("listening", &self.is_listening())
            .finish()
    }
}

/// Background task serving an instance's routes, one envelope at a time.
fn spawn_dispatcher(owner: InstanceRef, routes: RouteTable, hooks: Hooks, broker: Arc<dyn Broker>) -> Dispatcher {
    // Subscribe before spawning so nothing published after listen() is missed
    let streams: Vec<Subscription> = routes.iter().map(|route| broker.subscribe(route.path())).collect();
    let inbound = futures::stream::select_all(streams);
    let (updates, updates_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(dispatch_loop(owner, routes, hooks, broker, inbound, updates_rx));
    Dispatcher {
        _task: TaskGuard::new(&task),
        updates,
    }
}

async fn dispatch_loop(
    owner: InstanceRef,
    mut routes: RouteTable,
    hooks: Hooks,
    broker: Arc<dyn Broker>,
    mut inbound: SelectAll<Subscription>,
    mut updates: mpsc::UnboundedReceiver<RouteUpdate>,
) {
    loop {
        tokio::select! {
            biased;
            update = updates.recv() => {
                let Some(RouteUpdate { route, subscription }) = update else {
                    break;
                };
                if let Some(subscription) = subscription {
                    inbound.push(subscription);
                }
                debug!(instance = %owner.tag_name, path = %route.path(), "Serving new route");
                routes.insert(route);
            }
            Some(envelope) = inbound.next(), if !inbound.is_empty() => {
                notify_data(&owner, &hooks, &envelope);
                let Some(route) = routes.get(&envelope.path) else {
                    debug!(instance = %owner.tag_name, path = %envelope.path, "No route for envelope");
                    continue;
                };
                let completion = match envelope.reply_to {
                    Some(reply_to) => Completion::publishing(broker.clone(), owner.id.clone(), reply_to),
                    None => Completion::noop(),
                };
                serve(&owner, &hooks, route, envelope.payload, completion);
            }
        }
    }
    debug!(instance = %owner.tag_name, "Dispatcher stopped");
}

/// Run `on_data`; a panicking hook is reported like a failing controller
fn notify_data(owner: &InstanceRef, hooks: &Hooks, envelope: &Envelope) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| hooks.data(owner, &envelope.payload))) {
        let message = panic_message(panic.as_ref());
        error!(instance = %owner.tag_name, path = %envelope.path, error = %message, "on_data hook failed");
        hooks.error(owner, &ClusterError::route(envelope.path.clone(), message));
    }
}

/// Run one controller. Uncaught failures are logged and handed to
/// `on_error`; the caller keeps serving.
fn serve(owner: &InstanceRef, hooks: &Hooks, route: &Route, payload: Value, completion: Completion) {
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| route.invoke(payload, completion)));
    let message = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(panic) => panic_message(panic.as_ref()),
    };
    error!(instance = %owner.tag_name, path = %route.path(), error = %message, "Route controller failed");
    hooks.error(owner, &ClusterError::route(route.path(), message));
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalBroker;
    use pretty_assertions::assert_eq;
    use serde::ser::Error as _;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn broker() -> Arc<dyn Broker> {
        Arc::new(LocalBroker::new())
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> std::result::Result<S::Ok, S::Error> {
            Err(S::Error::custom("not transportable"))
        }
    }

    #[test]
    fn test_defaults() {
        let instance = Instance::new(InstanceSetup::new(), broker());
        assert_eq!(instance.tag_name(), instance.id());
        assert_eq!(instance.file_path(), "");
        assert!(instance.routes().is_empty());
        assert!(instance.parent().is_none());

        let other = Instance::new(InstanceSetup::new(), broker());
        assert_ne!(instance.id(), other.id());
    }

    #[test]
    fn test_store_roundtrip() {
        let mut instance = Instance::new(InstanceSetup::new().tag_name("api"), broker());
        instance.set_value("model", "gpt");
        instance.set_value("retries", 3);
        instance.set_value("model", "claude");

        assert_eq!(instance.get_value("model"), Some(&json!("claude")));
        assert_eq!(instance.get_as::<u32>("retries"), Some(3));
        assert_eq!(instance.get_as::<u32>("model"), None);
        assert_eq!(instance.delete_value("model"), Some(json!("claude")));
        assert_eq!(instance.get_value("model"), None);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut instance = Instance::new(InstanceSetup::new().value("token", "abc"), broker());
        let snapshot = instance.snapshot_values();
        instance.set_value("token", "changed");
        assert_eq!(snapshot.get("token"), Some(&json!("abc")));
    }

    #[test]
    fn test_parent_cannot_be_self() {
        let mut child = Instance::new(InstanceSetup::new(), broker());
        let parent = Instance::new(InstanceSetup::new().tag_name("manager"), broker());

        assert!(child.set_parent(child.reference()).is_err());
        child.set_parent(parent.reference()).unwrap();
        assert_eq!(child.parent().unwrap().tag_name, "manager");
    }

    #[test]
    fn test_dispatch_unknown_route() {
        let instance = Instance::new(InstanceSetup::new(), broker());
        let err = instance.dispatch("/missing", Value::Null, Completion::noop()).unwrap_err();
        assert_eq!(err.category(), "route");
    }

    #[test]
    fn test_controller_failure_reaches_on_error() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let hooks = Hooks::new().on_error(move |_, err| sink.lock().unwrap().push(err.to_string()));
        let instance = Instance::new(
            InstanceSetup::new()
                .hooks(hooks)
                .route(RouteSetup::new("/boom", |_, _| Err(anyhow::anyhow!("exploded"))))
                .route(RouteSetup::new("/panic", |_, _| panic!("kaboom"))),
            broker(),
        );

        instance.dispatch("/boom", Value::Null, Completion::noop()).unwrap();
        instance.dispatch("/panic", Value::Null, Completion::noop()).unwrap();

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("exploded"));
        assert!(errors[1].contains("kaboom"));
    }

    #[tokio::test]
    async fn test_publish_roundtrip_through_listener() {
        let shared = broker();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut receiver = Instance::new(
            InstanceSetup::new().tag_name("worker").route(RouteSetup::new(
                "/worker/echo",
                move |payload, completion| {
                    tx.send(payload.clone())?;
                    completion.succeed(payload);
                    Ok(())
                },
            )),
            shared.clone(),
        );
        receiver.listen();

        let sender = Instance::new(InstanceSetup::new(), shared.clone());
        let data = json!({"text": "hello", "n": [1, 2, 3]});
        sender.publish("/worker/echo", &data);

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(received, Some(data));
    }

    #[tokio::test]
    async fn test_unserializable_publish_is_silent() {
        let shared = broker();
        let mut replies = shared.subscribe("/sink");
        let sender = Instance::new(InstanceSetup::new(), shared.clone());

        sender.publish("/sink", &Unserializable);
        sender.publish("/sink", &json!("after"));

        let first = replies.next().await.unwrap();
        assert_eq!(first.payload, json!("after"));
    }

    #[tokio::test]
    async fn test_send_to_publishes_reply() {
        let shared = broker();
        let mut server = Instance::new(
            InstanceSetup::new().route(RouteSetup::new("/api/ping", |_, completion| {
                completion.succeed(json!({"reply": "pong"}));
                Ok(())
            })),
            shared.clone(),
        );
        server.listen();

        let mut replies = shared.subscribe("/client/replies");
        let client = Instance::new(InstanceSetup::new(), shared.clone());
        client.send_to("/api/ping", &json!({}), "/client/replies");

        let reply = tokio::time::timeout(Duration::from_secs(1), replies.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.payload, json!({"success": true, "reply": "pong"}));
        assert_eq!(reply.source, server.id());
    }

    #[tokio::test]
    async fn test_register_while_listening_serves_new_route() {
        let shared = broker();
        let mut instance = Instance::new(InstanceSetup::new(), shared.clone());
        instance.listen();

        let (tx, mut rx) = mpsc::unbounded_channel();
        instance.register_route(RouteSetup::new("/late", move |payload, _| {
            tx.send(payload)?;
            Ok(())
        }));

        instance.publish("/late", &json!(7));
        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(received, Some(json!(7)));
    }

    #[tokio::test]
    async fn test_replaced_route_served_once_by_new_controller() {
        let shared = broker();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let old_tx = tx.clone();
        let mut instance = Instance::new(
            InstanceSetup::new().route(RouteSetup::new("/count", move |_, _| {
                old_tx.send("old")?;
                Ok(())
            })),
            shared.clone(),
        );
        instance.listen();

        let other_tx = tx.clone();
        instance.register_route(RouteSetup::new("/other", move |_, _| {
            other_tx.send("other")?;
            Ok(())
        }));
        instance.register_route(RouteSetup::new("/count", move |_, _| {
            tx.send("new")?;
            Ok(())
        }));

        instance.publish("/count", &json!(1));
        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(received, Some("new"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_panicking_data_hook_keeps_dispatcher_alive() {
        let shared = broker();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let hooks = Hooks::new()
            .on_data(|_, payload| {
                if payload == &json!("bad") {
                    panic!("hook blew up");
                }
            })
            .on_error(move |_, err| sink.lock().unwrap().push(err.to_string()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut instance = Instance::new(
            InstanceSetup::new().hooks(hooks).route(RouteSetup::new("/in", move |payload, _| {
                tx.send(payload)?;
                Ok(())
            })),
            shared.clone(),
        );
        instance.listen();

        instance.publish("/in", &json!("bad"));
        instance.publish("/in", &json!("good"));

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first, Some(json!("bad")));
        assert_eq!(second, Some(json!("good")));
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("hook blew up"));
    }
}
