//! Adapter exposing request/response capability providers (assistants,
//! messaging platforms, browsers) as routes.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::broker::address;
use crate::core::errors::Result;
use crate::instance::{Completion, RouteSetup};

/// An external provider reachable through `(request) -> response` calls.
#[async_trait]
pub trait Capability: Send + Sync + 'static {
    fn name(&self) -> String;

    /// Operations served, each becomes the route `/{prefix}/{operation}`
    fn operations(&self) -> Vec<String>;

    /// Optional JSON schema the request of `operation` must satisfy
    fn input_schema(&self, _operation: &str) -> Option<Value> {
        None
    }

    async fn handle(&self, operation: &str, request: Value) -> anyhow::Result<Value>;
}

/// One route per operation of `capability`.
///
/// Each call runs on its own task, so a slow provider does not hold up the
/// dispatcher; the result is delivered through the completion.
pub fn capability_routes(prefix: &str, capability: Arc<dyn Capability>) -> Result<Vec<RouteSetup>> {
    capability
        .operations()
        .into_iter()
        .map(|operation| {
            let path = address::action_path(prefix, &operation);
            let schema = capability.input_schema(&operation);
            let provider = capability.clone();
            let route = RouteSetup::new(path, move |request: Value, completion: Completion| {
                let provider = provider.clone();
                let operation = operation.clone();
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    warn!(capability = %provider.name(), operation = %operation, "No runtime to serve capability call");
                    completion.fail("capability call needs a tokio runtime");
                    return Ok(());
                };
                runtime.spawn(async move {
                    match provider.handle(&operation, request).await {
                        Ok(response) => completion.succeed(response),
                        Err(e) => {
                            debug!(capability = %provider.name(), operation = %operation, error = %e, "Capability call failed");
                            completion.fail(e);
                        }
                    }
                });
                Ok(())
            });
            match schema {
                Some(schema) => route.with_schema(&schema),
                None => Ok(route),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, LocalBroker, Subscription};
    use crate::instance::{Instance, InstanceSetup};
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Assistant that remembers messages per thread
    #[derive(Default)]
    struct Assistant {
        threads: Mutex<HashMap<String, Vec<String>>>,
    }

    #[async_trait]
    impl Capability for Assistant {
        fn name(&self) -> String {
            "assistant".to_string()
        }

        fn operations(&self) -> Vec<String> {
            vec!["send".to_string(), "history".to_string()]
        }

        fn input_schema(&self, _operation: &str) -> Option<Value> {
            Some(json!({
                "type": "object",
                "properties": {"thread_id": {"type": "string"}},
                "required": ["thread_id"]
            }))
        }

        async fn handle(&self, operation: &str, request: Value) -> anyhow::Result<Value> {
            let thread = request["thread_id"].as_str().unwrap_or_default().to_string();
            let mut threads = self.threads.lock().unwrap();
            match operation {
                "send" => {
                    let text = request["text"].as_str().unwrap_or_default().to_string();
                    threads.entry(thread).or_default().push(text);
                    Ok(Value::Null)
                }
                "history" => {
                    let messages = threads
                        .get(&thread)
                        .ok_or_else(|| anyhow::anyhow!("thread {} not found", thread))?;
                    Ok(json!({"messages": messages}))
                }
                other => anyhow::bail!("unknown operation {}", other),
            }
        }
    }

    async fn reply(replies: &mut Subscription) -> Value {
        tokio::time::timeout(Duration::from_secs(1), replies.next())
            .await
            .unwrap()
            .unwrap()
            .payload
    }

    #[tokio::test]
    async fn test_capability_over_routes() {
        let shared: Arc<dyn Broker> = Arc::new(LocalBroker::new());
        let routes = capability_routes("api", Arc::new(Assistant::default())).unwrap();
        let mut paths: Vec<_> = routes.iter().map(|r| r.path.clone()).collect();
        paths.sort();
        assert_eq!(paths, vec!["/api/history", "/api/send"]);

        let mut server = Instance::new(InstanceSetup { routes, ..Default::default() }, shared.clone());
        server.listen();

        let client = Instance::new(InstanceSetup::new(), shared.clone());
        let mut replies = shared.subscribe("/client");

        client.send_to("/api/history", &json!({"thread_id": "t1"}), "/client");
        assert_eq!(reply(&mut replies).await, json!({"success": false, "error": "thread t1 not found"}));

        client.send_to("/api/send", &json!({"thread_id": "t1", "text": "hi"}), "/client");
        assert_eq!(reply(&mut replies).await, json!({"success": true}));

        client.send_to("/api/history", &json!({"thread_id": "t1"}), "/client");
        assert_eq!(reply(&mut replies).await, json!({"success": true, "messages": ["hi"]}));

        client.send_to("/api/send", &json!({"text": "no thread"}), "/client");
        assert_eq!(reply(&mut replies).await["success"], json!(false));
    }
}
