use chrono::NaiveDateTime;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stream of envelopes delivered to one subscribed path.
pub type Subscription = BoxStream<'static, Envelope>;

/// Unit of delivery on the broker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    pub timestamp: NaiveDateTime,
    pub path: String,
    pub source: String, // id of the publishing instance
    pub reply_to: Option<String>,
    pub payload: Value,
}

impl Envelope {
    pub fn new(path: impl Into<String>, source: impl Into<String>, payload: Value) -> Self {
        Self {
            timestamp: chrono::Local::now().naive_local(),
            path: path.into(),
            source: source.into(),
            reply_to: None,
            payload,
        }
    }

    /// Serialize `data` into an envelope payload
    pub fn encode<T: Serialize + ?Sized>(
        path: impl Into<String>,
        source: impl Into<String>,
        data: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(path, source, serde_json::to_value(data)?))
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// Fire-and-forget transport contract.
///
/// `publish` must never block and never report delivery failure to the
/// caller: delivery is at-most-once. A subscriber only observes envelopes
/// published after its `subscribe` call returned.
pub trait Broker: Send + Sync + 'static {
    /// Hand an envelope to the transport
    fn publish(&self, envelope: Envelope);

    /// Start listening on `path`
    fn subscribe(&self, path: &str) -> Subscription;

    /// Number of live subscribers on `path`
    fn subscriber_count(&self, _path: &str) -> usize {
        0
    }
}
