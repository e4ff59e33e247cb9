/// Coordination backplane seam
///
/// The backplane is a key-value store with TTLs plus publish/subscribe. The
/// resilient channel only ever talks to it through this trait.
/// `MemoryBackplane` is the in-process implementation used for standalone
/// deployments and tests; it can be taken offline to simulate outages.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Messages of one subscription; the stream ends when the connection is lost
pub type Subscription = mpsc::Receiver<String>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackplaneError {
    #[error("backplane unavailable: {0}")]
    Unavailable(String),

    #[error("backplane call timed out")]
    Timeout,

    #[error("backplane rejected command: {0}")]
    Command(String),
}

impl BackplaneError {
    /// Whether the failure means the connection itself is gone
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, BackplaneError::Unavailable(_) | BackplaneError::Timeout)
    }
}

#[async_trait]
pub trait Backplane: Send + Sync {
    async fn ping(&self) -> Result<(), BackplaneError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BackplaneError>;

    async fn get(&self, key: &str) -> Result<Option<String>, BackplaneError>;

    /// Publish to a channel, returning how many subscribers received it
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, BackplaneError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BackplaneError>;
}

const SUBSCRIPTION_BUFFER: usize = 1024;

#[derive(Debug, Default)]
struct MemoryState {
    values: HashMap<String, (String, Option<Instant>)>,
    subscribers: HashMap<String, Vec<mpsc::Sender<String>>>,
}

/// In-process backplane
#[derive(Debug)]
pub struct MemoryBackplane {
    state: Mutex<MemoryState>,
    online: AtomicBool,
    calls: AtomicU64,
}

impl Default for MemoryBackplane {
    fn default() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            online: AtomicBool::new(true),
            calls: AtomicU64::new(0),
        }
    }
}

impl MemoryBackplane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the backplane offline (dropping every open subscription) or bring it back
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if !online {
            self.state.lock().subscribers.clear();
            tracing::debug!("Memory backplane taken offline");
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Number of calls that reached the backplane, including failed ones
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Current subscriber count for `channel`
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.state
            .lock()
            .subscribers
            .get(channel)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Value stored under `key`, bypassing the online check
    pub fn peek(&self, key: &str) -> Option<String> {
        let state = self.state.lock();
        state
            .values
            .get(key)
            .filter(|(_, expires_at)| expires_at.map_or(true, |at| at > Instant::now()))
            .map(|(value, _)| value.clone())
    }

    fn check(&self) -> Result<(), BackplaneError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.is_online() {
            Ok(())
        } else {
            Err(BackplaneError::Unavailable("connection refused".to_string()))
        }
    }
}

#[async_trait]
impl Backplane for MemoryBackplane {
    async fn ping(&self) -> Result<(), BackplaneError> {
        self.check()
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BackplaneError> {
        self.check()?;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.state
            .lock()
            .values
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackplaneError> {
        self.check()?;
        let mut state = self.state.lock();
        let expired = match state.values.get(key) {
            Some((value, expires_at)) => {
                if expires_at.map_or(true, |at| at > Instant::now()) {
                    return Ok(Some(value.clone()));
                }
                true
            }
            None => false,
        };
        if expired {
            state.values.remove(key);
        }
        Ok(None)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, BackplaneError> {
        self.check()?;
        let mut state = self.state.lock();
        let Some(subscribers) = state.subscribers.get_mut(channel) else {
            return Ok(0);
        };

        let mut delivered = 0;
        subscribers.retain(|tx| match tx.try_send(payload.to_string()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(channel, "Subscriber lagging, message dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BackplaneError> {
        self.check()?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.state
            .lock()
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let backplane = MemoryBackplane::new();
        let mut first = backplane.subscribe("events").await.unwrap();
        let mut second = backplane.subscribe("events").await.unwrap();

        assert_eq!(backplane.publish("events", "hello").await.unwrap(), 2);
        assert_eq!(first.recv().await.as_deref(), Some("hello"));
        assert_eq!(second.recv().await.as_deref(), Some("hello"));
        assert_eq!(backplane.publish("nobody", "x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn going_offline_closes_subscriptions() {
        let backplane = MemoryBackplane::new();
        let mut sub = backplane.subscribe("events").await.unwrap();

        backplane.set_online(false);
        assert_eq!(sub.recv().await, None);
        assert!(matches!(backplane.ping().await, Err(BackplaneError::Unavailable(_))));
        assert!(backplane.get("k").await.is_err());

        backplane.set_online(true);
        assert!(backplane.ping().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn values_expire_after_ttl() {
        let backplane = MemoryBackplane::new();
        backplane.set("k", "v", Some(Duration::from_secs(300))).await.unwrap();
        backplane.set("forever", "v", None).await.unwrap();
        assert_eq!(backplane.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(backplane.get("k").await.unwrap(), None);
        assert_eq!(backplane.get("forever").await.unwrap().as_deref(), Some("v"));
    }
}
