use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use futures::{Stream, StreamExt, future};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use utoipa::ToSchema;

use crate::models::MaterialRecord;

/// MaterialEvent
///
/// One change pushed to live list views.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MaterialEvent {
    Created { record: MaterialRecord },
    Updated { record: MaterialRecord },
}

impl MaterialEvent {
    pub fn record(&self) -> &MaterialRecord {
        match self {
            MaterialEvent::Created { record } | MaterialEvent::Updated { record } => record,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MaterialEvent::Created { .. } => "created",
            MaterialEvent::Updated { .. } => "updated",
        }
    }
}

/// MaterialFeed
///
/// Fan-out of material changes to every open list view. Cheap to clone; all clones share
/// one channel. A subscriber that falls more than `capacity` events behind skips ahead.
#[derive(Clone)]
pub struct MaterialFeed {
    tx: broadcast::Sender<MaterialEvent>,
    active: Arc<AtomicUsize>,
}

impl MaterialFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn publish(&self, event: MaterialEvent) {
        // No receivers is the normal idle state.
        let delivered = self.tx.send(event).unwrap_or(0);
        tracing::debug!(subscribers = delivered, "material event published");
    }

    /// subscribe
    ///
    /// Opens a subscription as a stream. The subscription lives exactly as long as the
    /// returned stream: dropping it (client disconnect, view teardown) cancels it.
    pub fn subscribe(&self) -> impl Stream<Item = MaterialEvent> + Send + use<> {
        let guard = SubscriptionGuard::open(Arc::clone(&self.active));
        BroadcastStream::new(self.tx.subscribe()).filter_map(move |item| {
            let _held = &guard;
            let event = match item {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "feed subscriber lagged, events dropped");
                    None
                }
            };
            future::ready(event)
        })
    }

    pub fn active_subscribers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl Default for MaterialFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

struct SubscriptionGuard {
    active: Arc<AtomicUsize>,
}

impl SubscriptionGuard {
    fn open(active: Arc<AtomicUsize>) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(active = now, "feed subscription opened");
        Self { active }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let now = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        tracing::debug!(active = now, "feed subscription cancelled");
    }
}
