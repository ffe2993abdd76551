// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cross-node fan-out. Every hub publishes locally originated deliveries
//! to the bus and feeds frames from other nodes into its local dispatch.

pub mod nats;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Header naming the node that published a frame.
pub const ORIGIN_HEADER: &str = "Ridehub-Origin";
/// Header scoping a frame to one role.
pub const ROLE_HEADER: &str = "Ridehub-Role";

/// One delivery on the bus: a serialized [`Message`](crate::message::Message)
/// plus routing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct BusFrame {
    pub origin: Option<String>,
    pub role: Option<String>,
    pub payload: Bytes,
}

pub trait Bus: Send + Sync + 'static {
    fn publish(&self, frame: BusFrame) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Subscribe to every frame published on the channel, including this
    /// node's own (callers filter by origin).
    fn subscribe(&self) -> BoxFuture<'_, anyhow::Result<BoxStream<'static, BusFrame>>>;
}

/// In-process bus. Hubs sharing one `LocalBus` behave like nodes sharing a
/// NATS subject.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<BusFrame>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Bus for LocalBus {
    fn publish(&self, frame: BusFrame) -> BoxFuture<'_, anyhow::Result<()>> {
        // No subscribers is not an error: a lone node still publishes.
        let _ = self.tx.send(frame);
        Box::pin(async { Ok(()) })
    }

    fn subscribe(&self) -> BoxFuture<'_, anyhow::Result<BoxStream<'static, BusFrame>>> {
        let rx = self.tx.subscribe();
        Box::pin(async move {
            let stream = BroadcastStream::new(rx).filter_map(|item| async move {
                match item {
                    Ok(frame) => Some(frame),
                    Err(e) => {
                        tracing::warn!("bus subscriber lagged: {e}");
                        None
                    }
                }
            });
            Ok(stream.boxed())
        })
    }
}
