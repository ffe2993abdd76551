// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! NATS-backed bus. All nodes publish and subscribe on one subject; routing
//! metadata travels in message headers.

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tracing::info;

use super::{Bus, BusFrame, ORIGIN_HEADER, ROLE_HEADER};

/// Connect to NATS. Fails fast when the server is unreachable.
pub async fn connect(url: &str, token: Option<&str>) -> anyhow::Result<async_nats::Client> {
    let mut opts = async_nats::ConnectOptions::new().name("ridehub");
    if let Some(token) = token {
        opts = opts.token(token.to_owned());
    }

    info!(url, "connecting to NATS");
    let client = opts.connect(url).await?;
    info!("NATS connected");
    Ok(client)
}

pub struct NatsBus {
    client: async_nats::Client,
    subject: String,
}

impl NatsBus {
    pub fn new(client: async_nats::Client, subject: impl Into<String>) -> Self {
        Self { client, subject: subject.into() }
    }
}

impl Bus for NatsBus {
    fn publish(&self, frame: BusFrame) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let mut headers = async_nats::HeaderMap::new();
            if let Some(ref origin) = frame.origin {
                headers.insert(ORIGIN_HEADER, origin.as_str());
            }
            if let Some(ref role) = frame.role {
                headers.insert(ROLE_HEADER, role.as_str());
            }
            self.client.publish_with_headers(self.subject.clone(), headers, frame.payload).await?;
            Ok(())
        })
    }

    fn subscribe(&self) -> BoxFuture<'_, anyhow::Result<BoxStream<'static, BusFrame>>> {
        Box::pin(async move {
            let subscriber = self.client.subscribe(self.subject.clone()).await?;
            let stream = subscriber.map(|msg| {
                let header = |name: &str| {
                    msg.headers.as_ref().and_then(|h| h.get(name)).map(|v| v.as_str().to_owned())
                };
                BusFrame {
                    origin: header(ORIGIN_HEADER),
                    role: header(ROLE_HEADER),
                    payload: msg.payload.clone(),
                }
            });
            Ok(stream.boxed())
        })
    }
}
