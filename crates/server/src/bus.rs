//! Cross-instance broadcast bus
//!
//! Mirrors every post-persistence broadcast envelope onto a Redis topic
//! partitioned by room id, and applies envelopes published by other
//! instances locally. Delivery is at-most-once per frame per instance and
//! ordering holds per publisher only. Envelopes are never republished.

use std::sync::Arc;

use futures_util::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::hub::{Filter, Hub};
use crate::registry::RoomRegistry;

const CHANNEL_PREFIX: &str = "huddle:broadcast:";

/// One mirrored broadcast. `frame` is the already-serialized outbound
/// JSON; the frame was authorized and persisted before publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Publishing instance; receivers skip their own envelopes.
    pub origin: Uuid,
    pub room_id: Uuid,
    pub frame: String,
    pub filter: Filter,
}

#[derive(Clone)]
pub struct Bus {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
    origin: Uuid,
}

impl Bus {
    /// Connect and verify the server is reachable.
    pub async fn connect(url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            client,
            conn,
            origin: Uuid::new_v4(),
        })
    }

    /// Mirror a frame that was already delivered locally. Failures are
    /// logged and swallowed: local delivery succeeded and persistence is
    /// authoritative.
    pub async fn publish(&self, room_id: Uuid, frame: &str, filter: &Filter) {
        let envelope = Envelope {
            origin: self.origin,
            room_id,
            frame: frame.to_owned(),
            filter: filter.clone(),
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode bus envelope");
                return;
            }
        };
        let mut conn = self.conn.clone();
        if let Err(err) = conn
            .publish::<_, _, ()>(format!("{CHANNEL_PREFIX}{room_id}"), payload)
            .await
        {
            warn!(error = %err, room_id = %room_id, "failed to publish to bus");
        }
    }

    /// Listen for envelopes from other instances and perform the
    /// local-only form of each broadcast.
    pub async fn run(self, hub: Hub, registry: Arc<RoomRegistry>) -> redis::RedisResult<()> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(format!("{CHANNEL_PREFIX}*")).await?;
        info!("bus subscription started");

        let mut stream = pubsub.on_message();
        while let Some(message) = stream.next().await {
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "unreadable bus message");
                    continue;
                }
            };
            let envelope: Envelope = match serde_json::from_str(&payload) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(error = %err, "undecodable bus envelope");
                    continue;
                }
            };
            if envelope.origin == self.origin {
                continue;
            }
            let approved = registry.approved_users(envelope.room_id).await;
            hub.local_broadcast(envelope.room_id, &envelope.frame, &envelope.filter, &approved)
                .await;
        }
        Ok(())
    }
}
