//! Client connection handle
//!
//! Each WebSocket connection runs two cooperating tasks: a reader that
//! feeds inbound frames to the router, and a writer that drains this
//! module's bounded outbound queue sequentially. The handle itself is
//! cheap to clone and safe to share with the hub.

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Outbound queue capacity per connection.
pub const OUTBOUND_QUEUE: usize = 256;

/// Handle to one connected client. Identity is fixed at upgrade time.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: Uuid,
    pub user_id: String,
    pub room_id: Uuid,
    tx: mpsc::Sender<String>,
}

impl Client {
    /// Create a handle plus the receiving end drained by the writer task.
    pub fn new(user_id: String, room_id: Uuid) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        (
            Self {
                id: Uuid::new_v4(),
                user_id,
                room_id,
                tx,
            },
            rx,
        )
    }

    /// Serialize and enqueue a frame for this client alone.
    pub fn send(&self, msg: &ServerMessage) {
        match serde_json::to_string(msg) {
            Ok(frame) => self.send_raw(frame),
            Err(err) => warn!(error = %err, "failed to encode outbound frame"),
        }
    }

    /// Enqueue an already-serialized frame. Never blocks: a full queue
    /// drops the frame for this client so one slow reader cannot stall a
    /// room-wide broadcast.
    pub fn send_raw(&self, frame: String) {
        match self.tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    client_id = %self.id,
                    user_id = %self.user_id,
                    "outbound queue full, dropping frame"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(client_id = %self.id, "client gone, dropping frame");
            }
        }
    }
}
