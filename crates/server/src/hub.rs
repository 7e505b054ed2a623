//! Connection hub
//!
//! In-process registry of room → connected clients with filtered local
//! fan-out. The map is mutated only by the hub's owner task, fed through
//! a channel; broadcasts take a read snapshot. Multiple connections per
//! user are allowed and each receives every targeted frame.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, RwLock};
use uuid::Uuid;

use crate::connection::Client;

/// Selects the recipients of one broadcast frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "arg", rename_all = "snake_case")]
pub enum Filter {
    /// Every client in the room, pending users included.
    All,
    /// Every client except one connection.
    ExceptClient(Uuid),
    /// Only clients whose user is an approved participant.
    ApprovedOnly,
    /// Every connection belonging to one user.
    OnlyUser(String),
}

enum Registration {
    Register(Client, oneshot::Sender<()>),
    Unregister {
        room_id: Uuid,
        client_id: Uuid,
        done: oneshot::Sender<()>,
    },
}

type RoomClients = HashMap<Uuid, HashMap<Uuid, Client>>;

#[derive(Clone)]
pub struct Hub {
    rooms: Arc<RwLock<RoomClients>>,
    reg_tx: mpsc::Sender<Registration>,
}

impl Hub {
    /// Start the hub's owner task and return a handle to it.
    pub fn start() -> Self {
        let rooms: Arc<RwLock<RoomClients>> = Arc::new(RwLock::new(HashMap::new()));
        let (reg_tx, mut reg_rx) = mpsc::channel(64);
        let map = rooms.clone();
        tokio::spawn(async move {
            while let Some(request) = reg_rx.recv().await {
                match request {
                    Registration::Register(client, done) => {
                        map.write()
                            .await
                            .entry(client.room_id)
                            .or_default()
                            .insert(client.id, client);
                        let _ = done.send(());
                    }
                    Registration::Unregister {
                        room_id,
                        client_id,
                        done,
                    } => {
                        let mut rooms = map.write().await;
                        if let Some(clients) = rooms.get_mut(&room_id) {
                            clients.remove(&client_id);
                            if clients.is_empty() {
                                rooms.remove(&room_id);
                            }
                        }
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { rooms, reg_tx }
    }

    /// Register a connection; resolves once the owner task has applied it.
    pub async fn register(&self, client: Client) {
        let (done, ack) = oneshot::channel();
        if self
            .reg_tx
            .send(Registration::Register(client, done))
            .await
            .is_ok()
        {
            let _ = ack.await;
        }
    }

    /// Drop a connection from the registry.
    pub async fn unregister(&self, room_id: Uuid, client_id: Uuid) {
        let (done, ack) = oneshot::channel();
        if self
            .reg_tx
            .send(Registration::Unregister {
                room_id,
                client_id,
                done,
            })
            .await
            .is_ok()
        {
            let _ = ack.await;
        }
    }

    /// Deliver a frame to the room's local connections. `approved` names
    /// the users allowed to receive approved-only traffic; under an
    /// `ApprovedOnly` filter anyone absent from the set is skipped, so an
    /// unresolvable room fails closed.
    pub async fn local_broadcast(
        &self,
        room_id: Uuid,
        frame: &str,
        filter: &Filter,
        approved: &HashSet<String>,
    ) {
        let rooms = self.rooms.read().await;
        let Some(clients) = rooms.get(&room_id) else {
            return;
        };
        for client in clients.values() {
            let deliver = match filter {
                Filter::All => true,
                Filter::ExceptClient(id) => client.id != *id,
                Filter::ApprovedOnly => approved.contains(&client.user_id),
                Filter::OnlyUser(user_id) => client.user_id == *user_id,
            };
            if deliver {
                client.send_raw(frame.to_owned());
            }
        }
    }

    /// Number of connections currently registered for a room.
    pub async fn client_count(&self, room_id: Uuid) -> usize {
        self.rooms
            .read()
            .await
            .get(&room_id)
            .map(|clients| clients.len())
            .unwrap_or(0)
    }
}
