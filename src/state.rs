use std::time::Duration;

use crate::call::CallTable;
use crate::chat::rooms::ActiveRooms;
use crate::store::Store;
use crate::ws::ConnectionRegistry;

/// Shared application state passed to all handlers via axum State extractor.
///
/// All routing state lives here rather than in module globals so tests can
/// construct isolated instances and teardown is tied to process lifetime.
#[derive(Clone)]
pub struct AppState {
    /// Data-access collaborator over the SQLite pool
    pub store: Store,
    /// Active WebSocket connections per user
    pub connections: ConnectionRegistry,
    /// Which conversation each user currently has open (refcounted per pair)
    pub rooms: ActiveRooms,
    /// In-flight call negotiations, at most one per user
    pub calls: CallTable,
    /// How long a call may ring before the caller gets a no-answer hangup
    pub ring_timeout: Duration,
}

impl AppState {
    pub fn new(store: Store, ring_timeout: Duration) -> Self {
        Self {
            store,
            connections: crate::ws::new_connection_registry(),
            rooms: ActiveRooms::new(),
            calls: CallTable::new(),
            ring_timeout,
        }
    }
}
