use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

/// Process-wide map of identity to live connections. Lets multi-device and
/// multi-tab presence work: an identity is online as long as any of its
/// connections is.
#[derive(Default)]
pub struct ConnectionTracker {
    connections: Mutex<HashMap<String, HashSet<Uuid>>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, user_id: &str, conn_id: Uuid) {
        self.connections
            .lock()
            .unwrap()
            .entry(user_id.to_string())
            .or_default()
            .insert(conn_id);
    }

    /// Returns true if this was the identity's last live connection.
    pub fn unregister(&self, user_id: &str, conn_id: Uuid) -> bool {
        let mut map = self.connections.lock().unwrap();
        if let Some(conns) = map.get_mut(user_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                map.remove(user_id);
                return true;
            }
        }
        false
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.connections
            .lock()
            .unwrap()
            .get(user_id)
            .map(|c| c.len())
            .unwrap_or(0)
    }
}
