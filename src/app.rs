use std::sync::Arc;
use tracing::warn;

use crate::access::{AccessControl, IdentityProvider};
use crate::auth::Admission;
use crate::config::Config;
use crate::room::{ConnectionTracker, RoomRegistry, RoomSettings};
use crate::store::DocumentStore;

/// Process-level coordinator. Everything the connection paths need is
/// constructed here and injected; no ambient globals. Dropping the `App`
/// drops the registry and with it the handles to every room task.
pub struct App {
    pub config: Config,
    pub admission: Admission,
    pub access: Arc<dyn AccessControl>,
    pub registry: Arc<RoomRegistry>,
    pub tracker: ConnectionTracker,
}

impl App {
    pub fn new(
        config: Config,
        store: Arc<dyn DocumentStore>,
        access: Arc<dyn AccessControl>,
        identities: Arc<dyn IdentityProvider>,
    ) -> Arc<Self> {
        let settings = RoomSettings {
            save_debounce: config.save_debounce(),
            snapshot_interval: config.snapshot_interval(),
        };

        let jwt_secret = config.auth_jwt_secret.clone().unwrap_or_else(|| {
            warn!("AUTH_JWT_SECRET not configured - falling back to a development secret");
            "dev-secret".to_string()
        });

        Arc::new(Self {
            admission: Admission::new(jwt_secret, identities),
            access,
            registry: RoomRegistry::new(store, settings),
            tracker: ConnectionTracker::new(),
            config,
        })
    }
}
