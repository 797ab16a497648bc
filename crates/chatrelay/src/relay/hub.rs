//! Registry of live session relays.

use dashmap::DashMap;
use log::{debug, info};
use std::sync::Arc;

use super::RelaySettings;
use super::actor::{RelayHandle, ReleaseFn};
use crate::inference::InferenceBackend;
use crate::store::SessionStore;

/// Maps session ids to their relay, spawning relays on first use.
///
/// At most one relay runs per session id, so every connection to a session
/// shares the same state and event stream. A relay that stays idle with no
/// connections and no handles held outside the hub is removed and stops.
pub struct RelayHub {
    /// Session ID -> running relay
    relays: Arc<DashMap<String, RelayHandle>>,
    store: Arc<dyn SessionStore>,
    backend: Arc<dyn InferenceBackend>,
    settings: Arc<RelaySettings>,
}

impl RelayHub {
    pub fn new(
        store: Arc<dyn SessionStore>,
        backend: Arc<dyn InferenceBackend>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            relays: Arc::new(DashMap::new()),
            store,
            backend,
            settings: Arc::new(settings),
        }
    }

    /// Relay for `session_id`, started if none is running.
    pub fn relay(&self, session_id: &str) -> RelayHandle {
        let mut entry = self
            .relays
            .entry(session_id.to_string())
            .or_insert_with(|| self.spawn(session_id));

        if entry.is_closed() {
            debug!("Relay for session {} stopped, restarting", session_id);
            *entry = self.spawn(session_id);
        }

        entry.clone()
    }

    /// Relay for `session_id` if one is already running.
    pub fn get(&self, session_id: &str) -> Option<RelayHandle> {
        self.relays
            .get(session_id)
            .map(|r| r.clone())
            .filter(|r| !r.is_closed())
    }

    /// Ids of all sessions with a running relay.
    pub fn active_sessions(&self) -> Vec<String> {
        self.relays
            .iter()
            .filter(|r| !r.is_closed())
            .map(|r| r.key().clone())
            .collect()
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    fn spawn(&self, session_id: &str) -> RelayHandle {
        info!("Starting relay for session {}", session_id);
        RelayHandle::spawn(
            session_id,
            self.store.clone(),
            self.backend.clone(),
            self.settings.clone(),
            self.release_fn(session_id),
        )
    }

    /// Removes the session's entry if the hub holds the only handle to it.
    /// Dropping that handle closes the relay's queue and ends its task.
    fn release_fn(&self, session_id: &str) -> ReleaseFn {
        let relays = Arc::downgrade(&self.relays);
        let session_id = session_id.to_string();
        Box::new(move || {
            let Some(relays) = relays.upgrade() else {
                return false;
            };
            let released = relays
                .remove_if(&session_id, |_, relay| relay.is_sole_handle())
                .is_some();
            if released {
                info!("Released idle relay for session {}", session_id);
            }
            released
        })
    }
}
