use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::error::StoreError;
use crate::persist::{lock_unpoisoned, read_json_document, write_json_atomic};
use crate::schema::SessionState;

/// Durable holder of the active session's identity.
///
/// Every mutation rewrites the whole document before the in-memory copy is
/// updated, so readers never see a state that was not also persisted and
/// `clear` can never leave only some fields removed.
#[derive(Debug)]
pub struct SessionStateStore {
    path: Option<PathBuf>,
    state: Mutex<SessionState>,
}

impl SessionStateStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let state = read_json_document::<SessionState>(path)?
            .map(normalize_state)
            .unwrap_or_default();
        debug!(path = %path.display(), has_session = state.session_id.is_some(), "opened session state");

        Ok(Self {
            path: Some(path.to_path_buf()),
            state: Mutex::new(state),
        })
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(SessionState::default()),
        }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionState {
        lock_unpoisoned(&self.state).clone()
    }

    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        lock_unpoisoned(&self.state).session_id.clone()
    }

    #[must_use]
    pub fn client_session_id(&self) -> Option<String> {
        lock_unpoisoned(&self.state).client_session_id.clone()
    }

    #[must_use]
    pub fn updated_at_ms(&self) -> Option<i64> {
        lock_unpoisoned(&self.state).updated_at_ms
    }

    pub fn set_session_id(&self, session_id: Option<&str>) -> Result<(), StoreError> {
        let value = session_id.and_then(normalize_id);
        self.update(|state| state.session_id = value)
    }

    pub fn set_client_session_id(&self, client_session_id: Option<&str>) -> Result<(), StoreError> {
        let value = client_session_id.and_then(normalize_id);
        self.update(|state| state.client_session_id = value)
    }

    pub fn set_updated_at_ms(&self, updated_at_ms: Option<i64>) -> Result<(), StoreError> {
        let value = updated_at_ms.and_then(normalize_timestamp);
        self.update(|state| state.updated_at_ms = value)
    }

    /// Stores a server session assignment together with its timestamp.
    pub fn advance(&self, session_id: Option<&str>, updated_at_ms: i64) -> Result<(), StoreError> {
        let session_id = session_id.and_then(normalize_id);
        let updated_at_ms = normalize_timestamp(updated_at_ms);
        self.update(|state| {
            if session_id.is_some() {
                state.session_id = session_id;
            }
            state.updated_at_ms = updated_at_ms;
        })
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.update(|state| *state = SessionState::default())
    }

    fn update(&self, mutate: impl FnOnce(&mut SessionState)) -> Result<(), StoreError> {
        let mut state = lock_unpoisoned(&self.state);
        let mut next = state.clone();
        mutate(&mut next);
        if next == *state {
            return Ok(());
        }

        if let Some(path) = &self.path {
            write_json_atomic(path, &next)?;
        }
        *state = next;
        Ok(())
    }
}

fn normalize_state(state: SessionState) -> SessionState {
    SessionState {
        session_id: state.session_id.as_deref().and_then(normalize_id),
        client_session_id: state.client_session_id.as_deref().and_then(normalize_id),
        updated_at_ms: state.updated_at_ms.and_then(normalize_timestamp),
    }
}

fn normalize_id(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

fn normalize_timestamp(value: i64) -> Option<i64> {
    (value > 0).then_some(value)
}
