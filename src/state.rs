//! Session registry: session id -> environment handle.

use crate::controller::EnvironmentHandle;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// One logical sandbox instance.
#[derive(Debug)]
pub struct SessionSlot {
    pub id: String,
    pub environment: Option<EnvironmentHandle>,
    pub created_at: Instant,
    pub last_used: Instant,
}

impl SessionSlot {
    fn new(id: &str) -> Self {
        let now = Instant::now();
        Self {
            id: id.to_string(),
            environment: None,
            created_at: now,
            last_used: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }
}

/// Locked per session so start/stop on one id are serialized.
pub type SessionCell = Arc<Mutex<SessionSlot>>;

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub environment_id: Option<String>,
    pub age_secs: u64,
    pub idle_secs: u64,
}

/// Thread-safe session storage.
#[derive(Debug, Default)]
pub struct Sessions {
    inner: RwLock<HashMap<String, SessionCell>>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cell for `id`, inserted atomically if absent.
    pub async fn entry(&self, id: &str) -> SessionCell {
        if let Some(cell) = self.inner.read().await.get(id) {
            return cell.clone();
        }
        self.inner
            .write()
            .await
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionSlot::new(id))))
            .clone()
    }

    pub async fn get(&self, id: &str) -> Option<SessionCell> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop the entry if it holds no environment.
    pub async fn remove_if_idle(&self, id: &str) {
        let mut sessions = self.inner.write().await;
        let vacant = match sessions.get(id) {
            Some(cell) => cell.try_lock().is_ok_and(|slot| slot.environment.is_none()),
            None => false,
        };
        if vacant {
            sessions.remove(id);
        }
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let cells: Vec<SessionCell> = self.inner.read().await.values().cloned().collect();
        let mut list = Vec::with_capacity(cells.len());
        for cell in cells {
            let slot = cell.lock().await;
            list.push(SessionInfo {
                id: slot.id.clone(),
                environment_id: slot.environment.as_ref().map(|h| h.id.clone()),
                age_secs: slot.created_at.elapsed().as_secs(),
                idle_secs: slot.idle_for().as_secs(),
            });
        }
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }
}
