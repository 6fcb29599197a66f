use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedServerState {
    pub is_running: bool,
}

/// What survives a restart: whether the listener was running and the bind IP it used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default)]
    pub server_state: PersistedServerState,
    #[serde(default)]
    pub bind_ip: Option<Ipv4Addr>,
}

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable state falls back to defaults.
    pub async fn load(&self) -> PersistedState {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return PersistedState::default(),
            Err(e) => {
                crate::logging::warn_kv(
                    "state read failed, using defaults",
                    &[("path", &self.path.display().to_string()), ("error", &e.to_string())],
                );
                return PersistedState::default();
            }
        };
        match serde_json::from_str(&data) {
            Ok(state) => state,
            Err(e) => {
                crate::logging::warn_kv(
                    "state corrupt, using defaults",
                    &[("path", &self.path.display().to_string()), ("error", &e.to_string())],
                );
                PersistedState::default()
            }
        }
    }

    pub async fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let data = serde_json::to_vec_pretty(state).context("encode state json")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("rename {}", self.path.display()))?;
        Ok(())
    }

    /// Record the running flag, keeping the remembered bind IP when `bind_ip` is `None`.
    pub async fn record_running(&self, running: bool, bind_ip: Option<Ipv4Addr>) {
        let mut state = self.load().await;
        state.server_state.is_running = running;
        if bind_ip.is_some() {
            state.bind_ip = bind_ip;
        }
        if let Err(err) = self.save(&state).await {
            crate::logging::error_kv("state save failed", &[("error", &format!("{err:#}"))]);
        }
    }
}
