use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{info, warn};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

// Persisted session token so the CLI can skip the login prompt

#[derive(Serialize, Deserialize, Clone)]
pub struct StoredSession {
    pub api_url: String,
    pub email: String,
    token: String,
}

impl StoredSession {
    pub fn new(api_url: &str, email: &str, token: &str) -> Self {
        StoredSession {
            api_url: api_url.to_string(),
            email: email.to_string(),
            token: BASE64.encode(token),
        }
    }

    pub fn token(&self) -> Option<String> {
        let bytes = BASE64.decode(&self.token).ok()?;
        String::from_utf8(bytes).ok().filter(|token| !token.is_empty())
    }
}

static CONFIG_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Point the token file somewhere else (used by `--session-file`)
pub fn set_config_path_override(path: PathBuf) -> Result<()> {
    CONFIG_PATH_OVERRIDE
        .set(path)
        .map_err(|_| anyhow!("Session file path already set"))
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("teamsync");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

fn get_config_path() -> Result<PathBuf> {
    if let Some(path) = CONFIG_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_config_dir()?.join("session.json"))
}

pub fn save_session(session: &StoredSession) -> Result<()> {
    save_session_to(&get_config_path()?, session)
}

pub fn load_session() -> Result<Option<StoredSession>> {
    load_session_from(&get_config_path()?)
}

pub fn clear_session() -> Result<()> {
    clear_session_at(&get_config_path()?)
}

pub fn save_session_to(path: &Path, session: &StoredSession) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, session)?;
    info!("Session saved for {}", session.email);
    Ok(())
}

pub fn load_session_from(path: &Path) -> Result<Option<StoredSession>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    match serde_json::from_str::<StoredSession>(&contents) {
        Ok(session) => {
            info!("Loaded session for {} from {}", session.email, path.display());
            Ok(Some(session))
        }
        Err(e) => {
            warn!("Ignoring unreadable session file {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

pub fn clear_session_at(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
        info!("Removed stored session {}", path.display());
    }
    Ok(())
}
