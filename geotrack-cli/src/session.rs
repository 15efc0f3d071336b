use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
/// What this machine remembers between runs
pub struct Session {
    pub token: Option<String>,
    pub user: Option<Value>,
    /// Identifier of the device this machine registered as, used for owner checks
    pub owned_device: Option<String>,
}

pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored session, an empty one if nothing was saved yet
    pub fn load(&self) -> Result<Session> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("Session file {} is corrupt", self.path.display())),
            Err(why) if why.kind() == ErrorKind::NotFound => Ok(Session::default()),
            Err(why) => Err(why)
                .with_context(|| format!("Failed to read session file {}", self.path.display())),
        }
    }

    pub fn save(&self, session: &Session) -> Result {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("Failed to create session directory")?;
        }
        let raw = serde_json::to_string_pretty(session).context("Failed to serialize session")?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("Failed to write session file {}", self.path.display()))
    }

    pub fn update(&self, f: impl FnOnce(&mut Session)) -> Result<Session> {
        let mut session = self.load()?;
        f(&mut session);
        self.save(&session)?;
        Ok(session)
    }
}
