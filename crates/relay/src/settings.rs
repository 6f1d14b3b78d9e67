use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug)]
pub enum SettingsError {
    Io,
    Serialization,
}

impl Display for SettingsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "settings io failure"),
            Self::Serialization => write!(f, "settings serialization failure"),
        }
    }
}

impl Error for SettingsError {}

/// User-controlled relay behavior. Missing fields fall back to the defaults,
/// so a settings file from an older build still loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    pub enabled: bool,
    pub sound: bool,
    pub show_message_content: bool,
    pub show_friend_requests: bool,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sound: true,
            show_message_content: true,
            show_friend_requests: true,
        }
    }
}

/// JSON-file backed settings persistence. Settings are read once at relay
/// startup and on explicit update, never watched.
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Loads settings, falling back to defaults on any failure. The fallback
    /// is persisted so the next run starts from a valid file.
    pub fn load(&self) -> RelaySettings {
        match fs::read(&self.path) {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(settings) => settings,
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "settings file unreadable, using defaults");
                    self.reset_to_defaults()
                }
            },
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "settings file missing, using defaults");
                self.reset_to_defaults()
            }
        }
    }

    pub fn update(&self, settings: &RelaySettings) -> Result<(), SettingsError> {
        let body = serde_json::to_vec_pretty(settings).map_err(|_| SettingsError::Serialization)?;
        fs::write(&self.path, body).map_err(|_| SettingsError::Io)
    }

    fn reset_to_defaults(&self) -> RelaySettings {
        let defaults = RelaySettings::default();
        if let Err(err) = self.update(&defaults) {
            warn!(path = %self.path.display(), error = %err, "default settings could not be persisted");
        }
        defaults
    }
}
