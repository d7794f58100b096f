use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

use crate::cluster::ClusterOptions;
use crate::error::{AtlasError, Result};
use crate::view_state::ViewState;

pub const CONFIG_FILE: &str = "atlas.json";
pub const USER_ENV: &str = "DEAL_ATLAS_USER";

/// Settings read from `atlas.json` in the data directory. Every field has a
/// default, so a partial file is fine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AtlasConfig {
    pub cluster: ClusterOptions,
    pub default_view: ViewState,
    pub view_state_debounce_ms: u64,
    pub current_user: String,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterOptions::default(),
            default_view: ViewState::default(),
            view_state_debounce_ms: 500,
            current_user: "analyst".to_string(),
        }
    }
}

impl AtlasConfig {
    /// Loads the config from `dir`. A missing file gives the defaults; a
    /// malformed one is an error. `DEAL_ATLAS_USER` overrides the user.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(CONFIG_FILE);
        let mut config = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<AtlasConfig>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                AtlasConfig::default()
            }
            Err(e) => return Err(e.into()),
        };
        if let Ok(user) = std::env::var(USER_ENV) {
            if !user.trim().is_empty() {
                config.current_user = user;
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.cluster.validate()?;
        if !self.default_view.is_valid() {
            return Err(AtlasError::Config(format!(
                "default view is out of range: {:?}",
                self.default_view
            )));
        }
        if self.current_user.trim().is_empty() {
            return Err(AtlasError::Config("current user is empty".into()));
        }
        Ok(())
    }

    pub fn view_state_debounce(&self) -> Duration {
        Duration::from_millis(self.view_state_debounce_ms)
    }
}
