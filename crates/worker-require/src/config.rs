//! Configuration for worker-require.
//!
//! Per-call [`RequireOptions`] and process-level [`Settings`], the latter
//! read from the environment or from a `[worker_require]` table in a TOML
//! file:
//!
//! ```toml
//! [worker_require]
//! enabled = true
//! extensions = ["toml"]
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::loader::LoadError;

/// Environment variable that switches workers off.
pub const ENV_SWITCH: &str = "WORKER_REQUIRE";

/// Options for a single `require`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequireOptions {
    /// Share one worker per module path
    #[serde(default = "default_true")]
    pub cache: bool,
}

impl RequireOptions {
    /// Always spawn a dedicated worker.
    pub fn uncached() -> Self {
        Self { cache: false }
    }
}

impl Default for RequireOptions {
    fn default() -> Self {
        Self { cache: true }
    }
}

/// Process-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Run modules on workers; when off they are loaded in-process
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Extensions tried when a module id has none
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_extensions() -> Vec<String> {
    vec!["toml".to_string()]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            extensions: default_extensions(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    worker_require: Settings,
}

impl Settings {
    /// Settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Settings from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = match lookup(ENV_SWITCH) {
            Some(value) => !is_off(&value),
            None => true,
        };
        Self {
            enabled,
            ..Self::default()
        }
    }

    /// Parse the `[worker_require]` table of a TOML document. A document
    /// without the table yields the defaults.
    pub fn from_toml(content: &str) -> Result<Self, LoadError> {
        let file: SettingsFile = toml::from_str(content)?;
        Ok(file.worker_require)
    }

    /// Read settings from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_toml(&content)?;
        tracing::debug!("[Settings::load:{}] {:?}", path.display(), settings);
        Ok(settings)
    }
}

fn is_off(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "false" | "0" | "off"
    )
}
