//! Module Loader
//!
//! Resolves module ids to files and turns module files into exported values.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::RequireError;
use crate::value::{CallResult, ErrorValue, Value};

/// Error type for module loading
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Failed to read module {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse module manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Unknown module entry '{0}'")]
    UnknownEntry(String),

    #[error("Module initialization failed: {0}")]
    Init(ErrorValue),
}

impl From<LoadError> for ErrorValue {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::Init(error) => error,
            other => ErrorValue::new(other.to_string()),
        }
    }
}

/// Turns a resolved module file into its exports.
///
/// `load` runs on the worker thread, inside that thread's runtime, so the
/// exports may spawn tasks or hold promises.
pub trait ModuleLoader: Send + Sync + 'static {
    fn load(&self, path: &Path) -> Result<Value, LoadError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Native modules
// ─────────────────────────────────────────────────────────────────────────────

/// Contents of a module file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleManifest {
    /// Name of the registered factory that builds the exports
    pub entry: String,
}

impl ModuleManifest {
    pub fn parse(content: &str) -> Result<Self, LoadError> {
        Ok(toml::from_str(content)?)
    }
}

type Factory = dyn Fn() -> CallResult + Send + Sync;

/// Loads TOML manifests whose `entry` names a Rust factory.
///
/// ```toml
/// entry = "math"
/// ```
#[derive(Clone, Default)]
pub struct NativeLoader {
    factories: Arc<DashMap<String, Arc<Factory>>>,
}

impl NativeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `entry`, replacing any previous one.
    pub fn register<F>(&self, entry: impl Into<String>, factory: F) -> &Self
    where
        F: Fn() -> CallResult + Send + Sync + 'static,
    {
        self.factories.insert(entry.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.factories.contains_key(entry)
    }

    pub fn entries(&self) -> Vec<String> {
        let mut entries: Vec<_> = self.factories.iter().map(|e| e.key().clone()).collect();
        entries.sort();
        entries
    }
}

impl ModuleLoader for NativeLoader {
    fn load(&self, path: &Path) -> Result<Value, LoadError> {
        let content = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest = ModuleManifest::parse(&content)?;

        // Clone the factory out so the map shard is not held while it runs.
        let factory = self
            .factories
            .get(&manifest.entry)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| LoadError::UnknownEntry(manifest.entry.clone()))?;

        tracing::debug!("[load:{}] entry {}", path.display(), manifest.entry);
        factory().map_err(LoadError::Init)
    }
}

impl fmt::Debug for NativeLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeLoader")
            .field("entries", &self.entries())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolution
// ─────────────────────────────────────────────────────────────────────────────

/// Resolve `id` relative to `base_dir`.
///
/// Candidates, in order: the path itself, the path with each extension
/// appended, then `index.<ext>` inside it. The result is canonical, so
/// different spellings of one file resolve to the same path.
pub fn resolve(base_dir: &Path, id: &str, extensions: &[String]) -> Result<PathBuf, RequireError> {
    let target = base_dir.join(id);

    let with_ext = extensions.iter().map(|ext| {
        let mut name = target.clone().into_os_string();
        name.push(".");
        name.push(ext);
        PathBuf::from(name)
    });
    let index = extensions
        .iter()
        .map(|ext| target.join(format!("index.{ext}")));

    let found = std::iter::once(target.clone())
        .chain(with_ext)
        .chain(index)
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| RequireError::NotFound {
            id: id.to_string(),
            base: base_dir.to_path_buf(),
        })?;

    found.canonicalize().map_err(|source| RequireError::Resolve {
        id: id.to_string(),
        source,
    })
}
