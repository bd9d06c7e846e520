use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{AgentError, Result};

/// Launch spec for one tool plugin exposed to the assistant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginLaunch {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Content-addressed, reference-counted on-disk plugin config files.
///
/// Identical configurations share one file; the file is removed when the
/// last holder drops its handle. `sweep` clears leftovers from previous
/// process lifetimes.
pub struct PluginConfigStore {
    dir: PathBuf,
    refs: Mutex<HashMap<String, usize>>,
}

impl PluginConfigStore {
    pub fn new() -> Result<Arc<Self>> {
        let dir = std::env::temp_dir().join("maestro-plugins");
        std::fs::create_dir_all(&dir)?;
        Ok(Arc::new(Self {
            dir,
            refs: Mutex::new(HashMap::new()),
        }))
    }

    #[cfg(test)]
    fn new_at(dir: PathBuf) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&dir)?;
        Ok(Arc::new(Self {
            dir,
            refs: Mutex::new(HashMap::new()),
        }))
    }

    /// Obtain a handle to the config file for `servers`, writing it if this
    /// content is not on disk yet.
    pub fn acquire(
        self: &Arc<Self>,
        servers: &BTreeMap<String, PluginLaunch>,
    ) -> Result<PluginConfigHandle> {
        // BTreeMap keys give a canonical ordering, so identical configs
        // hash identically.
        let body = serde_json::to_string(&serde_json::json!({ "mcpServers": servers }))
            .map_err(|e| AgentError::PluginConfig(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(body.as_bytes());
        let key = hex::encode(&hasher.finalize()[..8]);
        let path = self.dir.join(format!("plugins-{key}.json"));

        {
            let mut refs = self.refs.lock().unwrap();
            let count = refs.entry(key.clone()).or_insert(0);
            if *count == 0 || !path.exists() {
                std::fs::write(&path, &body)?;
                debug!(path = %path.display(), "plugin config written");
            }
            *count += 1;
        }

        Ok(PluginConfigHandle {
            path,
            key,
            store: Arc::clone(self),
        })
    }

    /// Remove config files with no live holders. Run at process start and
    /// exit to catch files orphaned by a crash.
    pub fn sweep(&self) {
        let refs = self.refs.lock().unwrap();
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(key) = name
                .strip_prefix("plugins-")
                .and_then(|s| s.strip_suffix(".json"))
            else {
                continue;
            };
            if refs.get(key).copied().unwrap_or(0) == 0 {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    warn!(file = %name, "plugin config sweep failed: {e}");
                }
            }
        }
    }

    fn release(&self, key: &str, path: &Path) {
        let mut refs = self.refs.lock().unwrap();
        if let Some(count) = refs.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                refs.remove(key);
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

/// Keeps the shared config file alive; dropping the last handle for a given
/// content removes the file.
pub struct PluginConfigHandle {
    path: PathBuf,
    key: String,
    store: Arc<PluginConfigStore>,
}

impl PluginConfigHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PluginConfigHandle {
    fn drop(&mut self) {
        self.store.release(&self.key, &self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch(cmd: &str) -> PluginLaunch {
        PluginLaunch {
            command: cmd.into(),
            args: vec!["serve".into()],
            env: BTreeMap::new(),
        }
    }

    fn servers(cmd: &str) -> BTreeMap<String, PluginLaunch> {
        let mut map = BTreeMap::new();
        map.insert("ask_user".to_string(), launch(cmd));
        map
    }

    #[test]
    fn identical_configs_share_one_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PluginConfigStore::new_at(tmp.path().join("plugins")).unwrap();

        let a = store.acquire(&servers("/bin/plugin")).unwrap();
        let b = store.acquire(&servers("/bin/plugin")).unwrap();
        assert_eq!(a.path(), b.path());

        let path = a.path().to_path_buf();
        drop(a);
        assert!(path.exists(), "file must survive while a holder remains");
        drop(b);
        assert!(!path.exists(), "file must go with the last holder");
    }

    #[test]
    fn different_configs_get_different_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PluginConfigStore::new_at(tmp.path().join("plugins")).unwrap();

        let a = store.acquire(&servers("/bin/one")).unwrap();
        let b = store.acquire(&servers("/bin/two")).unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn sweep_removes_only_orphans() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("plugins");
        let store = PluginConfigStore::new_at(dir.clone()).unwrap();

        let held = store.acquire(&servers("/bin/held")).unwrap();
        // Simulate a leftover from a crashed previous process.
        let orphan = dir.join("plugins-deadbeef00000000.json");
        std::fs::write(&orphan, "{}").unwrap();

        store.sweep();
        assert!(held.path().exists());
        assert!(!orphan.exists());
    }

    #[test]
    fn config_body_is_valid_mcp_json() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PluginConfigStore::new_at(tmp.path().join("plugins")).unwrap();
        let handle = store.acquire(&servers("/bin/plugin")).unwrap();

        let body: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(handle.path()).unwrap()).unwrap();
        assert_eq!(body["mcpServers"]["ask_user"]["command"], "/bin/plugin");
        assert_eq!(body["mcpServers"]["ask_user"]["args"][0], "serve");
    }
}
