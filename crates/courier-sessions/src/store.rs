//! File-backed session store.
//!
//! One JSON file per store path, `{sessionKey: SessionEntry}`. Reads are
//! cached in memory; every write goes through an atomic temp-file + rename
//! so a crash can never leave a partially written store. All mutation is
//! serialized through the store lock — patches on the same key are atomic
//! with respect to each other, and no caller ever read-modify-writes the
//! file outside this API.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use courier_core::CourierError;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::entry::{ChatType, SessionEntry};

type SessionMap = BTreeMap<String, SessionEntry>;

/// Durable key → [`SessionEntry`] mapping for one store file.
pub struct SessionStore {
    path: PathBuf,
    state: Mutex<Option<SessionMap>>,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of every entry in the store.
    pub async fn list(&self) -> Result<Vec<(String, SessionEntry)>, CourierError> {
        let mut guard = self.state.lock().await;
        let map = ensure_loaded(&self.path, &mut guard).await?;
        Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    pub async fn get(&self, key: &str) -> Result<Option<SessionEntry>, CourierError> {
        let mut guard = self.state.lock().await;
        let map = ensure_loaded(&self.path, &mut guard).await?;
        Ok(map.get(key).cloned())
    }

    /// Fetch the entry for `key`, creating it on first contact.
    pub async fn ensure(
        &self,
        key: &str,
        session_id: &str,
        chat_type: ChatType,
    ) -> Result<SessionEntry, CourierError> {
        let mut guard = self.state.lock().await;
        let map = ensure_loaded(&self.path, &mut guard).await?;
        if let Some(entry) = map.get(key) {
            return Ok(entry.clone());
        }
        let entry = SessionEntry::new(session_id, chat_type);
        map.insert(key.to_string(), entry.clone());
        write_atomic(&self.path, map).await?;
        debug!("created session entry for '{key}'");
        Ok(entry)
    }

    /// Deep-merge `patch` into the entry for `key`, creating the entry if
    /// absent. An explicit `null` in a patch field clears that field; an
    /// omitted field is left untouched.
    ///
    /// Rejected with `Conflict`: changing an already-assigned `sessionId`
    /// (a new transcript means a new entry), or setting a `label` another
    /// entry in this store already carries.
    pub async fn patch(&self, key: &str, patch: &Value) -> Result<SessionEntry, CourierError> {
        let patch_obj = patch.as_object().ok_or_else(|| {
            CourierError::InvalidRequest("session patch must be an object".into())
        })?;

        let mut guard = self.state.lock().await;
        let map = ensure_loaded(&self.path, &mut guard).await?;

        let existing = map.get(key).cloned().unwrap_or_default();

        if let Some(new_sid) = patch_obj.get("sessionId").and_then(Value::as_str) {
            if !existing.session_id.is_empty() && new_sid != existing.session_id {
                return Err(CourierError::Conflict(format!(
                    "sessionId is immutable once assigned (session '{key}')"
                )));
            }
        }
        if let Some(new_label) = patch_obj.get("label").and_then(Value::as_str) {
            let taken = map
                .iter()
                .any(|(k, e)| k != key && e.label.as_deref() == Some(new_label));
            if taken {
                return Err(CourierError::Conflict(format!(
                    "label '{new_label}' is already in use"
                )));
            }
        }

        let mut merged = serde_json::to_value(&existing)?;
        merge_patch(&mut merged, patch);
        let mut entry: SessionEntry = serde_json::from_value(merged)
            .map_err(|e| CourierError::InvalidRequest(format!("bad session patch: {e}")))?;
        entry.updated_at = chrono::Utc::now();

        map.insert(key.to_string(), entry.clone());
        write_atomic(&self.path, map).await?;
        Ok(entry)
    }

    /// Remove the entry for `key`. Returns whether it existed. The only
    /// hard-delete path (`sessions.delete`).
    pub async fn delete(&self, key: &str) -> Result<bool, CourierError> {
        let mut guard = self.state.lock().await;
        let map = ensure_loaded(&self.path, &mut guard).await?;
        let existed = map.remove(key).is_some();
        if existed {
            write_atomic(&self.path, map).await?;
        }
        Ok(existed)
    }

    /// Resolve a label to its session key. Exact match only; zero matches
    /// is `NotFound`, more than one (possible in hand-edited stores) is an
    /// explicit `AmbiguousLabel` — never a silent first match.
    pub async fn resolve_by_label(&self, label: &str) -> Result<String, CourierError> {
        let mut guard = self.state.lock().await;
        let map = ensure_loaded(&self.path, &mut guard).await?;
        let mut matches = map
            .iter()
            .filter(|(_, e)| e.label.as_deref() == Some(label))
            .map(|(k, _)| k.clone());
        match (matches.next(), matches.next()) {
            (Some(key), None) => Ok(key),
            (Some(_), Some(_)) => Err(CourierError::AmbiguousLabel(label.to_string())),
            (None, _) => Err(CourierError::NotFound(format!("label '{label}'"))),
        }
    }

    /// Slow-path scan: find the key whose entry carries `session_id`.
    /// Used when a run's in-memory context has been evicted.
    pub async fn find_by_session_id(
        &self,
        session_id: &str,
    ) -> Result<Option<String>, CourierError> {
        let mut guard = self.state.lock().await;
        let map = ensure_loaded(&self.path, &mut guard).await?;
        Ok(map
            .iter()
            .find(|(_, e)| e.session_id == session_id)
            .map(|(k, _)| k.clone()))
    }
}

/// Load the store file into the cache on first touch. A missing file is an
/// empty store; an unreadable one is an error (never silently truncated).
async fn ensure_loaded<'a>(
    path: &Path,
    guard: &'a mut Option<SessionMap>,
) -> Result<&'a mut SessionMap, CourierError> {
    if guard.is_none() {
        let map = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| CourierError::Store(format!("corrupt store {}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SessionMap::new(),
            Err(e) => {
                return Err(CourierError::Store(format!(
                    "cannot read store {}: {e}",
                    path.display()
                )))
            }
        };
        *guard = Some(map);
    }
    Ok(guard.as_mut().expect("cache populated above"))
}

/// Write-temp-then-rename so a crash mid-write can't corrupt the store.
async fn write_atomic(path: &Path, map: &SessionMap) -> Result<(), CourierError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(map)?;
    tokio::fs::write(&tmp, &bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        // Best effort: don't leave the temp file behind on failure.
        if let Err(rm) = tokio::fs::remove_file(&tmp).await {
            warn!("failed to clean up {}: {rm}", tmp.display());
        }
        return Err(e.into());
    }
    Ok(())
}

/// RFC 7396-style merge: objects merge recursively, `null` removes the
/// field, everything else replaces.
fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch_obj) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            let obj = target.as_object_mut().expect("object ensured above");
            for (k, v) in patch_obj {
                if v.is_null() {
                    obj.remove(k);
                } else {
                    merge_patch(obj.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        other => *target = other.clone(),
    }
}
