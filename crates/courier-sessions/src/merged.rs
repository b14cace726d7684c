//! Merged view over the primary session store and per-agent stores.
//!
//! Sub-agents keep their sessions in their own store files. RPC listing
//! and lookup operate on the union; each record carries the name of the
//! store it came from so patches and deletes route back to the right file.

use std::collections::HashMap;

use courier_core::session_key::{parse_session_key, KeyKind};
use courier_core::CourierError;
use serde::Serialize;
use serde_json::Value;

use crate::entry::{ChatType, SessionEntry};
use crate::store::SessionStore;

/// Store name used for the primary (non-agent) store.
pub const PRIMARY_STORE: &str = "main";

/// One session as seen through the merged view, tagged with provenance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Which store file this entry lives in (`main` or an agent id).
    pub store: String,
    pub key: String,
    #[serde(flatten)]
    pub entry: SessionEntry,
}

/// Union of the primary store and any registered agent stores.
pub struct MergedStoreView {
    primary: SessionStore,
    agents: HashMap<String, SessionStore>,
}

impl MergedStoreView {
    pub fn new(primary: SessionStore) -> Self {
        Self {
            primary,
            agents: HashMap::new(),
        }
    }

    /// Register a per-agent store. Keys of the form `agent:<id>:...` route
    /// to the store registered under `<id>`.
    pub fn add_agent_store(&mut self, agent_id: impl Into<String>, store: SessionStore) {
        self.agents.insert(agent_id.into(), store);
    }

    pub fn primary(&self) -> &SessionStore {
        &self.primary
    }

    /// Pick the store a key belongs to. Agent keys without a registered
    /// store fall through to the primary.
    fn store_for_key(&self, key: &str) -> &SessionStore {
        if let Some(parsed) = parse_session_key(key) {
            if parsed.kind == KeyKind::Agent {
                if let Some(store) = self.agents.get(&parsed.id) {
                    return store;
                }
            }
        }
        &self.primary
    }

    /// Every entry across every store, tagged with its provenance.
    pub async fn list_all(&self) -> Result<Vec<SessionRecord>, CourierError> {
        let mut out = Vec::new();
        for (key, entry) in self.primary.list().await? {
            out.push(SessionRecord {
                store: PRIMARY_STORE.to_string(),
                key,
                entry,
            });
        }
        for (name, store) in &self.agents {
            for (key, entry) in store.list().await? {
                out.push(SessionRecord {
                    store: name.clone(),
                    key,
                    entry,
                });
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    pub async fn get(&self, key: &str) -> Result<Option<SessionEntry>, CourierError> {
        let store = self.store_for_key(key);
        store.get(key).await
    }

    pub async fn ensure(
        &self,
        key: &str,
        session_id: &str,
        chat_type: ChatType,
    ) -> Result<SessionEntry, CourierError> {
        let store = self.store_for_key(key);
        store.ensure(key, session_id, chat_type).await
    }

    pub async fn patch(&self, key: &str, patch: &Value) -> Result<SessionEntry, CourierError> {
        let store = self.store_for_key(key);
        store.patch(key, patch).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, CourierError> {
        let store = self.store_for_key(key);
        store.delete(key).await
    }

    /// Resolve a label across every store. A label matching in two stores
    /// is ambiguous, same as a duplicate inside one store.
    pub async fn resolve_by_label(&self, label: &str) -> Result<String, CourierError> {
        let mut found: Option<String> = None;
        for record in self.list_all().await? {
            if record.entry.label.as_deref() == Some(label) {
                if found.is_some() {
                    return Err(CourierError::AmbiguousLabel(label.to_string()));
                }
                found = Some(record.key);
            }
        }
        found.ok_or_else(|| CourierError::NotFound(format!("label '{label}'")))
    }

    /// Scan every store for the key owning `session_id`.
    pub async fn find_by_session_id(
        &self,
        session_id: &str,
    ) -> Result<Option<String>, CourierError> {
        if let Some(key) = self.primary.find_by_session_id(session_id).await? {
            return Ok(Some(key));
        }
        for store in self.agents.values() {
            if let Some(key) = store.find_by_session_id(session_id).await? {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn view_in(dir: &tempfile::TempDir) -> MergedStoreView {
        let mut view = MergedStoreView::new(SessionStore::new(dir.path().join("sessions.json")));
        view.add_agent_store(
            "researcher",
            SessionStore::new(dir.path().join("agent-researcher.json")),
        );
        view
    }

    #[tokio::test]
    async fn agent_keys_route_to_agent_store() {
        let dir = tempfile::tempdir().unwrap();
        let view = view_in(&dir);

        view.ensure("main", "sid-main", ChatType::Global).await.unwrap();
        view.ensure("agent:researcher:main", "sid-agent", ChatType::Global)
            .await
            .unwrap();

        // The agent entry lands in its own file, not the primary one.
        let primary_only = view.primary().list().await.unwrap();
        assert_eq!(primary_only.len(), 1);
        assert_eq!(primary_only[0].0, "main");

        let records = view.list_all().await.unwrap();
        assert_eq!(records.len(), 2);
        let agent = records
            .iter()
            .find(|r| r.key == "agent:researcher:main")
            .unwrap();
        assert_eq!(agent.store, "researcher");
    }

    #[tokio::test]
    async fn unregistered_agent_falls_back_to_primary() {
        let dir = tempfile::tempdir().unwrap();
        let view = view_in(&dir);
        view.ensure("agent:unknown:main", "sid-x", ChatType::Global)
            .await
            .unwrap();
        assert!(view
            .primary()
            .get("agent:unknown:main")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn label_ambiguous_across_stores() {
        let dir = tempfile::tempdir().unwrap();
        let view = view_in(&dir);
        view.ensure("main", "s1", ChatType::Global).await.unwrap();
        view.ensure("agent:researcher:main", "s2", ChatType::Global)
            .await
            .unwrap();
        view.patch("main", &json!({"label": "work"})).await.unwrap();
        // Per-store uniqueness can't see across files, so this succeeds.
        view.patch("agent:researcher:main", &json!({"label": "work"}))
            .await
            .unwrap();

        assert!(matches!(
            view.resolve_by_label("work").await.unwrap_err(),
            CourierError::AmbiguousLabel(_)
        ));
    }

    #[tokio::test]
    async fn find_by_session_id_covers_all_stores() {
        let dir = tempfile::tempdir().unwrap();
        let view = view_in(&dir);
        view.ensure("agent:researcher:main", "sid-agent", ChatType::Global)
            .await
            .unwrap();
        assert_eq!(
            view.find_by_session_id("sid-agent").await.unwrap().as_deref(),
            Some("agent:researcher:main")
        );
    }
}
