//! Typed RPC method registry and the method handlers.
//!
//! Every method is registered once at startup; registering the same name
//! twice is a programming error and panics immediately rather than
//! shadowing. Handlers return domain errors and the dispatcher maps them
//! to wire error shapes in exactly one place.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use courier_core::session_key::{format_session_key, parse_session_key};
use courier_core::CourierError;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::gateway::cron::{self, CronJob};
use crate::gateway::{Gateway, RunRequest};

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, CourierError>> + Send>>;
type Handler = Arc<dyn Fn(Arc<Gateway>, Option<Value>) -> HandlerFuture + Send + Sync>;

struct MethodEntry {
    /// Whether a retried request (same idempotency key) may replay the
    /// recorded response instead of re-executing.
    idempotent: bool,
    handler: Handler,
}

/// Name → handler table, fixed after startup.
#[derive(Default)]
pub struct MethodRegistry {
    methods: HashMap<&'static str, MethodEntry>,
}

impl MethodRegistry {
    /// Register a non-idempotent handler. Panics on duplicates: that is a
    /// wiring bug, and it must fail at startup, not at call time.
    pub fn register<F, Fut>(&mut self, name: &'static str, handler: F)
    where
        F: Fn(Arc<Gateway>, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CourierError>> + Send + 'static,
    {
        self.insert(name, false, handler);
    }

    /// Register a handler whose responses may be replayed on retry.
    pub fn register_idempotent<F, Fut>(&mut self, name: &'static str, handler: F)
    where
        F: Fn(Arc<Gateway>, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CourierError>> + Send + 'static,
    {
        self.insert(name, true, handler);
    }

    fn insert<F, Fut>(&mut self, name: &'static str, idempotent: bool, handler: F)
    where
        F: Fn(Arc<Gateway>, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CourierError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |gw, params| Box::pin(handler(gw, params)));
        let entry = MethodEntry { idempotent, handler };
        if self.methods.insert(name, entry).is_some() {
            panic!("duplicate RPC method registration: '{name}'");
        }
    }

    pub fn is_idempotent(&self, method: &str) -> bool {
        self.methods.get(method).map(|e| e.idempotent).unwrap_or(false)
    }

    pub async fn dispatch(
        &self,
        gw: Arc<Gateway>,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, CourierError> {
        let handler = self
            .methods
            .get(method)
            .ok_or_else(|| CourierError::NotFound(format!("method '{method}'")))?
            .handler
            .clone();
        debug!(method, "dispatching rpc request");
        handler(gw, params).await
    }

    pub fn method_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.methods.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// The full production method table. Reads, deletes, cancels, and
    /// result acks replay safely on retry; everything that starts a run or
    /// mints state does not.
    pub fn standard() -> Self {
        let mut reg = Self::default();
        reg.register_idempotent("status", status);
        reg.register("agent", agent_start);
        reg.register_idempotent("agent.wait", agent_wait);
        reg.register_idempotent("agent.cancel", agent_cancel);
        reg.register_idempotent("chat.history", chat_history);
        reg.register_idempotent("sessions.list", sessions_list);
        reg.register_idempotent("sessions.resolve", sessions_resolve);
        reg.register("sessions.patch", sessions_patch);
        reg.register_idempotent("sessions.delete", sessions_delete);
        reg.register_idempotent("config.get", config_get);
        reg.register("config.set", config_set);
        reg.register_idempotent("cron.list", cron_list);
        reg.register_idempotent("cron.status", cron_status);
        reg.register("cron.update", cron_update);
        reg.register_idempotent("cron.remove", cron_remove);
        reg.register("cron.run", cron_run);
        reg.register_idempotent("cron.runs", cron_runs);
        reg.register("node.invoke", node_invoke);
        reg.register_idempotent("node.invoke.result", node_invoke_result);
        reg.register("device.pair", device_pair);
        reg
    }
}

/// Decode params, treating absent params as `{}`.
fn decode<T: DeserializeOwned>(params: Option<Value>) -> Result<T, CourierError> {
    serde_json::from_value(params.unwrap_or_else(|| json!({})))
        .map_err(|e| CourierError::InvalidRequest(format!("bad params: {e}")))
}

fn to_result<T: serde::Serialize>(value: &T) -> Result<Value, CourierError> {
    Ok(serde_json::to_value(value)?)
}

// --- status -------------------------------------------------------------

async fn status(gw: Arc<Gateway>, _params: Option<Value>) -> Result<Value, CourierError> {
    Ok(json!({
        "runner": gw.runner.name(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": gw.started_at.elapsed().as_secs(),
        "lanes": gw.lanes.status(),
        "activeRuns": gw.runs.active_count(),
        "connections": gw.hub.connection_count(),
        "channels": gw.adapters.channel_names(),
    }))
}

// --- agent --------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AgentParams {
    #[serde(default)]
    session_key: Option<String>,
    message: String,
    #[serde(default)]
    lane: Option<String>,
    #[serde(default)]
    run_id: Option<String>,
    /// Deliver the reply through the session's channel, in addition to
    /// streaming it to RPC clients.
    #[serde(default)]
    deliver: bool,
}

async fn agent_start(gw: Arc<Gateway>, params: Option<Value>) -> Result<Value, CourierError> {
    let p: AgentParams = decode(params)?;
    let session_key = p.session_key.unwrap_or_else(|| "main".to_string());
    let run_id = gw
        .start_agent_run(RunRequest {
            session_key: session_key.clone(),
            text: p.message,
            lane: p.lane.unwrap_or_else(|| "main".to_string()),
            is_heartbeat: false,
            client_run_id: p.run_id,
            deliver: p.deliver,
        })
        .await?;
    Ok(json!({ "runId": run_id, "sessionKey": session_key }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AgentWaitParams {
    run_id: String,
    #[serde(default = "default_wait_ms")]
    timeout_ms: u64,
}

fn default_wait_ms() -> u64 {
    30_000
}

async fn agent_wait(gw: Arc<Gateway>, params: Option<Value>) -> Result<Value, CourierError> {
    let p: AgentWaitParams = decode(params)?;
    // Cap so a client cannot pin a connection task for hours.
    let timeout = Duration::from_millis(p.timeout_ms.min(600_000));
    let outcome = gw.runs.wait(&p.run_id, timeout).await?;
    to_result(&outcome)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AgentCancelParams {
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    session_key: Option<String>,
}

async fn agent_cancel(gw: Arc<Gateway>, params: Option<Value>) -> Result<Value, CourierError> {
    let p: AgentCancelParams = decode(params)?;
    match (p.run_id, p.session_key) {
        (Some(run_id), None) => {
            if gw.runs.cancel(&run_id) {
                Ok(json!({ "cancelled": 1 }))
            } else if gw.runs.outcome(&run_id).is_some() {
                Ok(json!({ "cancelled": 0, "alreadyFinished": true }))
            } else {
                Err(CourierError::NotFound(format!("run '{run_id}'")))
            }
        }
        (None, Some(session_key)) => {
            let n = gw.runs.cancel_session(&session_key);
            Ok(json!({ "cancelled": n }))
        }
        _ => Err(CourierError::InvalidRequest(
            "provide either runId or sessionKey (not both)".into(),
        )),
    }
}

// --- chat ---------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ChatHistoryParams {
    #[serde(default)]
    session_key: Option<String>,
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    50
}

async fn chat_history(gw: Arc<Gateway>, params: Option<Value>) -> Result<Value, CourierError> {
    let p: ChatHistoryParams = decode(params)?;
    let key = p.session_key.unwrap_or_else(|| "main".to_string());
    let turns = gw.history.history(&key, p.limit);
    Ok(json!({ "sessionKey": key, "turns": turns }))
}

// --- sessions -----------------------------------------------------------

async fn sessions_list(gw: Arc<Gateway>, _params: Option<Value>) -> Result<Value, CourierError> {
    let records = gw.sessions.list_all().await?;
    Ok(json!({ "sessions": records }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SessionsResolveParams {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    label: Option<String>,
}

async fn sessions_resolve(gw: Arc<Gateway>, params: Option<Value>) -> Result<Value, CourierError> {
    let p: SessionsResolveParams = decode(params)?;
    let key = match (p.key, p.label) {
        (Some(_), Some(_)) => {
            return Err(CourierError::InvalidRequest(
                "Provide either key or label (not both)".into(),
            ))
        }
        (None, None) => {
            return Err(CourierError::InvalidRequest(
                "provide a key or a label".into(),
            ))
        }
        (Some(key), None) => {
            let parsed = parse_session_key(&key)
                .ok_or_else(|| CourierError::InvalidRequest(format!("bad session key '{key}'")))?;
            format_session_key(&parsed)
        }
        (None, Some(label)) => gw.sessions.resolve_by_label(&label).await?,
    };
    let entry = gw.sessions.get(&key).await?;
    Ok(json!({ "key": key, "entry": entry }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SessionsPatchParams {
    key: String,
    patch: Value,
}

async fn sessions_patch(gw: Arc<Gateway>, params: Option<Value>) -> Result<Value, CourierError> {
    let p: SessionsPatchParams = decode(params)?;
    let entry = gw.sessions.patch(&p.key, &p.patch).await?;
    Ok(json!({ "key": p.key, "entry": entry }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SessionsDeleteParams {
    key: String,
}

async fn sessions_delete(gw: Arc<Gateway>, params: Option<Value>) -> Result<Value, CourierError> {
    let p: SessionsDeleteParams = decode(params)?;
    let deleted = gw.sessions.delete(&p.key).await?;
    if deleted {
        gw.history.forget(&p.key);
        gw.runs.cancel_session(&p.key);
    }
    Ok(json!({ "deleted": deleted }))
}

// --- config -------------------------------------------------------------

async fn config_get(gw: Arc<Gateway>, _params: Option<Value>) -> Result<Value, CourierError> {
    let cfg = gw.config.read().await.redacted();
    to_result(&cfg)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConfigSetParams {
    patch: Value,
}

/// Deep-merge a config patch, validate the result, then apply. Lane caps
/// hot-reload into the scheduler; most other fields take effect on their
/// next read.
async fn config_set(gw: Arc<Gateway>, params: Option<Value>) -> Result<Value, CourierError> {
    let p: ConfigSetParams = decode(params)?;
    if !p.patch.is_object() {
        return Err(CourierError::InvalidRequest("config patch must be an object".into()));
    }

    let mut cfg = gw.config.write().await;
    let mut merged_value = serde_json::to_value(&*cfg)?;
    merge_json(&mut merged_value, &p.patch);
    let merged: courier_core::config::Config = serde_json::from_value(merged_value)
        .map_err(|e| CourierError::InvalidRequest(format!("bad config patch: {e}")))?;
    merged.validate()?;

    for (lane, cap) in merged.lanes.caps() {
        gw.lanes.set_max_concurrent(lane, cap)?;
    }
    *cfg = merged;
    info!("configuration updated via rpc");
    to_result(&cfg.redacted())
}

fn merge_json(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch_obj) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            if let Some(obj) = target.as_object_mut() {
                for (k, v) in patch_obj {
                    if v.is_null() {
                        obj.remove(k);
                    } else {
                        merge_json(obj.entry(k.clone()).or_insert(Value::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

// --- cron ---------------------------------------------------------------

async fn cron_list(gw: Arc<Gateway>, _params: Option<Value>) -> Result<Value, CourierError> {
    Ok(json!({ "jobs": gw.cron.list().await? }))
}

async fn cron_status(gw: Arc<Gateway>, _params: Option<Value>) -> Result<Value, CourierError> {
    let cfg_enabled = gw.config.read().await.cron.enabled;
    let jobs = gw.cron.list().await?;
    let due = gw.cron.due_jobs(chrono::Utc::now()).await?.len();
    Ok(json!({
        "enabled": cfg_enabled,
        "jobs": jobs.len(),
        "due": due,
    }))
}

async fn cron_update(gw: Arc<Gateway>, params: Option<Value>) -> Result<Value, CourierError> {
    let job: CronJob = decode(params)?;
    let saved = gw.cron.upsert(job).await?;
    to_result(&saved)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CronIdParams {
    id: String,
}

async fn cron_remove(gw: Arc<Gateway>, params: Option<Value>) -> Result<Value, CourierError> {
    let p: CronIdParams = decode(params)?;
    Ok(json!({ "removed": gw.cron.remove(&p.id).await? }))
}

async fn cron_run(gw: Arc<Gateway>, params: Option<Value>) -> Result<Value, CourierError> {
    let p: CronIdParams = decode(params)?;
    let job = gw
        .cron
        .find(&p.id)
        .await?
        .ok_or_else(|| CourierError::NotFound(format!("cron job '{}'", p.id)))?;
    let run_id = cron::fire_job(&gw, &job, chrono::Utc::now()).await?;
    Ok(json!({ "runId": run_id }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CronRunsParams {
    #[serde(default)]
    id: Option<String>,
}

async fn cron_runs(gw: Arc<Gateway>, params: Option<Value>) -> Result<Value, CourierError> {
    let p: CronRunsParams = decode(params)?;
    Ok(json!({ "runs": gw.cron.runs(p.id.as_deref()).await }))
}

// --- node invoke --------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct NodeInvokeParams {
    method: String,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default = "default_invoke_ms")]
    timeout_ms: u64,
}

fn default_invoke_ms() -> u64 {
    10_000
}

/// Proxy a call to a connected node client. The invoke is broadcast as an
/// event; whichever node owns the method answers via `node.invoke.result`.
/// The caller gets an answer by the deadline either way.
async fn node_invoke(gw: Arc<Gateway>, params: Option<Value>) -> Result<Value, CourierError> {
    let p: NodeInvokeParams = decode(params)?;
    let invoke_id = Uuid::new_v4().to_string();
    let rx = gw.pending_invokes.register(&invoke_id);
    gw.hub.broadcast(
        "node.invoke",
        json!({
            "invokeId": invoke_id,
            "method": p.method,
            "params": p.params,
        }),
    );
    let timeout = Duration::from_millis(p.timeout_ms.min(600_000));
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => Ok(json!({ "invokeId": invoke_id, "result": result })),
        Ok(Err(_)) => {
            gw.pending_invokes.forget(&invoke_id);
            Err(CourierError::Cancelled("invoke dropped".into()))
        }
        Err(_) => {
            gw.pending_invokes.forget(&invoke_id);
            Err(CourierError::Timeout(format!(
                "node invoke '{}' got no result within {}ms",
                p.method, p.timeout_ms
            )))
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct NodeInvokeResultParams {
    invoke_id: String,
    #[serde(default)]
    result: Value,
}

/// Accept a node's answer. A result for an unknown or already-timed-out
/// invoke id is a benign race: acknowledged, flagged ignored, never an
/// error.
async fn node_invoke_result(gw: Arc<Gateway>, params: Option<Value>) -> Result<Value, CourierError> {
    let p: NodeInvokeResultParams = decode(params)?;
    let delivered = gw.pending_invokes.resolve(&p.invoke_id, p.result);
    if delivered {
        Ok(json!({ "ok": true }))
    } else {
        Ok(json!({ "ok": true, "ignored": true }))
    }
}

// --- device pairing -----------------------------------------------------

async fn device_pair(gw: Arc<Gateway>, _params: Option<Value>) -> Result<Value, CourierError> {
    let token = Uuid::new_v4().to_string();
    gw.auth.add_token(&token);
    gw.hub.broadcast(
        "device.pair.requested",
        json!({ "requestedAt": chrono::Utc::now() }),
    );
    info!("device pairing token minted");
    Ok(json!({ "token": token }))
}
