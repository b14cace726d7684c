//! Gateway — session routing, lane scheduling, and run supervision.
//!
//! Everything stateful the RPC surface and background loops touch hangs
//! off [`Gateway`]; there are no module-level singletons. Construction
//! wires the pieces together, `run` drives them until shutdown.

pub mod auth;
pub mod cron;
pub mod heartbeat;
pub mod history;
pub mod lanes;
pub mod runs;

use std::sync::Arc;
use std::time::Instant;

use courier_channels::AdapterRegistry;
use courier_core::config::Config;
use courier_core::message::{InboundEvent, OutboundPayload, TokenUsage};
use courier_core::session_key::{parse_session_key, resolve_session_key, KeyKind, MessageOrigin};
use courier_core::traits::{AgentEvent, AgentReply, AgentRequest, AgentRunner};
use courier_core::CourierError;
use courier_sessions::{ChatType, MergedStoreView, SendPolicy, SessionStore};
use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::rpc::events::{EventHub, PendingInvokes};
use auth::DeviceAuthGuard;
use cron::CronService;
use history::{ChatHistory, Role};
use lanes::LaneScheduler;
use runs::{RunOutcome, RunRegistry, RunStatus};

/// Reply token a heartbeat run uses to say "nothing needs attention".
/// Replies reducing to this token are never delivered anywhere.
pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

/// Options for starting one agent run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub session_key: String,
    pub text: String,
    pub lane: String,
    pub is_heartbeat: bool,
    /// Client-supplied id echoed in run events.
    pub client_run_id: Option<String>,
    /// Deliver the final reply through the session's delivery context.
    pub deliver: bool,
}

/// The central routing state, shared as `Arc<Gateway>`.
pub struct Gateway {
    pub config: RwLock<Config>,
    pub sessions: MergedStoreView,
    pub lanes: LaneScheduler,
    pub runs: RunRegistry,
    pub adapters: AdapterRegistry,
    pub hub: EventHub,
    pub pending_invokes: PendingInvokes,
    pub history: ChatHistory,
    pub auth: DeviceAuthGuard,
    pub cron: CronService,
    pub runner: Arc<dyn AgentRunner>,
    pub started_at: Instant,
    pub shutdown: CancellationToken,
}

impl Gateway {
    /// Wire up a gateway from validated config and a prebuilt adapter set.
    pub fn new(config: Config, runner: Arc<dyn AgentRunner>, mut adapters: AdapterRegistry) -> Self {
        let mut sessions =
            MergedStoreView::new(SessionStore::new(config.resolve_path(&config.session.store_path)));
        for (agent_id, path) in &config.session.agent_store_paths {
            sessions.add_agent_store(agent_id.clone(), SessionStore::new(config.resolve_path(path)));
        }

        let lanes = LaneScheduler::new(&config.lanes.caps());
        let auth = DeviceAuthGuard::new(&config.auth);
        let cron = CronService::new(config.resolve_path(&config.cron.jobs_path));

        for (channel, limit) in &config.channels.text_chunk_limits {
            adapters.set_chunk_limit(channel.clone(), *limit);
        }

        Self {
            config: RwLock::new(config),
            sessions,
            lanes,
            runs: RunRegistry::new(),
            adapters,
            hub: EventHub::new(),
            pending_invokes: PendingInvokes::new(),
            history: ChatHistory::new(),
            auth,
            cron,
            runner,
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Run until ctrl-c. Spawns the RPC server and background loops, then
    /// cancels everything on shutdown.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let (host, port, heartbeat_enabled, cron_enabled) = {
            let cfg = self.config.read().await;
            (
                cfg.gateway.host.clone(),
                cfg.gateway.port,
                cfg.heartbeat.enabled,
                cfg.cron.enabled,
            )
        };
        info!(
            "courier gateway running | runner: {} | bind: {host}:{port}",
            self.runner.name()
        );

        let mut tasks = Vec::new();
        if heartbeat_enabled {
            let gw = self.clone();
            tasks.push(tokio::spawn(async move { heartbeat::heartbeat_loop(gw).await }));
        }
        if cron_enabled {
            let gw = self.clone();
            tasks.push(tokio::spawn(async move { cron::cron_loop(gw).await }));
        }

        let server = {
            let gw = self.clone();
            tokio::spawn(async move {
                if let Err(e) = crate::rpc::serve(gw, &host, port).await {
                    error!("rpc server exited: {e}");
                }
            })
        };

        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        // Tell clients before the connection loops see the cancelled token.
        self.hub.broadcast("gateway.stopping", json!({}));
        self.shutdown.cancel();
        for task in tasks {
            task.abort();
        }
        server.abort();
        Ok(())
    }

    /// Route an inbound channel event: resolve its session, remember where
    /// to reply, and start a main-lane run whose reply is delivered back.
    pub async fn handle_inbound(self: &Arc<Self>, event: InboundEvent) -> Result<String, CourierError> {
        let scope = self.config.read().await.session.dm_scope;
        let origin = MessageOrigin {
            channel: &event.channel,
            account_id: event.account_id.as_deref(),
            peer_id: &event.peer_id,
            is_group: event.is_group,
        };
        let key = resolve_session_key(&origin, scope);
        let chat_type = if event.is_group {
            ChatType::Group
        } else if key == "main" {
            ChatType::Global
        } else {
            ChatType::Direct
        };
        self.sessions
            .ensure(&key, &Uuid::new_v4().to_string(), chat_type)
            .await?;

        // Remember where replies go, for this run and for system-initiated
        // sends (cron, heartbeat) later.
        let to = event.reply_target.as_deref().unwrap_or(&event.peer_id);
        self.sessions
            .patch(
                &key,
                &json!({
                    "deliveryContext": {
                        "channel": event.channel,
                        "to": to,
                        "accountId": event.account_id,
                    }
                }),
            )
            .await?;

        self.start_agent_run(RunRequest {
            session_key: key,
            text: event.text,
            lane: "main".to_string(),
            is_heartbeat: false,
            client_run_id: None,
            deliver: true,
        })
        .await
    }

    /// Admit and supervise one agent run. Returns its run id immediately;
    /// execution proceeds in a spawned task behind the lane gate.
    pub async fn start_agent_run(self: &Arc<Self>, req: RunRequest) -> Result<String, CourierError> {
        let parsed = parse_session_key(&req.session_key)
            .ok_or_else(|| CourierError::InvalidRequest(format!("bad session key '{}'", req.session_key)))?;
        let chat_type = match parsed.kind {
            KeyKind::Main => ChatType::Global,
            KeyKind::Group => ChatType::Group,
            KeyKind::Dm => ChatType::Direct,
            KeyKind::Agent => ChatType::Unknown,
        };
        let entry = self
            .sessions
            .ensure(&req.session_key, &Uuid::new_v4().to_string(), chat_type)
            .await?;

        if !req.is_heartbeat {
            self.history.record(&req.session_key, Role::User, &req.text);
        }

        let run_id = Uuid::new_v4().to_string();
        let ctx = self.runs.begin(
            &run_id,
            &req.session_key,
            &entry.session_id,
            &req.lane,
            req.is_heartbeat,
            req.client_run_id.clone(),
        )?;

        let gw = self.clone();
        tokio::spawn(async move {
            gw.execute_run(ctx, req).await;
        });
        Ok(run_id)
    }

    async fn execute_run(self: Arc<Self>, ctx: Arc<runs::RunContext>, req: RunRequest) {
        // A cancel while queued must release without ever running.
        let slot = tokio::select! {
            slot = self.lanes.acquire(&ctx.lane) => match slot {
                Ok(slot) => slot,
                Err(e) => {
                    self.retire_run(&ctx, RunStatus::Failed, None, Some(e.to_string()), TokenUsage::default())
                        .await;
                    return;
                }
            },
            _ = ctx.cancel.cancelled() => {
                debug!(run_id = %ctx.run_id, "run cancelled while queued");
                self.retire_run(&ctx, RunStatus::Cancelled, None, None, TokenUsage::default())
                    .await;
                return;
            }
        };

        let (event_tx, mut event_rx) = mpsc::channel::<AgentEvent>(64);
        let forwarder = {
            let gw = self.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    // Heartbeat chatter stays off client surfaces; only
                    // lifecycle events go out for those runs.
                    if ctx.is_heartbeat && matches!(event, AgentEvent::Delta { .. }) {
                        continue;
                    }
                    let (name, payload) = event_wire(&event);
                    gw.hub.publish_run(&ctx, name, payload);
                }
            })
        };

        let request = AgentRequest {
            run_id: ctx.run_id.clone(),
            session_key: ctx.session_key.clone(),
            session_id: ctx.session_id.clone(),
            text: req.text.clone(),
            is_heartbeat: req.is_heartbeat,
            cancel: ctx.cancel.clone(),
        };
        let result = tokio::select! {
            res = self.runner.run(request, event_tx) => res,
            _ = ctx.cancel.cancelled() => Err(CourierError::Cancelled("run cancelled".into())),
        };
        let _ = forwarder.await;
        drop(slot);

        match result {
            Ok(reply) => {
                if let Err(e) = self.record_usage(&ctx.session_key, &reply).await {
                    warn!(run_id = %ctx.run_id, "failed to record usage: {e}");
                }
                let suppressed = req.is_heartbeat && reply.text.trim() == HEARTBEAT_OK;
                if !suppressed {
                    self.history
                        .record(&ctx.session_key, Role::Assistant, &reply.text);
                }
                if req.deliver && !suppressed {
                    if let Err(e) = self.deliver_reply(&ctx.session_key, &reply.text).await {
                        warn!(run_id = %ctx.run_id, "reply delivery failed: {e}");
                    }
                }
                self.retire_run(&ctx, RunStatus::Completed, Some(reply.text), None, reply.usage)
                    .await;
            }
            Err(CourierError::Cancelled(_)) => {
                self.retire_run(&ctx, RunStatus::Cancelled, None, None, TokenUsage::default())
                    .await;
            }
            Err(e) => {
                error!(run_id = %ctx.run_id, "run failed: {e}");
                self.retire_run(&ctx, RunStatus::Failed, None, Some(e.to_string()), TokenUsage::default())
                    .await;
            }
        }
    }

    async fn retire_run(
        &self,
        ctx: &runs::RunContext,
        status: RunStatus,
        reply_text: Option<String>,
        error_text: Option<String>,
        usage: TokenUsage,
    ) {
        let event = match status {
            RunStatus::Completed => "agent.completed",
            RunStatus::Cancelled => "agent.cancelled",
            RunStatus::Failed => "agent.failed",
        };
        self.hub.publish_run(
            ctx,
            event,
            json!({
                "sessionKey": ctx.session_key,
                "clientRunId": ctx.client_run_id,
                "error": error_text.clone(),
            }),
        );
        let outcome = RunOutcome {
            run_id: ctx.run_id.clone(),
            session_key: ctx.session_key.clone(),
            status,
            reply_text,
            error: error_text,
            usage,
            finished_at: chrono::Utc::now(),
        };
        if let Err(e) = self.runs.finish(outcome) {
            error!(run_id = %ctx.run_id, "failed to retire run: {e}");
        }
        self.hub.forget_run(&ctx.run_id);
    }

    async fn record_usage(&self, session_key: &str, reply: &AgentReply) -> Result<(), CourierError> {
        let Some(mut entry) = self.sessions.get(session_key).await? else {
            return Ok(());
        };
        entry.record_usage(&reply.usage);
        self.sessions
            .patch(
                session_key,
                &json!({
                    "totalTokens": entry.total_tokens,
                    "inputTokens": entry.input_tokens,
                    "outputTokens": entry.output_tokens,
                    "contextTokens": entry.context_tokens,
                }),
            )
            .await?;
        Ok(())
    }

    /// Send text to wherever the session last heard from, honoring its
    /// send policy. No delivery context means nowhere to deliver.
    pub async fn deliver_reply(&self, session_key: &str, text: &str) -> Result<(), CourierError> {
        let Some(entry) = self.sessions.get(session_key).await? else {
            return Ok(());
        };
        if entry.send_policy == SendPolicy::Deny {
            debug!(session_key, "send policy denies delivery");
            return Ok(());
        }
        let Some(dc) = entry.delivery_context else {
            debug!(session_key, "no delivery context, dropping reply");
            return Ok(());
        };
        let payload = OutboundPayload {
            text: text.to_string(),
            to: dc.to,
            account_id: dc.account_id,
            reply_to_id: None,
            media_url: None,
        };
        self.adapters.deliver_text(&dc.channel, &payload).await?;
        Ok(())
    }

    /// Session key owning a run: the live registry first, then a scan of
    /// the persisted stores for an evicted run's transcript id.
    pub async fn session_key_for_run(&self, run_id: &str) -> Result<Option<String>, CourierError> {
        if let Some(ctx) = self.runs.find(run_id) {
            return Ok(Some(ctx.session_key.clone()));
        }
        if let Some(outcome) = self.runs.outcome(run_id) {
            return Ok(Some(outcome.session_key));
        }
        self.sessions.find_by_session_id(run_id).await
    }
}

/// Wire name and payload for a streamed agent event.
fn event_wire(event: &AgentEvent) -> (&'static str, serde_json::Value) {
    match event {
        AgentEvent::Started => ("agent.started", json!({})),
        AgentEvent::Delta { text } => ("agent.delta", json!({ "text": text })),
        AgentEvent::ToolStart { name } => ("agent.tool.start", json!({ "name": name })),
        AgentEvent::ToolEnd { name } => ("agent.tool.end", json!({ "name": name })),
        AgentEvent::Completed => ("agent.stream.end", json!({})),
        AgentEvent::Error { message } => ("agent.stream.error", json!({ "message": message })),
    }
}

/// In-process runner for tests and local development: echoes the prompt
/// and acknowledges heartbeats.
pub struct LocalEchoRunner;

#[async_trait::async_trait]
impl AgentRunner for LocalEchoRunner {
    fn name(&self) -> &str {
        "local-echo"
    }

    async fn run(
        &self,
        req: AgentRequest,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<AgentReply, CourierError> {
        let _ = events.send(AgentEvent::Started).await;
        if req.cancel.is_cancelled() {
            return Err(CourierError::Cancelled("run cancelled".into()));
        }
        let text = if req.is_heartbeat {
            HEARTBEAT_OK.to_string()
        } else {
            format!("echo: {}", req.text)
        };
        let _ = events
            .send(AgentEvent::Delta { text: text.clone() })
            .await;
        let _ = events.send(AgentEvent::Completed).await;
        Ok(AgentReply {
            text,
            usage: TokenUsage {
                total_tokens: 2,
                input_tokens: 1,
                output_tokens: 1,
                context_tokens: 2,
            },
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::test_gateway;
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn inbound_event_routes_to_main_and_delivers_once() {
        let dir = tempfile::tempdir().unwrap();
        let (gw, loopback) = test_gateway(&dir);

        let event = InboundEvent::direct("loopback", "peer-1", "hello there");
        let run_id = gw.handle_inbound(event).await.unwrap();

        let outcome = gw.runs.wait(&run_id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.session_key, "main");

        let sent = loopback.sent();
        assert_eq!(sent.len(), 1, "reply delivered exactly once");
        assert_eq!(sent[0].text, "echo: hello there");
        assert_eq!(sent[0].to, "peer-1");

        let entry = gw.sessions.get("main").await.unwrap().unwrap();
        assert!(entry.total_tokens > 0);
        assert_eq!(entry.delivery_context.unwrap().to, "peer-1");
    }

    #[tokio::test]
    async fn group_event_gets_its_own_session() {
        let dir = tempfile::tempdir().unwrap();
        let (gw, _loopback) = test_gateway(&dir);

        let mut event = InboundEvent::direct("loopback", "-100500", "hi group");
        event.is_group = true;
        let run_id = gw.handle_inbound(event).await.unwrap();
        let outcome = gw.runs.wait(&run_id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome.session_key, "loopback:group:-100500");
        let entry = gw.sessions.get("loopback:group:-100500").await.unwrap().unwrap();
        assert_eq!(entry.chat_type, ChatType::Group);
    }

    #[tokio::test]
    async fn heartbeat_ok_reply_is_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let (gw, loopback) = test_gateway(&dir);

        // Give main a delivery context so a non-suppressed reply would send.
        gw.sessions
            .ensure("main", "sid", ChatType::Global)
            .await
            .unwrap();
        gw.sessions
            .patch(
                "main",
                &json!({"deliveryContext": {"channel": "loopback", "to": "owner"}}),
            )
            .await
            .unwrap();

        let run_id = gw
            .start_agent_run(RunRequest {
                session_key: "main".into(),
                text: "heartbeat".into(),
                lane: "main".into(),
                is_heartbeat: true,
                client_run_id: None,
                deliver: true,
            })
            .await
            .unwrap();
        let outcome = gw.runs.wait(&run_id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome.reply_text.as_deref(), Some(HEARTBEAT_OK));

        assert!(loopback.sent().is_empty(), "heartbeat ack must not deliver");
        let entry = gw.sessions.get("main").await.unwrap().unwrap();
        assert!(entry.total_tokens > 0, "usage still recorded");
    }

    #[tokio::test]
    async fn session_key_for_run_covers_active_finished_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let (gw, _loopback) = test_gateway(&dir);

        let run_id = gw
            .start_agent_run(RunRequest {
                session_key: "main".into(),
                text: "x".into(),
                lane: "main".into(),
                is_heartbeat: false,
                client_run_id: None,
                deliver: false,
            })
            .await
            .unwrap();
        gw.runs.wait(&run_id, Duration::from_secs(5)).await.unwrap();
        // Finished run still resolves through the completed history.
        assert_eq!(
            gw.session_key_for_run(&run_id).await.unwrap().as_deref(),
            Some("main")
        );

        // An id only the store knows falls back to the session scan.
        gw.sessions
            .ensure("slack:dm:u1", "sid-cold", ChatType::Direct)
            .await
            .unwrap();
        assert_eq!(
            gw.session_key_for_run("sid-cold").await.unwrap().as_deref(),
            Some("slack:dm:u1")
        );
        assert_eq!(gw.session_key_for_run("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn bad_session_key_is_invalid_request() {
        let dir = tempfile::tempdir().unwrap();
        let (gw, _loopback) = test_gateway(&dir);
        let err = gw
            .start_agent_run(RunRequest {
                session_key: "group:".into(),
                text: "x".into(),
                lane: "main".into(),
                is_heartbeat: false,
                client_run_id: None,
                deliver: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn cancel_while_running_yields_cancelled_outcome() {
        let dir = tempfile::tempdir().unwrap();

        // Runner that waits for cancellation.
        struct StallRunner;
        #[async_trait::async_trait]
        impl AgentRunner for StallRunner {
            fn name(&self) -> &str {
                "stall"
            }
            async fn run(
                &self,
                req: AgentRequest,
                _events: mpsc::Sender<AgentEvent>,
            ) -> Result<AgentReply, CourierError> {
                req.cancel.cancelled().await;
                Err(CourierError::Cancelled("stalled".into()))
            }
        }
        let (gw2, _loopback) = testutil::test_gateway_with(&dir, Arc::new(StallRunner));

        let run_id = gw2
            .start_agent_run(RunRequest {
                session_key: "main".into(),
                text: "x".into(),
                lane: "main".into(),
                is_heartbeat: false,
                client_run_id: None,
                deliver: false,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(gw2.runs.cancel(&run_id));
        let outcome = gw2.runs.wait(&run_id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Cancelled);
    }
}
