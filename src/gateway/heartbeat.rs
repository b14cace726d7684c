//! Background heartbeat — periodic wake runs on the main session.
//!
//! Each tick starts a normal main-lane run flagged as a heartbeat. The
//! runner answers with the ack token when nothing needs attention and
//! that reply is suppressed; anything else is delivered like a regular
//! reply. Interval and prompt are re-read every tick so `config.set`
//! changes apply without a restart.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{Gateway, RunRequest};

pub async fn heartbeat_loop(gw: Arc<Gateway>) {
    loop {
        let (enabled, interval_minutes, prompt) = {
            let cfg = gw.config.read().await;
            (
                cfg.heartbeat.enabled,
                cfg.heartbeat.interval_minutes.max(1),
                cfg.heartbeat.prompt.clone(),
            )
        };

        tokio::select! {
            _ = gw.shutdown.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(interval_minutes * 60)) => {}
        }
        if !enabled {
            continue;
        }

        debug!("heartbeat tick");
        let result = gw
            .start_agent_run(RunRequest {
                session_key: "main".to_string(),
                text: prompt,
                lane: "main".to_string(),
                is_heartbeat: true,
                client_run_id: None,
                deliver: true,
            })
            .await;
        if let Err(e) = result {
            warn!("heartbeat run failed to start: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::gateway::testutil::test_gateway;
    use crate::gateway::{RunRequest, HEARTBEAT_OK};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn heartbeat_run_is_flagged_and_ack_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let (gw, loopback) = test_gateway(&dir);
        gw.sessions
            .ensure("main", "sid", courier_sessions::ChatType::Global)
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
                text: "anything to report?".into(),
                lane: "main".into(),
                is_heartbeat: true,
                client_run_id: None,
                deliver: true,
            })
            .await
            .unwrap();
        let outcome = gw.runs.wait(&run_id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome.reply_text.as_deref(), Some(HEARTBEAT_OK));
        assert!(loopback.sent().is_empty());
    }
}
