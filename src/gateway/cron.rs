//! Scheduled agent jobs.
//!
//! Jobs live in a JSON file next to the session stores and fire prompts
//! into the cron lane. The lane's cap of 1 keeps scheduled runs from
//! overlapping each other; the poll loop only decides *which* jobs are
//! due. Recent executions are kept in a bounded in-memory history for
//! `cron.runs`.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use courier_core::CourierError;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Gateway, RunRequest};

const RUN_HISTORY: usize = 100;

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CronSchedule {
    /// Every `minutes` minutes, measured from the previous firing.
    #[serde(rename_all = "camelCase")]
    Interval { minutes: u64 },
    /// Once a day at `at` (24h "HH:MM", gateway-local time as UTC).
    #[serde(rename_all = "camelCase")]
    Daily { at: String },
}

impl CronSchedule {
    fn validate(&self) -> Result<(), CourierError> {
        match self {
            CronSchedule::Interval { minutes } if *minutes == 0 => Err(
                CourierError::InvalidRequest("interval minutes must be at least 1".into()),
            ),
            CronSchedule::Interval { .. } => Ok(()),
            CronSchedule::Daily { at } => {
                NaiveTime::parse_from_str(at, "%H:%M").map_err(|_| {
                    CourierError::InvalidRequest(format!("bad daily time '{at}', expected HH:MM"))
                })?;
                Ok(())
            }
        }
    }

    fn is_due(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match self {
            CronSchedule::Interval { minutes } => match last_run {
                None => true,
                Some(last) => now >= last + chrono::Duration::minutes(*minutes as i64),
            },
            CronSchedule::Daily { at } => {
                let Ok(time) = NaiveTime::parse_from_str(at, "%H:%M") else {
                    return false;
                };
                let today_at = now.date_naive().and_time(time).and_utc();
                now >= today_at && last_run.map(|l| l < today_at).unwrap_or(true)
            }
        }
    }
}

/// One persisted scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub schedule: CronSchedule,
    /// Prompt text fired into the session.
    pub message: String,
    #[serde(default = "default_session_key")]
    pub session_key: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

fn default_session_key() -> String {
    "main".to_string()
}
fn default_enabled() -> bool {
    true
}

/// One recorded job execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronRunRecord {
    pub job_id: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
}

struct CronState {
    jobs: Option<Vec<CronJob>>,
    history: VecDeque<CronRunRecord>,
}

/// Job persistence plus run history. Shares the file-per-store pattern of
/// the session stores: cached reads, atomic temp + rename writes.
pub struct CronService {
    path: PathBuf,
    state: Mutex<CronState>,
}

impl CronService {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(CronState {
                jobs: None,
                history: VecDeque::new(),
            }),
        }
    }

    pub async fn list(&self) -> Result<Vec<CronJob>, CourierError> {
        let mut state = self.state.lock().await;
        Ok(load_jobs(&self.path, &mut state).await?.clone())
    }

    /// Create or replace a job. `last_run_at` of an existing job survives
    /// so an edit does not re-fire an interval immediately.
    pub async fn upsert(&self, mut job: CronJob) -> Result<CronJob, CourierError> {
        if job.id.trim().is_empty() {
            return Err(CourierError::InvalidRequest("job id must not be empty".into()));
        }
        job.schedule.validate()?;
        courier_core::session_key::parse_session_key(&job.session_key).ok_or_else(|| {
            CourierError::InvalidRequest(format!("bad session key '{}'", job.session_key))
        })?;

        let mut state = self.state.lock().await;
        let jobs = load_jobs(&self.path, &mut state).await?;
        if let Some(existing) = jobs.iter_mut().find(|j| j.id == job.id) {
            job.last_run_at = job.last_run_at.or(existing.last_run_at);
            *existing = job.clone();
        } else {
            jobs.push(job.clone());
        }
        write_jobs(&self.path, jobs).await?;
        info!(job_id = %job.id, "cron job saved");
        Ok(job)
    }

    pub async fn remove(&self, id: &str) -> Result<bool, CourierError> {
        let mut state = self.state.lock().await;
        let jobs = load_jobs(&self.path, &mut state).await?;
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        let removed = jobs.len() != before;
        if removed {
            write_jobs(&self.path, jobs).await?;
        }
        Ok(removed)
    }

    pub async fn find(&self, id: &str) -> Result<Option<CronJob>, CourierError> {
        Ok(self.list().await?.into_iter().find(|j| j.id == id))
    }

    /// Enabled jobs due at `now`.
    pub async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<CronJob>, CourierError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|j| j.enabled && j.schedule.is_due(j.last_run_at, now))
            .collect())
    }

    pub async fn mark_ran(&self, id: &str, at: DateTime<Utc>) -> Result<(), CourierError> {
        let mut state = self.state.lock().await;
        let jobs = load_jobs(&self.path, &mut state).await?;
        if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
            job.last_run_at = Some(at);
            write_jobs(&self.path, jobs).await?;
        }
        Ok(())
    }

    pub async fn record_run(&self, record: CronRunRecord) {
        let mut state = self.state.lock().await;
        state.history.push_back(record);
        while state.history.len() > RUN_HISTORY {
            state.history.pop_front();
        }
    }

    /// Recent executions, newest last, optionally filtered to one job.
    pub async fn runs(&self, job_id: Option<&str>) -> Vec<CronRunRecord> {
        let state = self.state.lock().await;
        state
            .history
            .iter()
            .filter(|r| job_id.map(|id| r.job_id == id).unwrap_or(true))
            .cloned()
            .collect()
    }
}

async fn load_jobs<'a>(
    path: &Path,
    state: &'a mut CronState,
) -> Result<&'a mut Vec<CronJob>, CourierError> {
    if state.jobs.is_none() {
        let jobs = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                CourierError::Store(format!("corrupt cron jobs {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(CourierError::Store(format!(
                    "cannot read cron jobs {}: {e}",
                    path.display()
                )))
            }
        };
        state.jobs = Some(jobs);
    }
    Ok(state.jobs.as_mut().expect("jobs populated above"))
}

async fn write_jobs(path: &Path, jobs: &[CronJob]) -> Result<(), CourierError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(jobs)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Poll loop: fire due jobs into the cron lane.
pub async fn cron_loop(gw: Arc<Gateway>) {
    loop {
        let (enabled, poll_secs) = {
            let cfg = gw.config.read().await;
            (cfg.cron.enabled, cfg.cron.poll_interval_secs.max(1))
        };
        tokio::select! {
            _ = gw.shutdown.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(poll_secs)) => {}
        }
        if !enabled {
            continue;
        }

        let now = Utc::now();
        let due = match gw.cron.due_jobs(now).await {
            Ok(due) => due,
            Err(e) => {
                warn!("cron: failed to load jobs: {e}");
                continue;
            }
        };
        for job in due {
            if let Err(e) = fire_job(&gw, &job, now).await {
                warn!(job_id = %job.id, "cron job failed to start: {e}");
            }
        }
    }
}

/// Start one job's run and record it. Shared by the poll loop and
/// `cron.run`.
pub async fn fire_job(
    gw: &Arc<Gateway>,
    job: &CronJob,
    now: DateTime<Utc>,
) -> Result<String, CourierError> {
    debug!(job_id = %job.id, "firing cron job");
    gw.cron.mark_ran(&job.id, now).await?;
    let run_id = gw
        .start_agent_run(RunRequest {
            session_key: job.session_key.clone(),
            text: job.message.clone(),
            lane: "cron".to_string(),
            is_heartbeat: false,
            client_run_id: None,
            deliver: true,
        })
        .await?;
    gw.cron
        .record_run(CronRunRecord {
            job_id: job.id.clone(),
            run_id: run_id.clone(),
            started_at: now,
        })
        .await;
    Ok(run_id)
}
