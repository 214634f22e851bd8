//! Cron-driven scheduling with on-demand triggering (spec §4.1).
//!
//! A single cooperative loop owns the decision of *when* to run a
//! backup. State transitions and run results are exposed as
//! `tokio::sync::{watch, broadcast}` channels rather than callbacks,
//! generalizing the teacher's `Arc<RwLock<..>>`-shared scheduler state
//! into something multiple observers can subscribe to independently.

use cron::Schedule;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Notify, RwLock};

use crate::config::{normalize_cron_expr, BackupConfiguration};
use crate::error::{SchedulerError, SchedulerResult};
use crate::status::{RunKind, RunResult};

const COOLDOWN_ON_ERROR: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// Observable scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Waiting,
    Running,
}

/// Executes a single run; implemented by the backup executor.
#[async_trait::async_trait]
pub trait RunHandler: Send + Sync {
    async fn run(&self, kind: RunKind) -> RunResult;
}

/// Asks for a possibly-newer configuration; implemented by the config
/// sync module against the SFTP transport.
#[async_trait::async_trait]
pub trait ConfigResync: Send + Sync {
    async fn resync(&self, current: &BackupConfiguration) -> Option<BackupConfiguration>;
}

fn next_after(cron_expr: &str, now: chrono::DateTime<chrono::Utc>) -> SchedulerResult<chrono::DateTime<chrono::Utc>> {
    let schedule = Schedule::from_str(&normalize_cron_expr(cron_expr))
        .map_err(|e| SchedulerError::InvalidCron(e.to_string()))?;
    schedule
        .after(&now)
        .next()
        .ok_or_else(|| SchedulerError::InvalidCron(format!("{cron_expr}: no upcoming occurrence")))
}

/// The scheduler loop and its observable channels.
pub struct Scheduler {
    config: Arc<RwLock<BackupConfiguration>>,
    handler: Arc<dyn RunHandler>,
    resync: Arc<dyn ConfigResync>,
    state_tx: watch::Sender<SchedulerState>,
    state_rx: watch::Receiver<SchedulerState>,
    result_tx: broadcast::Sender<RunResult>,
    next_scheduled_tx: watch::Sender<Option<chrono::DateTime<chrono::Utc>>>,
    next_scheduled_rx: watch::Receiver<Option<chrono::DateTime<chrono::Utc>>>,
    trigger_notify: Arc<Notify>,
    trigger_pending: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        config: Arc<RwLock<BackupConfiguration>>,
        handler: Arc<dyn RunHandler>,
        resync: Arc<dyn ConfigResync>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);
        let (result_tx, _) = broadcast::channel(16);
        let (next_scheduled_tx, next_scheduled_rx) = watch::channel(None);
        Self {
            config,
            handler,
            resync,
            state_tx,
            state_rx,
            result_tx,
            next_scheduled_tx,
            next_scheduled_rx,
            trigger_notify: Arc::new(Notify::new()),
            trigger_pending: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn current_state(&self) -> SchedulerState {
        *self.state_rx.borrow()
    }

    pub fn next_scheduled_utc(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        *self.next_scheduled_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
        self.state_rx.clone()
    }

    pub fn subscribe_results(&self) -> broadcast::Receiver<RunResult> {
        self.result_tx.subscribe()
    }

    /// Release the one-slot trigger. Idempotent: a second trigger
    /// while one is already pending, or while a run is in progress,
    /// has no effect.
    pub fn trigger_now(&self) {
        if self.current_state() != SchedulerState::Waiting {
            return;
        }
        if !self.trigger_pending.swap(true, Ordering::SeqCst) {
            self.trigger_notify.notify_one();
        }
    }

    fn set_state(&self, state: SchedulerState) {
        let _ = self.state_tx.send(state);
    }

    /// Run the scheduler loop until `shutdown` resolves.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut last_resync = chrono::Utc::now() - chrono::Duration::days(1);

        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.iterate(&mut last_resync, &mut shutdown).await {
                Ok(()) => {}
                Err(e) => {
                    tracing::error!(error = %e, "scheduler iteration failed, entering cooldown");
                    self.set_state(SchedulerState::Idle);
                    tokio::select! {
                        _ = tokio::time::sleep(COOLDOWN_ON_ERROR) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    async fn iterate(
        &self,
        last_resync: &mut chrono::DateTime<chrono::Utc>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SchedulerResult<()> {
        let sync_interval_minutes = self.config.read().await.config_sync_interval_minutes;
        let now = chrono::Utc::now();
        if now - *last_resync >= chrono::Duration::minutes(sync_interval_minutes as i64) {
            let current = self.config.read().await.clone();
            if let Some(newer) = self.resync.resync(&current).await {
                *self.config.write().await = newer;
            }
            *last_resync = now;
        }

        let config = self.config.read().await.clone();
        let next_file = next_after(&config.file_backup_cron, now)?;
        let next_image = if config.enable_full_image_backup {
            config
                .full_image_cron
                .as_deref()
                .map(|expr| next_after(expr, now))
                .transpose()?
        } else {
            None
        };

        let (next_scheduled, fires_image) = match next_image {
            Some(image_time) if image_time < next_file => (image_time, true),
            _ => (next_file, false),
        };
        let _ = self.next_scheduled_tx.send(Some(next_scheduled));

        self.set_state(SchedulerState::Waiting);
        let delay = (next_scheduled - chrono::Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);

        let triggered = tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.trigger_notify.notified(), if self.trigger_pending.load(Ordering::SeqCst) => {
                self.trigger_pending.store(false, Ordering::SeqCst);
                true
            }
            _ = shutdown.changed() => return Ok(()),
        };

        let kind = if triggered { RunKind::File } else if fires_image { RunKind::Image } else { RunKind::File };

        self.set_state(SchedulerState::Running);
        let result = self.handler.run(kind).await;
        let _ = self.result_tx.send(result);
        self.set_state(SchedulerState::Idle);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::RunOutcome;
    use std::sync::atomic::AtomicU32;

    fn sample_config(file_cron: &str) -> BackupConfiguration {
        BackupConfiguration {
            customer_id: "acme".to_string(),
            source_roots: vec![],
            exclude_patterns: vec![],
            file_backup_cron: file_cron.to_string(),
            full_image_cron: None,
            enable_full_image_backup: false,
            quota_bytes: 0,
            retention_keep_last: 1,
            config_sync_interval_minutes: 60,
            chunk_bytes: 0,
            compress_before_upload: false,
            encryption_passphrase: None,
            host: "nas".to_string(),
            port: 22,
            username: "agent".to_string(),
            password: None,
            private_key_path: None,
            private_key_passphrase: None,
            remote_base_path: "/backups".to_string(),
            last_modified_utc: chrono::Utc::now(),
        }
    }

    struct CountingHandler {
        calls: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl RunHandler for CountingHandler {
        async fn run(&self, _kind: RunKind) -> RunResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            RunResult {
                run_id: "r".to_string(),
                kind: RunKind::File,
                outcome: RunOutcome::Success,
                started_utc: chrono::Utc::now(),
                completed_utc: chrono::Utc::now(),
                files_scanned: 0,
                files_uploaded: 0,
                files_failed: 0,
                bytes_transferred: 0,
                errors: vec![],
            }
        }
    }

    struct NoResync;
    #[async_trait::async_trait]
    impl ConfigResync for NoResync {
        async fn resync(&self, _current: &BackupConfiguration) -> Option<BackupConfiguration> {
            None
        }
    }

    #[test]
    fn cron_monotonicity() {
        let now = chrono::Utc::now();
        let next = next_after("0 0 * * * *", now).unwrap();
        assert!(next > now);
    }

    #[test]
    fn invalid_cron_is_rejected() {
        assert!(next_after("not a cron", chrono::Utc::now()).is_err());
    }

    #[test]
    fn five_field_cron_is_accepted() {
        let now = chrono::Utc::now();
        let next = next_after("0 2 * * *", now).unwrap();
        assert!(next > now);
    }

    #[tokio::test]
    async fn s9_trigger_is_ignored_outside_waiting() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = Arc::new(RwLock::new(sample_config("0 0 0 1 1 * 2099")));
        let scheduler = Scheduler::new(
            config,
            Arc::new(CountingHandler { calls: calls.clone() }),
            Arc::new(NoResync),
        );

        // Idle: trigger has no effect.
        scheduler.trigger_now();
        assert!(!scheduler.trigger_pending.load(Ordering::SeqCst));

        scheduler.set_state(SchedulerState::Running);
        scheduler.trigger_now();
        assert!(!scheduler.trigger_pending.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn s9_trigger_during_waiting_is_recorded_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = Arc::new(RwLock::new(sample_config("0 0 0 1 1 * 2099")));
        let scheduler = Scheduler::new(
            config,
            Arc::new(CountingHandler { calls: calls.clone() }),
            Arc::new(NoResync),
        );

        scheduler.set_state(SchedulerState::Waiting);
        scheduler.trigger_now();
        scheduler.trigger_now();
        assert!(scheduler.trigger_pending.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn a_full_iteration_invokes_the_handler_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = Arc::new(RwLock::new(sample_config("0 0 0 1 1 * 2099")));
        let scheduler = Scheduler::new(
            config,
            Arc::new(CountingHandler { calls: calls.clone() }),
            Arc::new(NoResync),
        );

        scheduler.set_state(SchedulerState::Waiting);
        scheduler.trigger_now();

        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let mut last_resync = chrono::Utc::now() - chrono::Duration::days(1);
        scheduler.iterate(&mut last_resync, &mut shutdown_rx).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.current_state(), SchedulerState::Idle);
    }
}
