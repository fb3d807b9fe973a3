// src/scheduler.rs
use crate::error::StoreError;
use crate::models::ist;
use crate::pipeline::{CleanupReport, Pipeline, RefreshReport};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{error, info};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("price scheduler is not running")]
    Stopped,
    #[error(transparent)]
    Store(#[from] StoreError),
}

enum Command {
    RefreshNow(oneshot::Sender<Result<RefreshReport, StoreError>>),
    Stop,
}

#[derive(Debug, Clone, Copy)]
pub struct CleanupPolicy {
    pub hour_ist: u32,
    pub retention_days: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub interval_secs: u64,
    pub runs_completed: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_report: Option<RefreshReport>,
    pub next_cleanup: Option<DateTime<Utc>>,
    pub last_cleanup: Option<CleanupReport>,
}

#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
    status: Arc<RwLock<SchedulerStatus>>,
}

impl SchedulerHandle {
    pub async fn refresh_now(&self) -> Result<RefreshReport, SchedulerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::RefreshNow(reply_tx))
            .await
            .map_err(|_| SchedulerError::Stopped)?;
        let report = reply_rx.await.map_err(|_| SchedulerError::Stopped)??;
        Ok(report)
    }

    pub async fn stop(&self) {
        let _ = self.tx.send(Command::Stop).await;
    }

    pub async fn status(&self) -> SchedulerStatus {
        self.status.read().await.clone()
    }
}

/// Time from `now` until the next `hour:00` on the India clock.
pub fn duration_until_next(hour_ist: u32, now: DateTime<Utc>) -> Duration {
    let local = now.with_timezone(&ist()).naive_local();
    let target = match local.date().and_hms_opt(hour_ist, 0, 0) {
        Some(t) if t > local => t,
        Some(t) => t + ChronoDuration::days(1),
        None => return Duration::from_secs(24 * 3600),
    };
    (target - local).to_std().unwrap_or(Duration::ZERO)
}

/// Starts the refresh worker. The first cycle runs immediately.
pub fn spawn(pipeline: Arc<Pipeline>, interval: Duration, cleanup: CleanupPolicy) -> (SchedulerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(16);
    let status = Arc::new(RwLock::new(SchedulerStatus {
        running: true,
        interval_secs: interval.as_secs(),
        ..SchedulerStatus::default()
    }));
    let worker = tokio::spawn(run(pipeline, interval, cleanup, rx, status.clone()));
    (SchedulerHandle { tx, status }, worker)
}

async fn run(
    pipeline: Arc<Pipeline>,
    interval: Duration,
    cleanup: CleanupPolicy,
    mut rx: mpsc::Receiver<Command>,
    status: Arc<RwLock<SchedulerStatus>>,
) {
    info!(
        "Price scheduler started, refreshing every {}s, cleanup at {:02}:00 IST",
        interval.as_secs(),
        cleanup.hour_ist
    );
    let mut ticker = time::interval(interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let first_cleanup = duration_until_next(cleanup.hour_ist, Utc::now());
    status.write().await.next_cleanup = ChronoDuration::from_std(first_cleanup)
        .ok()
        .map(|d| Utc::now() + d);
    let cleanup_timer = time::sleep(first_cleanup);
    tokio::pin!(cleanup_timer);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::RefreshNow(reply)) => {
                    let result = refresh(&pipeline, &status).await;
                    let _ = reply.send(result);
                }
                Some(Command::Stop) | None => break,
            },
            _ = ticker.tick() => {
                if let Err(e) = refresh(&pipeline, &status).await {
                    error!("Scheduled refresh failed: {}", e);
                }
            }
            _ = &mut cleanup_timer => {
                let now = Utc::now();
                match pipeline.cleanup(now, cleanup.retention_days).await {
                    Ok(report) => status.write().await.last_cleanup = Some(report),
                    Err(e) => error!("Quote cleanup failed: {}", e),
                }
                let next = duration_until_next(cleanup.hour_ist, Utc::now());
                status.write().await.next_cleanup =
                    ChronoDuration::from_std(next).ok().map(|d| Utc::now() + d);
                cleanup_timer.as_mut().reset(Instant::now() + next);
            }
        }
    }

    status.write().await.running = false;
    info!("Price scheduler stopped");
}

async fn refresh(
    pipeline: &Pipeline,
    status: &RwLock<SchedulerStatus>,
) -> Result<RefreshReport, StoreError> {
    let report = pipeline.run_cycle().await?;
    let mut status = status.write().await;
    status.runs_completed += 1;
    status.last_run = report.started_at;
    status.last_report = Some(report.clone());
    Ok(report)
}
