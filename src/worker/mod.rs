pub mod protocol;
pub mod stdio;

#[cfg(test)]
pub(crate) mod testing;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapters::{AdapterError, AdapterRegistry, Dispatcher, PageListing, SearchQuery, TargetDescriptor};
use crate::browser::{self, BrowserSession};
use crate::tasks::task::{ProgressSnapshot, ResultRecord, TaskConfig, TaskId};
use crate::utils::RunMetrics;

// Re-export common types
pub use protocol::{ControlCommand, RunSignal, StartMessage, SupervisorMessage, WorkerMessage};

/// Channel a worker reports through
pub type Outbox = mpsc::UnboundedSender<WorkerMessage>;

/// Opens the automation session for a run
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn open(&self, target: &TargetDescriptor, config: &TaskConfig) -> Result<Arc<dyn BrowserSession>>;
}

/// Real HTTP / WebDriver sessions
pub struct LiveSessions;

#[async_trait]
impl SessionProvider for LiveSessions {
    async fn open(&self, target: &TargetDescriptor, config: &TaskConfig) -> Result<Arc<dyn BrowserSession>> {
        browser::open_session(&target.session, config.headless, config.proxy.as_ref()).await
    }
}

/// Adapters and sessions available to a worker
#[derive(Clone)]
pub struct WorkerEnv {
    pub adapters: AdapterRegistry,
    pub sessions: Arc<dyn SessionProvider>,
}

impl WorkerEnv {
    pub fn live() -> Self {
        Self {
            adapters: AdapterRegistry::with_builtins(),
            sessions: Arc::new(LiveSessions),
        }
    }
}

/// How a run ended when it did not fail
#[derive(Debug)]
enum RunOutcome {
    Completed(Vec<ResultRecord>),
    Stopped,
}

/// Run one task to its end.
///
/// Control messages arrive on `control`; closing it counts as a stop. At most
/// one terminal message (Completed or Error) is sent, none after a stop.
pub async fn serve(
    start: StartMessage,
    env: WorkerEnv,
    control: mpsc::UnboundedReceiver<SupervisorMessage>,
    outbox: Outbox,
) {
    let task_id = start.task_id;
    let (signal_tx, signal_rx) = watch::channel(RunSignal::Running);
    let reader = spawn_control_reader(task_id, control, signal_tx, outbox.clone());
    let heartbeat = (start.heartbeat_interval_ms > 0).then(|| {
        spawn_heartbeat(task_id, Duration::from_millis(start.heartbeat_interval_ms), outbox.clone())
    });

    info!("Worker starting task {}", task_id);
    let outcome = execute(&start, &env, signal_rx, &outbox).await;

    if let Some(heartbeat) = heartbeat {
        heartbeat.abort();
    }

    match outcome {
        Ok(RunOutcome::Completed(results)) => {
            info!("Task {} finished with {} results", task_id, results.len());
            let _ = outbox.send(WorkerMessage::Completed { task_id, results });
        }
        Ok(RunOutcome::Stopped) => {
            info!("Task {} stopped", task_id);
        }
        Err(e) => {
            error!("Task {} failed: {:#}", task_id, e);
            let _ = outbox.send(WorkerMessage::Error {
                task_id,
                message: format!("{:#}", e),
            });
        }
    }

    reader.abort();
}

/// Apply pause/resume/stop requests to the run signal and acknowledge them
pub fn spawn_control_reader(
    task_id: TaskId,
    mut control: mpsc::UnboundedReceiver<SupervisorMessage>,
    signals: watch::Sender<RunSignal>,
    outbox: Outbox,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = control.recv().await {
            let command = match message {
                SupervisorMessage::Pause => {
                    signals.send_if_modified(|signal| {
                        let running = *signal == RunSignal::Running;
                        if running {
                            *signal = RunSignal::Paused;
                        }
                        running
                    });
                    ControlCommand::Pause
                }
                SupervisorMessage::Resume => {
                    signals.send_if_modified(|signal| {
                        let paused = *signal == RunSignal::Paused;
                        if paused {
                            *signal = RunSignal::Running;
                        }
                        paused
                    });
                    ControlCommand::Resume
                }
                SupervisorMessage::Stop => {
                    signals.send_replace(RunSignal::Stopped);
                    ControlCommand::Stop
                }
                SupervisorMessage::Start(_) => {
                    warn!("Task {} ignores a second start request", task_id);
                    continue;
                }
            };

            debug!("Task {} acknowledged {:?}", task_id, command);
            let _ = outbox.send(WorkerMessage::Ack { task_id, command });
            if command == ControlCommand::Stop {
                return;
            }
        }

        debug!("Control channel of task {} closed; stopping", task_id);
        signals.send_replace(RunSignal::Stopped);
    })
}

pub fn spawn_heartbeat(task_id: TaskId, interval: Duration, outbox: Outbox) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if outbox.send(WorkerMessage::Heartbeat { task_id }).is_err() {
                break;
            }
        }
    })
}

async fn execute(
    start: &StartMessage,
    env: &WorkerEnv,
    mut signals: watch::Receiver<RunSignal>,
    outbox: &Outbox,
) -> Result<RunOutcome> {
    let adapter = env.adapters.resolve(&start.target)?;
    let dispatcher = Dispatcher::new(adapter, &start.target)?;
    dispatcher.log_paths(start.task_id);

    let session = env
        .sessions
        .open(&start.target, &start.config)
        .await
        .context(format!("Failed to open a session for target '{}'", start.target.name))?;

    let outcome = extract_all(start, &dispatcher, session.as_ref(), &mut signals, outbox).await;
    session.close().await;
    outcome
}

/// Block while paused; false once the run is stopped
async fn wait_until_runnable(signals: &mut watch::Receiver<RunSignal>) -> bool {
    let runnable = signals
        .wait_for(|signal| *signal != RunSignal::Paused)
        .await
        .map(|signal| *signal == RunSignal::Running);
    runnable.unwrap_or(false)
}

/// Sleep between pages; false if a stop arrived meanwhile
async fn delay_unless_stopped(delay: Duration, signals: &mut watch::Receiver<RunSignal>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = signals.wait_for(|signal| *signal == RunSignal::Stopped) => false,
    }
}

async fn fetch_page(
    dispatcher: &Dispatcher,
    session: &dyn BrowserSession,
    mut query: SearchQuery,
    previous: Option<&PageListing>,
) -> Result<Option<(PageListing, Vec<Value>)>, AdapterError> {
    let Some(url) = dispatcher.page_url(&query, previous).await? else {
        return Ok(None);
    };
    query.url = Some(url);

    let listing = dispatcher.search(session, &query).await?;
    let items = dispatcher.extract(&listing).await?;
    Ok(Some((listing, items)))
}

async fn extract_all(
    start: &StartMessage,
    dispatcher: &Dispatcher,
    session: &dyn BrowserSession,
    signals: &mut watch::Receiver<RunSignal>,
    outbox: &Outbox,
) -> Result<RunOutcome> {
    let task_id = start.task_id;
    let config = &start.config;

    if let Some(credentials) = &start.credentials {
        dispatcher
            .apply_credentials(session, credentials)
            .await
            .context("Failed to apply credentials")?;
        info!("Task {} logged in as {}", task_id, credentials.username);
    }

    let window = if dispatcher.capabilities().parallel_fetch && session.supports_parallel() && config.concurrency > 1 {
        config.concurrency
    } else {
        1
    };
    let delay = Duration::from_millis(config.delay_between_requests.max(0) as u64);
    let total = config.total_pages();
    let mut metrics = RunMetrics::start(total);
    let mut done = 0u32;
    let mut results: Vec<ResultRecord> = Vec::new();

    debug!("Task {} visits {} pages, {} at a time", task_id, total, window);

    for keyword in &config.keywords {
        let mut previous: Option<PageListing> = None;
        let mut page = 1;

        while page <= config.max_pages {
            if !wait_until_runnable(signals).await {
                return Ok(RunOutcome::Stopped);
            }

            let last = page.saturating_add(window - 1).min(config.max_pages);
            let fetches = (page..=last).map(|number| {
                let query = SearchQuery {
                    keyword: keyword.clone(),
                    location: config.location.clone(),
                    page: number,
                    url: None,
                };
                fetch_page(dispatcher, session, query, previous.as_ref())
            });
            let outcomes = join_all(fetches).await;

            let mut exhausted = false;
            for (number, outcome) in (page..=last).zip(outcomes) {
                match outcome {
                    Ok(Some((listing, items))) => {
                        debug!("Task {} keyword '{}' page {}: {} items", task_id, keyword, number, items.len());
                        let extracted_at = Utc::now();
                        results.extend(items.into_iter().map(|data| ResultRecord {
                            task_id,
                            keyword: keyword.clone(),
                            page: number,
                            data,
                            extracted_at,
                        }));
                        previous = Some(listing);
                    }
                    Ok(None) => {
                        debug!(
                            "Task {} keyword '{}' has no page {}; skipping its remaining pages",
                            task_id, keyword, number
                        );
                        done += config.max_pages - number + 1;
                        exhausted = true;
                        break;
                    }
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => {
                        if !session.is_alive().await {
                            anyhow::bail!("browser session lost after page error: {}", e);
                        }
                        warn!("Task {} keyword '{}' page {} failed: {}", task_id, keyword, number, e);
                        metrics.record_failure();
                        let _ = outbox.send(WorkerMessage::Log {
                            task_id,
                            message: format!("keyword '{}' page {}: {}", keyword, number, e),
                        });
                    }
                }

                done += 1;
                let _ = outbox.send(WorkerMessage::Progress(ProgressSnapshot {
                    task_id,
                    keyword: keyword.clone(),
                    current_page: done,
                    total_pages: total,
                    results_count: results.len() as u64,
                    percentage: ProgressSnapshot::running_percentage(done, total),
                    eta_seconds: metrics.eta_seconds(done),
                }));
            }

            if exhausted {
                break;
            }

            page = last + 1;
            if page <= config.max_pages && !delay.is_zero() && !delay_unless_stopped(delay, signals).await {
                return Ok(RunOutcome::Stopped);
            }
        }
    }

    // A pause that arrived during the last page holds the result back
    if !wait_until_runnable(signals).await {
        return Ok(RunOutcome::Stopped);
    }

    if metrics.failed_pages() > 0 {
        info!("Task {} skipped {} failed pages", task_id, metrics.failed_pages());
    }
    Ok(RunOutcome::Completed(results))
}
