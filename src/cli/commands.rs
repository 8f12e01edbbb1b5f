use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::browser::proxy::ProxyConfig;
use crate::cli::config::{SupervisorConfig, WorkerMode};
use crate::cli::console::{ConsoleCommand, CONSOLE_HELP};
use crate::process::{InProcessLauncher, OsProcessLauncher, WorkerLauncher};
use crate::storage::{ExportFormat, Pagination, TaskFilter, TaskStoreFactory};
use crate::tasks::{BulkOp, ControllerSettings, SessionRecovery, TaskController, TaskEvent};
use crate::tasks::task::{TaskConfig, TaskId, TaskStatus};
use crate::worker::stdio::run_stdio_worker;
use crate::worker::WorkerEnv;

/// Arguments of `create`
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub name: String,
    pub target: String,
    pub keywords: Vec<String>,
    pub location: Option<String>,
    pub max_pages: u32,
    pub concurrency: u32,
    pub delay_ms: i64,
    pub credential: Option<String>,
    pub proxy: Option<String>,
    pub headed: bool,
    pub schedule_at: Option<String>,
}

impl CreateRequest {
    fn into_config(self) -> Result<TaskConfig> {
        let proxy = match self.proxy {
            Some(raw) => Some(raw.parse::<ProxyConfig>()?),
            None => None,
        };
        let scheduled_at = match self.schedule_at {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .context(format!("Invalid schedule time: {}", raw))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        let mut config = TaskConfig::new(self.name, self.target, self.keywords);
        config.location = self.location;
        config.max_pages = self.max_pages;
        config.concurrency = self.concurrency;
        config.delay_between_requests = self.delay_ms;
        config.credential_id = self.credential;
        config.proxy = proxy;
        config.headless = !self.headed;
        config.scheduled_at = scheduled_at;
        Ok(config)
    }
}

/// Arguments a spawned worker gets in front of the `worker` subcommand
pub fn worker_args(verbose: bool) -> Vec<String> {
    if verbose {
        vec!["--verbose".to_string()]
    } else {
        Vec::new()
    }
}

fn launcher_for(config: &SupervisorConfig, verbose: bool) -> Result<Arc<dyn WorkerLauncher>> {
    match config.worker.mode {
        WorkerMode::Process => {
            let args = worker_args(verbose);
            let launcher = match &config.worker.executable {
                Some(executable) => OsProcessLauncher::new(executable.clone(), args),
                None => OsProcessLauncher::current_exe(args)?,
            };
            Ok(Arc::new(launcher))
        }
        WorkerMode::InProcess => Ok(Arc::new(InProcessLauncher::new(WorkerEnv::live()))),
    }
}

/// Build a controller over the configured store, targets and workers
pub async fn build_controller(config: &SupervisorConfig, launcher: Arc<dyn WorkerLauncher>) -> Result<TaskController> {
    let store = TaskStoreFactory::create(&config.storage)
        .await
        .context("Failed to open the task store")?;

    Ok(TaskController::new(
        store,
        config.target_catalog(),
        Arc::new(config.credential_store()),
        launcher,
        ControllerSettings::from(&config.worker),
    ))
}

async fn connect(config_path: Option<PathBuf>, verbose: bool) -> Result<(SupervisorConfig, TaskController)> {
    let config = SupervisorConfig::load(config_path.as_deref())?;
    let launcher = launcher_for(&config, verbose)?;
    let controller = build_controller(&config, launcher).await?;
    Ok((config, controller))
}

/// Create a new task
pub async fn create(config_path: Option<PathBuf>, request: CreateRequest) -> Result<()> {
    let (_, controller) = connect(config_path, false).await?;
    let id = controller.create_task(request.into_config()?).await?;

    println!("Created task {}", id);
    println!("Use `scrapectl run {}` to start it", id);
    Ok(())
}

/// List tasks
pub async fn list(
    config_path: Option<PathBuf>,
    status: Option<TaskStatus>,
    target: Option<String>,
    name: Option<String>,
    limit: Option<usize>,
    offset: usize,
    json: bool,
) -> Result<()> {
    let (_, controller) = connect(config_path, false).await?;
    let filter = TaskFilter {
        status,
        target,
        name_contains: name,
        limit,
        offset,
    };
    let tasks = controller.list_tasks(&filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }
    if tasks.is_empty() {
        println!("No tasks");
        return Ok(());
    }

    println!("{:<6} {:<12} {:<20} {:>6} {:>8}  {}", "ID", "STATUS", "TARGET", "PAGES", "PID", "NAME");
    for task in tasks {
        let pid = task.pid.map(|pid| pid.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "{:<6} {:<12} {:<20} {:>6} {:>8}  {}",
            task.id,
            task.status,
            task.config.target,
            task.config.total_pages(),
            pid,
            task.config.name
        );
    }
    Ok(())
}

/// Show one task
pub async fn show(config_path: Option<PathBuf>, id: TaskId, json: bool) -> Result<()> {
    let (_, controller) = connect(config_path, false).await?;
    let task = controller.get_task(id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
        return Ok(());
    }

    println!("Task ID: {}", task.id);
    println!("Name: {}", task.config.name);
    println!("Status: {}", task.status);
    println!("Target: {}", task.config.target);
    println!("Keywords: {}", task.config.keywords.join(", "));
    if let Some(location) = &task.config.location {
        println!("Location: {}", location);
    }
    println!("Pages per keyword: {}", task.config.max_pages);
    println!("Concurrency: {}", task.config.concurrency);
    if let Some(pid) = task.pid {
        println!("Worker pid: {}", pid);
    }
    if let Some(at) = task.config.scheduled_at {
        println!("Scheduled: {}", at);
    }
    println!("Created: {}", task.created_at);
    println!("Last Updated: {}", task.updated_at);
    if let Some(at) = task.completed_at {
        println!("Finished: {}", at);
    }

    if !task.run_log.is_empty() {
        println!("Run log:");
        for line in task.run_log.lines() {
            println!("  {}", line);
        }
    }
    if !task.error_log.is_empty() {
        println!("Errors:");
        for line in task.error_log.lines() {
            println!("  - {}", line);
        }
    }
    Ok(())
}

/// Print one page of results as JSON lines
pub async fn results(config_path: Option<PathBuf>, id: TaskId, page: u32, per_page: u32) -> Result<()> {
    let (_, controller) = connect(config_path, false).await?;
    let results = controller.get_task_results(id, Pagination::new(page, per_page)).await?;

    let first = (results.page as u64 - 1) * results.per_page as u64;
    println!(
        "Results {}-{} of {} (page {})",
        (first + 1).min(results.total),
        first + results.items.len() as u64,
        results.total,
        results.page
    );
    for record in &results.items {
        println!("{}", serde_json::to_string(record)?);
    }
    Ok(())
}

/// Export a task's results to a file
pub async fn export(config_path: Option<PathBuf>, id: TaskId, format: String, output: Option<PathBuf>) -> Result<()> {
    let format: ExportFormat = format.parse()?;
    let (_, controller) = connect(config_path, false).await?;

    let task = controller.get_task(id).await?;
    if task.status != TaskStatus::Completed {
        warn!("Task {} is {}; results may be missing", id, task.status);
    }

    let contents = controller.export_task_results(id, format).await?;
    let output_path = output.unwrap_or_else(|| PathBuf::from(format!("task-{}.{}", id, format.extension())));
    tokio::fs::write(&output_path, contents)
        .await
        .context(format!("Failed to write export file: {}", output_path.display()))?;

    info!("Results exported to: {}", output_path.display());
    println!("{}", output_path.display());
    Ok(())
}

/// Delete tasks
pub async fn delete(config_path: Option<PathBuf>, ids: Vec<TaskId>) -> Result<()> {
    let (_, controller) = connect(config_path, false).await?;
    let outcomes = controller.bulk_operation(BulkOp::Delete, &ids).await;

    let mut failed = 0;
    for outcome in &outcomes {
        match &outcome.error {
            None => println!("Deleted task {}", outcome.task_id),
            Some(e) => {
                failed += 1;
                println!("Task {}: {}", outcome.task_id, e);
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{} of {} deletions failed", failed, outcomes.len());
    }
    Ok(())
}

/// Kill a worker by pid
pub async fn kill(config_path: Option<PathBuf>, pid: u32) -> Result<()> {
    let (_, controller) = connect(config_path, false).await?;
    let outcome = controller.kill_process_by_pid(pid).await;

    match (outcome.success, outcome.task_id) {
        (true, Some(task_id)) => println!("Killed worker {} of task {}; task is pending again", pid, task_id),
        (true, None) => println!("Killed process {}", pid),
        (false, _) => println!("No live process with pid {}", pid),
    }
    Ok(())
}

pub async fn pid_status(config_path: Option<PathBuf>, pid: u32) -> Result<()> {
    let (_, controller) = connect(config_path, false).await?;
    let status = controller.get_process_status_by_pid(pid).await;

    println!("Pid: {}", status.pid);
    println!("Alive: {}", status.alive);
    match status.task_id {
        Some(task_id) => println!("Task: {}", task_id),
        None => println!("Task: -"),
    }
    Ok(())
}

fn print_recovery(recovery: &SessionRecovery) {
    for id in &recovery.orphaned {
        println!("Task {} was orphaned and is now failed", id);
    }
    for id in &recovery.detached {
        println!("Task {} had a detached worker; it was killed and the task failed", id);
    }
    if !recovery.due.is_empty() {
        let due: Vec<String> = recovery.due.iter().map(|id| id.to_string()).collect();
        println!("Due for a run: {}", due.join(", "));
    }
}

/// Reconcile tasks left over from an earlier supervisor
pub async fn recover(config_path: Option<PathBuf>) -> Result<()> {
    let (_, controller) = connect(config_path, false).await?;
    let recovery = controller.handle_tasks_from_previous_session().await?;

    if recovery == SessionRecovery::default() {
        println!("Nothing to recover");
    } else {
        print_recovery(&recovery);
    }
    Ok(())
}

/// List configured targets
pub async fn targets(config_path: Option<PathBuf>) -> Result<()> {
    let config = SupervisorConfig::load(config_path.as_deref())?;

    println!("{:<20} {:<10} {:<8} {}", "NAME", "ADAPTER", "ACTIVE", "CREDENTIALS");
    for target in config.target_catalog().iter() {
        println!(
            "{:<20} {:<10} {:<8} {}",
            target.name,
            target.adapter,
            target.active,
            if target.requires_credentials { "required" } else { "-" }
        );
    }
    Ok(())
}

/// Show, locate or initialise the configuration
pub async fn show_config(config_path: Option<PathBuf>, path_only: bool, init: bool) -> Result<()> {
    let path = config_path.clone().unwrap_or_else(SupervisorConfig::default_path);

    if path_only {
        println!("{}", path.display());
        return Ok(());
    }
    if init {
        if path.exists() {
            anyhow::bail!("Configuration already exists: {}", path.display());
        }
        SupervisorConfig::default().save_to_file(&path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let config = SupervisorConfig::load(config_path.as_deref())?;
    println!("Current configuration ({}):", path.display());
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

/// Hidden `worker` subcommand: serve one task over stdin/stdout
pub async fn worker() -> Result<()> {
    let result = run_stdio_worker(WorkerEnv::live()).await;
    if let Err(e) = &result {
        error!("Worker failed: {:#}", e);
    }
    // The runtime would otherwise wait on the blocking stdin reader
    std::process::exit(if result.is_ok() { 0 } else { 1 });
}

/// Lines typed on the terminal; read on a plain thread so exit never waits on it
fn spawn_console_reader() -> mpsc::UnboundedReceiver<String> {
    let (lines, receiver) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if lines.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    receiver
}

fn print_event(event: &TaskEvent) {
    match event {
        TaskEvent::Progress(p) => {
            let eta = p.eta_seconds.map(|s| format!(", eta {}s", s)).unwrap_or_default();
            println!(
                "[task {}] {:>3}% page {}/{} '{}' ({} results{})",
                p.task_id, p.percentage, p.current_page, p.total_pages, p.keyword, p.results_count, eta
            );
        }
        TaskEvent::StatusChanged { task_id, status } => println!("[task {}] {}", task_id, status),
        TaskEvent::Completed { task_id, results } => {
            println!("[task {}] completed with {} results", task_id, results)
        }
        TaskEvent::Failed { task_id, message } => println!("[task {}] failed: {}", task_id, message),
    }
}

async fn execute_console(controller: &TaskController, command: ConsoleCommand) {
    let report = |id: TaskId, verb: &str, result: Result<(), crate::tasks::ControllerError>| match result {
        Ok(()) => println!("Task {} {}", id, verb),
        Err(e) => println!("{}", e),
    };

    match command {
        ConsoleCommand::Start(id) => match controller.start_task(id).await {
            Ok(record) => println!("Task {} started on worker {}", id, record.pid),
            Err(e) => println!("{}", e),
        },
        ConsoleCommand::Pause(id) => report(id, "paused", controller.pause_task(id).await),
        ConsoleCommand::Resume(id) => report(id, "resumed", controller.resume_task(id).await),
        ConsoleCommand::Stop(id) => report(id, "stopped", controller.stop_task(id).await),
        ConsoleCommand::Kill(pid) => {
            let outcome = controller.kill_process_by_pid(pid).await;
            if outcome.success {
                println!("Killed process {}", pid);
            } else {
                println!("No live process with pid {}", pid);
            }
        }
        ConsoleCommand::Status => {
            let running = controller.running().await;
            if running.is_empty() {
                println!("No running workers");
            }
            for record in running {
                let status = controller
                    .get_task(record.task_id)
                    .await
                    .map(|task| task.status.to_string())
                    .unwrap_or_else(|e| e.to_string());
                let progress = controller
                    .get_progress(record.task_id)
                    .await
                    .map(|p| format!("{}%", p.percentage))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "task {} pid {} {} {} (since {})",
                    record.task_id, record.pid, status, progress, record.started_at
                );
            }
        }
        ConsoleCommand::Help | ConsoleCommand::Quit => println!("{}", CONSOLE_HELP),
    }
}

/// Start tasks and supervise them until they settle or the user interrupts
pub async fn run(config_path: Option<PathBuf>, verbose: bool, ids: Vec<TaskId>, due: bool, stay: bool) -> Result<()> {
    let (config, controller) = connect(config_path, verbose).await?;

    let recovery = controller.handle_tasks_from_previous_session().await?;
    print_recovery(&recovery);

    let mut to_start = ids;
    if due {
        for id in recovery.due {
            if !to_start.contains(&id) {
                to_start.push(id);
            }
        }
    }

    let mut events = controller.subscribe();
    for outcome in controller.bulk_operation(BulkOp::Start, &to_start).await {
        match outcome.error {
            None => println!("Task {} started", outcome.task_id),
            Some(e) => println!("Task {} not started: {}", outcome.task_id, e),
        }
    }

    if !stay && controller.is_idle().await {
        println!("Nothing to supervise");
        return Ok(());
    }
    println!("{}", CONSOLE_HELP);

    let mut console = spawn_console_reader();
    let mut console_open = true;
    let mut health = tokio::time::interval(Duration::from_millis(config.worker.heartbeat_interval_ms.max(1000)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted; stopping running tasks");
                break;
            }
            line = console.recv(), if console_open => match line {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match line.parse::<ConsoleCommand>() {
                    Ok(ConsoleCommand::Quit) => break,
                    Ok(command) => execute_console(&controller, command).await,
                    Err(e) => println!("{} ({})", e, CONSOLE_HELP),
                },
                None => console_open = false,
            },
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(missed)) => warn!("Missed {} task events", missed),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = health.tick() => match controller.check_process_health().await {
                Ok(failed) if !failed.is_empty() => warn!("Unresponsive workers killed for tasks {:?}", failed),
                Ok(_) => {}
                Err(e) => warn!("Health check failed: {:#}", e),
            },
        }

        if !stay && controller.is_idle().await {
            info!("Every supervised task has settled");
            break;
        }
    }

    for outcome in controller.stop_all().await {
        match outcome.error {
            None => println!("Task {} stopped", outcome.task_id),
            Some(e) => println!("Task {}: {}", outcome.task_id, e),
        }
    }
    // Flush what the last completions reported
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::StorageSettings;

    fn request() -> CreateRequest {
        CreateRequest {
            name: "rust jobs".into(),
            target: "example-jobs".into(),
            keywords: vec!["rust".into()],
            location: Some("Berlin".into()),
            max_pages: 2,
            concurrency: 1,
            delay_ms: 250,
            credential: None,
            proxy: Some("socks5://127.0.0.1:9050".into()),
            headed: true,
            schedule_at: Some("2030-01-01T08:00:00Z".into()),
        }
    }

    #[test]
    fn test_request_to_config() {
        let config = request().into_config().unwrap();
        assert_eq!(config.location.as_deref(), Some("Berlin"));
        assert!(!config.headless);
        assert_eq!(config.proxy.unwrap().port, Some(9050));
        assert_eq!(config.scheduled_at.unwrap().to_rfc3339(), "2030-01-01T08:00:00+00:00");
    }

    #[test]
    fn test_request_rejects_bad_schedule() {
        let mut bad = request();
        bad.schedule_at = Some("tomorrow".into());
        assert!(bad.into_config().is_err());
    }

    #[test]
    fn test_worker_args() {
        assert!(worker_args(false).is_empty());
        assert_eq!(worker_args(true), vec!["--verbose"]);
    }

    #[tokio::test]
    async fn test_controller_from_memory_config() {
        let config = SupervisorConfig {
            storage: StorageSettings {
                backend: "memory".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let launcher = Arc::new(InProcessLauncher::new(WorkerEnv::live()));
        let controller = build_controller(&config, launcher).await.unwrap();

        let id = controller.create_task(request().into_config().unwrap()).await.unwrap();
        let tasks = controller.list_tasks(&TaskFilter::default()).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, id);
        assert!(controller.targets().get("example-jobs").is_some());
    }
}
