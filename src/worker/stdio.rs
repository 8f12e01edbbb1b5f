use anyhow::{Context, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::worker::protocol::{decode_line, encode_line};
use crate::worker::{serve, SupervisorMessage, WorkerEnv, WorkerMessage};

/// How long buffered messages may take to reach the supervisor after the run
const FLUSH_DEADLINE: Duration = Duration::from_secs(5);

/// Worker process entry point: JSON lines on stdin and stdout
pub async fn run_stdio_worker(env: WorkerEnv) -> Result<()> {
    run_worker_io(env, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve one task read from `input`, reporting on `output`.
///
/// The first line must be a start message. End of input counts as a stop.
pub async fn run_worker_io<R, W>(env: WorkerEnv, input: R, mut output: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(input).lines();

    let start = loop {
        let line = lines
            .next_line()
            .await
            .context("Failed to read the start message")?
            .context("Supervisor closed the channel before sending a task")?;
        if line.trim().is_empty() {
            continue;
        }
        match decode_line::<SupervisorMessage>(&line)? {
            SupervisorMessage::Start(start) => break start,
            other => anyhow::bail!("Expected a start message, got {:?}", other),
        }
    };
    let task_id = start.task_id;

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let control = tokio::spawn(async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match decode_line::<SupervisorMessage>(&line) {
                    Ok(message) => {
                        if control_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Task {}: unreadable control line: {:#}", task_id, e),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Task {}: control input failed: {}", task_id, e);
                    break;
                }
            }
        }
        debug!("Task {}: control input closed", task_id);
    });

    let (outbox, mut outgoing) = mpsc::unbounded_channel::<WorkerMessage>();
    let writer = tokio::spawn(async move {
        while let Some(message) = outgoing.recv().await {
            let line = encode_line(&message)?;
            output.write_all(line.as_bytes()).await?;
            output.flush().await?;
        }
        anyhow::Ok(())
    });

    serve(start, env, control_rx, outbox).await;

    let flushed = tokio::time::timeout(FLUSH_DEADLINE, writer).await;
    control.abort();
    match flushed {
        Ok(Ok(result)) => result.context("Failed to report to the supervisor"),
        Ok(Err(e)) => Err(e).context("Output writer crashed"),
        Err(_) => anyhow::bail!("Timed out flushing messages of task {}", task_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::testing::{scripted_env, start_message, task_config, Script, ScriptedAdapter};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    async fn read_messages(mut reader: impl AsyncRead + Unpin) -> Vec<WorkerMessage> {
        let mut raw = String::new();
        reader.read_to_string(&mut raw).await.unwrap();
        raw.lines().map(|line| decode_line(line).unwrap()).collect()
    }

    #[tokio::test]
    async fn test_runs_the_task_from_the_start_line() {
        let adapter = ScriptedAdapter::new(Script {
            items_per_page: 2,
            ..Default::default()
        });
        let (mut supervisor_in, worker_in) = duplex(64 * 1024);
        let (worker_out, supervisor_out) = duplex(64 * 1024);

        let start = encode_line(&SupervisorMessage::Start(start_message(5, task_config(&["rust"], 2)))).unwrap();
        supervisor_in.write_all(start.as_bytes()).await.unwrap();

        let worker = tokio::spawn(run_worker_io(scripted_env(adapter), worker_in, worker_out));
        tokio::time::timeout(Duration::from_secs(5), worker).await.unwrap().unwrap().unwrap();

        let messages = read_messages(supervisor_out).await;
        let kinds: Vec<_> = messages.iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, vec!["progress", "progress", "completed"]);
        drop(supervisor_in);
    }

    #[tokio::test]
    async fn test_closed_input_stops_the_run() {
        let adapter = ScriptedAdapter::new(Script {
            items_per_page: 1,
            page_delay: Duration::from_millis(20),
            ..Default::default()
        });
        let (mut supervisor_in, worker_in) = duplex(64 * 1024);
        let (worker_out, supervisor_out) = duplex(64 * 1024);

        let start = encode_line(&SupervisorMessage::Start(start_message(5, task_config(&["rust"], 50)))).unwrap();
        supervisor_in.write_all(start.as_bytes()).await.unwrap();
        let worker = tokio::spawn(run_worker_io(scripted_env(adapter), worker_in, worker_out));

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(supervisor_in);
        tokio::time::timeout(Duration::from_secs(5), worker).await.unwrap().unwrap().unwrap();

        let messages = read_messages(supervisor_out).await;
        assert!(messages.iter().all(|m| !m.is_terminal()));
    }

    #[tokio::test]
    async fn test_first_line_must_be_a_start() {
        let (mut supervisor_in, worker_in) = duplex(1024);
        let (worker_out, _supervisor_out) = duplex(1024);

        supervisor_in
            .write_all(encode_line(&SupervisorMessage::Pause).unwrap().as_bytes())
            .await
            .unwrap();
        let env = scripted_env(ScriptedAdapter::new(Script::default()));
        assert!(run_worker_io(env, worker_in, worker_out).await.is_err());
    }
}
