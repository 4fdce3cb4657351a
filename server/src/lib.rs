//! Switchboard server: multiplexes coding-agent sessions over a JSON-lines
//! stdio surface.
#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::io::Result as IoResult;
use std::sync::Arc;

use switchboard_core::AgentLauncher;
use switchboard_core::RuntimeConfig;
use switchboard_core::SessionManager;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::{self};
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;

mod agent_process;
mod message_processor;
mod poll;
mod session_ops;
mod wire;

pub use agent_process::AgentProcessLauncher;
pub use message_processor::dispatch_op;
pub use session_ops::ServerState;
pub use wire::*;

use crate::message_processor::MessageProcessor;

/// Size of the bounded channels between the reader, processor, and writer
/// tasks. 128 in-flight messages is plenty for a polling workload.
const CHANNEL_CAPACITY: usize = 128;

pub async fn run_main(launcher: Arc<dyn AgentLauncher>) -> IoResult<()> {
    // Install a simple subscriber so `tracing` output is visible on stderr.
    // Users control the log level with `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let manager = SessionManager::new(RuntimeConfig::from_env());
    let sweeper = manager.spawn_sweeper();
    let state = Arc::new(ServerState::new(manager.clone(), launcher));

    let (incoming_tx, mut incoming_rx) = mpsc::channel::<Request>(CHANNEL_CAPACITY);
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Response>(CHANNEL_CAPACITY);

    // Task: read requests from stdin.
    let stdin_reader_handle = tokio::spawn(async move {
        let stdin = io::stdin();
        let reader = BufReader::new(stdin);
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await.unwrap_or_default() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Request>(&line) {
                Ok(request) => {
                    if incoming_tx.send(request).await.is_err() {
                        // Receiver gone, nothing left to do.
                        break;
                    }
                }
                Err(err) => error!("failed to deserialize request: {err}"),
            }
        }

        debug!("stdin reader finished (EOF)");
    });

    // Task: dispatch requests. Each request runs in its own task so polls
    // stay responsive while a start is blocked on the init gate.
    let processor_handle = tokio::spawn({
        let processor = MessageProcessor::new(state, outgoing_tx.clone());
        async move {
            while let Some(request) = incoming_rx.recv().await {
                processor.process_request(request);
            }
            info!("processor task exited (channel closed)");
        }
    });
    drop(outgoing_tx);

    // Task: write responses to stdout.
    let stdout_writer_handle = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(response) = outgoing_rx.recv().await {
            match serde_json::to_string(&response) {
                Ok(json) => {
                    if let Err(err) = stdout.write_all(json.as_bytes()).await {
                        error!("failed to write to stdout: {err}");
                        break;
                    }
                    if let Err(err) = stdout.write_all(b"\n").await {
                        error!("failed to write newline to stdout: {err}");
                        break;
                    }
                    if let Err(err) = stdout.flush().await {
                        error!("failed to flush stdout: {err}");
                        break;
                    }
                }
                Err(err) => error!("failed to serialize response: {err}"),
            }
        }
        info!("stdout writer exited (channel closed)");
    });

    // Run until stdin EOF propagates shutdown through the channel chain, or
    // until ctrl-c. Either way the sessions are cancelled and their pending
    // permissions denied before we exit; records stay for in-flight readers.
    tokio::select! {
        _ = async {
            let _ = tokio::join!(stdin_reader_handle, processor_handle, stdout_writer_handle);
        } => {}
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received");
        }
    }

    manager.shutdown();
    sweeper.abort();
    Ok(())
}
