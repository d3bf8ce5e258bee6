//! Dedicated runtime for the transport engine
//!
//! ICE, DTLS and SCTP timers run on their own thread pool, separate from the
//! control channel runtime.

use crate::{Error, Result};
use std::thread;
use std::time::Duration;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Owner of the transport engine thread pool
pub struct EngineRuntime {
    handle: Handle,
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EngineRuntime {
    /// Spawn the engine thread and its multi-threaded runtime
    pub fn start(worker_threads: usize) -> Result<Self> {
        if worker_threads == 0 {
            return Err(Error::InvalidConfig(
                "engine runtime needs at least one worker thread".to_string(),
            ));
        }

        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name("rtc-engine".to_string())
            .spawn(move || {
                let runtime = match Builder::new_multi_thread()
                    .worker_threads(worker_threads)
                    .thread_name("rtc-engine-worker")
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };

                let _ = handle_tx.send(Ok(runtime.handle().clone()));

                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                runtime.shutdown_timeout(Duration::from_secs(2));
                debug!("Transport engine runtime stopped");
            })?;

        let handle = handle_rx
            .recv()
            .map_err(|_| Error::Other(anyhow::anyhow!("engine thread exited during startup")))??;

        info!(
            "Transport engine runtime started with {} worker threads",
            worker_threads
        );

        Ok(Self {
            handle,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Handle used to spawn engine tasks
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Stop the runtime and wait for its thread to exit
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for EngineRuntime {
    fn drop(&mut self) {
        // Signal only; `shutdown` is the joining path.
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_runs_tasks() {
        let runtime = EngineRuntime::start(1).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();

        runtime.handle().spawn(async move {
            let name = thread::current().name().map(str::to_string);
            let _ = tx.send(name);
        });

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("rtc-engine-worker"));
        runtime.shutdown();
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(EngineRuntime::start(0).is_err());
    }
}
