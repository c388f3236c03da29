// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! LSP Supervisor — owns a set of long-lived language-server subprocess
//! clients: spawn, initialize with a deadline, await readiness, run a
//! workspace watcher, restart on watcher failure, shut down cleanly.
//!
//! The wire protocol itself (LSP JSON-RPC framing, `initialize` payload
//! shape, diagnostic publish notifications) is out of scope — this module
//! consumes it through the [`LspTransport`] trait, the same way `sven_model`
//! consumes a concrete LLM SDK through `ModelProvider`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

const INITIALIZE_DEADLINE: Duration = Duration::from_secs(30);
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LspClientState {
    Starting,
    Ready,
    Error,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub message: String,
    pub severity: String,
}

/// One language-server subprocess's protocol surface, implemented by the
/// concrete LSP client library the binary links against.
#[async_trait]
pub trait LspTransport: Send + Sync {
    async fn spawn(&self, command: &str, args: &[String]) -> anyhow::Result<()>;
    async fn initialize(&self, working_dir: &Path) -> anyhow::Result<()>;
    async fn wait_ready(&self) -> anyhow::Result<()>;
    async fn diagnostics(&self) -> HashMap<PathBuf, Vec<Diagnostic>>;
    async fn shutdown(&self) -> anyhow::Result<()>;
    async fn close(&self);
}

/// Configuration for one managed LSP client, and the long-running watcher
/// the supervisor runs once the client is ready. `watch_fn` is awaited with
/// a cancellation receiver; it should return once cancelled or when the
/// watched process needs a restart.
pub struct LspClientConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub transport: Arc<dyn LspTransport>,
    pub watch_fn: Arc<dyn Fn(watch::Receiver<bool>) -> BoxFuture<'static, WatcherOutcome> + Send + Sync>,
}

/// Why a workspace watcher task returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherOutcome {
    /// Cancelled cooperatively — no restart needed.
    Cancelled,
    /// Exited abnormally (or panicked and was caught) — triggers a restart.
    Abnormal,
}

struct ManagedClient {
    name: String,
    command: String,
    args: Vec<String>,
    working_dir: PathBuf,
    state: Arc<RwLock<LspClientState>>,
    transport: Arc<dyn LspTransport>,
    watch_fn: Arc<dyn Fn(watch::Receiver<bool>) -> BoxFuture<'static, WatcherOutcome> + Send + Sync>,
    cancel_tx: watch::Sender<bool>,
    watcher: Option<JoinHandle<()>>,
}

/// A read-only snapshot of one client's status, safe to hand to callers
/// outside the supervisor.
#[derive(Debug, Clone)]
pub struct LspClientInfo {
    pub name: String,
    pub state: LspClientState,
}

pub struct LspSupervisor {
    clients: RwLock<HashMap<String, ManagedClient>>,
}

impl LspSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { clients: RwLock::new(HashMap::new()) })
    }

    /// Spawn and bring up one client. Returns once the client reaches
    /// `Ready` or `Error` — the workspace watcher keeps running afterward
    /// in the background.
    pub async fn start_client(self: &Arc<Self>, config: LspClientConfig) -> anyhow::Result<()> {
        let client = self
            .bring_up(
                config.name,
                config.command,
                config.args,
                config.working_dir,
                config.transport,
                config.watch_fn,
            )
            .await?;
        self.clients.write().await.insert(client.name.clone(), client);
        Ok(())
    }

    /// Spawn + initialize + probe readiness + start the watcher task for one
    /// client, without touching the registry. Shared by `start_client` and
    /// `restart_client` so a restart re-runs exactly the same bring-up
    /// sequence from the original configuration.
    async fn bring_up(
        self: &Arc<Self>,
        name: String,
        command: String,
        args: Vec<String>,
        working_dir: PathBuf,
        transport: Arc<dyn LspTransport>,
        watch_fn: Arc<dyn Fn(watch::Receiver<bool>) -> BoxFuture<'static, WatcherOutcome> + Send + Sync>,
    ) -> anyhow::Result<ManagedClient> {
        let state = Arc::new(RwLock::new(LspClientState::Starting));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        transport.spawn(&command, &args).await?;

        match tokio::time::timeout(INITIALIZE_DEADLINE, transport.initialize(&working_dir)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => {
                *state.write().await = LspClientState::Error;
                return Ok(ManagedClient {
                    name,
                    command,
                    args,
                    working_dir,
                    state,
                    transport,
                    watch_fn,
                    cancel_tx,
                    watcher: None,
                });
            }
        }

        if transport.wait_ready().await.is_ok() {
            *state.write().await = LspClientState::Ready;
        } else {
            *state.write().await = LspClientState::Error;
        }

        let supervisor = self.clone();
        let watcher_name = name.clone();
        let watcher_watch_fn = watch_fn.clone();
        let watcher = tokio::spawn(async move {
            let outcome = watcher_watch_fn(cancel_rx).await;
            if outcome == WatcherOutcome::Abnormal {
                supervisor.restart_client(&watcher_name).await;
            }
        });

        Ok(ManagedClient {
            name,
            command,
            args,
            working_dir,
            state,
            transport,
            watch_fn,
            cancel_tx,
            watcher: Some(watcher),
        })
    }

    /// Restart a client whose watcher exited abnormally. Removes the client
    /// from the registry (releasing the write lock) before performing the
    /// graceful shutdown, then re-spawns from the same configuration (spec
    /// §4.5), never holding the registry lock during the subprocess calls.
    async fn restart_client(self: &Arc<Self>, name: &str) {
        let removed = self.clients.write().await.remove(name);
        let Some(old) = removed else { return };

        let _ = tokio::time::timeout(SHUTDOWN_DEADLINE, old.transport.shutdown()).await;
        old.transport.close().await;

        tracing::warn!(client = %name, "lsp client watcher exited abnormally, restarting");

        match self
            .bring_up(
                old.name,
                old.command,
                old.args,
                old.working_dir,
                old.transport,
                old.watch_fn,
            )
            .await
        {
            Ok(client) => {
                self.clients.write().await.insert(client.name.clone(), client);
            }
            Err(e) => {
                tracing::warn!(client = %name, error = %e, "lsp client restart failed");
            }
        }
    }

    pub async fn client_state(&self, name: &str) -> Option<LspClientState> {
        let guard = self.clients.read().await;
        if let Some(c) = guard.get(name) {
            Some(*c.state.read().await)
        } else {
            None
        }
    }

    pub async fn diagnostics(&self, name: &str) -> Option<HashMap<PathBuf, Vec<Diagnostic>>> {
        let guard = self.clients.read().await;
        let c = guard.get(name)?;
        Some(c.transport.diagnostics().await)
    }

    pub async fn list_clients(&self) -> Vec<LspClientInfo> {
        let guard = self.clients.read().await;
        let mut out = Vec::with_capacity(guard.len());
        for c in guard.values() {
            out.push(LspClientInfo { name: c.name.clone(), state: *c.state.read().await });
        }
        out
    }

    /// Shut down every managed client: cancel watchers, await them, then
    /// call `Shutdown` on every client in parallel with its own 5 s
    /// deadline.
    pub async fn shutdown_all(&self) {
        let mut guard = self.clients.write().await;
        let clients: Vec<ManagedClient> = guard.drain().map(|(_, c)| c).collect();
        drop(guard);

        for c in &clients {
            let _ = c.cancel_tx.send(true);
        }
        let mut handles = Vec::new();
        for mut c in clients {
            if let Some(w) = c.watcher.take() {
                handles.push(w);
            }
            tokio::spawn(async move {
                let _ = tokio::time::timeout(SHUTDOWN_DEADLINE, c.transport.shutdown()).await;
                c.transport.close().await;
                *c.state.write().await = LspClientState::Stopped;
            });
        }
        for h in handles {
            let _ = h.await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use futures::FutureExt;

    struct FakeTransport {
        ready: bool,
        init_delay: Option<Duration>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl LspTransport for FakeTransport {
        async fn spawn(&self, _command: &str, _args: &[String]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn initialize(&self, _working_dir: &Path) -> anyhow::Result<()> {
            if let Some(d) = self.init_delay {
                tokio::time::sleep(d).await;
            }
            Ok(())
        }
        async fn wait_ready(&self) -> anyhow::Result<()> {
            if self.ready {
                Ok(())
            } else {
                anyhow::bail!("not ready")
            }
        }
        async fn diagnostics(&self) -> HashMap<PathBuf, Vec<Diagnostic>> {
            HashMap::new()
        }
        async fn shutdown(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn never_ending_watcher() -> Arc<dyn Fn(watch::Receiver<bool>) -> BoxFuture<'static, WatcherOutcome> + Send + Sync> {
        Arc::new(|mut rx: watch::Receiver<bool>| {
            async move {
                loop {
                    if rx.changed().await.is_err() || *rx.borrow() {
                        return WatcherOutcome::Cancelled;
                    }
                }
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn start_client_reaches_ready_state() {
        let supervisor = LspSupervisor::new();
        let closed = Arc::new(AtomicBool::new(false));
        supervisor
            .start_client(LspClientConfig {
                name: "rust-analyzer".into(),
                command: "rust-analyzer".into(),
                args: vec![],
                working_dir: PathBuf::from("/tmp"),
                transport: Arc::new(FakeTransport { ready: true, init_delay: None, closed: closed.clone() }),
                watch_fn: never_ending_watcher(),
            })
            .await
            .unwrap();
        assert_eq!(supervisor.client_state("rust-analyzer").await, Some(LspClientState::Ready));
    }

    #[tokio::test]
    async fn start_client_sets_error_when_readiness_probe_fails() {
        let supervisor = LspSupervisor::new();
        let closed = Arc::new(AtomicBool::new(false));
        supervisor
            .start_client(LspClientConfig {
                name: "bad".into(),
                command: "bad".into(),
                args: vec![],
                working_dir: PathBuf::from("/tmp"),
                transport: Arc::new(FakeTransport { ready: false, init_delay: None, closed }),
                watch_fn: never_ending_watcher(),
            })
            .await
            .unwrap();
        assert_eq!(supervisor.client_state("bad").await, Some(LspClientState::Error));
    }

    #[tokio::test]
    async fn list_clients_reflects_registered_state() {
        let supervisor = LspSupervisor::new();
        let closed = Arc::new(AtomicBool::new(false));
        supervisor
            .start_client(LspClientConfig {
                name: "a".into(),
                command: "a".into(),
                args: vec![],
                working_dir: PathBuf::from("/tmp"),
                transport: Arc::new(FakeTransport { ready: true, init_delay: None, closed }),
                watch_fn: never_ending_watcher(),
            })
            .await
            .unwrap();
        let list = supervisor.list_clients().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "a");
    }

    #[tokio::test]
    async fn shutdown_all_marks_clients_stopped_and_closes_transport() {
        let supervisor = LspSupervisor::new();
        let closed = Arc::new(AtomicBool::new(false));
        supervisor
            .start_client(LspClientConfig {
                name: "a".into(),
                command: "a".into(),
                args: vec![],
                working_dir: PathBuf::from("/tmp"),
                transport: Arc::new(FakeTransport { ready: true, init_delay: None, closed: closed.clone() }),
                watch_fn: never_ending_watcher(),
            })
            .await
            .unwrap();
        supervisor.shutdown_all().await;
        assert!(supervisor.list_clients().await.is_empty());
        // give the detached shutdown task a moment to run
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn diagnostics_returns_none_for_unknown_client() {
        let supervisor = LspSupervisor::new();
        assert!(supervisor.diagnostics("nope").await.is_none());
    }

    #[tokio::test]
    async fn abnormal_watcher_exit_triggers_restart_path() {
        // A watcher that is abnormal exactly once, then behaves like
        // `never_ending_watcher` so the restart loop settles.
        let supervisor = LspSupervisor::new();
        let closed = Arc::new(AtomicBool::new(false));
        let restarts = Arc::new(AtomicUsize::new(0));
        let restarts_clone = restarts.clone();
        let watch_fn: Arc<dyn Fn(watch::Receiver<bool>) -> BoxFuture<'static, WatcherOutcome> + Send + Sync> =
            Arc::new(move |mut rx: watch::Receiver<bool>| {
                let restarts = restarts_clone.clone();
                async move {
                    let first = restarts.fetch_add(1, Ordering::SeqCst) == 0;
                    if first {
                        return WatcherOutcome::Abnormal;
                    }
                    loop {
                        if rx.changed().await.is_err() || *rx.borrow() {
                            return WatcherOutcome::Cancelled;
                        }
                    }
                }
                .boxed()
            });
        supervisor
            .start_client(LspClientConfig {
                name: "flaky".into(),
                command: "flaky".into(),
                args: vec![],
                working_dir: PathBuf::from("/tmp"),
                transport: Arc::new(FakeTransport { ready: true, init_delay: None, closed: closed.clone() }),
                watch_fn,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(restarts.load(Ordering::SeqCst), 2);
        // The client was re-spawned from the same configuration after restart.
        assert_eq!(supervisor.client_state("flaky").await, Some(LspClientState::Ready));
    }
}
