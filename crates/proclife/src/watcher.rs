//! Single-target watcher for a process this crate did not spawn.
//!
//! The public [`PidWatcher`] is a thin handle. All state changes happen inside an
//! actor task that owns the two polling loops of the current watch, so a start, a
//! switch and a stop can never interleave.

use crate::process_table::SysinfoProcessTable;
use proclife_core::{ProcessTable, Result, WatcherConfig};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback invoked by the watch loops
pub type WatchCallback = Arc<dyn Fn(&WatchEvent) -> anyhow::Result<()> + Send + Sync>;

/// What a callback is told about the watched process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub name: String,
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Watching,
}

/// The process currently being watched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub name: String,
    pub pid: u32,
    pub monitor_interval: Duration,
}

/// Control messages handled by the watcher actor
#[derive(Debug)]
enum WatchCommand {
    Start {
        name: String,
        response: oneshot::Sender<bool>,
    },
    Switch {
        name: String,
        response: oneshot::Sender<bool>,
    },
    Stop {
        response: oneshot::Sender<()>,
    },
}

#[derive(Clone, Default)]
struct Callbacks {
    exit: Option<WatchCallback>,
    monitor: Option<WatchCallback>,
}

#[derive(Default)]
struct Shared {
    callbacks: Mutex<Callbacks>,
    target: Mutex<Option<WatchTarget>>,
    task_count: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Watches one named process: a periodic callback while it lives, a one-shot
/// callback once it is gone
///
/// Must be created inside a tokio runtime. Dropping the watcher stops the watch.
pub struct PidWatcher {
    commands: mpsc::UnboundedSender<WatchCommand>,
    state: watch::Receiver<WatchState>,
    shared: Arc<Shared>,
}

impl PidWatcher {
    pub fn new(table: Arc<dyn ProcessTable>, config: WatcherConfig) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared::default());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(WatchState::Idle);

        let actor = WatchActor {
            table,
            config,
            shared: shared.clone(),
            state: state_tx,
            exit_tx,
            active: None,
            generation: 0,
        };
        tokio::spawn(actor.run(command_rx, exit_rx));

        Ok(Self {
            commands,
            state,
            shared,
        })
    }

    /// Watcher over the host process table
    pub fn with_system_table(config: WatcherConfig) -> Result<Self> {
        Self::new(Arc::new(SysinfoProcessTable::new()), config)
    }

    /// Install the callback fired once when the watched process exits
    ///
    /// Takes effect at the next `start` or `switch`.
    pub fn set_exit_callback<F>(&self, callback: F)
    where
        F: Fn(&WatchEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        lock(&self.shared.callbacks).exit = Some(Arc::new(callback));
    }

    /// Install the callback fired every monitor interval while the process lives
    ///
    /// Takes effect at the next `start` or `switch`.
    pub fn set_monitor_callback<F>(&self, callback: F)
    where
        F: Fn(&WatchEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        lock(&self.shared.callbacks).monitor = Some(Arc::new(callback));
    }

    /// Resolve `name` and start watching it
    ///
    /// Returns false if no such process exists or a watch is already active.
    pub async fn start(&self, name: &str) -> bool {
        self.request(|response| WatchCommand::Start {
            name: name.to_string(),
            response,
        })
        .await
        .unwrap_or(false)
    }

    /// Stop the current watch without firing its exit callback, then watch `name`
    ///
    /// Returns false and leaves the watcher idle if `name` cannot be resolved.
    pub async fn switch(&self, name: &str) -> bool {
        self.request(|response| WatchCommand::Switch {
            name: name.to_string(),
            response,
        })
        .await
        .unwrap_or(false)
    }

    /// Cancel and join both loops; no callback fires once this returns
    pub async fn stop(&self) {
        let _ = self
            .request(|response| WatchCommand::Stop { response })
            .await;
    }

    pub fn state(&self) -> WatchState {
        *self.state.borrow()
    }

    pub fn target(&self) -> Option<WatchTarget> {
        lock(&self.shared.target).clone()
    }

    /// Number of loop tasks belonging to the current watch
    pub fn watch_task_count(&self) -> usize {
        self.shared.task_count.load(Ordering::SeqCst)
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WatchState> {
        self.state.clone()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> WatchCommand,
    ) -> Option<T> {
        let (response, reply) = oneshot::channel();
        if self.commands.send(command(response)).is_err() {
            warn!("Watcher actor is gone");
            return None;
        }
        reply.await.ok()
    }
}

struct ActiveWatch {
    generation: u64,
    cancel: CancellationToken,
    monitor: JoinHandle<()>,
    exit: JoinHandle<()>,
}

struct WatchActor {
    table: Arc<dyn ProcessTable>,
    config: WatcherConfig,
    shared: Arc<Shared>,
    state: watch::Sender<WatchState>,
    exit_tx: mpsc::UnboundedSender<u64>,
    active: Option<ActiveWatch>,
    generation: u64,
}

impl WatchActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<WatchCommand>,
        mut exits: mpsc::UnboundedReceiver<u64>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("Watcher handle dropped, shutting down");
                        break;
                    }
                },
                Some(generation) = exits.recv() => self.handle_exit(generation).await,
            }
        }

        self.teardown().await;
    }

    async fn handle_command(&mut self, command: WatchCommand) {
        match command {
            WatchCommand::Start { name, response } => {
                let started = if self.active.is_some() {
                    warn!(name = %name, "Watcher already active, use switch to retarget");
                    false
                } else {
                    self.begin(name).await
                };
                let _ = response.send(started);
            }
            WatchCommand::Switch { name, response } => {
                let previous = lock(&self.shared.target).as_ref().map(|t| t.name.clone());
                if let Some(previous) = previous {
                    info!(from = %previous, to = %name, "Switching watch target");
                }
                self.teardown().await;
                let _ = response.send(self.begin(name).await);
            }
            WatchCommand::Stop { response } => {
                self.teardown().await;
                let _ = response.send(());
            }
        }
    }

    async fn handle_exit(&mut self, generation: u64) {
        let current = self.active.as_ref().map(|active| active.generation);
        if current == Some(generation) {
            self.teardown().await;
        } else {
            debug!(generation = generation, "Ignoring exit from a previous watch");
        }
    }

    async fn begin(&mut self, name: String) -> bool {
        let table = self.table.clone();
        let lookup = name.clone();
        let pid = match tokio::task::spawn_blocking(move || table.resolve(&lookup)).await {
            Ok(Some(pid)) => pid,
            Ok(None) => {
                info!(name = %name, "No process to watch");
                return false;
            }
            Err(e) => {
                warn!(name = %name, error = %e, "Process lookup failed");
                return false;
            }
        };

        let callbacks = lock(&self.shared.callbacks).clone();
        let event = WatchEvent {
            name: name.clone(),
            pid,
        };
        self.generation += 1;
        let generation = self.generation;
        let cancel = CancellationToken::new();

        let monitor = tokio::spawn(monitor_loop(
            self.table.clone(),
            event.clone(),
            self.config.monitor_interval(),
            callbacks.monitor,
            cancel.clone(),
        ));
        let exit = tokio::spawn(exit_loop(
            self.table.clone(),
            event,
            self.config.exit_poll_interval(),
            callbacks.exit,
            cancel.clone(),
            generation,
            self.exit_tx.clone(),
        ));

        self.active = Some(ActiveWatch {
            generation,
            cancel,
            monitor,
            exit,
        });
        *lock(&self.shared.target) = Some(WatchTarget {
            name: name.clone(),
            pid,
            monitor_interval: self.config.monitor_interval(),
        });
        self.shared.task_count.store(2, Ordering::SeqCst);
        self.state.send_replace(WatchState::Watching);

        info!(name = %name, pid = pid, "Watching process");
        true
    }

    async fn teardown(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        active.cancel.cancel();
        for handle in [active.monitor, active.exit] {
            if let Err(e) = handle.await {
                warn!(error = %e, "Watch loop ended abnormally");
            }
        }

        if let Some(target) = lock(&self.shared.target).take() {
            debug!(name = %target.name, pid = target.pid, "Watch stopped");
        }
        self.shared.task_count.store(0, Ordering::SeqCst);
        self.state.send_replace(WatchState::Idle);
    }
}

async fn is_alive(table: &Arc<dyn ProcessTable>, pid: u32) -> Option<bool> {
    let table = table.clone();
    match tokio::task::spawn_blocking(move || table.is_alive(pid)).await {
        Ok(alive) => Some(alive),
        Err(e) => {
            warn!(pid = pid, error = %e, "Process table query failed");
            None
        }
    }
}

/// Run a callback, keeping its failure or panic away from the loop
fn invoke(kind: &'static str, callback: &WatchCallback, event: &WatchEvent) {
    match catch_unwind(AssertUnwindSafe(|| callback(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(callback = kind, name = %event.name, pid = event.pid, error = %e, "Watch callback failed");
        }
        Err(_) => {
            warn!(callback = kind, name = %event.name, pid = event.pid, "Watch callback panicked");
        }
    }
}

async fn monitor_loop(
    table: Arc<dyn ProcessTable>,
    event: WatchEvent,
    period: Duration,
    callback: Option<WatchCallback>,
    cancel: CancellationToken,
) {
    let mut ticks = interval_at(tokio::time::Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticks.tick() => {}
        }

        match is_alive(&table, event.pid).await {
            Some(true) => {
                if cancel.is_cancelled() {
                    return;
                }
                if let Some(callback) = &callback {
                    invoke("monitor", callback, &event);
                }
            }
            // Exit detection belongs to the other loop
            Some(false) => return,
            None => {}
        }
    }
}

async fn exit_loop(
    table: Arc<dyn ProcessTable>,
    event: WatchEvent,
    period: Duration,
    callback: Option<WatchCallback>,
    cancel: CancellationToken,
    generation: u64,
    exits: mpsc::UnboundedSender<u64>,
) {
    loop {
        if is_alive(&table, event.pid).await == Some(false) {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(period) => {}
        }
    }

    if cancel.is_cancelled() {
        return;
    }
    cancel.cancel();
    info!(name = %event.name, pid = event.pid, "Watched process exited");

    if let Some(callback) = &callback {
        invoke("exit", callback, &event);
    }
    let _ = exits.send(generation);
}
