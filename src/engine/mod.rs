mod directory;
mod error;
mod ledger;
mod lifecycle;
mod planner;
mod pool;
mod queries;
mod state;
mod undo;
#[cfg(test)]
mod tests;

pub use directory::VehicleDirectory;
pub use error::{EngineError, EntityRef};
pub use ledger::Ledger;
pub use planner::{plan_placement, Placement};
pub use pool::SlotPool;
pub use state::State;

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, RwLock, RwLockReadGuard};
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(cmd) = deferred {
                    handle_non_append(&mut wal, cmd);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// One facility's allocation engine.
///
/// All mutations run under the single state write lock for the whole
/// plan → log → apply → notify sequence, so the ledger order, the WAL order
/// and the order mutations are observed are the same. Queries take the read lock.
///
/// If an event that is already durable fails to apply, the engine halts:
/// later mutations and compactions fail with `Halted`, queries keep working.
pub struct Engine {
    state: RwLock<State>,
    halted: OnceLock<String>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(wal_path: PathBuf, config: EngineConfig, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_clock(wal_path, config, notify, Arc::new(SystemClock))
    }

    /// Replay the WAL at `wal_path` and start the writer task. When the log
    /// holds no pool yet, one is laid out from `config` and logged first.
    pub fn with_clock(
        wal_path: PathBuf,
        config: EngineConfig,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_bytes > 0 {
            warn!(
                "{}: discarded {} bytes of truncated or corrupt WAL tail",
                wal_path.display(),
                replay.discarded_bytes
            );
            // New records must follow the last intact one, not the garbage.
            Wal::truncate_to(&wal_path, replay.valid_bytes)?;
        }

        let mut state: Option<State> = None;
        for event in &replay.events {
            if let Some(current) = state.as_mut() {
                current.apply(event).map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("{}: cannot replay {event:?}: {e}", wal_path.display()),
                    )
                })?;
                continue;
            }
            match event {
                Event::PoolInitialized { layout, .. } => state = Some(State::new(layout.clone())),
                Event::Snapshot(snapshot) => state = Some((**snapshot).clone()),
                other => warn!("replay: skipping {other:?} recorded before the pool existed"),
            }
        }

        let mut wal = Wal::open(&wal_path)?;
        let state = match state {
            Some(state) => {
                if *state.pool.layout() != config.layout() {
                    warn!(
                        "{}: pool layout in WAL differs from configuration; keeping the recorded pool",
                        wal_path.display()
                    );
                }
                state
            }
            None => {
                let layout = config.layout();
                let event = Event::PoolInitialized {
                    layout: layout.clone(),
                    at: clock.now_ms(),
                };
                wal.append_buffered(&event)?;
                wal.flush_sync()?;
                info!("initialized pool of {} slots", layout.capacity());
                State::new(layout)
            }
        };

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            state: RwLock::new(state),
            halted: OnceLock::new(),
            wal_tx,
            notify,
            clock,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Plan against the locked state, then WAL-append + apply + notify.
    /// Nothing is logged or changed unless `plan` succeeds. Returns the
    /// state downgraded to a read guard so callers can read their result
    /// without another mutation slipping in.
    pub(super) async fn commit<F>(
        &self,
        op: &'static str,
        plan: F,
    ) -> Result<RwLockReadGuard<'_, State>, EngineError>
    where
        F: FnOnce(&State, Ms) -> Result<Event, EngineError>,
    {
        let started = Instant::now();
        let mut guard = self.state.write().await;
        self.check_running()?;
        let now = self.clock.now_ms();

        let result = match plan(&*guard, now) {
            Ok(event) => self.persist_and_apply(&mut *guard, &event).await,
            Err(e) => Err(e),
        };
        crate::observability::record_operation(op, result.is_ok(), started);
        result?;

        Ok(guard.downgrade())
    }

    fn check_running(&self) -> Result<(), EngineError> {
        match self.halted.get() {
            Some(reason) => Err(EngineError::Halted(reason.clone())),
            None => Ok(()),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.get().is_some()
    }

    async fn persist_and_apply(&self, state: &mut State, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        match state.apply(event) {
            Ok(zones) => {
                for zone in &zones {
                    self.notify.send(zone, event);
                }
                Ok(())
            }
            Err(e) => {
                let reason = format!("logged event could not be applied: {e}");
                error!("{reason}; refusing further mutations");
                let _ = self.halted.set(reason.clone());
                Err(EngineError::Halted(reason))
            }
        }
    }

    /// Compact the WAL down to a single snapshot of the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Held across the swap so no append lands in the old file after the snapshot.
        let guard = self.state.write().await;
        // A halted engine's memory may have diverged from its log.
        self.check_running()?;
        let events = vec![Event::Snapshot(Box::new(guard.clone()))];

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guard);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
