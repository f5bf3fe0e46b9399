//! The engine task and the handle the orchestrator drives it through.

use std::sync::{Arc, Mutex};

use otafetch_protocol::{OrchestratorView, TransferState, block_count};
use otafetch_transport::{Connection, Connector, Credentials, Target};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::EngineConfig;
use crate::delivery::{BlockPool, DeliverySink, EngineStats, TransferStats};
use crate::error::{EngineError, ScheduleError, StartError};
use crate::events::{EngineEvent, NetEvent};
use crate::probe::probe_size;
use crate::scheduler::Dispatch;
use crate::session::{DownloadSession, SessionSnapshot};

pub(crate) type BodyOf<C> = <<C as Connector>::Connection as Connection>::Body;

/// At most two events per request are ever queued at once.
const NET_EVENT_CAPACITY: usize = 4;
const COMMAND_CAPACITY: usize = 16;

type CancelSlot = Mutex<Option<CancellationToken>>;

/// Cancels the outstanding request, if any.
pub(crate) fn cancel_in_flight(slot: &CancelSlot) {
    if let Ok(mut guard) = slot.lock()
        && let Some(token) = guard.take()
    {
        token.cancel();
    }
}

/// Stores the token of a newly dispatched request.
pub(crate) fn install_token(slot: &CancelSlot, token: CancellationToken) {
    if let Ok(mut guard) = slot.lock()
        && let Some(old) = guard.replace(token)
    {
        old.cancel();
    }
}

/// Forgets the token of a request that ran to completion.
pub(crate) fn clear_token(slot: &CancelSlot) {
    if let Ok(mut guard) = slot.lock() {
        guard.take();
    }
}

enum Command {
    Start {
        view: OrchestratorView,
        credentials: Credentials,
        reply: oneshot::Sender<Result<u64, StartError>>,
    },
    RequestNext {
        reply: oneshot::Sender<Result<Dispatch, ScheduleError>>,
    },
    SetNext {
        index: u32,
        reply: oneshot::Sender<Result<(), ScheduleError>>,
    },
    Abort {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// State owned by the engine task.
pub(crate) struct Engine<C: Connector> {
    pub(crate) connector: C,
    pub(crate) config: EngineConfig,
    pub(crate) session: DownloadSession<C::Connection>,
    pub(crate) sink: DeliverySink,
    pub(crate) events: mpsc::Sender<EngineEvent>,
    pub(crate) stats: Arc<EngineStats>,
    pub(crate) net_tx: mpsc::Sender<NetEvent<BodyOf<C>>>,
    pub(crate) inflight_cancel: Arc<CancelSlot>,
    /// Last request id handed out. Never reset, so ids stay unique across
    /// restarts.
    pub(crate) next_request: u64,
}

impl<C: Connector> Engine<C> {
    pub(crate) fn new(
        connector: C,
        config: EngineConfig,
        pool: BlockPool,
        events: mpsc::Sender<EngineEvent>,
        stats: Arc<EngineStats>,
        inflight_cancel: Arc<CancelSlot>,
    ) -> (Self, mpsc::Receiver<NetEvent<BodyOf<C>>>) {
        let (net_tx, net_rx) = mpsc::channel(NET_EVENT_CAPACITY);
        let sink = DeliverySink::new(pool, events.clone(), Arc::clone(&stats));
        let engine = Self {
            connector,
            config,
            session: DownloadSession::default(),
            sink,
            events,
            stats,
            net_tx,
            inflight_cancel,
            next_request: 0,
        };
        (engine, net_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut net_rx: mpsc::Receiver<NetEvent<BodyOf<C>>>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(event) = net_rx.recv() => self.on_net_event(event).await,
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
            }
        }
        self.reset();
        debug!("engine task stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Start {
                view,
                credentials,
                reply,
            } => {
                let result = self.start_transfer(view, credentials).await;
                let _ = reply.send(result);
            }
            Command::RequestNext { reply } => {
                let _ = reply.send(self.request_next_block());
            }
            Command::SetNext { index, reply } => {
                let _ = reply.send(self.set_next_block(index));
            }
            Command::Abort { reply } => {
                info!(block = self.session.current_block, "transfer aborted");
                self.reset();
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.session.snapshot());
            }
        }
    }

    /// Resets the session, connects, probes, and positions the scheduler.
    pub(crate) async fn start_transfer(
        &mut self,
        view: OrchestratorView,
        credentials: Credentials,
    ) -> Result<u64, StartError> {
        self.reset();
        let result = self.try_start(view, credentials).await;
        if let Err(e) = &result {
            error!(error = %e, "transfer start failed");
            self.session.state = TransferState::Fatal;
        }
        result
    }

    async fn try_start(
        &mut self,
        view: OrchestratorView,
        credentials: Credentials,
    ) -> Result<u64, StartError> {
        let (num_blocks, first_block) = plan(&view, self.config.block_size)?;
        let target = Target::resolve(&view.source_locator)?;
        let connection = self.connector.connect(&target, &credentials).await?;

        let remote = probe_size(&connection, self.config.probe_timeout).await?;
        if remote != view.total_file_size {
            return Err(StartError::SizeMismatch {
                remote,
                expected: view.total_file_size,
            });
        }

        info!(
            host = target.host(),
            total = remote,
            num_blocks,
            first_block,
            "transfer started"
        );
        self.session = DownloadSession::begin(
            connection,
            target,
            remote,
            num_blocks,
            self.config.block_size,
            first_block,
        );
        Ok(remote)
    }

    /// Cancels any outstanding request and drops the session entirely.
    pub(crate) fn reset(&mut self) {
        cancel_in_flight(&self.inflight_cancel);
        self.session = DownloadSession::default();
    }

    /// The outstanding request's token, unless it was cancelled.
    pub(crate) fn active_token(&self) -> Option<CancellationToken> {
        let guard = self.inflight_cancel.lock().ok()?;
        guard.as_ref().filter(|token| !token.is_cancelled()).cloned()
    }

    /// Sends a control event. Block deliveries leave headroom for these, so
    /// the channel is only full if the orchestrator ignored an earlier one.
    pub(crate) fn emit_control(&self, event: EngineEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "event channel full, control event lost");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("orchestrator stopped listening");
            }
        }
    }
}

/// Number of blocks and the index to start from.
fn plan(view: &OrchestratorView, block_size: u32) -> Result<(u32, u32), StartError> {
    if view.total_file_size == 0 {
        return Err(StartError::InvalidView("total file size is zero".into()));
    }
    let num_blocks = u32::try_from(block_count(view.total_file_size, block_size))
        .map_err(|_| {
            StartError::InvalidView(format!(
                "{} bytes need more than {} blocks",
                view.total_file_size,
                u32::MAX
            ))
        })?;
    if view.remaining_blocks == 0 || view.remaining_blocks > num_blocks {
        return Err(StartError::InvalidView(format!(
            "{} blocks remaining of {num_blocks}",
            view.remaining_blocks
        )));
    }
    Ok((num_blocks, num_blocks - view.remaining_blocks))
}

/// Handle to a running engine. Cheap to clone.
///
/// The engine task stops once every handle is dropped.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    inflight_cancel: Arc<CancelSlot>,
    stats: Arc<EngineStats>,
}

impl EngineHandle {
    /// Validates `config`, spawns the engine task, and returns the handle
    /// together with the orchestrator's event receiver.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<C: Connector>(
        connector: C,
        config: EngineConfig,
        pool: BlockPool,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>), EngineError> {
        config.validate(&pool)?;

        let (events_tx, events_rx) = mpsc::channel(config.event_capacity);
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let stats = Arc::new(EngineStats::default());
        let inflight_cancel = Arc::new(Mutex::new(None));

        let (engine, net_rx) = Engine::new(
            connector,
            config,
            pool,
            events_tx,
            Arc::clone(&stats),
            Arc::clone(&inflight_cancel),
        );
        tokio::spawn(engine.run(command_rx, net_rx));

        let handle = Self {
            commands,
            inflight_cancel,
            stats,
        };
        Ok((handle, events_rx))
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(command(reply)).await.ok()?;
        rx.await.ok()
    }

    /// Connects to the source, probes its size against the view, and
    /// positions the scheduler at `num_blocks - remaining_blocks`.
    ///
    /// Any previous session is reset first. Returns the probed size.
    pub async fn start_transfer(
        &self,
        view: OrchestratorView,
        credentials: Credentials,
    ) -> Result<u64, StartError> {
        self.call(|reply| Command::Start {
            view,
            credentials,
            reply,
        })
        .await
        .unwrap_or(Err(StartError::Stopped))
    }

    /// Requests the block at the current index. A no-op while a request is
    /// outstanding.
    pub async fn request_next_block(&self) -> Result<Dispatch, ScheduleError> {
        self.call(|reply| Command::RequestNext { reply })
            .await
            .unwrap_or(Err(ScheduleError::Stopped))
    }

    /// Moves the scheduler to `index`. Only allowed while ready.
    pub async fn set_next_block(&self, index: u32) -> Result<(), ScheduleError> {
        self.call(|reply| Command::SetNext { index, reply })
            .await
            .unwrap_or(Err(ScheduleError::Stopped))
    }

    /// Aborts the transfer and fully resets the session. Safe while a
    /// request is outstanding; its late events are discarded.
    pub async fn abort(&self) -> Result<(), EngineError> {
        cancel_in_flight(&self.inflight_cancel);
        self.call(|reply| Command::Abort { reply })
            .await
            .ok_or(EngineError::Stopped)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, EngineError> {
        self.call(|reply| Command::Snapshot { reply })
            .await
            .ok_or(EngineError::Stopped)
    }

    pub fn stats(&self) -> TransferStats {
        self.stats.snapshot()
    }
}
