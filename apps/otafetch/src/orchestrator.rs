//! Drives the engine until the image is complete.
//!
//! Plays the orchestrator's part: keeps the received bitmap, restarts the
//! transfer on `ReconnectRequired`, renews the grant on
//! `AuthorizationExpired`, and re-requests blocks the engine had to drop.

use std::time::Duration;

use anyhow::{Context, bail};
use otafetch_protocol::{OrchestratorView, TransferState};
use otafetch_transfer::{
    BlockPool, Dispatch, EngineConfig, EngineEvent, EngineHandle, ProbeError, ScheduleError,
    StartError, TransferStats,
};
use otafetch_transport::{ConnectError, Connector, Credentials};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assembly::Assembly;
use crate::config::Config;

/// How often an outstanding request is checked on.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Outcome of a completed fetch.
#[derive(Debug)]
pub struct Summary {
    pub bytes: u64,
    pub sha256: String,
    pub restarts: u32,
    pub stats: TransferStats,
}

/// Why a transfer pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Complete,
    Reconnect,
    Renew,
    Stalled,
}

/// Fetches the configured image through `connector`.
pub async fn run<C: Connector>(
    connector: C,
    config: &Config,
    shutdown: CancellationToken,
) -> anyhow::Result<Summary> {
    let engine_config = EngineConfig {
        block_size: config.block_size,
        ..EngineConfig::default()
    };
    let pool = BlockPool::new(config.pool_slots, config.block_size as usize);
    let (handle, events) = EngineHandle::spawn(connector, engine_config, pool)?;
    fetch(&handle, events, config, shutdown).await
}

/// Fetches the configured image through a running engine.
async fn fetch(
    handle: &EngineHandle,
    mut events: mpsc::Receiver<EngineEvent>,
    config: &Config,
    shutdown: CancellationToken,
) -> anyhow::Result<Summary> {
    let credentials = config.credentials()?;
    let mut assembly = Assembly::create(&config.output, config.file_size, config.block_size)?;
    let mut locator = config.locator()?;
    let block_timeout = Duration::from_millis(config.block_timeout_ms);

    let mut restarts = 0u32;
    let mut attempt = 0u32;
    while assembly.remaining() > 0 {
        let remaining_before = assembly.remaining();
        let pass = match start(handle, &assembly, config, &locator, &credentials).await {
            Ok(()) => drive(handle, &mut events, &mut assembly, block_timeout, &shutdown).await?,
            Err(e) if e.is_authorization_denied() => Pass::Renew,
            Err(e) if is_transient(&e) => {
                warn!(error = %e, "transfer start failed");
                Pass::Reconnect
            }
            Err(e) => return Err(e).context("cannot start transfer"),
        };

        match pass {
            Pass::Complete => break,
            Pass::Renew => {
                if !config.can_renew() {
                    bail!("access grant expired and no `url_file` is configured to renew it");
                }
                locator = config.locator()?;
                info!("access grant renewed");
            }
            Pass::Reconnect | Pass::Stalled => {}
        }

        if assembly.remaining() < remaining_before {
            attempt = 0;
        }
        attempt += 1;
        restarts += 1;
        if attempt > config.max_restarts {
            bail!(
                "giving up after {} restarts without progress",
                config.max_restarts
            );
        }

        let delay = config.reconnect.delay_for_attempt(attempt);
        info!(?pass, attempt, delay_ms = delay.as_millis() as u64, "restarting transfer");
        tokio::select! {
            _ = shutdown.cancelled() => bail!("interrupted"),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    handle.abort().await?;
    let stats = handle.stats();
    let sha256 = assembly.finish()?;
    if let Some(expected) = &config.expected_sha256
        && !expected.eq_ignore_ascii_case(&sha256)
    {
        bail!("image digest {sha256} does not match expected {expected}");
    }

    info!(
        bytes = config.file_size,
        %sha256,
        restarts,
        requested = stats.requested,
        dropped = stats.dropped,
        reconnects = stats.reconnects,
        "image complete"
    );
    Ok(Summary {
        bytes: config.file_size,
        sha256,
        restarts,
        stats,
    })
}

fn is_transient(err: &StartError) -> bool {
    matches!(
        err,
        StartError::Connect(
            ConnectError::Unreachable { .. } | ConnectError::Timeout
        ) | StartError::Probe(ProbeError::Transport(_) | ProbeError::Timeout(_))
    )
}

/// Starts the engine at the first block still missing.
async fn start(
    handle: &EngineHandle,
    assembly: &Assembly,
    config: &Config,
    locator: &str,
    credentials: &Credentials,
) -> Result<(), StartError> {
    let first_missing = assembly.next_missing(0).unwrap_or(assembly.num_blocks());
    let view = OrchestratorView {
        total_file_size: config.file_size,
        remaining_blocks: assembly.num_blocks() - first_missing,
        source_locator: locator.to_string(),
    };
    let size = handle.start_transfer(view, credentials.clone()).await?;
    debug!(size, first_block = first_missing, "transfer started");
    Ok(())
}

/// Requests missing blocks one at a time until the image is complete or the
/// engine asks for a restart.
async fn drive(
    handle: &EngineHandle,
    events: &mut mpsc::Receiver<EngineEvent>,
    assembly: &mut Assembly,
    block_timeout: Duration,
    shutdown: &CancellationToken,
) -> anyhow::Result<Pass> {
    loop {
        if assembly.remaining() == 0 {
            return Ok(Pass::Complete);
        }

        // Skip blocks already on disk and go back for ones that were dropped.
        let next = handle.snapshot().await?.next_block;
        if next >= assembly.num_blocks() || assembly.has(next) {
            let Some(index) = assembly.next_missing(next) else {
                return Ok(Pass::Complete);
            };
            handle.set_next_block(index).await?;
        }

        match handle.request_next_block().await {
            Ok(Dispatch::Sent(range)) => debug!(start = range.start, "block requested"),
            Ok(Dispatch::InFlight | Dispatch::Complete) => {}
            // The event announcing the restart is already queued.
            Err(ScheduleError::NotReady(state)) if state.requires_restart() => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(pass) = wait(handle, events, assembly, block_timeout, shutdown).await? {
            return Ok(pass);
        }
    }
}

/// Waits for the outstanding request to finish. `None` means the engine is
/// ready for the next block.
async fn wait(
    handle: &EngineHandle,
    events: &mut mpsc::Receiver<EngineEvent>,
    assembly: &mut Assembly,
    block_timeout: Duration,
    shutdown: &CancellationToken,
) -> anyhow::Result<Option<Pass>> {
    let deadline = Instant::now() + block_timeout;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                let _ = handle.abort().await;
                bail!("interrupted");
            }
            event = events.recv() => {
                return on_event(event.context("engine stopped")?, assembly);
            }
            _ = tokio::time::sleep(IDLE_POLL) => {
                let snap = handle.snapshot().await?;
                if snap.in_flight {
                    if Instant::now() >= deadline {
                        warn!(block = snap.next_block, "block request stalled");
                        return Ok(Some(Pass::Stalled));
                    }
                    continue;
                }
                if snap.state.requires_restart() {
                    if let Ok(event) = events.try_recv() {
                        return on_event(event, assembly);
                    }
                    return restart_for(snap.state).map(Some);
                }
                // Finished without a block: dropped, or retried after a reconnect.
                return Ok(None);
            }
        }
    }
}

fn on_event(event: EngineEvent, assembly: &mut Assembly) -> anyhow::Result<Option<Pass>> {
    match event {
        EngineEvent::BlockReceived { index, payload } => {
            if assembly.write_block(index, &payload)? {
                debug!(block = index, remaining = assembly.remaining(), "block stored");
            }
            Ok(None)
        }
        EngineEvent::ReconnectRequired => Ok(Some(Pass::Reconnect)),
        EngineEvent::AuthorizationExpired => Ok(Some(Pass::Renew)),
        EngineEvent::Fatal(e) => Err(anyhow::Error::new(e).context("block transfer failed")),
    }
}

fn restart_for(state: TransferState) -> anyhow::Result<Pass> {
    match state {
        TransferState::NeedsFreshAuthorization => Ok(Pass::Renew),
        TransferState::NeedsReconnect => Ok(Pass::Reconnect),
        other => bail!("transfer stopped in state {other}"),
    }
}
