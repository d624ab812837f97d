use crate::change_group::{self, AUTO_POLL_GROUP_ID};
use crate::client::ClientShared;
use crate::component::{self, Component};
use crate::connection::{Connection, ConnectionEvent};
use crate::error::{QrcError, Result};
use crate::protocol::EngineStatus;
use crate::types::{ConnectionState, ConnectionStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// How one session ended
enum Outcome {
    /// Socket dropped involuntarily; reconnection may follow
    SocketClosed,
    /// Explicit disconnect; no reconnection
    Stopped,
}

/// Spawn the session supervisor
///
/// The supervisor owns the whole connect/resync/reconnect loop for one
/// client, so at most one reconnect timer can ever be pending.
pub(crate) fn spawn_supervisor(shared: Arc<ClientShared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_supervisor(shared).await;
    })
}

async fn run_supervisor(shared: Arc<ClientShared>) {
    let mut stop_rx = shared.stop_tx.subscribe();

    loop {
        if shared.lifecycle.lock().unwrap().stopping {
            break;
        }

        match Connection::open(&shared.url, shared.link.options.heartbeat_interval).await {
            Ok((conn, events)) => {
                let conn = Arc::new(conn);
                if shared.lifecycle.lock().unwrap().stopping {
                    conn.close().await;
                    break;
                }
                *shared.link.conn.lock().unwrap() = Some(conn.clone());
                shared.lifecycle.lock().unwrap().state = ConnectionState::AwaitingEngineStatus;

                let outcome = run_session(&shared, conn, events, &mut stop_rx).await;

                *shared.link.conn.lock().unwrap() = None;
                *shared.link.repoll_tx.lock().unwrap() = None;

                if matches!(outcome, Outcome::Stopped) {
                    break;
                }
                tracing::warn!("Lost connection to {}", shared.address);
            }
            Err(e) => {
                tracing::warn!("Failed to reach {}: {}", shared.url, e);
            }
        }

        // Involuntary close (or failed open): schedule one reconnect attempt
        // or give up. The attempt counter was reset by the last successful
        // design sync.
        let next = {
            let mut lifecycle = shared.lifecycle.lock().unwrap();
            if lifecycle.stopping {
                break;
            }
            let max = shared.link.options.max_reconnect_attempts;
            if max != 0 && lifecycle.attempts >= max {
                lifecycle.state = ConnectionState::Stopped;
                None
            } else {
                lifecycle.attempts += 1;
                lifecycle.state = ConnectionState::Reconnecting;
                Some((
                    lifecycle.attempts,
                    reconnect_delay(
                        shared.link.options.reconnect_base_delay,
                        shared.link.options.reconnect_growth,
                        lifecycle.attempts,
                    ),
                ))
            }
        };

        let engine_status = shared.lifecycle.lock().unwrap().engine_status.clone();
        match next {
            None => {
                tracing::error!("Reconnection attempts exhausted for {}", shared.address);
                shared.emit_status(ConnectionStatus {
                    connected: false,
                    no_reconnect: true,
                    engine_status,
                    new_design: false,
                });
                break;
            }
            Some((attempt, delay)) => {
                shared.emit_status(ConnectionStatus {
                    connected: false,
                    no_reconnect: false,
                    engine_status,
                    new_design: false,
                });
                tracing::info!("Reconnecting in {:?} (attempt {})", delay, attempt);
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = sleep(delay) => {}
                }
            }
        }
    }
}

/// Pump one socket's events until it dies or the client stops
async fn run_session(
    shared: &Arc<ClientShared>,
    conn: Arc<Connection>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    stop_rx: &mut broadcast::Receiver<()>,
) -> Outcome {
    let (repoll_tx, repoll_rx) = mpsc::unbounded_channel();
    *shared.link.repoll_tx.lock().unwrap() = Some(repoll_tx);
    let debounce = tokio::spawn(debounce_repoll(shared.clone(), conn.clone(), repoll_rx));

    let outcome = loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                conn.close().await;
                break Outcome::Stopped;
            }
            event = events.recv() => match event {
                None | Some(ConnectionEvent::Closed) => break Outcome::SocketClosed,
                Some(ConnectionEvent::EngineStatus(status)) => {
                    if let Err(e) = handle_engine_status(shared, &conn, status).await {
                        // The socket likely died mid-sync; the Closed event
                        // will follow and drive the reconnect path.
                        tracing::warn!("Design sync failed: {}", e);
                    }
                }
                Some(ConnectionEvent::GroupPoll(poll)) => {
                    change_group::apply_poll(shared, poll);
                }
            }
        }
    };

    debounce.abort();
    outcome
}

/// React to an `EngineStatus` notification
///
/// An open socket alone is not a usable session: the state advances to
/// `Connected` only after the cache is in sync, the change groups are
/// recreated, the baseline poll has run and auto-poll is armed, so
/// dependents never observe `connected` with a stale or empty cache.
async fn handle_engine_status(
    shared: &Arc<ClientShared>,
    conn: &Arc<Connection>,
    status: EngineStatus,
) -> Result<()> {
    tracing::info!(
        "Engine status: {} running design {} ({})",
        status.state,
        status.design_name,
        status.design_code
    );
    let _ = shared.engine_tx.send(status.clone());

    let new_design = {
        let mut lifecycle = shared.lifecycle.lock().unwrap();
        let new_design =
            lifecycle.last_design_code.as_deref() != Some(status.design_code.as_str());
        lifecycle.last_design_code = Some(status.design_code.clone());
        lifecycle.engine_status = Some(status.clone());
        new_design
    };
    if new_design {
        // A different design invalidates every cached object and every
        // server-side change group
        shared.cache.lock().unwrap().clear();
        shared.groups.clear();
    }

    populate_if_empty(shared, conn).await?;
    subscribe_cached(shared, conn).await?;
    change_group::resubscribe_custom(&shared.groups, conn, &shared.link.options).await?;

    // Baseline values now, pushed deltas from here on
    let baseline = change_group::poll(conn, &shared.link.options, AUTO_POLL_GROUP_ID).await?;
    change_group::apply_poll(shared, baseline);
    change_group::auto_poll(
        &shared.groups,
        conn,
        &shared.link.options,
        AUTO_POLL_GROUP_ID,
        shared.link.options.auto_poll_rate,
    )
    .await?;

    {
        let mut lifecycle = shared.lifecycle.lock().unwrap();
        lifecycle.state = ConnectionState::Connected;
        lifecycle.attempts = 0;
    }
    shared.emit_status(ConnectionStatus {
        connected: true,
        no_reconnect: false,
        engine_status: Some(status),
        new_design,
    });
    Ok(())
}

/// Fill the cache with the full design if it is empty
///
/// Returns true when a fetch actually happened.
async fn populate_if_empty(shared: &Arc<ClientShared>, conn: &Arc<Connection>) -> Result<bool> {
    if !shared.cache.lock().unwrap().is_empty() {
        return Ok(false);
    }
    let components = component::fetch_components(conn, &shared.link, true).await?;
    tracing::info!("Cached {} components", components.len());
    let mut cache = shared.cache.lock().unwrap();
    for component in components {
        cache.insert(component.name().to_string(), component);
    }
    Ok(true)
}

/// Rebuild the default change group from the cache
async fn subscribe_cached(shared: &Arc<ClientShared>, conn: &Arc<Connection>) -> Result<()> {
    shared.groups.reset_group(AUTO_POLL_GROUP_ID);
    let components: Vec<Component> = shared.cache.lock().unwrap().values().cloned().collect();
    for component in components {
        let names = component.control_names();
        change_group::add_component_controls(
            &shared.groups,
            conn,
            &shared.link.options,
            AUTO_POLL_GROUP_ID,
            component.name(),
            &names,
        )
        .await?;
    }
    Ok(())
}

/// Cache-filling path used by `get_all_components` when the cache is cold
pub(crate) async fn ensure_cache(shared: &Arc<ClientShared>, conn: &Arc<Connection>) -> Result<()> {
    if populate_if_empty(shared, conn).await? {
        subscribe_cached(shared, conn).await?;
        let baseline = change_group::poll(conn, &shared.link.options, AUTO_POLL_GROUP_ID).await?;
        change_group::apply_poll(shared, baseline);
    }
    Ok(())
}

/// Cache-filling path for a single component: list, pick, fetch controls,
/// subscribe, baseline
pub(crate) async fn fetch_into_cache(
    shared: &Arc<ClientShared>,
    conn: &Arc<Connection>,
    name: &str,
) -> Result<Component> {
    let listed = component::fetch_components(conn, &shared.link, false).await?;
    let component = listed
        .into_iter()
        .find(|c| c.name() == name)
        .ok_or_else(|| QrcError::ComponentNotFound(name.to_string()))?;
    component::fetch_controls(conn, &shared.link, &component).await?;

    shared
        .cache
        .lock()
        .unwrap()
        .insert(name.to_string(), component.clone());

    let names = component.control_names();
    change_group::add_component_controls(
        &shared.groups,
        conn,
        &shared.link.options,
        AUTO_POLL_GROUP_ID,
        name,
        &names,
    )
    .await?;
    let baseline = change_group::poll(conn, &shared.link.options, AUTO_POLL_GROUP_ID).await?;
    change_group::apply_poll(shared, baseline);

    Ok(component)
}

/// Quiet-window poll after local writes
///
/// Every write signal restarts the window, so a burst of writes (a slider
/// drag) collapses into a single authoritative poll.
async fn debounce_repoll(
    shared: Arc<ClientShared>,
    conn: Arc<Connection>,
    mut rx: mpsc::UnboundedReceiver<()>,
) {
    let window = shared.link.options.write_debounce;
    while rx.recv().await.is_some() {
        loop {
            tokio::select! {
                _ = sleep(window) => break,
                more = rx.recv() => {
                    if more.is_none() {
                        return;
                    }
                }
            }
        }
        match change_group::poll(&conn, &shared.link.options, AUTO_POLL_GROUP_ID).await {
            Ok(poll) => {
                change_group::apply_poll(&shared, poll);
            }
            Err(e) => tracing::debug!("Post-write poll failed: {}", e),
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based)
pub(crate) fn reconnect_delay(base: Duration, growth: f64, attempt: u32) -> Duration {
    base.mul_f64(growth.powi(attempt.saturating_sub(1) as i32))
}
