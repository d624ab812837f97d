use crate::change_group::{self, ChangeGroups};
use crate::component::{self, Component};
use crate::connection::Connection;
use crate::error::{QrcError, Result};
use crate::protocol::{self, EngineStatus};
use crate::session;
use crate::subscription::{EngineStatusReceiver, StatusReceiver, Subscription, UpdateReceiver};
use crate::types::{ClientOptions, ConnectionState, ConnectionStatus, GroupUpdate};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// What a write operation needs to reach the wire: the current socket, the
/// client tunables, and the debounce channel for the confirmatory poll.
///
/// Kept separate from [`ClientShared`] so cached controls can hold it
/// without creating a reference cycle through the cache.
pub(crate) struct Link {
    pub(crate) options: ClientOptions,
    /// Socket of the current session; swapped on every reconnect
    pub(crate) conn: Mutex<Option<Arc<Connection>>>,
    /// Debounce channel of the current session
    pub(crate) repoll_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
}

impl Link {
    pub(crate) fn new(options: ClientOptions) -> Self {
        Self {
            options,
            conn: Mutex::new(None),
            repoll_tx: Mutex::new(None),
        }
    }

    /// Current session socket, or `NotConnected`
    pub(crate) fn current(&self) -> Result<Arc<Connection>> {
        self.conn
            .lock()
            .unwrap()
            .clone()
            .ok_or(QrcError::NotConnected)
    }

    /// Nudge the debounced write-confirmation poll
    pub(crate) fn schedule_repoll(&self) {
        if let Some(tx) = &*self.repoll_tx.lock().unwrap() {
            let _ = tx.send(());
        }
    }
}

/// Session state machine bookkeeping, owned by the supervisor
pub(crate) struct Lifecycle {
    pub(crate) state: ConnectionState,
    /// Set by an explicit disconnect; preempts automatic reconnection
    pub(crate) stopping: bool,
    pub(crate) attempts: u32,
    pub(crate) last_design_code: Option<String>,
    pub(crate) engine_status: Option<EngineStatus>,
    pub(crate) last_status: ConnectionStatus,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            stopping: false,
            attempts: 0,
            last_design_code: None,
            engine_status: None,
            last_status: ConnectionStatus::default(),
        }
    }
}

/// State shared between the client handle, the supervisor task and the
/// debounce task
pub(crate) struct ClientShared {
    pub(crate) address: String,
    pub(crate) url: String,
    pub(crate) link: Arc<Link>,
    pub(crate) lifecycle: Mutex<Lifecycle>,
    /// Components of the current design, keyed by name
    pub(crate) cache: Mutex<BTreeMap<String, Component>>,
    pub(crate) groups: ChangeGroups,
    pub(crate) status_tx: broadcast::Sender<ConnectionStatus>,
    pub(crate) engine_tx: broadcast::Sender<EngineStatus>,
    pub(crate) update_tx: broadcast::Sender<GroupUpdate>,
    pub(crate) stop_tx: broadcast::Sender<()>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ClientShared {
    fn build(address: String, url: String, options: ClientOptions) -> Arc<Self> {
        let (status_tx, _) = broadcast::channel(100);
        let (engine_tx, _) = broadcast::channel(100);
        let (update_tx, _) = broadcast::channel(100);
        let (stop_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            address,
            url,
            link: Arc::new(Link::new(options)),
            lifecycle: Mutex::new(Lifecycle::default()),
            cache: Mutex::new(BTreeMap::new()),
            groups: ChangeGroups::new(),
            status_tx,
            engine_tx,
            update_tx,
            stop_tx,
            supervisor: Mutex::new(None),
        })
    }

    /// Record and broadcast a status transition
    pub(crate) fn emit_status(&self, status: ConnectionStatus) {
        self.lifecycle.lock().unwrap().last_status = status.clone();
        let _ = self.status_tx.send(status);
    }

    #[cfg(test)]
    pub(crate) fn new_for_test() -> Arc<Self> {
        Self::build(
            "test".to_string(),
            "ws://test/qrc".to_string(),
            ClientOptions::default(),
        )
    }
}

/// Client for a Q-SYS core's QRC remote-control interface
///
/// A `QrcClient` owns one logical session to a core: it connects, keeps the
/// session alive across drops with exponential backoff, mirrors the running
/// design's components and controls in a live cache, and surfaces change
/// notifications without polling each control.
///
/// The client is cheap to clone; all clones share the same session.
///
/// # Example
///
/// ```no_run
/// use qsys_qrc::QrcClient;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = QrcClient::new("10.1.0.69")?;
///     client.connect().await;
///
///     // Wait for the session to come up
///     let mut status = client.subscribe_status();
///     while !status.recv().await?.connected {}
///
///     let components = client.get_all_components().await?;
///     for component in &components {
///         println!("{} ({})", component.name(), component.component_type());
///     }
///
///     if let Some(gain) = components
///         .iter()
///         .find_map(|c| c.control("gain"))
///     {
///         gain.ramp_value(-12.0, 2.0).await?;
///     }
///
///     client.disconnect().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct QrcClient {
    shared: Arc<ClientShared>,
}

impl QrcClient {
    /// Create a client for the given core address
    ///
    /// Accepts a bare host or IP (formatted as `wss://<host>/qrc`) or a
    /// complete `ws://`/`wss://` URL (used verbatim). No connection is made
    /// until [`connect`](Self::connect) is called.
    pub fn new(address: impl Into<String>) -> Result<Self> {
        Self::with_options(address, ClientOptions::default())
    }

    /// Create a client with explicit tunables
    pub fn with_options(address: impl Into<String>, options: ClientOptions) -> Result<Self> {
        let address = address.into();
        let url = protocol::core_url(&address)?;
        Ok(Self {
            shared: ClientShared::build(address, url, options),
        })
    }

    /// The core address this client was created with
    pub fn core_address(&self) -> &str {
        &self.shared.address
    }

    /// Start (or restart) the session
    ///
    /// Returns immediately; progress is reported on the status stream. The
    /// session counts as connected only once the core's first `EngineStatus`
    /// notification has arrived and the component cache is in sync.
    pub async fn connect(&self) {
        self.stop_supervisor().await;
        {
            let mut lifecycle = self.shared.lifecycle.lock().unwrap();
            lifecycle.stopping = false;
            lifecycle.attempts = 0;
            lifecycle.state = ConnectionState::AwaitingEngineStatus;
        }
        tracing::info!("Connecting to core at {}", self.shared.address);
        let handle = session::spawn_supervisor(self.shared.clone());
        *self.shared.supervisor.lock().unwrap() = Some(handle);
    }

    /// Tear the session down and give up on it
    ///
    /// Cancels any pending reconnection; a terminal status with
    /// `no_reconnect` set is emitted so dependents can offer a manual
    /// re-entry flow. Callable from any state.
    pub async fn disconnect(&self) {
        self.shared.lifecycle.lock().unwrap().state = ConnectionState::Stopped;
        self.stop_supervisor().await;

        let engine_status = self.shared.lifecycle.lock().unwrap().engine_status.clone();
        self.shared.emit_status(ConnectionStatus {
            connected: false,
            no_reconnect: true,
            engine_status,
            new_design: false,
        });
        tracing::info!("Disconnected from {}", self.shared.address);
    }

    async fn stop_supervisor(&self) {
        self.shared.lifecycle.lock().unwrap().stopping = true;
        let _ = self.shared.stop_tx.send(());

        let handle = self.shared.supervisor.lock().unwrap().take();
        if let Some(handle) = handle {
            // Give it a moment to wind down gracefully
            let _ = tokio::time::timeout(Duration::from_millis(500), handle).await;
        }

        let conn = self.shared.link.conn.lock().unwrap().take();
        if let Some(conn) = conn {
            conn.close().await;
        }
        *self.shared.link.repoll_tx.lock().unwrap() = None;
    }

    /// Current state of the session state machine
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.lifecycle.lock().unwrap().state
    }

    /// True once the session is fully up (EngineStatus received, cache in sync)
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Last emitted connection status
    pub fn connection_status(&self) -> ConnectionStatus {
        self.shared.lifecycle.lock().unwrap().last_status.clone()
    }

    /// Last engine status received, if any
    pub fn engine_status(&self) -> Option<EngineStatus> {
        self.shared.lifecycle.lock().unwrap().engine_status.clone()
    }

    /// Subscribe to connection status transitions
    pub fn subscribe_status(&self) -> StatusReceiver {
        Subscription::new(self.shared.status_tx.subscribe())
    }

    /// Subscribe to engine status snapshots
    pub fn subscribe_engine_status(&self) -> EngineStatusReceiver {
        Subscription::new(self.shared.engine_tx.subscribe())
    }

    /// Subscribe to change-group update batches
    pub fn subscribe_updates(&self) -> UpdateReceiver {
        Subscription::new(self.shared.update_tx.subscribe())
    }

    /// Send a raw QRC command and await its result
    ///
    /// Escape hatch for protocol methods the typed API does not cover.
    pub async fn command(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let conn = self.shared.link.current()?;
        conn.request(method, params, self.shared.link.options.request_timeout)
            .await
    }

    /// Send a raw QRC notification; no response is expected
    pub async fn notify(&self, method: &str, params: serde_json::Value) -> Result<()> {
        let conn = self.shared.link.current()?;
        conn.notify(method, params).await
    }

    /// Fetch the component list fresh from the core
    ///
    /// One round trip for the list; with `with_controls`, one more per
    /// component. The returned components are plain fetches, not the live
    /// cached objects; use [`get_all_components`](Self::get_all_components)
    /// for those.
    pub async fn get_components(&self, with_controls: bool) -> Result<Vec<Component>> {
        let conn = self.shared.link.current()?;
        component::fetch_components(&conn, &self.shared.link, with_controls).await
    }

    /// All components of the running design, as live cached objects
    ///
    /// Served from the cache after the first call; cached components stay
    /// current through change-group deltas.
    pub async fn get_all_components(&self) -> Result<Vec<Component>> {
        {
            let cache = self.shared.cache.lock().unwrap();
            if !cache.is_empty() {
                return Ok(sorted(&cache));
            }
        }
        let conn = self.shared.link.current()?;
        session::ensure_cache(&self.shared, &conn).await?;
        Ok(sorted(&self.shared.cache.lock().unwrap()))
    }

    /// One component by name, as a live cached object
    ///
    /// Round trips happen only on first access; later calls return the
    /// cached component.
    pub async fn get_component(&self, name: &str) -> Result<Component> {
        if let Some(component) = self.shared.cache.lock().unwrap().get(name) {
            return Ok(component.clone());
        }
        let conn = self.shared.link.current()?;
        session::fetch_into_cache(&self.shared, &conn, name).await
    }

    /// Add controls of a component to a change group, creating the group on
    /// first use
    ///
    /// Membership is remembered and recreated server-side after a reconnect.
    /// Re-adding an existing member is harmless.
    pub async fn add_change_group_controls(
        &self,
        group_id: &str,
        component: &str,
        controls: &[String],
    ) -> Result<()> {
        let conn = self.shared.link.current()?;
        change_group::add_component_controls(
            &self.shared.groups,
            &conn,
            &self.shared.link.options,
            group_id,
            component,
            controls,
        )
        .await
    }

    /// Poll a change group once, applying any deltas to the cache
    pub async fn poll_change_group(&self, group_id: &str) -> Result<GroupUpdate> {
        let conn = self.shared.link.current()?;
        let poll = change_group::poll(&conn, &self.shared.link.options, group_id).await?;
        Ok(change_group::apply_poll(&self.shared, poll))
    }

    /// Ask the core to push deltas for a change group at the given rate
    /// (seconds)
    pub async fn enable_auto_poll(&self, group_id: &str, rate: f64) -> Result<()> {
        let conn = self.shared.link.current()?;
        change_group::auto_poll(
            &self.shared.groups,
            &conn,
            &self.shared.link.options,
            group_id,
            rate,
        )
        .await
    }
}

fn sorted(cache: &BTreeMap<String, Component>) -> Vec<Component> {
    let mut components: Vec<Component> = cache.values().cloned().collect();
    components.sort_by(|a, b| component::natural_cmp(a.name(), b.name()));
    components
}
