use tokio::sync::broadcast;

use crate::component::Control;
use crate::error::{QrcError, Result};
use crate::protocol::EngineStatus;
use crate::types::{ConnectionStatus, ControlSnapshot, GroupUpdate};

/// Receiver for a client event stream
///
/// Wraps a broadcast receiver so stream errors surface as [`QrcError`]
/// instead of channel internals.
pub struct Subscription<T> {
    rx: broadcast::Receiver<T>,
}

/// Connection status transitions
pub type StatusReceiver = Subscription<ConnectionStatus>;
/// Engine status snapshots
pub type EngineStatusReceiver = Subscription<EngineStatus>;
/// Change-group update batches
pub type UpdateReceiver = Subscription<GroupUpdate>;
/// Per-component batches of changed controls
pub type ComponentUpdateReceiver = Subscription<Vec<Control>>;
/// Per-control change snapshots
pub type ControlChangeReceiver = Subscription<ControlSnapshot>;

impl<T: Clone> Subscription<T> {
    pub(crate) fn new(rx: broadcast::Receiver<T>) -> Self {
        Self { rx }
    }

    /// Receive the next event, waiting until one arrives
    pub async fn recv(&mut self) -> Result<T> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => QrcError::ConnectionClosed,
            broadcast::error::RecvError::Lagged(n) => {
                QrcError::Channel(format!("Lagged by {} messages", n))
            }
        })
    }

    /// Try to receive an event without blocking
    ///
    /// Returns `None` if no event is queued.
    pub fn try_recv(&mut self) -> Result<Option<T>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(QrcError::ConnectionClosed),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Err(QrcError::Channel(format!("Lagged by {} messages", n)))
            }
        }
    }
}
