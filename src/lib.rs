//! Rust library for controlling Q-SYS cores over the QRC WebSocket protocol
//!
//! This library provides an async client for the QRC remote-control
//! interface of Q-SYS audio/AV core processors. It supports:
//!
//! - Persistent WebSocket sessions with automatic reconnection and backoff
//! - Discovery of the running design's components and controls
//! - A live component/control cache kept current via change-group deltas
//! - Control writes with optional ramped transitions
//! - Real-time connection, engine and control-change subscriptions
//!
//! # Quick Start
//!
//! ```no_run
//! use qsys_qrc::QrcClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Connect to a core by address; the session comes up once the core
//!     // reports its engine status
//!     let client = QrcClient::new("192.168.1.50")?;
//!     client.connect().await;
//!
//!     let mut status = client.subscribe_status();
//!     while !status.recv().await?.connected {}
//!
//!     // Browse the design
//!     let components = client.get_all_components().await?;
//!     for component in &components {
//!         println!("{} ({})", component.name(), component.component_type());
//!         for control in component.controls() {
//!             println!("  {} = {}", control.name(), control.snapshot().display_value());
//!         }
//!     }
//!
//!     // Write a control and watch the confirmed value come back
//!     if let Some(gain) = client.get_component("Main Mixer").await?.control("gain") {
//!         let mut changes = gain.changed();
//!         gain.set_value(-12.0).await?;
//!         let snapshot = changes.recv().await?;
//!         println!("gain is now {}", snapshot.display_value());
//!     }
//!
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Client**: the public handle; session control, cache access, streams
//! - **Session**: connection state machine, reconnection, design tracking
//! - **Connection**: low-level WebSocket transport and request correlation
//! - **Component**: the live component/control cache and write operations
//! - **Change groups**: server-side subscription sets delivering deltas
//! - **Protocol**: QRC JSON-RPC message structures

mod change_group;
mod client;
mod component;
mod connection;
mod error;
mod protocol;
mod session;
mod subscription;
mod types;

// Public exports
pub use change_group::AUTO_POLL_GROUP_ID;
pub use client::QrcClient;
pub use component::{Component, Control};
pub use error::{QrcError, Result};
pub use protocol::{core_url, EngineStatus, StatusDetail};
pub use subscription::{
    ComponentUpdateReceiver, ControlChangeReceiver, EngineStatusReceiver, StatusReceiver,
    Subscription, UpdateReceiver,
};
pub use types::{
    ClientOptions, ConnectionState, ConnectionStatus, ControlSnapshot, Direction, GroupUpdate,
    Property,
};
