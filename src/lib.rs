//! # vidhubcontrol
//!
//! Connection core for Blackmagic Videohub routers and SmartScope monitors.
//!
//! A [`Backend`] keeps one device connection, mirrors the state the device
//! reports into observable properties and serializes commands so that each
//! one is answered by its own ACK or NAK. Device flavours plug in through the
//! [`Protocol`] trait; [`Vidhub`] and [`SmartScope`] are provided.

pub mod actions;
pub mod codec;
pub mod config;
pub mod connection;
pub mod emitters;
pub mod error;
pub mod preset;
pub mod property;
pub mod protocol;
pub mod service;
pub mod session;
pub mod smartscope;
pub mod transport;
pub mod vidhub;

// Re-export the backend and commonly used types
pub use actions::Action;
pub use connection::{Backend, BackendConfig, Hold, WaitFor};
pub use emitters::{Emission, EmissionTracker};
pub use error::{BackendError, Result};
pub use preset::{Preset, PresetDescriptor};
pub use property::{ChangeKind, PropertyChange, Value};
pub use protocol::Protocol;
pub use service::DeviceService;
pub use session::{BackendEvent, MonitorEvent, PresetEvent, Session, Transaction};
pub use smartscope::{MonitorProperty, MonitorValue, SmartScope, SmartScopeBackend};
pub use transport::{BoxedTransport, Connector, TcpConnector, Transport};
pub use vidhub::{ControlValues, ControlWrite, Vidhub, VidhubBackend};
