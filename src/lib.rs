//! # tuya2mqtt
//!
//! Bridges Tuya devices speaking the local LAN protocol (3.1 through 3.5),
//! including sub-devices behind gateways, to an MQTT broker.
//!
//! Every top-level device gets its own worker that keeps a connection open,
//! polls status and forwards commands. State is published as
//! `<base>/<name>/dps/<key>/state`; commands arrive on
//! `<base>/<name>/dps/<key>/command`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tuya2mqtt::{Bridge, DeviceRegistry, config::Config, mqtt::MqttMessenger};
//! use tuya2mqtt::transport::TcpConnector;
//!
//! # async fn run() -> tuya2mqtt::Result<()> {
//! let config = Config::from_file("mqtt.toml".as_ref())?;
//! let registry = DeviceRegistry::load("devices.json")?;
//! let (messenger, inbound) = MqttMessenger::connect(&config.mqtt);
//! let bridge = Bridge::start(
//!     registry,
//!     TcpConnector::default(),
//!     config.bridge.session_options(),
//!     config.bridge_options(),
//!     messenger,
//!     inbound,
//! )
//! .await?;
//! bridge.shutdown(config.bridge.shutdown_window()).await;
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
mod macros;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod dps;
pub mod error;
pub mod handshake;
pub mod mqtt;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod subdevice;
pub mod supervisor;
pub mod transport;

pub use bridge::{Bridge, BridgeRouter, Messenger};
pub use codec::FrameCodec;
pub use dps::{DpKey, DpMap, DpValue};
pub use error::{FrameError, Result, TuyaError};
pub use handshake::HandshakeNegotiator;
pub use protocol::{CommandType, Frame, Generation};
pub use registry::{Device, DeviceRegistry, SubDevice};
pub use session::{DeviceSession, SessionHandle, SessionState};
pub use subdevice::SubDeviceRouter;
pub use supervisor::WorkerSupervisor;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
