//! Midea LAN Control
//!
//! Local-network control of Midea-family appliances (air conditioners,
//! dehumidifiers, fans, water heaters):
//! - UDP broadcast discovery on port 6445
//! - Per-device TCP sessions on port 6444 with the v3 encrypted transport
//! - Appliance adapters for decoding status payloads
//!
//! ```no_run
//! use midea_lan::{discover, DiscoveryOptions};
//!
//! # async fn run() -> midea_lan::Result<()> {
//! let devices = discover(&DiscoveryOptions::default()).await?;
//! for device in devices.values() {
//!     println!("{} at {}", device.serial, device.address);
//! }
//! # Ok(())
//! # }
//! ```

pub mod appliance;
pub mod discovery;
pub mod error;
pub mod session;

pub use appliance::{ApplianceAdapter, GenericAdapter, StatusMap};
pub use discovery::{DeviceDescriptor, DiscoveryOptions, UdpIdVariant, discover, udp_id};
pub use error::{Result, SessionError};
pub use session::{Credentials, DeviceSession, ObserverHandle, SessionOptions, SessionState};
