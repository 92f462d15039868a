//! Edge Bridge - protocol bridge between device lines and an IoT platform
//!
//! This library provides the core functionality for the edge service:
//! - Device line codec and stream framing
//! - Session tracking for connected devices
//! - Request/response correlation with timeouts
//! - Platform transport with reconnect and topic dispatch
//! - Bridge and gateway orchestrators
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     Devices                          │
//! │        #id,flow,TYPE,dir,fields...|  over TCP        │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                   Edge Bridge                        │
//! │  Server │ Codec │ Sessions │ Correlator │ Bridge/GW  │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │              Platform (topic pub/sub)                │
//! │   login │ properties │ events │ commands │ shadow    │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod bridge;
pub mod codec;
pub mod config;
pub mod correlator;
pub mod daemon;
pub mod error;
pub mod gateway;
pub mod platform;
pub mod server;
pub mod session;
pub mod transport;

pub use bridge::{Bridge, BridgeOptions};
pub use codec::{Codec, CodecError, Delimiters, Message};
pub use config::{Config, DuplicateLogin, Mode};
pub use correlator::{CorrelationError, RequestCorrelator};
pub use daemon::{Daemon, Orchestrator};
pub use error::{Error, Result};
pub use gateway::{Gateway, GatewayOptions, MemorySubDeviceStore, SubDeviceStore};
pub use server::{DeviceHandler, DeviceServer};
pub use session::{DeviceChannel, Session, SessionRegistry, SessionState};
pub use transport::{MemoryLink, PlatformLink, TransportClient};
