//! Platform transport
//!
//! One [`TransportClient`] per orchestrator owns the broker connection. Topic
//! strings come from [`topic`], downlinks are routed through a
//! [`DispatchTable`] built once at construction, and drops are recovered with
//! [`ReconnectBackoff`].

pub mod backoff;
pub mod client;
pub mod credentials;
pub mod dispatch;
pub mod link;
pub mod memory;
pub mod topic;

pub use backoff::{BackoffPolicy, ReconnectBackoff};
pub use client::{ConnectionListener, ConnectionState, TransportClient, TransportOptions};
pub use credentials::{AuthMode, Credentials};
pub use dispatch::{DispatchTable, DispatchTableBuilder, Downlink, TopicMatch};
pub use link::{ConnectOptions, LinkEvent, PlatformLink};
pub use memory::{MemoryLink, Published};
pub use topic::{PlatformTopic, TopicScope};
