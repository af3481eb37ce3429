//! Networking layer for Tether
//!
//! This crate tracks device connectivity: it normalizes platform
//! observations, accounts for offline time, persists the last known
//! state, and manages the monitoring subscription.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connectivity;
pub mod monitor;
pub mod source;

pub use connectivity::{
    ConnectionType, ConnectivityConfig, ConnectivityState, ConnectivityTracker, NetworkObservation,
    NETWORK_STORAGE_KEY,
};
pub use monitor::MonitorHandle;
pub use source::{ChannelSource, ConnectivitySource, ObservationSink, SourceError, SourceSubscription};
