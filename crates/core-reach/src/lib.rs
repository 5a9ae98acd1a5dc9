//! Reachability Coordinator: decides which of a node's addresses to
//! advertise to peers so that the node is always reachable via at least a
//! relayed fallback, and direct paths are used once proven reachable.
//!
//! See [`coordinator::Coordinator`] for the state owner, [`dial_back`] and
//! [`witness`] for the two verification protocols, and [`store`] for the
//! on-disk cache that survives restarts.

pub mod address;
pub mod cancel;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod dial_back;
pub mod error;
pub mod interface_scan;
pub mod state_machine;
pub mod store;
pub mod witness;

pub use address::{Address, AddressEntry, AddressPriority};
pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use error::{CoordinatorError, DialBackError, StoreError, WitnessError};
