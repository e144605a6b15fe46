//! Virtual Connection Harness
//!
//! In-memory physical transport for exercising the virtual connection layer
//! without sockets.
//!
//! - **MemoryNetwork**: address book shared by the endpoints of one test
//! - **MemoryTransport**: a `PhysicalTransport` with one inbox task per endpoint
//! - **Failure injection**: `sever` for local resets, `mark_down` for remote resets
//! - **Unaddressed endpoints**: clients that learn their address on first connect
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let network = MemoryNetwork::new();
//! let a = network.bind(EntityName::storage(0), MemoryTransportConfig::member());
//! let b = network.bind(EntityName::storage(1), MemoryTransportConfig::member());
//!
//! let conn = a.get_connection(&b.my_instance()).unwrap();
//! conn.send_message(Message::user(1, Bytes::from_static(b"ping")))?;
//! ```

pub mod config;
pub mod network;
pub mod transport;

pub use config::{MemoryTransportConfig, MemoryTransportStats};
pub use network::{MemoryNetwork, BASE_PORT};
pub use transport::{MemoryConnection, MemoryTransport};
