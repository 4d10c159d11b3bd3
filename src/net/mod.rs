//! Connection layer: socket primitives, TLS client setup and the keyed
//! connection pool that reuses both across probes.

pub mod pool;
pub mod socket;
pub mod tls;

pub use pool::{ConnectionPool, PoolConfig, PoolLease, PoolStats};
pub use socket::{connect_tcp, upgrade_to_tls, SocketError, Transport};
pub use tls::{insecure_connector, server_name};
