//! Keyed pool of live TCP/TLS connections.
//!
//! One entry per endpoint. An entry is a `tokio::sync::Mutex` around the
//! connection; holding its owned guard is the caller's lease, so a connection
//! is used by at most one probe at a time and the sweeper can never close a
//! connection that is in use (it only `try_lock`s). The map itself sits
//! behind a `parking_lot::Mutex` that is never held across an await.
//!
//! A miss inserts a locked placeholder before dialing, so concurrent
//! acquirers of the same endpoint wait for that dial instead of opening a
//! second socket. A placeholder left without a transport (failed or
//! cancelled dial) is dead: whoever finds it next drops it and dials fresh.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::ServerName;
use tokio_rustls::TlsConnector;

use super::socket::{connect_tcp, upgrade_to_tls, SocketError, Transport};
use super::tls::{insecure_connector, server_name};
use crate::Endpoint;

type Slot = Arc<Mutex<PooledConnection>>;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Pool sizing, lifetimes and socket timeouts.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of entries before a forced cleanup.
    pub capacity: usize,
    /// Entries unused for longer than this are closed by cleanup.
    pub idle_timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// TLS handshake timeout.
    pub tls_timeout: Duration,
    /// SNI host presented during TLS handshakes.
    pub server_name: String,
    /// Period of the background idle sweep.
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_millis(2000),
            tls_timeout: Duration::from_millis(2000),
            server_name: "speed.cloudflare.com".to_string(),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Statistics
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    created: AtomicU64,
    closed: AtomicU64,
    errors: AtomicU64,
    tls_upgrades: AtomicU64,
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// Snapshot of the pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Acquires served by an existing connection.
    pub hits: u64,
    /// Acquires that had to dial.
    pub misses: u64,
    /// Connections successfully established.
    pub created: u64,
    /// Connections closed by cleanup, eviction or shutdown.
    pub closed: u64,
    /// Acquires that failed to connect or handshake.
    pub errors: u64,
    /// TLS handshakes performed (on new or reused sockets).
    pub tls_upgrades: u64,
    /// Entries in the pool when the snapshot was taken.
    pub size: usize,
}

impl PoolStats {
    /// Hit rate in percent; 0 before the first acquire.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64 * 100.0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connections and leases
// ─────────────────────────────────────────────────────────────────────────────

/// A pooled connection to one endpoint.
#[derive(Debug)]
pub struct PooledConnection {
    endpoint: Endpoint,
    id: u64,
    transport: Option<Transport>,
    last_used: Instant,
    destroyed: bool,
}

impl PooledConnection {
    fn placeholder(endpoint: Endpoint, id: u64) -> Self {
        Self {
            endpoint,
            id,
            transport: None,
            last_used: Instant::now(),
            destroyed: false,
        }
    }

    fn is_live(&self) -> bool {
        !self.destroyed && self.transport.is_some()
    }

    fn is_tls(&self) -> bool {
        self.transport.as_ref().is_some_and(Transport::is_tls)
    }

    /// Drop both layers. Nothing here can fail.
    fn close(&mut self) {
        self.destroyed = true;
        self.transport = None;
    }
}

/// Exclusive use of a pooled connection.
///
/// Hand it back with [`ConnectionPool::release`] after a clean exchange or
/// [`ConnectionPool::evict`] when the stream is in an unknown state. A lease
/// that is simply dropped leaves the connection in the pool without
/// refreshing its idle timer.
#[derive(Debug)]
pub struct PoolLease {
    slot: Slot,
    conn: OwnedMutexGuard<PooledConnection>,
}

impl PoolLease {
    pub fn endpoint(&self) -> Endpoint {
        self.conn.endpoint
    }

    /// Identifies the underlying TCP socket. Unchanged by a TLS upgrade.
    pub fn connection_id(&self) -> u64 {
        self.conn.id
    }

    pub fn is_tls(&self) -> bool {
        self.conn.is_tls()
    }

    /// The byte stream to probe over.
    pub fn stream(&mut self) -> Option<&mut Transport> {
        self.conn.transport.as_mut()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pool
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sweep {
    /// Idle entries only.
    Idle,
    /// Idle entries, then longest-idle entries until within capacity.
    Capacity,
    /// Every entry not currently leased.
    All,
}

/// Keyed cache of live TCP/TLS connections.
pub struct ConnectionPool {
    config: PoolConfig,
    connector: TlsConnector,
    server_name: ServerName,
    entries: parking_lot::Mutex<HashMap<Endpoint, Slot>>,
    next_id: AtomicU64,
    stats: StatCounters,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("size", &self.len())
            .finish()
    }
}

impl ConnectionPool {
    /// Create an empty pool. Fails only if the configured SNI host is invalid.
    pub fn new(config: PoolConfig) -> Result<Self, SocketError> {
        let server_name = server_name(&config.server_name)?;
        Ok(Self {
            config,
            connector: insecure_connector(),
            server_name,
            entries: parking_lot::Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stats: StatCounters::default(),
            sweeper: parking_lot::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PoolStats {
        let s = &self.stats;
        PoolStats {
            hits: s.hits.load(Ordering::Relaxed),
            misses: s.misses.load(Ordering::Relaxed),
            created: s.created.load(Ordering::Relaxed),
            closed: s.closed.load(Ordering::Relaxed),
            errors: s.errors.load(Ordering::Relaxed),
            tls_upgrades: s.tls_upgrades.load(Ordering::Relaxed),
            size: self.len(),
        }
    }

    /// Lease a connection to `endpoint`, dialing if none is pooled and
    /// upgrading to TLS if `require_tls` and the pooled one is plain.
    ///
    /// Callers should bound this with their own ceiling timeout; the TCP and
    /// TLS timeouts inside only cover the individual socket operations.
    pub async fn acquire(
        &self,
        endpoint: &Endpoint,
        require_tls: bool,
    ) -> Result<PoolLease, SocketError> {
        loop {
            let (slot, reserved) = self.lookup_or_reserve(endpoint);
            if let Some(conn) = reserved {
                bump(&self.stats.misses, 1);
                return self.establish(slot, conn, require_tls).await;
            }

            let mut conn = slot.clone().lock_owned().await;
            if !conn.is_live() {
                // Closed by a sweep or left behind by a failed dial.
                drop(conn);
                self.forget(endpoint, &slot);
                continue;
            }

            bump(&self.stats.hits, 1);
            conn.last_used = Instant::now();

            if require_tls && !conn.is_tls() {
                if let Err(e) = self.upgrade_in_place(&mut conn).await {
                    // The socket is in an unknown state after a failed
                    // handshake; never keep it.
                    bump(&self.stats.errors, 1);
                    bump(&self.stats.closed, 1);
                    conn.close();
                    drop(conn);
                    self.forget(endpoint, &slot);
                    tracing::debug!(endpoint = %endpoint, error = %e, "TLS upgrade of pooled connection failed");
                    return Err(e);
                }
            }

            return Ok(PoolLease { slot, conn });
        }
    }

    /// Return a lease after a clean exchange. The socket stays open.
    pub fn release(&self, mut lease: PoolLease) {
        lease.conn.last_used = Instant::now();
        let endpoint = lease.conn.endpoint;
        let still_pooled = self
            .entries
            .lock()
            .get(&endpoint)
            .is_some_and(|slot| Arc::ptr_eq(slot, &lease.slot));
        if !still_pooled && lease.conn.is_live() {
            // Replaced or forgotten while leased; nothing owns it now.
            lease.conn.close();
            bump(&self.stats.closed, 1);
        }
    }

    /// Close a leased connection and remove it from the pool.
    pub fn evict(&self, mut lease: PoolLease) {
        let endpoint = lease.conn.endpoint;
        if lease.conn.is_live() {
            bump(&self.stats.closed, 1);
        }
        lease.conn.close();
        let PoolLease { slot, conn } = lease;
        drop(conn);
        self.forget(&endpoint, &slot);
    }

    /// Close idle entries; with `force`, also the longest-idle entries until
    /// the pool is within capacity. Returns the number of connections closed.
    pub fn cleanup(&self, force: bool) -> usize {
        self.sweep(if force { Sweep::Capacity } else { Sweep::Idle })
    }

    /// Stop the background sweeper, close every idle connection and return
    /// the final counters.
    pub fn shutdown(&self) -> PoolStats {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        let closed = self.sweep(Sweep::All);
        tracing::debug!(closed, "connection pool shut down");
        self.stats()
    }

    /// Start the periodic idle sweep. Replaces a previously started one.
    ///
    /// The task holds only a weak reference and ends when the pool is
    /// dropped or shut down.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let pool: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(strong) = pool.upgrade() else {
                    return;
                };
                let before = strong.len();
                let closed = strong.cleanup(false);
                if closed > 0 {
                    tracing::info!(before, after = strong.len(), closed, "pool sweep closed idle connections");
                }
            }
        });
        if let Some(old) = self.sweeper.lock().replace(handle) {
            old.abort();
        }
    }

    // ── internals ────────────────────────────────────────────────────────

    /// Find the entry for `endpoint`, or insert a locked placeholder and
    /// return its guard alongside it.
    fn lookup_or_reserve(
        &self,
        endpoint: &Endpoint,
    ) -> (Slot, Option<OwnedMutexGuard<PooledConnection>>) {
        let mut entries = self.entries.lock();
        if let Some(slot) = entries.get(endpoint) {
            return (slot.clone(), None);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot: Slot = Arc::new(Mutex::new(PooledConnection::placeholder(*endpoint, id)));
        // A fresh mutex is always free.
        let guard = slot.clone().try_lock_owned().ok();
        entries.insert(*endpoint, slot.clone());
        (slot, guard)
    }

    /// Remove `slot` from the map if it is still the entry for `endpoint`.
    fn forget(&self, endpoint: &Endpoint, slot: &Slot) {
        let mut entries = self.entries.lock();
        if entries.get(endpoint).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            entries.remove(endpoint);
        }
    }

    async fn establish(
        &self,
        slot: Slot,
        mut conn: OwnedMutexGuard<PooledConnection>,
        require_tls: bool,
    ) -> Result<PoolLease, SocketError> {
        let endpoint = conn.endpoint;
        let result = match connect_tcp(&endpoint, self.config.connect_timeout).await {
            Ok(tcp) => {
                conn.transport = Some(Transport::Tcp(tcp));
                if require_tls {
                    self.upgrade_in_place(&mut conn).await
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            bump(&self.stats.errors, 1);
            conn.close();
            drop(conn);
            self.forget(&endpoint, &slot);
            return Err(e);
        }

        bump(&self.stats.created, 1);
        conn.last_used = Instant::now();
        let lease = PoolLease { slot, conn };

        if self.len() > self.config.capacity {
            let closed = self.cleanup(true);
            tracing::debug!(closed, size = self.len(), "pool over capacity, forced cleanup");
        }
        Ok(lease)
    }

    /// Layer TLS over the connection's TCP stream. A no-op if already TLS.
    async fn upgrade_in_place(&self, conn: &mut PooledConnection) -> Result<(), SocketError> {
        let tcp = match conn.transport.take() {
            Some(Transport::Tcp(tcp)) => tcp,
            Some(tls @ Transport::Tls(_)) => {
                conn.transport = Some(tls);
                return Ok(());
            }
            None => return Err(SocketError::Handshake("connection has no transport".to_string())),
        };
        let tls = upgrade_to_tls(&self.connector, tcp, &self.server_name, self.config.tls_timeout).await?;
        bump(&self.stats.tls_upgrades, 1);
        conn.transport = Some(Transport::Tls(Box::new(tls)));
        Ok(())
    }

    fn sweep(&self, mode: Sweep) -> usize {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;
        let mut closed = 0usize;
        let mut survivors: Vec<(Endpoint, Instant)> = Vec::new();

        let mut entries = self.entries.lock();
        entries.retain(|endpoint, slot| {
            // Leased entries are in use: never idle, never evicted.
            let Ok(mut conn) = slot.try_lock() else {
                return true;
            };
            if !conn.is_live() {
                conn.close();
                return false;
            }
            let idle = now.saturating_duration_since(conn.last_used) > idle_timeout;
            if idle || mode == Sweep::All {
                conn.close();
                closed += 1;
                return false;
            }
            survivors.push((*endpoint, conn.last_used));
            true
        });

        if mode == Sweep::Capacity && entries.len() > self.config.capacity {
            survivors.sort_by_key(|(_, last_used)| *last_used);
            let mut overflow = entries.len() - self.config.capacity;
            for (endpoint, _) in survivors {
                if overflow == 0 {
                    break;
                }
                let evicted = entries
                    .get(&endpoint)
                    .is_some_and(|slot| slot.try_lock().map(|mut conn| conn.close()).is_ok());
                if evicted {
                    entries.remove(&endpoint);
                    closed += 1;
                    overflow -= 1;
                }
            }
        }
        drop(entries);

        bump(&self.stats.closed, closed as u64);
        closed
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ok_response, spawn_server, Script};
    use std::net::{IpAddr, Ipv4Addr};

    fn test_config() -> PoolConfig {
        PoolConfig {
            server_name: "localhost".to_string(),
            connect_timeout: Duration::from_secs(2),
            tls_timeout: Duration::from_secs(2),
            ..PoolConfig::default()
        }
    }

    fn respond_ok() -> Script {
        Script::Respond(vec![ok_response("ok")])
    }

    #[test]
    fn test_pool_config_defaults() {
        let cfg = PoolConfig::default();
        assert_eq!(cfg.capacity, 500);
        assert_eq!(cfg.idle_timeout, Duration::from_secs(30));
        assert_eq!(cfg.connect_timeout, Duration::from_millis(2000));
        assert_eq!(cfg.tls_timeout, Duration::from_millis(2000));
        assert_eq!(cfg.server_name, "speed.cloudflare.com");
    }

    #[test]
    fn test_pool_rejects_invalid_server_name() {
        let cfg = PoolConfig {
            server_name: "bad host".to_string(),
            ..PoolConfig::default()
        };
        assert!(ConnectionPool::new(cfg).is_err());
    }

    #[test]
    fn test_hit_rate() {
        let stats = PoolStats {
            hits: 3,
            misses: 1,
            ..PoolStats::default()
        };
        assert_eq!(stats.hit_rate(), 75.0);
        assert_eq!(PoolStats::default().hit_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_second_acquire_is_hit_without_new_connect() {
        let server = spawn_server(respond_ok(), false).await;
        let pool = ConnectionPool::new(test_config()).unwrap();

        let lease = pool.acquire(&server.endpoint, false).await.unwrap();
        let first_id = lease.connection_id();
        pool.release(lease);

        let lease = pool.acquire(&server.endpoint, false).await.unwrap();
        assert_eq!(lease.connection_id(), first_id);
        pool.release(lease);

        let stats = pool.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.created, 1);
        assert_eq!(stats.size, 1);
        assert_eq!(server.wait_accepted(1).await, 1);
    }

    #[tokio::test]
    async fn test_tls_required_after_plain_hit_upgrades_once() {
        let server = spawn_server(respond_ok(), true).await;
        let pool = ConnectionPool::new(test_config()).unwrap();

        let lease = pool.acquire(&server.endpoint, false).await.unwrap();
        assert!(!lease.is_tls());
        let tcp_id = lease.connection_id();
        let local_addr = lease.conn.transport.as_ref().unwrap().tcp().local_addr().unwrap();
        pool.release(lease);

        let lease = pool.acquire(&server.endpoint, true).await.unwrap();
        assert!(lease.is_tls());
        assert_eq!(lease.connection_id(), tcp_id);
        let upgraded_addr = lease.conn.transport.as_ref().unwrap().tcp().local_addr().unwrap();
        assert_eq!(upgraded_addr, local_addr, "TLS must layer over the same socket");
        pool.release(lease);

        // Already TLS: no further handshake.
        let lease = pool.acquire(&server.endpoint, true).await.unwrap();
        pool.release(lease);

        let stats = pool.stats();
        assert_eq!(stats.tls_upgrades, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(server.wait_accepted(1).await, 1);
    }

    #[tokio::test]
    async fn test_miss_with_tls_handshakes_on_new_socket() {
        let server = spawn_server(respond_ok(), true).await;
        let pool = ConnectionPool::new(test_config()).unwrap();

        let lease = pool.acquire(&server.endpoint, true).await.unwrap();
        assert!(lease.is_tls());
        pool.release(lease);

        let stats = pool.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.tls_upgrades, 1);
        assert_eq!(stats.created, 1);
    }

    #[tokio::test]
    async fn test_failed_upgrade_on_hit_evicts_entry() {
        // Plain server that talks first: any ClientHello gets garbage back.
        let server = spawn_server(Script::Greet(b"SSH-2.0-OpenSSH_9.0\r\n".to_vec()), false).await;
        let pool = ConnectionPool::new(test_config()).unwrap();

        let lease = pool.acquire(&server.endpoint, false).await.unwrap();
        pool.release(lease);
        assert_eq!(pool.len(), 1);

        let err = pool.acquire(&server.endpoint, true).await.unwrap_err();
        assert!(err.is_handshake(), "got {err:?}");
        assert_eq!(pool.len(), 0, "failed upgrade must not keep the socket");

        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.closed, 1);

        // Next acquire dials again.
        let lease = pool.acquire(&server.endpoint, false).await.unwrap();
        pool.release(lease);
        assert_eq!(pool.stats().misses, 2);
        assert_eq!(server.wait_accepted(2).await, 2);
    }

    #[tokio::test]
    async fn test_connect_failure_counts_miss_and_error() {
        let port = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let endpoint = Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let pool = ConnectionPool::new(test_config()).unwrap();

        let err = pool.acquire(&endpoint, false).await.unwrap_err();
        assert!(matches!(err, SocketError::ConnectRefused(_)));
        let stats = pool.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.created, 0);
        assert!(pool.is_empty(), "failed dial must not leave a placeholder");
    }

    #[tokio::test]
    async fn test_concurrent_acquires_share_one_dial() {
        let server = spawn_server(respond_ok(), false).await;
        let pool = Arc::new(ConnectionPool::new(test_config()).unwrap());

        let first = {
            let pool = pool.clone();
            let ep = server.endpoint;
            tokio::spawn(async move {
                let lease = pool.acquire(&ep, false).await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
                let id = lease.connection_id();
                pool.release(lease);
                id
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = pool.acquire(&server.endpoint, false).await.unwrap();
        let second_id = second.connection_id();
        pool.release(second);

        assert_eq!(first.await.unwrap(), second_id);
        let stats = pool.stats();
        assert_eq!(stats.hits + stats.misses, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(server.wait_accepted(1).await, 1);
    }

    #[tokio::test]
    async fn test_evict_then_acquire_is_miss() {
        let server = spawn_server(respond_ok(), false).await;
        let pool = ConnectionPool::new(test_config()).unwrap();

        let lease = pool.acquire(&server.endpoint, false).await.unwrap();
        let id = lease.connection_id();
        pool.evict(lease);
        assert!(pool.is_empty());

        let lease = pool.acquire(&server.endpoint, false).await.unwrap();
        assert_ne!(lease.connection_id(), id);
        pool.release(lease);

        let stats = pool.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.closed, 1);
        assert_eq!(server.wait_accepted(2).await, 2);
    }

    #[tokio::test]
    async fn test_cleanup_closes_idle_entries() {
        let server = spawn_server(respond_ok(), false).await;
        let pool = ConnectionPool::new(PoolConfig {
            idle_timeout: Duration::from_millis(50),
            ..test_config()
        })
        .unwrap();

        let lease = pool.acquire(&server.endpoint, false).await.unwrap();
        pool.release(lease);
        assert_eq!(pool.cleanup(false), 0, "fresh entry is not idle");

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(pool.cleanup(false), 1);
        assert!(pool.is_empty());
        assert_eq!(pool.stats().closed, 1);
    }

    #[tokio::test]
    async fn test_cleanup_skips_leased_entries() {
        let server = spawn_server(respond_ok(), false).await;
        let pool = ConnectionPool::new(PoolConfig {
            idle_timeout: Duration::from_millis(1),
            ..test_config()
        })
        .unwrap();

        let lease = pool.acquire(&server.endpoint, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.cleanup(true), 0);
        assert_eq!(pool.shutdown().closed, 0);
        assert_eq!(pool.len(), 1);
        pool.release(lease);
    }

    #[tokio::test]
    async fn test_capacity_overflow_evicts_longest_idle() {
        let servers = vec![
            spawn_server(respond_ok(), false).await,
            spawn_server(respond_ok(), false).await,
            spawn_server(respond_ok(), false).await,
        ];
        let pool = ConnectionPool::new(PoolConfig {
            capacity: 2,
            ..test_config()
        })
        .unwrap();

        for server in &servers {
            let lease = pool.acquire(&server.endpoint, false).await.unwrap();
            pool.release(lease);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(pool.len(), 2, "forced cleanup must restore capacity");
        assert_eq!(pool.stats().closed, 1);

        // The oldest entry went; the newer two are still hits.
        let lease = pool.acquire(&servers[2].endpoint, false).await.unwrap();
        pool.release(lease);
        let lease = pool.acquire(&servers[1].endpoint, false).await.unwrap();
        pool.release(lease);
        assert_eq!(pool.stats().hits, 2);
        assert_eq!(servers[0].wait_accepted(1).await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let a = spawn_server(respond_ok(), false).await;
        let b = spawn_server(respond_ok(), false).await;
        let pool = Arc::new(ConnectionPool::new(test_config()).unwrap());
        pool.spawn_sweeper();

        for ep in [a.endpoint, b.endpoint] {
            let lease = pool.acquire(&ep, false).await.unwrap();
            pool.release(lease);
        }
        let stats = pool.shutdown();
        assert_eq!(stats.closed, 2);
        assert_eq!(stats.created, 2);
        assert_eq!(stats.size, 0);
    }

    #[tokio::test]
    async fn test_sweeper_closes_idle_in_background() {
        let server = spawn_server(respond_ok(), false).await;
        let pool = Arc::new(
            ConnectionPool::new(PoolConfig {
                idle_timeout: Duration::from_millis(20),
                sweep_interval: Duration::from_millis(30),
                ..test_config()
            })
            .unwrap(),
        );
        pool.spawn_sweeper();

        let lease = pool.acquire(&server.endpoint, false).await.unwrap();
        pool.release(lease);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(pool.is_empty());

        // A sweep racing the key just means the next acquire re-dials.
        let lease = pool.acquire(&server.endpoint, false).await.unwrap();
        pool.release(lease);
        assert_eq!(pool.stats().misses, 2);
        pool.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cleanup_racing_acquire_yields_live_connection() {
        use crate::probe::http::probe;
        use std::sync::atomic::AtomicBool;

        let server = spawn_server(respond_ok(), false).await;
        let pool = Arc::new(
            ConnectionPool::new(PoolConfig {
                idle_timeout: Duration::ZERO,
                ..test_config()
            })
            .unwrap(),
        );

        // Every unleased entry is idle, so this closes whatever it can lock.
        let stop = Arc::new(AtomicBool::new(false));
        let sweeper = {
            let (pool, stop) = (pool.clone(), stop.clone());
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    pool.cleanup(false);
                    std::thread::yield_now();
                }
            })
        };

        const ROUNDS: u64 = 40;
        for _ in 0..ROUNDS {
            let mut lease = pool.acquire(&server.endpoint, false).await.unwrap();
            let stream = lease.stream().expect("leased connection must be live");
            let body = probe(stream, "localhost", "/", Duration::from_secs(2))
                .await
                .unwrap();
            assert_eq!(body, "ok");
            pool.release(lease);
        }

        stop.store(true, Ordering::Relaxed);
        sweeper.join().unwrap();

        let stats = pool.stats();
        assert_eq!(stats.hits + stats.misses, ROUNDS);
        assert_eq!(stats.created, stats.misses);
        assert_eq!(stats.errors, 0);
        let created = stats.created as usize;
        assert_eq!(server.wait_accepted(created).await, created);
    }
}
