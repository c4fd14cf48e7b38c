//! Connection pooling for outbound sockets.
//!
//! A [`Pool`] caches ready-to-use connections for one destination address.
//! Borrowing hands out a [`Pooled`] guard; dropping the guard returns the
//! connection to the idle set unless it was marked broken, in which case it
//! is destroyed so the next borrower never sees it.
//!
//! The [`PoolRegistry`] owns one pool per address for a transport instance.

use crate::context::Context;
use crate::error::{Result, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Creates, probes and tears down the connections held by a [`Pool`].
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    /// The pooled connection type.
    type Connection: Send + 'static;

    /// Open a new connection.
    async fn create(&self) -> Result<Self::Connection>;

    /// Liveness probe run before an idle connection is handed out.
    ///
    /// The default trusts idle connections without checking them.
    async fn is_valid(&self, _conn: &mut Self::Connection) -> Result<()> {
        Ok(())
    }

    /// Cheap synchronous check run when a connection is returned.
    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }

    /// Tear a connection down.
    fn destroy(&self, conn: Self::Connection) {
        drop(conn);
    }
}

/// Configuration for connection pooling.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum live connections (idle plus borrowed).
    pub max_size: usize,
    /// Warm connections the pool keeps ready.
    pub min_idle: usize,
    /// Idle connections older than this are destroyed.
    pub idle_timeout: Duration,
    /// How long a borrower may wait for capacity. `None` waits forever
    /// (still subject to the caller's context).
    pub acquire_timeout: Option<Duration>,
    /// How often idle connections are swept.
    pub reap_interval: Duration,
    /// Run the manager's liveness probe before reusing an idle connection.
    pub test_on_borrow: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_idle: 0,
            idle_timeout: Duration::from_secs(300),
            acquire_timeout: None,
            reap_interval: Duration::from_secs(10),
            test_on_borrow: true,
        }
    }
}

impl PoolConfig {
    /// Set the maximum number of live connections.
    #[must_use]
    pub const fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the number of warm connections.
    #[must_use]
    pub const fn with_min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = min_idle;
        self
    }

    /// Set the idle eviction timeout.
    #[must_use]
    pub const fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Bound how long a borrower waits for capacity.
    #[must_use]
    pub const fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Set the idle sweep interval.
    #[must_use]
    pub const fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Enable or disable the liveness probe on borrow.
    #[must_use]
    pub const fn with_test_on_borrow(mut self, enabled: bool) -> Self {
        self.test_on_borrow = enabled;
        self
    }
}

/// Point-in-time counters for a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections currently alive (idle, borrowed, or being created).
    pub live: usize,
    /// Connections sitting in the idle set.
    pub idle: usize,
    /// Connections ever created by the manager.
    pub created: u64,
    /// Connections ever destroyed.
    pub destroyed: u64,
    /// Configured capacity.
    pub max_size: usize,
}

struct Idle<C> {
    conn: C,
    since: Instant,
}

struct State<C> {
    idle: VecDeque<Idle<C>>,
    live: usize,
    last_active: Instant,
}

struct Shared<M: Manager> {
    addr: String,
    config: PoolConfig,
    manager: M,
    state: Mutex<State<M::Connection>>,
    semaphore: Arc<Semaphore>,
    idle_available: Notify,
    created: AtomicU64,
    destroyed: AtomicU64,
    shutdown: CancellationToken,
}

enum Checkout<C> {
    Reuse(C),
    Create,
    Wait,
}

impl<M: Manager> Shared<M> {
    fn push_idle(&self, conn: M::Connection) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.last_active = now;
        state.idle.push_back(Idle { conn, since: now });
        drop(state);
        self.idle_available.notify_one();
    }

    fn discard(&self, conn: M::Connection) {
        {
            let mut state = self.state.lock();
            state.live = state.live.saturating_sub(1);
        }
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        self.manager.destroy(conn);
        // A waiter blocked on capacity may now create.
        self.idle_available.notify_one();
    }

    fn release_reservation(&self) {
        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(1);
        drop(state);
        self.idle_available.notify_one();
    }

    fn checkout(&self) -> Checkout<M::Connection> {
        let mut state = self.state.lock();
        state.last_active = Instant::now();
        if let Some(idle) = state.idle.pop_back() {
            return Checkout::Reuse(idle.conn);
        }
        if state.live < self.config.max_size {
            state.live += 1;
            return Checkout::Create;
        }
        Checkout::Wait
    }

    fn evict_expired(&self) {
        let expired: Vec<M::Connection> = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let (stale, fresh): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|idle| now.duration_since(idle.since) >= self.config.idle_timeout);
            state.idle = fresh;
            state.live = state.live.saturating_sub(stale.len());
            stale.into_iter().map(|idle| idle.conn).collect()
        };

        if !expired.is_empty() {
            debug!(
                "Evicting {} idle connection(s) to {}",
                expired.len(),
                self.addr
            );
        }
        for conn in expired {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
            self.manager.destroy(conn);
        }
    }

    async fn replenish(self: &Arc<Self>) {
        loop {
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                return;
            };

            {
                let mut state = self.state.lock();
                if state.live >= self.config.min_idle || state.live >= self.config.max_size {
                    return;
                }
                state.live += 1;
            }

            let reservation = Reservation::new(self);
            match self.manager.create().await {
                Ok(conn) => {
                    reservation.commit();
                    self.created.fetch_add(1, Ordering::Relaxed);
                    self.push_idle(conn);
                }
                Err(e) => {
                    warn!("Failed to create warm connection to {}: {}", self.addr, e);
                    return;
                }
            }
            drop(permit);
        }
    }
}

impl<M: Manager> Drop for Shared<M> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Undoes a `live` reservation unless the connection was actually created.
///
/// Covers both a failed `create` and a caller that drops the borrow future
/// mid-connect.
struct Reservation<'a, M: Manager> {
    shared: &'a Shared<M>,
    committed: bool,
}

impl<'a, M: Manager> Reservation<'a, M> {
    const fn new(shared: &'a Shared<M>) -> Self {
        Self {
            shared,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl<M: Manager> Drop for Reservation<'_, M> {
    fn drop(&mut self) {
        if !self.committed {
            self.shared.release_reservation();
        }
    }
}

/// A bounded cache of connections to one address.
pub struct Pool<M: Manager> {
    shared: Arc<Shared<M>>,
}

impl<M: Manager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: Manager> fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("addr", &self.shared.addr)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<M: Manager> Pool<M> {
    /// Create a pool and start its idle reaper.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(addr: impl Into<String>, manager: M, mut config: PoolConfig) -> Self {
        config.max_size = config.max_size.max(1);
        config.min_idle = config.min_idle.min(config.max_size);

        let shared = Arc::new(Shared {
            addr: addr.into(),
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            config,
            manager,
            state: Mutex::new(State {
                idle: VecDeque::new(),
                live: 0,
                last_active: Instant::now(),
            }),
            idle_available: Notify::new(),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&shared);
        let shutdown = shared.shutdown.clone();
        let interval = shared.config.reap_interval;
        tokio::spawn(reap_loop(weak, shutdown, interval));

        Self { shared }
    }

    /// Destination address served by this pool.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.shared.addr
    }

    /// The manager that creates this pool's connections.
    #[must_use]
    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    /// Current counters.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let (live, idle) = {
            let state = self.shared.state.lock();
            (state.live, state.idle.len())
        };
        PoolStatus {
            live,
            idle,
            created: self.shared.created.load(Ordering::Relaxed),
            destroyed: self.shared.destroyed.load(Ordering::Relaxed),
            max_size: self.shared.config.max_size,
        }
    }

    /// Whether the pool has held no connection and seen no borrower for a
    /// full idle timeout.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        let state = self.shared.state.lock();
        state.live == 0
            && state.idle.is_empty()
            && state.last_active.elapsed() >= self.shared.config.idle_timeout
    }

    fn touch(&self) {
        self.shared.state.lock().last_active = Instant::now();
    }

    /// Borrow a connection, waiting for capacity if the pool is full.
    ///
    /// # Errors
    ///
    /// Returns the manager's connect error, `PoolTimeout` when the configured
    /// acquire timeout elapses, `PoolClosed` after [`Pool::close`], or the
    /// context's cancellation error.
    pub async fn get(&self, ctx: &Context) -> Result<Pooled<M>> {
        match self.shared.config.acquire_timeout {
            Some(limit) => {
                ctx.run(async {
                    tokio::time::timeout(limit, self.acquire())
                        .await
                        .map_err(|_| TransportError::PoolTimeout(limit))?
                })
                .await
            }
            None => ctx.run(self.acquire()).await,
        }
    }

    async fn acquire(&self) -> Result<Pooled<M>> {
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            return Err(TransportError::PoolClosed);
        }

        let permit = tokio::select! {
            permit = Arc::clone(&shared.semaphore).acquire_owned() => {
                permit.map_err(|_| TransportError::PoolClosed)?
            }
            () = shared.shutdown.cancelled() => return Err(TransportError::PoolClosed),
        };

        let mut permit = permit;
        loop {
            match shared.checkout() {
                Checkout::Reuse(conn) => {
                    let mut pooled = Pooled::new(conn, Arc::clone(shared), permit);
                    if !shared.config.test_on_borrow {
                        return Ok(pooled);
                    }
                    match shared.manager.is_valid(&mut *pooled).await {
                        Ok(()) => return Ok(pooled),
                        Err(e) => {
                            debug!("Discarding stale connection to {}: {}", shared.addr, e);
                            permit = pooled.discard_keep_permit();
                        }
                    }
                }
                Checkout::Create => {
                    let reservation = Reservation::new(shared);
                    let conn = shared.manager.create().await?;
                    reservation.commit();
                    shared.created.fetch_add(1, Ordering::Relaxed);
                    debug!("Created new connection to {}", shared.addr);
                    return Ok(Pooled::new(conn, Arc::clone(shared), permit));
                }
                Checkout::Wait => {
                    tokio::select! {
                        () = shared.idle_available.notified() => {}
                        () = shared.shutdown.cancelled() => return Err(TransportError::PoolClosed),
                    }
                }
            }
        }
    }

    /// Destroy idle connections and refuse further borrows. Borrowed
    /// connections are destroyed as they come back.
    pub fn close(&self) {
        let shared = &self.shared;
        shared.shutdown.cancel();
        shared.semaphore.close();

        let idle: Vec<M::Connection> = {
            let mut state = shared.state.lock();
            let drained: Vec<_> = state.idle.drain(..).map(|idle| idle.conn).collect();
            state.live = state.live.saturating_sub(drained.len());
            drained
        };
        for conn in idle {
            shared.destroyed.fetch_add(1, Ordering::Relaxed);
            shared.manager.destroy(conn);
        }

        info!("Closed connection pool for {}", shared.addr);
    }
}

async fn reap_loop<M: Manager>(
    shared: Weak<Shared<M>>,
    shutdown: CancellationToken,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.evict_expired();
        shared.replenish().await;
    }
}

/// A borrowed connection.
///
/// Dropping the guard returns the connection to its pool. Call
/// [`Pooled::mark_broken`] (or [`Pooled::discard`]) after a failure so the
/// connection is destroyed instead.
pub struct Pooled<M: Manager> {
    conn: Option<M::Connection>,
    shared: Arc<Shared<M>>,
    broken: bool,
    permit: Option<OwnedSemaphorePermit>,
}

impl<M: Manager> Pooled<M> {
    fn new(conn: M::Connection, shared: Arc<Shared<M>>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn: Some(conn),
            shared,
            broken: false,
            permit: Some(permit),
        }
    }

    /// Flag the connection so it is destroyed instead of returned.
    pub const fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Whether the connection has been flagged as broken.
    #[must_use]
    pub const fn is_broken(&self) -> bool {
        self.broken
    }

    /// Return the connection to the pool.
    pub fn release(self) {
        drop(self);
    }

    /// Destroy the connection.
    pub fn discard(mut self) {
        self.broken = true;
        drop(self);
    }

    /// Address of the pool this connection belongs to.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.shared.addr
    }

    fn discard_keep_permit(mut self) -> OwnedSemaphorePermit {
        self.broken = true;
        let permit = self.permit.take();
        drop(self);
        // `permit` is only taken here and in `Drop`, so it is still present.
        permit.unwrap_or_else(|| unreachable!("pooled connection lost its permit"))
    }
}

impl<M: Manager> Deref for Pooled<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .unwrap_or_else(|| unreachable!("pooled connection taken before drop"))
    }
}

impl<M: Manager> DerefMut for Pooled<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .unwrap_or_else(|| unreachable!("pooled connection taken before drop"))
    }
}

impl<M: Manager> Drop for Pooled<M> {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };

        let shared = &self.shared;
        if self.broken || shared.shutdown.is_cancelled() || shared.manager.has_broken(&mut conn) {
            debug!("Destroying connection to {}", shared.addr);
            shared.discard(conn);
        } else {
            shared.push_idle(conn);
        }
        // The permit goes last so a waiter that wakes up finds the idle entry.
        drop(self.permit.take());
    }
}

/// One pool per destination address, owned by a transport instance.
///
/// Pool creation is serialized by an async dial mutex so two concurrent first
/// dials to the same address never build duplicate pools. Borrowing from a
/// pool happens outside that lock.
pub struct PoolRegistry<M: Manager> {
    config: PoolConfig,
    pools: tokio::sync::Mutex<HashMap<String, Pool<M>>>,
}

impl<M: Manager> fmt::Debug for PoolRegistry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<M: Manager> PoolRegistry<M> {
    /// Create an empty registry whose pools share `config`.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            pools: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Configuration applied to new pools.
    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Fetch the pool for `addr`, building it with `make_manager` on first use.
    pub async fn get_or_create<F>(&self, addr: &str, make_manager: F) -> Pool<M>
    where
        F: FnOnce() -> M,
    {
        let mut pools = self.pools.lock().await;
        Self::prune_locked(&mut pools);
        if let Some(pool) = pools.get(addr) {
            pool.touch();
            return pool.clone();
        }

        let pool = Pool::new(addr, make_manager(), self.config.clone());
        pools.insert(addr.to_string(), pool.clone());
        info!("Created connection pool for {}", addr);
        pool
    }

    /// Close and forget pools that are empty and have gone unused for their
    /// idle timeout. Returns how many were removed.
    pub async fn prune(&self) -> usize {
        Self::prune_locked(&mut *self.pools.lock().await)
    }

    fn prune_locked(pools: &mut HashMap<String, Pool<M>>) -> usize {
        let before = pools.len();
        pools.retain(|addr, pool| {
            if pool.is_abandoned() {
                debug!("Dropping unused connection pool for {}", addr);
                pool.close();
                false
            } else {
                true
            }
        });
        before - pools.len()
    }

    /// The pool for `addr`, if one exists.
    pub async fn get(&self, addr: &str) -> Option<Pool<M>> {
        self.pools.lock().await.get(addr).cloned()
    }

    /// Close and forget every pool.
    pub async fn close_all(&self) {
        let pools: Vec<Pool<M>> = self.pools.lock().await.drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingManager {
        next_id: AtomicUsize,
        valid: std::sync::atomic::AtomicBool,
    }

    impl CountingManager {
        fn new() -> Self {
            Self {
                next_id: AtomicUsize::new(0),
                valid: std::sync::atomic::AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl Manager for CountingManager {
        type Connection = usize;

        async fn create(&self) -> Result<usize> {
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
        }

        async fn is_valid(&self, _conn: &mut usize) -> Result<()> {
            if self.valid.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(TransportError::ConnectionClosed)
            }
        }
    }

    fn pool(config: PoolConfig) -> Pool<CountingManager> {
        Pool::new("test:1", CountingManager::new(), config)
    }

    #[tokio::test]
    async fn test_reuses_returned_connection() {
        let pool = pool(PoolConfig::default());
        let ctx = Context::background();

        let first = pool.get(&ctx).await.unwrap();
        assert_eq!(*first, 0);
        first.release();

        let second = pool.get(&ctx).await.unwrap();
        assert_eq!(*second, 0);
        assert_eq!(pool.status().created, 1);
    }

    #[tokio::test]
    async fn test_broken_connection_is_destroyed() {
        let pool = pool(PoolConfig::default());
        let ctx = Context::background();

        let mut conn = pool.get(&ctx).await.unwrap();
        conn.mark_broken();
        drop(conn);

        let status = pool.status();
        assert_eq!(status.live, 0);
        assert_eq!(status.idle, 0);
        assert_eq!(status.destroyed, 1);

        let conn = pool.get(&ctx).await.unwrap();
        assert_eq!(*conn, 1);
    }

    #[tokio::test]
    async fn test_capacity_blocks_until_release() {
        let pool = pool(PoolConfig::default().with_max_size(2));
        let ctx = Context::background();

        let a = pool.get(&ctx).await.unwrap();
        let _b = pool.get(&ctx).await.unwrap();

        let short = ctx.with_timeout(Duration::from_millis(50));
        let blocked = pool.get(&short).await;
        assert!(matches!(blocked, Err(TransportError::DeadlineExceeded)));

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get(&Context::background()).await.map(|c| *c) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(a);
        let reused = waiter.await.unwrap().unwrap();
        assert_eq!(reused, 0);
        assert_eq!(pool.status().created, 2);
        assert!(pool.status().live <= 2);
    }

    #[tokio::test]
    async fn test_acquire_timeout() {
        let pool = pool(
            PoolConfig::default()
                .with_max_size(1)
                .with_acquire_timeout(Duration::from_millis(30)),
        );
        let ctx = Context::background();

        let _held = pool.get(&ctx).await.unwrap();
        let result = pool.get(&ctx).await;
        assert!(matches!(result, Err(TransportError::PoolTimeout(_))));
    }

    #[tokio::test]
    async fn test_cancelled_wait_keeps_accounting() {
        let pool = pool(PoolConfig::default().with_max_size(1));
        let ctx = Context::background();
        let held = pool.get(&ctx).await.unwrap();

        let cancelled = ctx.child();
        cancelled.cancel();
        let result = pool.get(&cancelled).await;
        assert!(matches!(result, Err(TransportError::Cancelled)));

        drop(held);
        assert_eq!(pool.status().live, 1);
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn test_failed_probe_replaces_connection() {
        let pool = pool(PoolConfig::default());
        let ctx = Context::background();

        pool.get(&ctx).await.unwrap().release();
        pool.manager().valid.store(false, Ordering::SeqCst);

        let conn = pool.get(&ctx).await.unwrap();
        assert_eq!(*conn, 1);
        let status = pool.status();
        assert_eq!(status.created, 2);
        assert_eq!(status.destroyed, 1);
        assert_eq!(status.live, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connections_are_evicted() {
        let pool = pool(
            PoolConfig::default()
                .with_idle_timeout(Duration::from_millis(100))
                .with_reap_interval(Duration::from_millis(25)),
        );
        let ctx = Context::background();

        pool.get(&ctx).await.unwrap().release();
        assert_eq!(pool.status().idle, 1);

        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = pool.status();
        assert_eq!(status.idle, 0);
        assert_eq!(status.live, 0);
        assert_eq!(status.destroyed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_idle_is_kept_warm() {
        let pool = pool(
            PoolConfig::default()
                .with_min_idle(2)
                .with_reap_interval(Duration::from_millis(10)),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = pool.status();
        assert_eq!(status.idle, 2);
        assert_eq!(status.created, 2);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_borrowers() {
        let pool = pool(PoolConfig::default());
        let ctx = Context::background();
        let held = pool.get(&ctx).await.unwrap();

        pool.close();
        assert!(matches!(pool.get(&ctx).await, Err(TransportError::PoolClosed)));

        drop(held);
        assert_eq!(pool.status().live, 0);
    }

    #[tokio::test]
    async fn test_registry_builds_one_pool_per_address() {
        let registry = PoolRegistry::new(PoolConfig::default());
        let built = AtomicUsize::new(0);

        let a = registry
            .get_or_create("a:1", || {
                built.fetch_add(1, Ordering::SeqCst);
                CountingManager::new()
            })
            .await;
        let again = registry
            .get_or_create("a:1", || {
                built.fetch_add(1, Ordering::SeqCst);
                CountingManager::new()
            })
            .await;
        registry
            .get_or_create("b:1", || {
                built.fetch_add(1, Ordering::SeqCst);
                CountingManager::new()
            })
            .await;

        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_eq!(a.addr(), again.addr());
        assert!(registry.get("b:1").await.is_some());

        registry.close_all().await;
        assert!(registry.get("a:1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_drops_abandoned_pools() {
        let registry = PoolRegistry::new(
            PoolConfig::default()
                .with_idle_timeout(Duration::from_millis(100))
                .with_reap_interval(Duration::from_millis(25)),
        );
        let ctx = Context::background();

        let unused = registry.get_or_create("a:1", CountingManager::new).await;
        unused.get(&ctx).await.unwrap().release();
        let busy = registry.get_or_create("b:1", CountingManager::new).await;
        let held = busy.get(&ctx).await.unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(unused.status().live, 0);

        assert_eq!(registry.prune().await, 1);
        assert!(registry.get("a:1").await.is_none());
        assert!(registry.get("b:1").await.is_some());
        assert!(matches!(unused.get(&ctx).await, Err(TransportError::PoolClosed)));

        drop(held);
    }
}
