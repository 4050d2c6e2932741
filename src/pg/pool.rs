//! Client pool.
//!
//! The pool lends out up to `max` [`Client`]s. A checkout takes an idle
//! client if there is one, opens a new one while under `max`, and otherwise
//! waits in line. Released clients go back to the idle set, where they expire
//! after `idle_timeout`; a client released with an error is closed instead.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, warn};

use super::client::Client;
use super::config::PgConfig;
use super::error::{PgError, PgResult};
use super::query::{Query, QueryResult};

/// Events buffered per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 64;

// ============================================================================
// Pool Configuration
// ============================================================================

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of clients, connecting, idle or lent out (default: 10)
    pub max: usize,
    /// Close idle clients after this long; `None` keeps them (default: 10s)
    pub idle_timeout: Option<Duration>,
    /// Limit on opening a client or waiting in line for one
    pub connection_timeout: Option<Duration>,
    /// Retire a client after this many checkouts
    pub max_uses: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max: 10,
            idle_timeout: Some(Duration::from_secs(10)),
            connection_timeout: None,
            max_uses: None,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of clients.
    pub fn max(mut self, max: usize) -> Self {
        self.max = max;
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    pub fn max_uses(mut self, uses: usize) -> Self {
        self.max_uses = Some(uses);
        self
    }
}

/// Lifecycle of pooled clients, by pool-assigned id.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A new client finished connecting.
    Connect { id: u64 },
    /// A client was lent out.
    Acquire { id: u64 },
    /// A client came back to the idle set.
    Release { id: u64 },
    /// A client was closed and forgotten.
    Remove { id: u64 },
    /// Opening a client failed.
    Error(Arc<PgError>),
}

// ============================================================================
// Pooled Client
// ============================================================================

/// A client checked out from the pool.
///
/// When dropped without an explicit release, the client is returned to the
/// pool as healthy.
pub struct PooledClient {
    client: Option<Client>,
    id: u64,
    uses: usize,
    pool: Arc<PoolInner>,
}

impl PooledClient {
    /// Pool-assigned id of the underlying client.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The client, until released.
    pub fn client(&self) -> Option<&Client> {
        self.client.as_ref()
    }

    /// Run a query and return its last result.
    pub async fn query(&self, query: impl Into<Query>) -> PgResult<QueryResult> {
        self.client
            .as_ref()
            .ok_or(PgError::ConnectionClosed)?
            .query(query)
            .await
    }

    /// Run a query and return one result per statement.
    pub async fn query_all(&self, query: impl Into<Query>) -> PgResult<Vec<QueryResult>> {
        self.client
            .as_ref()
            .ok_or(PgError::ConnectionClosed)?
            .query_all(query)
            .await
    }

    /// Give the client back for reuse.
    pub fn release(&mut self) -> PgResult<()> {
        self.release_inner(None)
    }

    /// Give the client back because it is broken; it is closed and removed.
    pub fn release_with_error(&mut self, err: &PgError) -> PgResult<()> {
        self.release_inner(Some(err))
    }

    fn release_inner(&mut self, err: Option<&PgError>) -> PgResult<()> {
        let client = self.client.take().ok_or_else(|| {
            PgError::Pool(
                "Release called on client which has already been released to the pool."
                    .to_string(),
            )
        })?;
        self.pool.put_back(self.id, client, self.uses, err);
        Ok(())
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.put_back(self.id, client, self.uses, None);
        }
    }
}

impl std::fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClient")
            .field("id", &self.id)
            .field("uses", &self.uses)
            .field("released", &self.client.is_none())
            .finish()
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

struct IdleClient {
    id: u64,
    client: Client,
    uses: usize,
    timer: Option<JoinHandle<()>>,
}

impl IdleClient {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// What a waiter in line is given.
enum Grant {
    Idle(IdleClient),
    /// Room to open a new client; already counted in `total`.
    Create,
}

/// A grant in transit. Dropped unclaimed, it goes back to the pool.
struct Lease {
    pool: Arc<PoolInner>,
    grant: Option<Grant>,
}

impl Lease {
    fn new(pool: &Arc<PoolInner>, grant: Grant) -> Self {
        Self {
            pool: pool.clone(),
            grant: Some(grant),
        }
    }

    fn take(&mut self) -> Option<Grant> {
        self.grant.take()
    }

    fn claim(mut self) -> PgResult<Grant> {
        self.take()
            .ok_or_else(|| PgError::Pool("Pool grant was already claimed".to_string()))
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(grant) = self.grant.take() else {
            return;
        };

        // The channel may drop a lease while this thread holds the state lock.
        if let Some(mut state) = self.pool.state.try_lock() {
            self.pool.restore(&mut state, grant);
            return;
        }

        let pool = self.pool.clone();
        let restore = move || {
            let mut state = pool.state.lock();
            pool.restore(&mut state, grant);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { restore() });
            }
            Err(_) => {
                std::thread::spawn(restore);
            }
        }
    }
}

type Waiter = oneshot::Sender<PgResult<Lease>>;

#[derive(Default)]
struct PoolState {
    /// Clients connecting, idle or lent out.
    total: usize,
    idle: VecDeque<IdleClient>,
    waiting: VecDeque<Waiter>,
    ending: bool,
    end_waiters: Vec<oneshot::Sender<()>>,
    next_id: u64,
}

/// Internal pool state.
struct PoolInner {
    pg: PgConfig,
    config: PoolConfig,
    state: Mutex<PoolState>,
    events: broadcast::Sender<PoolEvent>,
}

impl PoolInner {
    fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(event);
    }

    fn next_id(state: &mut PoolState) -> u64 {
        state.next_id += 1;
        state.next_id
    }

    /// Pop a usable idle client, forgetting any that died while idle.
    fn take_idle(&self, state: &mut PoolState) -> Option<IdleClient> {
        while let Some(mut idle) = state.idle.pop_front() {
            idle.disarm();
            if idle.client.is_queryable() {
                return Some(idle);
            }
            debug!(id = idle.id, "Dropping idle client that closed");
            state.total -= 1;
            self.emit(PoolEvent::Remove { id: idle.id });
        }
        None
    }

    fn hand_out(self: &Arc<Self>, idle: IdleClient) -> PooledClient {
        self.emit(PoolEvent::Acquire { id: idle.id });
        PooledClient {
            client: Some(idle.client),
            id: idle.id,
            uses: idle.uses + 1,
            pool: self.clone(),
        }
    }

    /// Open a client for a slot already counted in `total`.
    ///
    /// The connect task owns the slot: a failed connect frees it, and a
    /// client nobody is waiting for any more joins the idle set.
    fn spawn_connect(self: &Arc<Self>) -> oneshot::Receiver<PgResult<Lease>> {
        let (tx, rx) = oneshot::channel();
        let mut slot = Lease::new(self, Grant::Create);
        let inner = self.clone();

        tokio::spawn(async move {
            match Client::connect(inner.pg.clone()).await {
                Ok(client) => {
                    let id = Self::next_id(&mut inner.state.lock());
                    debug!(id, "Client connected");
                    inner.emit(PoolEvent::Connect { id });
                    slot.grant = Some(Grant::Idle(IdleClient {
                        id,
                        client,
                        uses: 0,
                        timer: None,
                    }));
                    let _ = tx.send(Ok(slot));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to open pooled client");
                    drop(slot);
                    inner.emit(PoolEvent::Error(Arc::new(e.duplicate())));
                    let _ = tx.send(Err(e));
                }
            }
        });

        rx
    }

    /// Wait for a grant and turn it into a lent client.
    ///
    /// Giving up at any point leaves the grant with the channel, whose
    /// lease then returns it to the pool.
    async fn wait_lease(
        self: &Arc<Self>,
        mut rx: oneshot::Receiver<PgResult<Lease>>,
    ) -> PgResult<PooledClient> {
        let deadline = self
            .config
            .connection_timeout
            .map(|limit| Instant::now() + limit);

        loop {
            let received = match deadline {
                Some(deadline) => timeout_at(deadline, &mut rx)
                    .await
                    .map_err(|_| PgError::ConnectTimeout)?,
                None => (&mut rx).await,
            };
            let lease = received.map_err(|_| {
                PgError::Pool("Connection attempt was abandoned".to_string())
            })??;

            match lease.claim()? {
                Grant::Idle(idle) => return Ok(self.hand_out(idle)),
                Grant::Create => rx = self.spawn_connect(),
            }
        }
    }

    /// A counted slot that never produced a client.
    fn free_slot(self: &Arc<Self>, state: &mut PoolState) {
        state.total -= 1;
        self.pulse(state);
        Self::check_ended(state);
    }

    /// Return a client: to the idle set, or closed if it must not be reused.
    fn put_back(self: &Arc<Self>, id: u64, client: Client, uses: usize, err: Option<&PgError>) {
        let mut state = self.state.lock();
        self.return_client(&mut state, id, client, uses, err);
    }

    fn return_client(
        self: &Arc<Self>,
        state: &mut PoolState,
        id: u64,
        client: Client,
        uses: usize,
        err: Option<&PgError>,
    ) {
        let retire = err.is_some()
            || state.ending
            || !client.is_queryable()
            || self.config.max_uses.is_some_and(|max| uses >= max);

        if retire {
            debug!(id, error = ?err.map(|e| e.to_string()), "Removing client");
            state.total -= 1;
            // Dropping the last handle terminates the session.
            drop(client);
            self.emit(PoolEvent::Remove { id });
        } else {
            let idle = IdleClient {
                id,
                client,
                uses,
                timer: self.arm_idle_timer(id),
            };
            state.idle.push_back(idle);
            self.emit(PoolEvent::Release { id });
        }

        self.pulse(state);
        Self::check_ended(state);
    }

    fn arm_idle_timer(self: &Arc<Self>, id: u64) -> Option<JoinHandle<()>> {
        let after = self.config.idle_timeout?;
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let inner: Weak<Self> = Arc::downgrade(self);
        Some(handle.spawn(async move {
            sleep(after).await;
            if let Some(inner) = inner.upgrade() {
                inner.expire_idle(id);
            }
        }))
    }

    fn expire_idle(self: &Arc<Self>, id: u64) {
        let mut state = self.state.lock();
        let Some(pos) = state.idle.iter().position(|idle| idle.id == id) else {
            return;
        };
        if let Some(idle) = state.idle.remove(pos) {
            debug!(id, "Closing idle client");
            state.total -= 1;
            drop(idle.client);
            self.emit(PoolEvent::Remove { id });
        }
        self.pulse(&mut state);
        Self::check_ended(&mut state);
    }

    /// Serve waiters in order while there is an idle client or room to grow.
    ///
    /// Runs under the state lock, so a lease that fails to send is unpacked
    /// here rather than dropped.
    fn pulse(self: &Arc<Self>, state: &mut PoolState) {
        if state.ending {
            for waiter in state.waiting.drain(..) {
                let _ = waiter.send(Err(PgError::PoolEnded));
            }
            return;
        }

        while let Some(waiter) = state.waiting.pop_front() {
            if waiter.is_closed() {
                continue;
            }

            if let Some(idle) = self.take_idle(state) {
                if let Err(Ok(mut lease)) = waiter.send(Ok(Lease::new(self, Grant::Idle(idle)))) {
                    if let Some(Grant::Idle(mut idle)) = lease.take() {
                        idle.timer = self.arm_idle_timer(idle.id);
                        state.idle.push_front(idle);
                    }
                }
            } else if state.total < self.config.max {
                state.total += 1;
                if let Err(Ok(mut lease)) = waiter.send(Ok(Lease::new(self, Grant::Create))) {
                    let _ = lease.take();
                    state.total -= 1;
                }
            } else {
                state.waiting.push_front(waiter);
                break;
            }
        }
    }

    /// Give back a grant nobody claimed.
    fn restore(self: &Arc<Self>, state: &mut PoolState, grant: Grant) {
        match grant {
            Grant::Idle(idle) => self.return_client(state, idle.id, idle.client, idle.uses, None),
            Grant::Create => self.free_slot(state),
        }
    }

    fn check_ended(state: &mut PoolState) {
        if state.ending && state.total == 0 {
            for done in state.end_waiters.drain(..) {
                let _ = done.send(());
            }
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

/// A pool of clients sharing one connection configuration.
///
/// Clients are opened lazily on demand.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(pg: PgConfig, config: PoolConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(PoolInner {
                pg,
                config,
                state: Mutex::new(PoolState::default()),
                events,
            }),
        }
    }

    /// Pool with default settings for a connection URL.
    pub fn from_url(url: &str) -> PgResult<Self> {
        Ok(Self::new(PgConfig::from_url(url)?, PoolConfig::default()))
    }

    /// Check out a client.
    ///
    /// Cancelling the returned future at any point gives the slot, or the
    /// client it produced, back to the pool.
    pub async fn acquire(&self) -> PgResult<PooledClient> {
        let wait = {
            let mut state = self.inner.state.lock();
            if state.ending {
                return Err(PgError::PoolEnded);
            }
            if let Some(idle) = self.inner.take_idle(&mut state) {
                let client = self.inner.hand_out(idle);
                self.inner.pulse(&mut state);
                return Ok(client);
            }
            if state.total < self.inner.config.max {
                state.total += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiting.push_back(tx);
                debug!(waiting = state.waiting.len(), "Pool exhausted, waiting");
                Some(rx)
            }
        };

        // No await before the connect task takes over a counted slot.
        let rx = match wait {
            Some(rx) => rx,
            None => self.inner.spawn_connect(),
        };
        self.inner.wait_lease(rx).await
    }

    /// Run one query on a pooled client.
    ///
    /// A client whose query failed for any reason other than a backend
    /// error is removed rather than reused.
    pub async fn query(&self, query: impl Into<Query>) -> PgResult<QueryResult> {
        let mut client = self.acquire().await?;
        let result = client.query(query).await;
        match &result {
            Err(e) if e.as_db_error().is_none() => client.release_with_error(e)?,
            _ => client.release()?,
        }
        result
    }

    /// Stop lending, close idle clients now, and wait for lent clients to
    /// come back.
    pub async fn end(&self) -> PgResult<()> {
        let rx = {
            let mut state = self.inner.state.lock();
            if state.ending {
                return Err(PgError::Pool(
                    "Called end on pool more than once".to_string(),
                ));
            }
            state.ending = true;
            debug!(total = state.total, "Ending pool");

            while let Some(mut idle) = state.idle.pop_front() {
                idle.disarm();
                state.total -= 1;
                self.inner.emit(PoolEvent::Remove { id: idle.id });
            }
            self.inner.pulse(&mut state);

            if state.total == 0 {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.end_waiters.push(tx);
                Some(rx)
            }
        };

        if let Some(rx) = rx {
            let _ = rx.await;
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Clients connecting, idle or lent out.
    pub fn total_count(&self) -> usize {
        self.inner.state.lock().total
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Checkouts waiting in line.
    pub fn waiting_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .waiting
            .iter()
            .filter(|w| !w.is_closed())
            .count()
    }

    pub fn is_ending(&self) -> bool {
        self.inner.state.lock().ending
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Pool")
            .field("total", &state.total)
            .field("idle", &state.idle.len())
            .field("waiting", &state.waiting.len())
            .field("ending", &state.ending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config() {
        let config = PoolConfig::new()
            .max(20)
            .idle_timeout(None)
            .connection_timeout(Duration::from_millis(500))
            .max_uses(7);

        assert_eq!(config.max, 20);
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.connection_timeout, Some(Duration::from_millis(500)));
        assert_eq!(config.max_uses, Some(7));

        let defaults = PoolConfig::default();
        assert_eq!(defaults.max, 10);
        assert_eq!(defaults.idle_timeout, Some(Duration::from_secs(10)));
        assert_eq!(defaults.connection_timeout, None);
    }

    #[tokio::test]
    async fn test_ended_pool_rejects_checkout() {
        let pool = Pool::new(PgConfig::default(), PoolConfig::default());
        pool.end().await.unwrap();

        assert!(pool.is_ending());
        assert!(matches!(pool.acquire().await, Err(PgError::PoolEnded)));
        assert!(matches!(pool.end().await, Err(PgError::Pool(_))));
    }
}
