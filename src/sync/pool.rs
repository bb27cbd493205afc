use std::collections::HashMap;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::opts::{Opts, PoolKey};

use super::SessionState;
use super::session::{Session, io_budget};

/// Wait between two attempts of a saturated acquire
const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns one [`Pool`] per distinct connection descriptor.
#[derive(Default)]
pub struct PoolRegistry {
    pools: Mutex<HashMap<PoolKey, Arc<Pool>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pool for `opts`, created and filled to `pool_min_size` on first use.
    ///
    /// An existing pool takes over the pool sizing and lifetime of `opts`. The
    /// registry is not locked while sessions connect.
    pub fn pool(&self, opts: &Opts) -> Result<Arc<Pool>> {
        let key = opts.pool_key();
        let pool = {
            let mut pools = lock(&self.pools);
            if let Some(pool) = pools.get(&key) {
                pool.update_opts(opts);
                return Ok(Arc::clone(pool));
            }
            let pool = Arc::new(Pool::new(opts.clone()));
            pools.insert(key, Arc::clone(&pool));
            pool
        };
        pool.top_up()?;
        Ok(pool)
    }

    /// Check out a session for `opts`, waiting at most `timeout`.
    pub fn acquire(&self, opts: &Opts, timeout: Duration) -> Result<PooledSession> {
        self.pool(opts)?.acquire(timeout)
    }

    /// Close every idle session and forget all pools.
    ///
    /// Sessions still checked out are closed when they are released.
    pub fn clear(&self) {
        let pools: Vec<Arc<Pool>> = lock(&self.pools).drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.clear();
        }
    }
}

/// Idle and in-use counts of a pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
}

struct IdleEntry {
    session: Session,
    idle_since: Instant,
}

struct InUse {
    alive: Arc<AtomicBool>,
}

#[derive(Default)]
struct PoolInner {
    /// Most recently released last
    idle: Vec<IdleEntry>,
    in_use: HashMap<u64, InUse>,
    /// Sessions being connected outside the lock
    reserved: usize,
    closed: bool,
}

impl PoolInner {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.reserved
    }

    /// Forget checked-out sessions that failed or closed.
    fn sweep(&mut self) -> usize {
        let before = self.in_use.len();
        self.in_use.retain(|_, session| session.alive.load(Ordering::Acquire));
        before - self.in_use.len()
    }
}

/// Sessions sharing one connection descriptor.
///
/// Every session the pool holds is either idle or in use, never both.
pub struct Pool {
    key: PoolKey,
    opts: Mutex<Opts>,
    inner: Mutex<PoolInner>,
}

impl Pool {
    /// An empty pool. [`PoolRegistry::pool`] also fills it to the minimum size.
    pub fn new(opts: Opts) -> Self {
        Self {
            key: opts.pool_key(),
            opts: Mutex::new(opts),
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// The latest descriptor
    pub fn opts(&self) -> Opts {
        lock(&self.opts).clone()
    }

    fn update_opts(&self, opts: &Opts) {
        *lock(&self.opts) = opts.clone();
    }

    pub fn stats(&self) -> PoolStats {
        let inner = lock(&self.inner);
        PoolStats {
            idle: inner.idle.len(),
            in_use: inner.in_use.len(),
        }
    }

    /// Check out a session, waiting at most `timeout` for one to become available.
    ///
    /// Idle sessions are handed out most recently released first, after a ping and a
    /// reset. A dead idle session is discarded and the next one is tried. Network
    /// I/O done on the caller's behalf stops at the deadline too.
    #[tracing::instrument(skip_all, fields(pool = %self.key))]
    pub fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<PooledSession> {
        let deadline = Instant::now() + timeout;
        loop {
            let acquired = match self.try_acquire(deadline) {
                Err(err) if err.is_io_timeout() => {
                    tracing::debug!(%err, "connect ran out of time");
                    None
                }
                acquired => acquired?,
            };
            if let Some(session) = acquired {
                if let Err(err) = self.top_up() {
                    tracing::warn!(%err, "failed to top up pool");
                }
                return Ok(PooledSession {
                    pool: Arc::clone(self),
                    session: ManuallyDrop::new(session),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(?timeout, "pool exhausted");
                return Err(Error::PoolTimeout(timeout));
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    fn try_acquire(&self, deadline: Instant) -> Result<Option<Session>> {
        while let Some(mut session) = self.pop_idle() {
            let budget = io_budget(session.opts().connect_timeout, Some(deadline));
            if session.set_io_timeout(Some(budget)).is_err() || !matches!(session.ping(), Ok(true)) {
                tracing::debug!(session = session.id(), "discarding dead idle session");
                self.forget(session.id());
                continue;
            }
            session.apply_opts(&self.opts());
            if let Err(err) = session.reset().and_then(|()| session.set_io_timeout(None)) {
                tracing::debug!(%err, session = session.id(), "discarding session that failed to reset");
                self.forget(session.id());
                continue;
            }
            return Ok(Some(session));
        }

        if !self.reserve() {
            return Ok(None);
        }
        let created = Session::connect_until(self.opts(), Some(deadline));
        let mut inner = lock(&self.inner);
        inner.reserved -= 1;
        let session = created?;
        inner.in_use.insert(
            session.id(),
            InUse {
                alive: session.liveness(),
            },
        );
        Ok(Some(session))
    }

    /// Move the most recently released idle session to in-use.
    fn pop_idle(&self) -> Option<Session> {
        let mut inner = lock(&self.inner);
        let entry = inner.idle.pop()?;
        tracing::trace!(idle_for = ?entry.idle_since.elapsed(), "reusing idle session");
        inner.in_use.insert(
            entry.session.id(),
            InUse {
                alive: entry.session.liveness(),
            },
        );
        Some(entry.session)
    }

    /// Claim room for one new session, evicting dead in-use sessions if the pool is full.
    fn reserve(&self) -> bool {
        let max = lock(&self.opts).pool_max_size;
        let mut inner = lock(&self.inner);
        if inner.total() >= max {
            let evicted = inner.sweep();
            if evicted > 0 {
                tracing::debug!(evicted, "evicted dead in-use sessions");
            }
            if inner.total() >= max {
                return false;
            }
        }
        inner.reserved += 1;
        true
    }

    fn forget(&self, id: u64) {
        lock(&self.inner).in_use.remove(&id);
    }

    /// Open sessions until idle + in-use reaches the minimum size.
    fn top_up(&self) -> Result<()> {
        loop {
            let opts = self.opts();
            {
                let mut inner = lock(&self.inner);
                if inner.closed || inner.total() >= opts.pool_min_size.min(opts.pool_max_size) {
                    return Ok(());
                }
                inner.reserved += 1;
            }
            let created = Session::connect(opts);
            let mut inner = lock(&self.inner);
            inner.reserved -= 1;
            inner.idle.push(IdleEntry {
                session: created?,
                idle_since: Instant::now(),
            });
        }
    }

    /// Return a session. Sessions that are broken, expired or were evicted are closed.
    fn release(&self, mut session: Session) {
        if session.state() == SessionState::Busy
            && let Err(err) = session.drain()
        {
            tracing::debug!(%err, session = session.id(), "failed to drain released session");
        }

        let lifetime = lock(&self.opts).pool_lifetime;
        let expired = lifetime.is_some_and(|lifetime| session.age() > lifetime);
        let reusable = session.state() == SessionState::Ready && !expired;
        {
            let mut inner = lock(&self.inner);
            let tracked = inner.in_use.remove(&session.id()).is_some();
            if tracked && reusable && !inner.closed {
                inner.idle.push(IdleEntry {
                    session,
                    idle_since: Instant::now(),
                });
                drop(inner);
                self.top_up_logged();
                return;
            }
        }

        tracing::debug!(session = session.id(), expired, state = ?session.state(), "closing released session");
        if let Err(err) = session.close() {
            tracing::debug!(%err, "failed to close released session");
        }
        self.top_up_logged();
    }

    fn top_up_logged(&self) {
        if let Err(err) = self.top_up() {
            tracing::warn!(%err, "failed to top up pool");
        }
    }

    /// Close all idle sessions and stop refilling.
    pub fn clear(&self) {
        let idle = {
            let mut inner = lock(&self.inner);
            inner.closed = true;
            std::mem::take(&mut inner.idle)
        };
        for mut entry in idle {
            if let Err(err) = entry.session.close() {
                tracing::debug!(%err, "failed to close idle session");
            }
        }
    }
}

/// A session checked out of a [`Pool`], returned to it on drop.
pub struct PooledSession {
    pool: Arc<Pool>,
    session: ManuallyDrop<Session>,
}

impl PooledSession {
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }
}

impl Deref for PooledSession {
    type Target = Session;
    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.session
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        // SAFETY: session is never accessed after this
        let session = unsafe { ManuallyDrop::take(&mut self.session) };
        self.pool.release(session);
    }
}
