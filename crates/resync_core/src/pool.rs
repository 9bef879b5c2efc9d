//! Bounded pool of pre-authorized clients.
//!
//! The pool is filled once, in parallel, when it is built. Afterwards the
//! set of handles is fixed: `acquire` blocks until one is free, the
//! returned guard puts it back on drop, and nothing ever creates handles on
//! demand. At most `capacity` handles are checked out at any time.

use crate::config::PoolConfig;
use crate::error::{SyncError, SyncResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolMetrics {
    /// Handles currently checked out.
    pub active: usize,
    /// Handles waiting in the pool.
    pub available: usize,
    /// Pool capacity.
    pub capacity: usize,
    /// Successful acquires.
    pub total_acquires: u64,
    /// Releases, including discarded ones.
    pub total_releases: u64,
    /// Acquires that gave up waiting.
    pub acquire_timeouts: u64,
    /// Released handles dropped because the pool was full or closed.
    pub discarded: u64,
    /// Time since the last successful acquire.
    pub last_acquire: Option<Duration>,
}

impl fmt::Display for PoolMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Active: {}/{}, Acquires: {}, Releases: {}, Timeouts: {}, Last Acquire: ",
            self.active, self.capacity, self.total_acquires, self.total_releases, self.acquire_timeouts
        )?;
        match self.last_acquire {
            Some(ago) => write!(f, "{}ms ago", ago.as_millis()),
            None => f.write_str("never"),
        }
    }
}

struct PoolState<C> {
    idle: VecDeque<C>,
    checked_out: usize,
    closed: bool,
    total_acquires: u64,
    total_releases: u64,
    acquire_timeouts: u64,
    discarded: u64,
    last_acquire: Option<Instant>,
}

/// A fixed-size pool of clients shared by concurrent workers.
pub struct ClientPool<C> {
    config: PoolConfig,
    state: Mutex<PoolState<C>>,
    available: Condvar,
}

impl<C: Send + 'static> ClientPool<C> {
    /// Builds every client up front.
    ///
    /// `factory` is called once per slot from `min(N, max(5, N/4))` worker
    /// threads. The first factory error aborts construction, as does
    /// `init_timeout` elapsing before all clients exist.
    pub fn init<F>(config: PoolConfig, factory: F) -> SyncResult<Self>
    where
        F: Fn(usize) -> SyncResult<C> + Send + Sync + 'static,
    {
        config.validate()?;
        let capacity = config.capacity;
        let workers = prefill_workers(capacity);
        let started = Instant::now();
        info!(capacity, workers, "pre-filling client pool");

        let factory = Arc::new(factory);
        let next_slot = Arc::new(AtomicUsize::new(0));
        let abort = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<(usize, SyncResult<C>)>();

        for worker in 0..workers {
            let factory = Arc::clone(&factory);
            let next_slot = Arc::clone(&next_slot);
            let abort = Arc::clone(&abort);
            let tx = tx.clone();

            thread::Builder::new()
                .name(format!("resync-pool-init-{worker}"))
                .spawn(move || loop {
                    if abort.load(Ordering::SeqCst) {
                        break;
                    }
                    let slot = next_slot.fetch_add(1, Ordering::SeqCst);
                    if slot >= capacity {
                        break;
                    }
                    if tx.send((slot, factory(slot))).is_err() {
                        break;
                    }
                })?;
        }
        drop(tx);

        let deadline = crate::retry::deadline_from(started, config.init_timeout);
        let mut idle = VecDeque::with_capacity(capacity);

        while idle.len() < capacity {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((_, Ok(client))) => idle.push_back(client),
                Ok((slot, Err(err))) => {
                    abort.store(true, Ordering::SeqCst);
                    warn!(slot, error = %err, "client pool initialization failed");
                    return Err(SyncError::PoolInit {
                        slot,
                        source: Box::new(err),
                    });
                }
                Err(RecvTimeoutError::Timeout) => {
                    abort.store(true, Ordering::SeqCst);
                    warn!(created = idle.len(), capacity, "client pool initialization timed out");
                    return Err(SyncError::PoolInitTimeout {
                        created: idle.len(),
                        capacity,
                        timeout: config.init_timeout,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SyncError::PoolInitAborted {
                        created: idle.len(),
                        capacity,
                    });
                }
            }
        }

        info!(capacity, elapsed = ?started.elapsed(), "client pool ready");
        Ok(Self::from_clients(config, idle))
    }
}

fn prefill_workers(capacity: usize) -> usize {
    capacity.min((capacity / 4).max(5))
}

impl<C> ClientPool<C> {
    fn from_clients(config: PoolConfig, idle: VecDeque<C>) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState {
                idle,
                checked_out: 0,
                closed: false,
                total_acquires: 0,
                total_releases: 0,
                acquire_timeouts: 0,
                discarded: 0,
                last_acquire: None,
            }),
            available: Condvar::new(),
        }
    }

    /// Pool capacity.
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Acquires a client, waiting up to the configured acquire timeout.
    pub fn acquire(&self) -> SyncResult<PooledClient<'_, C>> {
        let client = self.checkout_within(self.config.acquire_timeout)?;
        Ok(self.guard(client))
    }

    /// Acquires a client, waiting at most `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> SyncResult<PooledClient<'_, C>> {
        let client = self.checkout_within(Some(timeout))?;
        Ok(self.guard(client))
    }

    /// Acquires a client only if one is free right now.
    pub fn try_acquire(&self) -> Option<PooledClient<'_, C>> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        let client = self.take_idle(&mut state)?;
        drop(state);
        Some(self.guard(client))
    }

    /// Acquires a raw client that must be handed back with [`release`](Self::release).
    pub fn checkout(&self) -> SyncResult<C> {
        self.checkout_within(self.config.acquire_timeout)
    }

    /// Returns a client to the pool.
    ///
    /// If the pool is already full or closed the client is dropped.
    pub fn release(&self, client: C) {
        let mut state = self.state.lock();
        state.checked_out = state.checked_out.saturating_sub(1);
        state.total_releases += 1;

        if state.closed || state.idle.len() >= self.config.capacity {
            state.discarded += 1;
            if self.config.debug_logging {
                debug!(
                    closed = state.closed,
                    capacity = self.config.capacity,
                    "pool full, discarding released client"
                );
            }
            return;
        }

        state.idle.push_back(client);
        if self.config.debug_logging {
            debug!(available = state.idle.len(), "released client");
        }
        drop(state);
        self.available.notify_one();
    }

    /// Closes the pool, dropping idle clients. Returns how many were dropped.
    ///
    /// Clients still checked out are dropped when released.
    pub fn close(&self) -> usize {
        let mut state = self.state.lock();
        state.closed = true;
        let drained = state.idle.drain(..).count();
        drop(state);
        self.available.notify_all();
        info!(drained, "client pool closed");
        drained
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns a metrics snapshot.
    pub fn metrics(&self) -> PoolMetrics {
        let state = self.state.lock();
        PoolMetrics {
            active: state.checked_out,
            available: state.idle.len(),
            capacity: self.config.capacity,
            total_acquires: state.total_acquires,
            total_releases: state.total_releases,
            acquire_timeouts: state.acquire_timeouts,
            discarded: state.discarded,
            last_acquire: state.last_acquire.map(|at| at.elapsed()),
        }
    }

    fn guard(&self, client: C) -> PooledClient<'_, C> {
        PooledClient {
            pool: self,
            client: Some(client),
        }
    }

    fn take_idle(&self, state: &mut PoolState<C>) -> Option<C> {
        let client = state.idle.pop_front()?;
        state.checked_out += 1;
        state.total_acquires += 1;
        state.last_acquire = Some(Instant::now());

        if self.config.debug_logging {
            let available = state.idle.len();
            if available <= 1 {
                warn!(available, capacity = self.config.capacity, "client pool critically low");
            } else if available <= 2 {
                warn!(available, capacity = self.config.capacity, "client pool near capacity");
            } else {
                debug!(available, "acquired client");
            }
        }
        Some(client)
    }

    fn checkout_within(&self, timeout: Option<Duration>) -> SyncResult<C> {
        let deadline = timeout.map(|t| crate::retry::deadline_from(Instant::now(), t));
        let mut state = self.state.lock();

        loop {
            if state.closed {
                return Err(SyncError::PoolClosed);
            }
            if let Some(client) = self.take_idle(&mut state) {
                return Ok(client);
            }

            match deadline {
                None => self.available.wait(&mut state),
                Some(deadline) => {
                    let timed_out = self.available.wait_until(&mut state, deadline).timed_out();
                    if timed_out && state.idle.is_empty() && !state.closed {
                        state.acquire_timeouts += 1;
                        let timeout = timeout.unwrap_or_default();
                        warn!(?timeout, capacity = self.config.capacity, "timed out waiting for client");
                        return Err(SyncError::AcquireTimeout {
                            timeout,
                            capacity: self.config.capacity,
                        });
                    }
                }
            }
        }
    }
}

/// Runs `f` with a pooled client, releasing it afterwards even if `f` fails.
pub fn with_pooled_client<C, T, F>(pool: &ClientPool<C>, f: F) -> SyncResult<T>
where
    F: FnOnce(&C) -> SyncResult<T>,
{
    let client = pool.acquire()?;
    f(&client)
}

/// A checked-out client. Returned to the pool on drop.
pub struct PooledClient<'a, C> {
    pool: &'a ClientPool<C>,
    client: Option<C>,
}

impl<C> PooledClient<'_, C> {
    /// Detaches the client from the guard.
    ///
    /// The client stays counted as active until it is passed to
    /// [`ClientPool::release`].
    pub fn into_inner(mut self) -> C {
        self.client.take().expect("pooled client already taken")
    }
}

impl<C> Deref for PooledClient<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.client.as_ref().expect("pooled client already taken")
    }
}

impl<C> DerefMut for PooledClient<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.client.as_mut().expect("pooled client already taken")
    }
}

impl<C> Drop for PooledClient<'_, C> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.release(client);
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for PooledClient<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledClient").field("client", &self.client).finish()
    }
}

impl<C> fmt::Debug for ClientPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientPool")
            .field("config", &self.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}
