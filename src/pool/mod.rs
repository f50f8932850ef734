//! A bounded pool of [`Connection`]s.
//!
//! The pool hands out connections wrapped in [`PooledConn`] guards that
//! return them on drop. Dead connections are discarded rather than reused;
//! background tasks reap idle connections past their idle timeout and probe
//! idle connections for health. The invariant `active + idle <= max_open`
//! holds for all workloads; the mutex over the idle queue is the
//! serialization point for both counters.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::connection::Connection;
use crate::error::{Error, Result, code};

/// Creates new [`Connection`]s for the pool.
///
/// The factory is captured as a closure at connect time, so the pool never
/// holds a reference back to the client that configured it.
pub type ConnectionFactory =
	Arc<dyn Fn() -> BoxFuture<'static, Result<Connection>> + Send + Sync>;

/// Pool sizing and maintenance intervals.
#[derive(Debug, Clone)]
pub struct PoolConfig
{
	/// Connections created eagerly by [`ConnectionPool::initialize()`] and
	/// preserved by the idle reaper.
	pub min_idle: usize,

	/// Hard cap on `active + idle`.
	pub max_open: usize,

	/// Idle connections older than this are reaped.
	pub idle_timeout: Duration,

	/// Period of the idle health prober.
	pub health_check_interval: Duration,
}

#[derive(Debug, Default)]
struct Counters
{
	total_opened: AtomicU64,
	wait_count: AtomicU64,
	wait_duration_ns: AtomicU64,
	hits: AtomicU64,
	misses: AtomicU64,
	timeouts: AtomicU64,
	errors: AtomicU64,
}

/// A point-in-time snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats
{
	pub active: usize,
	pub idle: usize,
	pub total_opened: u64,
	pub wait_count: u64,
	pub wait_duration: Duration,
	pub hits: u64,
	pub misses: u64,
	pub timeouts: u64,
	pub errors: u64,
}

struct Shared
{
	idle: VecDeque<Arc<Connection>>,
	active: usize,
	closed: bool,
}

struct PoolInner
{
	factory: ConnectionFactory,
	config: PoolConfig,
	shared: Mutex<Shared>,
	notify: tokio::sync::Notify,
	counters: Counters,
	tasks: TaskTracker,
	shutdown: CancellationToken,
}

/// See the [module-level documentation](self).
#[derive(Clone)]
pub struct ConnectionPool
{
	inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool
{
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		let stats = self.stats();

		fmt.debug_struct("ConnectionPool")
			.field("active", &stats.active)
			.field("idle", &stats.idle)
			.field("max_open", &self.inner.config.max_open)
			.finish_non_exhaustive()
	}
}

impl ConnectionPool
{
	pub fn new(factory: ConnectionFactory, config: PoolConfig) -> Self
	{
		Self {
			inner: Arc::new(PoolInner {
				factory,
				config,
				shared: Mutex::new(Shared {
					idle: VecDeque::new(),
					active: 0,
					closed: false,
				}),
				notify: tokio::sync::Notify::new(),
				counters: Counters::default(),
				tasks: TaskTracker::new(),
				shutdown: CancellationToken::new(),
			}),
		}
	}

	/// Pre-fills the pool to `min_idle` connections and spawns the idle
	/// reaper and health prober.
	#[tracing::instrument(level = "debug", skip_all, err)]
	pub async fn initialize(&self) -> Result<()>
	{
		// Top up rather than blindly create, so a retried initialization
		// after a partial failure does not overfill the queue.
		while self.lock_shared().idle.len() < self.inner.config.min_idle {
			let connection = (self.inner.factory)().await.map_err(|err| {
				self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
				err
			})?;

			self.inner.counters.total_opened.fetch_add(1, Ordering::Relaxed);

			let mut shared = self.lock_shared();
			shared.idle.push_back(Arc::new(connection));
		}

		self.spawn_reaper();
		self.spawn_prober();

		tracing::debug!(min_idle = self.inner.config.min_idle, "pool initialized");
		Ok(())
	}

	/// Acquires a connection, waiting up to `wait_timeout` when the pool is
	/// at capacity.
	pub async fn get(
		&self,
		cancel: &CancellationToken,
		wait_timeout: Option<Duration>,
	) -> Result<PooledConn>
	{
		let started = Instant::now();
		let deadline = wait_timeout.map(|timeout| tokio::time::Instant::now() + timeout);
		let mut waited = false;
		let mut missed = false;

		let result = loop {
			enum Attempt
			{
				Reuse(Arc<Connection>),
				Create,
				Wait,
			}

			let attempt = {
				let mut shared = self.lock_shared();

				if shared.closed {
					break Err(Error::pool(code::POOL_CLOSED, "pool is closed"));
				}

				loop {
					match shared.idle.pop_front() {
						Some(connection) if connection.is_alive() => {
							shared.active += 1;
							break Attempt::Reuse(connection);
						},
						Some(connection) => {
							// Dead idle connection; discard and keep looking.
							self.close_in_background(connection);
						},
						None if shared.active < self.inner.config.max_open => {
							shared.active += 1;
							break Attempt::Create;
						},
						None => break Attempt::Wait,
					}
				}
			};

			match attempt {
				Attempt::Reuse(connection) => {
					self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
					break Ok(PooledConn { connection: Some(connection), pool: self.clone() });
				},

				Attempt::Create => {
					if !missed {
						missed = true;
						self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
					}

					match (self.inner.factory)().await {
						Ok(connection) => {
							self.inner.counters.total_opened.fetch_add(1, Ordering::Relaxed);

							break Ok(PooledConn {
								connection: Some(Arc::new(connection)),
								pool: self.clone(),
							});
						},
						Err(err) => {
							{
								let mut shared = self.lock_shared();
								shared.active -= 1;
							}

							self.inner.notify.notify_one();
							self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);

							break Err(Error::pool(
								code::POOL_FACTORY_ERROR,
								format!("connection factory failed: {err}"),
							)
							.with_source(err));
						},
					}
				},

				Attempt::Wait => {
					if !missed {
						missed = true;
						self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
					}
					if !waited {
						waited = true;
						self.inner.counters.wait_count.fetch_add(1, Ordering::Relaxed);
					}

					let notified = self.inner.notify.notified();

					match deadline {
						Some(deadline) => {
							tokio::select! {
								biased;

								() = cancel.cancelled() => {
									break Err(Error::cancelled("pool acquisition cancelled"));
								},
								() = tokio::time::sleep_until(deadline) => {
									self.inner.counters.timeouts.fetch_add(1, Ordering::Relaxed);

									break Err(Error::pool(
										code::POOL_EXHAUSTED,
										"timed out waiting for a pooled connection",
									));
								},
								() = notified => {},
							}
						},
						None => {
							tokio::select! {
								biased;

								() = cancel.cancelled() => {
									break Err(Error::cancelled("pool acquisition cancelled"));
								},
								() = notified => {},
							}
						},
					}
				},
			}
		};

		if waited {
			let nanos = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
			self.inner
				.counters
				.wait_duration_ns
				.fetch_add(nanos, Ordering::Relaxed);
		}

		result
	}

	/// Returns a connection to the pool.
	///
	/// Dead connections and connections handed back after [`close()`] are
	/// closed instead of re-queued.
	///
	/// [`close()`]: Self::close()
	fn release(&self, connection: Arc<Connection>)
	{
		let requeued = {
			let mut shared = self.lock_shared();
			shared.active = shared.active.saturating_sub(1);

			if shared.closed || !connection.is_alive() {
				false
			} else if shared.active + shared.idle.len() >= self.inner.config.max_open {
				// Idle queue already at capacity.
				false
			} else {
				shared.idle.push_back(Arc::clone(&connection));
				true
			}
		};

		if !requeued {
			self.close_in_background(connection);
		}

		self.inner.notify.notify_one();
	}

	/// Re-establishes the pool after connectivity loss: discards all idle
	/// connections, clears a previous close, and pre-fills back to
	/// `min_idle` through the stored factory.
	///
	/// Maintenance tasks keep running across reinitialization. Connections
	/// still checked out are dead by the time this runs and are discarded
	/// when released.
	#[tracing::instrument(level = "debug", skip_all, err)]
	pub async fn reinitialize(&self) -> Result<()>
	{
		let drained = {
			let mut shared = self.lock_shared();
			shared.closed = false;
			std::mem::take(&mut shared.idle)
		};

		for connection in drained {
			let _ = connection.close().await;
		}

		let mut fresh = Vec::with_capacity(self.inner.config.min_idle);

		for _ in 0..self.inner.config.min_idle.max(1) {
			let connection = (self.inner.factory)().await.map_err(|err| {
				self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
				err
			})?;

			self.inner.counters.total_opened.fetch_add(1, Ordering::Relaxed);
			fresh.push(Arc::new(connection));
		}

		{
			let mut shared = self.lock_shared();
			shared.idle.extend(fresh);
		}

		self.inner.notify.notify_waiters();
		Ok(())
	}

	/// Closes the pool: cancels maintenance tasks, closes idle connections,
	/// wakes all waiters. Idempotent.
	#[tracing::instrument(level = "debug", skip_all)]
	pub async fn close(&self)
	{
		let drained = {
			let mut shared = self.lock_shared();

			if shared.closed {
				return;
			}

			shared.closed = true;
			std::mem::take(&mut shared.idle)
		};

		self.inner.shutdown.cancel();
		self.inner.tasks.close();
		self.inner.tasks.wait().await;

		for connection in drained {
			let _ = connection.close().await;
		}

		self.inner.notify.notify_waiters();
		tracing::debug!("pool closed");
	}

	pub fn is_closed(&self) -> bool
	{
		self.lock_shared().closed
	}

	pub fn stats(&self) -> PoolStats
	{
		let (active, idle) = {
			let shared = self.lock_shared();
			(shared.active, shared.idle.len())
		};

		let counters = &self.inner.counters;

		PoolStats {
			active,
			idle,
			total_opened: counters.total_opened.load(Ordering::Relaxed),
			wait_count: counters.wait_count.load(Ordering::Relaxed),
			wait_duration: Duration::from_nanos(counters.wait_duration_ns.load(Ordering::Relaxed)),
			hits: counters.hits.load(Ordering::Relaxed),
			misses: counters.misses.load(Ordering::Relaxed),
			timeouts: counters.timeouts.load(Ordering::Relaxed),
			errors: counters.errors.load(Ordering::Relaxed),
		}
	}

	fn spawn_reaper(&self)
	{
		let pool = self.clone();
		let shutdown = self.inner.shutdown.clone();
		let period = (self.inner.config.idle_timeout / 4).max(Duration::from_millis(10));

		self.inner.tasks.spawn(async move {
			let mut ticker = tokio::time::interval(period);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

			loop {
				tokio::select! {
					() = shutdown.cancelled() => break,
					_ = ticker.tick() => pool.reap_idle(),
				}
			}
		});
	}

	fn reap_idle(&self)
	{
		let idle_timeout = self.inner.config.idle_timeout;
		let min_idle = self.inner.config.min_idle;

		let expired = {
			let mut shared = self.lock_shared();
			let mut expired = Vec::new();

			while shared.idle.len() > min_idle {
				let front_expired = shared
					.idle
					.front()
					.is_some_and(|connection| connection.idle_for() > idle_timeout);

				if !front_expired {
					break;
				}

				if let Some(connection) = shared.idle.pop_front() {
					expired.push(connection);
				}
			}

			expired
		};

		if !expired.is_empty() {
			tracing::debug!(count = expired.len(), "reaping idle connections");
		}

		for connection in expired {
			self.close_in_background(connection);
		}
	}

	fn spawn_prober(&self)
	{
		let pool = self.clone();
		let shutdown = self.inner.shutdown.clone();
		let period = self.inner.config.health_check_interval.max(Duration::from_millis(10));

		self.inner.tasks.spawn(async move {
			let mut ticker = tokio::time::interval(period);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

			// The first tick fires immediately; skip it so a freshly
			// initialized pool is not probed before it has served anything.
			ticker.tick().await;

			loop {
				tokio::select! {
					() = shutdown.cancelled() => break,
					_ = ticker.tick() => pool.probe_idle(&shutdown).await,
				}
			}
		});
	}

	async fn probe_idle(&self, shutdown: &CancellationToken)
	{
		let snapshot = {
			let shared = self.lock_shared();
			shared.idle.iter().map(Arc::clone).collect::<Vec<_>>()
		};

		if snapshot.is_empty() {
			return;
		}

		let pings = snapshot.iter().map(|connection| {
			let connection = Arc::clone(connection);
			let shutdown = shutdown.clone();

			async move {
				let ping = tokio::time::timeout(
					Duration::from_secs(5),
					connection.ping(&shutdown),
				);

				match ping.await {
					Ok(Ok(())) => true,
					Ok(Err(_)) | Err(_) => {
						connection.mark_dead();
						false
					},
				}
			}
		});

		let results = futures_util::future::join_all(pings).await;
		let unhealthy = results.iter().filter(|&&healthy| !healthy).count();

		if unhealthy > 0 {
			tracing::warn!(unhealthy, "health prober found unhealthy idle connections");
			self.inner.counters.errors.fetch_add(unhealthy as u64, Ordering::Relaxed);
		}

		let removed = {
			let mut shared = self.lock_shared();
			let before = shared.idle.len();
			shared.idle.retain(|connection| connection.is_alive());
			before - shared.idle.len()
		};

		for _ in 0..removed {
			self.inner.notify.notify_one();
		}
	}

	fn close_in_background(&self, connection: Arc<Connection>)
	{
		connection.mark_dead();

		if let Ok(handle) = tokio::runtime::Handle::try_current() {
			handle.spawn(async move {
				let _ = connection.close().await;
			});
		}
	}

	fn lock_shared(&self) -> std::sync::MutexGuard<'_, Shared>
	{
		self.inner
			.shared
			.lock()
			.unwrap_or_else(std::sync::PoisonError::into_inner)
	}
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Dropping the guard returns the connection to the pool (or closes it when
/// it has died or the pool has closed in the meantime).
pub struct PooledConn
{
	connection: Option<Arc<Connection>>,
	pool: ConnectionPool,
}

impl std::fmt::Debug for PooledConn
{
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		fmt.debug_tuple("PooledConn").field(&self.connection).finish()
	}
}

impl PooledConn
{
	/// The underlying shared connection.
	pub fn connection(&self) -> &Arc<Connection>
	{
		self.connection.as_ref().unwrap_or_else(|| {
			unreachable!("connection is only taken in Drop");
		})
	}
}

impl Deref for PooledConn
{
	type Target = Connection;

	fn deref(&self) -> &Self::Target
	{
		self.connection().as_ref()
	}
}

impl Drop for PooledConn
{
	fn drop(&mut self)
	{
		if let Some(connection) = self.connection.take() {
			self.pool.release(connection);
		}
	}
}
