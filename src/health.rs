//! Connection health monitoring and automatic reconnection.
//!
//! The [`HealthMonitor`] pings the server periodically while the client is
//! connected and counts consecutive failures; at the threshold it hands off
//! to the [`ReconnectController`], which walks the state machine through
//! disconnection and re-establishes the pool with exponential backoff.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::connection::{ConnectionState, StateManager};
use crate::error::{Error, Result, code};
use crate::pool::ConnectionPool;

/// Whether an error indicates the server connection dropped, as opposed to
/// a logical failure the caller must handle.
pub fn is_connection_dropped(error: &Error) -> bool
{
	error.is_transient()
}

/// Re-establishes connectivity with exponential backoff.
#[derive(Clone)]
pub struct ReconnectController
{
	state: Arc<StateManager>,
	pool: ConnectionPool,
	max_attempts: u32,
	base_backoff: Duration,
	max_backoff: Duration,
}

impl std::fmt::Debug for ReconnectController
{
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		fmt.debug_struct("ReconnectController")
			.field("max_attempts", &self.max_attempts)
			.finish_non_exhaustive()
	}
}

impl ReconnectController
{
	pub fn new(state: Arc<StateManager>, pool: ConnectionPool, max_attempts: u32) -> Self
	{
		Self {
			state,
			pool,
			max_attempts,
			base_backoff: Duration::from_millis(100),
			max_backoff: Duration::from_secs(60),
		}
	}

	/// The backoff before attempt `attempt` (1-based): 100 ms doubling,
	/// capped at 60 s.
	pub fn backoff_for_attempt(&self, attempt: u32) -> Duration
	{
		let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
		self.base_backoff.saturating_mul(factor).min(self.max_backoff)
	}

	/// Runs the full reconnect sequence.
	///
	/// Walks the state machine to `DISCONNECTED` if necessary, transitions
	/// to `CONNECTING` with reason `auto_reconnect`, then re-initializes
	/// the pool through its stored factory, backing off between attempts.
	/// With a pool of one this replaces the single connection.
	#[tracing::instrument(level = "info", skip_all, err)]
	pub async fn run(&self, cancel: &CancellationToken) -> Result<()>
	{
		self.walk_to_disconnected();

		let mut metadata = BTreeMap::new();
		metadata.insert(String::from("reason"), String::from("auto_reconnect"));
		self.state
			.transition_to(ConnectionState::Connecting, None, metadata)?;

		let mut last_error: Option<Error> = None;

		for attempt in 1..=self.max_attempts.max(1) {
			let backoff = self.backoff_for_attempt(attempt);

			tokio::select! {
				biased;

				() = cancel.cancelled() => {
					let _ = self.state.transition_to(
						ConnectionState::Disconnected,
						Some(String::from("reconnect cancelled")),
						BTreeMap::new(),
					);

					return Err(Error::cancelled("reconnect cancelled"));
				},

				() = tokio::time::sleep(backoff) => {},
			}

			tracing::info!(attempt, backoff = ?backoff, "attempting to reconnect");

			match self.pool.reinitialize().await {
				Ok(()) => {
					let mut metadata = BTreeMap::new();
					metadata.insert(String::from("attempts"), attempt.to_string());

					self.state
						.transition_to(ConnectionState::Connected, None, metadata)?;

					tracing::info!(attempt, "reconnected");
					return Ok(());
				},
				Err(err) => {
					tracing::warn!(
						attempt,
						error = &err as &dyn std::error::Error,
						"reconnect attempt failed",
					);
					last_error = Some(err);
				},
			}
		}

		let err = Error::new(
			crate::error::ErrorKind::Connection,
			code::RECONNECT_FAILED,
			format!("failed to reconnect after {} attempts", self.max_attempts),
		);

		let err = match last_error {
			Some(cause) => err.with_source(cause),
			None => err,
		};

		let _ = self.state.transition_to(
			ConnectionState::Disconnected,
			Some(err.to_string()),
			BTreeMap::new(),
		);

		Err(err)
	}

	/// Brings the state machine to `DISCONNECTED` through whatever legal
	/// steps are needed from the current state.
	fn walk_to_disconnected(&self)
	{
		loop {
			match self.state.current_state() {
				ConnectionState::Disconnected => break,
				ConnectionState::Connected => {
					let _ = self.state.transition_to(
						ConnectionState::Disconnecting,
						Some(String::from("connection lost")),
						BTreeMap::new(),
					);
				},
				ConnectionState::Disconnecting | ConnectionState::Connecting => {
					let _ = self.state.transition_to(
						ConnectionState::Disconnected,
						None,
						BTreeMap::new(),
					);
				},
			}
		}
	}
}

/// Periodic ping loop with consecutive-failure counting.
#[derive(Debug, Clone, Copy)]
pub struct HealthMonitor
{
	pub interval: Duration,
	pub failure_threshold: u32,
}

impl HealthMonitor
{
	pub fn new(interval: Duration) -> Self
	{
		Self { interval, failure_threshold: 3 }
	}

	/// Spawns the monitor loop.
	///
	/// `ping` performs one health probe; it is only invoked while the state
	/// machine reports `CONNECTED`. At `failure_threshold` consecutive
	/// failures the reconnect controller runs and the counter resets.
	pub fn spawn<P, Fut>(
		self,
		tasks: &TaskTracker,
		shutdown: CancellationToken,
		state: Arc<StateManager>,
		ping: P,
		reconnect: ReconnectController,
	) where
		P: Fn() -> Fut + Send + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		tasks.spawn(async move {
			let mut ticker = tokio::time::interval(self.interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			ticker.tick().await;

			let mut failures = 0_u32;

			loop {
				tokio::select! {
					() = shutdown.cancelled() => break,
					_ = ticker.tick() => {},
				}

				if !state.is_connected() {
					failures = 0;
					continue;
				}

				match ping().await {
					Ok(()) => {
						failures = 0;
					},
					Err(err) => {
						failures += 1;

						tracing::warn!(
							failures,
							threshold = self.failure_threshold,
							error = &err as &dyn std::error::Error,
							"health check failed",
						);

						if failures >= self.failure_threshold {
							failures = 0;

							if let Err(err) = reconnect.run(&shutdown).await {
								tracing::error!(
									error = &err as &dyn std::error::Error,
									"automatic reconnect failed",
								);
							}
						}
					},
				}
			}
		});
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn backoff_doubles_and_caps()
	{
		let controller = ReconnectController::new(
			Arc::new(StateManager::new()),
			crate::pool::ConnectionPool::new(
				Arc::new(|| Box::pin(async { Err(Error::connection("unused")) })),
				crate::pool::PoolConfig {
					min_idle: 0,
					max_open: 1,
					idle_timeout: Duration::from_secs(30),
					health_check_interval: Duration::from_secs(30),
				},
			),
			10,
		);

		assert_eq!(controller.backoff_for_attempt(1), Duration::from_millis(100));
		assert_eq!(controller.backoff_for_attempt(2), Duration::from_millis(200));
		assert_eq!(controller.backoff_for_attempt(3), Duration::from_millis(400));
		assert_eq!(controller.backoff_for_attempt(11), Duration::from_secs(60));
		assert_eq!(controller.backoff_for_attempt(u32::MAX), Duration::from_secs(60));
	}
}
