//! The client-wide connection state machine.
//!
//! [`StateManager`] is the sole writer of the current [`ConnectionState`].
//! Transitions are validated against a fixed table, recorded with timing
//! information, and announced to registered handlers. Handlers always run
//! outside the internal lock, so a handler may itself query the manager
//! without deadlocking.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use derive_more::Display;
use time::OffsetDateTime;

use crate::error::{Error, ErrorKind, Result, code};

/// How many transitions [`StateManager::recent_transitions()`] retains.
const HISTORY_LIMIT: usize = 32;

/// The connection lifecycle states.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState
{
	#[display("DISCONNECTED")]
	Disconnected,

	#[display("CONNECTING")]
	Connecting,

	#[display("CONNECTED")]
	Connected,

	#[display("DISCONNECTING")]
	Disconnecting,
}

impl ConnectionState
{
	/// Whether the transition `self -> to` is legal.
	pub fn can_transition_to(self, to: Self) -> bool
	{
		use ConnectionState::{Connected, Connecting, Disconnected, Disconnecting};

		matches!(
			(self, to),
			(Disconnected, Connecting)
				| (Connecting, Connected)
				| (Connecting, Disconnected)
				| (Connected, Disconnecting)
				| (Disconnecting, Disconnected)
		)
	}
}

/// A recorded state transition.
#[derive(Debug, Clone)]
pub struct StateTransition
{
	pub from: ConnectionState,
	pub to: ConnectionState,
	pub at: OffsetDateTime,
	pub time_in_previous: Duration,
	pub error: Option<String>,
	pub metadata: BTreeMap<String, String>,
}

/// Handler invoked for every successful transition.
pub type TransitionHandler = Arc<dyn Fn(&StateTransition) + Send + Sync>;

struct Current
{
	state: ConnectionState,
	entered_at: Instant,
	history: VecDeque<StateTransition>,
}

/// Guards the state machine described in the module documentation.
pub struct StateManager
{
	current: Mutex<Current>,
	handlers: RwLock<Vec<TransitionHandler>>,
}

impl std::fmt::Debug for StateManager
{
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		fmt.debug_struct("StateManager")
			.field("current", &self.current_state())
			.finish_non_exhaustive()
	}
}

impl Default for StateManager
{
	fn default() -> Self
	{
		Self::new()
	}
}

impl StateManager
{
	/// Creates a manager starting in [`ConnectionState::Disconnected`].
	pub fn new() -> Self
	{
		Self {
			current: Mutex::new(Current {
				state: ConnectionState::Disconnected,
				entered_at: Instant::now(),
				history: VecDeque::with_capacity(HISTORY_LIMIT),
			}),
			handlers: RwLock::new(Vec::new()),
		}
	}

	pub fn current_state(&self) -> ConnectionState
	{
		self.lock_current().state
	}

	pub fn is_connected(&self) -> bool
	{
		self.current_state() == ConnectionState::Connected
	}

	/// Attempts the transition to `to`, recording `error` and `metadata` on
	/// the transition record.
	///
	/// Fails with an [`ErrorKind::State`] error when the transition is not
	/// in the legal table. On success, all registered handlers observe the
	/// transition exactly once, in registration order, outside the internal
	/// lock.
	pub fn transition_to(
		&self,
		to: ConnectionState,
		error: Option<String>,
		metadata: BTreeMap<String, String>,
	) -> Result<StateTransition>
	{
		let transition = {
			let mut current = self.lock_current();

			if !current.state.can_transition_to(to) {
				return Err(Error::new(
					ErrorKind::State,
					code::ILLEGAL_TRANSITION,
					format!("illegal state transition {} -> {to}", current.state),
				)
				.with_detail("from", current.state.to_string())
				.with_detail("to", to.to_string()));
			}

			let transition = StateTransition {
				from: current.state,
				to,
				at: OffsetDateTime::now_utc(),
				time_in_previous: current.entered_at.elapsed(),
				error,
				metadata,
			};

			current.state = to;
			current.entered_at = Instant::now();

			if current.history.len() == HISTORY_LIMIT {
				current.history.pop_front();
			}
			current.history.push_back(transition.clone());

			transition
		};

		tracing::debug!(
			from = %transition.from,
			to = %transition.to,
			time_in_previous = ?transition.time_in_previous,
			"connection state changed",
		);

		for handler in self.snapshot_handlers() {
			handler(&transition);
		}

		Ok(transition)
	}

	/// Registers a handler for all transitions.
	pub fn on_transition(&self, handler: impl Fn(&StateTransition) + Send + Sync + 'static)
	{
		self.handlers
			.write()
			.unwrap_or_else(std::sync::PoisonError::into_inner)
			.push(Arc::new(handler));
	}

	/// Registers a handler invoked whenever the client becomes connected.
	pub fn on_connected(&self, handler: impl Fn(&StateTransition) + Send + Sync + 'static)
	{
		self.on_transition(move |transition| {
			if transition.to == ConnectionState::Connected {
				handler(transition);
			}
		});
	}

	/// Registers a handler invoked whenever the client becomes disconnected.
	pub fn on_disconnected(&self, handler: impl Fn(&StateTransition) + Send + Sync + 'static)
	{
		self.on_transition(move |transition| {
			if transition.to == ConnectionState::Disconnected {
				handler(transition);
			}
		});
	}

	/// Registers a handler invoked whenever a (re)connection attempt starts.
	pub fn on_reconnecting(&self, handler: impl Fn(&StateTransition) + Send + Sync + 'static)
	{
		self.on_transition(move |transition| {
			if transition.to == ConnectionState::Connecting {
				handler(transition);
			}
		});
	}

	/// The most recent transitions, oldest first.
	pub fn recent_transitions(&self) -> Vec<StateTransition>
	{
		self.lock_current().history.iter().cloned().collect()
	}

	fn lock_current(&self) -> std::sync::MutexGuard<'_, Current>
	{
		self.current.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
	}

	fn snapshot_handlers(&self) -> Vec<TransitionHandler>
	{
		self.handlers
			.read()
			.unwrap_or_else(std::sync::PoisonError::into_inner)
			.iter()
			.map(Arc::clone)
			.collect()
	}
}

#[cfg(test)]
mod tests
{
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	const ALL: [ConnectionState; 4] = [
		ConnectionState::Disconnected,
		ConnectionState::Connecting,
		ConnectionState::Connected,
		ConnectionState::Disconnecting,
	];

	const LEGAL: [(ConnectionState, ConnectionState); 5] = [
		(ConnectionState::Disconnected, ConnectionState::Connecting),
		(ConnectionState::Connecting, ConnectionState::Connected),
		(ConnectionState::Connecting, ConnectionState::Disconnected),
		(ConnectionState::Connected, ConnectionState::Disconnecting),
		(ConnectionState::Disconnecting, ConnectionState::Disconnected),
	];

	#[test]
	fn transition_table_is_exact()
	{
		for from in ALL {
			for to in ALL {
				let expected = LEGAL.contains(&(from, to));
				assert_eq!(from.can_transition_to(to), expected, "{from} -> {to}");
			}
		}
	}

	#[test]
	fn illegal_transition_fails_without_side_effects()
	{
		let manager = StateManager::new();

		let err = manager
			.transition_to(ConnectionState::Connected, None, BTreeMap::new())
			.unwrap_err();

		assert_eq!(err.code(), code::ILLEGAL_TRANSITION);
		assert_eq!(manager.current_state(), ConnectionState::Disconnected);
		assert!(manager.recent_transitions().is_empty());
	}

	#[test]
	fn handlers_run_in_registration_order()
	{
		let manager = StateManager::new();
		let order = Arc::new(Mutex::new(Vec::new()));

		for tag in 0..3_usize {
			let order = Arc::clone(&order);
			manager.on_transition(move |_| order.lock().unwrap().push(tag));
		}

		manager
			.transition_to(ConnectionState::Connecting, None, BTreeMap::new())
			.unwrap();

		assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
	}

	#[test]
	fn derived_dispatches_filter_by_target_state()
	{
		let manager = StateManager::new();
		let connected = Arc::new(AtomicUsize::new(0));
		let reconnecting = Arc::new(AtomicUsize::new(0));

		{
			let connected = Arc::clone(&connected);
			manager.on_connected(move |_| {
				connected.fetch_add(1, Ordering::SeqCst);
			});
		}
		{
			let reconnecting = Arc::clone(&reconnecting);
			manager.on_reconnecting(move |_| {
				reconnecting.fetch_add(1, Ordering::SeqCst);
			});
		}

		manager
			.transition_to(ConnectionState::Connecting, None, BTreeMap::new())
			.unwrap();
		manager
			.transition_to(ConnectionState::Connected, None, BTreeMap::new())
			.unwrap();

		assert_eq!(connected.load(Ordering::SeqCst), 1);
		assert_eq!(reconnecting.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn handler_may_reenter_the_manager()
	{
		let manager = Arc::new(StateManager::new());

		{
			let manager_ref = Arc::clone(&manager);
			manager.on_transition(move |_| {
				// Must not deadlock.
				let _ = manager_ref.current_state();
			});
		}

		manager
			.transition_to(ConnectionState::Connecting, None, BTreeMap::new())
			.unwrap();
	}

	#[test]
	fn transition_records_metadata_and_duration()
	{
		let manager = StateManager::new();

		let mut metadata = BTreeMap::new();
		metadata.insert(String::from("reason"), String::from("initial_connect"));

		let transition = manager
			.transition_to(ConnectionState::Connecting, None, metadata)
			.unwrap();

		assert_eq!(transition.from, ConnectionState::Disconnected);
		assert_eq!(transition.to, ConnectionState::Connecting);
		assert_eq!(transition.metadata.get("reason").unwrap(), "initial_connect");

		let history = manager.recent_transitions();
		assert_eq!(history.len(), 1);
	}
}
