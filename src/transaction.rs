//! Transactions bound to pooled connections.
//!
//! `BEGIN TRANSACTION;` pins a connection from the pool to the transaction
//! for its whole lifetime; every transaction operation runs on that
//! connection. A transaction reaches exactly one terminal state (committed
//! or rolled back), after which the connection returns to the pool exactly
//! once. A background sweep force-rolls-back transactions that outlive the
//! configured timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use derive_more::Display;
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::error::{Error, Result, code};
use crate::pool::{ConnectionPool, PooledConn};
use crate::statement::Statement;
use crate::wire::ServerResponse;

/// How often the timeout sweep runs.
const SWEEP_PERIOD: Duration = Duration::from_secs(30);

/// The acknowledgement prefix `BEGIN TRANSACTION;` must produce.
const BEGIN_ACK_PREFIX: &str = "Transaction started with ID: ";

/// Advisory isolation level. Recorded on the transaction but never sent to
/// the server, which runs everything at its default isolation.
#[derive(Debug, Display, Default, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel
{
	#[display("READ UNCOMMITTED")]
	ReadUncommitted,

	#[default]
	#[display("READ COMMITTED")]
	ReadCommitted,

	#[display("REPEATABLE READ")]
	RepeatableRead,

	#[display("SERIALIZABLE")]
	Serializable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState
{
	Active,
	Committed,
	RolledBack,
}

struct TxInner
{
	id: String,
	isolation: IsolationLevel,
	started_at: Instant,
	state: Mutex<TxState>,
	connection: tokio::sync::Mutex<Option<PooledConn>>,
}

impl TxInner
{
	fn state(&self) -> TxState
	{
		*self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
	}

	fn set_state(&self, state: TxState)
	{
		*self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = state;
	}

	fn ensure_active(&self) -> Result<()>
	{
		match self.state() {
			TxState::Active => Ok(()),
			TxState::Committed => Err(Error::transaction(
				code::TX_ALREADY_COMMITTED,
				format!("transaction {} has already been committed", self.id),
			)),
			TxState::RolledBack => Err(Error::transaction(
				code::TX_ALREADY_ROLLED_BACK,
				format!("transaction {} has already been rolled back", self.id),
			)),
		}
	}
}

type ActiveMap = Arc<Mutex<HashMap<String, Arc<TxInner>>>>;

/// A live transaction. See the [module-level documentation](self).
pub struct Transaction
{
	inner: Arc<TxInner>,
	registry: ActiveMap,
}

impl std::fmt::Debug for Transaction
{
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		fmt.debug_struct("Transaction")
			.field("id", &self.inner.id)
			.field("isolation", &self.inner.isolation)
			.field("state", &format_args!("{:?}", self.inner.state()))
			.finish_non_exhaustive()
	}
}

impl Transaction
{
	pub fn id(&self) -> &str
	{
		&self.inner.id
	}

	pub fn isolation(&self) -> IsolationLevel
	{
		self.inner.isolation
	}

	pub fn is_committed(&self) -> bool
	{
		self.inner.state() == TxState::Committed
	}

	pub fn is_rolled_back(&self) -> bool
	{
		self.inner.state() == TxState::RolledBack
	}

	/// Runs a command on the transaction's bound connection.
	#[tracing::instrument(level = "debug", skip(self, cancel), fields(tx = %self.inner.id), err(level = "debug"))]
	pub async fn query(&self, cancel: &CancellationToken, command: &str) -> Result<ServerResponse>
	{
		self.inner.ensure_active()?;

		let connection = self.inner.connection.lock().await;

		let Some(ref connection) = *connection else {
			return Err(Error::transaction(
				code::TX_NOT_ACTIVE,
				format!("transaction {} has no bound connection", self.inner.id),
			));
		};

		connection.roundtrip(cancel, command).await
	}

	/// Prepares a statement scoped to this transaction.
	///
	/// The generated name is `tx_<first 8 of the id>_stmt_<nanos>`, which
	/// stays within the statement-name grammar.
	pub async fn prepare(&self, cancel: &CancellationToken, query: &str)
		-> Result<Arc<Statement>>
	{
		self.inner.ensure_active()?;

		let connection = self.inner.connection.lock().await;

		let Some(ref connection) = *connection else {
			return Err(Error::transaction(
				code::TX_NOT_ACTIVE,
				format!("transaction {} has no bound connection", self.inner.id),
			));
		};

		let name = self.statement_name();
		let statement = Statement::prepare(
			Arc::clone(connection.connection()),
			cancel,
			&name,
			query,
		)
		.await?;

		Ok(Arc::new(statement))
	}

	/// Prepares, executes, and deallocates a parameterized query on the
	/// transaction's connection.
	pub async fn query_with_params(
		&self,
		cancel: &CancellationToken,
		query: &str,
		params: &[crate::query::Value],
	) -> Result<ServerResponse>
	{
		let statement = self.prepare(cancel, query).await?;
		let result = statement.execute(cancel, params).await;

		if let Err(err) = statement.close(cancel).await {
			tracing::warn!(
				error = &err as &dyn std::error::Error,
				statement = statement.name(),
				"failed to deallocate transaction statement",
			);
		}

		result
	}

	/// Commits the transaction and returns its connection to the pool.
	#[tracing::instrument(level = "debug", skip(self, cancel), fields(tx = %self.inner.id), err)]
	pub async fn commit(&self, cancel: &CancellationToken) -> Result<()>
	{
		self.inner.ensure_active()?;

		let mut connection = self.inner.connection.lock().await;

		let Some(ref conn) = *connection else {
			return Err(Error::transaction(
				code::TX_NOT_ACTIVE,
				format!("transaction {} has no bound connection", self.inner.id),
			));
		};

		let response = conn.roundtrip(cancel, "COMMIT;").await?;

		if !response.is_success() {
			return Err(Error::transaction(
				code::TX_NOT_ACTIVE,
				format!("server rejected COMMIT: {}", response.error_message()),
			));
		}

		self.inner.set_state(TxState::Committed);
		drop(connection.take());
		unregister(&self.registry, &self.inner.id);

		Ok(())
	}

	/// Rolls the transaction back and returns its connection to the pool.
	///
	/// Rolling back an already-rolled-back transaction is a no-op. Failures
	/// while sending `ROLLBACK;` or reading its response are logged and
	/// tolerated; the server aborts the transaction when the connection
	/// dies anyway.
	#[tracing::instrument(level = "debug", skip(self, cancel), fields(tx = %self.inner.id), err)]
	pub async fn rollback(&self, cancel: &CancellationToken) -> Result<()>
	{
		match self.inner.state() {
			TxState::RolledBack => return Ok(()),
			TxState::Committed => {
				return Err(Error::transaction(
					code::TX_ALREADY_COMMITTED,
					format!("transaction {} has already been committed", self.inner.id),
				));
			},
			TxState::Active => {},
		}

		let mut connection = self.inner.connection.lock().await;

		if let Some(ref conn) = *connection {
			if let Err(err) = conn.roundtrip(cancel, "ROLLBACK;").await {
				tracing::warn!(
					error = &err as &dyn std::error::Error,
					tx = %self.inner.id,
					"ROLLBACK did not complete cleanly; continuing",
				);
			}
		}

		self.inner.set_state(TxState::RolledBack);
		drop(connection.take());
		unregister(&self.registry, &self.inner.id);

		Ok(())
	}

	fn statement_name(&self) -> String
	{
		let id_prefix = self
			.inner
			.id
			.chars()
			.filter(char::is_ascii_alphanumeric)
			.take(8)
			.collect::<String>();

		let nanos = std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.map(|elapsed| elapsed.as_nanos())
			.unwrap_or_default();

		format!("tx_{id_prefix}_stmt_{nanos}")
	}
}

/// Creates, tracks, and times out transactions.
#[derive(Clone)]
pub struct TransactionManager
{
	pool: ConnectionPool,
	active: ActiveMap,
	timeout: Duration,
}

impl std::fmt::Debug for TransactionManager
{
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		fmt.debug_struct("TransactionManager")
			.field("active", &self.active_count())
			.field("timeout", &self.timeout)
			.finish_non_exhaustive()
	}
}

impl TransactionManager
{
	pub fn new(pool: ConnectionPool, timeout: Duration) -> Self
	{
		Self {
			pool,
			active: Arc::new(Mutex::new(HashMap::new())),
			timeout,
		}
	}

	/// Starts a transaction, pinning a pooled connection to it.
	#[tracing::instrument(level = "debug", skip_all, err)]
	pub async fn begin(
		&self,
		cancel: &CancellationToken,
		wait_timeout: Option<Duration>,
		isolation: IsolationLevel,
	) -> Result<Transaction>
	{
		let connection = self.pool.get(cancel, wait_timeout).await?;
		let response = connection.roundtrip(cancel, "BEGIN TRANSACTION;").await?;

		let Some(id) = parse_begin_ack(&response) else {
			// Dropping the guard returns the connection to the pool.
			return Err(Error::transaction(
				code::E_BEGIN_PARSE_FAILED,
				format!(
					"could not find a transaction ID in the BEGIN acknowledgement: {}",
					response.error_message(),
				),
			));
		};

		let inner = Arc::new(TxInner {
			id: id.clone(),
			isolation,
			started_at: Instant::now(),
			state: Mutex::new(TxState::Active),
			connection: tokio::sync::Mutex::new(Some(connection)),
		});

		self.lock_active().insert(id.clone(), Arc::clone(&inner));
		tracing::debug!(tx = %id, %isolation, "transaction started");

		Ok(Transaction { inner, registry: Arc::clone(&self.active) })
	}

	/// Begins a transaction, runs `operation`, and commits on success.
	///
	/// On error the transaction rolls back and the operation's error is
	/// returned. On panic the transaction rolls back and the panic resumes.
	pub async fn in_transaction<F, T>(
		&self,
		cancel: &CancellationToken,
		wait_timeout: Option<Duration>,
		operation: F,
	) -> Result<T>
	where
		F: AsyncFnOnce(&Transaction) -> Result<T>,
	{
		let transaction = self
			.begin(cancel, wait_timeout, IsolationLevel::default())
			.await?;

		let outcome = std::panic::AssertUnwindSafe(operation(&transaction))
			.catch_unwind()
			.await;

		match outcome {
			Ok(Ok(value)) => {
				transaction.commit(cancel).await?;
				Ok(value)
			},
			Ok(Err(err)) => {
				if let Err(rollback_err) = transaction.rollback(cancel).await {
					tracing::warn!(
						error = &rollback_err as &dyn std::error::Error,
						tx = transaction.id(),
						"rollback after operation failure also failed",
					);
				}

				Err(err)
			},
			Err(panic) => {
				tracing::error!(tx = transaction.id(), "operation panicked; rolling back");

				if let Err(rollback_err) = transaction.rollback(cancel).await {
					tracing::warn!(
						error = &rollback_err as &dyn std::error::Error,
						tx = transaction.id(),
						"rollback after panic failed",
					);
				}

				std::panic::resume_unwind(panic)
			},
		}
	}

	pub fn active_count(&self) -> usize
	{
		self.lock_active().len()
	}

	pub fn active_ids(&self) -> Vec<String>
	{
		self.lock_active().keys().cloned().collect()
	}

	/// Rolls back every active transaction. Used during client shutdown.
	pub async fn rollback_all(&self, cancel: &CancellationToken)
	{
		for inner in self.drain_active() {
			let transaction = Transaction { inner, registry: Arc::clone(&self.active) };

			if let Err(err) = transaction.rollback(cancel).await {
				tracing::warn!(
					error = &err as &dyn std::error::Error,
					tx = transaction.id(),
					"failed to roll back transaction during shutdown",
				);
			}
		}
	}

	/// Spawns the background sweep that force-rolls-back transactions
	/// exceeding the timeout.
	pub fn spawn_timeout_monitor(&self, tasks: &TaskTracker, shutdown: CancellationToken)
	{
		self.spawn_timeout_monitor_with_period(tasks, shutdown, SWEEP_PERIOD);
	}

	pub(crate) fn spawn_timeout_monitor_with_period(
		&self,
		tasks: &TaskTracker,
		shutdown: CancellationToken,
		period: Duration,
	)
	{
		let manager = self.clone();

		tasks.spawn(async move {
			let mut ticker = tokio::time::interval(period);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			ticker.tick().await;

			loop {
				tokio::select! {
					() = shutdown.cancelled() => break,
					_ = ticker.tick() => manager.sweep_timed_out(&shutdown).await,
				}
			}
		});
	}

	async fn sweep_timed_out(&self, cancel: &CancellationToken)
	{
		let expired = {
			let active = self.lock_active();

			active
				.values()
				.filter(|inner| inner.started_at.elapsed() > self.timeout)
				.map(Arc::clone)
				.collect::<Vec<_>>()
		};

		for inner in expired {
			tracing::warn!(
				tx = %inner.id,
				age = ?inner.started_at.elapsed(),
				timeout = ?self.timeout,
				"transaction exceeded its timeout; forcing rollback",
			);

			let transaction = Transaction {
				inner,
				registry: Arc::clone(&self.active),
			};

			if let Err(err) = transaction.rollback(cancel).await {
				tracing::warn!(
					error = &err as &dyn std::error::Error,
					tx = transaction.id(),
					"forced rollback failed",
				);
			}
		}
	}

	fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<TxInner>>>
	{
		self.active.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
	}

	fn drain_active(&self) -> Vec<Arc<TxInner>>
	{
		self.lock_active().drain().map(|(_, inner)| inner).collect()
	}
}

fn unregister(registry: &ActiveMap, id: &str)
{
	registry
		.lock()
		.unwrap_or_else(std::sync::PoisonError::into_inner)
		.remove(id);
}

/// Extracts the transaction ID from a BEGIN acknowledgement.
fn parse_begin_ack(response: &ServerResponse) -> Option<String>
{
	let text = response.text();
	let start = text.find(BEGIN_ACK_PREFIX)? + BEGIN_ACK_PREFIX.len();

	let id = text[start..]
		.split(|ch: char| ch.is_whitespace() || ch == '"' || ch == '}')
		.next()?
		.trim_matches(|ch: char| !ch.is_ascii_alphanumeric() && ch != '-' && ch != '_');

	(!id.is_empty()).then(|| id.to_owned())
}

/// Generates a transaction-agnostic unique statement name, for
/// [`query_with_params`] outside transactions.
///
/// [`query_with_params`]: crate::Client::query_with_params
pub(crate) fn unique_statement_name() -> String
{
	format!("stmt_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests
{
	use super::*;

	fn ack(message: &str) -> ServerResponse
	{
		ServerResponse {
			status: String::from("success"),
			message: Some(message.to_owned()),
			..Default::default()
		}
	}

	#[test]
	fn begin_ack_parsing()
	{
		let response = ack("Transaction started with ID: tx-42abc");
		assert_eq!(parse_begin_ack(&response).as_deref(), Some("tx-42abc"));

		let response = ack("Transaction started with ID: abc123 (isolation: default)");
		assert_eq!(parse_begin_ack(&response).as_deref(), Some("abc123"));

		assert!(parse_begin_ack(&ack("OK")).is_none());
		assert!(parse_begin_ack(&ack("Transaction started with ID: ")).is_none());
	}

	#[test]
	fn generated_statement_names_are_valid()
	{
		let name = unique_statement_name();
		crate::statement::validate_statement_name(&name).unwrap();
	}
}
