//! The top-level client façade.
//!
//! [`Client`] composes the state machine, the connection pool, the hook
//! chain, the statement cache, the schema validator, the transaction
//! manager, and the migration runner into the public driver contract.
//! Cloning a client is cheap and shares all of the above.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ClientOptions;
use crate::connection::{
	Connection,
	ConnectionState,
	StateManager,
	authenticate,
};
use crate::error::{Error, Result};
use crate::health::{HealthMonitor, ReconnectController};
use crate::hooks::{CommandHook, HookChain, HookContext, LoggingHook};
use crate::migrate::MigrationRunner;
use crate::pool::{ConnectionFactory, ConnectionPool, PoolConfig, PoolStats};
use crate::query::{
	BuiltQuery,
	DeleteBuilder,
	InsertBuilder,
	SelectBuilder,
	UpdateBuilder,
	Value,
};
use crate::schema::{SchemaSnapshot, SchemaValidator};
use crate::statement::{CacheStats, Statement, StatementCache};
use crate::transaction::{IsolationLevel, Transaction, TransactionManager};
use crate::wire::{ServerResponse, TcpTransport};

/// DDL prefixes that invalidate the schema cache.
const DDL_PREFIXES: [&str; 4] = ["CREATE BUNDLE", "UPDATE BUNDLE", "DROP BUNDLE", "ALTER BUNDLE"];

/// Point-in-time snapshot of the client's internals.
#[derive(Debug, Clone, Copy)]
pub struct ClientStats
{
	pub pool: PoolStats,
	pub statements: CacheStats,
	pub active_transactions: usize,
}

struct ClientInner
{
	options: ClientOptions,
	state: Arc<StateManager>,
	pool: ConnectionPool,
	hooks: HookChain,
	statements: StatementCache,
	schema: SchemaValidator,
	transactions: TransactionManager,
	tasks: TaskTracker,
	shutdown: CancellationToken,
	closed: AtomicBool,
}

/// A connected SyndrDB client. See the [module-level documentation](self).
#[derive(Clone)]
pub struct Client
{
	inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client
{
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		fmt.debug_struct("Client")
			.field("state", &self.state())
			.field("remote_addr", &self.inner.options.remote_addr())
			.finish_non_exhaustive()
	}
}

impl Client
{
	/// Connects using a `syndrdb://` connection string.
	pub async fn connect_url(conn_string: &str) -> Result<Self>
	{
		let options = ClientOptions::parse_conn_string(conn_string)?;
		Self::connect_with(options, conn_string.trim().to_owned()).await
	}

	/// Connects using explicit options.
	pub async fn connect(options: ClientOptions) -> Result<Self>
	{
		let conn_string = options.connection_string();
		Self::connect_with(options, conn_string).await
	}

	#[tracing::instrument(
		level = "info",
		name = "connect",
		skip_all,
		fields(remote_addr = %options.remote_addr(), database = %options.database),
		err,
	)]
	async fn connect_with(options: ClientOptions, conn_string: String) -> Result<Self>
	{
		let state = Arc::new(StateManager::new());

		let mut metadata = BTreeMap::new();
		metadata.insert(String::from("reason"), String::from("initial_connect"));
		state.transition_to(ConnectionState::Connecting, None, metadata)?;

		let factory = make_factory(&options, conn_string);

		let pool = ConnectionPool::new(factory, PoolConfig {
			min_idle: options.pool_min_size,
			max_open: options.pool_max_size.max(options.pool_min_size).max(1),
			idle_timeout: options.pool_idle_timeout,
			health_check_interval: options.health_check_interval,
		});

		if let Err(err) = initialize_with_retries(&pool, options.max_retries).await {
			let _ = state.transition_to(
				ConnectionState::Disconnected,
				Some(err.to_string()),
				BTreeMap::new(),
			);

			return Err(err);
		}

		let mut metadata = BTreeMap::new();
		metadata.insert(String::from("pool_size"), options.pool_max_size.to_string());
		state.transition_to(ConnectionState::Connected, None, metadata)?;

		let shutdown = CancellationToken::new();
		let tasks = TaskTracker::new();

		let transactions = TransactionManager::new(pool.clone(), options.transaction_timeout);
		transactions.spawn_timeout_monitor(&tasks, shutdown.child_token());

		let reconnect = ReconnectController::new(
			Arc::clone(&state),
			pool.clone(),
			options.max_reconnect_attempts,
		);

		{
			let ping_pool = pool.clone();
			let timeout = options.default_timeout;

			HealthMonitor::new(options.health_check_interval).spawn(
				&tasks,
				shutdown.child_token(),
				Arc::clone(&state),
				move || {
					let pool = ping_pool.clone();

					async move {
						let cancel = CancellationToken::new();
						let connection = pool.get(&cancel, Some(timeout)).await?;

						tokio::time::timeout(timeout, connection.ping(&cancel))
							.await
							.map_err(|_| Error::deadline("health ping timed out"))?
					}
				},
				reconnect,
			);
		}

		let inner = Arc::new(ClientInner {
			hooks: HookChain::new(),
			statements: StatementCache::new(options.prepared_statement_cache_size),
			schema: SchemaValidator::new(options.schema_cache_ttl),
			transactions,
			options,
			state,
			pool,
			tasks,
			shutdown,
			closed: AtomicBool::new(false),
		});

		let client = Self { inner };

		if client.inner.options.debug_mode {
			client.register_hook(Arc::new(LoggingHook));
		}

		if client.inner.options.preload_schema {
			if let Err(err) = client.schema().await {
				tracing::warn!(
					error = &err as &dyn std::error::Error,
					"failed to preload the schema snapshot",
				);
			}
		}

		tracing::info!("connected");
		Ok(client)
	}

	/// The current connection state.
	pub fn state(&self) -> ConnectionState
	{
		self.inner.state.current_state()
	}

	/// The state machine, for registering lifecycle handlers.
	pub fn state_manager(&self) -> &StateManager
	{
		&self.inner.state
	}

	/// The options this client was created with.
	pub fn options(&self) -> &ClientOptions
	{
		&self.inner.options
	}

	pub fn stats(&self) -> ClientStats
	{
		ClientStats {
			pool: self.inner.pool.stats(),
			statements: self.inner.statements.stats(),
			active_transactions: self.inner.transactions.active_count(),
		}
	}

	// == command pipeline =================================================

	/// Sends a raw command through the full pipeline: state gate, hooks,
	/// pooled connection checkout, send/receive, schema-cache bookkeeping.
	pub async fn send_command(&self, command: &str) -> Result<ServerResponse>
	{
		self.send_command_with(&CancellationToken::new(), command).await
	}

	/// [`send_command()`](Self::send_command) honoring a caller-provided
	/// cancellation token.
	#[tracing::instrument(level = "debug", skip_all, err(level = "debug"))]
	pub async fn send_command_with(
		&self,
		cancel: &CancellationToken,
		command: &str,
	) -> Result<ServerResponse>
	{
		self.require_connected()?;

		let mut ctx = HookContext::new(command);

		if let Err(err) = self.inner.hooks.run_before(&mut ctx).await {
			ctx.duration = Some(ctx.started_at.elapsed());
			ctx.error = Some(err);

			let after_error = self.inner.hooks.run_after(&mut ctx).await;

			return Err(after_error
				.or(ctx.error)
				.unwrap_or_else(|| unreachable!("error was just set")));
		}

		// Before-hooks may have rewritten the command.
		let command = ctx.command.clone();
		let result = self.roundtrip_pooled(cancel, &command).await;

		ctx.duration = Some(ctx.started_at.elapsed());
		match result {
			Ok(response) => ctx.result = Some(response),
			Err(err) => ctx.error = Some(err),
		}

		let after_error = self.inner.hooks.run_after(&mut ctx).await;

		if let Some(err) = after_error.or(ctx.error.take()) {
			return Err(err);
		}

		let response = ctx.result.unwrap_or_else(|| {
			unreachable!("either result or error is set after a roundtrip");
		});

		if is_ddl(&command) {
			self.inner.schema.invalidate().await;
			self.maybe_refresh_schema_in_background();
		}

		Ok(response)
	}

	async fn roundtrip_pooled(
		&self,
		cancel: &CancellationToken,
		command: &str,
	) -> Result<ServerResponse>
	{
		let timeout = self.inner.options.default_timeout;
		let connection = self.inner.pool.get(cancel, Some(timeout)).await?;

		match tokio::time::timeout(timeout, connection.roundtrip(cancel, command)).await {
			Ok(result) => result,
			Err(_) => {
				connection.mark_dead();
				Err(Error::deadline(format!("command timed out after {timeout:?}")))
			},
		}
	}

	/// Pings the server over a pooled connection.
	pub async fn ping(&self) -> Result<()>
	{
		self.require_connected()?;

		let cancel = CancellationToken::new();
		let timeout = self.inner.options.default_timeout;
		let connection = self.inner.pool.get(&cancel, Some(timeout)).await?;

		tokio::time::timeout(timeout, connection.ping(&cancel))
			.await
			.map_err(|_| Error::deadline("ping timed out"))?
	}

	// == query builders ===================================================

	pub fn select(&self, bundle: impl Into<String>) -> SelectBuilder
	{
		SelectBuilder::new(bundle)
	}

	pub fn insert_into(&self, bundle: impl Into<String>) -> InsertBuilder
	{
		InsertBuilder::new(bundle)
	}

	pub fn update(&self, bundle: impl Into<String>) -> UpdateBuilder
	{
		UpdateBuilder::new(bundle)
	}

	pub fn delete_from(&self, bundle: impl Into<String>) -> DeleteBuilder
	{
		DeleteBuilder::new(bundle)
	}

	/// Validates and executes a SELECT query. Parameterized WHERE values go
	/// through a transient prepared statement.
	pub async fn query(&self, builder: &SelectBuilder) -> Result<ServerResponse>
	{
		let snapshot = self.schema().await?;
		SchemaValidator::validate_select(&snapshot, builder)?;

		let BuiltQuery { text, params, .. } = builder.build()?;

		if params.is_empty() {
			self.send_command(&text).await
		} else {
			self.query_with_params(&text, &params).await
		}
	}

	/// Validates and executes an insert.
	pub async fn insert(&self, builder: &InsertBuilder) -> Result<ServerResponse>
	{
		let snapshot = self.schema().await?;
		SchemaValidator::validate_insert(&snapshot, builder)?;

		let built = builder.build()?;
		self.send_command(&built.text).await
	}

	/// Validates and executes an update.
	pub async fn run_update(&self, builder: &UpdateBuilder) -> Result<ServerResponse>
	{
		let snapshot = self.schema().await?;
		SchemaValidator::validate_update(&snapshot, builder)?;

		let built = builder.build()?;
		self.send_command(&built.text).await
	}

	/// Validates and executes a delete. Deletes without a WHERE clause are
	/// rejected before anything is sent.
	pub async fn run_delete(&self, builder: &DeleteBuilder) -> Result<ServerResponse>
	{
		// The WHERE guard fires even when schema validation is unavailable.
		let built = builder.build()?;

		let snapshot = self.schema().await?;
		SchemaValidator::validate_delete(&snapshot, builder)?;

		self.send_command(&built.text).await
	}

	/// Executes a mutation and reports the affected-document count when the
	/// server includes one.
	pub async fn execute(&self, command: &str) -> Result<u64>
	{
		let response = self.send_command(command).await?;

		if !response.is_success() {
			return Err(Error::protocol(format!(
				"server rejected command: {}",
				response.error_message(),
			)));
		}

		Ok(affected_count(&response).unwrap_or(0))
	}

	// == prepared statements ==============================================

	/// Prepares a named statement and caches it. Evicting the LRU entry
	/// deallocates it on its bound connection.
	pub async fn prepare(&self, name: &str, query: &str) -> Result<Arc<Statement>>
	{
		self.require_connected()?;

		if let Some(statement) = self.inner.statements.get(name) {
			if statement.connection().is_alive() {
				return Ok(statement);
			}

			// The bound connection died; the server-side statement went
			// with it.
			self.inner.statements.remove(name);
		}

		let cancel = CancellationToken::new();
		let timeout = self.inner.options.default_timeout;
		let connection = self.inner.pool.get(&cancel, Some(timeout)).await?;

		let statement = Arc::new(
			Statement::prepare(
				Arc::clone(connection.connection()),
				&cancel,
				name,
				query,
			)
			.await?,
		);

		if let Some(evicted) = self.inner.statements.insert(Arc::clone(&statement)) {
			// Deallocation failure must not block the eviction; the server
			// side statement dies with its connection at the latest.
			if let Err(err) = evicted.close(&cancel).await {
				tracing::warn!(
					error = &err as &dyn std::error::Error,
					statement = evicted.name(),
					"failed to deallocate evicted statement",
				);
			}
		}

		Ok(statement)
	}

	/// A cached statement by name, if present.
	pub fn statement(&self, name: &str) -> Option<Arc<Statement>>
	{
		self.inner.statements.get(name)
	}

	/// Prepares, executes, and deallocates a one-off parameterized query.
	pub async fn query_with_params(
		&self,
		query: &str,
		params: &[Value],
	) -> Result<ServerResponse>
	{
		self.require_connected()?;

		let cancel = CancellationToken::new();
		let timeout = self.inner.options.default_timeout;
		let connection = self.inner.pool.get(&cancel, Some(timeout)).await?;

		let name = crate::transaction::unique_statement_name();
		let statement = Statement::prepare(
			Arc::clone(connection.connection()),
			&cancel,
			&name,
			query,
		)
		.await?;

		let result = statement.execute(&cancel, params).await;

		if let Err(err) = statement.close(&cancel).await {
			tracing::warn!(
				error = &err as &dyn std::error::Error,
				statement = %name,
				"failed to deallocate one-off statement",
			);
		}

		result
	}

	// == transactions =====================================================

	/// Begins a transaction at the default (advisory) isolation level.
	pub async fn begin(&self) -> Result<Transaction>
	{
		self.begin_with_isolation(IsolationLevel::default()).await
	}

	pub async fn begin_with_isolation(&self, isolation: IsolationLevel) -> Result<Transaction>
	{
		self.require_connected()?;

		self.inner
			.transactions
			.begin(
				&CancellationToken::new(),
				Some(self.inner.options.default_timeout),
				isolation,
			)
			.await
	}

	/// Runs `operation` inside a transaction: commits on success, rolls
	/// back on error or panic.
	pub async fn in_transaction<F, T>(&self, operation: F) -> Result<T>
	where
		F: AsyncFnOnce(&Transaction) -> Result<T>,
	{
		self.require_connected()?;

		self.inner
			.transactions
			.in_transaction(
				&CancellationToken::new(),
				Some(self.inner.options.default_timeout),
				operation,
			)
			.await
	}

	// == schema ===========================================================

	/// The schema snapshot, fetched through `SHOW BUNDLES;` and cached for
	/// the configured TTL.
	pub async fn schema(&self) -> Result<Arc<SchemaSnapshot>>
	{
		let client = self.clone();

		self.inner
			.schema
			.get_schema(move || async move { client.fetch_schema().await })
			.await
	}

	/// Drops the cached schema snapshot.
	pub async fn invalidate_schema_cache(&self)
	{
		self.inner.schema.invalidate().await;
	}

	async fn fetch_schema(&self) -> Result<SchemaSnapshot>
	{
		let response = self.send_command("SHOW BUNDLES;").await?;

		if !response.is_success() {
			return Err(Error::protocol(format!(
				"SHOW BUNDLES failed: {}",
				response.error_message(),
			)));
		}

		SchemaSnapshot::from_response(&response)
	}

	fn maybe_refresh_schema_in_background(&self)
	{
		if !self.inner.options.preload_schema {
			return;
		}

		let client = self.clone();
		let shutdown = self.inner.shutdown.child_token();

		self.inner.tasks.spawn(async move {
			if shutdown.is_cancelled() {
				return;
			}

			if let Err(err) = client.schema().await {
				tracing::debug!(
					error = &err as &dyn std::error::Error,
					"background schema refresh failed",
				);
			}
		});
	}

	// == hooks ============================================================

	/// Registers a hook, replacing any hook with the same name in place.
	pub fn register_hook(&self, hook: Arc<dyn CommandHook>)
	{
		self.inner.hooks.register(hook);
	}

	pub fn unregister_hook(&self, name: &str) -> bool
	{
		self.inner.hooks.unregister(name)
	}

	/// Hook names in execution order.
	pub fn hooks(&self) -> Vec<String>
	{
		self.inner.hooks.names()
	}

	// == migrations =======================================================

	/// A migration runner executing through this client.
	///
	/// The runner starts with an empty history ledger; load one with
	/// [`MigrationRunner::set_history()`] or point it at a directory.
	pub fn migrations(&self) -> MigrationRunner
	{
		MigrationRunner::new(Arc::new(self.clone()))
	}

	// == lifecycle ========================================================

	/// Gracefully shuts the client down: rolls back active transactions,
	/// deallocates cached statements, stops background tasks, closes the
	/// pool. Idempotent.
	#[tracing::instrument(level = "info", skip_all)]
	pub async fn close(&self) -> Result<()>
	{
		if self.inner.closed.swap(true, Ordering::AcqRel) {
			return Ok(());
		}

		let _ = self.inner.state.transition_to(
			ConnectionState::Disconnecting,
			None,
			BTreeMap::new(),
		);

		let cancel = CancellationToken::new();
		self.inner.transactions.rollback_all(&cancel).await;

		for statement in self.inner.statements.clear() {
			let _ = statement.close(&cancel).await;
		}

		self.inner.shutdown.cancel();
		self.inner.tasks.close();
		self.inner.tasks.wait().await;

		self.inner.pool.close().await;

		let _ = self.inner.state.transition_to(
			ConnectionState::Disconnected,
			None,
			BTreeMap::new(),
		);

		tracing::info!("client closed");
		Ok(())
	}

	fn require_connected(&self) -> Result<()>
	{
		let state = self.state();

		if state == ConnectionState::Connected {
			return Ok(());
		}

		Err(Error::invalid_state(format!(
			"operation requires state CONNECTED but the client is {state}",
		))
		.with_detail("state", state.to_string()))
	}
}

#[async_trait]
impl crate::migrate::CommandExecutor for Client
{
	async fn execute_command(
		&self,
		cancel: &CancellationToken,
		command: &str,
	) -> Result<ServerResponse>
	{
		self.send_command_with(cancel, command).await
	}
}

/// Builds the connection factory closure captured by the pool.
///
/// Capturing everything by value here is what keeps the pool from holding
/// any reference back to the client.
fn make_factory(options: &ClientOptions, conn_string: String) -> ConnectionFactory
{
	let host = options.host.clone();
	let port = options.port;
	let tls = options.tls.clone();
	let connect_timeout = options.default_timeout;
	let remote_addr = options.remote_addr();

	Arc::new(move || {
		let host = host.clone();
		let tls = tls.clone();
		let conn_string = conn_string.clone();
		let remote_addr = remote_addr.clone();

		Box::pin(async move {
			let transport = TcpTransport::connect(&host, port, Some(&tls), connect_timeout)
				.await?;

			let connection = Connection::new(Box::new(transport), remote_addr);
			let cancel = CancellationToken::new();

			tokio::time::timeout(
				connect_timeout,
				authenticate(&connection, &conn_string, &cancel),
			)
			.await
			.map_err(|_| Error::auth_failed("handshake timed out"))??;

			Ok(connection)
		})
	})
}

/// Connect-time retry loop: 100 ms base with doubling backoff.
async fn initialize_with_retries(pool: &ConnectionPool, max_retries: u32) -> Result<()>
{
	let mut attempt = 0_u32;

	loop {
		match pool.initialize().await {
			Ok(()) => return Ok(()),
			Err(err) if attempt < max_retries => {
				let backoff = Duration::from_millis(100)
					.saturating_mul(2_u32.saturating_pow(attempt));

				tracing::warn!(
					attempt = attempt + 1,
					backoff = ?backoff,
					error = &err as &dyn std::error::Error,
					"connect attempt failed; retrying",
				);

				tokio::time::sleep(backoff).await;
				attempt += 1;
			},
			Err(err) => return Err(err),
		}
	}
}

fn is_ddl(command: &str) -> bool
{
	let command = command.trim_start();

	DDL_PREFIXES.iter().any(|prefix| {
		command
			.get(..prefix.len())
			.is_some_and(|head| head.eq_ignore_ascii_case(prefix))
	})
}

/// Extracts an affected-document count from a mutation response, if the
/// server included one.
fn affected_count(response: &ServerResponse) -> Option<u64>
{
	let data = response.data.as_ref()?;

	for key in ["count", "affected", "documentsAffected"] {
		if let Some(count) = data.get(key).and_then(serde_json::Value::as_u64) {
			return Some(count);
		}
	}

	None
}
