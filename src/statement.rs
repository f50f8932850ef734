//! Prepared statements and the per-client statement cache.
//!
//! A [`Statement`] is valid only on the connection it was prepared on.
//! Executing one sends `EXECUTE <name>` with ENQ-separated, escape-doubled
//! parameters; closing one sends `DEALLOCATE <name>` exactly once. The
//! [`StatementCache`] is a mutex-guarded LRU keyed by statement name;
//! evicting an entry hands it back to the caller so the caller can
//! deallocate it on its bound connection.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Instant;

use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::{Error, ErrorKind, Result, code};
use crate::query::Value;
use crate::wire::{ENQ, ServerResponse, escape_param};

static NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new("^[A-Za-z0-9_]+$").unwrap_or_else(|err| {
		unreachable!("hard-coded regex is valid: {err}");
	})
});

static PLACEHOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"\$([0-9]+)").unwrap_or_else(|err| {
		unreachable!("hard-coded regex is valid: {err}");
	})
});

/// Validates a statement name against `[A-Za-z0-9_]+`.
pub fn validate_statement_name(name: &str) -> Result<()>
{
	if NAME_REGEX.is_match(name) {
		return Ok(());
	}

	Err(Error::new(
		ErrorKind::Query,
		code::E_INVALID_STATEMENT_NAME,
		format!("invalid statement name `{name}`; expected [A-Za-z0-9_]+"),
	))
}

/// The number of parameters a query takes: the maximum `$N` it mentions.
pub fn count_placeholders(query: &str) -> usize
{
	PLACEHOLDER_REGEX
		.captures_iter(query)
		.filter_map(|captures| captures.get(1)?.as_str().parse::<usize>().ok())
		.max()
		.unwrap_or(0)
}

/// Builds the `EXECUTE` frame body for a statement and its parameters.
///
/// Parameters are stringified (null becomes the empty string), escape-
/// doubled on the control bytes, and joined with ENQ separators.
pub(crate) fn build_execute_command(name: &str, params: &[Value]) -> String
{
	let mut command = format!("EXECUTE {name}");

	for param in params {
		command.push(ENQ as char);
		command.push_str(&escape_param(&param.to_wire_string()));
	}

	command
}

/// A statement prepared on one specific connection.
pub struct Statement
{
	name: String,
	query: String,
	param_count: usize,
	connection: Arc<Connection>,
	closed: AtomicBool,
	created_at: Instant,
}

impl std::fmt::Debug for Statement
{
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		fmt.debug_struct("Statement")
			.field("name", &self.name)
			.field("param_count", &self.param_count)
			.field("closed", &self.is_closed())
			.finish_non_exhaustive()
	}
}

impl Statement
{
	/// Prepares `query` under `name` on `connection`.
	#[tracing::instrument(level = "debug", skip(connection, cancel), err)]
	pub(crate) async fn prepare(
		connection: Arc<Connection>,
		cancel: &CancellationToken,
		name: &str,
		query: &str,
	) -> Result<Self>
	{
		validate_statement_name(name)?;

		let response = connection
			.roundtrip(cancel, &format!("PREPARE {name} AS {query}"))
			.await?;

		if !response.is_success() {
			return Err(Error::invalid_query(format!(
				"server rejected PREPARE for `{name}`: {}",
				response.error_message(),
			)));
		}

		Ok(Self {
			name: name.to_owned(),
			query: query.to_owned(),
			param_count: count_placeholders(query),
			connection,
			closed: AtomicBool::new(false),
			created_at: Instant::now(),
		})
	}

	pub fn name(&self) -> &str
	{
		&self.name
	}

	pub fn query(&self) -> &str
	{
		&self.query
	}

	pub fn param_count(&self) -> usize
	{
		self.param_count
	}

	pub fn is_closed(&self) -> bool
	{
		self.closed.load(Ordering::Acquire)
	}

	pub fn created_at(&self) -> Instant
	{
		self.created_at
	}

	/// The connection this statement is bound to.
	pub(crate) fn connection(&self) -> &Arc<Connection>
	{
		&self.connection
	}

	/// Executes the statement with the given parameters.
	#[tracing::instrument(level = "debug", skip(self, cancel, params), fields(name = %self.name), err(level = "debug"))]
	pub async fn execute(
		&self,
		cancel: &CancellationToken,
		params: &[Value],
	) -> Result<ServerResponse>
	{
		if self.is_closed() {
			return Err(Error::invalid_query(format!(
				"statement `{}` has been closed",
				self.name,
			)));
		}

		if params.len() != self.param_count {
			return Err(Error::new(
				ErrorKind::Query,
				code::E_PARAM_COUNT,
				format!(
					"statement `{}` takes {} parameters but {} were given",
					self.name,
					self.param_count,
					params.len(),
				),
			));
		}

		self.connection
			.roundtrip(cancel, &build_execute_command(&self.name, params))
			.await
	}

	/// Sends `DEALLOCATE` for this statement. Idempotent; only the first
	/// call reaches the server.
	pub async fn close(&self, cancel: &CancellationToken) -> Result<()>
	{
		if self.closed.swap(true, Ordering::AcqRel) {
			return Ok(());
		}

		self.connection
			.roundtrip(cancel, &format!("DEALLOCATE {}", self.name))
			.await
			.map(|_| ())
	}
}

/// Statement cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats
{
	pub size: usize,
	pub hits: u64,
	pub misses: u64,
	pub evictions: u64,
}

struct CacheInner
{
	map: HashMap<String, Arc<Statement>>,

	/// Access order, least recently used first.
	order: VecDeque<String>,
}

/// LRU cache of prepared statements, keyed by name.
pub struct StatementCache
{
	inner: Mutex<CacheInner>,
	max_size: usize,
	hits: AtomicU64,
	misses: AtomicU64,
	evictions: AtomicU64,
}

impl std::fmt::Debug for StatementCache
{
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		fmt.debug_struct("StatementCache")
			.field("len", &self.len())
			.field("max_size", &self.max_size)
			.finish_non_exhaustive()
	}
}

impl StatementCache
{
	pub fn new(max_size: usize) -> Self
	{
		Self {
			inner: Mutex::new(CacheInner {
				map: HashMap::new(),
				order: VecDeque::new(),
			}),
			max_size,
			hits: AtomicU64::new(0),
			misses: AtomicU64::new(0),
			evictions: AtomicU64::new(0),
		}
	}

	/// Looks up a statement, marking it most recently used.
	pub fn get(&self, name: &str) -> Option<Arc<Statement>>
	{
		let mut inner = self.lock();

		let Some(statement) = inner.map.get(name).map(Arc::clone) else {
			self.misses.fetch_add(1, Ordering::Relaxed);
			return None;
		};

		touch(&mut inner.order, name);
		self.hits.fetch_add(1, Ordering::Relaxed);

		Some(statement)
	}

	/// Inserts a statement, returning the least recently used entry when
	/// the cache is at capacity. The caller is responsible for
	/// deallocating the evicted statement.
	pub fn insert(&self, statement: Arc<Statement>) -> Option<Arc<Statement>>
	{
		if self.max_size == 0 {
			return None;
		}

		let mut inner = self.lock();
		let name = statement.name().to_owned();

		if inner.map.insert(name.clone(), statement).is_some() {
			touch(&mut inner.order, &name);
			return None;
		}

		inner.order.push_back(name);

		if inner.map.len() <= self.max_size {
			return None;
		}

		let evicted_name = inner.order.pop_front()?;
		let evicted = inner.map.remove(&evicted_name);

		if evicted.is_some() {
			self.evictions.fetch_add(1, Ordering::Relaxed);
		}

		evicted
	}

	pub fn remove(&self, name: &str) -> Option<Arc<Statement>>
	{
		let mut inner = self.lock();
		inner.order.retain(|entry| entry != name);
		inner.map.remove(name)
	}

	/// Empties the cache, returning all statements for deallocation.
	pub fn clear(&self) -> Vec<Arc<Statement>>
	{
		let mut inner = self.lock();
		inner.order.clear();
		inner.map.drain().map(|(_, statement)| statement).collect()
	}

	pub fn len(&self) -> usize
	{
		self.lock().map.len()
	}

	pub fn is_empty(&self) -> bool
	{
		self.len() == 0
	}

	pub fn stats(&self) -> CacheStats
	{
		CacheStats {
			size: self.len(),
			hits: self.hits.load(Ordering::Relaxed),
			misses: self.misses.load(Ordering::Relaxed),
			evictions: self.evictions.load(Ordering::Relaxed),
		}
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner>
	{
		self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
	}
}

fn touch(order: &mut VecDeque<String>, name: &str)
{
	if let Some(idx) = order.iter().position(|entry| entry == name) {
		if let Some(entry) = order.remove(idx) {
			order.push_back(entry);
		}
	}
}
