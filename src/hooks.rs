//! The command hook chain.
//!
//! Every command the client sends passes through an ordered list of hooks.
//! Before-hooks run in registration order and may rewrite the command;
//! the first before-hook error aborts the command without sending it.
//! After-hooks also run in registration order, always all of them, and the
//! last error any of them returns replaces the command's error.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use derive_more::Display;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::wire::ServerResponse;

/// Rough classification of a command, inferred from its leading keyword.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType
{
	#[display("query")]
	Query,

	#[display("mutation")]
	Mutation,

	#[display("transaction")]
	Transaction,

	#[display("schema")]
	Schema,

	#[display("unknown")]
	Unknown,
}

impl CommandType
{
	/// Infers the command type from the command text by case-insensitive
	/// prefix match.
	pub fn infer(command: &str) -> Self
	{
		let command = command.trim_start();

		let starts_with = |prefix: &str| {
			command
				.get(..prefix.len())
				.is_some_and(|head| head.eq_ignore_ascii_case(prefix))
		};

		if starts_with("SELECT") || starts_with("SHOW") {
			Self::Query
		} else if starts_with("INSERT") || starts_with("UPDATE") || starts_with("DELETE") {
			Self::Mutation
		} else if starts_with("BEGIN") || starts_with("COMMIT") || starts_with("ROLLBACK") {
			Self::Transaction
		} else if starts_with("CREATE") || starts_with("DROP") {
			Self::Schema
		} else {
			Self::Unknown
		}
	}
}

/// Per-command context threaded through the hook chain.
#[derive(Debug)]
pub struct HookContext
{
	/// The command text. Before-hooks may rewrite it.
	pub command: String,

	pub command_type: CommandType,

	/// Fresh per-command identifier, for correlation in logs.
	pub trace_id: Uuid,

	pub started_at: Instant,

	/// Free-form metadata shared between hooks.
	pub metadata: BTreeMap<String, String>,

	/// The response, set before after-hooks run on success.
	pub result: Option<ServerResponse>,

	/// The command error, set before after-hooks run on failure.
	pub error: Option<Error>,

	/// Wall-clock duration, set before after-hooks run.
	pub duration: Option<Duration>,
}

impl HookContext
{
	pub fn new(command: impl Into<String>) -> Self
	{
		let command = command.into();

		Self {
			command_type: CommandType::infer(&command),
			command,
			trace_id: Uuid::new_v4(),
			started_at: Instant::now(),
			metadata: BTreeMap::new(),
			result: None,
			error: None,
			duration: None,
		}
	}
}

/// An interceptor around every command.
#[async_trait]
pub trait CommandHook: Send + Sync
{
	/// Stable name; registering another hook with the same name replaces
	/// this one in place.
	fn name(&self) -> &str;

	/// Runs before the command is sent. May rewrite `ctx.command`.
	/// Returning an error aborts the command.
	async fn before(&self, ctx: &mut HookContext) -> Result<()>
	{
		let _ = ctx;
		Ok(())
	}

	/// Runs after the command completed (successfully or not).
	async fn after(&self, ctx: &mut HookContext) -> Result<()>
	{
		let _ = ctx;
		Ok(())
	}
}

/// Ordered list of [`CommandHook`]s.
#[derive(Default)]
pub struct HookChain
{
	hooks: RwLock<Vec<Arc<dyn CommandHook>>>,
}

impl std::fmt::Debug for HookChain
{
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		fmt.debug_struct("HookChain").field("hooks", &self.names()).finish()
	}
}

impl HookChain
{
	pub fn new() -> Self
	{
		Self::default()
	}

	/// Appends `hook`, or replaces an existing hook with the same name
	/// while preserving its position.
	pub fn register(&self, hook: Arc<dyn CommandHook>)
	{
		let mut hooks = self.lock_write();

		match hooks.iter().position(|existing| existing.name() == hook.name()) {
			Some(idx) => hooks[idx] = hook,
			None => hooks.push(hook),
		}
	}

	/// Removes the hook named `name`. Returns whether anything was removed.
	pub fn unregister(&self, name: &str) -> bool
	{
		let mut hooks = self.lock_write();
		let before = hooks.len();
		hooks.retain(|hook| hook.name() != name);
		hooks.len() != before
	}

	/// Hook names in execution order.
	pub fn names(&self) -> Vec<String>
	{
		self.snapshot().iter().map(|hook| hook.name().to_owned()).collect()
	}

	/// Runs all before-hooks in order, aborting on the first error.
	pub async fn run_before(&self, ctx: &mut HookContext) -> Result<()>
	{
		for hook in self.snapshot() {
			hook.before(ctx).await.map_err(|err| {
				tracing::debug!(
					hook = hook.name(),
					error = &err as &dyn std::error::Error,
					"before-hook aborted command",
				);
				err
			})?;
		}

		Ok(())
	}

	/// Runs all after-hooks in order. Every hook runs even when earlier
	/// ones fail; the last error wins and is returned.
	pub async fn run_after(&self, ctx: &mut HookContext) -> Option<Error>
	{
		let mut last_error = None;

		for hook in self.snapshot() {
			if let Err(err) = hook.after(ctx).await {
				tracing::debug!(
					hook = hook.name(),
					error = &err as &dyn std::error::Error,
					"after-hook returned an error",
				);
				last_error = Some(err);
			}
		}

		last_error
	}

	fn snapshot(&self) -> Vec<Arc<dyn CommandHook>>
	{
		self.hooks
			.read()
			.unwrap_or_else(std::sync::PoisonError::into_inner)
			.iter()
			.map(Arc::clone)
			.collect()
	}

	fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<dyn CommandHook>>>
	{
		self.hooks.write().unwrap_or_else(std::sync::PoisonError::into_inner)
	}
}

/// Stock hook logging every command at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHook;

#[async_trait]
impl CommandHook for LoggingHook
{
	fn name(&self) -> &str
	{
		"logging"
	}

	async fn before(&self, ctx: &mut HookContext) -> Result<()>
	{
		tracing::debug!(
			trace_id = %ctx.trace_id,
			command_type = %ctx.command_type,
			command = %ctx.command,
			"sending command",
		);

		Ok(())
	}

	async fn after(&self, ctx: &mut HookContext) -> Result<()>
	{
		match ctx.error {
			None => tracing::debug!(
				trace_id = %ctx.trace_id,
				duration = ?ctx.duration,
				"command completed",
			),
			Some(ref err) => tracing::warn!(
				trace_id = %ctx.trace_id,
				duration = ?ctx.duration,
				error = err as &dyn std::error::Error,
				"command failed",
			),
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests
{
	use std::sync::Mutex;
	use std::sync::atomic::{AtomicBool, Ordering};

	use super::*;

	struct RecordingHook
	{
		name: String,
		log: Arc<Mutex<Vec<String>>>,
		fail_before: AtomicBool,
		fail_after: AtomicBool,
	}

	impl RecordingHook
	{
		fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self>
		{
			Arc::new(Self {
				name: name.to_owned(),
				log: Arc::clone(log),
				fail_before: AtomicBool::new(false),
				fail_after: AtomicBool::new(false),
			})
		}
	}

	#[async_trait]
	impl CommandHook for RecordingHook
	{
		fn name(&self) -> &str
		{
			&self.name
		}

		async fn before(&self, _ctx: &mut HookContext) -> Result<()>
		{
			self.log.lock().unwrap().push(format!("{}:before", self.name));

			if self.fail_before.load(Ordering::SeqCst) {
				return Err(Error::invalid_query(format!("{} rejected", self.name)));
			}

			Ok(())
		}

		async fn after(&self, _ctx: &mut HookContext) -> Result<()>
		{
			self.log.lock().unwrap().push(format!("{}:after", self.name));

			if self.fail_after.load(Ordering::SeqCst) {
				return Err(Error::invalid_query(format!("{} after failed", self.name)));
			}

			Ok(())
		}
	}

	#[test]
	fn command_type_inference()
	{
		assert_eq!(CommandType::infer("SELECT * FROM Users;"), CommandType::Query);
		assert_eq!(CommandType::infer("  show bundles;"), CommandType::Query);
		assert_eq!(CommandType::infer("INSERT something"), CommandType::Mutation);
		assert_eq!(CommandType::infer("update documents"), CommandType::Mutation);
		assert_eq!(CommandType::infer("DELETE DOCUMENTS FROM \"Users\""), CommandType::Mutation);
		assert_eq!(CommandType::infer("BEGIN TRANSACTION;"), CommandType::Transaction);
		assert_eq!(CommandType::infer("commit;"), CommandType::Transaction);
		assert_eq!(CommandType::infer("ROLLBACK;"), CommandType::Transaction);
		assert_eq!(CommandType::infer("CREATE BUNDLE \"x\""), CommandType::Schema);
		assert_eq!(CommandType::infer("DROP INDEX \"x\""), CommandType::Schema);
		assert_eq!(CommandType::infer("PING;"), CommandType::Unknown);
	}

	#[tokio::test]
	async fn hooks_run_in_registration_order()
	{
		let log = Arc::new(Mutex::new(Vec::new()));
		let chain = HookChain::new();

		chain.register(RecordingHook::new("a", &log));
		chain.register(RecordingHook::new("b", &log));

		let mut ctx = HookContext::new("SELECT 1;");
		chain.run_before(&mut ctx).await.unwrap();
		chain.run_after(&mut ctx).await;

		assert_eq!(
			*log.lock().unwrap(),
			vec!["a:before", "b:before", "a:after", "b:after"],
		);
	}

	#[tokio::test]
	async fn before_aborts_on_first_error()
	{
		let log = Arc::new(Mutex::new(Vec::new()));
		let chain = HookChain::new();

		let failing = RecordingHook::new("a", &log);
		failing.fail_before.store(true, Ordering::SeqCst);
		chain.register(failing);
		chain.register(RecordingHook::new("b", &log));

		let mut ctx = HookContext::new("SELECT 1;");
		chain.run_before(&mut ctx).await.unwrap_err();

		assert_eq!(*log.lock().unwrap(), vec!["a:before"]);
	}

	#[tokio::test]
	async fn after_runs_all_and_returns_last_error()
	{
		let log = Arc::new(Mutex::new(Vec::new()));
		let chain = HookChain::new();

		let first = RecordingHook::new("a", &log);
		first.fail_after.store(true, Ordering::SeqCst);
		chain.register(first);
		chain.register(RecordingHook::new("b", &log));
		let last = RecordingHook::new("c", &log);
		last.fail_after.store(true, Ordering::SeqCst);
		chain.register(last);

		let mut ctx = HookContext::new("SELECT 1;");
		let err = chain.run_after(&mut ctx).await.unwrap();

		assert!(err.message().contains("c after failed"));
		assert_eq!(*log.lock().unwrap(), vec!["a:after", "b:after", "c:after"]);
	}

	#[test]
	fn register_replaces_in_place()
	{
		let log = Arc::new(Mutex::new(Vec::new()));
		let chain = HookChain::new();

		chain.register(RecordingHook::new("a", &log));
		chain.register(RecordingHook::new("b", &log));
		chain.register(RecordingHook::new("a", &log));

		assert_eq!(chain.names(), vec!["a", "b"]);

		assert!(chain.unregister("a"));
		assert!(!chain.unregister("a"));
		assert_eq!(chain.names(), vec!["b"]);
	}
}
