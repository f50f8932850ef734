//! The migration runner.
//!
//! [`MigrationRunner`] validates migration sets, plans them, and executes
//! plans through a [`CommandExecutor`] (implemented by the client, and by
//! scripted stubs in tests), recording every outcome in the history ledger.
//! When a migration directory is configured, applying and rolling back
//! take the shared-filesystem lock first; dry-run plans never lock and
//! never execute.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use derive_more::Display;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, ErrorKind, Result, code};
use crate::migrate::lock::{LockGuard, MigrationLock};
use crate::migrate::{
	Migration,
	MigrationHistory,
	MigrationRecord,
	MigrationStatus,
	generate_down,
	validate,
};
use crate::wire::ServerResponse;

/// Executes one SyndrQL command. The client implements this over its
/// command pipeline.
#[async_trait]
pub trait CommandExecutor: Send + Sync
{
	async fn execute_command(
		&self,
		cancel: &CancellationToken,
		command: &str,
	) -> Result<ServerResponse>;
}

/// Direction of a migration plan.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Direction
{
	#[display("up")]
	Up,

	#[display("down")]
	Down,
}

/// An ordered, validated set of migrations to execute.
#[derive(Debug, Clone)]
pub struct MigrationPlan
{
	pub migrations: Vec<Migration>,
	pub direction: Direction,
	pub total_count: usize,
	pub dry_run: bool,
}

/// Applied/pending summary for a migration set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationStatusSummary
{
	pub applied: Vec<String>,
	pub pending: Vec<String>,
}

/// See the [module-level documentation](self).
pub struct MigrationRunner
{
	executor: Arc<dyn CommandExecutor>,
	history: Mutex<MigrationHistory>,
	directory: Option<PathBuf>,
	lock_holder: String,
	lock_retries: u32,
	locking: bool,
}

impl std::fmt::Debug for MigrationRunner
{
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		fmt.debug_struct("MigrationRunner")
			.field("directory", &self.directory)
			.field("locking", &self.locking)
			.finish_non_exhaustive()
	}
}

impl MigrationRunner
{
	pub fn new(executor: Arc<dyn CommandExecutor>) -> Self
	{
		Self {
			executor,
			history: Mutex::new(MigrationHistory::new()),
			directory: None,
			lock_holder: format!("syndrdb-driver-{}", std::process::id()),
			lock_retries: 0,
			locking: false,
		}
	}

	/// Configures the migration directory, enabling file persistence and
	/// locking.
	pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self
	{
		self.directory = Some(directory.into());
		self.locking = true;
		self
	}

	pub fn with_lock_holder(mut self, holder: impl Into<String>) -> Self
	{
		self.lock_holder = holder.into();
		self
	}

	pub fn with_lock_retries(mut self, retries: u32) -> Self
	{
		self.lock_retries = retries;
		self
	}

	/// Disables locking while keeping the directory configured.
	pub fn without_locking(mut self) -> Self
	{
		self.locking = false;
		self
	}

	/// A copy of the current history ledger.
	pub fn history(&self) -> MigrationHistory
	{
		self.lock_history().clone()
	}

	pub fn set_history(&self, history: MigrationHistory)
	{
		*self.lock_history() = history;
	}

	pub fn is_applied(&self, migration_id: &str) -> bool
	{
		self.lock_history().is_applied(migration_id)
	}

	/// Validates `migrations` and returns the plan of pending ones, in
	/// input order (reversed for [`Direction::Down`]).
	#[tracing::instrument(level = "debug", skip_all, err)]
	pub fn plan(
		&self,
		migrations: &[Migration],
		direction: Direction,
		dry_run: bool,
	) -> Result<MigrationPlan>
	{
		let validation = {
			let history = self.lock_history();
			validate(migrations, &history)
		};

		if !validation.valid {
			let mut err = Error::new(
				ErrorKind::Migration,
				code::MIGRATION_CONFLICT,
				format!(
					"migration set failed validation with {} conflict(s)",
					validation.conflicts.len(),
				),
			);

			for (idx, conflict) in validation.conflicts.iter().enumerate() {
				err = err.with_detail(format!("conflict[{idx}]"), conflict.to_string());
			}

			return Err(err);
		}

		let selected: Vec<Migration> = match direction {
			Direction::Up => migrations
				.iter()
				.filter(|migration| validation.pending.contains(&migration.id))
				.cloned()
				.collect(),
			Direction::Down => migrations
				.iter()
				.rev()
				.filter(|migration| validation.applied.contains(&migration.id))
				.cloned()
				.collect(),
		};

		Ok(MigrationPlan {
			total_count: selected.len(),
			migrations: selected,
			direction,
			dry_run,
		})
	}

	/// Executes an up plan, recording one [`MigrationRecord`] per
	/// migration. Stops at the first failure after recording it.
	#[tracing::instrument(level = "info", skip_all, fields(count = plan.total_count, dry_run = plan.dry_run), err)]
	pub async fn apply(
		&self,
		plan: &MigrationPlan,
		cancel: &CancellationToken,
	) -> Result<Vec<MigrationRecord>>
	{
		if plan.dry_run {
			for migration in &plan.migrations {
				tracing::info!(
					id = %migration.id,
					commands = migration.up.len(),
					"dry run: would apply",
				);
			}

			return Ok(plan
				.migrations
				.iter()
				.map(|migration| MigrationRecord {
					migration_id: migration.id.clone(),
					applied_at: OffsetDateTime::now_utc(),
					rolled_back_at: None,
					status: MigrationStatus::Pending,
					execution_time_ms: 0,
					error: None,
					checksum: migration.checksum(),
				})
				.collect());
		}

		let _lock = self.acquire_lock(cancel).await?;
		let mut records = Vec::with_capacity(plan.migrations.len());

		for migration in &plan.migrations {
			let started = Instant::now();

			let outcome = self.run_commands(cancel, &migration.up).await;
			let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

			match outcome {
				Ok(()) => {
					let mut history = self.lock_history();
					history.record_applied(migration, elapsed_ms);

					if let Some(record) = history.get(&migration.id) {
						records.push(record.clone());
					}

					tracing::info!(id = %migration.id, elapsed_ms, "migration applied");
				},
				Err(err) => {
					self.lock_history().record_failed(migration, elapsed_ms, &err);

					tracing::error!(
						id = %migration.id,
						error = &err as &dyn std::error::Error,
						"migration failed; stopping",
					);

					return Err(Error::new(
						ErrorKind::Migration,
						code::MIGRATION_FAILED,
						format!("migration `{}` failed", migration.id),
					)
					.with_detail("migration", &migration.id)
					.with_source(err));
				},
			}
		}

		Ok(records)
	}

	/// Rolls back one applied migration.
	///
	/// Fails when another applied migration in the set depends on it. When
	/// the migration has no down commands, they are generated from the up
	/// commands where possible.
	#[tracing::instrument(level = "info", skip(self, migrations, cancel), err)]
	pub async fn rollback(
		&self,
		migrations: &[Migration],
		migration_id: &str,
		cancel: &CancellationToken,
	) -> Result<MigrationRecord>
	{
		let by_id = migrations
			.iter()
			.map(|migration| (migration.id.as_str(), migration))
			.collect::<HashMap<_, _>>();

		let Some(migration) = by_id.get(migration_id) else {
			return Err(Error::migration(
				code::MIGRATION_NOT_FOUND,
				format!("migration `{migration_id}` is not part of the provided set"),
			));
		};

		if !self.is_applied(migration_id) {
			return Err(Error::migration(
				code::MIGRATION_NOT_FOUND,
				format!("migration `{migration_id}` is not currently applied"),
			));
		}

		let dependents = migrations
			.iter()
			.filter(|other| {
				other.id != migration_id
					&& self.is_applied(&other.id)
					&& other.dependencies.iter().any(|dep| dep == migration_id)
			})
			.map(|other| other.id.clone())
			.collect::<Vec<_>>();

		if !dependents.is_empty() {
			return Err(Error::new(
				ErrorKind::Migration,
				code::DEPENDENCY_NOT_MET,
				format!(
					"cannot roll back `{migration_id}`: still required by {}",
					dependents.join(", "),
				),
			)
			.with_detail("dependents", dependents.join(",")));
		}

		let down = if migration.down.is_empty() {
			generate_down(&migration.up)?
		} else {
			migration.down.clone()
		};

		let _lock = self.acquire_lock(cancel).await?;

		self.run_commands(cancel, &down).await.map_err(|err| {
			Error::new(
				ErrorKind::Migration,
				code::MIGRATION_FAILED,
				format!("rollback of `{migration_id}` failed"),
			)
			.with_detail("migration", migration_id)
			.with_source(err)
		})?;

		let record = self
			.lock_history()
			.record_rolled_back(migration_id)
			.ok_or_else(|| {
				Error::migration(
					code::MIGRATION_NOT_FOUND,
					format!("migration `{migration_id}` vanished from the history"),
				)
			})?;

		tracing::info!(id = %migration_id, "migration rolled back");
		Ok(record)
	}

	/// Summarizes a migration set against the history.
	pub fn status(&self, migrations: &[Migration]) -> MigrationStatusSummary
	{
		let history = self.lock_history();
		let mut summary = MigrationStatusSummary::default();

		for migration in migrations {
			if history.is_applied(&migration.id) {
				summary.applied.push(migration.id.clone());
			} else {
				summary.pending.push(migration.id.clone());
			}
		}

		summary
	}

	async fn run_commands(&self, cancel: &CancellationToken, commands: &[String]) -> Result<()>
	{
		for command in commands {
			let response = self.executor.execute_command(cancel, command).await?;

			if !response.is_success() {
				return Err(Error::migration(
					code::MIGRATION_FAILED,
					format!("server rejected command: {}", response.error_message()),
				)
				.with_detail("command", command));
			}
		}

		Ok(())
	}

	async fn acquire_lock(&self, cancel: &CancellationToken) -> Result<Option<LockGuard>>
	{
		let Some(ref directory) = self.directory else {
			return Ok(None);
		};

		if !self.locking {
			return Ok(None);
		}

		std::fs::create_dir_all(directory).map_err(|err| {
			Error::migration(
				code::MIGRATION_FAILED,
				format!("failed to create migration directory {}", directory.display()),
			)
			.with_source(err)
		})?;

		let guard = MigrationLock::new(directory, &self.lock_holder)
			.with_retries(self.lock_retries)
			.acquire(cancel)
			.await?;

		Ok(Some(guard))
	}

	fn lock_history(&self) -> std::sync::MutexGuard<'_, MigrationHistory>
	{
		self.history.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
	}
}
