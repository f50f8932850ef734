//! The migration history ledger.
//!
//! An in-memory map from migration id to [`MigrationRecord`], serializable
//! to and from a JSON array sorted by application time. A migration counts
//! as applied iff its record's status is [`MigrationStatus::Applied`] and
//! it has no rollback timestamp.

use std::collections::HashMap;
use std::path::Path;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{Error, ErrorKind, Result, code};
use crate::migrate::Migration;

/// Lifecycle state of a migration in the history.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationStatus
{
	#[display("pending")]
	Pending,

	#[display("applied")]
	Applied,

	#[display("failed")]
	Failed,

	#[display("rolled-back")]
	RolledBack,
}

/// One history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord
{
	pub migration_id: String,
	pub applied_at: OffsetDateTime,
	pub rolled_back_at: Option<OffsetDateTime>,
	pub status: MigrationStatus,
	pub execution_time_ms: u64,
	pub error: Option<String>,
	pub checksum: String,
}

/// The ledger. See the [module-level documentation](self).
#[derive(Debug, Clone, Default)]
pub struct MigrationHistory
{
	records: HashMap<String, MigrationRecord>,
}

impl MigrationHistory
{
	pub fn new() -> Self
	{
		Self::default()
	}

	pub fn len(&self) -> usize
	{
		self.records.len()
	}

	pub fn is_empty(&self) -> bool
	{
		self.records.is_empty()
	}

	pub fn get(&self, migration_id: &str) -> Option<&MigrationRecord>
	{
		self.records.get(migration_id)
	}

	/// Whether the migration is currently applied.
	pub fn is_applied(&self, migration_id: &str) -> bool
	{
		self.records.get(migration_id).is_some_and(|record| {
			record.status == MigrationStatus::Applied && record.rolled_back_at.is_none()
		})
	}

	/// The lexicographically largest currently-applied id.
	pub fn max_applied_id(&self) -> Option<&str>
	{
		self.records
			.values()
			.filter(|record| {
				record.status == MigrationStatus::Applied && record.rolled_back_at.is_none()
			})
			.map(|record| record.migration_id.as_str())
			.max()
	}

	pub fn record_applied(&mut self, migration: &Migration, execution_time_ms: u64)
	{
		self.records.insert(migration.id.clone(), MigrationRecord {
			migration_id: migration.id.clone(),
			applied_at: OffsetDateTime::now_utc(),
			rolled_back_at: None,
			status: MigrationStatus::Applied,
			execution_time_ms,
			error: None,
			checksum: migration.checksum(),
		});
	}

	pub fn record_failed(&mut self, migration: &Migration, execution_time_ms: u64, error: &Error)
	{
		self.records.insert(migration.id.clone(), MigrationRecord {
			migration_id: migration.id.clone(),
			applied_at: OffsetDateTime::now_utc(),
			rolled_back_at: None,
			status: MigrationStatus::Failed,
			execution_time_ms,
			error: Some(error.to_string()),
			checksum: migration.checksum(),
		});
	}

	/// Flips an applied record to rolled-back. Returns the updated record.
	pub fn record_rolled_back(&mut self, migration_id: &str) -> Option<MigrationRecord>
	{
		let record = self.records.get_mut(migration_id)?;
		record.status = MigrationStatus::RolledBack;
		record.rolled_back_at = Some(OffsetDateTime::now_utc());

		Some(record.clone())
	}

	/// Verifies that `migration`'s current content matches the checksum
	/// recorded when it was applied.
	pub fn verify_checksum(&self, migration: &Migration) -> Result<()>
	{
		let Some(record) = self.records.get(&migration.id) else {
			return Ok(());
		};

		let actual = migration.checksum();

		if record.checksum == actual {
			return Ok(());
		}

		Err(Error::new(
			ErrorKind::Migration,
			code::CHECKSUM_MISMATCH,
			format!("checksum mismatch for migration `{}`", migration.id),
		)
		.with_detail("expected", &record.checksum)
		.with_detail("actual", actual))
	}

	/// All records, sorted by application time (then id, for stability).
	pub fn sorted_records(&self) -> Vec<MigrationRecord>
	{
		let mut records = self.records.values().cloned().collect::<Vec<_>>();
		records.sort_by(|left, right| {
			left.applied_at
				.cmp(&right.applied_at)
				.then_with(|| left.migration_id.cmp(&right.migration_id))
		});

		records
	}

	pub fn to_json(&self) -> Result<String>
	{
		serde_json::to_string_pretty(&self.sorted_records()).map_err(|err| {
			Error::migration(code::MIGRATION_FAILED, "failed to serialize migration history")
				.with_source(err)
		})
	}

	pub fn from_json(json: &str) -> Result<Self>
	{
		let records = serde_json::from_str::<Vec<MigrationRecord>>(json).map_err(|err| {
			Error::migration(code::MIGRATION_FAILED, "failed to parse migration history")
				.with_source(err)
		})?;

		Ok(Self {
			records: records
				.into_iter()
				.map(|record| (record.migration_id.clone(), record))
				.collect(),
		})
	}

	pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()>
	{
		let path = path.as_ref();

		std::fs::write(path, self.to_json()?).map_err(|err| {
			Error::migration(
				code::MIGRATION_FAILED,
				format!("failed to write migration history to {}", path.display()),
			)
			.with_source(err)
		})
	}

	pub fn load_from(path: impl AsRef<Path>) -> Result<Self>
	{
		let path = path.as_ref();

		let json = std::fs::read_to_string(path).map_err(|err| {
			Error::migration(
				code::MIGRATION_FAILED,
				format!("failed to read migration history from {}", path.display()),
			)
			.with_source(err)
		})?;

		Self::from_json(&json)
	}
}
