//! Schema migrations.
//!
//! A [`Migration`] is an ordered pair of up and down command lists with a
//! unique id, a dependency set, and a SHA-256 content checksum. The
//! submodules cover the history ledger, validation, automatic rollback
//! generation, file persistence, the shared-filesystem lock, and the
//! runner that executes plans through a [`CommandExecutor`].

mod files;
mod history;
mod lock;
mod rollback;
mod runner;
mod validator;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

pub use self::{
	files::{FORMAT_VERSION, load_migration, load_migration_dir, save_migration},
	history::{MigrationHistory, MigrationRecord, MigrationStatus},
	lock::{LOCK_FILE_NAME, LockGuard, LockInfo, MigrationLock, force_unlock},
	rollback::generate_down,
	runner::{CommandExecutor, Direction, MigrationPlan, MigrationRunner, MigrationStatusSummary},
	validator::{Conflict, ValidationResult, validate},
};

/// One schema migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Migration
{
	/// Unique identifier; migration ordering is lexicographic over ids.
	pub id: String,

	pub name: String,

	/// Commands applying the migration, executed in order.
	#[serde(default)]
	pub up: Vec<String>,

	/// Commands reverting the migration. May be empty, in which case
	/// [`generate_down`] derives them from `up` where possible.
	#[serde(default)]
	pub down: Vec<String>,

	/// Ids of migrations that must be applied before this one.
	#[serde(default)]
	pub dependencies: Vec<String>,

	#[serde(default = "unix_epoch")]
	pub timestamp: OffsetDateTime,
}

impl Migration
{
	pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self
	{
		Self {
			id: id.into(),
			name: name.into(),
			up: Vec::new(),
			down: Vec::new(),
			dependencies: Vec::new(),
			timestamp: OffsetDateTime::now_utc(),
		}
	}

	pub fn with_up(mut self, commands: impl IntoIterator<Item = impl Into<String>>) -> Self
	{
		self.up.extend(commands.into_iter().map(Into::into));
		self
	}

	pub fn with_down(mut self, commands: impl IntoIterator<Item = impl Into<String>>) -> Self
	{
		self.down.extend(commands.into_iter().map(Into::into));
		self
	}

	pub fn with_dependencies(
		mut self,
		dependencies: impl IntoIterator<Item = impl Into<String>>,
	) -> Self
	{
		self.dependencies.extend(dependencies.into_iter().map(Into::into));
		self
	}

	/// The SHA-256 checksum over `id || name || concat(up) || concat(down)`,
	/// hex-encoded.
	pub fn checksum(&self) -> String
	{
		let mut hasher = Sha256::new();
		hasher.update(self.id.as_bytes());
		hasher.update(self.name.as_bytes());

		for command in &self.up {
			hasher.update(command.as_bytes());
		}

		for command in &self.down {
			hasher.update(command.as_bytes());
		}

		use std::fmt::Write;

		let digest = hasher.finalize();

		let mut hex = String::with_capacity(digest.len() * 2);
		for byte in digest {
			let _ = write!(hex, "{byte:02x}");
		}

		hex
	}
}

fn unix_epoch() -> OffsetDateTime
{
	OffsetDateTime::UNIX_EPOCH
}

#[cfg(test)]
mod tests
{
	use super::*;

	fn sample() -> Migration
	{
		Migration::new("001_create_users", "create users bundle")
			.with_up([r#"CREATE BUNDLE "users";"#])
			.with_down([r#"DROP BUNDLE "users";"#])
	}

	#[test]
	fn checksum_is_deterministic()
	{
		assert_eq!(sample().checksum(), sample().checksum());
		assert_eq!(sample().checksum().len(), 64);
	}

	#[test]
	fn checksum_changes_with_any_content_mutation()
	{
		let base = sample().checksum();

		let mut changed_id = sample();
		changed_id.id = String::from("002_create_users");

		let mut changed_name = sample();
		changed_name.name = String::from("something else");

		let changed_up = sample().with_up([r#"CREATE BUNDLE "extra";"#]);
		let changed_down = sample().with_down([r#"DROP BUNDLE "extra";"#]);

		for changed in [
			changed_id.checksum(),
			changed_name.checksum(),
			changed_up.checksum(),
			changed_down.checksum(),
		] {
			assert_ne!(base, changed);
		}
	}

	#[test]
	fn dependencies_do_not_affect_the_checksum()
	{
		let with_deps = sample().with_dependencies(["000_init"]);
		assert_eq!(sample().checksum(), with_deps.checksum());
	}
}
