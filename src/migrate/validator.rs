//! Migration set validation.
//!
//! [`validate`] checks a migration set against the history ledger and
//! reports three conflict classes: checksum mismatches on already-applied
//! migrations, unsatisfied dependencies of pending migrations, and pending
//! migrations ordered (lexicographically) before the newest applied one.

use std::collections::HashMap;

use derive_more::Display;

use crate::migrate::{Migration, MigrationHistory};

/// A validation conflict.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum Conflict
{
	/// An applied migration's content no longer matches its recorded
	/// checksum.
	#[display("checksum mismatch for `{migration_id}` (expected {expected}, got {actual})")]
	ChecksumMismatch
	{
		migration_id: String,
		expected: String,
		actual: String,
	},

	/// A pending migration depends on something missing or unapplied.
	#[display("dependency `{dependency}` of `{migration_id}` {reason}")]
	DependencyConflict
	{
		migration_id: String,
		dependency: String,
		reason: String,
	},

	/// A pending migration is ordered before the newest applied one.
	#[display("`{migration_id}` is ordered before already-applied `{max_applied_id}`")]
	OrderConflict
	{
		migration_id: String,
		max_applied_id: String,
	},
}

/// The outcome of validating a migration set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult
{
	pub valid: bool,
	pub conflicts: Vec<Conflict>,
	pub pending: Vec<String>,
	pub applied: Vec<String>,
}

/// Validates `migrations` against `history`.
///
/// A pending migration's dependency is satisfied when it is currently
/// applied, or when it appears earlier in the provided set (and will thus
/// be applied first by the same plan).
pub fn validate(migrations: &[Migration], history: &MigrationHistory) -> ValidationResult
{
	let positions = migrations
		.iter()
		.enumerate()
		.map(|(idx, migration)| (migration.id.as_str(), idx))
		.collect::<HashMap<_, _>>();

	let mut result = ValidationResult { valid: true, ..Default::default() };

	for (idx, migration) in migrations.iter().enumerate() {
		if history.is_applied(&migration.id) {
			result.applied.push(migration.id.clone());

			if let Err(err) = history.verify_checksum(migration) {
				result.conflicts.push(Conflict::ChecksumMismatch {
					migration_id: migration.id.clone(),
					expected: err.details().get("expected").cloned().unwrap_or_default(),
					actual: err.details().get("actual").cloned().unwrap_or_default(),
				});
			}

			continue;
		}

		result.pending.push(migration.id.clone());

		for dependency in &migration.dependencies {
			if history.is_applied(dependency) {
				continue;
			}

			match positions.get(dependency.as_str()) {
				None => {
					result.conflicts.push(Conflict::DependencyConflict {
						migration_id: migration.id.clone(),
						dependency: dependency.clone(),
						reason: String::from("is not part of the migration set"),
					});
				},
				Some(&dep_idx) if dep_idx >= idx => {
					result.conflicts.push(Conflict::DependencyConflict {
						migration_id: migration.id.clone(),
						dependency: dependency.clone(),
						reason: String::from("is not applied and not ordered earlier"),
					});
				},
				Some(_) => {},
			}
		}

		if let Some(max_applied) = history.max_applied_id() {
			if migration.id.as_str() < max_applied {
				result.conflicts.push(Conflict::OrderConflict {
					migration_id: migration.id.clone(),
					max_applied_id: max_applied.to_owned(),
				});
			}
		}
	}

	result.valid = result.conflicts.is_empty();
	result
}
