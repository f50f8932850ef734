//! Migration file persistence.
//!
//! A migration file is a JSON envelope `{"formatVersion": "1.0",
//! "migration": …}` named `YYYYMMDDHHMMSS_<sanitized id>.json`. Files are
//! written with mode 0644 into a directory created with mode 0755; a
//! world-writable migration directory is logged as a warning. Reading
//! tolerates a missing format version (assumed `1.0`) and rejects any other
//! value.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::macros::format_description;

use crate::error::{Error, Result, code};
use crate::migrate::{LOCK_FILE_NAME, Migration};

/// The only supported migration file format version.
pub const FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Serialize, Deserialize)]
struct MigrationFile
{
	#[serde(rename = "formatVersion", default, skip_serializing_if = "Option::is_none")]
	format_version: Option<String>,

	migration: Migration,
}

/// Writes `migration` into `dir`, returning the created path.
#[tracing::instrument(level = "debug", skip_all, fields(id = %migration.id), err)]
pub fn save_migration(dir: impl AsRef<Path>, migration: &Migration) -> Result<PathBuf>
{
	let dir = dir.as_ref();
	ensure_directory(dir)?;

	let path = dir.join(file_name(migration));

	let file = MigrationFile {
		format_version: Some(String::from(FORMAT_VERSION)),
		migration: migration.clone(),
	};

	let json = serde_json::to_string_pretty(&file).map_err(|err| {
		Error::migration(
			code::MIGRATION_FAILED,
			format!("failed to serialize migration `{}`", migration.id),
		)
		.with_source(err)
	})?;

	std::fs::write(&path, json).map_err(|err| {
		Error::migration(
			code::MIGRATION_FAILED,
			format!("failed to write migration file {}", path.display()),
		)
		.with_source(err)
	})?;

	set_file_mode(&path, 0o644);
	tracing::debug!(path = %path.display(), "migration saved");

	Ok(path)
}

/// Reads one migration file.
pub fn load_migration(path: impl AsRef<Path>) -> Result<Migration>
{
	let path = path.as_ref();

	let json = std::fs::read_to_string(path).map_err(|err| {
		Error::migration(
			code::MIGRATION_NOT_FOUND,
			format!("failed to read migration file {}", path.display()),
		)
		.with_source(err)
	})?;

	let file = serde_json::from_str::<MigrationFile>(&json).map_err(|err| {
		Error::migration(
			code::MIGRATION_FAILED,
			format!("failed to parse migration file {}", path.display()),
		)
		.with_source(err)
	})?;

	match file.format_version.as_deref() {
		None | Some(FORMAT_VERSION) => Ok(file.migration),
		Some(other) => Err(Error::migration(
			code::MIGRATION_FAILED,
			format!(
				"unsupported migration file format version `{other}` in {}",
				path.display(),
			),
		)
		.with_detail("supported", FORMAT_VERSION)),
	}
}

/// Reads all migration files in `dir`, sorted by file name (and therefore
/// by timestamp prefix).
pub fn load_migration_dir(dir: impl AsRef<Path>) -> Result<Vec<Migration>>
{
	let dir = dir.as_ref();

	let entries = std::fs::read_dir(dir).map_err(|err| {
		Error::migration(
			code::MIGRATION_NOT_FOUND,
			format!("failed to read migration directory {}", dir.display()),
		)
		.with_source(err)
	})?;

	let mut paths = entries
		.filter_map(|entry| entry.ok().map(|entry| entry.path()))
		.filter(|path| {
			path.extension().is_some_and(|ext| ext == "json")
				&& path.file_name().and_then(|name| name.to_str())
					!= Some(LOCK_FILE_NAME)
		})
		.collect::<Vec<_>>();

	paths.sort();

	paths.iter().map(load_migration).collect()
}

fn file_name(migration: &Migration) -> String
{
	let timestamp = if migration.timestamp == OffsetDateTime::UNIX_EPOCH {
		OffsetDateTime::now_utc()
	} else {
		migration.timestamp
	};

	let format = format_description!("[year][month][day][hour][minute][second]");

	let stamp = timestamp.format(&format).unwrap_or_else(|_| {
		unreachable!("formatting with a hard-coded description cannot fail");
	});

	format!("{stamp}_{}.json", sanitize_id(&migration.id))
}

fn sanitize_id(id: &str) -> String
{
	id.chars()
		.map(|ch| {
			if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
				ch
			} else {
				'_'
			}
		})
		.collect()
}

fn ensure_directory(dir: &Path) -> Result<()>
{
	if !dir.exists() {
		std::fs::create_dir_all(dir).map_err(|err| {
			Error::migration(
				code::MIGRATION_FAILED,
				format!("failed to create migration directory {}", dir.display()),
			)
			.with_source(err)
		})?;

		set_file_mode(dir, 0o755);
	}

	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;

		if let Ok(metadata) = std::fs::metadata(dir) {
			if metadata.permissions().mode() & 0o002 != 0 {
				tracing::warn!(
					dir = %dir.display(),
					"migration directory is world-writable",
				);
			}
		}
	}

	Ok(())
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32)
{
	use std::os::unix::fs::PermissionsExt;

	if let Err(err) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
		tracing::warn!(
			error = &err as &dyn std::error::Error,
			path = %path.display(),
			"failed to set file permissions",
		);
	}
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) {}
