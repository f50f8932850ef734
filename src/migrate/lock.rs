//! The shared-filesystem migration lock.
//!
//! At most one holder per filesystem: the lock is a file created with
//! `O_CREAT|O_EXCL` at mode 0600 containing the holder's identity as JSON.
//! A lock whose mtime is older than the staleness window (default one hour,
//! overridable via `SYNDR_LOCK_TIMEOUT`) is treated as abandoned and taken
//! over once. [`force_unlock`] refuses to remove a lock held by another
//! host or by a process that is still alive on this one.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, ErrorKind, Result, code};

/// Name of the lock file inside the migration directory.
pub const LOCK_FILE_NAME: &str = ".syndr_migration.lock";

/// Environment variable overriding the staleness window. Accepts a plain
/// number of seconds or a `90s` / `15m` / `2h` suffixed duration.
pub const ENV_LOCK_TIMEOUT: &str = "SYNDR_LOCK_TIMEOUT";

const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const BASE_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// The holder identity stored in the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo
{
	pub holder: String,
	pub hostname: String,
	pub pid: u32,
	pub timestamp: OffsetDateTime,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub note: Option<String>,
}

/// Acquirer of the migration lock.
#[derive(Debug, Clone)]
pub struct MigrationLock
{
	path: PathBuf,
	holder: String,
	retries: u32,
	note: Option<String>,
}

impl MigrationLock
{
	/// A lock rooted in the given migration directory.
	pub fn new(dir: impl AsRef<Path>, holder: impl Into<String>) -> Self
	{
		Self {
			path: dir.as_ref().join(LOCK_FILE_NAME),
			holder: holder.into(),
			retries: 0,
			note: None,
		}
	}

	/// How many times acquisition retries with backoff before giving up
	/// with a conflict.
	pub fn with_retries(mut self, retries: u32) -> Self
	{
		self.retries = retries;
		self
	}

	pub fn with_note(mut self, note: impl Into<String>) -> Self
	{
		self.note = Some(note.into());
		self
	}

	pub fn path(&self) -> &Path
	{
		&self.path
	}

	/// Attempts to acquire the lock.
	#[tracing::instrument(level = "debug", skip_all, fields(path = %self.path.display(), holder = %self.holder), err)]
	pub async fn acquire(&self, cancel: &CancellationToken) -> Result<LockGuard>
	{
		let mut attempt = 0_u32;
		let mut removed_stale = false;

		loop {
			match self.try_create() {
				Ok(()) => {
					tracing::debug!("migration lock acquired");

					return Ok(LockGuard { path: self.path.clone(), released: false });
				},
				Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {},
				Err(err) => {
					return Err(Error::migration(
						code::LOCK_CONFLICT,
						format!("failed to create lock file {}", self.path.display()),
					)
					.with_source(err));
				},
			}

			if !removed_stale && self.is_stale() {
				removed_stale = true;

				match std::fs::remove_file(&self.path) {
					Ok(()) => {
						tracing::warn!("removed stale migration lock");
						continue;
					},
					Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
					Err(err) => {
						return Err(Error::migration(
							code::LOCK_CONFLICT,
							"failed to remove stale migration lock",
						)
						.with_source(err));
					},
				}
			}

			if attempt < self.retries {
				let backoff = BASE_BACKOFF
					.saturating_mul(2_u32.saturating_pow(attempt))
					.min(MAX_BACKOFF);

				attempt += 1;
				tracing::debug!(attempt, backoff = ?backoff, "lock held; backing off");

				tokio::select! {
					biased;

					() = cancel.cancelled() => {
						return Err(Error::cancelled("lock acquisition cancelled"));
					},

					() = tokio::time::sleep(backoff) => continue,
				}
			}

			return Err(self.conflict_error());
		}
	}

	fn try_create(&self) -> io::Result<()>
	{
		use std::io::Write;

		let mut open_options = std::fs::OpenOptions::new();
		open_options.write(true).create_new(true);

		#[cfg(unix)]
		{
			use std::os::unix::fs::OpenOptionsExt;
			open_options.mode(0o600);
		}

		let mut file = open_options.open(&self.path)?;

		let info = LockInfo {
			holder: self.holder.clone(),
			hostname: current_hostname(),
			pid: std::process::id(),
			timestamp: OffsetDateTime::now_utc(),
			note: self.note.clone(),
		};

		let json = serde_json::to_string_pretty(&info).map_err(io::Error::other)?;
		file.write_all(json.as_bytes())
	}

	fn is_stale(&self) -> bool
	{
		let age = std::fs::metadata(&self.path)
			.and_then(|metadata| metadata.modified())
			.ok()
			.and_then(|mtime| mtime.elapsed().ok());

		age.is_some_and(|age| age > stale_timeout())
	}

	fn conflict_error(&self) -> Error
	{
		let mut err = Error::new(
			ErrorKind::Migration,
			code::LOCK_CONFLICT,
			match read_lock_info(&self.path) {
				Some(ref info) => format!(
					"migration lock is held by `{}` on host `{}` (pid {})",
					info.holder, info.hostname, info.pid,
				),
				None => String::from("migration lock is held by another process"),
			},
		);

		if let Some(info) = read_lock_info(&self.path) {
			err = err
				.with_detail("holder", info.holder)
				.with_detail("hostname", info.hostname)
				.with_detail("pid", info.pid.to_string());

			if let Some(note) = info.note {
				err = err.with_detail("note", note);
			}
		}

		err
	}
}

/// A held migration lock. Releasing removes the lock file; dropping without
/// releasing removes it best-effort.
#[derive(Debug)]
pub struct LockGuard
{
	path: PathBuf,
	released: bool,
}

impl LockGuard
{
	pub fn path(&self) -> &Path
	{
		&self.path
	}

	/// Removes the lock file.
	pub fn release(mut self) -> Result<()>
	{
		self.released = true;

		match std::fs::remove_file(&self.path) {
			Ok(()) => Ok(()),
			Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
			Err(err) => Err(Error::migration(
				code::LOCK_CONFLICT,
				format!("failed to remove lock file {}", self.path.display()),
			)
			.with_source(err)),
		}
	}
}

impl Drop for LockGuard
{
	fn drop(&mut self)
	{
		if !self.released {
			if let Err(err) = std::fs::remove_file(&self.path) {
				if err.kind() != io::ErrorKind::NotFound {
					tracing::warn!(
						error = &err as &dyn std::error::Error,
						path = %self.path.display(),
						"failed to remove migration lock on drop",
					);
				}
			}
		}
	}
}

/// Forcibly removes the lock in `dir`.
///
/// Refuses when the lock belongs to a different host, or when the holder
/// process is still alive on this host.
#[tracing::instrument(level = "debug", err)]
pub fn force_unlock(dir: impl AsRef<Path> + std::fmt::Debug) -> Result<()>
{
	let path = dir.as_ref().join(LOCK_FILE_NAME);

	let Some(info) = read_lock_info(&path) else {
		return match std::fs::remove_file(&path) {
			Ok(()) | Err(_) => Ok(()),
		};
	};

	let hostname = current_hostname();

	if info.hostname != hostname {
		return Err(Error::migration(
			code::LOCK_CONFLICT,
			format!(
				"refusing to force-unlock: lock belongs to host `{}`, this is `{hostname}`",
				info.hostname,
			),
		));
	}

	if process_is_alive(info.pid) {
		return Err(Error::migration(
			code::LOCK_CONFLICT,
			format!(
				"refusing to force-unlock: holder `{}` (pid {}) is still running",
				info.holder, info.pid,
			),
		));
	}

	match std::fs::remove_file(&path) {
		Ok(()) => {
			tracing::warn!(path = %path.display(), "migration lock forcibly removed");
			Ok(())
		},
		Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
		Err(err) => Err(Error::migration(
			code::LOCK_CONFLICT,
			format!("failed to remove lock file {}", path.display()),
		)
		.with_source(err)),
	}
}

fn read_lock_info(path: &Path) -> Option<LockInfo>
{
	let json = std::fs::read_to_string(path).ok()?;
	serde_json::from_str(&json).ok()
}

fn current_hostname() -> String
{
	sysinfo::System::host_name().unwrap_or_else(|| String::from("unknown"))
}

fn process_is_alive(pid: u32) -> bool
{
	let system = sysinfo::System::new_all();
	system.process(sysinfo::Pid::from_u32(pid)).is_some()
}

/// The staleness window, honoring [`ENV_LOCK_TIMEOUT`].
fn stale_timeout() -> Duration
{
	let Ok(raw) = std::env::var(ENV_LOCK_TIMEOUT) else {
		return DEFAULT_STALE_TIMEOUT;
	};

	match parse_duration(&raw) {
		Some(duration) => duration,
		None => {
			tracing::warn!(
				value = %raw,
				"unparseable {ENV_LOCK_TIMEOUT}; using the default staleness window",
			);

			DEFAULT_STALE_TIMEOUT
		},
	}
}

fn parse_duration(raw: &str) -> Option<Duration>
{
	let raw = raw.trim();

	if let Ok(seconds) = raw.parse::<u64>() {
		return Some(Duration::from_secs(seconds));
	}

	let (number, unit) = raw.split_at(raw.len().checked_sub(1)?);
	let number = number.trim().parse::<u64>().ok()?;

	match unit {
		"s" => Some(Duration::from_secs(number)),
		"m" => Some(Duration::from_secs(number * 60)),
		"h" => Some(Duration::from_secs(number * 60 * 60)),
		_ => None,
	}
}
