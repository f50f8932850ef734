//! The driver's error model.
//!
//! Every failure surfaced by this crate is an [`Error`] carrying a stable
//! machine-readable [code], a broad [`ErrorKind`], a human-readable message,
//! optional key/value details, and an optional source error. Transient
//! network failures are recognized by [`Error::is_transient()`] and drive
//! reconnection and pool eviction; all other errors are returned to the
//! caller without side effects.
//!
//! [code]: self::code

use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::{fmt, io};

use derive_more::Display;
use time::OffsetDateTime;

/// A [`Result`](std::result::Result) with this crate's [`Error`] as the
/// default error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Stable error codes carried by [`Error::code()`].
pub mod code
{
	pub const CONNECTION_ERROR: &str = "CONNECTION_ERROR";
	pub const AUTH_FAILED: &str = "AUTH_FAILED";
	pub const NO_ACTIVE_CONNECTION: &str = "NO_ACTIVE_CONNECTION";
	pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
	pub const INVALID_STATE: &str = "INVALID_STATE";
	pub const ILLEGAL_TRANSITION: &str = "ILLEGAL_TRANSITION";
	pub const E_INVALID_QUERY: &str = "E_INVALID_QUERY";
	pub const E_PARAM_COUNT: &str = "E_PARAM_COUNT";
	pub const E_INVALID_STATEMENT_NAME: &str = "E_INVALID_STATEMENT_NAME";
	pub const E_BEGIN_PARSE_FAILED: &str = "E_BEGIN_PARSE_FAILED";
	pub const TX_ALREADY_COMMITTED: &str = "TX_ALREADY_COMMITTED";
	pub const TX_ALREADY_ROLLED_BACK: &str = "TX_ALREADY_ROLLED_BACK";
	pub const TX_NOT_ACTIVE: &str = "TX_NOT_ACTIVE";
	pub const TX_TIMEOUT: &str = "TX_TIMEOUT";
	pub const POOL_CLOSED: &str = "POOL_CLOSED";
	pub const POOL_EXHAUSTED: &str = "POOL_EXHAUSTED";
	pub const POOL_FACTORY_ERROR: &str = "POOL_FACTORY_ERROR";
	pub const DEADLINE_EXCEEDED: &str = "DEADLINE_EXCEEDED";
	pub const CANCELLED: &str = "CANCELLED";
	pub const MIGRATION_NOT_FOUND: &str = "MIGRATION_NOT_FOUND";
	pub const MIGRATION_FAILED: &str = "MIGRATION_FAILED";
	pub const CHECKSUM_MISMATCH: &str = "CHECKSUM_MISMATCH";
	pub const DEPENDENCY_NOT_MET: &str = "DEPENDENCY_NOT_MET";
	pub const ROLLBACK_NOT_SUPPORTED: &str = "ROLLBACK_NOT_SUPPORTED";
	pub const MIGRATION_CONFLICT: &str = "MIGRATION_CONFLICT";
	pub const LOCK_CONFLICT: &str = "LOCK_CONFLICT";
	pub const RECONNECT_FAILED: &str = "RECONNECT_FAILED";
}

/// The broad category an [`Error`] belongs to.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind
{
	/// TCP/TLS establishment, authentication, or loss of connectivity.
	#[display("Connection")]
	Connection,

	/// Malformed or unexpected frames, JSON parse failures.
	#[display("Protocol")]
	Protocol,

	/// An operation was invoked in an incompatible client state.
	#[display("State")]
	State,

	/// Query building, schema validation, or statement misuse.
	#[display("Query")]
	Query,

	/// Transaction lifecycle violations and timeouts.
	#[display("Transaction")]
	Transaction,

	/// Pool exhaustion, closure, or factory failures.
	#[display("Pool")]
	Pool,

	/// Migration history, validation, execution, or locking failures.
	#[display("Migration")]
	Migration,

	/// The caller's cancellation token fired or a deadline elapsed.
	#[display("Cancelled")]
	Cancelled,
}

/// An error returned by the driver.
///
/// See the [module-level documentation](self) for the overall model.
#[must_use]
pub struct Error
{
	code: &'static str,
	kind: ErrorKind,
	message: String,
	details: BTreeMap<String, String>,
	source: Option<Box<dyn StdError + Send + Sync + 'static>>,
	at: OffsetDateTime,
	backtrace: Backtrace,
}

impl Error
{
	pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<String>) -> Self
	{
		Self {
			code,
			kind,
			message: message.into(),
			details: BTreeMap::new(),
			source: None,
			at: OffsetDateTime::now_utc(),
			backtrace: Backtrace::capture(),
		}
	}

	/// Attaches a source error.
	pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self
	{
		self.source = Some(Box::new(source));
		self
	}

	/// Attaches a key/value detail pair.
	pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self
	{
		self.details.insert(key.into(), value.into());
		self
	}

	pub fn code(&self) -> &'static str
	{
		self.code
	}

	pub fn kind(&self) -> ErrorKind
	{
		self.kind
	}

	pub fn message(&self) -> &str
	{
		&self.message
	}

	pub fn details(&self) -> &BTreeMap<String, String>
	{
		&self.details
	}

	/// When this error was constructed.
	pub fn at(&self) -> OffsetDateTime
	{
		self.at
	}

	/// Whether this error indicates a dropped connection that reconnection
	/// may fix.
	///
	/// Recognizes the usual TCP failure modes: EOF, reset-by-peer, broken
	/// pipe, and refusal, either as [`io::Error`] kinds on the source chain
	/// or as well-known message substrings.
	pub fn is_transient(&self) -> bool
	{
		const PATTERNS: [&str; 5] = [
			"connection reset",
			"broken pipe",
			"connection refused",
			"connection closed",
			"EOF",
		];

		let mut source: Option<&(dyn StdError + 'static)> = self.source.as_deref().map(|err| {
			err as &(dyn StdError + 'static)
		});

		while let Some(err) = source {
			if let Some(io_err) = err.downcast_ref::<io::Error>() {
				if matches!(
					io_err.kind(),
					io::ErrorKind::UnexpectedEof
						| io::ErrorKind::ConnectionReset
						| io::ErrorKind::ConnectionAborted
						| io::ErrorKind::ConnectionRefused
						| io::ErrorKind::BrokenPipe
				) {
					return true;
				}
			}

			source = err.source();
		}

		let message = self.to_string();
		PATTERNS.iter().any(|pattern| message.contains(pattern))
	}

	// Constructors for the common cases, so call sites stay short.

	pub(crate) fn connection(message: impl Into<String>) -> Self
	{
		Self::new(ErrorKind::Connection, code::CONNECTION_ERROR, message)
	}

	pub(crate) fn auth_failed(message: impl Into<String>) -> Self
	{
		Self::new(ErrorKind::Connection, code::AUTH_FAILED, message)
	}

	pub(crate) fn protocol(message: impl Into<String>) -> Self
	{
		Self::new(ErrorKind::Protocol, code::PROTOCOL_ERROR, message)
	}

	pub(crate) fn invalid_state(message: impl Into<String>) -> Self
	{
		Self::new(ErrorKind::State, code::INVALID_STATE, message)
	}

	pub(crate) fn invalid_query(message: impl Into<String>) -> Self
	{
		Self::new(ErrorKind::Query, code::E_INVALID_QUERY, message)
	}

	pub(crate) fn transaction(code: &'static str, message: impl Into<String>) -> Self
	{
		Self::new(ErrorKind::Transaction, code, message)
	}

	pub(crate) fn pool(code: &'static str, message: impl Into<String>) -> Self
	{
		Self::new(ErrorKind::Pool, code, message)
	}

	pub(crate) fn migration(code: &'static str, message: impl Into<String>) -> Self
	{
		Self::new(ErrorKind::Migration, code, message)
	}

	pub(crate) fn cancelled(message: impl Into<String>) -> Self
	{
		Self::new(ErrorKind::Cancelled, code::CANCELLED, message)
	}

	pub(crate) fn deadline(message: impl Into<String>) -> Self
	{
		Self::new(ErrorKind::Cancelled, code::DEADLINE_EXCEEDED, message)
	}
}

impl fmt::Display for Error
{
	/// Formats the error as `<code>: <message>`.
	///
	/// The alternate form (`{:#}`) is the debug-mode presentation and
	/// additionally includes the kind, timestamp, details, and the source
	/// chain.
	fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result
	{
		write!(fmt, "{}: {}", self.code, self.message)?;

		if fmt.alternate() {
			write!(fmt, " [kind={}, at={}]", self.kind, self.at)?;

			for (key, value) in &self.details {
				write!(fmt, " {key}={value}")?;
			}

			let mut source = self.source.as_deref().map(|err| err as &(dyn StdError + 'static));

			while let Some(err) = source {
				write!(fmt, "\n  caused by: {err}")?;
				source = err.source();
			}

			// Only populated when backtraces are enabled via the usual
			// environment variables.
			if self.backtrace.status() == BacktraceStatus::Captured {
				write!(fmt, "\n{}", self.backtrace)?;
			}
		}

		Ok(())
	}
}

impl fmt::Debug for Error
{
	fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result
	{
		fmt.debug_struct("Error")
			.field("code", &self.code)
			.field("kind", &self.kind)
			.field("message", &self.message)
			.field("details", &self.details)
			.field("source", &self.source)
			.finish_non_exhaustive()
	}
}

impl StdError for Error
{
	fn source(&self) -> Option<&(dyn StdError + 'static)>
	{
		self.source.as_deref().map(|err| err as &(dyn StdError + 'static))
	}
}

impl From<io::Error> for Error
{
	fn from(error: io::Error) -> Self
	{
		Self::connection(error.to_string()).with_source(error)
	}
}
