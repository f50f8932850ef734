//! Driver configuration.
//!
//! [`ClientOptions`] can be built fluently, deserialized from a TOML file,
//! or derived from a `syndrdb://` connection string (see
//! [`ClientOptions::parse_conn_string()`]).

mod conn_str;

use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_more::Debug;
use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

/// Minimum log severity the driver should emit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel
{
	Debug,
	#[default]
	Info,
	Warn,
	Error,
}

impl LogLevel
{
	/// The equivalent [`tracing::Level`], for wiring into a subscriber
	/// filter.
	pub fn tracing_level(self) -> tracing::Level
	{
		match self {
			Self::Debug => tracing::Level::DEBUG,
			Self::Info => tracing::Level::INFO,
			Self::Warn => tracing::Level::WARN,
			Self::Error => tracing::Level::ERROR,
		}
	}
}

/// TLS settings for the server connection.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct TlsOptions
{
	/// Whether to wrap the TCP stream in TLS.
	pub enabled: bool,

	/// PEM file with additional root certificates. Without it the bundled
	/// webpki roots are used.
	pub ca_file: Option<PathBuf>,

	/// PEM file with the client certificate chain.
	pub cert_file: Option<PathBuf>,

	/// PEM file with the client private key.
	pub key_file: Option<PathBuf>,

	/// Disables certificate verification. Logged as a warning when used.
	pub insecure_skip_verify: bool,
}

/// Everything the [`Client`] needs to connect and operate.
///
/// [`Client`]: crate::Client
#[derive(Debug, Clone, bon::Builder, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ClientOptions
{
	#[builder(into)]
	pub host: String,

	pub port: u16,

	#[builder(into)]
	pub database: String,

	#[builder(into)]
	pub username: String,

	#[builder(into)]
	#[debug(skip)]
	pub password: String,

	/// Default per-command timeout.
	#[serde(
		rename = "default-timeout-ms",
		default = "defaults::command_timeout",
		deserialize_with = "from_millis"
	)]
	#[builder(default = defaults::command_timeout())]
	pub default_timeout: Duration,

	/// Verbose error formatting (timestamps, source chains).
	#[serde(default)]
	#[builder(default)]
	pub debug_mode: bool,

	/// Connect retries, with a 100 ms base and doubling backoff.
	#[serde(default = "defaults::max_retries")]
	#[builder(default = defaults::max_retries())]
	pub max_retries: u32,

	#[serde(default = "defaults::pool_min_size")]
	#[builder(default = defaults::pool_min_size())]
	pub pool_min_size: usize,

	#[serde(default = "defaults::pool_max_size")]
	#[builder(default = defaults::pool_max_size())]
	pub pool_max_size: usize,

	#[serde(
		rename = "pool-idle-timeout-ms",
		default = "defaults::pool_idle_timeout",
		deserialize_with = "from_millis"
	)]
	#[builder(default = defaults::pool_idle_timeout())]
	pub pool_idle_timeout: Duration,

	#[serde(
		rename = "health-check-interval-ms",
		default = "defaults::health_check_interval",
		deserialize_with = "from_millis"
	)]
	#[builder(default = defaults::health_check_interval())]
	pub health_check_interval: Duration,

	#[serde(default = "defaults::max_reconnect_attempts")]
	#[builder(default = defaults::max_reconnect_attempts())]
	pub max_reconnect_attempts: u32,

	#[serde(default)]
	#[builder(default)]
	pub tls: TlsOptions,

	#[serde(default)]
	#[builder(default)]
	pub log_level: LogLevel,

	#[serde(default = "defaults::statement_cache_size")]
	#[builder(default = defaults::statement_cache_size())]
	pub prepared_statement_cache_size: usize,

	#[serde(
		rename = "transaction-timeout-ms",
		default = "defaults::transaction_timeout",
		deserialize_with = "from_millis"
	)]
	#[builder(default = defaults::transaction_timeout())]
	pub transaction_timeout: Duration,

	#[serde(
		rename = "schema-cache-ttl-ms",
		default = "defaults::schema_cache_ttl",
		deserialize_with = "from_millis"
	)]
	#[builder(default = defaults::schema_cache_ttl())]
	pub schema_cache_ttl: Duration,

	/// Fetch the schema snapshot eagerly after connecting.
	#[serde(default)]
	#[builder(default)]
	pub preload_schema: bool,
}

impl ClientOptions
{
	/// Parses a `syndrdb://HOST:PORT:DATABASE:USERNAME:PASSWORD[?k=v&…]`
	/// connection string.
	pub fn parse_conn_string(conn_string: &str) -> Result<Self>
	{
		conn_str::parse(conn_string)
	}

	/// Loads options from a TOML file.
	pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self>
	{
		let path = path.as_ref();

		let contents = std::fs::read_to_string(path).map_err(|err| {
			Error::connection(format!("failed to read options file {}", path.display()))
				.with_source(err)
		})?;

		toml::from_str(&contents).map_err(|err| {
			Error::connection(format!("failed to parse options file {}", path.display()))
				.with_source(err)
		})
	}

	/// The connection string equivalent of these options, as sent during
	/// the handshake.
	pub fn connection_string(&self) -> String
	{
		let mut conn_string = format!(
			"syndrdb://{}:{}:{}:{}:{}",
			self.host, self.port, self.database, self.username, self.password,
		);

		if self.tls.enabled {
			conn_string.push_str("?tls=true");
		}

		conn_string
	}

	/// The `host:port` pair connections dial.
	pub fn remote_addr(&self) -> String
	{
		format!("{}:{}", self.host, self.port)
	}
}

fn from_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
	D: Deserializer<'de>,
{
	u64::deserialize(deserializer).map(Duration::from_millis)
}

mod defaults
{
	use std::time::Duration;

	pub(super) fn command_timeout() -> Duration
	{
		Duration::from_millis(10_000)
	}

	pub(super) fn max_retries() -> u32
	{
		3
	}

	pub(super) fn pool_min_size() -> usize
	{
		1
	}

	pub(super) fn pool_max_size() -> usize
	{
		1
	}

	pub(super) fn pool_idle_timeout() -> Duration
	{
		Duration::from_secs(30)
	}

	pub(super) fn health_check_interval() -> Duration
	{
		Duration::from_secs(30)
	}

	pub(super) fn max_reconnect_attempts() -> u32
	{
		10
	}

	pub(super) fn statement_cache_size() -> usize
	{
		100
	}

	pub(super) fn transaction_timeout() -> Duration
	{
		Duration::from_secs(5 * 60)
	}

	pub(super) fn schema_cache_ttl() -> Duration
	{
		Duration::from_secs(5 * 60)
	}
}
