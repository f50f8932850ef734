//! Connection-string parsing.
//!
//! The accepted form is
//! `syndrdb://HOST:PORT:DATABASE:USERNAME:PASSWORD[;][?key=value&…]`.
//! Recognized query options are `tls` (`true`/`require`), `tlsCAFile`,
//! `tlsCert`, `tlsKey`, and `tlsInsecureSkipVerify`; anything else is
//! ignored.

use std::path::PathBuf;

use crate::config::ClientOptions;
use crate::error::{Error, Result};

const SCHEME: &str = "syndrdb://";

pub(super) fn parse(conn_string: &str) -> Result<ClientOptions>
{
	let Some(rest) = conn_string.strip_prefix(SCHEME) else {
		return Err(Error::connection(format!(
			"connection string must start with `{SCHEME}`",
		)));
	};

	let (authority, query) = match rest.split_once('?') {
		Some((authority, query)) => (authority, Some(query)),
		None => (rest, None),
	};

	let authority = authority.trim_end_matches(';');
	let segments = authority.split(':').collect::<Vec<_>>();

	let &[host, port, database, username, password] = segments.as_slice() else {
		return Err(Error::connection(
			"connection string must have the form HOST:PORT:DATABASE:USERNAME:PASSWORD",
		));
	};

	if host.is_empty() || database.is_empty() || username.is_empty() {
		return Err(Error::connection("connection string has empty segments"));
	}

	let port = port.parse::<u16>().map_err(|err| {
		Error::connection(format!("invalid port `{port}` in connection string")).with_source(err)
	})?;

	let mut options = ClientOptions::builder()
		.host(host)
		.port(port)
		.database(database)
		.username(username)
		.password(password)
		.build();

	if let Some(query) = query {
		apply_query_options(&mut options, query);
	}

	Ok(options)
}

fn apply_query_options(options: &mut ClientOptions, query: &str)
{
	for pair in query.split('&').filter(|pair| !pair.is_empty()) {
		let (key, value) = pair.split_once('=').unwrap_or((pair, ""));

		match key {
			"tls" => {
				options.tls.enabled = matches!(value, "true" | "require");
			},
			"tlsCAFile" => {
				options.tls.ca_file = Some(PathBuf::from(value));
			},
			"tlsCert" => {
				options.tls.cert_file = Some(PathBuf::from(value));
			},
			"tlsKey" => {
				options.tls.key_file = Some(PathBuf::from(value));
			},
			"tlsInsecureSkipVerify" => {
				if value == "true" {
					tracing::warn!("TLS certificate verification disabled by connection string");
					options.tls.insecure_skip_verify = true;
				}
			},
			other => {
				tracing::debug!(option = other, "ignoring unrecognized connection string option");
			},
		}
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn parses_the_basic_form()
	{
		let options = parse("syndrdb://localhost:7654:mydb:admin:hunter2").unwrap();

		assert_eq!(options.host, "localhost");
		assert_eq!(options.port, 7654);
		assert_eq!(options.database, "mydb");
		assert_eq!(options.username, "admin");
		assert_eq!(options.password, "hunter2");
		assert!(!options.tls.enabled);
	}

	#[test]
	fn tolerates_a_trailing_semicolon()
	{
		let options = parse("syndrdb://localhost:7654:mydb:admin:hunter2;").unwrap();
		assert_eq!(options.password, "hunter2");
	}

	#[test]
	fn parses_tls_options()
	{
		let options = parse(
			"syndrdb://db:7654:mydb:admin:pw?tls=require&tlsCAFile=/etc/ssl/ca.pem&unknown=1",
		)
		.unwrap();

		assert!(options.tls.enabled);
		assert_eq!(options.tls.ca_file.as_deref(), Some(std::path::Path::new("/etc/ssl/ca.pem")));
		assert!(!options.tls.insecure_skip_verify);
	}

	#[test]
	fn rejects_missing_scheme()
	{
		assert!(parse("mysql://localhost:3306:db:user:pw").is_err());
	}

	#[test]
	fn rejects_wrong_segment_count()
	{
		assert!(parse("syndrdb://localhost:7654:mydb:admin").is_err());
		assert!(parse("syndrdb://localhost:7654:mydb:admin:pw:extra").is_err());
	}

	#[test]
	fn rejects_bad_port()
	{
		assert!(parse("syndrdb://localhost:notaport:mydb:admin:pw").is_err());
	}
}
