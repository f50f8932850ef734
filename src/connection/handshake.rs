//! The connection handshake.
//!
//! After the TCP (and optional TLS) channel is up, the driver sends the raw
//! connection string as its first frame and reads two responses: a welcome
//! banner that must contain the token `S0001`, and an authentication result
//! that must be a JSON frame with `"status": "success"`. Anything else
//! closes the connection.

use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::{Error, Result};

/// The token the server's welcome banner must carry.
const WELCOME_TOKEN: &str = "S0001";

/// Performs the handshake on a freshly established connection.
#[tracing::instrument(level = "debug", skip_all, fields(remote_addr = %connection.remote_addr()), err)]
pub(crate) async fn authenticate(
	connection: &Connection,
	conn_string: &str,
	cancel: &CancellationToken,
) -> Result<()>
{
	if let Err(err) = handshake(connection, conn_string, cancel).await {
		let _ = connection.close().await;
		return Err(err);
	}

	tracing::debug!("handshake completed");
	Ok(())
}

async fn handshake(
	connection: &Connection,
	conn_string: &str,
	cancel: &CancellationToken,
) -> Result<()>
{
	connection.send_command(cancel, conn_string).await?;

	let welcome = connection.receive_response(cancel).await?;

	if !welcome.text().contains(WELCOME_TOKEN) {
		return Err(Error::auth_failed(format!(
			"unexpected welcome from server: {}",
			welcome.error_message(),
		)));
	}

	let auth = connection.receive_response(cancel).await?;

	if auth.status.eq_ignore_ascii_case("raw") {
		return Err(Error::auth_failed("authentication response was not a JSON frame"));
	}

	if !auth.is_success() {
		return Err(Error::auth_failed(format!(
			"authentication rejected: {}",
			auth.error_message(),
		)));
	}

	Ok(())
}
