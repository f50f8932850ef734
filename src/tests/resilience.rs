use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::connection::ConnectionState;
use crate::error::code;
use crate::testing::{MockReply, MockServer, default_handler};

#[tokio::test]
async fn cancelled_command_marks_the_connection_dead()
{
	let server = MockServer::start_with(Arc::new(|command: &str| {
		if command.contains("SLOW") {
			MockReply::Silence
		} else {
			default_handler(command)
		}
	}))
	.await;

	let client = Client::connect(server.client_options()).await.unwrap();
	let connections_before = server.connection_count();

	let cancel = CancellationToken::new();

	let command = {
		let client = client.clone();
		let cancel = cancel.clone();

		tokio::spawn(async move { client.send_command_with(&cancel, "SELECT SLOW;").await })
	};

	tokio::time::sleep(Duration::from_millis(100)).await;
	cancel.cancel();

	let err = command.await.unwrap().unwrap_err();
	assert_eq!(err.code(), code::CANCELLED);
	assert_eq!(err.kind(), crate::ErrorKind::Cancelled);

	// The half-used connection was discarded; the next command dials a
	// fresh one rather than reusing a socket with a pending response.
	client.send_command("SELECT 1;").await.unwrap();
	assert!(server.connection_count() > connections_before);

	client.close().await.unwrap();
}

#[tokio::test]
async fn command_timeout_is_a_deadline_error()
{
	let server = MockServer::start_with(Arc::new(|command: &str| {
		if command.contains("SLOW") {
			MockReply::Silence
		} else {
			default_handler(command)
		}
	}))
	.await;

	let mut options = server.client_options();
	options.default_timeout = Duration::from_millis(200);

	let client = Client::connect(options).await.unwrap();

	let err = client.send_command("SELECT SLOW;").await.unwrap_err();
	assert_eq!(err.code(), code::DEADLINE_EXCEEDED);

	// The pool replaced the abandoned connection.
	client.send_command("SELECT 1;").await.unwrap();

	client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_monitor_reconnects_after_the_server_returns()
{
	crate::testing::init_tracing();

	let server = MockServer::start().await;

	let mut options = server.client_options();
	options.health_check_interval = Duration::from_millis(100);
	options.default_timeout = Duration::from_millis(500);
	options.max_reconnect_attempts = 20;

	let client = Client::connect(options).await.unwrap();
	assert_eq!(client.state(), ConnectionState::Connected);

	let reconnecting = Arc::new(std::sync::atomic::AtomicBool::new(false));
	{
		let reconnecting = Arc::clone(&reconnecting);
		client.state_manager().on_reconnecting(move |transition| {
			if transition.metadata.get("reason").map(String::as_str) == Some("auto_reconnect") {
				reconnecting.store(true, std::sync::atomic::Ordering::SeqCst);
			}
		});
	}

	// Kill the server; pings start failing.
	let (addr, handler) = server.stop();

	// Wait for the monitor to hit its failure threshold and begin
	// reconnecting, then bring the server back on the same port.
	let deadline = tokio::time::Instant::now() + Duration::from_secs(10);

	while !reconnecting.load(std::sync::atomic::Ordering::SeqCst) {
		assert!(tokio::time::Instant::now() < deadline, "monitor never started reconnecting");
		tokio::time::sleep(Duration::from_millis(50)).await;
	}

	let revived = MockServer::start_on(addr, handler).await;

	let deadline = tokio::time::Instant::now() + Duration::from_secs(15);

	loop {
		if client.state() == ConnectionState::Connected && client.ping().await.is_ok() {
			break;
		}

		assert!(tokio::time::Instant::now() < deadline, "client never reconnected");
		tokio::time::sleep(Duration::from_millis(100)).await;
	}

	// The state walked through a full disconnect/reconnect cycle.
	let transitions = client
		.state_manager()
		.recent_transitions()
		.into_iter()
		.map(|transition| (transition.from, transition.to))
		.collect::<Vec<_>>();

	assert!(
		transitions.contains(&(ConnectionState::Disconnected, ConnectionState::Connecting)),
		"{transitions:?}",
	);
	assert!(
		transitions.contains(&(ConnectionState::Connecting, ConnectionState::Connected)),
		"{transitions:?}",
	);

	client.send_command("SELECT 1;").await.unwrap();

	client.close().await.unwrap();
	drop(revived);
}

#[tokio::test]
async fn io_failure_marks_the_connection_and_the_pool_recovers()
{
	let server = MockServer::start_with(Arc::new(|command: &str| {
		if command.contains("KILL") {
			MockReply::Close
		} else {
			default_handler(command)
		}
	}))
	.await;

	let client = Client::connect(server.client_options()).await.unwrap();

	let err = client.send_command("SELECT KILL;").await.unwrap_err();
	assert_eq!(err.kind(), crate::ErrorKind::Connection);
	assert!(err.is_transient());

	// The pool discarded the broken connection and serves a fresh one.
	client.send_command("SELECT 1;").await.unwrap();

	client.close().await.unwrap();
}
