use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::client::Client;
use crate::error::code;
use crate::testing::{MockReply, MockServer};
use crate::transaction::TransactionManager;

#[tokio::test]
async fn begin_query_commit()
{
	let server = MockServer::start().await;
	let client = Client::connect(server.client_options()).await.unwrap();

	let tx = client.begin().await.unwrap();
	assert!(!tx.id().is_empty());
	assert_eq!(client.stats().active_transactions, 1);

	tx.query(&CancellationToken::new(), "SELECT * FROM Users;")
		.await
		.unwrap();

	tx.commit(&CancellationToken::new()).await.unwrap();
	assert!(tx.is_committed());
	assert_eq!(client.stats().active_transactions, 0);

	let commands = server.received_commands();
	assert!(commands.contains(&String::from("BEGIN TRANSACTION;")));
	assert!(commands.contains(&String::from("COMMIT;")));

	client.close().await.unwrap();
}

#[tokio::test]
async fn terminal_states_are_enforced()
{
	let server = MockServer::start().await;
	let client = Client::connect(server.client_options()).await.unwrap();
	let cancel = CancellationToken::new();

	let tx = client.begin().await.unwrap();
	tx.commit(&cancel).await.unwrap();

	// Commit-after-commit fails.
	let err = tx.commit(&cancel).await.unwrap_err();
	assert_eq!(err.code(), code::TX_ALREADY_COMMITTED);

	// Rollback-after-commit fails.
	let err = tx.rollback(&cancel).await.unwrap_err();
	assert_eq!(err.code(), code::TX_ALREADY_COMMITTED);

	// Queries after a terminal step fail.
	let err = tx.query(&cancel, "SELECT 1;").await.unwrap_err();
	assert_eq!(err.code(), code::TX_ALREADY_COMMITTED);

	let tx = client.begin().await.unwrap();
	tx.rollback(&cancel).await.unwrap();
	assert!(tx.is_rolled_back());

	// Rollback-after-rollback is a no-op.
	tx.rollback(&cancel).await.unwrap();

	// Commit-after-rollback fails.
	let err = tx.commit(&cancel).await.unwrap_err();
	assert_eq!(err.code(), code::TX_ALREADY_ROLLED_BACK);

	client.close().await.unwrap();
}

#[tokio::test]
async fn begin_parse_failure_returns_the_connection()
{
	let server = MockServer::start_with(Arc::new(|command: &str| {
		if command.trim() == "BEGIN TRANSACTION;" {
			// Acknowledged, but without a transaction ID.
			MockReply::success_with_message("OK")
		} else {
			MockReply::success()
		}
	}))
	.await;

	let client = Client::connect(server.client_options()).await.unwrap();

	let err = client.begin().await.unwrap_err();
	assert_eq!(err.code(), code::E_BEGIN_PARSE_FAILED);
	assert_eq!(client.stats().active_transactions, 0);

	// The pinned connection went back to the pool and still works.
	client.ping().await.unwrap();
	assert!(client.stats().pool.active == 0);

	client.close().await.unwrap();
}

#[tokio::test]
async fn transaction_pins_one_connection()
{
	let server = MockServer::start().await;

	let mut options = server.client_options();
	options.pool_max_size = 2;

	let client = Client::connect(options).await.unwrap();
	let cancel = CancellationToken::new();

	let tx = client.begin().await.unwrap();
	assert_eq!(client.stats().pool.active, 1);

	// All transaction traffic flows over the same pinned connection while
	// other commands use the rest of the pool.
	tx.query(&cancel, "SELECT 1;").await.unwrap();
	client.send_command("SELECT 2;").await.unwrap();
	tx.query(&cancel, "SELECT 3;").await.unwrap();

	tx.commit(&cancel).await.unwrap();
	assert_eq!(client.stats().pool.active, 0);

	client.close().await.unwrap();
}

#[tokio::test]
async fn transaction_statements_use_scoped_names()
{
	let server = MockServer::start().await;
	let client = Client::connect(server.client_options()).await.unwrap();
	let cancel = CancellationToken::new();

	let tx = client.begin().await.unwrap();

	tx.query_with_params(&cancel, "SELECT * FROM Users WHERE age > $1;", &[42_i64.into()])
		.await
		.unwrap();

	let prepares = server.commands_matching("PREPARE tx_");
	assert_eq!(prepares.len(), 1, "{:?}", server.received_commands());

	let name = prepares[0]
		.strip_prefix("PREPARE ")
		.unwrap()
		.split_whitespace()
		.next()
		.unwrap();

	crate::statement::validate_statement_name(name).unwrap();
	assert!(name.starts_with("tx_"));
	assert!(name.contains("_stmt_"));

	tx.rollback(&cancel).await.unwrap();
	client.close().await.unwrap();
}

#[tokio::test]
async fn in_transaction_commits_on_success_and_rolls_back_on_error()
{
	let server = MockServer::start().await;
	let client = Client::connect(server.client_options()).await.unwrap();

	let value = client
		.in_transaction(async |tx| {
			tx.query(&CancellationToken::new(), "SELECT 1;").await?;
			Ok(42_i32)
		})
		.await
		.unwrap();

	assert_eq!(value, 42);
	assert!(server.received_commands().contains(&String::from("COMMIT;")));

	let err = client
		.in_transaction(async |tx| {
			tx.query(&CancellationToken::new(), "SELECT 1;").await?;
			Err::<(), _>(crate::Error::invalid_query("application error"))
		})
		.await
		.unwrap_err();

	assert!(err.message().contains("application error"));
	assert!(server.received_commands().contains(&String::from("ROLLBACK;")));
	assert_eq!(client.stats().active_transactions, 0);

	client.close().await.unwrap();
}

#[tokio::test]
async fn in_transaction_rolls_back_on_panic()
{
	let server = MockServer::start().await;
	let client = Client::connect(server.client_options()).await.unwrap();

	let result = {
		let client = client.clone();

		tokio::spawn(async move {
			client
				.in_transaction(async |_tx| -> crate::Result<()> {
					panic!("boom");
				})
				.await
		})
		.await
	};

	// The panic propagated out of the closure.
	assert!(result.is_err());

	// ... but the transaction still rolled back.
	assert!(server.received_commands().contains(&String::from("ROLLBACK;")));
	assert_eq!(client.stats().active_transactions, 0);

	client.close().await.unwrap();
}

#[tokio::test]
async fn timed_out_transactions_are_force_rolled_back()
{
	let server = MockServer::start().await;
	let client = Client::connect(server.client_options()).await.unwrap();

	// A dedicated manager with an aggressive timeout and sweep period,
	// sharing the client's pool via a fresh manager.
	let manager = TransactionManager::new(
		// Reuse the pool through a second client handle is not possible;
		// construct directly over the same server instead.
		{
			let factory = {
				let addr = server.addr();
				let conn_string =
					format!("syndrdb://{}:{}:testdb:tester:secret", addr.ip(), addr.port());

				let factory: crate::pool::ConnectionFactory = Arc::new(move || {
					let conn_string = conn_string.clone();

					Box::pin(async move {
						let transport = crate::wire::TcpTransport::connect(
							&addr.ip().to_string(),
							addr.port(),
							None,
							Duration::from_secs(5),
						)
						.await?;

						let connection =
							crate::connection::Connection::new(Box::new(transport), addr.to_string());

						crate::connection::authenticate(
							&connection,
							&conn_string,
							&CancellationToken::new(),
						)
						.await?;

						Ok(connection)
					})
				});

				factory
			};

			let pool = crate::pool::ConnectionPool::new(factory, crate::pool::PoolConfig {
				min_idle: 1,
				max_open: 2,
				idle_timeout: Duration::from_secs(30),
				health_check_interval: Duration::from_secs(30),
			});

			pool.initialize().await.unwrap();
			pool
		},
		Duration::from_millis(100),
	);

	let tasks = TaskTracker::new();
	let shutdown = CancellationToken::new();

	manager.spawn_timeout_monitor_with_period(&tasks, shutdown.clone(), Duration::from_millis(50));

	let tx = manager
		.begin(&CancellationToken::new(), Some(Duration::from_secs(1)), Default::default())
		.await
		.unwrap();

	assert_eq!(manager.active_count(), 1);

	// Wait for the sweep to notice the expired transaction.
	tokio::time::sleep(Duration::from_millis(500)).await;

	assert_eq!(manager.active_count(), 0);
	assert!(tx.is_rolled_back());
	assert!(server.received_commands().contains(&String::from("ROLLBACK;")));

	shutdown.cancel();
	tasks.close();
	tasks.wait().await;

	client.close().await.unwrap();
}
