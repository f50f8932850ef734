use crate::client::Client;
use crate::error::code;
use crate::query::Value;
use crate::testing::MockServer;

#[tokio::test]
async fn prepare_execute_deallocate_roundtrip()
{
	let server = MockServer::start().await;
	let client = Client::connect(server.client_options()).await.unwrap();

	let statement = client
		.prepare("find_by_age", "SELECT * FROM Users WHERE age > $1;")
		.await
		.unwrap();

	assert_eq!(statement.name(), "find_by_age");
	assert_eq!(statement.param_count(), 1);
	assert!(!statement.is_closed());

	statement.execute(&Default::default(), &[Value::from(18_i64)]).await.unwrap();

	let executes = server.commands_matching("EXECUTE");
	assert_eq!(executes.len(), 1);
	assert_eq!(executes[0], "EXECUTE find_by_age\x0518");

	statement.close(&Default::default()).await.unwrap();
	assert!(statement.is_closed());

	// Close is idempotent: only one DEALLOCATE goes out.
	statement.close(&Default::default()).await.unwrap();
	assert_eq!(server.commands_matching("DEALLOCATE").len(), 1);

	let err = statement
		.execute(&Default::default(), &[Value::from(18_i64)])
		.await
		.unwrap_err();
	assert_eq!(err.code(), code::E_INVALID_QUERY);

	client.close().await.unwrap();
}

#[tokio::test]
async fn parameter_count_is_enforced()
{
	let server = MockServer::start().await;
	let client = Client::connect(server.client_options()).await.unwrap();

	let statement = client
		.prepare("two_params", "SELECT * FROM Users WHERE age > $1 AND status = $2;")
		.await
		.unwrap();

	assert_eq!(statement.param_count(), 2);

	let err = statement
		.execute(&Default::default(), &[Value::from(18_i64)])
		.await
		.unwrap_err();

	assert_eq!(err.code(), code::E_PARAM_COUNT);

	client.close().await.unwrap();
}

#[tokio::test]
async fn invalid_statement_names_are_rejected_before_sending()
{
	let server = MockServer::start().await;
	let client = Client::connect(server.client_options()).await.unwrap();

	let commands_before = server.received_commands().len();
	let err = client
		.prepare("bad name!", "SELECT * FROM Users;")
		.await
		.unwrap_err();

	assert_eq!(err.code(), code::E_INVALID_STATEMENT_NAME);
	assert_eq!(server.received_commands().len(), commands_before);

	client.close().await.unwrap();
}

#[tokio::test]
async fn null_params_are_sent_as_empty_strings()
{
	let server = MockServer::start().await;
	let client = Client::connect(server.client_options()).await.unwrap();

	let statement = client
		.prepare("with_null", "SELECT * FROM Users WHERE status = $1 AND age = $2;")
		.await
		.unwrap();

	statement
		.execute(&Default::default(), &[Value::Null, Value::from(7_i64)])
		.await
		.unwrap();

	let executes = server.commands_matching("EXECUTE");
	assert_eq!(executes[0], "EXECUTE with_null\x05\x057");

	client.close().await.unwrap();
}

#[tokio::test]
async fn lru_eviction_deallocates_the_oldest_statement()
{
	let server = MockServer::start().await;

	let mut options = server.client_options();
	options.prepared_statement_cache_size = 2;

	let client = Client::connect(options).await.unwrap();

	client.prepare("stmt_a", "SELECT 1;").await.unwrap();
	client.prepare("stmt_b", "SELECT 2;").await.unwrap();

	// Touch `stmt_a` so `stmt_b` becomes least recently used.
	assert!(client.statement("stmt_a").is_some());

	client.prepare("stmt_c", "SELECT 3;").await.unwrap();

	let deallocates = server.commands_matching("DEALLOCATE");
	assert_eq!(deallocates, vec!["DEALLOCATE stmt_b"]);

	assert!(client.statement("stmt_a").is_some());
	assert!(client.statement("stmt_b").is_none());
	assert!(client.statement("stmt_c").is_some());

	let stats = client.stats().statements;
	assert_eq!(stats.size, 2);
	assert_eq!(stats.evictions, 1);

	client.close().await.unwrap();
}

#[tokio::test]
async fn repeated_prepare_hits_the_cache()
{
	let server = MockServer::start().await;
	let client = Client::connect(server.client_options()).await.unwrap();

	client.prepare("cached", "SELECT 1;").await.unwrap();
	client.prepare("cached", "SELECT 1;").await.unwrap();
	client.prepare("cached", "SELECT 1;").await.unwrap();

	// Only the first prepare reached the server.
	assert_eq!(server.commands_matching("PREPARE").len(), 1);

	client.close().await.unwrap();
}

#[tokio::test]
async fn query_with_params_always_cleans_up()
{
	let server = MockServer::start().await;
	let client = Client::connect(server.client_options()).await.unwrap();

	client
		.query_with_params("SELECT * FROM Users WHERE age > $1;", &[Value::from(21_i64)])
		.await
		.unwrap();

	assert_eq!(server.commands_matching("PREPARE").len(), 1);
	assert_eq!(server.commands_matching("EXECUTE").len(), 1);
	assert_eq!(server.commands_matching("DEALLOCATE").len(), 1);

	// The transient statement is not cached.
	assert_eq!(client.stats().statements.size, 0);

	client.close().await.unwrap();
}
