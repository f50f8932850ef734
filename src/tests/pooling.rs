use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::{Error, code};
use crate::pool::{ConnectionFactory, ConnectionPool, PoolConfig};
use crate::testing::MockServer;
use crate::wire::TcpTransport;

fn factory_for(server: &MockServer) -> ConnectionFactory
{
	let addr = server.addr();
	let conn_string = format!(
		"syndrdb://{}:{}:testdb:tester:secret",
		addr.ip(),
		addr.port(),
	);

	Arc::new(move || {
		let conn_string = conn_string.clone();

		Box::pin(async move {
			let transport =
				TcpTransport::connect(&addr.ip().to_string(), addr.port(), None, Duration::from_secs(5))
					.await?;

			let connection = Connection::new(Box::new(transport), addr.to_string());
			crate::connection::authenticate(&connection, &conn_string, &CancellationToken::new())
				.await?;

			Ok(connection)
		})
	})
}

fn config(min_idle: usize, max_open: usize) -> PoolConfig
{
	PoolConfig {
		min_idle,
		max_open,
		idle_timeout: Duration::from_secs(30),
		health_check_interval: Duration::from_secs(30),
	}
}

#[tokio::test]
async fn initialize_prefills_min_idle()
{
	let server = MockServer::start().await;
	let pool = ConnectionPool::new(factory_for(&server), config(2, 4));

	pool.initialize().await.unwrap();

	let stats = pool.stats();
	assert_eq!(stats.idle, 2);
	assert_eq!(stats.active, 0);
	assert_eq!(stats.total_opened, 2);
	assert_eq!(server.connection_count(), 2);

	pool.close().await;
}

#[tokio::test]
async fn active_plus_idle_never_exceeds_max_open()
{
	let server = MockServer::start().await;
	let pool = ConnectionPool::new(factory_for(&server), config(1, 2));
	pool.initialize().await.unwrap();

	let cancel = CancellationToken::new();

	let first = pool.get(&cancel, Some(Duration::from_secs(1))).await.unwrap();
	let second = pool.get(&cancel, Some(Duration::from_secs(1))).await.unwrap();

	let stats = pool.stats();
	assert_eq!(stats.active, 2);
	assert_eq!(stats.idle, 0);
	assert!(stats.active + stats.idle <= 2);

	// Third acquisition blocks until a connection is returned.
	let err = pool
		.get(&cancel, Some(Duration::from_millis(100)))
		.await
		.unwrap_err();

	assert_eq!(err.code(), code::POOL_EXHAUSTED);
	assert_eq!(pool.stats().timeouts, 1);

	drop(first);

	let third = pool.get(&cancel, Some(Duration::from_secs(1))).await.unwrap();
	let stats = pool.stats();
	assert!(stats.active + stats.idle <= 2, "{stats:?}");

	drop(second);
	drop(third);
	pool.close().await;
}

#[tokio::test]
async fn waiting_get_wakes_up_on_put()
{
	let server = MockServer::start().await;
	let pool = ConnectionPool::new(factory_for(&server), config(0, 1));
	pool.initialize().await.unwrap();

	let cancel = CancellationToken::new();
	let held = pool.get(&cancel, Some(Duration::from_secs(1))).await.unwrap();

	let waiter = tokio::spawn({
		let pool = pool.clone();

		async move {
			let cancel = CancellationToken::new();
			pool.get(&cancel, Some(Duration::from_secs(5))).await
		}
	});

	tokio::time::sleep(Duration::from_millis(100)).await;
	assert!(!waiter.is_finished());

	drop(held);

	let conn = waiter.await.unwrap().unwrap();
	assert!(conn.is_alive());

	drop(conn);
	pool.close().await;
}

#[tokio::test]
async fn cancelled_get_returns_a_cancellation_error()
{
	let server = MockServer::start().await;
	let pool = ConnectionPool::new(factory_for(&server), config(0, 1));
	pool.initialize().await.unwrap();

	let cancel = CancellationToken::new();
	let _held = pool.get(&cancel, Some(Duration::from_secs(1))).await.unwrap();

	let waiter_cancel = CancellationToken::new();
	let waiter = tokio::spawn({
		let pool = pool.clone();
		let cancel = waiter_cancel.clone();

		async move { pool.get(&cancel, Some(Duration::from_secs(30))).await }
	});

	tokio::time::sleep(Duration::from_millis(50)).await;
	waiter_cancel.cancel();

	let err = waiter.await.unwrap().unwrap_err();
	assert_eq!(err.code(), code::CANCELLED);

	pool.close().await;
}

#[tokio::test]
async fn get_after_close_fails()
{
	let server = MockServer::start().await;
	let pool = ConnectionPool::new(factory_for(&server), config(1, 2));
	pool.initialize().await.unwrap();

	pool.close().await;
	// Closing twice is fine.
	pool.close().await;

	let err = pool
		.get(&CancellationToken::new(), Some(Duration::from_secs(1)))
		.await
		.unwrap_err();

	assert_eq!(err.code(), code::POOL_CLOSED);
}

#[tokio::test]
async fn dead_connections_are_not_reused()
{
	let server = MockServer::start().await;
	let pool = ConnectionPool::new(factory_for(&server), config(1, 2));
	pool.initialize().await.unwrap();

	let cancel = CancellationToken::new();

	let conn = pool.get(&cancel, Some(Duration::from_secs(1))).await.unwrap();
	conn.mark_dead();
	drop(conn);

	// The dead connection was discarded on release, not re-queued.
	assert_eq!(pool.stats().idle, 0);

	let replacement = pool.get(&cancel, Some(Duration::from_secs(1))).await.unwrap();
	assert!(replacement.is_alive());

	drop(replacement);
	pool.close().await;
}

#[tokio::test]
async fn factory_errors_are_reported_and_counted()
{
	let factory: ConnectionFactory = Arc::new(|| {
		Box::pin(async { Err(Error::connection("connection refused")) })
	});

	let pool = ConnectionPool::new(factory, config(0, 1));
	pool.initialize().await.unwrap();

	let err = pool
		.get(&CancellationToken::new(), Some(Duration::from_secs(1)))
		.await
		.unwrap_err();

	assert_eq!(err.code(), code::POOL_FACTORY_ERROR);

	let stats = pool.stats();
	assert_eq!(stats.errors, 1);
	assert_eq!(stats.active, 0);

	pool.close().await;
}

#[tokio::test]
async fn idle_reaper_respects_min_idle()
{
	let server = MockServer::start().await;

	let pool = ConnectionPool::new(factory_for(&server), PoolConfig {
		min_idle: 1,
		max_open: 4,
		idle_timeout: Duration::from_millis(200),
		health_check_interval: Duration::from_secs(30),
	});

	pool.initialize().await.unwrap();

	// Open extra connections, then return them all.
	let cancel = CancellationToken::new();
	let a = pool.get(&cancel, Some(Duration::from_secs(1))).await.unwrap();
	let b = pool.get(&cancel, Some(Duration::from_secs(1))).await.unwrap();
	let c = pool.get(&cancel, Some(Duration::from_secs(1))).await.unwrap();
	drop(a);
	drop(b);
	drop(c);

	assert_eq!(pool.stats().idle, 3);

	// Wait for the idle timeout plus a few reaper periods.
	tokio::time::sleep(Duration::from_millis(600)).await;

	let stats = pool.stats();
	assert_eq!(stats.idle, 1, "{stats:?}");

	pool.close().await;
}
