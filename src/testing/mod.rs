//! Test support: an in-process mock server speaking the framed protocol,
//! and filesystem helpers.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ClientOptions;

/// What the mock server does with one inbound command.
pub enum MockReply
{
	/// Respond with a JSON frame.
	Json(serde_json::Value),

	/// Respond with a raw text frame.
	Raw(String),

	/// Never respond; the connection stays open and silent.
	Silence,

	/// Drop the connection immediately.
	Close,
}

impl MockReply
{
	pub fn success() -> Self
	{
		Self::Json(serde_json::json!({"status": "success"}))
	}

	pub fn success_with_message(message: &str) -> Self
	{
		Self::Json(serde_json::json!({"status": "success", "message": message}))
	}

	pub fn error(message: &str) -> Self
	{
		Self::Json(serde_json::json!({"status": "error", "error": message}))
	}
}

type Handler = Arc<dyn Fn(&str) -> MockReply + Send + Sync>;

/// The default command handler: a well-behaved server that acknowledges
/// everything and serves a small `Users` schema.
pub fn default_handler(command: &str) -> MockReply
{
	let trimmed = command.trim();

	if trimmed == "PING;" {
		return MockReply::success_with_message("PONG");
	}

	if trimmed == "BEGIN TRANSACTION;" {
		return MockReply::Json(serde_json::json!({
			"status": "success",
			"message": format!("Transaction started with ID: {}", Uuid::new_v4().simple()),
		}));
	}

	if trimmed == "SHOW BUNDLES;" {
		return MockReply::Json(serde_json::json!({
			"status": "success",
			"data": {
				"bundles": [{
					"name": "Users",
					"fields": [
						{"name": "id", "type": "string", "required": true, "unique": true},
						{"name": "name", "type": "string"},
						{"name": "email", "type": "string"},
						{"name": "age", "type": "int"},
						{"name": "status", "type": "string"},
						{"name": "deletedAt", "type": "string"},
					],
				}],
			},
		}));
	}

	MockReply::success()
}

/// An in-process SyndrDB look-alike bound to a random local port.
pub struct MockServer
{
	addr: SocketAddr,
	handler: Handler,
	accept_task: JoinHandle<()>,
	conn_tasks: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
	connections: Arc<AtomicUsize>,
	commands: Arc<std::sync::Mutex<Vec<String>>>,
}

impl MockServer
{
	/// Starts a server with the [`default_handler`].
	pub async fn start() -> Self
	{
		Self::start_with(Arc::new(default_handler)).await
	}

	pub async fn start_with(handler: Handler) -> Self
	{
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		Self::serve(listener, handler).await
	}

	/// Starts a server bound to a specific address; used to "restart" a
	/// stopped server on its old port. Retries briefly in case the old
	/// listener has not been torn down yet.
	pub async fn start_on(addr: SocketAddr, handler: Handler) -> Self
	{
		let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);

		let listener = loop {
			match TcpListener::bind(addr).await {
				Ok(listener) => break listener,
				Err(err) => {
					assert!(
						tokio::time::Instant::now() < deadline,
						"could not rebind {addr}: {err}",
					);

					tokio::time::sleep(std::time::Duration::from_millis(50)).await;
				},
			}
		};

		Self::serve(listener, handler).await
	}

	async fn serve(listener: TcpListener, handler: Handler) -> Self
	{
		let addr = listener.local_addr().unwrap();
		let connections = Arc::new(AtomicUsize::new(0));
		let commands = Arc::new(std::sync::Mutex::new(Vec::new()));
		let conn_tasks = Arc::new(std::sync::Mutex::new(Vec::new()));

		let accept_task = tokio::spawn({
			let handler = Arc::clone(&handler);
			let connections = Arc::clone(&connections);
			let commands = Arc::clone(&commands);
			let conn_tasks = Arc::clone(&conn_tasks);

			async move {
				loop {
					let Ok((stream, _)) = listener.accept().await else {
						break;
					};

					connections.fetch_add(1, Ordering::SeqCst);

					let task = tokio::spawn(serve_connection(
						stream,
						Arc::clone(&handler),
						Arc::clone(&commands),
					));

					conn_tasks.lock().unwrap().push(task);
				}
			}
		});

		Self { addr, handler, accept_task, conn_tasks, connections, commands }
	}

	pub fn addr(&self) -> SocketAddr
	{
		self.addr
	}

	/// How many connections have been accepted so far.
	pub fn connection_count(&self) -> usize
	{
		self.connections.load(Ordering::SeqCst)
	}

	/// Every command received after the handshake, across all connections.
	pub fn received_commands(&self) -> Vec<String>
	{
		self.commands.lock().unwrap().clone()
	}

	pub fn commands_matching(&self, prefix: &str) -> Vec<String>
	{
		self.received_commands()
			.into_iter()
			.filter(|command| command.starts_with(prefix))
			.collect()
	}

	/// Stops the server: no new connections are accepted and all live
	/// connections are severed. Returns the address and handler so a test
	/// can "restart" the server on the same port.
	pub fn stop(self) -> (SocketAddr, Handler)
	{
		self.accept_task.abort();

		for task in self.conn_tasks.lock().unwrap().drain(..) {
			task.abort();
		}

		(self.addr, self.handler)
	}

	/// Client options pointing at this server, with fast timeouts suitable
	/// for tests.
	pub fn client_options(&self) -> ClientOptions
	{
		ClientOptions::builder()
			.host(self.addr.ip().to_string())
			.port(self.addr.port())
			.database("testdb")
			.username("tester")
			.password("secret")
			.default_timeout(std::time::Duration::from_secs(5))
			.build()
	}
}

async fn serve_connection(
	mut stream: TcpStream,
	handler: Handler,
	commands: Arc<std::sync::Mutex<Vec<String>>>,
)
{
	// Handshake: connection string in, welcome + auth result out.
	let Some(conn_string) = read_frame(&mut stream).await else {
		return;
	};

	if !conn_string.starts_with("syndrdb://") {
		let _ = write_frame(&mut stream, "Unrecognized client").await;
		return;
	}

	if write_frame(&mut stream, "Welcome to SyndrDB S0001").await.is_err() {
		return;
	}

	let auth = serde_json::json!({"status": "success"}).to_string();
	if write_frame(&mut stream, &auth).await.is_err() {
		return;
	}

	while let Some(command) = read_frame(&mut stream).await {
		commands.lock().unwrap().push(command.clone());

		match handler(&command) {
			MockReply::Json(value) => {
				if write_frame(&mut stream, &value.to_string()).await.is_err() {
					return;
				}
			},
			MockReply::Raw(text) => {
				if write_frame(&mut stream, &text).await.is_err() {
					return;
				}
			},
			MockReply::Silence => {},
			MockReply::Close => return,
		}
	}
}

async fn read_frame(stream: &mut TcpStream) -> Option<String>
{
	let mut frame = Vec::new();
	let mut byte = [0_u8; 1];

	loop {
		match stream.read(&mut byte).await {
			Ok(0) | Err(_) => return None,
			Ok(_) if byte[0] == 0x04 => {
				return String::from_utf8(frame).ok();
			},
			Ok(_) => frame.push(byte[0]),
		}
	}
}

async fn write_frame(stream: &mut TcpStream, text: &str) -> std::io::Result<()>
{
	stream.write_all(text.as_bytes()).await?;
	stream.write_all(&[0x04]).await?;
	stream.flush().await
}

/// Installs a test subscriber honoring `RUST_LOG`. Safe to call from
/// multiple tests; only the first call wins.
pub fn init_tracing()
{
	use tracing_subscriber::EnvFilter;

	let _ = tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

/// A temporary directory removed on drop.
pub struct TempDir
{
	path: PathBuf,
}

impl TempDir
{
	pub fn path(&self) -> &Path
	{
		&self.path
	}
}

impl Drop for TempDir
{
	fn drop(&mut self)
	{
		let _ = std::fs::remove_dir_all(&self.path);
	}
}

/// Creates a unique temporary directory for one test.
pub fn temp_dir() -> TempDir
{
	let path = std::env::temp_dir().join(format!("syndrdb-test-{}", Uuid::new_v4().simple()));

	std::fs::create_dir_all(&path).unwrap();
	TempDir { path }
}
