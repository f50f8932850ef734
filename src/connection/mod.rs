//! A single connection to a SyndrDB server.
//!
//! [`Connection`] wraps one [`Transport`] plus the [`Codec`], tracks
//! liveness and last activity, and serializes frame exchanges so that the
//! N-th send on a connection is always paired with the N-th receive.

mod handshake;
mod state;

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::wire::{Codec, ServerResponse, Transport};

pub(crate) use self::handshake::authenticate;
pub use self::state::{ConnectionState, StateManager, StateTransition, TransitionHandler};

/// A live connection to the server.
///
/// Once a connection is marked not-alive it never becomes alive again; the
/// pool replaces it instead.
pub struct Connection
{
	remote_addr: String,
	transport: tokio::sync::Mutex<Box<dyn Transport>>,
	codec: Codec,
	alive: AtomicBool,
	last_activity: Mutex<Instant>,
	created_at: Instant,
}

impl std::fmt::Debug for Connection
{
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		fmt.debug_struct("Connection")
			.field("remote_addr", &self.remote_addr)
			.field("alive", &self.is_alive())
			.finish_non_exhaustive()
	}
}

impl Connection
{
	pub fn new(transport: Box<dyn Transport>, remote_addr: impl Into<String>) -> Self
	{
		let now = Instant::now();

		Self {
			remote_addr: remote_addr.into(),
			transport: tokio::sync::Mutex::new(transport),
			codec: Codec,
			alive: AtomicBool::new(true),
			last_activity: Mutex::new(now),
			created_at: now,
		}
	}

	pub fn remote_addr(&self) -> &str
	{
		&self.remote_addr
	}

	pub fn is_alive(&self) -> bool
	{
		self.alive.load(Ordering::Acquire)
	}

	/// Marks the connection as unusable. Irreversible.
	pub(crate) fn mark_dead(&self)
	{
		self.alive.store(false, Ordering::Release);
	}

	/// When this connection last completed a send or receive.
	pub fn last_activity(&self) -> Instant
	{
		*self.lock_activity()
	}

	/// How long the connection has been idle.
	pub fn idle_for(&self) -> Duration
	{
		self.last_activity().elapsed()
	}

	pub fn age(&self) -> Duration
	{
		self.created_at.elapsed()
	}

	/// Sends one command frame.
	#[tracing::instrument(level = "trace", skip(self, cancel), fields(remote_addr = %self.remote_addr), err(level = "debug"))]
	pub async fn send_command(&self, cancel: &CancellationToken, command: &str) -> Result<()>
	{
		let mut transport = self.transport.lock().await;
		self.send_locked(cancel, &mut transport, command).await
	}

	/// Receives and decodes one response frame.
	#[tracing::instrument(level = "trace", skip(self, cancel), fields(remote_addr = %self.remote_addr), err(level = "debug"))]
	pub async fn receive_response(&self, cancel: &CancellationToken) -> Result<ServerResponse>
	{
		let mut transport = self.transport.lock().await;
		self.receive_locked(cancel, &mut transport).await
	}

	/// Sends `command` and receives its response while holding the
	/// transport lock, so interleaved callers cannot steal each other's
	/// responses.
	#[tracing::instrument(level = "trace", skip(self, cancel), fields(remote_addr = %self.remote_addr), err(level = "debug"))]
	pub async fn roundtrip(&self, cancel: &CancellationToken, command: &str)
		-> Result<ServerResponse>
	{
		let mut transport = self.transport.lock().await;

		self.send_locked(cancel, &mut transport, command).await?;
		self.receive_locked(cancel, &mut transport).await
	}

	/// Sends `PING;` and expects a successful (or `PONG`) response.
	pub async fn ping(&self, cancel: &CancellationToken) -> Result<()>
	{
		let response = self.roundtrip(cancel, "PING;").await?;

		if response.is_success() || response.text().contains("PONG") {
			return Ok(());
		}

		Err(Error::protocol(format!("unexpected ping response: {}", response.error_message())))
	}

	/// Closes the underlying transport. Idempotent.
	pub async fn close(&self) -> Result<()>
	{
		self.mark_dead();

		let mut transport = self.transport.lock().await;

		if let Err(err) = transport.close().await {
			tracing::debug!(
				error = &err as &dyn std::error::Error,
				remote_addr = %self.remote_addr,
				"error while closing transport",
			);
		}

		Ok(())
	}

	async fn send_locked(
		&self,
		cancel: &CancellationToken,
		transport: &mut Box<dyn Transport>,
		command: &str,
	) -> Result<()>
	{
		if !self.is_alive() {
			return Err(Error::connection("connection is no longer alive")
				.with_detail("remote_addr", &self.remote_addr));
		}

		let frame = self.codec.encode(command);

		tokio::select! {
			biased;

			() = cancel.cancelled() => {
				self.mark_dead();
				Err(Error::cancelled("send cancelled"))
			},

			result = transport.send(&frame) => match result {
				Ok(()) => {
					self.touch();
					Ok(())
				},
				Err(err) => {
					self.mark_dead();
					Err(Error::connection(format!("send failed: {err}")).with_source(err))
				},
			},
		}
	}

	async fn receive_locked(
		&self,
		cancel: &CancellationToken,
		transport: &mut Box<dyn Transport>,
	) -> Result<ServerResponse>
	{
		tokio::select! {
			biased;

			() = cancel.cancelled() => {
				self.mark_dead();
				Err(Error::cancelled("receive cancelled"))
			},

			result = transport.receive() => match result {
				Ok(frame) => {
					self.touch();
					self.codec.decode(&frame)
				},
				Err(err) => {
					self.mark_dead();
					Err(Error::connection(format!("receive failed: {err}")).with_source(err))
				},
			},
		}
	}

	fn touch(&self)
	{
		*self.lock_activity() = Instant::now();
	}

	fn lock_activity(&self) -> std::sync::MutexGuard<'_, Instant>
	{
		self.last_activity
			.lock()
			.unwrap_or_else(std::sync::PoisonError::into_inner)
	}
}
