#![doc = include_str!("../README.md")]

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod health;
pub mod hooks;
pub mod migrate;
pub mod pool;
pub mod query;
pub mod schema;
pub mod statement;
pub mod transaction;
pub mod wire;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod tests;

pub use self::{
	client::Client,
	config::{ClientOptions, LogLevel, TlsOptions},
	error::{Error, ErrorKind, Result},
};
