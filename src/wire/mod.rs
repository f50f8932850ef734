//! The wire layer: framing constants, the [`Codec`], the [`Transport`]
//! abstraction, and the TCP/TLS transport implementation.
//!
//! SyndrDB frames are byte sequences terminated by a single EOT byte
//! (`0x04`). Parameters inside `EXECUTE` frames are separated by ENQ bytes
//! (`0x05`); parameter values containing either control byte escape it by
//! duplication. The transport delivers whole frames; this layer never
//! reframes.

mod codec;
mod response;
mod transport;

pub use self::{
	codec::{Codec, ENQ, EOT, escape_param},
	response::ServerResponse,
	transport::{TcpTransport, Transport},
};
