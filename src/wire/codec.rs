use crate::error::{Error, Result};
use crate::wire::ServerResponse;

/// Frame terminator.
pub const EOT: u8 = 0x04;

/// Parameter separator inside `EXECUTE` frames.
pub const ENQ: u8 = 0x05;

/// Encodes outgoing command strings and decodes inbound frames.
///
/// The codec is stateless; it exists as a type so the [`Connection`] can hold
/// one and tests can exercise encoding rules in isolation.
///
/// [`Connection`]: crate::connection::Connection
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec;

impl Codec
{
	/// Encodes a command for the wire by appending the frame terminator.
	///
	/// The command text itself is passed through byte-for-byte; no quoting
	/// or escaping happens here.
	pub fn encode(&self, command: &str) -> Vec<u8>
	{
		let mut frame = Vec::with_capacity(command.len() + 1);
		frame.extend_from_slice(command.as_bytes());
		frame.push(EOT);
		frame
	}

	/// Decodes one inbound frame (without its terminator) into a
	/// [`ServerResponse`].
	///
	/// Frames that look like JSON objects must parse as JSON; anything else
	/// is preserved as a raw text response.
	pub fn decode(&self, frame: &[u8]) -> Result<ServerResponse>
	{
		let frame = match frame.split_last() {
			Some((&EOT, rest)) => rest,
			_ => frame,
		};

		let text = std::str::from_utf8(frame).map_err(|err| {
			Error::protocol("frame is not valid UTF-8").with_source(err)
		})?;

		let trimmed = text.trim();

		if trimmed.starts_with('{') {
			serde_json::from_str::<ServerResponse>(trimmed).map_err(|err| {
				Error::protocol("failed to parse JSON frame")
					.with_detail("frame", truncate(trimmed, 256))
					.with_source(err)
			})
		} else {
			Ok(ServerResponse::raw(trimmed))
		}
	}
}

/// Escapes a parameter value for inclusion in an `EXECUTE` frame by
/// duplicating any EOT or ENQ bytes.
///
/// This is the only escaping applied to parameter bytes; layering any other
/// encoding over the wire frames would alter byte semantics.
pub fn escape_param(value: &str) -> String
{
	let mut escaped = String::with_capacity(value.len());

	for ch in value.chars() {
		escaped.push(ch);

		if ch as u32 == u32::from(EOT) || ch as u32 == u32::from(ENQ) {
			escaped.push(ch);
		}
	}

	escaped
}

fn truncate(text: &str, max: usize) -> String
{
	if text.len() <= max {
		return text.to_owned();
	}

	let mut end = max;
	while !text.is_char_boundary(end) {
		end -= 1;
	}

	format!("{}…", &text[..end])
}
