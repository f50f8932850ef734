use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One decoded response frame from the server.
///
/// JSON frames deserialize into this shape directly. Plain-text frames (the
/// welcome banner, acknowledgements from old server builds) are wrapped via
/// [`ServerResponse::raw()`] with the text preserved in `message`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerResponse
{
	pub status: String,
	pub code: Option<String>,
	pub message: Option<String>,
	pub data: Option<JsonValue>,
	pub error: Option<String>,
	pub details: Option<JsonValue>,
}

impl ServerResponse
{
	/// Wraps a non-JSON frame.
	pub fn raw(text: impl Into<String>) -> Self
	{
		Self {
			status: String::from("raw"),
			message: Some(text.into()),
			..Self::default()
		}
	}

	pub fn is_success(&self) -> bool
	{
		self.status.eq_ignore_ascii_case("success")
	}

	/// The most specific error text available, falling back to the status.
	pub fn error_message(&self) -> &str
	{
		self.error
			.as_deref()
			.or(self.message.as_deref())
			.unwrap_or(&self.status)
	}

	/// All human-readable text in the frame, concatenated.
	///
	/// Used for substring checks against acknowledgements, e.g. the `S0001`
	/// welcome token and `Transaction started with ID: …`.
	pub fn text(&self) -> String
	{
		let mut text = self.status.clone();

		for part in [self.code.as_deref(), self.message.as_deref(), self.error.as_deref()] {
			if let Some(part) = part {
				text.push(' ');
				text.push_str(part);
			}
		}

		if let Some(ref data) = self.data {
			text.push(' ');
			text.push_str(&data.to_string());
		}

		text
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn success_is_case_insensitive()
	{
		for status in ["success", "SUCCESS", "Success"] {
			let response = ServerResponse { status: status.into(), ..Default::default() };
			assert!(response.is_success());
		}

		let response = ServerResponse { status: "error".into(), ..Default::default() };
		assert!(!response.is_success());
	}

	#[test]
	fn text_includes_message_and_data()
	{
		let response = ServerResponse {
			status: "success".into(),
			message: Some("Transaction started with ID: abc123".into()),
			data: Some(serde_json::json!({"count": 1})),
			..Default::default()
		};

		let text = response.text();
		assert!(text.contains("Transaction started with ID: abc123"));
		assert!(text.contains("\"count\":1"));
	}
}
