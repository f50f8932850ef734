use std::fmt::Write;

use crate::error::{Error, Result};
use crate::query::fingerprint::FingerprintBuilder;
use crate::query::{BuiltQuery, Value, quote_ident};

/// One document's field/value pairs, in insertion order.
pub type Document = Vec<(String, Value)>;

/// Fluent builder for `ADD DOCUMENT TO BUNDLE` commands.
///
/// ```
/// use syndrdb::query::InsertBuilder;
///
/// let query = InsertBuilder::new("Users")
///     .set("name", "Alice")
///     .set("age", 30)
///     .build()
///     .unwrap();
///
/// assert_eq!(
///     query.text,
///     r#"ADD DOCUMENT TO BUNDLE "Users" WITH ({"name": "Alice", "age": 30});"#,
/// );
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct InsertBuilder
{
	bundle: String,
	documents: Vec<Document>,
	current: Document,
}

impl InsertBuilder
{
	pub fn new(bundle: impl Into<String>) -> Self
	{
		Self {
			bundle: bundle.into(),
			documents: Vec::new(),
			current: Document::new(),
		}
	}

	/// Sets a field on the document currently being assembled.
	pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self
	{
		self.current.push((field.into(), value.into()));
		self
	}

	/// Finishes the current document and starts a new one, for multi-document
	/// inserts.
	pub fn next_document(mut self) -> Self
	{
		if !self.current.is_empty() {
			self.documents.push(std::mem::take(&mut self.current));
		}

		self
	}

	/// Adds a whole document at once.
	pub fn document(mut self, document: Document) -> Self
	{
		self = self.next_document();
		self.documents.push(document);
		self
	}

	pub(crate) fn bundle(&self) -> &str
	{
		&self.bundle
	}

	pub(crate) fn field_names(&self) -> impl Iterator<Item = &str>
	{
		self.documents
			.iter()
			.chain(std::iter::once(&self.current))
			.flat_map(|document| document.iter().map(|(field, _)| field.as_str()))
	}

	pub fn fingerprint(&self) -> String
	{
		FingerprintBuilder::new("insert", &self.bundle)
			.fields(self.field_names())
			.finish()
	}

	pub fn build(&self) -> Result<BuiltQuery>
	{
		let mut documents = self.documents.iter().collect::<Vec<_>>();

		if !self.current.is_empty() {
			documents.push(&self.current);
		}

		if documents.is_empty() {
			return Err(Error::invalid_query("insert requires at least one document field"));
		}

		let mut text = format!("ADD DOCUMENT TO BUNDLE {} WITH (", quote_ident(&self.bundle));

		for (doc_idx, document) in documents.iter().enumerate() {
			if doc_idx > 0 {
				text.push_str(", ");
			}

			text.push('{');

			for (field_idx, (field, value)) in document.iter().enumerate() {
				if field_idx > 0 {
					text.push_str(", ");
				}

				let _ = write!(
					text,
					"{}: {}",
					quote_ident(field),
					value.to_document_literal(),
				);
			}

			text.push('}');
		}

		text.push_str(");");

		Ok(BuiltQuery { text, params: Vec::new(), fingerprint: self.fingerprint() })
	}
}
