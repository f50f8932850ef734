use std::fmt::Write;

use crate::error::{Error, Result};
use crate::query::fingerprint::FingerprintBuilder;
use crate::query::{
	BuiltQuery,
	Condition,
	Connector,
	Operator,
	Value,
	WhereStyle,
	quote_ident,
	render_conditions,
};

/// Fluent builder for `DELETE DOCUMENTS FROM` commands.
///
/// A delete without any WHERE clause is rejected at build time; wiping a
/// whole bundle must be spelled out as DDL instead.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteBuilder
{
	bundle: String,
	conditions: Vec<Condition>,
}

impl DeleteBuilder
{
	pub fn new(bundle: impl Into<String>) -> Self
	{
		Self { bundle: bundle.into(), conditions: Vec::new() }
	}

	/// Adds a WHERE condition (AND-connected).
	pub fn filter(
		self,
		field: impl Into<String>,
		operator: Operator,
		value: impl Into<Value>,
	) -> Self
	{
		self.and(field, operator, value)
	}

	pub fn and(
		mut self,
		field: impl Into<String>,
		operator: Operator,
		value: impl Into<Value>,
	) -> Self
	{
		self.conditions.push(Condition {
			field: field.into(),
			operator,
			value: value.into(),
			connector: Connector::And,
		});
		self
	}

	pub fn or(
		mut self,
		field: impl Into<String>,
		operator: Operator,
		value: impl Into<Value>,
	) -> Self
	{
		self.conditions.push(Condition {
			field: field.into(),
			operator,
			value: value.into(),
			connector: Connector::Or,
		});
		self
	}

	pub(crate) fn bundle(&self) -> &str
	{
		&self.bundle
	}

	pub(crate) fn where_fields(&self) -> impl Iterator<Item = &str>
	{
		self.conditions.iter().map(|condition| condition.field.as_str())
	}

	pub fn fingerprint(&self) -> String
	{
		FingerprintBuilder::new("delete", &self.bundle)
			.conditions(&self.conditions)
			.finish()
	}

	pub fn build(&self) -> Result<BuiltQuery>
	{
		if self.conditions.is_empty() {
			return Err(Error::invalid_query(format!(
				"WHERE clause required: refusing to delete all documents from bundle `{}`",
				self.bundle,
			)));
		}

		let mut params = Vec::new();
		let clause = render_conditions(&self.conditions, WhereStyle::InlineDml, &mut params);

		let mut text = format!("DELETE DOCUMENTS FROM {}", quote_ident(&self.bundle));
		let _ = write!(text, " WHERE {clause};");

		Ok(BuiltQuery { text, params: Vec::new(), fingerprint: self.fingerprint() })
	}
}
