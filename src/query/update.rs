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

/// Fluent builder for `UPDATE DOCUMENTS IN BUNDLE` commands.
///
/// DML is not parameterized by the wire protocol, so WHERE values are
/// inlined as DML literals.
///
/// ```
/// use syndrdb::query::{Operator, UpdateBuilder};
///
/// let query = UpdateBuilder::new("Users")
///     .set("status", "inactive")
///     .filter("lastLogin", Operator::Lt, "2024-01-01")
///     .build()
///     .unwrap();
///
/// assert_eq!(
///     query.text,
///     r#"UPDATE DOCUMENTS IN BUNDLE "Users" ("status" = "inactive") WHERE lastLogin < "2024-01-01";"#,
/// );
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateBuilder
{
	bundle: String,
	assignments: Vec<(String, Value)>,
	conditions: Vec<Condition>,
}

impl UpdateBuilder
{
	pub fn new(bundle: impl Into<String>) -> Self
	{
		Self {
			bundle: bundle.into(),
			assignments: Vec::new(),
			conditions: Vec::new(),
		}
	}

	/// Adds a field assignment.
	pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self
	{
		self.assignments.push((field.into(), value.into()));
		self
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

	pub(crate) fn assigned_fields(&self) -> impl Iterator<Item = &str>
	{
		self.assignments.iter().map(|(field, _)| field.as_str())
	}

	pub(crate) fn where_fields(&self) -> impl Iterator<Item = &str>
	{
		self.conditions.iter().map(|condition| condition.field.as_str())
	}

	pub fn fingerprint(&self) -> String
	{
		FingerprintBuilder::new("update", &self.bundle)
			.fields(self.assigned_fields())
			.conditions(&self.conditions)
			.finish()
	}

	pub fn build(&self) -> Result<BuiltQuery>
	{
		if self.assignments.is_empty() {
			return Err(Error::invalid_query("update requires at least one assignment"));
		}

		let mut text = format!("UPDATE DOCUMENTS IN BUNDLE {} (", quote_ident(&self.bundle));

		for (idx, (field, value)) in self.assignments.iter().enumerate() {
			if idx > 0 {
				text.push_str(", ");
			}

			let _ = write!(text, "{} = {}", quote_ident(field), value.to_dml_literal());
		}

		text.push(')');

		if !self.conditions.is_empty() {
			let mut params = Vec::new();
			let clause = render_conditions(&self.conditions, WhereStyle::InlineDml, &mut params);
			let _ = write!(text, " WHERE {clause}");
		}

		text.push(';');

		Ok(BuiltQuery { text, params: Vec::new(), fingerprint: self.fingerprint() })
	}
}
