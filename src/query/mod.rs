//! Fluent query builders for SyndrQL.
//!
//! Each builder accumulates structured clauses and emits a deterministic
//! textual command plus a parameter list ([`BuiltQuery`]). SELECT queries
//! carry their WHERE values as `$N` placeholders; DML commands (insert,
//! update, delete) inline their values, since the wire protocol does not
//! parameterize DML. Builders also produce a structural [fingerprint] used
//! as a prepared-statement cache key.
//!
//! [fingerprint]: self::fingerprint

mod delete;
mod fingerprint;
mod insert;
mod select;
mod update;

use std::fmt::Write;

use derive_more::Display;

use crate::error::{Error, Result};

pub use self::{
	delete::DeleteBuilder,
	insert::{Document, InsertBuilder},
	select::{JoinKind, SelectBuilder},
	update::UpdateBuilder,
};

/// A scalar parameter or document value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value
{
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	Str(String),
}

impl Value
{
	/// The inline SQL literal form used in parameter positions: strings are
	/// single-quoted with embedded quotes doubled, booleans are uppercase
	/// keywords, null is `NULL`.
	pub fn to_inline_literal(&self) -> String
	{
		match *self {
			Self::Null => String::from("NULL"),
			Self::Bool(true) => String::from("TRUE"),
			Self::Bool(false) => String::from("FALSE"),
			Self::Int(value) => value.to_string(),
			Self::Float(value) => value.to_string(),
			Self::Str(ref value) => format!("'{}'", value.replace('\'', "''")),
		}
	}

	/// The DML literal form: strings are double-quoted (JSON-style
	/// escaping), booleans are uppercase keywords, null is `NULL`.
	pub fn to_dml_literal(&self) -> String
	{
		match *self {
			Self::Null => String::from("NULL"),
			Self::Bool(true) => String::from("TRUE"),
			Self::Bool(false) => String::from("FALSE"),
			Self::Int(value) => value.to_string(),
			Self::Float(value) => value.to_string(),
			Self::Str(ref value) => {
				serde_json::to_string(value).unwrap_or_else(|_| format!("{value:?}"))
			},
		}
	}

	/// The JSON-style form used inside document literals.
	pub fn to_document_literal(&self) -> String
	{
		match *self {
			Self::Null => String::from("null"),
			Self::Bool(value) => value.to_string(),
			Self::Int(value) => value.to_string(),
			Self::Float(value) => value.to_string(),
			Self::Str(ref value) => {
				serde_json::to_string(value).unwrap_or_else(|_| format!("{value:?}"))
			},
		}
	}

	/// The stringified form sent as an `EXECUTE` parameter. Null is the
	/// empty string.
	pub fn to_wire_string(&self) -> String
	{
		match *self {
			Self::Null => String::new(),
			Self::Bool(value) => value.to_string(),
			Self::Int(value) => value.to_string(),
			Self::Float(value) => value.to_string(),
			Self::Str(ref value) => value.clone(),
		}
	}
}

impl From<&str> for Value
{
	fn from(value: &str) -> Self
	{
		Self::Str(value.to_owned())
	}
}

impl From<String> for Value
{
	fn from(value: String) -> Self
	{
		Self::Str(value)
	}
}

impl From<i64> for Value
{
	fn from(value: i64) -> Self
	{
		Self::Int(value)
	}
}

impl From<i32> for Value
{
	fn from(value: i32) -> Self
	{
		Self::Int(i64::from(value))
	}
}

impl From<f64> for Value
{
	fn from(value: f64) -> Self
	{
		Self::Float(value)
	}
}

impl From<bool> for Value
{
	fn from(value: bool) -> Self
	{
		Self::Bool(value)
	}
}

impl<T> From<Option<T>> for Value
where
	T: Into<Value>,
{
	fn from(value: Option<T>) -> Self
	{
		value.map_or(Self::Null, Into::into)
	}
}

/// Comparison operators usable in WHERE clauses.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator
{
	#[display("=")]
	Eq,

	#[display("!=")]
	Ne,

	#[display(">")]
	Gt,

	#[display(">=")]
	Ge,

	#[display("<")]
	Lt,

	#[display("<=")]
	Le,

	#[display("LIKE")]
	Like,

	#[display("IS NULL")]
	IsNull,

	#[display("IS NOT NULL")]
	IsNotNull,
}

impl Operator
{
	/// Whether the operator takes a right-hand value (and therefore a
	/// placeholder).
	pub fn takes_value(self) -> bool
	{
		!matches!(self, Self::IsNull | Self::IsNotNull)
	}
}

/// How a condition connects to the previous one.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Connector
{
	#[display("AND")]
	And,

	#[display("OR")]
	Or,
}

/// Sort direction for ORDER BY clauses.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderDirection
{
	#[display("ASC")]
	Asc,

	#[display("DESC")]
	Desc,
}

/// One WHERE condition. The connector applies between this condition and
/// the previous one and is ignored on the first.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Condition
{
	pub field: String,
	pub operator: Operator,
	pub value: Value,
	pub connector: Connector,
}

/// How WHERE values are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WhereStyle
{
	/// Sequential `$N` placeholders; values collected into the parameter
	/// list.
	Placeholders,

	/// Values inlined as DML literals.
	InlineDml,
}

/// A fully rendered query: command text, parameter list, and structural
/// fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery
{
	pub text: String,
	pub params: Vec<Value>,
	pub fingerprint: String,
}

/// Renders a WHERE clause (without the leading `WHERE` keyword).
pub(crate) fn render_conditions(
	conditions: &[Condition],
	style: WhereStyle,
	params: &mut Vec<Value>,
) -> String
{
	let mut sql = String::new();

	for (idx, condition) in conditions.iter().enumerate() {
		if idx > 0 {
			let _ = write!(sql, " {} ", condition.connector);
		}

		let _ = write!(sql, "{} {}", condition.field, condition.operator);

		if condition.operator.takes_value() {
			match style {
				WhereStyle::Placeholders => {
					params.push(condition.value.clone());
					let _ = write!(sql, " ${}", params.len());
				},
				WhereStyle::InlineDml => {
					let _ = write!(sql, " {}", condition.value.to_dml_literal());
				},
			}
		}
	}

	sql
}

/// Substitutes each `$N` placeholder in `text` with the properly quoted
/// inline literal of `params[N - 1]`.
pub fn inline_parameters(text: &str, params: &[Value]) -> Result<String>
{
	let mut result = String::with_capacity(text.len());
	let mut chars = text.char_indices().peekable();

	while let Some((_, ch)) = chars.next() {
		if ch != '$' {
			result.push(ch);
			continue;
		}

		let mut digits = String::new();

		while let Some(&(_, digit)) = chars.peek() {
			if digit.is_ascii_digit() {
				digits.push(digit);
				chars.next();
			} else {
				break;
			}
		}

		if digits.is_empty() {
			result.push('$');
			continue;
		}

		let index = digits.parse::<usize>().map_err(|err| {
			Error::invalid_query(format!("invalid placeholder ${digits}")).with_source(err)
		})?;

		let value = index
			.checked_sub(1)
			.and_then(|idx| params.get(idx))
			.ok_or_else(|| {
				Error::invalid_query(format!(
					"placeholder ${index} has no matching parameter ({} given)",
					params.len(),
				))
			})?;

		result.push_str(&value.to_inline_literal());
	}

	Ok(result)
}

/// Quotes an identifier for DDL/DML positions.
pub(crate) fn quote_ident(ident: &str) -> String
{
	format!("\"{ident}\"")
}
