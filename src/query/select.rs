use std::fmt::Write;

use derive_more::Display;

use crate::error::Result;
use crate::query::fingerprint::FingerprintBuilder;
use crate::query::{
	BuiltQuery,
	Condition,
	Connector,
	Operator,
	OrderDirection,
	Value,
	WhereStyle,
	render_conditions,
};

/// Join flavors supported by SELECT queries.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinKind
{
	#[display("LEFT JOIN")]
	Left,

	#[display("INNER JOIN")]
	Inner,

	#[display("RIGHT JOIN")]
	Right,
}

#[derive(Debug, Clone, PartialEq)]
struct JoinClause
{
	kind: JoinKind,
	bundle: String,
	left: String,
	right: String,
}

#[derive(Debug, Clone, PartialEq)]
struct OrderClause
{
	field: String,
	direction: OrderDirection,
}

/// Fluent builder for SELECT queries.
///
/// ```
/// use syndrdb::query::{Operator, OrderDirection, SelectBuilder};
///
/// let query = SelectBuilder::new("Users")
///     .fields(["id", "name", "email"])
///     .filter("age", Operator::Gt, 18)
///     .and("status", Operator::Eq, "active")
///     .order_by("name", OrderDirection::Asc)
///     .limit(50)
///     .offset(100)
///     .build()
///     .unwrap();
///
/// assert_eq!(
///     query.text,
///     "SELECT id, name, email FROM Users WHERE age > $1 AND status = $2 \
///      ORDER BY name ASC LIMIT 50 OFFSET 100;",
/// );
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SelectBuilder
{
	bundle: String,
	fields: Vec<String>,
	joins: Vec<JoinClause>,
	conditions: Vec<Condition>,
	order: Vec<OrderClause>,
	limit: Option<u64>,
	offset: Option<u64>,
}

impl SelectBuilder
{
	pub fn new(bundle: impl Into<String>) -> Self
	{
		Self {
			bundle: bundle.into(),
			fields: Vec::new(),
			joins: Vec::new(),
			conditions: Vec::new(),
			order: Vec::new(),
			limit: None,
			offset: None,
		}
	}

	/// Adds one projected field. Without any, `*` is selected.
	pub fn field(mut self, field: impl Into<String>) -> Self
	{
		self.fields.push(field.into());
		self
	}

	/// Adds several projected fields.
	pub fn fields<F>(mut self, fields: impl IntoIterator<Item = F>) -> Self
	where
		F: Into<String>,
	{
		self.fields.extend(fields.into_iter().map(Into::into));
		self
	}

	/// Adds the first WHERE condition (connected with AND when conditions
	/// already exist).
	pub fn filter(
		self,
		field: impl Into<String>,
		operator: Operator,
		value: impl Into<Value>,
	) -> Self
	{
		self.and(field, operator, value)
	}

	/// Adds an AND-connected condition.
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

	/// Adds an OR-connected condition.
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

	/// Adds a join clause: `<kind> <bundle> ON <left> = <right>`.
	pub fn join(
		mut self,
		kind: JoinKind,
		bundle: impl Into<String>,
		left: impl Into<String>,
		right: impl Into<String>,
	) -> Self
	{
		self.joins.push(JoinClause {
			kind,
			bundle: bundle.into(),
			left: left.into(),
			right: right.into(),
		});
		self
	}

	pub fn order_by(mut self, field: impl Into<String>, direction: OrderDirection) -> Self
	{
		self.order.push(OrderClause { field: field.into(), direction });
		self
	}

	pub fn limit(mut self, limit: u64) -> Self
	{
		self.limit = Some(limit);
		self
	}

	pub fn offset(mut self, offset: u64) -> Self
	{
		self.offset = Some(offset);
		self
	}

	pub(crate) fn bundle(&self) -> &str
	{
		&self.bundle
	}

	pub(crate) fn projected_fields(&self) -> &[String]
	{
		&self.fields
	}

	pub(crate) fn where_fields(&self) -> impl Iterator<Item = &str>
	{
		self.conditions.iter().map(|condition| condition.field.as_str())
	}

	pub(crate) fn order_fields(&self) -> impl Iterator<Item = &str>
	{
		self.order.iter().map(|clause| clause.field.as_str())
	}

	/// The structural cache key for this query.
	pub fn fingerprint(&self) -> String
	{
		let mut joins = String::new();
		for join in &self.joins {
			let _ = write!(joins, "{}:{}:{}={};", join.kind, join.bundle, join.left, join.right);
		}

		let mut order = String::new();
		for clause in &self.order {
			let _ = write!(order, "{}:{};", clause.field, clause.direction);
		}

		FingerprintBuilder::new("select", &self.bundle)
			.fields(self.fields.iter().map(String::as_str))
			.raw(&joins)
			.conditions(&self.conditions)
			.raw(&order)
			.flag("limit", self.limit.is_some())
			.flag("offset", self.offset.is_some())
			.finish()
	}

	/// Renders the query text and parameter list.
	pub fn build(&self) -> Result<BuiltQuery>
	{
		let mut params = Vec::new();
		let mut text = String::from("SELECT ");

		if self.fields.is_empty() {
			text.push('*');
		} else {
			text.push_str(&self.fields.join(", "));
		}

		let _ = write!(text, " FROM {}", self.bundle);

		for join in &self.joins {
			let _ = write!(
				text,
				" {} {} ON {} = {}",
				join.kind, join.bundle, join.left, join.right,
			);
		}

		if !self.conditions.is_empty() {
			let clause = render_conditions(&self.conditions, WhereStyle::Placeholders, &mut params);
			let _ = write!(text, " WHERE {clause}");
		}

		if !self.order.is_empty() {
			let clauses = self
				.order
				.iter()
				.map(|clause| format!("{} {}", clause.field, clause.direction))
				.collect::<Vec<_>>()
				.join(", ");

			let _ = write!(text, " ORDER BY {clauses}");
		}

		if let Some(limit) = self.limit {
			let _ = write!(text, " LIMIT {limit}");
		}

		if let Some(offset) = self.offset {
			let _ = write!(text, " OFFSET {offset}");
		}

		text.push(';');

		Ok(BuiltQuery { text, params, fingerprint: self.fingerprint() })
	}
}
