//! Structural query fingerprints.
//!
//! A fingerprint is a hash over a query's structural template: bundle, query
//! type, projected fields, where-clause fields and operators (values
//! excluded), order-by structure, and limit/offset presence. Two queries
//! that differ only in their WHERE values share a fingerprint; any
//! structural difference yields a distinct one.

use std::fmt::Write;

use sha2::{Digest, Sha256};

use crate::query::Condition;

/// Accumulates the structural description and hashes it.
pub(crate) struct FingerprintBuilder
{
	descriptor: String,
}

impl FingerprintBuilder
{
	pub(crate) fn new(query_type: &str, bundle: &str) -> Self
	{
		Self { descriptor: format!("{query_type}|{bundle}") }
	}

	pub(crate) fn fields<'f>(mut self, fields: impl IntoIterator<Item = &'f str>) -> Self
	{
		self.descriptor.push_str("|f:");

		for field in fields {
			self.descriptor.push_str(field);
			self.descriptor.push(',');
		}

		self
	}

	pub(crate) fn conditions(mut self, conditions: &[Condition]) -> Self
	{
		self.descriptor.push_str("|w:");

		for condition in conditions {
			let _ = write!(
				self.descriptor,
				"{}{}{};",
				condition.connector, condition.field, condition.operator,
			);
		}

		self
	}

	pub(crate) fn raw(mut self, part: &str) -> Self
	{
		self.descriptor.push('|');
		self.descriptor.push_str(part);
		self
	}

	pub(crate) fn flag(mut self, name: &str, present: bool) -> Self
	{
		let _ = write!(self.descriptor, "|{name}:{}", u8::from(present));
		self
	}

	pub(crate) fn finish(self) -> String
	{
		let digest = Sha256::digest(self.descriptor.as_bytes());

		let mut hex = String::with_capacity(digest.len() * 2);
		for byte in digest {
			let _ = write!(hex, "{byte:02x}");
		}

		hex
	}
}

#[cfg(test)]
mod tests
{
	use super::*;
	use crate::query::{Connector, Operator, Value};

	fn condition(field: &str, operator: Operator, value: Value) -> Condition
	{
		Condition { field: field.to_owned(), operator, value, connector: Connector::And }
	}

	#[test]
	fn values_do_not_affect_the_fingerprint()
	{
		let one = FingerprintBuilder::new("select", "Users")
			.conditions(&[condition("age", Operator::Gt, Value::Int(18))])
			.finish();

		let two = FingerprintBuilder::new("select", "Users")
			.conditions(&[condition("age", Operator::Gt, Value::Int(99))])
			.finish();

		assert_eq!(one, two);
	}

	#[test]
	fn structure_does_affect_the_fingerprint()
	{
		let base = FingerprintBuilder::new("select", "Users").finish();

		let other_bundle = FingerprintBuilder::new("select", "Orders").finish();
		let other_type = FingerprintBuilder::new("delete", "Users").finish();
		let with_where = FingerprintBuilder::new("select", "Users")
			.conditions(&[condition("age", Operator::Gt, Value::Int(18))])
			.finish();

		assert_ne!(base, other_bundle);
		assert_ne!(base, other_type);
		assert_ne!(base, with_where);
	}
}
