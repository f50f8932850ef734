//! Automatic rollback generation.
//!
//! [`generate_down`] derives down commands from up commands, in reverse
//! order. Identifiers are extracted by regex and may be quoted with double
//! quotes, single quotes, or backticks; generated output always uses
//! uppercase keywords and double-quoted identifiers.
//!
//! Destructive or ambiguous up commands (drops, removals, modifications,
//! plain DML) cannot be reversed automatically and produce a descriptive
//! error instead.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, ErrorKind, Result, code};

static CREATE_BUNDLE: LazyLock<Regex> = LazyLock::new(|| {
	compile(r#"(?i)^\s*CREATE\s+BUNDLE\s+["'`]([^"'`]+)["'`]"#)
});

static CREATE_INDEX: LazyLock<Regex> = LazyLock::new(|| {
	compile(r#"(?i)^\s*CREATE\s+(?:HASH\s+INDEX|B-INDEX|INDEX)\s+["'`]([^"'`]+)["'`]"#)
});

static ADD_RELATIONSHIP: LazyLock<Regex> = LazyLock::new(|| {
	compile(
		r#"(?i)^\s*UPDATE\s+BUNDLE\s+["'`]([^"'`]+)["'`]\s+ADD\s+RELATIONSHIP\s*\(\s*["'`]([^"'`]+)["'`]"#,
	)
});

static UPDATE_BUNDLE_SET: LazyLock<Regex> = LazyLock::new(|| {
	compile(r#"(?i)^\s*UPDATE\s+BUNDLE\s+["'`]([^"'`]+)["'`]\s+SET\s*\("#)
});

static ADDED_FIELD: LazyLock<Regex> = LazyLock::new(|| {
	compile(r#"(?i)\{\s*ADD\s+["'`]([^"'`]+)["'`]"#)
});

fn compile(pattern: &str) -> Regex
{
	Regex::new(pattern).unwrap_or_else(|err| {
		unreachable!("hard-coded regex is valid: {err}");
	})
}

/// Derives down commands for `up_commands`, reversed.
///
/// Returns an error naming the first command that cannot be reversed.
pub fn generate_down(up_commands: &[String]) -> Result<Vec<String>>
{
	up_commands
		.iter()
		.rev()
		.map(|command| reverse_command(command))
		.collect()
}

fn reverse_command(command: &str) -> Result<String>
{
	if let Some(unsupported) = unsupported_class(command) {
		return Err(Error::new(
			ErrorKind::Migration,
			code::ROLLBACK_NOT_SUPPORTED,
			format!("cannot auto-generate a rollback for {unsupported}: `{}`", truncated(command)),
		));
	}

	if let Some(captures) = CREATE_BUNDLE.captures(command) {
		return Ok(format!(r#"DROP BUNDLE "{}";"#, &captures[1]));
	}

	if let Some(captures) = CREATE_INDEX.captures(command) {
		return Ok(format!(r#"DROP INDEX "{}";"#, &captures[1]));
	}

	if let Some(captures) = ADD_RELATIONSHIP.captures(command) {
		return Ok(format!(
			r#"UPDATE BUNDLE "{}" REMOVE RELATIONSHIP "{}";"#,
			&captures[1], &captures[2],
		));
	}

	if let Some(captures) = UPDATE_BUNDLE_SET.captures(command) {
		let bundle = captures[1].to_owned();

		let mut fields = ADDED_FIELD
			.captures_iter(command)
			.map(|field| field[1].to_owned())
			.collect::<Vec<_>>();

		if fields.is_empty() {
			return Err(Error::new(
				ErrorKind::Migration,
				code::ROLLBACK_NOT_SUPPORTED,
				format!(
					"cannot auto-generate a rollback for a SET without ADD groups: `{}`",
					truncated(command),
				),
			));
		}

		fields.reverse();

		let groups = fields
			.iter()
			.map(|field| format!(r#"{{REMOVE "{field}" = "", "", FALSE, FALSE, NULL}}"#))
			.collect::<Vec<_>>()
			.join(", ");

		return Ok(format!(r#"UPDATE BUNDLE "{bundle}" SET ({groups});"#));
	}

	Err(Error::new(
		ErrorKind::Migration,
		code::ROLLBACK_NOT_SUPPORTED,
		format!("unrecognized command class: `{}`", truncated(command)),
	))
}

/// Names the class of commands that are fundamentally irreversible, if the
/// command belongs to one.
fn unsupported_class(command: &str) -> Option<&'static str>
{
	let normalized = command
		.split_whitespace()
		.collect::<Vec<_>>()
		.join(" ")
		.to_uppercase();

	if normalized.starts_with("DROP BUNDLE") {
		return Some("DROP BUNDLE (the dropped bundle's contents are gone)");
	}

	if normalized.starts_with("DROP INDEX") {
		return Some("DROP INDEX (the index definition is not recorded)");
	}

	if normalized.starts_with("DELETE FROM") || normalized.starts_with("DELETE DOCUMENTS") {
		return Some("DELETE (removed documents cannot be restored)");
	}

	if normalized.starts_with("INSERT INTO") || normalized.starts_with("ADD DOCUMENT") {
		return Some("document inserts (data changes are not schema-reversible)");
	}

	if normalized.starts_with("UPDATE BUNDLE") {
		if normalized.contains("REMOVE RELATIONSHIP") {
			return Some("REMOVE RELATIONSHIP (the relationship definition is not recorded)");
		}

		if normalized.contains("{REMOVE") || normalized.contains("( REMOVE") {
			return Some("field removal (the removed field's definition is not recorded)");
		}

		if normalized.contains("{MODIFY") || normalized.contains("( MODIFY") {
			return Some("field modification (the previous definition is not recorded)");
		}
	}

	None
}

fn truncated(command: &str) -> String
{
	const MAX: usize = 80;

	if command.len() <= MAX {
		return command.to_owned();
	}

	let mut end = MAX;
	while !command.is_char_boundary(end) {
		end -= 1;
	}

	format!("{}…", &command[..end])
}

#[cfg(test)]
mod tests
{
	use super::*;

	fn generate(commands: &[&str]) -> Result<Vec<String>>
	{
		let commands = commands.iter().map(|&cmd| cmd.to_owned()).collect::<Vec<_>>();
		generate_down(&commands)
	}

	#[test]
	fn create_bundle_reverses_to_drop()
	{
		let down = generate(&[r#"CREATE BUNDLE "users" WITH FIELDS ({"name", "STRING"});"#])
			.unwrap();

		assert_eq!(down, vec![r#"DROP BUNDLE "users";"#]);
	}

	#[test]
	fn create_index_variants_reverse_to_drop_index()
	{
		for up in [
			r#"CREATE INDEX "idx_users_name" ON BUNDLE "users" ("name");"#,
			r#"CREATE HASH INDEX "idx_users_name" ON BUNDLE "users" ("name");"#,
			r#"CREATE B-INDEX "idx_users_name" ON BUNDLE "users" ("name");"#,
		] {
			let down = generate(&[up]).unwrap();
			assert_eq!(down, vec![r#"DROP INDEX "idx_users_name";"#], "{up}");
		}
	}

	#[test]
	fn quoting_styles_are_accepted()
	{
		for up in [
			r#"CREATE BUNDLE "users";"#,
			r"CREATE BUNDLE 'users';",
			r"CREATE BUNDLE `users`;",
		] {
			let down = generate(&[up]).unwrap();
			assert_eq!(down, vec![r#"DROP BUNDLE "users";"#], "{up}");
		}
	}

	#[test]
	fn added_fields_are_removed_in_reverse_order()
	{
		let up = r#"UPDATE BUNDLE "users" SET ({ADD "email" = "email", "STRING", TRUE, FALSE, NULL}, {ADD "age" = "age", "INT", FALSE, FALSE, NULL});"#;

		let down = generate(&[up]).unwrap();

		assert_eq!(down, vec![concat!(
			r#"UPDATE BUNDLE "users" SET "#,
			r#"({REMOVE "age" = "", "", FALSE, FALSE, NULL}, "#,
			r#"{REMOVE "email" = "", "", FALSE, FALSE, NULL});"#,
		)]);
	}

	#[test]
	fn add_relationship_reverses_to_remove()
	{
		let up = r#"UPDATE BUNDLE "orders" ADD RELATIONSHIP ("user_orders" TO BUNDLE "users" ON "userId");"#;

		let down = generate(&[up]).unwrap();

		assert_eq!(down, vec![r#"UPDATE BUNDLE "orders" REMOVE RELATIONSHIP "user_orders";"#]);
	}

	#[test]
	fn commands_reverse_in_reverse_order()
	{
		let down = generate(&[
			r#"CREATE BUNDLE "users";"#,
			r#"CREATE INDEX "idx_users" ON BUNDLE "users" ("id");"#,
		])
		.unwrap();

		assert_eq!(down, vec![
			r#"DROP INDEX "idx_users";"#,
			r#"DROP BUNDLE "users";"#,
		]);
	}

	#[test]
	fn unsupported_classes_are_rejected()
	{
		for up in [
			r#"DROP BUNDLE "users";"#,
			r#"DROP INDEX "idx_users";"#,
			r#"UPDATE BUNDLE "users" SET ({REMOVE "email" = "", "", FALSE, FALSE, NULL});"#,
			r#"UPDATE BUNDLE "users" SET ({MODIFY "email" = "email", "STRING", TRUE, FALSE, NULL});"#,
			r#"DELETE FROM "users";"#,
			r#"INSERT INTO "users" VALUES (1);"#,
			r#"UPDATE BUNDLE "orders" REMOVE RELATIONSHIP "user_orders";"#,
		] {
			let err = generate(&[up]).unwrap_err();
			assert_eq!(err.code(), code::ROLLBACK_NOT_SUPPORTED, "{up}");
		}
	}

	#[test]
	fn first_irreversible_command_fails_the_whole_generation()
	{
		let err = generate(&[
			r#"CREATE BUNDLE "users";"#,
			r#"DROP BUNDLE "legacy";"#,
		])
		.unwrap_err();

		assert_eq!(err.code(), code::ROLLBACK_NOT_SUPPORTED);
	}
}
