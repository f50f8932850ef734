//! Schema snapshots and query validation.
//!
//! The [`SchemaValidator`] keeps one TTL-cached [`SchemaSnapshot`] fetched
//! through the client's query path (`SHOW BUNDLES;`). DDL flowing through
//! the command pipeline invalidates the cache. Builder validation checks
//! that target bundles and named fields exist; dotted field names (e.g.
//! `Author.Name`) bypass the field check in SELECT WHERE clauses, since they
//! traverse relationships the flat snapshot does not model.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::query::{DeleteBuilder, InsertBuilder, SelectBuilder, UpdateBuilder};
use crate::wire::ServerResponse;

/// One field of a bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FieldSchema
{
	pub name: String,

	#[serde(rename = "type")]
	pub field_type: String,

	pub required: bool,
	pub unique: bool,
	pub default_value: Option<JsonValue>,
	pub related_bundle: Option<String>,
}

/// One relationship of a bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RelationshipSchema
{
	pub name: String,
	pub related_bundle: String,
}

/// One bundle (collection) definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BundleSchema
{
	pub name: String,
	pub fields: Vec<FieldSchema>,
	pub indexes: Vec<String>,
	pub relationships: Vec<RelationshipSchema>,
}

impl BundleSchema
{
	pub fn field(&self, name: &str) -> Option<&FieldSchema>
	{
		self.fields.iter().find(|field| field.name == name)
	}
}

/// The database schema as last observed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchemaSnapshot
{
	pub bundles: Vec<BundleSchema>,
}

impl SchemaSnapshot
{
	pub fn bundle(&self, name: &str) -> Option<&BundleSchema>
	{
		self.bundles.iter().find(|bundle| bundle.name == name)
	}

	/// Parses the payload of a `SHOW BUNDLES;` response. Accepts either a
	/// `{"bundles": […]}` object or a bare array of bundles.
	pub fn from_response(response: &ServerResponse) -> Result<Self>
	{
		let Some(ref data) = response.data else {
			return Ok(Self::default());
		};

		let parsed = match data {
			JsonValue::Array(_) => {
				serde_json::from_value::<Vec<BundleSchema>>(data.clone()).map(|bundles| {
					Self { bundles }
				})
			},
			_ => serde_json::from_value::<Self>(data.clone()),
		};

		parsed.map_err(|err| {
			Error::protocol("failed to parse schema snapshot").with_source(err)
		})
	}
}

struct CachedSchema
{
	snapshot: Arc<SchemaSnapshot>,
	fetched_at: Instant,
}

/// TTL-cached schema access and builder validation.
pub struct SchemaValidator
{
	cache: RwLock<Option<CachedSchema>>,
	ttl: Duration,
}

impl std::fmt::Debug for SchemaValidator
{
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		fmt.debug_struct("SchemaValidator").field("ttl", &self.ttl).finish_non_exhaustive()
	}
}

impl SchemaValidator
{
	pub fn new(ttl: Duration) -> Self
	{
		Self { cache: RwLock::new(None), ttl }
	}

	/// Returns the cached snapshot, refreshing through `fetch` when absent
	/// or older than the TTL.
	pub async fn get_schema<F, Fut>(&self, fetch: F) -> Result<Arc<SchemaSnapshot>>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<SchemaSnapshot>>,
	{
		{
			let cache = self.cache.read().await;

			if let Some(ref cached) = *cache {
				if cached.fetched_at.elapsed() <= self.ttl {
					return Ok(Arc::clone(&cached.snapshot));
				}
			}
		}

		let mut cache = self.cache.write().await;

		// Another task may have refreshed while we waited for the lock.
		if let Some(ref cached) = *cache {
			if cached.fetched_at.elapsed() <= self.ttl {
				return Ok(Arc::clone(&cached.snapshot));
			}
		}

		let snapshot = Arc::new(fetch().await?);

		*cache = Some(CachedSchema {
			snapshot: Arc::clone(&snapshot),
			fetched_at: Instant::now(),
		});

		tracing::debug!(bundles = snapshot.bundles.len(), "schema snapshot refreshed");
		Ok(snapshot)
	}

	/// Returns the cached snapshot without refreshing, if one is fresh.
	pub async fn cached(&self) -> Option<Arc<SchemaSnapshot>>
	{
		let cache = self.cache.read().await;

		cache.as_ref().and_then(|cached| {
			(cached.fetched_at.elapsed() <= self.ttl).then(|| Arc::clone(&cached.snapshot))
		})
	}

	/// Drops the cached snapshot so the next access forces a refresh.
	pub async fn invalidate(&self)
	{
		let mut cache = self.cache.write().await;

		if cache.take().is_some() {
			tracing::debug!("schema cache invalidated");
		}
	}

	pub fn validate_select(snapshot: &SchemaSnapshot, builder: &SelectBuilder) -> Result<()>
	{
		let bundle = require_bundle(snapshot, builder.bundle())?;

		for field in builder.projected_fields() {
			if field != "*" {
				require_field(bundle, field)?;
			}
		}

		for field in builder.where_fields() {
			// Dotted names traverse relationships; existence is checked
			// server-side.
			if !field.contains('.') {
				require_field(bundle, field)?;
			}
		}

		for field in builder.order_fields() {
			if !field.contains('.') {
				require_field(bundle, field)?;
			}
		}

		Ok(())
	}

	pub fn validate_insert(snapshot: &SchemaSnapshot, builder: &InsertBuilder) -> Result<()>
	{
		let bundle = require_bundle(snapshot, builder.bundle())?;

		for field in builder.field_names() {
			require_field(bundle, field)?;
		}

		Ok(())
	}

	pub fn validate_update(snapshot: &SchemaSnapshot, builder: &UpdateBuilder) -> Result<()>
	{
		let bundle = require_bundle(snapshot, builder.bundle())?;

		for field in builder.assigned_fields() {
			require_field(bundle, field)?;
		}

		for field in builder.where_fields() {
			require_field(bundle, field)?;
		}

		Ok(())
	}

	pub fn validate_delete(snapshot: &SchemaSnapshot, builder: &DeleteBuilder) -> Result<()>
	{
		let bundle = require_bundle(snapshot, builder.bundle())?;

		for field in builder.where_fields() {
			require_field(bundle, field)?;
		}

		Ok(())
	}
}

fn require_bundle<'s>(snapshot: &'s SchemaSnapshot, name: &str) -> Result<&'s BundleSchema>
{
	snapshot.bundle(name).ok_or_else(|| {
		Error::invalid_query(format!("bundle `{name}` does not exist"))
			.with_detail("bundle", name)
	})
}

fn require_field<'b>(bundle: &'b BundleSchema, name: &str) -> Result<&'b FieldSchema>
{
	bundle.field(name).ok_or_else(|| {
		Error::invalid_query(format!(
			"field `{name}` does not exist in bundle `{}`",
			bundle.name,
		))
		.with_detail("bundle", &bundle.name)
		.with_detail("field", name)
	})
}
