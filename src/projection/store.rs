//! Document store contract.
//!
//! Besides plain reads and writes, the store must provide three atomic primitives the projection
//! relies on: [`DocumentStore::atomic_increment`], [`DocumentStore::insert_once`] and
//! [`DocumentStore::init_fields`]. Implementations must never emulate them with an unguarded
//! read-modify-write.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A schemaless document. Keys passed to `update`, `atomic_increment` and `init_fields` may be
/// dotted paths into nested maps (`stats.vendorCount`).
pub type Document = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
	Disasters,
	Transactions,
	Users,
	Vendors,
	Donations,
}

impl Collection {
	pub fn as_str(&self) -> &'static str {
		match self {
			Collection::Disasters => "disasters",
			Collection::Transactions => "transactions",
			Collection::Users => "users",
			Collection::Vendors => "vendors",
			Collection::Donations => "donations",
		}
	}
}

impl fmt::Display for Collection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
	/// Deep-merge into an existing document instead of replacing it.
	pub merge: bool,
}

impl SetOptions {
	pub fn merge() -> Self {
		Self { merge: true }
	}

	pub fn overwrite() -> Self {
		Self { merge: false }
	}
}

/// How an incremented field is written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericRepr {
	/// JSON integer, for counters.
	Integer,
	/// Decimal string, for token amounts that may exceed 64 bits.
	DecimalString,
}

/// An increment applied by [`DocumentStore::insert_once`] when the document is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIncrement {
	pub collection: Collection,
	pub id: String,
	pub field: String,
	pub delta: i128,
	pub repr: NumericRepr,
}

impl FieldIncrement {
	pub fn counter(collection: Collection, id: &str, field: &str, delta: i128) -> Self {
		Self {
			collection,
			id: id.to_string(),
			field: field.to_string(),
			delta,
			repr: NumericRepr::Integer,
		}
	}

	pub fn amount(collection: Collection, id: &str, field: &str, delta: i128) -> Self {
		Self {
			repr: NumericRepr::DecimalString,
			..Self::counter(collection, id, field, delta)
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("document {collection}/{id} not found")]
	NotFound { collection: Collection, id: String },

	#[error("field {field} of {collection}/{id} is not numeric")]
	NotNumeric {
		collection: Collection,
		id: String,
		field: String,
	},

	#[error("field {field} of {collection}/{id} is not a map")]
	NotAMap {
		collection: Collection,
		id: String,
		field: String,
	},

	#[error("increment of {field} on {collection}/{id} overflows")]
	Overflow {
		collection: Collection,
		id: String,
		field: String,
	},

	#[error("store unavailable: {0}")]
	Unavailable(String),

	#[error("snapshot I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("document encoding error: {0}")]
	Encoding(#[from] serde_json::Error),
}

impl crate::utils::Transient for StoreError {
	fn is_transient(&self) -> bool {
		matches!(self, StoreError::Unavailable(_) | StoreError::Io(_))
	}
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
	async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError>;

	/// Create or replace a document; with `merge` nested maps are merged key by key.
	async fn set(
		&self,
		collection: Collection,
		id: &str,
		data: Document,
		options: SetOptions,
	) -> Result<(), StoreError>;

	/// Set fields of an existing document. Fails with `NotFound` if it does not exist.
	async fn update(
		&self,
		collection: Collection,
		id: &str,
		fields: Document,
	) -> Result<(), StoreError>;

	/// Atomically add `delta` to a numeric field, creating the document and field when absent.
	async fn atomic_increment(
		&self,
		collection: Collection,
		id: &str,
		field: &str,
		delta: i128,
	) -> Result<(), StoreError>;

	/// Store a document under a generated id and return the id.
	async fn add(&self, collection: Collection, data: Document) -> Result<String, StoreError>;

	/// Atomically create `collection/id` if it does not exist and, only in that case, apply
	/// `increments` in the same write. Returns whether the document was created.
	async fn insert_once(
		&self,
		collection: Collection,
		id: &str,
		data: Document,
		increments: &[FieldIncrement],
	) -> Result<bool, StoreError>;

	/// Atomically set each of `defaults` only where the field is absent, creating the document
	/// when needed.
	async fn init_fields(
		&self,
		collection: Collection,
		id: &str,
		defaults: Document,
	) -> Result<(), StoreError>;
}

/// Serialize a typed document into its stored form.
pub fn to_document<T: Serialize>(value: &T) -> Result<Document, StoreError> {
	match serde_json::to_value(value)? {
		Value::Object(map) => Ok(map),
		other => Err(StoreError::Encoding(serde::ser::Error::custom(format!(
			"expected a map, got {}",
			other
		)))),
	}
}
