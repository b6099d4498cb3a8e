//! In-memory document store with optional JSON snapshot persistence.
//!
//! Every operation runs under one lock, which makes the atomic primitives of
//! [`DocumentStore`] trivially atomic. With a snapshot path, the full state is rewritten (temp file
//! plus rename) after each mutation.

use super::store::*;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};

type Collections = BTreeMap<String, BTreeMap<String, Document>>;

#[derive(Default)]
pub struct MemoryStore {
	collections: Mutex<Collections>,
	snapshot_path: Option<PathBuf>,
	pending_failures: AtomicU32,
	next_id: AtomicU64,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Open a store persisted at `path`, loading the existing snapshot if there is one.
	pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
		let path = path.into();
		let collections = if tokio::fs::try_exists(&path).await? {
			let bytes = tokio::fs::read(&path).await?;
			let collections: Collections = serde_json::from_slice(&bytes)?;
			info!(
				"Loaded document snapshot from {:?} ({} collections)",
				path,
				collections.len()
			);
			collections
		} else {
			Collections::new()
		};

		Ok(Self {
			collections: Mutex::new(collections),
			snapshot_path: Some(path),
			..Self::default()
		})
	}

	/// Make the next `count` mutations fail with [`StoreError::Unavailable`].
	///
	/// Used to exercise the retry and abort paths without a real outage.
	pub fn fail_next_writes(&self, count: u32) {
		self.pending_failures.store(count, Ordering::SeqCst);
	}

	/// All documents of a collection, ordered by id.
	pub async fn documents(&self, collection: Collection) -> Vec<(String, Document)> {
		self.collections
			.lock()
			.await
			.get(collection.as_str())
			.map(|docs| docs.iter().map(|(id, doc)| (id.clone(), doc.clone())).collect())
			.unwrap_or_default()
	}

	pub async fn count(&self, collection: Collection) -> usize {
		self.collections
			.lock()
			.await
			.get(collection.as_str())
			.map_or(0, BTreeMap::len)
	}

	fn check_injected_failure(&self) -> Result<(), StoreError> {
		let injected = self
			.pending_failures
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
			.is_ok();
		if injected {
			return Err(StoreError::Unavailable("injected write failure".to_string()));
		}
		Ok(())
	}

	async fn persist(&self, collections: &Collections) -> Result<(), StoreError> {
		let Some(path) = &self.snapshot_path else {
			return Ok(());
		};
		write_snapshot(path, collections).await
	}

	fn generate_id(&self) -> String {
		let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
		let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
		format!("{:016x}{:04x}", nanos, seq & 0xffff)
	}
}

async fn write_snapshot(path: &Path, collections: &Collections) -> Result<(), StoreError> {
	if let Some(parent) = path.parent() {
		if !parent.as_os_str().is_empty() {
			tokio::fs::create_dir_all(parent).await?;
		}
	}
	let bytes = serde_json::to_vec_pretty(collections)?;
	let tmp = path.with_extension("tmp");
	tokio::fs::write(&tmp, &bytes).await?;
	tokio::fs::rename(&tmp, path).await?;
	debug!("Wrote document snapshot to {:?}", path);
	Ok(())
}

fn lookup<'a>(collections: &'a Collections, collection: Collection, id: &str) -> Option<&'a Document> {
	collections.get(collection.as_str()).and_then(|docs| docs.get(id))
}

fn store_doc(collections: &mut Collections, collection: Collection, id: &str, doc: Document) {
	collections
		.entry(collection.as_str().to_string())
		.or_default()
		.insert(id.to_string(), doc);
}

fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
	let mut segments = path.split('.');
	let first = segments.next()?;
	segments.try_fold(doc.get(first)?, |value, segment| value.get(segment))
}

fn set_path(
	doc: &mut Document,
	path: &str,
	value: Value,
	collection: Collection,
	id: &str,
) -> Result<(), StoreError> {
	let not_a_map = || StoreError::NotAMap {
		collection,
		id: id.to_string(),
		field: path.to_string(),
	};

	let (parents, leaf) = match path.rsplit_once('.') {
		Some((parents, leaf)) => (Some(parents), leaf),
		None => (None, path),
	};

	let mut target = doc;
	if let Some(parents) = parents {
		for segment in parents.split('.') {
			let entry = target
				.entry(segment.to_string())
				.or_insert_with(|| Value::Object(Document::new()));
			target = entry.as_object_mut().ok_or_else(not_a_map)?;
		}
	}
	target.insert(leaf.to_string(), value);
	Ok(())
}

fn merge_into(target: &mut Document, source: Document) {
	for (key, value) in source {
		match (target.get_mut(&key), value) {
			(Some(Value::Object(existing)), Value::Object(incoming)) => merge_into(existing, incoming),
			(_, value) => {
				target.insert(key, value);
			}
		}
	}
}

fn increment_path(
	doc: &mut Document,
	path: &str,
	delta: i128,
	repr: Option<NumericRepr>,
	collection: Collection,
	id: &str,
) -> Result<(), StoreError> {
	let not_numeric = || StoreError::NotNumeric {
		collection,
		id: id.to_string(),
		field: path.to_string(),
	};

	let (current, existing_repr) = match get_path(doc, path) {
		None | Some(Value::Null) => (0i128, None),
		Some(Value::Number(n)) => {
			let current = n
				.as_i64()
				.map(i128::from)
				.or_else(|| n.as_u64().map(i128::from))
				.ok_or_else(not_numeric)?;
			(current, Some(NumericRepr::Integer))
		}
		Some(Value::String(s)) => (
			s.parse::<i128>().map_err(|_| not_numeric())?,
			Some(NumericRepr::DecimalString),
		),
		Some(_) => return Err(not_numeric()),
	};

	let updated = current.checked_add(delta).ok_or_else(|| StoreError::Overflow {
		collection,
		id: id.to_string(),
		field: path.to_string(),
	})?;

	// An existing field keeps its representation
	let repr = existing_repr.or(repr).unwrap_or(NumericRepr::Integer);
	let value = match repr {
		NumericRepr::Integer => i64::try_from(updated)
			.map(Value::from)
			.or_else(|_| u64::try_from(updated).map(Value::from))
			.unwrap_or_else(|_| Value::String(updated.to_string())),
		NumericRepr::DecimalString => Value::String(updated.to_string()),
	};

	set_path(doc, path, value, collection, id)
}

#[async_trait]
impl DocumentStore for MemoryStore {
	async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError> {
		let collections = self.collections.lock().await;
		Ok(lookup(&collections, collection, id).cloned())
	}

	async fn set(
		&self,
		collection: Collection,
		id: &str,
		data: Document,
		options: SetOptions,
	) -> Result<(), StoreError> {
		self.check_injected_failure()?;
		let mut collections = self.collections.lock().await;

		let doc = match lookup(&collections, collection, id) {
			Some(existing) if options.merge => {
				let mut merged = existing.clone();
				merge_into(&mut merged, data);
				merged
			}
			_ => data,
		};
		store_doc(&mut collections, collection, id, doc);
		self.persist(&collections).await
	}

	async fn update(
		&self,
		collection: Collection,
		id: &str,
		fields: Document,
	) -> Result<(), StoreError> {
		self.check_injected_failure()?;
		let mut collections = self.collections.lock().await;

		let mut doc = lookup(&collections, collection, id)
			.cloned()
			.ok_or_else(|| StoreError::NotFound {
				collection,
				id: id.to_string(),
			})?;
		for (path, value) in fields {
			set_path(&mut doc, &path, value, collection, id)?;
		}
		store_doc(&mut collections, collection, id, doc);
		self.persist(&collections).await
	}

	async fn atomic_increment(
		&self,
		collection: Collection,
		id: &str,
		field: &str,
		delta: i128,
	) -> Result<(), StoreError> {
		self.check_injected_failure()?;
		let mut collections = self.collections.lock().await;

		let mut doc = lookup(&collections, collection, id).cloned().unwrap_or_default();
		increment_path(&mut doc, field, delta, None, collection, id)?;
		store_doc(&mut collections, collection, id, doc);
		self.persist(&collections).await
	}

	async fn add(&self, collection: Collection, data: Document) -> Result<String, StoreError> {
		self.check_injected_failure()?;
		let mut collections = self.collections.lock().await;

		let id = self.generate_id();
		store_doc(&mut collections, collection, &id, data);
		self.persist(&collections).await?;
		Ok(id)
	}

	async fn insert_once(
		&self,
		collection: Collection,
		id: &str,
		data: Document,
		increments: &[FieldIncrement],
	) -> Result<bool, StoreError> {
		self.check_injected_failure()?;
		let mut collections = self.collections.lock().await;

		if lookup(&collections, collection, id).is_some() {
			return Ok(false);
		}

		// Stage every touched document so a failing increment writes nothing
		let mut staged: Vec<(Collection, String, Document)> = vec![(collection, id.to_string(), data)];
		for increment in increments {
			let position = staged
				.iter()
				.position(|(c, i, _)| *c == increment.collection && *i == increment.id);
			let index = match position {
				Some(index) => index,
				None => {
					let doc = lookup(&collections, increment.collection, &increment.id)
						.cloned()
						.unwrap_or_default();
					staged.push((increment.collection, increment.id.clone(), doc));
					staged.len() - 1
				}
			};
			let (_, _, doc) = &mut staged[index];
			increment_path(
				doc,
				&increment.field,
				increment.delta,
				Some(increment.repr),
				increment.collection,
				&increment.id,
			)?;
		}

		for (staged_collection, staged_id, doc) in staged {
			store_doc(&mut collections, staged_collection, &staged_id, doc);
		}
		self.persist(&collections).await?;
		Ok(true)
	}

	async fn init_fields(
		&self,
		collection: Collection,
		id: &str,
		defaults: Document,
	) -> Result<(), StoreError> {
		self.check_injected_failure()?;
		let mut collections = self.collections.lock().await;

		let mut doc = lookup(&collections, collection, id).cloned().unwrap_or_default();
		for (path, value) in defaults {
			if matches!(get_path(&doc, &path), None | Some(Value::Null)) {
				set_path(&mut doc, &path, value, collection, id)?;
			}
		}
		store_doc(&mut collections, collection, id, doc);
		self.persist(&collections).await
	}
}
