use crate::ctx::Canceller;
use crate::db::{db_file_path, persist_root, read_root, DbEntry};
use crate::err::Error;
use crate::ipfs::{Backend, Cid};
use crate::republisher::Republisher;
use crate::tree::{Key, Tree};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};

struct UpdateRequest {
	key: Key,
	payload: Option<String>,
	waiter: Option<oneshot::Sender<Result<(), Error>>>,
}

/// The writer role's database.
///
/// Accepts `(key → content hash)` updates, drives the tree's store
/// pipeline, persists the resulting root hash next to the repository and
/// keeps it announced under the backend's mutable name.
///
/// A single worker task drains the update queue; every update queued
/// behind one store+publish pass is answered with that pass's outcome.
#[non_exhaustive]
pub struct InjectorDb<B>
where
	B: Backend,
{
	backend: Arc<B>,
	tree: Arc<Mutex<Tree<B>>>,
	tx: mpsc::UnboundedSender<UpdateRequest>,
	canceller: Canceller,
	ipns: String,
}

impl<B> InjectorDb<B>
where
	B: Backend,
{
	/// Open the injector database stored under `repo`.
	///
	/// Starts from the persisted root hash when a valid one is found, and
	/// announces the database right away, even when it is still empty.
	pub async fn new(backend: Arc<B>, repo: &Path) -> Self {
		let ipns = backend.ipns_id();
		let canceller = Canceller::new();
		let db_file = db_file_path(repo, &ipns);
		let mut tree = Tree::new(backend.clone(), canceller.clone());
		if let Some(root) = read_root(&db_file).await {
			debug!("starting injector from persisted root {root}");
			tree.load(root);
		}
		let tree = Arc::new(Mutex::new(tree));
		let republisher = Republisher::new(backend.clone(), canceller.clone());
		let (tx, rx) = mpsc::unbounded_channel();
		tokio::spawn(Self::run(tree.clone(), republisher, canceller.clone(), db_file, rx));
		let initial = UpdateRequest {
			key: String::new(),
			payload: None,
			waiter: None,
		};
		let _ = tx.send(initial);
		Self {
			backend,
			tree,
			tx,
			canceller,
			ipns,
		}
	}

	/// The mutable name this database is published under
	pub fn ipns(&self) -> &str {
		&self.ipns
	}

	/// Map `key` to the given content hash.
	///
	/// The stored payload wraps the hash with the submission time. An empty
	/// key stores nothing but still drives a store+publish pass, which is
	/// how an empty database gets announced. The returned future does not
	/// borrow the database; once the database is destroyed it resolves to
	/// `Cancelled`.
	pub fn update(&self, key: &str, content: &Cid) -> impl Future<Output = Result<(), Error>> + 'static {
		let tx = self.tx.clone();
		let key = key.to_owned();
		let entry = DbEntry::new(content.clone());
		async move {
			let payload = if key.is_empty() {
				None
			} else {
				Some(entry.encode()?)
			};
			let (waiter, rx) = oneshot::channel();
			let req = UpdateRequest {
				key,
				payload,
				waiter: Some(waiter),
			};
			tx.send(req).map_err(|_| Error::Cancelled)?;
			rx.await.map_err(|_| Error::Cancelled)?
		}
	}

	/// Store `content` in the object store and map `key` to its hash.
	///
	/// This is the end-to-end injection path: the content becomes
	/// addressable on its own, and the database entry points at it. The
	/// hash is returned so callers can hand it out directly.
	pub async fn insert_content(&self, key: &str, content: &[u8]) -> Result<Cid, Error> {
		let cid = self.backend.add(content).await?;
		self.canceller.check()?;
		self.update(key, &cid).await?;
		Ok(cid)
	}

	/// The stored payload under `key`
	pub async fn query(&self, key: &str) -> Result<String, Error> {
		self.canceller.check()?;
		let mut tree = self.tree.lock().await;
		tree.find(key).await?.ok_or(Error::KeyNotFound)
	}

	async fn run(
		tree: Arc<Mutex<Tree<B>>>,
		republisher: Republisher,
		canceller: Canceller,
		db_file: PathBuf,
		mut rx: mpsc::UnboundedReceiver<UpdateRequest>,
	) {
		while let Some(req) = rx.recv().await {
			// Updates arriving while the previous pass was running are all
			// folded into this one and answered together.
			let mut batch = vec![req];
			while let Ok(req) = rx.try_recv() {
				batch.push(req);
			}
			let res = if canceller.is_cancelled() {
				Err(Error::Cancelled)
			} else {
				Self::process(&tree, &republisher, &canceller, &db_file, &batch).await
			};
			match &res {
				Ok(()) => {}
				Err(Error::Cancelled) => {}
				Err(e) => warn!("database update failed: {e}"),
			}
			for req in batch {
				if let Some(w) = req.waiter {
					let _ = w.send(res.clone());
				}
			}
			if canceller.is_cancelled() {
				break;
			}
		}
		rx.close();
		while let Ok(req) = rx.try_recv() {
			if let Some(w) = req.waiter {
				let _ = w.send(Err(Error::Cancelled));
			}
		}
	}

	/// One end-to-end pass: buffer the batch, store the tree, persist the
	/// new root and announce it.
	async fn process(
		tree: &Arc<Mutex<Tree<B>>>,
		republisher: &Republisher,
		canceller: &Canceller,
		db_file: &Path,
		batch: &[UpdateRequest],
	) -> Result<(), Error> {
		let root = {
			let mut tree = tree.lock().await;
			for req in batch {
				if let Some(payload) = &req.payload {
					tree.buffer_insert(req.key.clone(), payload.clone());
				}
			}
			tree.store().await?
		};
		let root = root.ok_or(Error::Unreachable("InjectorDb::process"))?;
		canceller.check()?;
		persist_root(db_file, &root).await?;
		debug!("persisted database root {root}");
		republisher.publish(root).await
	}
}

impl<B> Drop for InjectorDb<B>
where
	B: Backend,
{
	fn drop(&mut self) {
		self.canceller.cancel();
	}
}

#[cfg(test)]
mod tests {
	use super::InjectorDb;
	use crate::db::{db_file_path, DbEntry};
	use crate::err::Error;
	use crate::ipfs::mem::MemoryBackend;
	use crate::ipfs::{Backend, Cid};
	use chrono::{SubsecRound, Utc};
	use futures::future::join_all;
	use std::sync::Arc;
	use temp_dir::TempDir;
	use test_log::test;

	async fn content(backend: &MemoryBackend, data: &[u8]) -> Cid {
		backend.add(data).await.unwrap()
	}

	#[test(tokio::test)]
	async fn updates_are_stored_and_published() {
		let backend = Arc::new(MemoryBackend::new());
		let repo = TempDir::new().unwrap();
		let db = InjectorDb::new(backend.clone(), repo.path()).await;
		let cid = content(&backend, b"the content").await;
		db.update("http://example.com/", &cid).await.unwrap();
		// The payload wraps the content hash.
		let payload = db.query("http://example.com/").await.unwrap();
		let entry = DbEntry::decode(&payload).unwrap();
		assert_eq!(entry.value, cid);
		// The new root is resolvable under the database's name.
		let root = backend.resolve(db.ipns()).await.unwrap();
		let persisted = tokio::fs::read_to_string(db_file_path(repo.path(), db.ipns()))
			.await
			.unwrap();
		assert_eq!(persisted, root.as_str());
	}

	#[test(tokio::test)]
	async fn insert_content_stores_and_maps_in_one_step() {
		let backend = Arc::new(MemoryBackend::new());
		let repo = TempDir::new().unwrap();
		let db = InjectorDb::new(backend.clone(), repo.path()).await;
		let cid = db.insert_content("page", b"some page bytes").await.unwrap();
		assert_eq!(backend.cat(&cid).await.unwrap(), b"some page bytes");
		let entry = DbEntry::decode(&db.query("page").await.unwrap()).unwrap();
		assert_eq!(entry.value, cid);
	}

	#[test(tokio::test)]
	async fn missing_keys_are_not_found() {
		let backend = Arc::new(MemoryBackend::new());
		let repo = TempDir::new().unwrap();
		let db = InjectorDb::new(backend, repo.path()).await;
		assert!(matches!(db.query("nope").await, Err(Error::KeyNotFound)));
	}

	#[test(tokio::test)]
	async fn an_empty_database_is_announced() {
		let backend = Arc::new(MemoryBackend::new());
		let repo = TempDir::new().unwrap();
		let db = InjectorDb::new(backend.clone(), repo.path()).await;
		let cid = content(&backend, b"ignored").await;
		// An empty key stores nothing but drives the pipeline.
		db.update("", &cid).await.unwrap();
		let root = backend.resolve(db.ipns()).await.unwrap();
		assert_eq!(backend.cat(&root).await.unwrap(), b"{}");
	}

	#[test(tokio::test)]
	async fn concurrent_updates_share_one_pass() {
		let backend = Arc::new(MemoryBackend::new());
		let repo = TempDir::new().unwrap();
		let db = InjectorDb::new(backend.clone(), repo.path()).await;
		let mut futures = Vec::new();
		for key in ["a", "b", "c"] {
			let cid = content(&backend, key.as_bytes()).await;
			futures.push(db.update(key, &cid));
		}
		for res in join_all(futures).await {
			res.unwrap();
		}
		for key in ["a", "b", "c"] {
			assert!(db.query(key).await.is_ok());
		}
	}

	#[test(tokio::test)]
	async fn restarts_resume_from_the_persisted_root() {
		let backend = Arc::new(MemoryBackend::new());
		let repo = TempDir::new().unwrap();
		let cid = content(&backend, b"kept bytes").await;
		{
			let db = InjectorDb::new(backend.clone(), repo.path()).await;
			db.update("kept", &cid).await.unwrap();
		}
		let db = InjectorDb::new(backend, repo.path()).await;
		let entry = DbEntry::decode(&db.query("kept").await.unwrap()).unwrap();
		assert_eq!(entry.value, cid);
	}

	#[test(tokio::test)]
	async fn destruction_cancels_pending_updates() {
		let backend = Arc::new(MemoryBackend::new());
		let repo = TempDir::new().unwrap();
		let db = InjectorDb::new(backend.clone(), repo.path()).await;
		let cid = content(&backend, b"settled").await;
		db.update("settled", &cid).await.unwrap();
		let publishes = backend.publish_count();
		let db_file = db_file_path(repo.path(), db.ipns());
		let persisted = tokio::fs::read_to_string(&db_file).await.unwrap();
		// Queue an update and destroy the database before it is processed.
		let pending = db.update("late", &cid);
		drop(db);
		assert!(matches!(pending.await, Err(Error::Cancelled)));
		// Nothing was announced or persisted after the destruction.
		assert_eq!(backend.publish_count(), publishes);
		assert_eq!(tokio::fs::read_to_string(&db_file).await.unwrap(), persisted);
	}

	#[test(tokio::test)]
	async fn payload_timestamps_track_submission_time() {
		let backend = Arc::new(MemoryBackend::new());
		let repo = TempDir::new().unwrap();
		let db = InjectorDb::new(backend.clone(), repo.path()).await;
		let cid = content(&backend, b"timed").await;
		let before = Utc::now().trunc_subsecs(6);
		db.update("u", &cid).await.unwrap();
		let entry = DbEntry::decode(&db.query("u").await.unwrap()).unwrap();
		let age = entry.ts - before;
		assert!(age >= chrono::Duration::zero());
		assert!(age < chrono::Duration::seconds(1));
	}
}
