use crate::cnf::CLIENT_REFRESH_SECS;
use crate::ctx::Canceller;
use crate::db::{db_file_path, persist_root, read_root, CachedContent, DbEntry};
use crate::err::Error;
use crate::ipfs::{Backend, Cid};
use crate::tree::Tree;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// The reader role's database.
///
/// Follows the injector's mutable name: a background task periodically
/// re-resolves it, swaps the local tree onto any new root and persists the
/// hash so a restart starts from the last observed head. Reads descend the
/// shared tree and fetch the cached content behind the stored payload.
#[non_exhaustive]
pub struct ClientDb<B>
where
	B: Backend,
{
	backend: Arc<B>,
	tree: Arc<Mutex<Tree<B>>>,
	canceller: Canceller,
	ipns: String,
	updates: watch::Receiver<u64>,
}

impl<B> ClientDb<B>
where
	B: Backend,
{
	/// Open a client database stored under `repo`, following `ipns`.
	pub async fn new(backend: Arc<B>, repo: &Path, ipns: String) -> Self {
		let canceller = Canceller::new();
		let db_file = db_file_path(repo, &ipns);
		let mut tree = Tree::new(backend.clone(), canceller.clone());
		let mut last = None;
		if let Some(root) = read_root(&db_file).await {
			debug!("starting client from persisted root {root}");
			tree.load(root.clone());
			last = Some(root);
		}
		let tree = Arc::new(Mutex::new(tree));
		let (tx, updates) = watch::channel(0u64);
		tokio::spawn(Self::run(
			backend.clone(),
			tree.clone(),
			canceller.clone(),
			ipns.clone(),
			db_file,
			last,
			tx,
		));
		Self {
			backend,
			tree,
			canceller,
			ipns,
			updates,
		}
	}

	/// The mutable name this database follows
	pub fn ipns(&self) -> &str {
		&self.ipns
	}

	/// The content previously stored by the injector under `url`.
	pub async fn get_content(&self, url: &str) -> Result<CachedContent, Error> {
		let payload = {
			let mut tree = self.tree.lock().await;
			tree.find(url).await?
		};
		let payload = payload.ok_or(Error::KeyNotFound)?;
		let entry = DbEntry::decode(&payload)?;
		let data = self.backend.cat(&entry.value).await?;
		self.canceller.check()?;
		Ok(CachedContent {
			ts: entry.ts,
			data,
		})
	}

	/// The stored payload under `key`, without fetching the content
	pub async fn query(&self, key: &str) -> Result<String, Error> {
		self.canceller.check()?;
		let mut tree = self.tree.lock().await;
		tree.find(key).await?.ok_or(Error::KeyNotFound)
	}

	/// Wait for the next successful refresh of the database view.
	///
	/// The returned future does not borrow the database; it resolves to
	/// `Cancelled` when the database is destroyed while waiting.
	pub fn wait_for_db_update(&self) -> impl Future<Output = Result<(), Error>> + 'static {
		let mut updates = self.updates.clone();
		let canceller = self.canceller.clone();
		async move {
			// Refreshes which happened before this call do not count.
			updates.borrow_and_update();
			updates.changed().await.map_err(|_| Error::Cancelled)?;
			canceller.check()
		}
	}

	async fn run(
		backend: Arc<B>,
		tree: Arc<Mutex<Tree<B>>>,
		canceller: Canceller,
		ipns: String,
		db_file: PathBuf,
		mut last: Option<Cid>,
		updates: watch::Sender<u64>,
	) {
		let refresh = Duration::from_secs(*CLIENT_REFRESH_SECS);
		loop {
			if canceller.is_cancelled() {
				break;
			}
			match backend.resolve(&ipns).await {
				// Resolution failures are never fatal; try again shortly.
				Err(e) => trace!("could not resolve {ipns}: {e}"),
				Ok(root) => {
					if canceller.is_cancelled() {
						break;
					}
					if last.as_ref() != Some(&root) {
						debug!("database head changed to {root}");
						tree.lock().await.load(root.clone());
						if let Err(e) = persist_root(&db_file, &root).await {
							warn!("could not persist the database root: {e}");
						}
						last = Some(root);
					}
					updates.send_modify(|n| *n += 1);
				}
			}
			tokio::select! {
				_ = tokio::time::sleep(refresh) => {}
				_ = updates.closed() => break,
			}
		}
	}
}

impl<B> Drop for ClientDb<B>
where
	B: Backend,
{
	fn drop(&mut self) {
		self.canceller.cancel();
	}
}
