//! A Merkle B-tree persisted in a content-addressed object store.
//!
//! Every node serializes to a single stored block and references its
//! children by hash, so the root hash identifies the whole directory.
//! Nodes are inflated lazily while descending, inserts are buffered and
//! applied in batches, and a store pass serializes dirty subtrees bottom-up
//! before swapping the root hash.

pub(crate) mod node;

use crate::cnf::DEFAULT_MAX_NODE_SIZE;
use crate::ctx::Canceller;
use crate::err::Error;
use crate::ipfs::{Backend, Cid};
use crate::tree::node::{Entry, Node, NodeKey};
use async_recursion::async_recursion;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

pub type Key = String;
pub type Value = String;

#[non_exhaustive]
pub struct Tree<B>
where
	B: Backend,
{
	backend: Arc<B>,
	canceller: Canceller,
	max_node_size: usize,
	root_hash: Option<Cid>,
	root: Option<Node>,
	insert_buffer: BTreeMap<Key, Value>,
	storing: bool,
}

impl<B> Tree<B>
where
	B: Backend,
{
	pub fn new(backend: Arc<B>, canceller: Canceller) -> Self {
		Self::with_max_node_size(backend, canceller, *DEFAULT_MAX_NODE_SIZE)
	}

	pub fn with_max_node_size(backend: Arc<B>, canceller: Canceller, max_node_size: usize) -> Self {
		Self {
			backend,
			canceller,
			max_node_size,
			root_hash: None,
			root: None,
			insert_buffer: BTreeMap::new(),
			storing: false,
		}
	}

	/// The hash of the last stored root, if any
	pub fn root_hash(&self) -> Option<&Cid> {
		self.root_hash.as_ref()
	}

	/// Bind this tree to an already stored root.
	///
	/// Replacing the root identity discards any buffered inserts and every
	/// materialized node; reads re-inflate nodes on demand. No object-store
	/// traffic is issued here.
	pub fn load(&mut self, hash: Cid) {
		self.insert_buffer.clear();
		self.root = None;
		self.root_hash = Some(hash);
	}

	/// Look up a key.
	///
	/// A value still sitting in the insert buffer shadows whatever the
	/// stored tree holds. Nodes along the descent path are inflated from
	/// the store as needed and stay cached in memory.
	pub async fn find(&mut self, key: &str) -> Result<Option<Value>, Error> {
		if let Some(v) = self.insert_buffer.get(key) {
			return Ok(Some(v.clone()));
		}
		if self.root.is_none() {
			let Some(hash) = self.root_hash.clone() else {
				return Ok(None);
			};
			let root = Self::fetch_node(&self.backend, &self.canceller, &hash).await?;
			self.root = Some(root);
		}
		let root = self.root.as_mut().ok_or(Error::Unreachable("Tree::find"))?;
		Self::find_in(&self.backend, &self.canceller, root, key).await
	}

	/// Insert a key→value mapping.
	///
	/// The entry lands in the insert buffer; when no store pass is in
	/// flight this immediately drives one, so a successful return means
	/// the entry is serialized in the object store.
	pub async fn insert(&mut self, key: Key, value: Value) -> Result<(), Error> {
		self.insert_buffer.insert(key, value);
		// A pass already in flight picks the entry up from the buffer.
		if self.storing {
			return Ok(());
		}
		self.store().await.map(|_| ())
	}

	/// Queue an entry without driving a store pass.
	pub(crate) fn buffer_insert(&mut self, key: Key, value: Value) {
		self.insert_buffer.insert(key, value);
	}

	/// Run the store loop until the tree is clean.
	///
	/// Each round drains the buffer, applies the batch in key order, then
	/// serializes dirty subtrees bottom-up (`add` + `pin` per node), unpins
	/// the replaced root and records the new root hash. A fresh database
	/// serializes an empty root so it can be announced before the first
	/// entry arrives. Returns the current root hash.
	pub async fn store(&mut self) -> Result<Option<Cid>, Error> {
		if self.storing {
			return Ok(self.root_hash.clone());
		}
		self.storing = true;
		let res = self.store_loop().await;
		self.storing = false;
		res.map(|_| self.root_hash.clone())
	}

	async fn store_loop(&mut self) -> Result<(), Error> {
		loop {
			if self.insert_buffer.is_empty() && self.root_hash.is_some() {
				return Ok(());
			}
			let pending = self.insert_buffer.len();
			if pending > 0 {
				debug!("storing {pending} buffered entries");
			}
			// Key order keeps the worst-case split cascade shallow. Entries
			// leave the buffer one by one so that a failure mid-pass keeps
			// whatever was not applied yet for the next attempt.
			while let Some((key, value)) = self.insert_buffer.pop_first() {
				self.apply(key, value).await?;
			}
			let root = self.root.get_or_insert_with(Node::default);
			let new_hash = Self::commit(&self.backend, &self.canceller, root).await?;
			if let Some(old) = &self.root_hash {
				if *old != new_hash {
					self.backend.unpin(old).await?;
					self.canceller.check()?;
				}
			}
			trace!("stored database root {new_hash}");
			self.root_hash = Some(new_hash);
		}
	}

	/// The number of tree nodes currently held in memory
	pub fn local_node_count(&self) -> usize {
		self.root.as_ref().map(|r| r.local_count()).unwrap_or(0)
	}

	#[cfg(debug_assertions)]
	pub fn check_invariants(&self) -> bool {
		self.root.as_ref().map_or(true, |r| r.check_invariants(self.max_node_size))
	}

	/// Structurally insert one entry, materializing the root first.
	async fn apply(&mut self, key: Key, value: Value) -> Result<(), Error> {
		if self.root.is_none() {
			match self.root_hash.clone() {
				Some(hash) => {
					let root = Self::fetch_node(&self.backend, &self.canceller, &hash).await?;
					self.root = Some(root);
				}
				None => self.root = Some(Node::default()),
			}
		}
		let max = self.max_node_size;
		let root = self.root.as_mut().ok_or(Error::Unreachable("Tree::apply"))?;
		if let Some(promoted) =
			Self::insert_in(&self.backend, &self.canceller, root, key, value, max).await?
		{
			// The root itself split; the synthetic node takes its place.
			*root = promoted;
		}
		self.root_hash = None;
		#[cfg(debug_assertions)]
		debug_assert!(self.check_invariants());
		Ok(())
	}

	/// Recursive descent for a lookup.
	///
	/// Inflating a child on the way down keeps its stored hash, so the
	/// node stays clean; only inserts dirty the tree.
	#[async_recursion]
	async fn find_in(
		backend: &B,
		canceller: &Canceller,
		node: &mut Node,
		key: &str,
	) -> Result<Option<Value>, Error> {
		let Some(id) = node.lower_bound(key) else {
			return Ok(None);
		};
		if id.as_key() == Some(key) {
			let e = node.entries.get(&id).ok_or(Error::Unreachable("Tree::find_in"))?;
			return Ok(e.value.clone());
		}
		let entry = node.entries.get_mut(&id).ok_or(Error::Unreachable("Tree::find_in"))?;
		if entry.child_node.is_none() {
			match &entry.child {
				Some(cid) => {
					let child = Self::fetch_node(backend, canceller, cid).await?;
					entry.child_node = Some(Box::new(child));
				}
				None => return Ok(None),
			}
		}
		let child = entry.child_node.as_mut().ok_or(Error::Unreachable("Tree::find_in"))?;
		Self::find_in(backend, canceller, child, key).await
	}

	/// Recursive structural insert.
	///
	/// Descending into a subtree clears its stored hash, since the subtree
	/// is about to change. When a child splits, the returned two-entry node
	/// is spliced back into this one, and an oversized result propagates
	/// its own split upwards.
	#[async_recursion]
	async fn insert_in(
		backend: &B,
		canceller: &Canceller,
		node: &mut Node,
		key: Key,
		value: Value,
		max_node_size: usize,
	) -> Result<Option<Node>, Error> {
		if node.is_leaf() {
			node.entries.insert(NodeKey::Key(key), Entry::leaf(value));
		} else {
			let id = match node.lower_bound(&key) {
				Some(id) => id,
				None => {
					node.inf_entry();
					NodeKey::Inf
				}
			};
			if id.as_key() == Some(key.as_str()) {
				let e = node.entries.get_mut(&id).ok_or(Error::Unreachable("Tree::insert_in"))?;
				e.value = Some(value);
				return Ok(None);
			}
			let entry = node.entries.get_mut(&id).ok_or(Error::Unreachable("Tree::insert_in"))?;
			if entry.child_node.is_none() {
				match &entry.child {
					Some(cid) => {
						let child = Self::fetch_node(backend, canceller, cid).await?;
						entry.child_node = Some(Box::new(child));
					}
					None => entry.child_node = Some(Box::new(Node::default())),
				}
			}
			entry.child = None;
			let child =
				entry.child_node.as_mut().ok_or(Error::Unreachable("Tree::insert_in"))?;
			if let Some(two) =
				Self::insert_in(backend, canceller, child, key, value, max_node_size).await?
			{
				node.splice(id, two)?;
			}
		}
		Ok(node.split(max_node_size))
	}

	/// Serialize a dirty subtree bottom-up and return its new hash.
	#[async_recursion]
	async fn commit(backend: &B, canceller: &Canceller, node: &mut Node) -> Result<Cid, Error> {
		// Children first, so this node serializes with every hash in place.
		for e in node.entries.values_mut() {
			if e.child.is_some() {
				continue;
			}
			if let Some(child) = e.child_node.as_mut() {
				let hash = Self::commit(backend, canceller, child).await?;
				e.child = Some(hash);
			}
		}
		let bytes = node.to_bytes()?;
		let cid = backend.add(&bytes).await?;
		canceller.check()?;
		backend.pin(&cid).await?;
		canceller.check()?;
		Ok(cid)
	}

	async fn fetch_node(backend: &B, canceller: &Canceller, cid: &Cid) -> Result<Node, Error> {
		let bytes = backend.cat(cid).await?;
		canceller.check()?;
		Node::try_from_bytes(&bytes)
	}
}

impl<B> Display for Tree<B>
where
	B: Backend,
{
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match &self.root {
			Some(root) => Display::fmt(root, f),
			None => f.write_str("{}"),
		}
	}
}
