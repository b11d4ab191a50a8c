#![cfg(feature = "backend-mem")]

use crate::err::Error;
use crate::ipfs::{Backend, Cid};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// An in-memory object store.
///
/// Blocks are content-addressed: adding the same bytes twice yields the
/// same identifier, which is what the store-idempotence guarantees of the
/// tree rely on. Pins, unpins and publishes are counted so tests can
/// assert on retention behaviour.
#[non_exhaustive]
pub struct MemoryBackend {
	ipns: String,
	inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
	blocks: HashMap<Cid, Vec<u8>>,
	by_content: HashMap<Vec<u8>, Cid>,
	names: HashMap<String, Cid>,
	pins: HashMap<Cid, usize>,
	unpins: HashMap<Cid, usize>,
	publishes: usize,
	next_id: u64,
}

impl MemoryBackend {
	pub fn new() -> Self {
		Self::with_ipns(format!("Qm{:0>44}", "MemoryBackend"))
	}

	/// A backend publishing under a caller-chosen mutable name
	pub fn with_ipns(ipns: String) -> Self {
		Self {
			ipns,
			inner: Mutex::new(Inner::default()),
		}
	}

	/// How many times a block was pinned
	pub fn pin_count(&self, cid: &Cid) -> usize {
		self.inner.lock().unwrap().pins.get(cid).copied().unwrap_or(0)
	}

	/// How many times a block was unpinned
	pub fn unpin_count(&self, cid: &Cid) -> usize {
		self.inner.lock().unwrap().unpins.get(cid).copied().unwrap_or(0)
	}

	/// How many publish calls were issued
	pub fn publish_count(&self) -> usize {
		self.inner.lock().unwrap().publishes
	}

	/// How many distinct blocks are stored
	pub fn block_count(&self) -> usize {
		self.inner.lock().unwrap().blocks.len()
	}
}

impl Default for MemoryBackend {
	fn default() -> Self {
		Self::new()
	}
}

impl Backend for MemoryBackend {
	fn ipns_id(&self) -> String {
		self.ipns.clone()
	}

	async fn add(&self, data: &[u8]) -> Result<Cid, Error> {
		let mut inner = self.inner.lock().unwrap();
		if let Some(cid) = inner.by_content.get(data) {
			return Ok(cid.clone());
		}
		let cid = Cid::try_from(format!("Qm{:0>44}", inner.next_id))?;
		inner.next_id += 1;
		inner.blocks.insert(cid.clone(), data.to_vec());
		inner.by_content.insert(data.to_vec(), cid.clone());
		Ok(cid)
	}

	async fn cat(&self, cid: &Cid) -> Result<Vec<u8>, Error> {
		let inner = self.inner.lock().unwrap();
		inner
			.blocks
			.get(cid)
			.cloned()
			.ok_or_else(|| Error::CatFailed(format!("no block stored under {cid}")))
	}

	async fn resolve(&self, name: &str) -> Result<Cid, Error> {
		let inner = self.inner.lock().unwrap();
		inner
			.names
			.get(name)
			.cloned()
			.ok_or_else(|| Error::ResolveFailed(format!("nothing published under {name}")))
	}

	async fn publish(&self, cid: &Cid, _lifetime: Duration) -> Result<(), Error> {
		let mut inner = self.inner.lock().unwrap();
		inner.publishes += 1;
		let name = self.ipns.clone();
		inner.names.insert(name, cid.clone());
		Ok(())
	}

	async fn pin(&self, cid: &Cid) -> Result<(), Error> {
		let mut inner = self.inner.lock().unwrap();
		*inner.pins.entry(cid.clone()).or_default() += 1;
		Ok(())
	}

	async fn unpin(&self, cid: &Cid) -> Result<(), Error> {
		let mut inner = self.inner.lock().unwrap();
		*inner.unpins.entry(cid.clone()).or_default() += 1;
		Ok(())
	}
}
