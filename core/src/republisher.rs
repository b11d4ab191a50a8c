//! Keeps the database head reachable under its mutable name.
//!
//! Published records expire and the nodes holding them churn, so the
//! current root hash has to be re-announced periodically. The republisher
//! serializes publish calls: requests arriving while one announcement is
//! in flight are coalesced into the next pass, and every waiter is
//! answered exactly once by the pass that carried its submission.

use crate::cnf::PUBLISH_LIFETIME_SECS;
use crate::ctx::Canceller;
use crate::err::Error;
use crate::ipfs::{Backend, Cid};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

struct Request {
	cid: Cid,
	waiter: Option<oneshot::Sender<Result<(), Error>>>,
}

#[non_exhaustive]
pub struct Republisher {
	tx: mpsc::UnboundedSender<Request>,
	canceller: Canceller,
}

impl Republisher {
	pub fn new<B>(backend: Arc<B>, canceller: Canceller) -> Self
	where
		B: Backend,
	{
		let (tx, rx) = mpsc::unbounded_channel();
		tokio::spawn(Self::run(backend, canceller.clone(), rx));
		Self {
			tx,
			canceller,
		}
	}

	/// Announce that the mutable name points at `cid`.
	///
	/// Resolves once a publish pass carrying this submission has completed.
	/// The returned future does not borrow the republisher, so it can
	/// outlive it; a shut-down republisher answers with `Cancelled`.
	pub fn publish(&self, cid: Cid) -> impl Future<Output = Result<(), Error>> + 'static {
		let tx = self.tx.clone();
		async move {
			let (waiter, rx) = oneshot::channel();
			let req = Request {
				cid,
				waiter: Some(waiter),
			};
			tx.send(req).map_err(|_| Error::Cancelled)?;
			rx.await.map_err(|_| Error::Cancelled)?
		}
	}

	async fn run<B>(backend: Arc<B>, canceller: Canceller, mut rx: mpsc::UnboundedReceiver<Request>)
	where
		B: Backend,
	{
		let lifetime = Duration::from_secs(*PUBLISH_LIFETIME_SECS);
		let mut current: Option<Cid> = None;
		loop {
			let mut waiters = Vec::new();
			tokio::select! {
				req = rx.recv() => match req {
					Some(req) => {
						current = Some(req.cid);
						waiters.extend(req.waiter);
					}
					None => break,
				},
				// Keep the record alive while nothing new comes in.
				_ = tokio::time::sleep(lifetime / 2), if current.is_some() => {
					trace!("refreshing the published database head");
				}
			}
			// Everything queued before the pass starts rides along with it.
			while let Ok(req) = rx.try_recv() {
				current = Some(req.cid);
				waiters.extend(req.waiter);
			}
			if canceller.is_cancelled() {
				for w in waiters {
					let _ = w.send(Err(Error::Cancelled));
				}
				break;
			}
			let Some(cid) = current.clone() else {
				continue;
			};
			debug!("publishing database head {cid}");
			let mut res = backend.publish(&cid, lifetime).await;
			if canceller.is_cancelled() {
				res = Err(Error::Cancelled);
			}
			match &res {
				Ok(()) => debug!("published database head {cid}"),
				Err(e) => warn!("failed to publish the database head: {e}"),
			}
			for w in waiters {
				let _ = w.send(res.clone());
			}
			if canceller.is_cancelled() {
				break;
			}
		}
		// Shutdown: whatever is still queued will never be announced.
		rx.close();
		while let Ok(req) = rx.try_recv() {
			if let Some(w) = req.waiter {
				let _ = w.send(Err(Error::Cancelled));
			}
		}
	}
}

impl Drop for Republisher {
	fn drop(&mut self) {
		self.canceller.cancel();
	}
}

#[cfg(test)]
mod tests {
	use super::Republisher;
	use crate::ctx::Canceller;
	use crate::err::Error;
	use crate::ipfs::mem::MemoryBackend;
	use crate::ipfs::Backend;
	use futures::future::join_all;
	use std::sync::Arc;
	use test_log::test;

	async fn cid(backend: &MemoryBackend, data: &[u8]) -> crate::ipfs::Cid {
		backend.add(data).await.unwrap()
	}

	#[test(tokio::test)]
	async fn concurrent_publishes_are_coalesced() {
		let backend = Arc::new(MemoryBackend::new());
		let repub = Republisher::new(backend.clone(), Canceller::new());
		let mut futures = Vec::new();
		let mut last = None;
		for i in 0..5u8 {
			let cid = cid(&backend, &[i]).await;
			last = Some(cid.clone());
			futures.push(repub.publish(cid));
		}
		// Every caller gets exactly one answer, from a single pass.
		for res in join_all(futures).await {
			res.unwrap();
		}
		assert_eq!(backend.publish_count(), 1);
		assert_eq!(backend.resolve(&backend.ipns_id()).await.unwrap(), last.unwrap());
	}

	#[test(tokio::test(start_paused = true))]
	async fn the_head_is_republished_periodically() {
		let backend = Arc::new(MemoryBackend::new());
		let repub = Republisher::new(backend.clone(), Canceller::new());
		let cid = cid(&backend, b"head").await;
		repub.publish(cid.clone()).await.unwrap();
		assert_eq!(backend.publish_count(), 1);
		tokio::time::sleep(std::time::Duration::from_secs(301)).await;
		assert_eq!(backend.publish_count(), 2);
		tokio::time::sleep(std::time::Duration::from_secs(300)).await;
		assert_eq!(backend.publish_count(), 3);
		assert_eq!(backend.resolve(&backend.ipns_id()).await.unwrap(), cid);
	}

	#[test(tokio::test)]
	async fn pending_waiters_are_cancelled_on_shutdown() {
		let backend = Arc::new(MemoryBackend::new());
		let repub = Republisher::new(backend.clone(), Canceller::new());
		let cid = cid(&backend, b"head").await;
		let pending = repub.publish(cid);
		drop(repub);
		assert!(matches!(pending.await, Err(Error::Cancelled)));
		assert_eq!(backend.publish_count(), 0);
	}
}
