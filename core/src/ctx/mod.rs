use crate::err::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A shared "destroyed" flag.
///
/// Every long-lived component owns a clone of its database's canceller and
/// checks it after each object-store await. A continuation which observes
/// the flag reports [`Error::Cancelled`] to its waiter instead of mutating
/// any state, which makes late completions of in-flight calls safe.
#[derive(Clone, Debug, Default)]
pub struct Canceller {
	cancelled: Arc<AtomicBool>,
}

impl Canceller {
	pub fn new() -> Self {
		Self::default()
	}

	/// Mark the owning component as destroyed
	pub fn cancel(&self) {
		self.cancelled.store(true, Ordering::Relaxed);
	}

	/// Check if the owning component was destroyed
	pub fn is_cancelled(&self) -> bool {
		self.cancelled.load(Ordering::Relaxed)
	}

	/// Bail out with [`Error::Cancelled`] if the flag is set
	pub fn check(&self) -> Result<(), Error> {
		if self.is_cancelled() {
			Err(Error::Cancelled)
		} else {
			Ok(())
		}
	}
}
