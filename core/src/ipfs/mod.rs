//! The object-store adapter surface.
//!
//! The cache core never talks to a concrete IPFS daemon; everything it
//! needs from the substrate is captured by the [`Backend`] trait below.
//! The in-memory [`mem::MemoryBackend`] implements the same contract for
//! tests and embedded use.

#[cfg(feature = "backend-mem")]
pub mod mem;

use crate::err::Error;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Display, Formatter};
use std::future::Future;
use std::time::Duration;

/// The wire length of a content identifier.
pub const CID_LENGTH: usize = 46;

/// The prefix every content identifier starts with.
pub const CID_PREFIX: &str = "Qm";

/// A validated content identifier.
///
/// Hashes are opaque to the cache; the only structure relied upon is the
/// fixed width and prefix of the wire form, which is what lets a persisted
/// root hash be told apart from garbage on startup.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Cid(String);

impl Cid {
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl TryFrom<String> for Cid {
	type Error = Error;

	fn try_from(s: String) -> Result<Self, Self::Error> {
		if s.len() == CID_LENGTH && s.starts_with(CID_PREFIX) {
			Ok(Self(s))
		} else {
			Err(Error::InvalidDbFormat(format!("not a content identifier: `{s}`")))
		}
	}
}

impl TryFrom<&str> for Cid {
	type Error = Error;

	fn try_from(s: &str) -> Result<Self, Self::Error> {
		Self::try_from(s.to_owned())
	}
}

impl Display for Cid {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl Serialize for Cid {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.0)
	}
}

impl<'de> Deserialize<'de> for Cid {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Self::try_from(s).map_err(|e| D::Error::custom(e.to_string()))
	}
}

/// The asynchronous operations the cache core consumes from the substrate.
///
/// Implementations are expected to be internally safe for concurrent
/// submission; the core may issue calls from several tasks at once.
pub trait Backend: Send + Sync + 'static {
	/// The mutable name this backend publishes under
	fn ipns_id(&self) -> String;
	/// Store a block and return its content identifier
	fn add(&self, data: &[u8]) -> impl Future<Output = Result<Cid, Error>> + Send;
	/// Fetch the block previously stored under a content identifier
	fn cat(&self, cid: &Cid) -> impl Future<Output = Result<Vec<u8>, Error>> + Send;
	/// Dereference a mutable name to the hash it currently points at
	fn resolve(&self, name: &str) -> impl Future<Output = Result<Cid, Error>> + Send;
	/// Announce that this backend's name points at `cid` for `lifetime`
	fn publish(&self, cid: &Cid, lifetime: Duration) -> impl Future<Output = Result<(), Error>> + Send;
	/// Protect a block from local garbage collection
	fn pin(&self, cid: &Cid) -> impl Future<Output = Result<(), Error>> + Send;
	/// Allow a previously pinned block to be garbage collected
	fn unpin(&self, cid: &Cid) -> impl Future<Output = Result<(), Error>> + Send;
}

#[cfg(test)]
mod tests {
	use super::Cid;

	#[test]
	fn cid_shape_is_validated() {
		let ok = format!("Qm{}", "a".repeat(44));
		assert!(Cid::try_from(ok.as_str()).is_ok());
		assert!(Cid::try_from("Qmshort").is_err());
		assert!(Cid::try_from(format!("Xx{}", "a".repeat(44))).is_err());
		assert!(Cid::try_from("").is_err());
	}

	#[test]
	fn cid_serde_round_trip() {
		let cid = Cid::try_from(format!("Qm{}", "b".repeat(44))).unwrap();
		let json = serde_json::to_string(&cid).unwrap();
		let back: Cid = serde_json::from_str(&json).unwrap();
		assert_eq!(cid, back);
		assert!(serde_json::from_str::<Cid>("\"bogus\"").is_err());
	}
}
