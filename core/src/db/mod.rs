//! The database layers shared by the two roles.
//!
//! An [`InjectorDb`] owns the tree and feeds it; a [`ClientDb`] follows the
//! injector's published head and serves reads. Both persist the last known
//! root hash in the repository directory so a restart resumes from it.

mod client;
mod injector;

pub use client::ClientDb;
pub use injector::InjectorDb;

use crate::cnf::DB_FILE_PREFIX;
use crate::err::Error;
use crate::ipfs::Cid;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A piece of cached content, as handed back to a client.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CachedContent {
	/// When the injector stored the content
	pub ts: DateTime<Utc>,
	/// The cached bytes
	pub data: Vec<u8>,
}

/// The timestamp layout used in stored payloads: ISO-8601 UTC with
/// fractional seconds and a trailing `Z`.
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// The value stored under a user key: the hash of the cached content plus
/// the time of injection.
#[derive(Clone, Debug)]
pub(crate) struct DbEntry {
	pub(crate) value: Cid,
	pub(crate) ts: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct WireDbEntry {
	value: Cid,
	ts: String,
}

impl DbEntry {
	pub(crate) fn new(value: Cid) -> Self {
		Self {
			value,
			// The wire format keeps microseconds; anything below would be
			// lost on the first round trip.
			ts: Utc::now().trunc_subsecs(6),
		}
	}

	pub(crate) fn encode(&self) -> Result<String, Error> {
		let wire = WireDbEntry {
			value: self.value.clone(),
			ts: self.ts.format(TS_FORMAT).to_string(),
		};
		Ok(serde_json::to_string(&wire)?)
	}

	pub(crate) fn decode(payload: &str) -> Result<Self, Error> {
		let wire: WireDbEntry =
			serde_json::from_str(payload).map_err(|e| Error::MalformedDbEntry(e.to_string()))?;
		let ts = DateTime::parse_from_rfc3339(&wire.ts)
			.map_err(|e| Error::MalformedDbEntry(format!("bad timestamp `{}`: {e}", wire.ts)))?
			.with_timezone(&Utc);
		Ok(Self {
			value: wire.value,
			ts,
		})
	}
}

/// Where a database persists its root hash: `<repo>/ipfs_cache_db.<ipns>`
pub(crate) fn db_file_path(repo: &Path, ipns: &str) -> PathBuf {
	repo.join(format!("{DB_FILE_PREFIX}.{ipns}"))
}

/// The persisted root hash, if the file exists and holds a valid cid.
/// Anything else is discarded so the database starts empty.
pub(crate) async fn read_root(path: &Path) -> Option<Cid> {
	let s = tokio::fs::read_to_string(path).await.ok()?;
	match Cid::try_from(s.trim()) {
		Ok(cid) => Some(cid),
		Err(_) => {
			warn!("discarding invalid persisted root in {}", path.display());
			None
		}
	}
}

/// Persist the root hash with a write-then-rename so readers never observe
/// a partially written file.
pub(crate) async fn persist_root(path: &Path, cid: &Cid) -> Result<(), Error> {
	let mut tmp = path.as_os_str().to_owned();
	tmp.push(".tmp");
	let tmp = PathBuf::from(tmp);
	tokio::fs::write(&tmp, cid.as_str()).await?;
	tokio::fs::rename(&tmp, path).await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::{db_file_path, persist_root, read_root, DbEntry};
	use crate::err::Error;
	use crate::ipfs::Cid;
	use chrono::Utc;
	use temp_dir::TempDir;
	use test_log::test;

	fn cid() -> Cid {
		Cid::try_from(format!("Qm{:0>44}", 7)).unwrap()
	}

	#[test]
	fn payloads_round_trip() {
		let entry = DbEntry::new(cid());
		let payload = entry.encode().unwrap();
		let back = DbEntry::decode(&payload).unwrap();
		assert_eq!(back.value, entry.value);
		assert_eq!(back.ts, entry.ts);
	}

	#[test]
	fn payload_timestamps_have_the_wire_shape() {
		let entry = DbEntry::new(cid());
		let payload = entry.encode().unwrap();
		let wire: serde_json::Value = serde_json::from_str(&payload).unwrap();
		let ts = wire["ts"].as_str().unwrap();
		// e.g. 2018-03-01T12:34:56.123456Z
		assert_eq!(ts.len(), 27);
		assert!(ts.ends_with('Z'));
		assert_eq!(&ts[10..11], "T");
		assert_eq!(&ts[19..20], ".");
	}

	#[test]
	fn bad_payloads_are_malformed_entries() {
		assert!(matches!(DbEntry::decode("not json"), Err(Error::MalformedDbEntry(_))));
		assert!(matches!(DbEntry::decode(r#"{"value":"bogus","ts":"x"}"#), Err(Error::MalformedDbEntry(_))));
		let bad_ts = format!(r#"{{"value":"{}","ts":"yesterday"}}"#, cid());
		assert!(matches!(DbEntry::decode(&bad_ts), Err(Error::MalformedDbEntry(_))));
	}

	#[test(tokio::test)]
	async fn roots_persist_across_restarts() {
		let repo = TempDir::new().unwrap();
		let path = db_file_path(repo.path(), "QmSomeName");
		assert_eq!(read_root(&path).await, None);
		persist_root(&path, &cid()).await.unwrap();
		assert_eq!(read_root(&path).await, Some(cid()));
	}

	#[test(tokio::test)]
	async fn invalid_persisted_roots_are_discarded() {
		let repo = TempDir::new().unwrap();
		let path = db_file_path(repo.path(), "QmSomeName");
		tokio::fs::write(&path, "junk").await.unwrap();
		assert_eq!(read_root(&path).await, None);
	}

	#[test]
	fn timestamps_are_utc() {
		let entry = DbEntry::new(cid());
		assert!((Utc::now() - entry.ts).num_seconds() < 1);
	}
}
