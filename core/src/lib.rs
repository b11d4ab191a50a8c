//! A distributed, content-addressed key→value cache layered over an
//! IPFS-style object store. An injector publishes `(key → content hash)`
//! mappings into a persistent Merkle B-tree and keeps the tree's root
//! announced under its mutable name; clients periodically re-resolve that
//! name and serve reads out of the same tree.

#[macro_use]
extern crate tracing;

#[macro_use]
mod mac;

pub mod cnf;
#[doc(hidden)]
pub mod ctx;
pub mod db;
pub mod err;
pub mod ipfs;
pub mod republisher;
pub mod tree;

pub use crate::db::{CachedContent, ClientDb, InjectorDb};
pub use crate::err::Error;
pub use crate::ipfs::{Backend, Cid};
pub use crate::republisher::Republisher;
pub use crate::tree::Tree;
