//! End-to-end coverage of the two roles sharing one object store: an
//! injector publishing content and a client following its mutable name.

use ipfs_cache_core::ipfs::mem::MemoryBackend;
use ipfs_cache_core::{Backend, ClientDb, Error, InjectorDb};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use temp_dir::TempDir;
use test_log::test;

async fn fetch(client: &ClientDb<MemoryBackend>, url: &str) -> Option<Vec<u8>> {
	loop {
		client.wait_for_db_update().await.unwrap();
		match client.get_content(url).await {
			Ok(content) => return Some(content.data),
			Err(Error::KeyNotFound) => continue,
			Err(e) => panic!("unexpected error fetching {url}: {e}"),
		}
	}
}

#[test(tokio::test(start_paused = true))]
async fn injected_content_reaches_clients() {
	let backend = Arc::new(MemoryBackend::new());
	let injector_repo = TempDir::new().unwrap();
	let client_repo = TempDir::new().unwrap();

	let injector = InjectorDb::new(backend.clone(), injector_repo.path()).await;
	injector.insert_content("http://a/", b"page a").await.unwrap();
	injector.insert_content("http://b/", b"page b").await.unwrap();

	let client = ClientDb::new(backend, client_repo.path(), injector.ipns().to_owned()).await;
	assert_eq!(fetch(&client, "http://a/").await.as_deref(), Some(&b"page a"[..]));
	assert_eq!(fetch(&client, "http://b/").await.as_deref(), Some(&b"page b"[..]));

	// Timestamps come from the injection, not the lookup.
	let got = client.get_content("http://a/").await.unwrap();
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
	assert!((now - got.ts.timestamp()).abs() < 5);
}

#[test(tokio::test(start_paused = true))]
async fn a_late_publisher_is_eventually_observed() {
	let backend = Arc::new(MemoryBackend::new());
	let injector_repo = TempDir::new().unwrap();
	let client_repo = TempDir::new().unwrap();

	// The client starts first; nothing resolves yet.
	let name = backend.ipns_id();
	let client = ClientDb::new(backend.clone(), client_repo.path(), name).await;
	tokio::time::sleep(Duration::from_secs(17)).await;

	let injector = InjectorDb::new(backend, injector_repo.path()).await;
	injector.insert_content("late", b"better late").await.unwrap();
	assert_eq!(fetch(&client, "late").await.as_deref(), Some(&b"better late"[..]));
}

#[test(tokio::test(start_paused = true))]
async fn updates_overwrite_earlier_values() {
	let backend = Arc::new(MemoryBackend::new());
	let injector_repo = TempDir::new().unwrap();
	let client_repo = TempDir::new().unwrap();

	let injector = InjectorDb::new(backend.clone(), injector_repo.path()).await;
	injector.insert_content("page", b"first revision").await.unwrap();
	let client = ClientDb::new(backend, client_repo.path(), injector.ipns().to_owned()).await;
	assert_eq!(fetch(&client, "page").await.as_deref(), Some(&b"first revision"[..]));

	injector.insert_content("page", b"second revision").await.unwrap();
	loop {
		client.wait_for_db_update().await.unwrap();
		if client.get_content("page").await.unwrap().data == b"second revision" {
			break;
		}
	}
}
