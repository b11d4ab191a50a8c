use once_cell::sync::Lazy;

/// The default maximum number of keyed entries in a single tree node.
///
/// Nodes which grow beyond this bound are split around their median key.
/// Tests use much smaller values to exercise splitting.
pub static DEFAULT_MAX_NODE_SIZE: Lazy<usize> =
	lazy_env_parse!("IPFS_CACHE_MAX_NODE_SIZE", usize, 64);

/// How long a published name→hash record remains valid, in seconds.
///
/// The republisher re-announces the current database head at half this
/// interval so the record never expires while the process is running.
pub static PUBLISH_LIFETIME_SECS: Lazy<u64> =
	lazy_env_parse!("IPFS_CACHE_PUBLISH_LIFETIME_SECS", u64, 600);

/// How often a client re-resolves the injector's mutable name, in seconds.
/// The same delay is used to back off after a failed resolve.
pub static CLIENT_REFRESH_SECS: Lazy<u64> = lazy_env_parse!("IPFS_CACHE_CLIENT_REFRESH_SECS", u64, 5);

/// The basename of the file holding the last known database root hash.
/// The full name is suffixed with the database's mutable name.
pub const DB_FILE_PREFIX: &str = "ipfs_cache_db";
