use thiserror::Error;

/// The errors surfaced by the cache database and its object-store adapter.
///
/// The enum is `Clone` because a single store or publish pass answers every
/// waiter queued behind it with the same outcome, so wrapped causes are kept
/// as rendered strings rather than source errors.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
	/// The mutable name could not be dereferenced to a hash
	#[error("Failed to resolve the IPNS entry: {0}")]
	ResolveFailed(String),

	/// The object store refused to store a new block
	#[error("Failed to add data to the object store: {0}")]
	AddFailed(String),

	/// The object store could not return a block
	#[error("Failed to fetch data from the object store: {0}")]
	CatFailed(String),

	/// A block was located but its content could not be read
	#[error("Failed to read data from the object store: {0}")]
	ReadFailed(String),

	/// The database head could not be announced under the mutable name
	#[error("Failed to publish the database head: {0}")]
	PublishFailed(String),

	/// The requested key is not present in the database
	#[error("Key not found in the database")]
	KeyNotFound,

	/// A stored payload did not decode to a `{value, ts}` record
	#[error("Malformed database entry: {0}")]
	MalformedDbEntry(String),

	/// Stored tree data did not decode to a valid node
	#[error("Invalid database format: {0}")]
	InvalidDbFormat(String),

	/// A value could not be serialized to or parsed from JSON
	#[error("Error parsing JSON: {0}")]
	ErrorParsingJson(String),

	/// A node references a subtree which is neither stored nor in memory
	#[error("Missing link to a child node: {0}")]
	MissingLink(String),

	/// The owning component was destroyed while the operation was in flight
	#[error("The operation was cancelled")]
	Cancelled,

	/// There was an I/O error
	#[error("I/O error: {0}")]
	Io(String),

	/// The database encountered a state which should never happen
	#[error("Internal database error: {0}")]
	Unreachable(&'static str),
}

impl From<serde_json::Error> for Error {
	fn from(e: serde_json::Error) -> Self {
		Self::ErrorParsingJson(e.to_string())
	}
}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Self {
		Self::Io(e.to_string())
	}
}
