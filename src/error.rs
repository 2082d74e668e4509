use std::time::Duration;

/// Errors surfaced by the streaming plane.
///
/// Maps onto the taxonomy in the design doc: already-exists and not-found are
/// invariant-preserving caller errors, capacity-exceeded is retriable,
/// infrastructure failures mean a creation was fully rolled back, and
/// cancelled is expected during a cooperative shutdown (never logged as an
/// error).
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
	#[error("session already exists: {0}")]
	AlreadyExists(String),

	#[error("session not found: {0}")]
	NotFound(String),

	#[error("display pool at capacity")]
	CapacityExceeded,

	#[error("infrastructure failure: {0}")]
	Infrastructure(String),

	#[error("operation cancelled")]
	Cancelled,

	#[error("timed out after {0:?}")]
	Timeout(Duration),

	#[error("display {0} did not become ready in time")]
	DisplayTimeout(u32),

	#[error("io error: {0}")]
	Io(String),

	#[error("cannot {action} session in state {state}")]
	InvalidState { action: &'static str, state: &'static str },
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		Error::Io(err.to_string())
	}
}

pub type Result<T> = std::result::Result<T, Error>;
