//! Lock-manager query client.
//!
//! The distributed lock manager runs as a separate local daemon. The only
//! thing this daemon ever asks of it is whether it has observed a given
//! node's failure for a given filesystem: the kernel instance must not be
//! unblocked until the lock manager has fenced the failed node's locks.
//!
//! Queries are fire-and-poll: [`LockManager::query_failure_observed`]
//! issues the question and the answer arrives later as a [`DlmResult`] on
//! the receiver handed out at construction, so the dispatch loop never
//! blocks on the lock manager. At most one query per mountgroup is
//! outstanding at a time; an unanswered or negative result is simply
//! reissued on a later tick.

use {
	crate::transport::NodeId,
	futures::{SinkExt, StreamExt},
	serde::{Deserialize, Serialize},
	std::{
		collections::BTreeSet,
		path::Path,
		sync::{Arc, Mutex},
	},
	tokio::{
		net::UnixStream,
		sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
	},
	tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec},
};

#[derive(Debug, thiserror::Error)]
pub enum DlmError {
	#[error("lock manager connection: {0}")]
	Connect(#[from] std::io::Error),

	#[error("lock manager encoding: {0}")]
	Encoding(#[from] postcard::Error),

	#[error("lock manager connection lost")]
	Disconnected,
}

/// Asynchronous answer to a failure-observation query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DlmResult {
	pub fsname: String,
	pub nodeid: NodeId,
	pub observed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct DlmRequest {
	fsname: String,
	nodeid: NodeId,
}

pub trait LockManager: Send {
	/// Registers interest in a filesystem with the lock manager.
	fn register(&mut self, fsname: &str) -> Result<(), DlmError>;

	/// Asks whether the lock manager has observed the failure of `nodeid`
	/// for `fsname`. The answer arrives on the result channel.
	fn query_failure_observed(
		&mut self,
		fsname: &str,
		nodeid: NodeId,
	) -> Result<(), DlmError>;
}

/// Client for the lock manager's local control socket. Requests and
/// results are length-delimited postcard frames.
pub struct SocketLockManager {
	requests: UnboundedSender<DlmRequest>,
}

impl SocketLockManager {
	pub async fn connect(
		path: &Path,
	) -> Result<(Self, UnboundedReceiver<DlmResult>), DlmError> {
		let stream = UnixStream::connect(path).await?;
		let (read_half, write_half) = stream.into_split();

		let (request_tx, mut request_rx) = unbounded_channel::<DlmRequest>();
		let (result_tx, result_rx) = unbounded_channel();

		let mut sink = FramedWrite::new(write_half, LengthDelimitedCodec::new());
		tokio::spawn(async move {
			while let Some(request) = request_rx.recv().await {
				let frame = match postcard::to_allocvec(&request) {
					Ok(frame) => frame,
					Err(error) => {
						tracing::warn!(%error, "failed to encode dlm request");
						continue;
					}
				};
				if sink.send(frame.into()).await.is_err() {
					tracing::warn!("lock manager connection lost");
					break;
				}
			}
		});

		let mut source = FramedRead::new(read_half, LengthDelimitedCodec::new());
		tokio::spawn(async move {
			while let Some(frame) = source.next().await {
				let Ok(frame) = frame else { break };
				match postcard::from_bytes::<DlmResult>(&frame) {
					Ok(result) => {
						if result_tx.send(result).is_err() {
							break;
						}
					}
					Err(error) => {
						tracing::warn!(%error, "undecodable dlm result frame");
					}
				}
			}
		});

		Ok((Self { requests: request_tx }, result_rx))
	}
}

impl LockManager for SocketLockManager {
	fn register(&mut self, _fsname: &str) -> Result<(), DlmError> {
		// registration is implicit in the first query for the filesystem
		Ok(())
	}

	fn query_failure_observed(
		&mut self,
		fsname: &str,
		nodeid: NodeId,
	) -> Result<(), DlmError> {
		self
			.requests
			.send(DlmRequest { fsname: fsname.to_string(), nodeid })
			.map_err(|_| DlmError::Disconnected)
	}
}

/// In-memory lock manager double. Tests script which failures it has
/// observed; unscripted queries answer `observed: false`, which exercises
/// the reissue path.
#[derive(Clone, Default)]
pub struct InMemoryLockManager {
	observed: Arc<Mutex<BTreeSet<(String, NodeId)>>>,
	results: Option<UnboundedSender<DlmResult>>,
}

impl InMemoryLockManager {
	pub fn new() -> (Self, UnboundedReceiver<DlmResult>) {
		let (tx, rx) = unbounded_channel();
		let manager = Self {
			observed: Arc::default(),
			results: Some(tx),
		};
		(manager, rx)
	}

	/// Marks a node failure as observed by the lock manager.
	pub fn observe_failure(&self, fsname: &str, nodeid: NodeId) {
		self
			.observed
			.lock()
			.expect("dlm lock")
			.insert((fsname.to_string(), nodeid));
	}
}

impl LockManager for InMemoryLockManager {
	fn register(&mut self, _fsname: &str) -> Result<(), DlmError> {
		Ok(())
	}

	fn query_failure_observed(
		&mut self,
		fsname: &str,
		nodeid: NodeId,
	) -> Result<(), DlmError> {
		let observed = self
			.observed
			.lock()
			.expect("dlm lock")
			.contains(&(fsname.to_string(), nodeid));

		let Some(results) = &self.results else {
			return Err(DlmError::Disconnected);
		};
		results
			.send(DlmResult { fsname: fsname.to_string(), nodeid, observed })
			.map_err(|_| DlmError::Disconnected)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unobserved_failure_answers_false() {
		let (mut dlm, mut results) = InMemoryLockManager::new();
		dlm.query_failure_observed("vol0", 2).unwrap();
		assert_eq!(results.try_recv().unwrap(), DlmResult {
			fsname: "vol0".into(),
			nodeid: 2,
			observed: false,
		});

		dlm.observe_failure("vol0", 2);
		dlm.query_failure_observed("vol0", 2).unwrap();
		assert!(results.try_recv().unwrap().observed);
	}
}
