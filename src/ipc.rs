//! Local control socket: the mount-client protocol and the read-only
//! query interface, served over one unix domain socket.
//!
//! Messages are length-delimited frames carrying postcard-serialized
//! typed values; a frame that fails to decode is a protocol violation and
//! closes the connection. A join request is answered only once the
//! barrier has assigned this node a journal — the mount helper blocks on
//! the reply and then performs the actual mount(2) call with it.

use {
	crate::{
		group::{MountAssignment, MountOptions},
		transport::NodeId,
	},
	futures::{SinkExt, StreamExt},
	serde::{Deserialize, Serialize},
	std::path::Path,
	tokio::{
		net::{UnixListener, UnixStream},
		sync::{
			mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
			oneshot,
		},
	},
	tokio_util::codec::{Framed, LengthDelimitedCodec},
};

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
	#[error("control socket io: {0}")]
	Io(#[from] std::io::Error),

	#[error("control socket encoding: {0}")]
	Encoding(#[from] postcard::Error),

	#[error("daemon closed the connection")]
	Closed,
}

/// A request from a mount helper or inspection tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
	/// Join the mountgroup for a filesystem; answered with the journal
	/// assignment once the barrier yields one. Delayed, not failed, when
	/// the group is not ready.
	Join { fsname: String, options: MountOptions },

	/// Flip the local mount between read-only and read-write.
	Remount { fsname: String, ro: bool },

	/// The helper's mount(2) call finished with this error code.
	MountDone { fsname: String, error: u32 },

	/// Leave the mountgroup after unmounting.
	Leave { fsname: String },

	/// Query: all mountgroups with their change summaries.
	ListGroups,

	/// Query: the nodes of one mountgroup.
	ListNodes { fsname: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
	Mount(MountAssignment),
	Ok,
	Error { message: String },
	Groups(Vec<GroupSummary>),
	Nodes(Vec<NodeSummary>),
}

/// Query view of one mountgroup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSummary {
	pub name: String,
	pub global_id: u32,
	pub our_jid: Option<u32>,
	pub started_count: u32,
	pub first_recovery_needed: bool,
	pub first_recovery_master: NodeId,
	pub kernel_stopped: bool,
	/// Pending changes, oldest first: (seq, members, wait state).
	pub pending: Vec<(u32, u32, String)>,
	/// Last completed change: (seq, members, joined, removed, failed).
	pub completed: Option<(u32, u32, u32, u32, u32)>,
}

/// Query view of one node of a mountgroup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
	pub nodeid: NodeId,
	pub jid: Option<u32>,
	pub member: bool,
	pub ro: bool,
	pub spectator: bool,
	pub kernel_mount_done: bool,
	pub kernel_mount_error: u32,
	pub check_dlm: bool,
}

/// One inbound request paired with its reply channel. The daemon may
/// hold the reply for as long as the answer takes to materialize.
pub struct IpcRequest {
	pub request: Request,
	pub reply: oneshot::Sender<Response>,
}

/// Accepts control socket connections and funnels every request from
/// every connection into one channel, preserving per-connection order.
/// Dropping the server stops the accept loop and closes the socket.
pub struct IpcServer {
	listener_task: tokio::task::JoinHandle<()>,
}

impl Drop for IpcServer {
	fn drop(&mut self) {
		self.listener_task.abort();
	}
}

impl IpcServer {
	pub fn bind(
		path: &Path,
	) -> Result<(Self, UnboundedReceiver<IpcRequest>), IpcError> {
		// a stale socket file from a previous run would fail the bind
		let _ = std::fs::remove_file(path);
		let listener = UnixListener::bind(path)?;
		let (tx, rx) = unbounded_channel();

		let task = tokio::spawn(async move {
			loop {
				match listener.accept().await {
					Ok((stream, _)) => {
						tokio::spawn(serve_connection(stream, tx.clone()));
					}
					Err(error) => {
						tracing::warn!(%error, "control socket accept failed");
					}
				}
			}
		});

		Ok((Self { listener_task: task }, rx))
	}
}

async fn serve_connection(
	stream: UnixStream,
	requests: UnboundedSender<IpcRequest>,
) {
	let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

	while let Some(frame) = framed.next().await {
		let Ok(frame) = frame else { return };

		let request = match postcard::from_bytes::<Request>(&frame) {
			Ok(request) => request,
			Err(error) => {
				// protocol violation; drop the connection
				tracing::warn!(%error, "undecodable control request");
				return;
			}
		};

		let (reply_tx, reply_rx) = oneshot::channel();
		if requests
			.send(IpcRequest { request, reply: reply_tx })
			.is_err()
		{
			return;
		}

		let response = match reply_rx.await {
			Ok(response) => response,
			Err(_) => Response::Error {
				message: "daemon dropped the request".to_string(),
			},
		};

		let Ok(frame) = postcard::to_allocvec(&response) else { return };
		if framed.send(frame.into()).await.is_err() {
			return;
		}
	}
}

/// Client side, used by mount helpers and the inspect subcommand.
pub struct IpcClient {
	framed: Framed<UnixStream, LengthDelimitedCodec>,
}

impl IpcClient {
	pub async fn connect(path: &Path) -> Result<Self, IpcError> {
		let stream = UnixStream::connect(path).await?;
		Ok(Self { framed: Framed::new(stream, LengthDelimitedCodec::new()) })
	}

	pub async fn request(
		&mut self,
		request: &Request,
	) -> Result<Response, IpcError> {
		let frame = postcard::to_allocvec(request)?;
		self.framed.send(frame.into()).await?;

		let Some(frame) = self.framed.next().await else {
			return Err(IpcError::Closed);
		};
		Ok(postcard::from_bytes(&frame?)?)
	}
}
