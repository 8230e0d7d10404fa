use crate::transport::{LeaveReason, NodeId};

/// Durable cross-change facts about one cluster member.
///
/// An entry is created the first time a node is observed in any change and
/// is never deleted while the mountgroup exists: recovery bookkeeping and
/// the query interface need it even after the node has left.
#[derive(Debug, Clone)]
pub struct NodeInfo {
	pub nodeid: NodeId,

	/// The journal assigned to this node, stable for the lifetime of its
	/// membership. Spectators have none.
	pub jid: Option<u32>,

	pub ro: bool,
	pub spectator: bool,

	/// Whether the node reported that its local mount(2) call finished,
	/// and with which error code.
	pub kernel_mount_done: bool,
	pub kernel_mount_error: u32,

	/// Set when the node is removed by failure; cleared once the lock
	/// manager confirms it observed the failure too. While set, the local
	/// kernel instance must not be unblocked.
	pub check_dlm: bool,

	/// Change sequence numbers of the last observed join and removal,
	/// kept for diagnostics and to answer "is this node a member".
	pub added_seq: u32,
	pub removed_seq: u32,

	pub failure_reason: Option<LeaveReason>,
}

impl NodeInfo {
	pub fn new(nodeid: NodeId, added_seq: u32) -> Self {
		Self {
			nodeid,
			jid: None,
			ro: false,
			spectator: false,
			kernel_mount_done: false,
			kernel_mount_error: 0,
			check_dlm: false,
			added_seq,
			removed_seq: 0,
			failure_reason: None,
		}
	}

	/// Whether the node is currently a member, judging by the relative
	/// order of its last join and removal.
	pub fn is_member(&self) -> bool {
		self.removed_seq == 0 || self.added_seq > self.removed_seq
	}
}
