//! # Mountgroup coordination
//!
//! A mountgroup is the set of cluster nodes coordinating one shared-disk
//! filesystem mount. Each member runs this state machine over a
//! virtual-synchrony group: every membership transition (a [`Change`])
//! passes through a start barrier where all members publish and merge
//! their view of the group before anyone proceeds, then the converged
//! state drives journal recovery and the unblocking of the local kernel
//! instance.
//!
//! There is no coordinator. Convergence rests entirely on the transport
//! guarantee that all members observe the identical relative order of
//! delivered messages and membership events, so identical inputs drive
//! every member's copy of this machine through identical states.
//!
//! The machine itself performs no IO: events go in through
//! [`Mountgroup::on_event`] and the IO the daemon must perform comes back
//! out as [`Action`]s. Every cross-node or cross-process wait is expressed
//! as "re-evaluate on the next relevant event", never as blocking.

use {
	crate::{
		transport::{LeaveReason, NodeId},
		wire::{self, Message},
	},
	serde::{Deserialize, Serialize},
	std::collections::{BTreeMap, VecDeque},
};

mod barrier;
mod change;
mod journal;
mod node;
mod recovery;
mod sync;

pub use {
	change::{Change, ChangeState, ChangeSummary, Member, Removed, StartView},
	journal::{Journal, lowest_unused_jid},
	node::NodeInfo,
};

/// Mount mode requested by the local mount helper.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountOptions {
	pub ro: bool,
	/// A spectator mounts without a journal and never writes.
	pub spectator: bool,
}

/// What the local mount helper needs to finish its mount(2) call: the
/// journal assigned to this node and whether it must perform exclusive
/// first-mount recovery of all journals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountAssignment {
	pub jid: Option<u32>,
	pub first: bool,
}

/// One input to the mountgroup state machine, delivered by the daemon's
/// dispatch loop in strict arrival order.
#[derive(Debug, Clone)]
pub enum Event {
	/// A membership change from the group transport.
	Membership {
		members: Vec<NodeId>,
		joined: Vec<NodeId>,
		left: Vec<(NodeId, LeaveReason)>,
	},

	/// A decoded coordination message from the group transport, possibly
	/// our own broadcast echoed back.
	Message { nodeid: NodeId, message: Message },

	/// The local mount helper reported the result of its mount(2) call.
	MountDone { error: u32 },

	/// The kernel finished the outstanding journal recovery request.
	KernelRecoveryDone { jid: u32, success: bool },

	/// The kernel reported first-mount recovery completion.
	KernelFirstDone,

	/// The lock manager answered a failure-observation query.
	DlmResult { nodeid: NodeId, observed: bool },
}

/// One piece of IO the daemon must perform on behalf of the state
/// machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
	/// Broadcast a coordination message to the group. Never dropped on
	/// transport refusal: a missing start message stalls the barrier for
	/// the whole group, so refused broadcasts are retried with backoff.
	Broadcast(Message),

	/// Block all activity on the local kernel instance.
	KernelStop,

	/// Resume activity on the local kernel instance.
	KernelStart,

	/// Ask the local kernel to replay one journal.
	KernelRecover(u32),

	/// Ask the lock manager whether it observed this node's failure.
	DlmQuery(NodeId),

	/// Hand the waiting mount helper its journal assignment.
	NotifyMountClient(MountAssignment),

	/// The group confirmed our departure; drop the mountgroup.
	Teardown,
}

/// One clustered filesystem mount coordination context.
pub struct Mountgroup {
	pub(crate) name: String,
	pub(crate) global_id: u32,
	pub(crate) nodeid: NodeId,

	pub(crate) ro: bool,
	pub(crate) spectator: bool,

	pub(crate) joining: bool,
	pub(crate) leaving: bool,
	pub(crate) torn_down: bool,

	/// Local kernel instance blocked/unblocked.
	pub(crate) kernel_stopped: bool,
	pub(crate) kernel_mount_done: bool,
	pub(crate) kernel_mount_error: u32,
	pub(crate) mount_client_notified: bool,

	pub(crate) our_jid: Option<u32>,

	pub(crate) first_recovery_needed: bool,
	pub(crate) first_recovery_master: NodeId,
	pub(crate) first_recovery_msg_seen: bool,
	pub(crate) first_done_broadcast: bool,

	/// Journal currently being recovered by this node, if any. The kernel
	/// reports only a single outstanding recovery's result.
	pub(crate) local_recovery_busy: Option<u32>,

	/// Monotonic count of completed barrier cycles; zero means this node
	/// has never completed one.
	pub(crate) started_count: u32,

	/// The one lock-manager query allowed in flight at a time.
	pub(crate) dlm_notify_pending: Option<NodeId>,

	pub(crate) change_seq: u32,
	pub(crate) changes: VecDeque<Change>,
	pub(crate) started_change: Option<ChangeSummary>,

	pub(crate) nodes: BTreeMap<NodeId, NodeInfo>,
	pub(crate) journals: BTreeMap<u32, Journal>,

	/// Mount-done and recovery-result messages received mid-barrier,
	/// replayed once by the state synchronizer after state exists to
	/// apply them to.
	pub(crate) saved: Vec<(NodeId, Message)>,
}

// Public API
impl Mountgroup {
	pub fn new(
		name: impl Into<String>,
		group_prefix: &str,
		nodeid: NodeId,
		options: MountOptions,
	) -> Self {
		let name = name.into();
		let global_id = wire::global_id(&format!("{group_prefix}{name}"));

		Self {
			name,
			global_id,
			nodeid,
			ro: options.ro,
			spectator: options.spectator,
			joining: true,
			leaving: false,
			torn_down: false,
			kernel_stopped: false,
			kernel_mount_done: false,
			kernel_mount_error: 0,
			mount_client_notified: false,
			our_jid: None,
			first_recovery_needed: false,
			first_recovery_master: 0,
			first_recovery_msg_seen: false,
			first_done_broadcast: false,
			local_recovery_busy: None,
			started_count: 0,
			dlm_notify_pending: None,
			change_seq: 0,
			changes: VecDeque::new(),
			started_change: None,
			nodes: BTreeMap::new(),
			journals: BTreeMap::new(),
			saved: Vec::new(),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn global_id(&self) -> u32 {
		self.global_id
	}

	pub fn our_jid(&self) -> Option<u32> {
		self.our_jid
	}

	pub fn started_count(&self) -> u32 {
		self.started_count
	}

	pub fn first_recovery_needed(&self) -> bool {
		self.first_recovery_needed
	}

	pub fn first_recovery_master(&self) -> NodeId {
		self.first_recovery_master
	}

	pub fn kernel_stopped(&self) -> bool {
		self.kernel_stopped
	}

	pub fn is_torn_down(&self) -> bool {
		self.torn_down
	}

	pub fn pending_changes(&self) -> impl Iterator<Item = &Change> {
		self.changes.iter()
	}

	pub fn started_change(&self) -> Option<&ChangeSummary> {
		self.started_change.as_ref()
	}

	pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
		self.nodes.values()
	}

	pub fn journals(&self) -> impl Iterator<Item = &Journal> {
		self.journals.values()
	}

	pub fn has_pending_changes(&self) -> bool {
		!self.changes.is_empty()
	}

	/// The node id an unanswered lock-manager query is outstanding for.
	pub fn dlm_pending(&self) -> Option<NodeId> {
		self.dlm_notify_pending
	}

	/// Flips the local mount mode for a remount request.
	pub fn set_readonly(&mut self, ro: bool) {
		self.ro = ro;
		if let Some(node) = self.nodes.get_mut(&self.nodeid) {
			node.ro = ro;
		}
	}

	/// Marks the start of a voluntary leave; the mountgroup is torn down
	/// when the confirming membership event arrives.
	pub fn begin_leave(&mut self) {
		self.leaving = true;
	}

	/// Feeds one event into the state machine and re-evaluates the
	/// head-of-queue change and the recovery driver, pushing any IO the
	/// daemon must perform into `actions`.
	pub fn on_event(&mut self, event: Event, actions: &mut Vec<Action>) {
		if self.torn_down {
			return;
		}

		match event {
			Event::Membership { members, joined, left } => {
				self.on_membership(&members, &joined, &left, actions);
			}
			Event::Message { nodeid, message } => {
				self.on_message(nodeid, message);
			}
			Event::MountDone { error } => {
				self.on_local_mount_done(error, actions);
			}
			Event::KernelRecoveryDone { jid, success } => {
				self.on_kernel_recovery_done(jid, success, actions);
			}
			Event::KernelFirstDone => {
				self.on_kernel_first_done(actions);
			}
			Event::DlmResult { nodeid, observed } => {
				self.on_dlm_result(nodeid, observed);
			}
		}

		if !self.torn_down {
			self.poll(actions);
		}
	}

	/// Re-evaluates barrier progress and, when no change is pending, the
	/// recovery driver. Safe to call at any time; used by the daemon to
	/// retry after transient local failures.
	pub fn poll(&mut self, actions: &mut Vec<Action>) {
		self.apply_changes(actions);
		if self.changes.is_empty() {
			self.apply_recovery(actions);
		}
	}
}

// Event handlers
impl Mountgroup {
	fn on_membership(
		&mut self,
		members: &[NodeId],
		joined: &[NodeId],
		left: &[(NodeId, LeaveReason)],
		actions: &mut Vec<Action>,
	) {
		if left.iter().any(|(n, _)| *n == self.nodeid) {
			if !self.leaving {
				tracing::warn!(
					group = %self.name,
					"removed from mountgroup without a leave in progress",
				);
			} else {
				tracing::info!(group = %self.name, "left mountgroup");
			}
			self.torn_down = true;
			actions.push(Action::Teardown);
			return;
		}

		self.change_seq += 1;
		let seq = self.change_seq;

		// history entries exist for every member of every change, even
		// ones this node knows nothing about yet
		for &nodeid in members {
			self.nodes.entry(nodeid).or_insert_with(|| NodeInfo::new(nodeid, seq));
		}

		for &nodeid in joined {
			if let Some(node) = self.nodes.get_mut(&nodeid) {
				node.added_seq = seq;
				node.failure_reason = None;
				// a rejoining node starts over: its previous journal (if
				// any) stays behind until recovered, it gets a fresh one
				node.jid = None;
				node.kernel_mount_done = false;
				node.kernel_mount_error = 0;
				if nodeid == self.nodeid {
					node.ro = self.ro;
					node.spectator = self.spectator;
				}
			}
		}

		for &(nodeid, reason) in left {
			let node = self
				.nodes
				.entry(nodeid)
				.or_insert_with(|| NodeInfo::new(nodeid, 0));
			node.removed_seq = seq;
			node.kernel_mount_done = false;

			if reason.is_failure() {
				node.check_dlm = true;
				node.failure_reason = Some(reason);
				if let Some(jid) = node.jid
					&& let Some(journal) = self.journals.get_mut(&jid)
				{
					journal.needs_recovery = true;
					tracing::info!(
						group = %self.name,
						nodeid,
						jid,
						"member failed, journal needs recovery",
					);
				}
			} else if let Some(jid) = node.jid.take() {
				// a clean unmount leaves the journal clean; free the slot
				self.journals.remove(&jid);
			}
		}

		let change = Change {
			seq,
			state: ChangeState::WaitConditions,
			members: members
				.iter()
				.map(|&nodeid| Member {
					nodeid,
					added: joined.contains(&nodeid),
					start_received: false,
					disallowed: false,
					start: None,
				})
				.collect(),
			removed: left
				.iter()
				.map(|&(nodeid, reason)| Removed {
					nodeid,
					failed: reason.is_failure(),
					reason,
				})
				.collect(),
			member_count: members.len() as u32,
			joined_count: joined.len() as u32,
			remove_count: left.len() as u32,
			failed_count: left.iter().filter(|(_, r)| r.is_failure()).count()
				as u32,
		};

		tracing::debug!(
			group = %self.name,
			seq,
			members = change.member_count,
			joined = change.joined_count,
			removed = change.remove_count,
			failed = change.failed_count,
			"queued membership change",
		);

		self.changes.push_back(change);
	}

	fn on_message(&mut self, from: NodeId, message: Message) {
		match message {
			Message::Start { seq, info, snapshots } => {
				self.receive_start(from, seq, info, snapshots);
			}
			Message::MountDone { error } => {
				self.receive_mount_done(from, error);
			}
			Message::FirstRecoveryDone => {
				self.receive_first_recovery_done(from);
			}
			Message::RecoveryResult { jid, success } => {
				self.receive_recovery_result(from, jid, success);
			}
		}
	}

	fn on_local_mount_done(&mut self, error: u32, actions: &mut Vec<Action>) {
		self.kernel_mount_done = true;
		self.kernel_mount_error = error;
		tracing::info!(group = %self.name, error, "local mount finished");
		actions.push(Action::Broadcast(Message::MountDone { error }));
	}

	fn on_dlm_result(&mut self, nodeid: NodeId, observed: bool) {
		if self.dlm_notify_pending == Some(nodeid) {
			self.dlm_notify_pending = None;
		}

		if observed {
			if let Some(node) = self.nodes.get_mut(&nodeid) {
				node.check_dlm = false;
			}
			tracing::debug!(
				group = %self.name,
				nodeid,
				"lock manager confirmed failure",
			);
		} else {
			// lock manager has not caught up yet; the query is reissued
			// on the next evaluation of the barrier conditions
			tracing::trace!(
				group = %self.name,
				nodeid,
				"lock manager has not observed failure yet",
			);
		}
	}
}

// Buffered message application. Both appliers are idempotent: replaying a
// message a second time produces no state change.
impl Mountgroup {
	fn receive_mount_done(&mut self, from: NodeId, error: u32) {
		if !self.changes.is_empty() {
			self.saved.push((from, Message::MountDone { error }));
			return;
		}
		self.apply_mount_done(from, error);
	}

	pub(crate) fn apply_mount_done(&mut self, from: NodeId, error: u32) {
		let Some(node) = self.nodes.get_mut(&from) else {
			tracing::debug!(
				group = %self.name,
				from,
				"mount done from unknown node",
			);
			return;
		};
		node.kernel_mount_done = true;
		node.kernel_mount_error = error;
	}
}
