//! Membership ledger: one [`Change`] per membership transition, queued in
//! arrival order, plus the matcher that pairs an incoming start message
//! with the queued change it belongs to.

use {
	super::Mountgroup,
	crate::{
		transport::{LeaveReason, NodeId},
		wire::{GroupInfo, NodeSnapshot},
	},
	derive_more::Display,
};

/// Barrier progress of one change.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ChangeState {
	/// Waiting for local preconditions before broadcasting our start
	/// message: mount settled, kernel blocked, lock manager caught up.
	#[display("wait_conditions")]
	WaitConditions,

	/// Our start message is out; waiting for every member's start.
	#[display("wait_messages")]
	WaitMessages,
}

/// A member's received start message, parsed.
#[derive(Debug, Clone)]
pub struct StartView {
	pub info: GroupInfo,
	pub snapshots: Vec<NodeSnapshot>,
}

/// One member of a change.
#[derive(Debug, Clone)]
pub struct Member {
	pub nodeid: NodeId,

	/// Whether this transition added the member.
	pub added: bool,

	/// Whether a matching start message has been recorded.
	pub start_received: bool,

	/// An added member whose start message claimed pre-existing barrier
	/// progress. Detected and logged; no remediation is defined.
	pub disallowed: bool,

	pub start: Option<StartView>,
}

/// One removal carried by a change.
#[derive(Debug, Clone)]
pub struct Removed {
	pub nodeid: NodeId,
	pub failed: bool,
	pub reason: LeaveReason,
}

/// One membership transition and its barrier round.
#[derive(Debug, Clone)]
pub struct Change {
	pub seq: u32,
	pub state: ChangeState,
	pub members: Vec<Member>,
	pub removed: Vec<Removed>,
	pub member_count: u32,
	pub joined_count: u32,
	pub remove_count: u32,
	pub failed_count: u32,
}

impl Change {
	pub fn is_member(&self, nodeid: NodeId) -> bool {
		self.members.iter().any(|m| m.nodeid == nodeid)
	}

	pub fn all_started(&self) -> bool {
		self.members.iter().all(|m| m.start_received)
	}

	/// Whether a start message with these counts and this membership set
	/// belongs to this change.
	fn matches(&self, info: &GroupInfo, snapshots: &[NodeSnapshot]) -> bool {
		if info.member_count != self.member_count
			|| info.joined_count != self.joined_count
			|| info.remove_count != self.remove_count
			|| info.failed_count != self.failed_count
		{
			return false;
		}

		let mut theirs: Vec<NodeId> = snapshots
			.iter()
			.filter(|s| s.is_member())
			.map(|s| s.nodeid)
			.collect();
		theirs.sort_unstable();

		let mut ours: Vec<NodeId> =
			self.members.iter().map(|m| m.nodeid).collect();
		ours.sort_unstable();

		theirs == ours
	}
}

/// Summary of the last completed change, retained after its barrier for
/// the query interface. Superseded changes fold their transition counts
/// into the summary of the change that completed.
#[derive(Debug, Clone, Copy)]
pub struct ChangeSummary {
	pub seq: u32,
	pub member_count: u32,
	pub joined_count: u32,
	pub remove_count: u32,
	pub failed_count: u32,
}

// Start message matching
impl Mountgroup {
	/// Pairs a received start message with the queued change it belongs
	/// to and records it there. A new change can arrive while the previous
	/// barrier is incomplete, so the match scans the queue newest to
	/// oldest; a message matching no queued change is a stale leftover of
	/// a superseded transition and is discarded.
	pub(crate) fn receive_start(
		&mut self,
		from: NodeId,
		seq: u32,
		info: GroupInfo,
		snapshots: Vec<NodeSnapshot>,
	) {
		// the sender must list itself as a member of its own snapshot
		let self_listed = snapshots
			.iter()
			.any(|s| s.nodeid == from && s.is_member());
		if !self_listed {
			tracing::warn!(
				group = %self.name,
				from,
				seq,
				"start message sender missing from its own snapshot",
			);
			return;
		}

		let matched = (0..self.changes.len()).rev().find(|&i| {
			let change = &self.changes[i];
			change.is_member(from) && change.matches(&info, &snapshots)
		});

		let Some(index) = matched else {
			tracing::debug!(
				group = %self.name,
				from,
				seq,
				"ignoring start matching no queued change",
			);
			return;
		};

		if index + 1 != self.changes.len() {
			// recorded for completeness; a superseded change never
			// completes its barrier
			tracing::debug!(
				group = %self.name,
				from,
				seq,
				"start belongs to a superseded change",
			);
		}

		let change = &mut self.changes[index];
		let member = change
			.members
			.iter_mut()
			.find(|m| m.nodeid == from)
			.expect("matcher checked membership");

		if member.added && info.started_count != 0 && !member.disallowed {
			member.disallowed = true;
			tracing::warn!(
				group = %self.name,
				from,
				started_count = info.started_count,
				"added member reports pre-existing barrier progress",
			);
		}

		if member.start_received {
			tracing::debug!(group = %self.name, from, "duplicate start message");
			return;
		}

		member.start_received = true;
		member.start = Some(StartView { info, snapshots });

		tracing::trace!(
			group = %self.name,
			from,
			seq = change.seq,
			"start message recorded",
		);
	}
}
