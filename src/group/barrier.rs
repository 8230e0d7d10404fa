//! Start barrier protocol.
//!
//! Every membership change passes through a barrier: each member
//! broadcasts a start message carrying its snapshot of group state once
//! its local preconditions hold, and nobody proceeds until every current
//! member's start has been received. The barrier that is actively driven
//! is always the newest queued change; a change superseded by a newer
//! membership event never completes and is folded away when the newer
//! barrier does.

use {
	super::{Action, Change, ChangeState, ChangeSummary, Mountgroup},
	crate::wire::{
		GroupInfo,
		Message,
		NodeSnapshot,
		SNAP_MEMBER,
		SNAP_MOUNT_DONE,
		SNAP_MOUNT_ERROR,
		SNAP_MOUNT_RO,
		SNAP_MOUNT_SPECTATOR,
		SNAP_NEEDS_RECOVERY,
	},
};

impl Mountgroup {
	/// Drives the newest queued change through its barrier states.
	pub(crate) fn apply_changes(&mut self, actions: &mut Vec<Action>) {
		let Some(state) = self.changes.back().map(|c| c.state) else {
			return;
		};

		match state {
			ChangeState::WaitConditions => {
				if self.conditions_met(actions) {
					self.send_start(actions);
					let change =
						self.changes.back_mut().expect("change still queued");
					change.state = ChangeState::WaitMessages;
					tracing::debug!(
						group = %self.name,
						seq = change.seq,
						"start sent, waiting on members",
					);
				}
			}
			ChangeState::WaitMessages => {
				let complete =
					self.changes.back().is_some_and(Change::all_started);
				if complete {
					self.sync_state();
					self.finish_changes();
				}
			}
		}
	}

	/// Local preconditions for broadcasting our start message.
	///
	/// Bootstrap and first-mount recovery short-circuit: there is no
	/// prior barrier state to protect. Otherwise the local mount must
	/// have settled, the kernel instance must be blocked, and the lock
	/// manager must have confirmed every failure we observed. The lock
	/// manager confirmation is fire-and-poll with at most one query
	/// outstanding: an unanswered query yields control back to the event
	/// loop rather than blocking it.
	fn conditions_met(&mut self, actions: &mut Vec<Action>) -> bool {
		if self.first_recovery_needed || self.started_count == 0 {
			return true;
		}

		if self.mount_client_notified && !self.kernel_mount_done {
			tracing::trace!(
				group = %self.name,
				"waiting for local mount to finish",
			);
			return false;
		}

		if self.kernel_mount_done
			&& self.kernel_mount_error == 0
			&& !self.kernel_stopped
		{
			self.kernel_stopped = true;
			actions.push(Action::KernelStop);
			tracing::debug!(group = %self.name, "blocked kernel instance");
		}

		if self.dlm_notify_pending.is_some() {
			return false;
		}

		let unconfirmed =
			self.nodes.values().find(|n| n.check_dlm).map(|n| n.nodeid);
		if let Some(nodeid) = unconfirmed {
			self.dlm_notify_pending = Some(nodeid);
			actions.push(Action::DlmQuery(nodeid));
			tracing::debug!(
				group = %self.name,
				nodeid,
				"waiting for lock manager to observe failure",
			);
			return false;
		}

		true
	}

	/// Builds and broadcasts our snapshot for the newest queued change:
	/// one record per current member (full known state for old members, an
	/// empty or self-reported slot for added ones) plus one record per
	/// journal still awaiting recovery.
	fn send_start(&mut self, actions: &mut Vec<Action>) {
		let change = self.changes.back().expect("change queued");

		let mut snapshots = Vec::with_capacity(change.members.len());
		for member in &change.members {
			if member.added && member.nodeid != self.nodeid {
				// an added member never carries prior-barrier state
				snapshots.push(NodeSnapshot {
					nodeid: member.nodeid,
					jid: None,
					flags: SNAP_MEMBER,
				});
				continue;
			}

			let node = &self.nodes[&member.nodeid];
			let mut flags = SNAP_MEMBER;
			if node.kernel_mount_done {
				flags |= SNAP_MOUNT_DONE;
			}
			if node.kernel_mount_error != 0 {
				flags |= SNAP_MOUNT_ERROR;
			}
			if node.ro {
				flags |= SNAP_MOUNT_RO;
			}
			if node.spectator {
				flags |= SNAP_MOUNT_SPECTATOR;
			}
			snapshots.push(NodeSnapshot {
				nodeid: member.nodeid,
				jid: node.jid,
				flags,
			});
		}

		for journal in self.journals.values().filter(|j| j.needs_recovery) {
			snapshots.push(NodeSnapshot {
				nodeid: journal.owner.unwrap_or(0),
				jid: Some(journal.jid),
				flags: SNAP_NEEDS_RECOVERY,
			});
		}

		let info = GroupInfo {
			started_count: self.started_count,
			member_count: change.member_count,
			joined_count: change.joined_count,
			remove_count: change.remove_count,
			failed_count: change.failed_count,
			id_count: snapshots.len() as u32,
			first_recovery_needed: self.first_recovery_needed,
			first_recovery_master: self.first_recovery_master,
		};

		actions.push(Action::Broadcast(Message::Start {
			seq: change.seq,
			info,
			snapshots,
		}));
	}

	/// Called once every member's start for the newest change has been
	/// verified received and the state synchronizer has run: retains the
	/// completed change as the started-change summary, folding the
	/// transition counts of any superseded older changes into it, and
	/// clears the queue.
	fn finish_changes(&mut self) {
		let newest = self.changes.pop_back().expect("completed change");
		let superseded = std::mem::take(&mut self.changes);

		let mut summary = ChangeSummary {
			seq: newest.seq,
			member_count: newest.member_count,
			joined_count: newest.joined_count,
			remove_count: newest.remove_count,
			failed_count: newest.failed_count,
		};

		for old in &superseded {
			tracing::debug!(
				group = %self.name,
				seq = old.seq,
				"discarding superseded change",
			);
			summary.joined_count += old.joined_count;
			summary.remove_count += old.remove_count;
			summary.failed_count += old.failed_count;
		}

		self.started_change = Some(summary);
		self.started_count += 1;
		self.joining = false;

		tracing::info!(
			group = %self.name,
			seq = summary.seq,
			started_count = self.started_count,
			"barrier cycle complete",
		);
	}
}
