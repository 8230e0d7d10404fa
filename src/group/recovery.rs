//! Recovery driver: runs whenever no membership change is pending and
//! walks the local kernel instance through journal recovery and
//! unblocking.
//!
//! Progress is detected through the group, not locally: a finished kernel
//! recovery is broadcast as a recovery-result message and applied on
//! receipt, own echo included, so all members converge on the same
//! journal state. A node that cannot make progress leaves the filesystem
//! blocked and waits for the next event; blocking on inconsistent state
//! is the failure mode this whole protocol exists to prevent.

use {
	super::{Action, Mountgroup, MountAssignment},
	crate::{transport::NodeId, wire::Message},
};

impl Mountgroup {
	/// Re-evaluates the recovery state machine. Only meaningful between
	/// barrier cycles; the caller guarantees the change queue is empty.
	pub(crate) fn apply_recovery(&mut self, actions: &mut Vec<Action>) {
		if self.started_count == 0 {
			return;
		}

		if self.first_recovery_needed {
			// the elected master alone recovers all journals as part of
			// its own mount; everyone else waits for its broadcast
			if self.first_recovery_master == self.nodeid
				&& !self.mount_client_notified
			{
				self.mount_client_notified = true;
				actions.push(Action::NotifyMountClient(MountAssignment {
					jid: self.our_jid,
					first: true,
				}));
				tracing::info!(
					group = %self.name,
					jid = ?self.our_jid,
					"mounting as first mounter",
				);
			}
			return;
		}

		// hand the waiting mount helper its journal once one is assigned
		if !self.mount_client_notified
			&& (self.our_jid.is_some() || self.spectator)
		{
			self.mount_client_notified = true;
			actions.push(Action::NotifyMountClient(MountAssignment {
				jid: self.our_jid,
				first: false,
			}));
		}

		// per-journal recovery needs a healthy mounted instance, and the
		// kernel tracks only one outstanding recovery at a time
		if self.kernel_mount_done
			&& self.kernel_mount_error == 0
			&& self.local_recovery_busy.is_none()
		{
			let next = self
				.journals
				.values()
				.filter(|j| j.needs_recovery && !j.local_recovery_done)
				.map(|j| j.jid)
				.min();

			if let Some(jid) = next {
				self.local_recovery_busy = Some(jid);
				if let Some(journal) = self.journals.get_mut(&jid) {
					journal.local_recovery_busy = true;
				}
				tracing::info!(group = %self.name, jid, "recovering journal");
				actions.push(Action::KernelRecover(jid));
				return;
			}
		}

		if self.journals.values().any(|j| j.needs_recovery) {
			// recovery still pending, here or on a peer; stay blocked
			return;
		}

		if self.kernel_stopped {
			self.kernel_stopped = false;
			actions.push(Action::KernelStart);
			tracing::info!(group = %self.name, "unblocked kernel instance");
		}
	}

	/// The kernel finished the recovery we requested. Convergence happens
	/// through the broadcast echo, not here.
	pub(crate) fn on_kernel_recovery_done(
		&mut self,
		jid: u32,
		success: bool,
		actions: &mut Vec<Action>,
	) {
		if self.local_recovery_busy != Some(jid) {
			tracing::warn!(
				group = %self.name,
				jid,
				"kernel reported recovery of a journal we did not request",
			);
			return;
		}
		self.local_recovery_busy = None;

		if let Some(journal) = self.journals.get_mut(&jid) {
			journal.local_recovery_busy = false;
			journal.local_recovery_done = true;
			journal.local_recovery_result = Some(success);
		}

		tracing::info!(group = %self.name, jid, success, "journal recovery finished");
		actions.push(Action::Broadcast(Message::RecoveryResult {
			jid,
			success,
		}));
	}

	/// The kernel reported completion of first-mount recovery. Only the
	/// master tells the group; everyone else learns it from the
	/// broadcast.
	pub(crate) fn on_kernel_first_done(&mut self, actions: &mut Vec<Action>) {
		if self.first_recovery_needed
			&& self.first_recovery_master == self.nodeid
			&& !self.first_done_broadcast
		{
			self.first_done_broadcast = true;
			tracing::info!(group = %self.name, "first mount recovery done");
			actions.push(Action::Broadcast(Message::FirstRecoveryDone));
		}
	}

	pub(crate) fn receive_first_recovery_done(&mut self, from: NodeId) {
		// sticky: authoritative over any snapshot in a later barrier
		self.first_recovery_msg_seen = true;

		if !self.changes.is_empty() {
			// mid-barrier; the state synchronizer applies it
			return;
		}

		if self.first_recovery_needed {
			self.first_recovery_needed = false;
			self.first_recovery_master = 0;
			tracing::info!(
				group = %self.name,
				from,
				"first mount recovery complete",
			);
		}
	}

	pub(crate) fn receive_recovery_result(
		&mut self,
		from: NodeId,
		jid: u32,
		success: bool,
	) {
		if !self.changes.is_empty() {
			self.saved.push((from, Message::RecoveryResult { jid, success }));
			return;
		}
		self.apply_recovery_result(from, jid, success);
	}

	/// Applies a recovery result to the journal table. Idempotent.
	pub(crate) fn apply_recovery_result(
		&mut self,
		from: NodeId,
		jid: u32,
		success: bool,
	) {
		let Some(journal) = self.journals.get_mut(&jid) else {
			// already resolved, or never known here; either way a no-op
			tracing::trace!(
				group = %self.name,
				from,
				jid,
				"recovery result for unknown journal",
			);
			return;
		};

		if !journal.needs_recovery {
			return;
		}

		if !success {
			journal.failed_recovery_count += 1;
			tracing::warn!(
				group = %self.name,
				from,
				jid,
				attempts = journal.failed_recovery_count,
				"journal recovery failed, will retry",
			);
			return;
		}

		journal.needs_recovery = false;
		let owner = journal.owner;
		tracing::info!(group = %self.name, from, jid, "journal recovered");

		// the slot is released once replay is done and its owner no longer
		// holds it; an owner that rejoined was handed a fresh journal and
		// does not keep this one
		let owner_holds_slot = owner
			.and_then(|o| self.nodes.get(&o))
			.is_some_and(|n| n.is_member() && n.jid == Some(jid));
		if !owner_holds_slot {
			self.journals.remove(&jid);
			if let Some(owner) = owner
				&& let Some(node) = self.nodes.get_mut(&owner)
				&& node.jid == Some(jid)
			{
				node.jid = None;
			}
		}
	}
}
