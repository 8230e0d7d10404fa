//! State synchronizer: merges the per-member start snapshots of a
//! completed barrier into one converged state. Runs exactly once per
//! completed barrier, on every member, over identical inputs — so every
//! member computes identical journal assignments, the same first-mount
//! recovery verdict and the same master.

use {
	super::{Journal, Mountgroup, NodeInfo, StartView, lowest_unused_jid},
	crate::{transport::NodeId, wire::Message},
};

/// One member's contribution to the merge.
struct MemberView {
	nodeid: NodeId,
	start: StartView,
}

impl MemberView {
	fn is_old(&self) -> bool {
		self.start.info.started_count > 0
	}
}

impl Mountgroup {
	pub(crate) fn sync_state(&mut self) {
		let views: Vec<MemberView> = self
			.changes
			.back()
			.expect("barrier complete")
			.members
			.iter()
			.map(|m| MemberView {
				nodeid: m.nodeid,
				start: m.start.clone().expect("every member started"),
			})
			.collect();

		self.resolve_first_recovery(&views);

		// recovery attempt state is per-cycle; journals that failed to
		// recover become eligible again now. A request still outstanding
		// at the kernel stays busy across the cycle: the kernel reports a
		// single recovery result at a time and attributes it to the most
		// recent request, so a second request would misattribute the first
		// journal's completion
		let busy = self.local_recovery_busy;
		for journal in self.journals.values_mut() {
			if busy != Some(journal.jid) {
				journal.reset_cycle();
			}
		}

		// a node with no completed barrier of its own adopts an old
		// member's snapshot as the authoritative base; with no old member
		// anywhere this is a bootstrap and there is nothing to adopt
		if self.started_count == 0
			&& let Some(base) = views
				.iter()
				.filter(|v| v.is_old())
				.min_by_key(|v| v.nodeid)
		{
			self.adopt_base_snapshot(base);
		}

		// learn journals awaiting recovery from peers; this also covers
		// failures in the very change that added us
		for view in &views {
			for snap in &view.start.snapshots {
				if snap.needs_recovery()
					&& let Some(jid) = snap.jid
				{
					let owner = (snap.nodeid != 0).then_some(snap.nodeid);
					let journal = self
						.journals
						.entry(jid)
						.or_insert_with(|| Journal::new(jid, owner));
					journal.needs_recovery = true;
				}
			}
		}

		self.assign_journals(&views);

		// replay messages buffered mid-barrier, exactly once, now that
		// state exists to apply them to
		for (from, message) in std::mem::take(&mut self.saved) {
			match message {
				Message::MountDone { error } => {
					self.apply_mount_done(from, error);
				}
				Message::RecoveryResult { jid, success } => {
					self.apply_recovery_result(from, jid, success);
				}
				other => {
					tracing::debug!(
						group = %self.name,
						kind = %other.kind(),
						"dropping unexpected buffered message",
					);
				}
			}
		}
	}

	/// Decides (or re-confirms) whether the group is in first-mount
	/// recovery mode and who its master is.
	///
	/// A first-recovery-done message observed at any point is
	/// authoritative over anything a snapshot says: snapshots may have
	/// been produced before or after that message and are not mutually
	/// consistent on this point.
	fn resolve_first_recovery(&mut self, views: &[MemberView]) {
		if self.first_recovery_msg_seen {
			if self.first_recovery_needed {
				tracing::info!(group = %self.name, "first mount recovery complete");
			}
			self.first_recovery_needed = false;
			self.first_recovery_master = 0;
			return;
		}

		if views.iter().all(|v| !v.is_old()) {
			// nobody has completed a barrier: the filesystem is being
			// mounted for the first time
			self.first_recovery_needed = true;
			self.first_recovery_master =
				views.iter().map(|v| v.nodeid).min().unwrap_or(0);
			tracing::info!(
				group = %self.name,
				master = self.first_recovery_master,
				"bootstrap, first mount recovery needed",
			);
			return;
		}

		let mut needed = false;
		let mut master: Option<NodeId> = None;
		for view in views.iter().filter(|v| v.is_old()) {
			if !view.start.info.first_recovery_needed {
				continue;
			}
			needed = true;
			let reported = view.start.info.first_recovery_master;
			match master {
				None => master = Some(reported),
				Some(prev) if prev != reported => {
					// masters must agree; converge on the lowest so every
					// member still ends up with identical state
					tracing::warn!(
						group = %self.name,
						from = view.nodeid,
						prev,
						reported,
						"old members disagree on first recovery master",
					);
					master = Some(prev.min(reported));
				}
				Some(_) => {}
			}
		}

		// a failed master stalls the whole group: every other member is
		// waiting on its first-recovery-done broadcast. Re-elect among the
		// surviving members, identically everywhere.
		if needed
			&& let Some(prev) = master
			&& views.iter().all(|v| v.nodeid != prev)
		{
			let elected = views.iter().map(|v| v.nodeid).min().unwrap_or(0);
			tracing::info!(
				group = %self.name,
				prev,
				master = elected,
				"first recovery master is gone, re-elected",
			);
			master = Some(elected);
		}

		self.first_recovery_needed = needed;
		self.first_recovery_master = master.unwrap_or(0);
	}

	/// Reconstructs node history and journal entries from an old member's
	/// snapshot. Only runs while this node has never completed a barrier,
	/// so adopted state cannot clobber anything newer.
	fn adopt_base_snapshot(&mut self, base: &MemberView) {
		tracing::debug!(
			group = %self.name,
			from = base.nodeid,
			"adopting group state",
		);

		for snap in &base.start.snapshots {
			if snap.is_member() {
				let seq = self.change_seq;
				let node = self
					.nodes
					.entry(snap.nodeid)
					.or_insert_with(|| NodeInfo::new(snap.nodeid, seq));
				node.jid = snap.jid;
				node.ro = snap.readonly();
				node.spectator = snap.spectator();
				node.kernel_mount_done = snap.mount_done();
				node.kernel_mount_error = u32::from(snap.mount_error());

				if let Some(jid) = snap.jid {
					self
						.journals
						.entry(jid)
						.or_insert_with(|| Journal::new(jid, Some(snap.nodeid)));
				}
			} else if snap.needs_recovery()
				&& let Some(jid) = snap.jid
			{
				let owner = (snap.nodeid != 0).then_some(snap.nodeid);
				let journal = self
					.journals
					.entry(jid)
					.or_insert_with(|| Journal::new(jid, owner));
				journal.needs_recovery = true;
			}
		}
	}

	/// Assigns the lowest unused journal id to each non-spectator member
	/// that has never completed a barrier, in ascending node id order so
	/// all members agree. Membership in the newest change alone does not
	/// identify the new members: a member that joined in a superseded
	/// change is not in its joined delta, but its own start reports a
	/// zero started count either way. Mount mode comes from the member's
	/// own self-reported start slot.
	fn assign_journals(&mut self, views: &[MemberView]) {
		let mut added: Vec<&MemberView> =
			views.iter().filter(|v| !v.is_old()).collect();
		added.sort_by_key(|v| v.nodeid);

		for view in added {
			let (ro, spectator) = view
				.start
				.snapshots
				.iter()
				.find(|s| s.nodeid == view.nodeid)
				.map(|s| (s.readonly(), s.spectator()))
				.unwrap_or_default();

			let Some(node) = self.nodes.get_mut(&view.nodeid) else {
				continue;
			};
			node.ro = ro;
			node.spectator = spectator;

			if spectator || node.jid.is_some() {
				continue;
			}

			let jid = lowest_unused_jid(&self.journals);
			node.jid = Some(jid);
			self.journals.insert(jid, Journal::new(jid, Some(view.nodeid)));

			if view.nodeid == self.nodeid {
				self.our_jid = Some(jid);
			}

			tracing::info!(
				group = %self.name,
				nodeid = view.nodeid,
				jid,
				"assigned journal",
			);
		}
	}
}
