use {crate::transport::NodeId, std::collections::BTreeMap};

/// One per-member log region of the shared filesystem.
///
/// The `local_*` fields describe this node's own recovery attempt within
/// the current barrier cycle only; they are reset by the state
/// synchronizer at the start of every cycle, except for a journal whose
/// kernel request is still in flight. `needs_recovery` is the replicated
/// fact and is only cleared by a recovery-result broadcast.
#[derive(Debug, Clone)]
pub struct Journal {
	pub jid: u32,

	/// The member the journal is assigned to, `None` once masterless.
	pub owner: Option<NodeId>,

	/// The last owner may have left inconsistent metadata that must be
	/// replayed before the slot can be reused.
	pub needs_recovery: bool,

	pub local_recovery_busy: bool,
	pub local_recovery_done: bool,
	pub local_recovery_result: Option<bool>,
	pub failed_recovery_count: u32,
}

impl Journal {
	pub fn new(jid: u32, owner: Option<NodeId>) -> Self {
		Self {
			jid,
			owner,
			needs_recovery: false,
			local_recovery_busy: false,
			local_recovery_done: false,
			local_recovery_result: None,
			failed_recovery_count: 0,
		}
	}

	/// Clears the per-cycle recovery attempt state. A journal whose
	/// recovery failed becomes eligible for another attempt on the next
	/// cycle, not immediately.
	pub fn reset_cycle(&mut self) {
		self.local_recovery_busy = false;
		self.local_recovery_done = false;
		self.local_recovery_result = None;
	}
}

/// Lowest journal id not currently assigned or awaiting recovery.
pub fn lowest_unused_jid(journals: &BTreeMap<u32, Journal>) -> u32 {
	let mut jid = 0;
	while journals.contains_key(&jid) {
		jid += 1;
	}
	jid
}
