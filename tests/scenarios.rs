//! End-to-end convergence scenarios over simulated clusters.

mod utils;

use {
	cohort::{
		Event,
		MountAssignment,
		MountOptions,
		wire::{GroupInfo, Message, NodeSnapshot, SNAP_MEMBER},
	},
	utils::{Cluster, mount},
};

#[test]
fn bootstrap_elects_first_mounter() {
	let mut cluster = Cluster::new();
	cluster.join(1, MountOptions::default());
	cluster.run();

	let group = cluster.group(1);
	assert_eq!(group.started_count(), 1);
	assert!(group.first_recovery_needed());
	assert_eq!(group.first_recovery_master(), 1);
	assert_eq!(group.our_jid(), Some(0));

	// the mount helper is told to perform first-mount recovery
	assert_eq!(cluster.assignment(1), MountAssignment {
		jid: Some(0),
		first: true,
	});

	cluster.finish_first_recovery(1);
	cluster.run();
	assert!(!cluster.group(1).first_recovery_needed());

	cluster.mount_done(1, 0);
	cluster.run();
	let node = cluster.group(1).nodes().find(|n| n.nodeid == 1).unwrap();
	assert!(node.kernel_mount_done);
}

#[test]
fn ordinary_join_assigns_next_journal() {
	let mut cluster = Cluster::new();
	mount(&mut cluster, 1);

	cluster.join(2, MountOptions::default());
	cluster.run();

	assert_eq!(cluster.assignment(2), MountAssignment {
		jid: Some(1),
		first: false,
	});

	// the old member's assignment is untouched and both members agree
	assert_eq!(cluster.jid_of(1, 1), Some(0));
	assert_eq!(cluster.jid_of(2, 1), Some(0));
	assert_eq!(cluster.jid_of(1, 2), Some(1));
	assert_eq!(cluster.jid_of(2, 2), Some(1));
	assert!(!cluster.group(1).first_recovery_needed());
	assert!(!cluster.group(2).first_recovery_needed());

	// the barrier blocked and then unblocked the old member's kernel
	assert!(!cluster.node(1).blocked);
	assert_eq!(cluster.group(1).started_count(), 2);
	assert_eq!(cluster.group(2).started_count(), 1);
}

#[test]
fn failed_member_journal_is_recovered() {
	let mut cluster = Cluster::new();
	mount(&mut cluster, 1);
	mount(&mut cluster, 2);

	cluster.fail(2);
	cluster.run();

	// the barrier stalls on the lock manager: the kernel stays blocked
	// until it confirms the failure
	assert!(cluster.node(1).blocked);
	assert_eq!(cluster.node(1).pending_dlm, Some(2));
	assert!(cluster.group(1).has_pending_changes());

	cluster.observe_failure(2);
	cluster.run();

	assert!(!cluster.group(1).has_pending_changes());
	let journal =
		cluster.group(1).journals().find(|j| j.jid == 1).expect("journal 1");
	assert!(journal.needs_recovery);
	assert_eq!(cluster.node(1).recover_requests, vec![1]);
	assert!(cluster.node(1).blocked);

	cluster.complete_recovery(1, 1, true);
	cluster.run();

	// the recovered journal's slot is released with its owner gone
	assert!(cluster.group(1).journals().all(|j| j.jid != 1));
	assert_eq!(cluster.jid_of(1, 2), None);
	assert!(!cluster.node(1).blocked);
}

#[test]
fn in_flight_recovery_survives_a_new_barrier() {
	let mut cluster = Cluster::new();
	mount(&mut cluster, 1);
	mount(&mut cluster, 2);
	mount(&mut cluster, 3);

	cluster.fail(3);
	cluster.observe_failure(3);
	cluster.run();
	assert_eq!(cluster.node(1).recover_requests, vec![2]);

	// a second member dies while node 1's kernel is still replaying
	// journal 2; the new barrier completes around the request in flight
	// and the kernel is never handed an overlapping one
	cluster.fail(2);
	cluster.observe_failure(2);
	cluster.run();
	assert!(!cluster.group(1).has_pending_changes());
	assert_eq!(cluster.node(1).recover_requests, vec![2]);

	// only once the outstanding replay finishes does the next one start
	cluster.complete_recovery(1, 2, true);
	cluster.run();
	assert_eq!(cluster.node(1).recover_requests, vec![1]);

	cluster.complete_recovery(1, 1, true);
	cluster.run();
	assert!(cluster.group(1).journals().all(|j| j.jid == 0));
	assert!(!cluster.node(1).blocked);
}

#[test]
fn superseded_changes_fold_into_one_barrier() {
	let mut cluster = Cluster::new();
	mount(&mut cluster, 1);

	// two joins land before any start message is processed; only the
	// newest change completes its barrier
	cluster.join(2, MountOptions::default());
	cluster.join(3, MountOptions::default());
	cluster.run();

	for nodeid in [1, 2, 3] {
		assert!(!cluster.group(nodeid).has_pending_changes());
		assert_eq!(cluster.jid_of(nodeid, 1), Some(0));
		assert_eq!(cluster.jid_of(nodeid, 2), Some(1));
		assert_eq!(cluster.jid_of(nodeid, 3), Some(2));
	}

	// one cycle completed, with the superseded join folded in
	assert_eq!(cluster.group(1).started_count(), 2);
	let summary = cluster.group(1).started_change().expect("completed change");
	assert_eq!(summary.joined_count, 2);

	assert_eq!(cluster.assignment(2), MountAssignment {
		jid: Some(1),
		first: false,
	});
	assert_eq!(cluster.assignment(3), MountAssignment {
		jid: Some(2),
		first: false,
	});
}

#[test]
fn members_converge_after_failure() {
	let mut cluster = Cluster::new();
	mount(&mut cluster, 1);
	mount(&mut cluster, 2);
	mount(&mut cluster, 3);

	cluster.fail(2);
	cluster.observe_failure(2);
	cluster.run();

	// both survivors attempt the recovery; the first success wins and
	// the loser's late result is a no-op
	cluster.complete_recovery(1, 1, true);
	cluster.run();
	cluster.complete_recovery(3, 1, true);
	cluster.run();

	for nodeid in [1, 3] {
		let group = cluster.group(nodeid);
		assert_eq!(cluster.jid_of(nodeid, 1), Some(0));
		assert_eq!(cluster.jid_of(nodeid, 2), None);
		assert_eq!(cluster.jid_of(nodeid, 3), Some(2));
		assert!(group.journals().all(|j| !j.needs_recovery));
		assert!(!group.first_recovery_needed());
		assert!(!cluster.node(nodeid).blocked);
	}

	let table = |nodeid| {
		cluster
			.group(nodeid)
			.journals()
			.map(|j| (j.jid, j.owner, j.needs_recovery))
			.collect::<Vec<_>>()
	};
	assert_eq!(table(1), table(3));
}

#[test]
fn failed_recovery_is_recorded_and_retried_by_peer() {
	let mut cluster = Cluster::new();
	mount(&mut cluster, 1);
	mount(&mut cluster, 2);
	mount(&mut cluster, 3);

	cluster.fail(3);
	cluster.observe_failure(3);
	cluster.run();

	assert_eq!(cluster.node(1).recover_requests, vec![2]);
	assert_eq!(cluster.node(2).recover_requests, vec![2]);

	// node 1's attempt fails; everyone records the failure and stays
	// blocked, and node 1 does not retry within the same cycle
	cluster.complete_recovery(1, 2, false);
	cluster.run();

	for nodeid in [1, 2] {
		let journal = cluster
			.group(nodeid)
			.journals()
			.find(|j| j.jid == 2)
			.expect("journal 2");
		assert!(journal.needs_recovery);
		assert_eq!(journal.failed_recovery_count, 1);
		assert!(cluster.node(nodeid).blocked);
	}
	assert!(cluster.node(1).recover_requests.is_empty());

	// node 2's attempt succeeds and unblocks both survivors
	cluster.complete_recovery(2, 2, true);
	cluster.run();

	assert!(cluster.group(1).journals().all(|j| j.jid != 2));
	assert!(!cluster.node(1).blocked);
	assert!(!cluster.node(2).blocked);
}

#[test]
fn stale_and_malformed_starts_do_not_mutate_state() {
	let mut cluster = Cluster::new();
	mount(&mut cluster, 1);

	// a join observed by node 1 only, so its barrier stays open while we
	// feed it crafted start messages
	cluster.dispatch(1, Event::Membership {
		members: vec![1, 2],
		joined: vec![2],
		left: vec![],
	});

	let info = |member_count, joined_count| GroupInfo {
		started_count: 0,
		member_count,
		joined_count,
		remove_count: 0,
		failed_count: 0,
		id_count: 2,
		first_recovery_needed: false,
		first_recovery_master: 0,
	};
	let member = |nodeid| NodeSnapshot { nodeid, jid: None, flags: SNAP_MEMBER };

	// counts and membership set match no queued change
	cluster.dispatch(1, Event::Message {
		nodeid: 7,
		message: Message::Start {
			seq: 9,
			info: info(3, 2),
			snapshots: vec![member(1), member(7), member(9)],
		},
	});
	assert!(cluster.group(1).nodes().all(|n| n.nodeid != 7));
	assert_eq!(cluster.group(1).journals().count(), 1);

	// a sender that does not list itself as a member is rejected
	cluster.dispatch(1, Event::Message {
		nodeid: 2,
		message: Message::Start {
			seq: 1,
			info: info(2, 1),
			snapshots: vec![member(1), NodeSnapshot {
				nodeid: 2,
				jid: None,
				flags: 0,
			}],
		},
	});
	let pending_start_received = |cluster: &Cluster| {
		cluster
			.group(1)
			.pending_changes()
			.last()
			.expect("change pending")
			.members
			.iter()
			.find(|m| m.nodeid == 2)
			.expect("member 2")
			.start_received
	};
	assert!(!pending_start_received(&cluster));

	// the well-formed start is recorded and the barrier completes once
	// our own echo arrives
	cluster.dispatch(1, Event::Message {
		nodeid: 2,
		message: Message::Start {
			seq: 1,
			info: info(2, 1),
			snapshots: vec![member(1), member(2)],
		},
	});
	assert!(pending_start_received(&cluster));

	cluster.run();
	assert!(!cluster.group(1).has_pending_changes());
	assert_eq!(cluster.group(1).started_count(), 2);
	assert_eq!(cluster.jid_of(1, 2), Some(1));
}

#[test]
fn added_member_claiming_prior_progress_is_flagged() {
	let mut cluster = Cluster::new();
	mount(&mut cluster, 1);

	// a join observed by node 1 only, so its barrier stays open
	cluster.dispatch(1, Event::Membership {
		members: vec![1, 2],
		joined: vec![2],
		left: vec![],
	});

	// the newcomer's start claims completed barrier cycles of its own
	cluster.dispatch(1, Event::Message {
		nodeid: 2,
		message: Message::Start {
			seq: 1,
			info: GroupInfo {
				started_count: 3,
				member_count: 2,
				joined_count: 1,
				remove_count: 0,
				failed_count: 0,
				id_count: 2,
				first_recovery_needed: false,
				first_recovery_master: 0,
			},
			snapshots: vec![
				NodeSnapshot { nodeid: 1, jid: None, flags: SNAP_MEMBER },
				NodeSnapshot { nodeid: 2, jid: None, flags: SNAP_MEMBER },
			],
		},
	});

	{
		let change = cluster
			.group(1)
			.pending_changes()
			.last()
			.expect("change pending");
		let member = change
			.members
			.iter()
			.find(|m| m.nodeid == 2)
			.expect("member 2");
		assert!(member.disallowed);
		assert!(member.start_received);
	}

	// the barrier still completes once our own start echoes back, and
	// the flagged member is not treated as new
	cluster.run();
	assert!(!cluster.group(1).has_pending_changes());
	assert_eq!(cluster.group(1).started_count(), 2);
	assert_eq!(cluster.jid_of(1, 2), None);
}

#[test]
fn replayed_messages_are_idempotent() {
	let mut cluster = Cluster::new();
	mount(&mut cluster, 1);
	mount(&mut cluster, 2);

	cluster.fail(2);
	cluster.observe_failure(2);
	cluster.run();
	cluster.complete_recovery(1, 1, true);
	cluster.run();

	let started = cluster.group(1).started_count();
	assert!(cluster.group(1).journals().all(|j| j.jid != 1));
	assert!(cluster.group(1).journals().any(|j| j.jid == 0));

	// a second copy of the recovery result changes nothing
	cluster.dispatch(1, Event::Message {
		nodeid: 1,
		message: Message::RecoveryResult { jid: 1, success: true },
	});
	cluster.run();
	assert!(cluster.group(1).journals().all(|j| j.jid != 1));
	assert_eq!(cluster.group(1).started_count(), started);
	assert!(!cluster.node(1).blocked);

	// same for a duplicate mount-done
	cluster.dispatch(1, Event::Message {
		nodeid: 1,
		message: Message::MountDone { error: 0 },
	});
	cluster.run();
	let node = cluster.group(1).nodes().find(|n| n.nodeid == 1).unwrap();
	assert!(node.kernel_mount_done);
	assert_eq!(node.kernel_mount_error, 0);
}

#[test]
fn journal_ids_are_stable_and_freed_slots_refill() {
	let mut cluster = Cluster::new();
	mount(&mut cluster, 1);
	mount(&mut cluster, 2);
	mount(&mut cluster, 3);

	assert_eq!(cluster.jid_of(1, 1), Some(0));
	assert_eq!(cluster.jid_of(1, 2), Some(1));
	assert_eq!(cluster.jid_of(1, 3), Some(2));

	// a clean unmount frees the slot without recovery
	cluster.leave(2);
	cluster.run();
	assert!(cluster.group(1).journals().all(|j| j.jid != 1));
	assert!(!cluster.node(1).blocked);

	// surviving assignments never moved across all those changes
	assert_eq!(cluster.jid_of(1, 1), Some(0));
	assert_eq!(cluster.jid_of(3, 3), Some(2));

	// the next joiner fills the gap
	mount(&mut cluster, 4);
	assert_eq!(cluster.jid_of(1, 4), Some(1));
	assert_eq!(cluster.jid_of(3, 4), Some(1));
}

#[test]
fn rejoined_member_gets_fresh_journal_and_frees_its_old_slot() {
	let mut cluster = Cluster::new();
	mount(&mut cluster, 1);
	mount(&mut cluster, 2);

	cluster.fail(2);
	cluster.observe_failure(2);
	cluster.run();
	assert_eq!(cluster.node(1).recover_requests, vec![1]);

	// the node rejoins before its old journal is recovered and is
	// assigned a fresh one; the outstanding replay is not reissued
	cluster.join(2, MountOptions::default());
	cluster.run();
	assert_eq!(cluster.node(1).recover_requests, vec![1]);
	assert_eq!(cluster.assignment(2), MountAssignment {
		jid: Some(2),
		first: false,
	});
	cluster.mount_done(2, 0);
	cluster.run();

	// recovery of the old journal releases its slot even though the
	// owner is a member again
	cluster.complete_recovery(1, 1, true);
	cluster.run();
	assert!(cluster.group(1).journals().all(|j| j.jid != 1));
	assert!(cluster.group(2).journals().all(|j| j.jid != 1));
	assert_eq!(cluster.jid_of(1, 2), Some(2));
	assert_eq!(cluster.jid_of(2, 2), Some(2));
	assert!(!cluster.node(1).blocked);

	// the freed slot is reusable
	mount(&mut cluster, 4);
	assert_eq!(cluster.jid_of(1, 4), Some(1));
	assert_eq!(cluster.jid_of(2, 4), Some(1));
}

#[test]
fn spectator_mounts_without_journal() {
	let mut cluster = Cluster::new();
	mount(&mut cluster, 1);

	cluster.join(5, MountOptions { ro: false, spectator: true });
	cluster.run();

	assert_eq!(cluster.assignment(5), MountAssignment {
		jid: None,
		first: false,
	});
	assert_eq!(cluster.jid_of(1, 5), None);
	assert_eq!(cluster.group(1).journals().count(), 1);

	cluster.mount_done(5, 0);
	cluster.run();
	let node = cluster.group(1).nodes().find(|n| n.nodeid == 5).unwrap();
	assert!(node.spectator);
	assert!(node.kernel_mount_done);
}

#[test]
fn mount_done_during_barrier_is_buffered_and_replayed() {
	let mut cluster = Cluster::new();
	mount(&mut cluster, 1);
	cluster.join(2, MountOptions::default());
	cluster.run();

	// node 2's mount finishes while the next join's barrier is open, so
	// its broadcast reaches everyone mid-barrier and is buffered
	cluster.join(3, MountOptions::default());
	cluster.mount_done(2, 0);
	cluster.run();

	for nodeid in [1, 2, 3] {
		let group = cluster.group(nodeid);
		assert!(!group.has_pending_changes());
		let node = group.nodes().find(|n| n.nodeid == 2).unwrap();
		assert!(node.kernel_mount_done);
	}
	assert_eq!(cluster.assignment(3), MountAssignment {
		jid: Some(2),
		first: false,
	});
}

#[test]
fn first_recovery_master_failure_reelects_survivor() {
	let mut cluster = Cluster::new();
	cluster.join(1, MountOptions::default());
	cluster.join(2, MountOptions::default());
	cluster.run();

	// both members bootstrapped together; the lowest id is the master
	// and the other member is not told to mount yet
	assert!(cluster.group(2).first_recovery_needed());
	assert_eq!(cluster.group(2).first_recovery_master(), 1);
	assert_eq!(cluster.assignment(1), MountAssignment {
		jid: Some(0),
		first: true,
	});
	assert!(cluster.node(2).assignment.is_none());

	// the master dies before finishing; the survivor is re-elected and
	// mounts as first mounter itself
	cluster.fail(1);
	cluster.run();

	assert!(cluster.group(2).first_recovery_needed());
	assert_eq!(cluster.group(2).first_recovery_master(), 2);
	assert_eq!(cluster.assignment(2), MountAssignment {
		jid: Some(1),
		first: true,
	});

	cluster.finish_first_recovery(2);
	cluster.run();
	assert!(!cluster.group(2).first_recovery_needed());

	// the dead master's journal is still replayed through the normal
	// path once the survivor's mount is up
	cluster.mount_done(2, 0);
	cluster.run();
	assert_eq!(cluster.node(2).recover_requests, vec![0]);
	cluster.complete_recovery(2, 0, true);
	cluster.run();
	assert!(cluster.group(2).journals().all(|j| j.jid != 0));
	assert_eq!(cluster.jid_of(2, 2), Some(1));
}

#[test]
fn voluntary_leave_tears_down_the_departing_node() {
	let mut cluster = Cluster::new();
	mount(&mut cluster, 1);
	mount(&mut cluster, 2);

	cluster.leave(2);
	cluster.run();

	// the departing node's machine destroyed itself on confirmation
	assert!(cluster.try_node(2).is_none());
	assert_eq!(cluster.group(1).started_count(), 3);
	assert!(cluster.group(1).journals().all(|j| j.jid != 1));
	assert!(!cluster.node(1).blocked);
}
