#![allow(unused)]

//! Deterministic cluster simulation for mountgroup convergence tests.
//!
//! One [`Cluster`] holds the state machines of all simulated daemons and
//! plays the part of every external service: the group transport (a FIFO
//! queue delivering each broadcast and membership event to all members in
//! the same relative order), the kernel control-plane and the lock
//! manager. Broadcasts pass through the real wire codec, so every
//! scenario also exercises encoding and decoding.
//!
//! Everything is synchronous and single-threaded. Mutators only queue
//! deliveries; [`Cluster::run`] drains the queue to quiescence, which
//! lets a test overlap membership events before any start message is
//! processed.

use {
	bytes::Bytes,
	cohort::{
		Action,
		Event,
		MountAssignment,
		MountOptions,
		Mountgroup,
		NodeId,
		transport::LeaveReason,
		wire::Message,
	},
	std::collections::{BTreeMap, BTreeSet, VecDeque},
};

pub const FSNAME: &str = "vol0";
pub const PREFIX: &str = "cohort:";

/// One simulated daemon: its state machine plus the observable side
/// effects of the actions it emitted.
pub struct Sim {
	pub group: Mountgroup,

	/// Kernel instance blocked.
	pub blocked: bool,

	/// Journal recovery requests handed to the kernel and not yet
	/// completed by the test.
	pub recover_requests: Vec<u32>,

	/// What the mount helper was told, once it was told anything.
	pub assignment: Option<MountAssignment>,

	/// Unanswered lock-manager query.
	pub pending_dlm: Option<NodeId>,
}

enum Delivery {
	Message {
		targets: Vec<NodeId>,
		payload: Bytes,
	},
	Membership {
		targets: Vec<NodeId>,
		members: Vec<NodeId>,
		joined: Vec<NodeId>,
		left: Vec<(NodeId, LeaveReason)>,
	},
}

#[derive(Default)]
pub struct Cluster {
	sims: BTreeMap<NodeId, Sim>,
	/// Transport-level membership, in join order.
	members: Vec<NodeId>,
	queue: VecDeque<Delivery>,
	/// Failures the simulated lock manager has observed.
	dlm_observed: BTreeSet<NodeId>,
}

impl Cluster {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn node(&self, nodeid: NodeId) -> &Sim {
		self.sims.get(&nodeid).expect("node exists")
	}

	pub fn try_node(&self, nodeid: NodeId) -> Option<&Sim> {
		self.sims.get(&nodeid)
	}

	pub fn group(&self, nodeid: NodeId) -> &Mountgroup {
		&self.node(nodeid).group
	}

	pub fn assignment(&self, nodeid: NodeId) -> MountAssignment {
		self.node(nodeid).assignment.expect("mount client notified")
	}

	pub fn jid_of(&self, on: NodeId, of: NodeId) -> Option<u32> {
		self
			.group(on)
			.nodes()
			.find(|n| n.nodeid == of)
			.and_then(|n| n.jid)
	}

	/// Queues a membership event adding `nodeid` to the group. Call
	/// [`Cluster::run`] to deliver it.
	pub fn join(&mut self, nodeid: NodeId, options: MountOptions) {
		let sim = Sim {
			group: Mountgroup::new(FSNAME, PREFIX, nodeid, options),
			blocked: false,
			recover_requests: Vec::new(),
			assignment: None,
			pending_dlm: None,
		};
		self.sims.insert(nodeid, sim);
		self.members.push(nodeid);

		let mut members = self.members.clone();
		members.sort_unstable();
		self.queue.push_back(Delivery::Membership {
			targets: self.members.clone(),
			members,
			joined: vec![nodeid],
			left: vec![],
		});
	}

	/// Queues a failure: the node's machine is dropped and the survivors
	/// observe the removal.
	pub fn fail(&mut self, nodeid: NodeId) {
		self.sims.remove(&nodeid);
		self.members.retain(|m| *m != nodeid);

		let mut members = self.members.clone();
		members.sort_unstable();
		self.queue.push_back(Delivery::Membership {
			targets: self.members.clone(),
			members,
			joined: vec![],
			left: vec![(nodeid, LeaveReason::Failed)],
		});
	}

	/// Queues a voluntary leave. The departing node receives the
	/// confirming event too and tears itself down.
	pub fn leave(&mut self, nodeid: NodeId) {
		if let Some(sim) = self.sims.get_mut(&nodeid) {
			sim.group.begin_leave();
		}
		self.members.retain(|m| *m != nodeid);

		let mut members = self.members.clone();
		members.sort_unstable();
		let mut targets = self.members.clone();
		targets.push(nodeid);
		self.queue.push_back(Delivery::Membership {
			targets,
			members,
			joined: vec![],
			left: vec![(nodeid, LeaveReason::Clean)],
		});
	}

	/// The node's mount helper reports its mount(2) result.
	pub fn mount_done(&mut self, nodeid: NodeId, error: u32) {
		self.dispatch(nodeid, Event::MountDone { error });
	}

	/// The node's kernel finishes an outstanding journal recovery.
	pub fn complete_recovery(&mut self, nodeid: NodeId, jid: u32, success: bool) {
		let sim = self.sims.get_mut(&nodeid).expect("node exists");
		let index = sim
			.recover_requests
			.iter()
			.position(|&j| j == jid)
			.expect("recovery was requested");
		sim.recover_requests.remove(index);

		self.dispatch(nodeid, Event::KernelRecoveryDone { jid, success });
	}

	/// The first mounter's kernel reports first-mount recovery complete.
	pub fn finish_first_recovery(&mut self, nodeid: NodeId) {
		self.dispatch(nodeid, Event::KernelFirstDone);
	}

	/// The lock manager observes a node failure; nodes with an unanswered
	/// query for it get their answer.
	pub fn observe_failure(&mut self, failed: NodeId) {
		self.dlm_observed.insert(failed);

		let waiting: Vec<NodeId> = self
			.sims
			.iter()
			.filter(|(_, sim)| sim.pending_dlm == Some(failed))
			.map(|(&nodeid, _)| nodeid)
			.collect();
		for nodeid in waiting {
			self.sims.get_mut(&nodeid).expect("node exists").pending_dlm = None;
			self.dispatch(nodeid, Event::DlmResult {
				nodeid: failed,
				observed: true,
			});
		}
	}

	/// Feeds one event directly into one node's machine, handling the
	/// actions it emits. Deliveries it causes stay queued.
	pub fn dispatch(&mut self, nodeid: NodeId, event: Event) {
		let Some(sim) = self.sims.get_mut(&nodeid) else { return };

		let mut actions = Vec::new();
		sim.group.on_event(event, &mut actions);
		self.handle(nodeid, actions);
	}

	/// Drains the delivery queue to quiescence.
	pub fn run(&mut self) {
		while let Some(delivery) = self.queue.pop_front() {
			match delivery {
				Delivery::Message { targets, payload } => {
					for target in targets {
						let (header, message) =
							Message::decode(&payload).expect("valid frame");
						self.dispatch(target, Event::Message {
							nodeid: header.nodeid,
							message,
						});
					}
				}
				Delivery::Membership { targets, members, joined, left } => {
					for target in targets {
						self.dispatch(target, Event::Membership {
							members: members.clone(),
							joined: joined.clone(),
							left: left.clone(),
						});
					}
				}
			}
		}
	}

	fn handle(&mut self, nodeid: NodeId, actions: Vec<Action>) {
		for action in actions {
			match action {
				Action::Broadcast(message) => {
					let global_id = self.sims[&nodeid].group.global_id();
					let payload = message.encode(nodeid, global_id);
					// delivered to the membership at broadcast time
					self.queue.push_back(Delivery::Message {
						targets: self.members.clone(),
						payload,
					});
				}

				Action::KernelStop => {
					self.sims.get_mut(&nodeid).expect("node exists").blocked =
						true;
				}

				Action::KernelStart => {
					self.sims.get_mut(&nodeid).expect("node exists").blocked =
						false;
				}

				Action::KernelRecover(jid) => {
					self
						.sims
						.get_mut(&nodeid)
						.expect("node exists")
						.recover_requests
						.push(jid);
				}

				Action::DlmQuery(target) => {
					if self.dlm_observed.contains(&target) {
						self.dispatch(nodeid, Event::DlmResult {
							nodeid: target,
							observed: true,
						});
					} else {
						self
							.sims
							.get_mut(&nodeid)
							.expect("node exists")
							.pending_dlm = Some(target);
					}
				}

				Action::NotifyMountClient(assignment) => {
					self
						.sims
						.get_mut(&nodeid)
						.expect("node exists")
						.assignment = Some(assignment);
				}

				Action::Teardown => {
					self.sims.remove(&nodeid);
				}
			}
		}
	}
}

/// Joins a node and completes its whole mount sequence: membership,
/// barrier, journal assignment, mount(2) result. First-mount recovery, if
/// the join bootstraps the group, is finished too.
pub fn mount(cluster: &mut Cluster, nodeid: NodeId) {
	cluster.join(nodeid, MountOptions::default());
	cluster.run();

	let assignment = cluster.assignment(nodeid);
	if assignment.first {
		cluster.finish_first_recovery(nodeid);
		cluster.run();
	}
	cluster.mount_done(nodeid, 0);
	cluster.run();
}
