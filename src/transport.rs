//! Group transport adapter.
//!
//! Wraps the external virtual-synchrony group service behind the
//! [`Transport`] trait: join/leave a named group and broadcast opaque
//! bytes to it. Inbound traffic arrives as [`GroupEvent`]s on a single
//! dispatch path, in the one property every higher layer leans on: **all
//! members observe the identical relative order of delivered messages and
//! membership events**. That total order substitutes for explicit
//! consensus; nothing above this module votes.
//!
//! [`LoopbackTransport`] is the in-process implementation used by tests
//! and single-node deployments: one bus delivers every broadcast and
//! membership event to all registered endpoints under a single lock, which
//! trivially yields the required total order.

use {
	bytes::Bytes,
	std::{
		collections::BTreeMap,
		sync::{Arc, Mutex},
	},
	tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
};

/// Cluster-wide identifier of one daemon instance.
pub type NodeId = u32;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
	#[error("not a member of group {0}")]
	NotJoined(String),

	#[error("group service refused the request, try again")]
	TryAgain,

	#[error("group service connection lost")]
	Disconnected,
}

/// Why a node disappeared from the membership of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
	/// The node requested to leave.
	Clean,
	/// The cluster declared the node failed.
	Failed,
	/// The daemon process exited while the node stayed up.
	Procdown,
}

impl LeaveReason {
	pub fn is_failure(self) -> bool {
		!matches!(self, Self::Clean)
	}
}

/// One inbound transport callback, tagged with the group it belongs to.
/// Events for all groups are delivered strictly in arrival order on one
/// dispatch path.
#[derive(Debug, Clone)]
pub enum GroupEvent {
	/// A totally-ordered data message broadcast by `nodeid` (possibly our
	/// own broadcast echoed back).
	Message { nodeid: NodeId, payload: Bytes },

	/// The group membership changed. `members` is the complete post-change
	/// membership; `joined` and `left` are the delta.
	Membership {
		members: Vec<NodeId>,
		joined: Vec<NodeId>,
		left: Vec<(NodeId, LeaveReason)>,
	},
}

/// The group service interface consumed by the daemon. Leaving is a
/// one-shot request: the final membership event confirming the local
/// node's departure is still delivered through the event channel before
/// the group is gone.
pub trait Transport: Send {
	/// Joins the named group. The first membership event listing the local
	/// node arrives asynchronously through the event channel.
	fn join(&mut self, group: &str) -> Result<(), TransportError>;

	/// Requests to leave the named group.
	fn leave(&mut self, group: &str) -> Result<(), TransportError>;

	/// Broadcasts `payload` to all members of the named group, ourselves
	/// included, totally ordered relative to all other broadcasts and
	/// membership events in that group.
	fn broadcast(&mut self, group: &str, payload: Bytes)
	-> Result<(), TransportError>;
}

/// In-process virtual-synchrony bus shared by [`LoopbackTransport`]
/// endpoints.
#[derive(Clone, Default)]
pub struct LoopbackBus {
	inner: Arc<Mutex<BusState>>,
}

#[derive(Default)]
struct BusState {
	/// Member lists per group name, in join order.
	groups: BTreeMap<String, Vec<NodeId>>,
	/// Event sinks per registered endpoint.
	endpoints: BTreeMap<NodeId, UnboundedSender<(String, GroupEvent)>>,
}

impl LoopbackBus {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a node on the bus, returning its transport endpoint and
	/// the receiver its group events arrive on.
	pub fn endpoint(
		&self,
		nodeid: NodeId,
	) -> (LoopbackTransport, UnboundedReceiver<(String, GroupEvent)>) {
		let (tx, rx) = unbounded_channel();
		self.inner.lock().expect("bus lock").endpoints.insert(nodeid, tx);
		(LoopbackTransport { nodeid, bus: self.clone() }, rx)
	}

	/// Simulates a node failure: the node is dropped from every group it
	/// is a member of and all surviving members observe the failure.
	pub fn fail(&self, nodeid: NodeId) {
		let mut state = self.inner.lock().expect("bus lock");
		state.endpoints.remove(&nodeid);

		let groups: Vec<String> = state
			.groups
			.iter()
			.filter(|(_, members)| members.contains(&nodeid))
			.map(|(name, _)| name.clone())
			.collect();

		for group in groups {
			state.remove_member(&group, nodeid, LeaveReason::Failed);
		}
	}
}

impl BusState {
	fn deliver(&mut self, group: &str, event: &GroupEvent) {
		let Some(members) = self.groups.get(group) else { return };
		for member in members.clone() {
			if let Some(tx) = self.endpoints.get(&member) {
				let _ = tx.send((group.to_string(), event.clone()));
			}
		}
	}

	fn remove_member(&mut self, group: &str, nodeid: NodeId, reason: LeaveReason) {
		let Some(members) = self.groups.get_mut(group) else { return };
		members.retain(|m| *m != nodeid);
		let mut remaining = members.clone();
		remaining.sort_unstable();

		// the departing node gets the final confirming event too, when its
		// endpoint still exists (voluntary leave)
		if let Some(tx) = self.endpoints.get(&nodeid) {
			let _ = tx.send((
				group.to_string(),
				GroupEvent::Membership {
					members: remaining.clone(),
					joined: vec![],
					left: vec![(nodeid, reason)],
				},
			));
		}

		self.deliver(group, &GroupEvent::Membership {
			members: remaining,
			joined: vec![],
			left: vec![(nodeid, reason)],
		});
	}
}

/// One node's endpoint on a [`LoopbackBus`].
#[derive(Clone)]
pub struct LoopbackTransport {
	nodeid: NodeId,
	bus: LoopbackBus,
}

impl Transport for LoopbackTransport {
	fn join(&mut self, group: &str) -> Result<(), TransportError> {
		let mut state = self.bus.inner.lock().expect("bus lock");
		let members = state.groups.entry(group.to_string()).or_default();
		if !members.contains(&self.nodeid) {
			members.push(self.nodeid);
		}
		let mut all = members.clone();
		all.sort_unstable();

		state.deliver(group, &GroupEvent::Membership {
			members: all,
			joined: vec![self.nodeid],
			left: vec![],
		});
		Ok(())
	}

	fn leave(&mut self, group: &str) -> Result<(), TransportError> {
		let mut state = self.bus.inner.lock().expect("bus lock");
		if !state.groups.get(group).is_some_and(|m| m.contains(&self.nodeid)) {
			return Err(TransportError::NotJoined(group.to_string()));
		}
		state.remove_member(group, self.nodeid, LeaveReason::Clean);
		Ok(())
	}

	fn broadcast(
		&mut self,
		group: &str,
		payload: Bytes,
	) -> Result<(), TransportError> {
		let mut state = self.bus.inner.lock().expect("bus lock");
		if !state.groups.get(group).is_some_and(|m| m.contains(&self.nodeid)) {
			return Err(TransportError::NotJoined(group.to_string()));
		}
		state.deliver(group, &GroupEvent::Message {
			nodeid: self.nodeid,
			payload,
		});
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn drain(
		rx: &mut UnboundedReceiver<(String, GroupEvent)>,
	) -> Vec<(String, GroupEvent)> {
		let mut out = vec![];
		while let Ok(event) = rx.try_recv() {
			out.push(event);
		}
		out
	}

	#[test]
	fn members_observe_identical_order() {
		let bus = LoopbackBus::new();
		let (mut t1, mut rx1) = bus.endpoint(1);
		let (mut t2, mut rx2) = bus.endpoint(2);

		t1.join("g").unwrap();
		t2.join("g").unwrap();
		t1.broadcast("g", Bytes::from_static(b"a")).unwrap();
		t2.broadcast("g", Bytes::from_static(b"b")).unwrap();

		let order = |events: Vec<(String, GroupEvent)>| {
			events
				.into_iter()
				.map(|(_, e)| match e {
					GroupEvent::Message { nodeid, .. } => format!("m{nodeid}"),
					GroupEvent::Membership { joined, left, .. } => {
						format!("c{joined:?}{left:?}")
					}
				})
				.collect::<Vec<_>>()
		};

		// node 1 saw the join of node 2 and both broadcasts in the same
		// relative order node 2 did
		let o1 = order(drain(&mut rx1));
		let o2 = order(drain(&mut rx2));
		assert_eq!(o1.last(), o2.last());
		assert_eq!(o1[o1.len() - 2], o2[o2.len() - 2]);
	}

	#[test]
	fn leave_delivers_final_confirmation() {
		let bus = LoopbackBus::new();
		let (mut t1, mut rx1) = bus.endpoint(1);
		t1.join("g").unwrap();
		t1.leave("g").unwrap();

		let events = drain(&mut rx1);
		let last = events.last().expect("confirming event");
		match &last.1 {
			GroupEvent::Membership { left, .. } => {
				assert_eq!(left, &vec![(1, LeaveReason::Clean)]);
			}
			other => panic!("unexpected event {other:?}"),
		}
	}

	#[test]
	fn broadcast_requires_membership() {
		let bus = LoopbackBus::new();
		let (mut t1, _rx) = bus.endpoint(1);
		assert!(matches!(
			t1.broadcast("g", Bytes::new()),
			Err(TransportError::NotJoined(_)),
		));
	}
}
