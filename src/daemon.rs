//! The daemon dispatch loop.
//!
//! One loop per process services, in strict arrival order, group
//! transport deliveries and membership events, kernel completion
//! polling, lock-manager query results and control-socket requests. All
//! mountgroup state is owned by this loop; no locking, no blocking
//! waits. Raw bytes are decoded at this boundary and typed events are
//! fed into the per-group state machines; the IO each machine asks for
//! comes back as actions and is performed here.

use {
	crate::{
		Error,
		config::Config,
		dlm::{DlmResult, LockManager},
		group::{Action, Event, Mountgroup},
		ipc::{GroupSummary, IpcRequest, NodeSummary, Request, Response},
		kernel::KernelFs,
		registry::Registry,
		transport::{GroupEvent, NodeId, Transport},
		wire::Message,
	},
	bytes::Bytes,
	rand::Rng,
	std::collections::{BTreeMap, BTreeSet, VecDeque},
	tokio::sync::{mpsc::UnboundedReceiver, oneshot},
	tokio_util::sync::CancellationToken,
};

pub struct Daemon<T, K, L>
where
	T: Transport,
	K: KernelFs,
	L: LockManager,
{
	config: Config,
	nodeid: NodeId,
	transport: T,
	kernel: K,
	dlm: L,
	registry: Registry,

	group_events: UnboundedReceiver<(String, GroupEvent)>,
	dlm_results: UnboundedReceiver<DlmResult>,
	requests: UnboundedReceiver<IpcRequest>,

	/// Join replies held until the barrier assigns a journal.
	pending_mounts: BTreeMap<String, oneshot::Sender<Response>>,
	/// Remount replies held while a barrier is in progress.
	pending_remounts: BTreeMap<String, Vec<oneshot::Sender<Response>>>,
	/// Leave replies held until the confirming membership event.
	pending_leaves: BTreeMap<String, Vec<oneshot::Sender<Response>>>,

	/// Refused broadcasts, retried on the tick. A dropped start message
	/// would stall the barrier for the whole group.
	retry_broadcasts: VecDeque<(String, Bytes)>,

	/// Negative lock-manager answers, reissued on the tick instead of
	/// immediately so an out-of-date lock manager is not hammered.
	deferred_dlm: Vec<(String, NodeId)>,

	/// Filesystems with an outstanding kernel recovery request.
	poll_recovery: BTreeSet<String>,
	/// Filesystems where the local node is the first mounter and
	/// first-mount recovery completion is awaited.
	poll_first_done: BTreeSet<String>,

	cancel: CancellationToken,
}

impl<T, K, L> Daemon<T, K, L>
where
	T: Transport,
	K: KernelFs,
	L: LockManager,
{
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		config: Config,
		nodeid: NodeId,
		transport: T,
		group_events: UnboundedReceiver<(String, GroupEvent)>,
		kernel: K,
		dlm: L,
		dlm_results: UnboundedReceiver<DlmResult>,
		requests: UnboundedReceiver<IpcRequest>,
		cancel: CancellationToken,
	) -> Self {
		Self {
			config,
			nodeid,
			transport,
			kernel,
			dlm,
			registry: Registry::new(),
			group_events,
			dlm_results,
			requests,
			pending_mounts: BTreeMap::new(),
			pending_remounts: BTreeMap::new(),
			pending_leaves: BTreeMap::new(),
			retry_broadcasts: VecDeque::new(),
			deferred_dlm: Vec::new(),
			poll_recovery: BTreeSet::new(),
			poll_first_done: BTreeSet::new(),
			cancel,
		}
	}

	pub async fn run(mut self) -> Result<(), Error> {
		// jitter the retry cadence so members of the same group do not
		// hammer their local services in lockstep
		let jitter = rand::rng()
			.random_range(core::time::Duration::ZERO..=self.config.retry_jitter);
		let mut kernel_tick =
			tokio::time::interval(self.config.kernel_poll_interval);
		let mut dlm_tick =
			tokio::time::interval(self.config.dlm_retry_interval + jitter);
		let mut broadcast_tick =
			tokio::time::interval(self.config.broadcast_retry_interval + jitter);

		tracing::info!(nodeid = self.nodeid, "dispatch loop running");

		loop {
			tokio::select! {
				() = self.cancel.cancelled() => {
					tracing::info!("dispatch loop terminating");
					break;
				}

				event = self.group_events.recv() => {
					match event {
						Some((group, event)) => {
							self.on_group_event(&group, event);
						}
						// the transport connection is gone; continuing
						// would desynchronize us from the group
						None => return Err(Error::DispatchTerminated),
					}
				}

				Some(result) = self.dlm_results.recv() => {
					self.on_dlm_answer(result);
				}

				Some(request) = self.requests.recv() => {
					self.on_request(request);
				}

				_ = kernel_tick.tick() => self.poll_kernel(),
				_ = dlm_tick.tick() => self.retry_dlm(),
				_ = broadcast_tick.tick() => self.flush_broadcast_retries(),
			}
		}

		Ok(())
	}

	fn group_name(&self, fsname: &str) -> String {
		format!("{}{fsname}", self.config.group_prefix)
	}
}

// Event handlers
impl<T, K, L> Daemon<T, K, L>
where
	T: Transport,
	K: KernelFs,
	L: LockManager,
{
	fn on_group_event(&mut self, group: &str, event: GroupEvent) {
		let Some(fsname) = group.strip_prefix(&self.config.group_prefix) else {
			tracing::warn!(group, "event for group outside our namespace");
			return;
		};
		let fsname = fsname.to_string();

		let event = match event {
			GroupEvent::Membership { members, joined, left } => {
				Event::Membership { members, joined, left }
			}
			GroupEvent::Message { nodeid, payload } => {
				match Message::decode(&payload) {
					Ok((header, message)) => {
						let expected = self
							.registry
							.get(&fsname)
							.map(Mountgroup::global_id);
						if expected.is_some_and(|id| id != header.global_id) {
							// diagnostic only; the transport routed it here
							tracing::warn!(
								group = %fsname,
								nodeid,
								header_id = header.global_id,
								"message carries unexpected global id",
							);
						}
						Event::Message { nodeid, message }
					}
					Err(error) => {
						tracing::warn!(
							group = %fsname,
							nodeid,
							%error,
							"discarding undecodable message",
						);
						return;
					}
				}
			}
		};

		self.dispatch(&fsname, event);
	}

	fn on_dlm_answer(&mut self, result: DlmResult) {
		if result.observed {
			self.dispatch(&result.fsname.clone(), Event::DlmResult {
				nodeid: result.nodeid,
				observed: true,
			});
		} else {
			// reissue on the tick, not immediately
			self.deferred_dlm.push((result.fsname, result.nodeid));
		}
	}

	fn poll_kernel(&mut self) {
		for fsname in self.poll_recovery.clone() {
			match self.kernel.recovery_status(&fsname) {
				Ok(Some(status)) => {
					self.poll_recovery.remove(&fsname);
					self.dispatch(&fsname, Event::KernelRecoveryDone {
						jid: status.jid,
						success: status.success,
					});
				}
				Ok(None) => {}
				Err(error) => {
					tracing::warn!(
						group = %fsname,
						%error,
						"cannot poll recovery status",
					);
				}
			}
		}

		for fsname in self.poll_first_done.clone() {
			if !self.kernel.instance_exists(&fsname) {
				continue; // mount(2) has not created the instance yet
			}
			match self.kernel.first_done(&fsname) {
				Ok(true) => {
					self.poll_first_done.remove(&fsname);
					self.dispatch(&fsname, Event::KernelFirstDone);
				}
				Ok(false) => {}
				Err(error) => {
					tracing::warn!(
						group = %fsname,
						%error,
						"cannot poll first mount recovery",
					);
				}
			}
		}
	}

	fn retry_dlm(&mut self) {
		for (fsname, nodeid) in std::mem::take(&mut self.deferred_dlm) {
			self.dispatch(&fsname, Event::DlmResult { nodeid, observed: false });
		}
	}

	fn flush_broadcast_retries(&mut self) {
		let mut unsent = VecDeque::new();
		while let Some((group, payload)) = self.retry_broadcasts.pop_front() {
			if self.transport.broadcast(&group, payload.clone()).is_err() {
				unsent.push_back((group, payload));
			}
		}
		self.retry_broadcasts = unsent;
	}

	/// Feeds one event into a mountgroup and performs the IO it asks
	/// for.
	fn dispatch(&mut self, fsname: &str, event: Event) {
		let Some(group) = self.registry.get_mut(fsname) else {
			tracing::debug!(group = %fsname, "event for unknown mountgroup");
			return;
		};

		let mut actions = Vec::new();
		group.on_event(event, &mut actions);
		self.perform(fsname, actions);
		self.flush_remounts(fsname);
	}

	fn perform(&mut self, fsname: &str, actions: Vec<Action>) {
		for action in actions {
			match action {
				Action::Broadcast(message) => {
					let Some(global_id) =
						self.registry.get(fsname).map(Mountgroup::global_id)
					else {
						continue;
					};
					let payload = message.encode(self.nodeid, global_id);
					let group = self.group_name(fsname);
					if let Err(error) =
						self.transport.broadcast(&group, payload.clone())
					{
						tracing::warn!(
							group = %fsname,
							%error,
							"broadcast refused, queued for retry",
						);
						self.retry_broadcasts.push_back((group, payload));
					}
				}

				Action::KernelStop => self.kernel_block(fsname, true),
				Action::KernelStart => self.kernel_block(fsname, false),

				Action::KernelRecover(jid) => {
					match self.kernel.request_recovery(fsname, jid) {
						Ok(()) => {
							self.poll_recovery.insert(fsname.to_string());
						}
						Err(error) => {
							tracing::warn!(
								group = %fsname,
								jid,
								%error,
								"kernel recovery request failed",
							);
							// report the failure so the group converges
							// and retries on a later cycle
							self.dispatch(fsname, Event::KernelRecoveryDone {
								jid,
								success: false,
							});
						}
					}
				}

				Action::DlmQuery(nodeid) => {
					if let Err(error) =
						self.dlm.query_failure_observed(fsname, nodeid)
					{
						tracing::warn!(
							group = %fsname,
							nodeid,
							%error,
							"lock manager query failed, will retry",
						);
						self.deferred_dlm.push((fsname.to_string(), nodeid));
					}
				}

				Action::NotifyMountClient(assignment) => {
					if assignment.first {
						self.poll_first_done.insert(fsname.to_string());
					}
					if let Some(reply) = self.pending_mounts.remove(fsname) {
						let _ = reply.send(Response::Mount(assignment));
					} else {
						tracing::warn!(
							group = %fsname,
							"journal assigned but no mount client waiting",
						);
					}
				}

				Action::Teardown => self.teardown(fsname),
			}
		}
	}

	fn kernel_block(&mut self, fsname: &str, blocked: bool) {
		if let Err(error) = self.kernel.set_blocked(fsname, blocked) {
			// cannot reach the local instance at all: participating any
			// further would risk acting on partial state
			tracing::error!(
				group = %fsname,
				%error,
				"cannot reach kernel instance, withdrawing",
			);
			self.withdraw(fsname);
		}
	}

	fn withdraw(&mut self, fsname: &str) {
		if let Some(group) = self.registry.get_mut(fsname) {
			group.begin_leave();
		}
		let group = self.group_name(fsname);
		if let Err(error) = self.transport.leave(&group) {
			tracing::warn!(group = %fsname, %error, "leave request failed");
			self.teardown(fsname);
		}
	}

	fn teardown(&mut self, fsname: &str) {
		self.registry.remove(fsname);
		self.poll_recovery.remove(fsname);
		self.poll_first_done.remove(fsname);

		if let Some(replies) = self.pending_leaves.remove(fsname) {
			for reply in replies {
				let _ = reply.send(Response::Ok);
			}
		}
		if let Some(reply) = self.pending_mounts.remove(fsname) {
			let _ = reply.send(Response::Error {
				message: format!("mountgroup {fsname} torn down"),
			});
		}
		if let Some(replies) = self.pending_remounts.remove(fsname) {
			for reply in replies {
				let _ = reply.send(Response::Error {
					message: format!("mountgroup {fsname} torn down"),
				});
			}
		}

		tracing::info!(group = %fsname, "mountgroup removed");
	}

	/// Remount requests are delayed while a barrier is in progress and
	/// answered as soon as the queue drains.
	fn flush_remounts(&mut self, fsname: &str) {
		let settled = self
			.registry
			.get(fsname)
			.is_some_and(|g| !g.has_pending_changes());
		if settled && let Some(replies) = self.pending_remounts.remove(fsname) {
			for reply in replies {
				let _ = reply.send(Response::Ok);
			}
		}
	}
}

// Control socket requests
impl<T, K, L> Daemon<T, K, L>
where
	T: Transport,
	K: KernelFs,
	L: LockManager,
{
	fn on_request(&mut self, IpcRequest { request, reply }: IpcRequest) {
		match request {
			Request::Join { fsname, options } => {
				self.on_join(fsname, options, reply);
			}

			Request::Remount { fsname, ro } => {
				let Some(group) = self.registry.get_mut(&fsname) else {
					let _ = reply.send(not_mounted(&fsname));
					return;
				};
				group.set_readonly(ro);
				if group.has_pending_changes() {
					self.pending_remounts.entry(fsname).or_default().push(reply);
				} else {
					let _ = reply.send(Response::Ok);
				}
			}

			Request::MountDone { fsname, error } => {
				if !self.registry.contains(&fsname) {
					let _ = reply.send(not_mounted(&fsname));
					return;
				}
				self.dispatch(&fsname, Event::MountDone { error });
				let _ = reply.send(Response::Ok);
			}

			Request::Leave { fsname } => {
				let Some(group) = self.registry.get_mut(&fsname) else {
					let _ = reply.send(not_mounted(&fsname));
					return;
				};
				group.begin_leave();
				let group = self.group_name(&fsname);
				match self.transport.leave(&group) {
					Ok(()) => {
						self.pending_leaves.entry(fsname).or_default().push(reply);
					}
					Err(error) => {
						let _ = reply.send(Response::Error {
							message: error.to_string(),
						});
					}
				}
			}

			Request::ListGroups => {
				let groups =
					self.registry.iter().map(group_summary).collect();
				let _ = reply.send(Response::Groups(groups));
			}

			Request::ListNodes { fsname } => {
				let Some(group) = self.registry.get(&fsname) else {
					let _ = reply.send(not_mounted(&fsname));
					return;
				};
				let nodes = group
					.nodes()
					.map(|node| NodeSummary {
						nodeid: node.nodeid,
						jid: node.jid,
						member: node.is_member(),
						ro: node.ro,
						spectator: node.spectator,
						kernel_mount_done: node.kernel_mount_done,
						kernel_mount_error: node.kernel_mount_error,
						check_dlm: node.check_dlm,
					})
					.collect();
				let _ = reply.send(Response::Nodes(nodes));
			}
		}
	}

	fn on_join(
		&mut self,
		fsname: String,
		options: crate::group::MountOptions,
		reply: oneshot::Sender<Response>,
	) {
		let group = Mountgroup::new(
			&fsname,
			&self.config.group_prefix,
			self.nodeid,
			options,
		);
		if self.registry.insert(group).is_err() {
			let _ = reply.send(Response::Error {
				message: Error::AlreadyJoined(fsname).to_string(),
			});
			return;
		}

		if let Err(error) = self.dlm.register(&fsname) {
			tracing::warn!(group = %fsname, %error, "lock manager register failed");
		}

		let transport_group = self.group_name(&fsname);
		if let Err(error) = self.transport.join(&transport_group) {
			self.registry.remove(&fsname);
			let _ = reply.send(Response::Error { message: error.to_string() });
			return;
		}

		tracing::info!(group = %fsname, "joining mountgroup");
		self.pending_mounts.insert(fsname, reply);
	}
}

fn not_mounted(fsname: &str) -> Response {
	Response::Error {
		message: Error::UnknownMountgroup(fsname.to_string()).to_string(),
	}
}

fn group_summary(group: &Mountgroup) -> GroupSummary {
	GroupSummary {
		name: group.name().to_string(),
		global_id: group.global_id(),
		our_jid: group.our_jid(),
		started_count: group.started_count(),
		first_recovery_needed: group.first_recovery_needed(),
		first_recovery_master: group.first_recovery_master(),
		kernel_stopped: group.kernel_stopped(),
		pending: group
			.pending_changes()
			.map(|c| (c.seq, c.member_count, c.state.to_string()))
			.collect(),
		completed: group.started_change().map(|s| {
			(s.seq, s.member_count, s.joined_count, s.remove_count, s.failed_count)
		}),
	}
}
