//! Kernel filesystem control-plane interface.
//!
//! The kernel side of a mounted instance exposes a small set of control
//! attributes per filesystem: a writable `block` gate (1 stops all
//! activity, 0 resumes), a writable `recover` knob that requests replay of
//! one journal, readable `recover_done`/`recover_status` reporting the
//! most recent recovery request, a readable `first_done` flag set once
//! first-mount recovery completed, and an `id` attribute whose existence
//! probes that the local mount(2) call created the instance.
//!
//! The daemon consumes this behind the [`KernelFs`] trait so the group
//! state machine can be exercised without a kernel; [`InMemoryKernel`] is
//! the test double.

use std::{
	collections::BTreeMap,
	fs,
	io,
	path::PathBuf,
	sync::{Arc, Mutex},
};

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
	#[error("filesystem instance {0} does not exist")]
	NoInstance(String),

	#[error("control attribute {attr} for {fsname}: {source}")]
	Attribute {
		fsname: String,
		attr: &'static str,
		source: io::Error,
	},

	#[error("unparsable value in control attribute {attr}: {value:?}")]
	BadValue { attr: &'static str, value: String },
}

/// Outcome of the most recent journal recovery request, as reported by the
/// kernel. The kernel tracks only a single outstanding recovery, which is
/// why the recovery driver runs one journal at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStatus {
	pub jid: u32,
	pub success: bool,
}

pub trait KernelFs: Send {
	/// Whether the local mount(2) call has created the kernel instance.
	fn instance_exists(&self, fsname: &str) -> bool;

	/// Blocks (`true`) or unblocks (`false`) all activity on the instance.
	fn set_blocked(&mut self, fsname: &str, blocked: bool)
	-> Result<(), KernelError>;

	/// Asks the kernel to replay the given journal. The result is reported
	/// asynchronously through [`KernelFs::recovery_status`].
	fn request_recovery(&mut self, fsname: &str, jid: u32)
	-> Result<(), KernelError>;

	/// Polls the result of the most recent recovery request. `None` while
	/// the request is still in flight.
	fn recovery_status(
		&mut self,
		fsname: &str,
	) -> Result<Option<RecoveryStatus>, KernelError>;

	/// Whether the kernel finished first-mount recovery of all journals.
	fn first_done(&self, fsname: &str) -> Result<bool, KernelError>;
}

/// The real control plane: one directory of attribute files per mounted
/// filesystem instance under the configured sysfs root.
pub struct SysfsKernel {
	root: PathBuf,
	/// jid of the last recovery request per instance, to pair the kernel's
	/// `recover_done` counter with the journal it belongs to.
	requested: BTreeMap<String, u32>,
	/// `recover_done` counter value already consumed per instance.
	acked: BTreeMap<String, u64>,
}

impl SysfsKernel {
	pub fn new(root: PathBuf) -> Self {
		Self {
			root,
			requested: BTreeMap::new(),
			acked: BTreeMap::new(),
		}
	}

	fn attr_path(&self, fsname: &str, attr: &str) -> PathBuf {
		self.root.join(fsname).join(attr)
	}

	fn write_attr(
		&self,
		fsname: &str,
		attr: &'static str,
		value: &str,
	) -> Result<(), KernelError> {
		fs::write(self.attr_path(fsname, attr), value).map_err(|source| {
			KernelError::Attribute { fsname: fsname.to_string(), attr, source }
		})
	}

	fn read_attr(
		&self,
		fsname: &str,
		attr: &'static str,
	) -> Result<String, KernelError> {
		let raw =
			fs::read_to_string(self.attr_path(fsname, attr)).map_err(|source| {
				KernelError::Attribute { fsname: fsname.to_string(), attr, source }
			})?;
		Ok(raw.trim().to_string())
	}

	fn read_u64(
		&self,
		fsname: &str,
		attr: &'static str,
	) -> Result<u64, KernelError> {
		let value = self.read_attr(fsname, attr)?;
		value
			.parse()
			.map_err(|_| KernelError::BadValue { attr, value })
	}
}

impl KernelFs for SysfsKernel {
	fn instance_exists(&self, fsname: &str) -> bool {
		self.attr_path(fsname, "id").exists()
	}

	fn set_blocked(
		&mut self,
		fsname: &str,
		blocked: bool,
	) -> Result<(), KernelError> {
		self.write_attr(fsname, "block", if blocked { "1" } else { "0" })
	}

	fn request_recovery(
		&mut self,
		fsname: &str,
		jid: u32,
	) -> Result<(), KernelError> {
		// remember the current completion counter so the next change of
		// recover_done is attributed to this request
		let done = self.read_u64(fsname, "recover_done").unwrap_or(0);
		self.acked.insert(fsname.to_string(), done);
		self.requested.insert(fsname.to_string(), jid);
		self.write_attr(fsname, "recover", &jid.to_string())
	}

	fn recovery_status(
		&mut self,
		fsname: &str,
	) -> Result<Option<RecoveryStatus>, KernelError> {
		let Some(jid) = self.requested.get(fsname).copied() else {
			return Ok(None);
		};

		let done = self.read_u64(fsname, "recover_done")?;
		if Some(&done) == self.acked.get(fsname) {
			return Ok(None); // still in flight
		}

		let status = self.read_u64(fsname, "recover_status")?;
		self.requested.remove(fsname);
		self.acked.insert(fsname.to_string(), done);
		Ok(Some(RecoveryStatus { jid, success: status == 0 }))
	}

	fn first_done(&self, fsname: &str) -> Result<bool, KernelError> {
		Ok(self.read_u64(fsname, "first_done")? != 0)
	}
}

/// In-memory kernel double used by tests and simulations. Recovery
/// outcomes are scripted with [`InMemoryKernel::complete_recovery`].
#[derive(Clone, Default)]
pub struct InMemoryKernel {
	inner: Arc<Mutex<MemKernelState>>,
}

#[derive(Default)]
struct MemKernelState {
	instances: BTreeMap<String, MemInstance>,
}

#[derive(Default)]
struct MemInstance {
	blocked: bool,
	first_done: bool,
	in_flight: Option<u32>,
	finished: Option<RecoveryStatus>,
}

impl InMemoryKernel {
	pub fn new() -> Self {
		Self::default()
	}

	/// Simulates the local mount(2) call creating the instance.
	pub fn create_instance(&self, fsname: &str) {
		let mut state = self.inner.lock().expect("kernel lock");
		state.instances.entry(fsname.to_string()).or_default();
	}

	/// Simulates the kernel finishing first-mount recovery.
	pub fn finish_first_recovery(&self, fsname: &str) {
		let mut state = self.inner.lock().expect("kernel lock");
		if let Some(instance) = state.instances.get_mut(fsname) {
			instance.first_done = true;
		}
	}

	/// Completes the outstanding recovery request with the given outcome.
	pub fn complete_recovery(&self, fsname: &str, success: bool) {
		let mut state = self.inner.lock().expect("kernel lock");
		if let Some(instance) = state.instances.get_mut(fsname)
			&& let Some(jid) = instance.in_flight.take()
		{
			instance.finished = Some(RecoveryStatus { jid, success });
		}
	}

	pub fn is_blocked(&self, fsname: &str) -> bool {
		let state = self.inner.lock().expect("kernel lock");
		state.instances.get(fsname).is_some_and(|i| i.blocked)
	}

	pub fn pending_recovery(&self, fsname: &str) -> Option<u32> {
		let state = self.inner.lock().expect("kernel lock");
		state.instances.get(fsname).and_then(|i| i.in_flight)
	}
}

impl KernelFs for InMemoryKernel {
	fn instance_exists(&self, fsname: &str) -> bool {
		let state = self.inner.lock().expect("kernel lock");
		state.instances.contains_key(fsname)
	}

	fn set_blocked(
		&mut self,
		fsname: &str,
		blocked: bool,
	) -> Result<(), KernelError> {
		let mut state = self.inner.lock().expect("kernel lock");
		let instance = state
			.instances
			.get_mut(fsname)
			.ok_or_else(|| KernelError::NoInstance(fsname.to_string()))?;
		instance.blocked = blocked;
		Ok(())
	}

	fn request_recovery(
		&mut self,
		fsname: &str,
		jid: u32,
	) -> Result<(), KernelError> {
		let mut state = self.inner.lock().expect("kernel lock");
		let instance = state
			.instances
			.get_mut(fsname)
			.ok_or_else(|| KernelError::NoInstance(fsname.to_string()))?;
		instance.in_flight = Some(jid);
		Ok(())
	}

	fn recovery_status(
		&mut self,
		fsname: &str,
	) -> Result<Option<RecoveryStatus>, KernelError> {
		let mut state = self.inner.lock().expect("kernel lock");
		let instance = state
			.instances
			.get_mut(fsname)
			.ok_or_else(|| KernelError::NoInstance(fsname.to_string()))?;
		Ok(instance.finished.take())
	}

	fn first_done(&self, fsname: &str) -> Result<bool, KernelError> {
		let state = self.inner.lock().expect("kernel lock");
		Ok(state.instances.get(fsname).is_some_and(|i| i.first_done))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn in_memory_recovery_cycle() {
		let mut kernel = InMemoryKernel::new();
		assert!(!kernel.instance_exists("vol0"));

		kernel.create_instance("vol0");
		kernel.set_blocked("vol0", true).unwrap();
		assert!(kernel.is_blocked("vol0"));

		kernel.request_recovery("vol0", 1).unwrap();
		assert_eq!(kernel.recovery_status("vol0").unwrap(), None);

		kernel.complete_recovery("vol0", true);
		assert_eq!(
			kernel.recovery_status("vol0").unwrap(),
			Some(RecoveryStatus { jid: 1, success: true }),
		);

		// result is consumed, not reported twice
		assert_eq!(kernel.recovery_status("vol0").unwrap(), None);
	}

	#[test]
	fn missing_instance_is_an_error() {
		let mut kernel = InMemoryKernel::new();
		assert!(matches!(
			kernel.set_blocked("nope", true),
			Err(KernelError::NoInstance(_)),
		));
	}
}
