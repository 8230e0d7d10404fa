use crate::{
	dlm::DlmError,
	ipc::IpcError,
	kernel::KernelError,
	transport::TransportError,
	wire::WireError,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("wire codec error: {0}")]
	Wire(#[from] WireError),

	#[error("group transport error: {0}")]
	Transport(#[from] TransportError),

	#[error("kernel control interface error: {0}")]
	Kernel(#[from] KernelError),

	#[error("lock manager error: {0}")]
	Dlm(#[from] DlmError),

	#[error("control socket error: {0}")]
	Ipc(#[from] IpcError),

	#[error("unknown mountgroup: {0}")]
	UnknownMountgroup(String),

	#[error("already joined mountgroup: {0}")]
	AlreadyJoined(String),

	#[error("daemon dispatch loop is terminated")]
	DispatchTerminated,
}
