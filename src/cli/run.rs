//! CLI command to run the coordination daemon.
//!
//! Binds the control socket, connects the local services and drives the
//! dispatch loop until interrupted. Without a lock-manager socket a
//! built-in stand-in is used that reports every queried failure as not
//! yet observed, so unblocking waits on the retry tick; that is only
//! suitable for single-node operation.

use {
	super::args::CliOpts,
	clap::Args,
	cohort::{
		config::Config,
		daemon::Daemon,
		dlm::{InMemoryLockManager, LockManager, SocketLockManager},
		ipc::IpcServer,
		kernel::SysfsKernel,
		transport::{LoopbackBus, NodeId},
	},
	std::path::PathBuf,
	tokio_util::sync::CancellationToken,
};

#[derive(Args, Debug)]
pub struct Command {
	/// Cluster node id of this member
	#[clap(short, long)]
	pub nodeid: NodeId,

	/// Control socket path
	#[clap(long)]
	pub socket: Option<PathBuf>,

	/// Root directory of the kernel filesystem control attributes
	#[clap(long)]
	pub sysfs_root: Option<PathBuf>,

	/// Lock manager control socket
	#[clap(long)]
	pub dlm_socket: Option<PathBuf>,
}

impl Command {
	pub async fn execute(&self, _opts: &CliOpts) -> anyhow::Result<()> {
		let mut config = Config::builder();
		if let Some(socket) = &self.socket {
			config = config.with_control_socket(socket.clone());
		}
		if let Some(root) = &self.sysfs_root {
			config = config.with_sysfs_root(root.clone());
		}
		let config = config.build()?;

		let bus = LoopbackBus::new();
		let (transport, group_events) = bus.endpoint(self.nodeid);
		let kernel = SysfsKernel::new(config.sysfs_root.clone());
		let (server, requests) = IpcServer::bind(&config.control_socket)?;

		let cancel = CancellationToken::new();
		let shutdown = cancel.clone();
		tokio::spawn(async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				shutdown.cancel();
			}
		});

		tracing::info!(
			nodeid = self.nodeid,
			socket = %config.control_socket.display(),
			"cohortd starting",
		);

		let result = match &self.dlm_socket {
			Some(path) => {
				let (dlm, dlm_results) = SocketLockManager::connect(path).await?;
				run_daemon(
					config,
					self.nodeid,
					transport,
					group_events,
					kernel,
					dlm,
					dlm_results,
					requests,
					cancel,
				)
				.await
			}
			None => {
				tracing::warn!("no lock manager socket, running standalone");
				let (dlm, dlm_results) = InMemoryLockManager::new();
				run_daemon(
					config,
					self.nodeid,
					transport,
					group_events,
					kernel,
					dlm,
					dlm_results,
					requests,
					cancel,
				)
				.await
			}
		};

		drop(server);
		result
	}
}

#[allow(clippy::too_many_arguments)]
async fn run_daemon<L: LockManager>(
	config: Config,
	nodeid: NodeId,
	transport: cohort::transport::LoopbackTransport,
	group_events: tokio::sync::mpsc::UnboundedReceiver<(
		String,
		cohort::transport::GroupEvent,
	)>,
	kernel: SysfsKernel,
	dlm: L,
	dlm_results: tokio::sync::mpsc::UnboundedReceiver<cohort::dlm::DlmResult>,
	requests: tokio::sync::mpsc::UnboundedReceiver<cohort::ipc::IpcRequest>,
	cancel: CancellationToken,
) -> anyhow::Result<()> {
	Daemon::new(
		config,
		nodeid,
		transport,
		group_events,
		kernel,
		dlm,
		dlm_results,
		requests,
		cancel,
	)
	.run()
	.await?;
	Ok(())
}
