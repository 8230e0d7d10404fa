//! CLI command to inspect a running daemon's mountgroups.
//!
//! Connects to the daemon's control socket and prints either all
//! mountgroups with their change summaries or the node table of one
//! mountgroup.

use {
	super::args::CliOpts,
	clap::Args,
	cohort::ipc::{IpcClient, Request, Response},
	std::path::PathBuf,
};

#[derive(Args, Debug)]
pub struct Command {
	/// Control socket path
	#[clap(long, default_value = "/run/cohortd.sock")]
	pub socket: PathBuf,

	/// Show the node table of this filesystem instead of all groups
	#[clap(name = "fsname")]
	pub fsname: Option<String>,
}

impl Command {
	pub async fn execute(&self, _opts: &CliOpts) -> anyhow::Result<()> {
		let mut client = IpcClient::connect(&self.socket).await?;

		match &self.fsname {
			None => {
				let response = client.request(&Request::ListGroups).await?;
				let Response::Groups(groups) = response else {
					anyhow::bail!("unexpected response: {response:?}");
				};

				if groups.is_empty() {
					println!("no mountgroups");
					return Ok(());
				}

				for group in groups {
					println!("{} id {:08x}", group.name, group.global_id);
					println!(
						"  jid {} started {} blocked {}",
						group
							.our_jid
							.map_or_else(|| "-".to_string(), |j| j.to_string()),
						group.started_count,
						group.kernel_stopped,
					);
					if group.first_recovery_needed {
						println!(
							"  first mount recovery pending, master {}",
							group.first_recovery_master,
						);
					}
					if let Some((seq, members, joined, removed, failed)) =
						group.completed
					{
						println!(
							"  change {seq} members {members} joined {joined} \
							 removed {removed} failed {failed}",
						);
					}
					for (seq, members, state) in group.pending {
						println!("  pending {seq} members {members} {state}");
					}
					println!();
				}
			}

			Some(fsname) => {
				let request = Request::ListNodes { fsname: fsname.clone() };
				let response = client.request(&request).await?;
				let Response::Nodes(nodes) = response else {
					anyhow::bail!("unexpected response: {response:?}");
				};

				for node in nodes {
					let mode = if node.spectator {
						"spectator"
					} else if node.ro {
						"ro"
					} else {
						"rw"
					};
					println!(
						"node {} jid {} member {} mode {} mounted {} error {} \
						 check_dlm {}",
						node.nodeid,
						node
							.jid
							.map_or_else(|| "-".to_string(), |j| j.to_string()),
						node.member,
						mode,
						node.kernel_mount_done,
						node.kernel_mount_error,
						node.check_dlm,
					);
				}
			}
		}

		Ok(())
	}
}
