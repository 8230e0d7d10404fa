use {
	super::{inspect, run},
	clap::{ArgAction, Parser, Subcommand},
};

#[derive(Parser, Debug)]
#[command(name = "cohortd", about = "Shared-disk mount coordination daemon", version)]
pub struct CliOpts {
	/// Logging verbosity level (-v, -vv, -vvv)
	#[clap(short, long, action = ArgAction::Count, global = true)]
	pub verbose: u8,

	/// Commands
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Run the coordination daemon
	Run(run::Command),
	/// Inspect a running daemon's mountgroups
	Inspect(inspect::Command),
}

impl CliOpts {
	pub async fn run(&self) -> anyhow::Result<()> {
		match &self.command {
			Command::Run(cmd) => cmd.execute(self).await,
			Command::Inspect(cmd) => cmd.execute(self).await,
		}
	}
}
