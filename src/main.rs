//! `cohortd`: mount coordination daemon for shared-disk cluster
//! filesystems. One process per cluster node hosts every mountgroup the
//! node participates in.

use {clap::Parser, tracing_subscriber::EnvFilter};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env())
		.with_writer(std::io::stderr)
		.init();

	let opts = cli::CliOpts::parse();
	tracing::debug!(?opts, "parsed command line");

	opts.run().await
}
