use {core::time::Duration, derive_builder::Builder, std::path::PathBuf};

/// Configuration options for the mount coordination daemon.
#[derive(Builder, Debug, Clone)]
#[builder(pattern = "owned", setter(prefix = "with"), derive(Debug, Clone))]
#[builder_struct_attr(doc(hidden))]
pub struct Config {
	/// The prefix prepended to a mountgroup name to form the transport-level
	/// group name. The group id in the wire header is a checksum of the
	/// prefixed name.
	#[builder(default = "\"cohort:\".to_string()")]
	pub group_prefix: String,

	/// Path of the unix domain socket serving the mount-client and query
	/// protocols.
	#[builder(default = "PathBuf::from(\"/run/cohortd.sock\")")]
	pub control_socket: PathBuf,

	/// Base directory of the kernel filesystem control attributes, one
	/// subdirectory per mounted filesystem instance.
	#[builder(default = "PathBuf::from(\"/sys/fs/cohort\")")]
	pub sysfs_root: PathBuf,

	/// The interval at which the daemon polls the kernel instance for the
	/// result of an outstanding journal recovery request and for first-mount
	/// recovery completion.
	#[builder(default = "Duration::from_millis(200)")]
	pub kernel_poll_interval: Duration,

	/// The interval at which an unanswered lock-manager failure-observation
	/// query is reissued.
	#[builder(default = "Duration::from_millis(500)")]
	pub dlm_retry_interval: Duration,

	/// The maximum jitter added to retry intervals to avoid all members of a
	/// group hammering their local services in lockstep.
	#[builder(default = "Duration::from_millis(100)")]
	pub retry_jitter: Duration,

	/// The interval at which a temporarily refused group broadcast is
	/// retried. A start message that is never delivered stalls the barrier
	/// for the whole group, so refused broadcasts are queued, not dropped.
	#[builder(default = "Duration::from_millis(250)")]
	pub broadcast_retry_interval: Duration,
}

impl Config {
	/// Creates a new config builder with default values.
	pub fn builder() -> ConfigBuilder {
		ConfigBuilder::default()
	}
}

impl Default for Config {
	fn default() -> Self {
		Self::builder().build().expect("all fields have defaults")
	}
}
