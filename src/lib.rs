//! # Cohort
//!
//! Mount coordination for a shared-disk cluster filesystem: a daemon
//! that sequences mounts, remounts, unmounts and journal recovery
//! across the nodes of a cluster, driven by a totally ordered group
//! transport. Every member runs the same deterministic state machine
//! over the same event sequence, so no member ever has to ask another
//! what it decided.

pub mod config;
pub mod daemon;
pub mod dlm;
mod error;
pub mod group;
pub mod ipc;
pub mod kernel;
pub mod registry;
pub mod transport;
pub mod wire;

pub use {
	config::Config,
	daemon::Daemon,
	error::Error,
	group::{Action, Event, MountAssignment, MountOptions, Mountgroup},
	registry::Registry,
	transport::NodeId,
};
