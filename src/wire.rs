//! Wire codec for mountgroup coordination messages.
//!
//! Every message shares a fixed-layout header; the start message carries a
//! variable-length payload of group synchronization info followed by one
//! snapshot record per known node and recovering journal. All multi-byte
//! integers are encoded big-endian regardless of host order, so members on
//! mixed-endian hardware agree on the bytes.
//!
//! Raw bytes never travel past this module: inbound buffers are decoded into
//! the [`Message`] sum type at the transport boundary and handled as typed
//! values everywhere else. Decoding never trusts embedded counts beyond the
//! buffer length; any mismatch is a [`WireError`], not a panic.

use {
	crate::transport::NodeId,
	bytes::{Buf, BufMut, Bytes, BytesMut},
	derive_more::Display,
};

/// Protocol version carried in every header as `(major, minor, patch)`.
/// A receiver rejects any message whose major version differs from its own.
pub const WIRE_VERSION: (u16, u16, u16) = (1, 0, 0);

/// Encoded size of the fixed message header.
pub const HEADER_LEN: usize = 40;

/// Encoded size of the group sync info record in a start payload.
pub const GROUP_INFO_LEN: usize = 32;

/// Encoded size of one node snapshot record in a start payload.
pub const SNAPSHOT_LEN: usize = 12;

/// Journal id wire encoding for "no journal assigned".
const JID_NONE: u32 = u32::MAX;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
	#[error("message truncated: need {need} bytes, have {have}")]
	Truncated { need: usize, have: usize },

	#[error("protocol major version mismatch: ours {ours}, theirs {theirs}")]
	VersionMismatch { ours: u16, theirs: u16 },

	#[error("unknown message kind {0}")]
	UnknownKind(u16),

	#[error("start payload length disagrees with embedded id count {count}")]
	CountMismatch { count: u32 },
}

/// Discriminant values of the `kind` header field.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageKind {
	#[display("start")]
	Start = 1,
	#[display("mount_done")]
	MountDone = 2,
	#[display("first_recovery_done")]
	FirstRecoveryDone = 3,
	#[display("recovery_result")]
	RecoveryResult = 4,
}

/// The fixed-layout header preceding every message on the wire.
///
/// `msgdata` carries the change sequence number for start messages, the
/// mount(2) error code for mount-done messages and the journal id for
/// recovery results. `flags` carries the recovery result. The two trailing
/// pad fields are written as zero and ignored on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
	pub version: [u16; 3],
	pub kind: u16,
	pub nodeid: NodeId,
	pub to_nodeid: NodeId,
	pub global_id: u32,
	pub flags: u32,
	pub msgdata: u32,
}

/// Per-cycle group synchronization info, the first record of a start payload.
///
/// `id_count` is the number of [`NodeSnapshot`] records that follow. The
/// membership transition counts must match a queued change on the receiver
/// for the message to be applied at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupInfo {
	pub started_count: u32,
	pub member_count: u32,
	pub joined_count: u32,
	pub remove_count: u32,
	pub failed_count: u32,
	pub id_count: u32,
	pub first_recovery_needed: bool,
	pub first_recovery_master: NodeId,
}

// Snapshot flag bits.
pub const SNAP_MEMBER: u32 = 1 << 0;
pub const SNAP_NEEDS_RECOVERY: u32 = 1 << 1;
pub const SNAP_MOUNT_DONE: u32 = 1 << 2;
pub const SNAP_MOUNT_ERROR: u32 = 1 << 3;
pub const SNAP_MOUNT_RO: u32 = 1 << 4;
pub const SNAP_MOUNT_SPECTATOR: u32 = 1 << 5;

/// One record of a start payload: either the sender's view of a current
/// member (`SNAP_MEMBER` set) or a journal still awaiting recovery from an
/// earlier cycle (`SNAP_NEEDS_RECOVERY` set, `nodeid` is the last owner).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSnapshot {
	pub nodeid: NodeId,
	pub jid: Option<u32>,
	pub flags: u32,
}

impl NodeSnapshot {
	pub fn is_member(&self) -> bool {
		self.flags & SNAP_MEMBER != 0
	}

	pub fn needs_recovery(&self) -> bool {
		self.flags & SNAP_NEEDS_RECOVERY != 0
	}

	pub fn mount_done(&self) -> bool {
		self.flags & SNAP_MOUNT_DONE != 0
	}

	pub fn mount_error(&self) -> bool {
		self.flags & SNAP_MOUNT_ERROR != 0
	}

	pub fn readonly(&self) -> bool {
		self.flags & SNAP_MOUNT_RO != 0
	}

	pub fn spectator(&self) -> bool {
		self.flags & SNAP_MOUNT_SPECTATOR != 0
	}
}

/// A decoded coordination message. One variant per wire message kind, each
/// carrying its own strongly-typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
	/// The sender's state snapshot for one membership change, broadcast when
	/// its barrier conditions are satisfied.
	Start {
		seq: u32,
		info: GroupInfo,
		snapshots: Vec<NodeSnapshot>,
	},

	/// The sender's local mount(2) call finished with the given error code
	/// (zero on success).
	MountDone { error: u32 },

	/// The first-mount recovery master finished recovering all journals.
	FirstRecoveryDone,

	/// The sender's kernel finished recovering one journal.
	RecoveryResult { jid: u32, success: bool },
}

impl Message {
	pub fn kind(&self) -> MessageKind {
		match self {
			Self::Start { .. } => MessageKind::Start,
			Self::MountDone { .. } => MessageKind::MountDone,
			Self::FirstRecoveryDone => MessageKind::FirstRecoveryDone,
			Self::RecoveryResult { .. } => MessageKind::RecoveryResult,
		}
	}

	/// Encodes the message with its header into a contiguous byte buffer.
	pub fn encode(&self, nodeid: NodeId, global_id: u32) -> Bytes {
		let payload_len = match self {
			Self::Start { snapshots, .. } => {
				GROUP_INFO_LEN + snapshots.len() * SNAPSHOT_LEN
			}
			_ => 0,
		};

		let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len);

		let (flags, msgdata) = match self {
			Self::Start { seq, .. } => (0, *seq),
			Self::MountDone { error } => (0, *error),
			Self::FirstRecoveryDone => (0, 0),
			Self::RecoveryResult { jid, success } => (u32::from(*success), *jid),
		};

		buf.put_u16(WIRE_VERSION.0);
		buf.put_u16(WIRE_VERSION.1);
		buf.put_u16(WIRE_VERSION.2);
		buf.put_u16(self.kind() as u16);
		buf.put_u32(nodeid);
		buf.put_u32(0); // to_nodeid, unused: all messages are broadcasts
		buf.put_u32(global_id);
		buf.put_u32(flags);
		buf.put_u32(msgdata);
		buf.put_u32(0); // pad
		buf.put_u64(0); // pad64

		if let Self::Start { info, snapshots, .. } = self {
			buf.put_u32(info.started_count);
			buf.put_u32(info.member_count);
			buf.put_u32(info.joined_count);
			buf.put_u32(info.remove_count);
			buf.put_u32(info.failed_count);
			buf.put_u32(info.id_count);
			buf.put_u32(u32::from(info.first_recovery_needed));
			buf.put_u32(info.first_recovery_master);

			for snap in snapshots {
				buf.put_u32(snap.nodeid);
				buf.put_u32(snap.jid.unwrap_or(JID_NONE));
				buf.put_u32(snap.flags);
			}
		}

		buf.freeze()
	}

	/// Decodes a received buffer into its header and typed message.
	pub fn decode(bytes: &[u8]) -> Result<(Header, Message), WireError> {
		let mut buf = bytes;

		if buf.remaining() < HEADER_LEN {
			return Err(WireError::Truncated {
				need: HEADER_LEN,
				have: buf.remaining(),
			});
		}

		let version = [buf.get_u16(), buf.get_u16(), buf.get_u16()];
		if version[0] != WIRE_VERSION.0 {
			return Err(WireError::VersionMismatch {
				ours: WIRE_VERSION.0,
				theirs: version[0],
			});
		}

		let kind = buf.get_u16();
		let header = Header {
			version,
			kind,
			nodeid: buf.get_u32(),
			to_nodeid: buf.get_u32(),
			global_id: buf.get_u32(),
			flags: buf.get_u32(),
			msgdata: buf.get_u32(),
		};
		buf.advance(4 + 8); // pad fields

		let message = match kind {
			k if k == MessageKind::Start as u16 => decode_start(&header, buf)?,
			k if k == MessageKind::MountDone as u16 => {
				Message::MountDone { error: header.msgdata }
			}
			k if k == MessageKind::FirstRecoveryDone as u16 => {
				Message::FirstRecoveryDone
			}
			k if k == MessageKind::RecoveryResult as u16 => {
				Message::RecoveryResult {
					jid: header.msgdata,
					success: header.flags & 1 != 0,
				}
			}
			other => return Err(WireError::UnknownKind(other)),
		};

		Ok((header, message))
	}
}

fn decode_start(header: &Header, mut buf: &[u8]) -> Result<Message, WireError> {
	if buf.remaining() < GROUP_INFO_LEN {
		return Err(WireError::Truncated {
			need: GROUP_INFO_LEN,
			have: buf.remaining(),
		});
	}

	let info = GroupInfo {
		started_count: buf.get_u32(),
		member_count: buf.get_u32(),
		joined_count: buf.get_u32(),
		remove_count: buf.get_u32(),
		failed_count: buf.get_u32(),
		id_count: buf.get_u32(),
		first_recovery_needed: buf.get_u32() != 0,
		first_recovery_master: buf.get_u32(),
	};

	// the embedded record count must account for the remaining bytes exactly
	let expect = (info.id_count as usize).saturating_mul(SNAPSHOT_LEN);
	if buf.remaining() != expect {
		return Err(WireError::CountMismatch { count: info.id_count });
	}

	let mut snapshots = Vec::with_capacity(info.id_count as usize);
	for _ in 0..info.id_count {
		let nodeid = buf.get_u32();
		let jid = buf.get_u32();
		snapshots.push(NodeSnapshot {
			nodeid,
			jid: (jid != JID_NONE).then_some(jid),
			flags: buf.get_u32(),
		});
	}

	Ok(Message::Start { seq: header.msgdata, info, snapshots })
}

/// Derives the numeric group id from the prefixed group name. Carried in
/// every header for diagnostics and cross-checks only, never used for
/// routing.
pub fn global_id(group_name: &str) -> u32 {
	crc32fast::hash(group_name.as_bytes())
}
