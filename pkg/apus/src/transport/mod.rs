pub mod mem;
pub mod tcp;

use std::sync::Arc;

use errors::*;
use protos::ServerIdx;
use region::Region;


/// Address of a peer's registered memory: a byte offset inside the region named by rkey
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Debug, Default)]
pub struct RemoteMem {
	pub raddr: u64,
	pub rkey: u32
}

impl RemoteMem {
	pub fn at(&self, off: u64) -> RemoteMem {
		RemoteMem { raddr: self.raddr + off, rkey: self.rkey }
	}
}

/// The pair of registrations every server exposes to its peers
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Debug)]
pub struct RcInfo {
	pub log_mr: RemoteMem,
	pub ctrl_mr: RemoteMem
}

#[derive(Clone, Copy, Debug)]
pub struct Completion {
	pub peer: ServerIdx,
	pub ok: bool
}

/// Flags computed per write from the per-peer send window
#[derive(Clone, Copy, Default, Debug)]
pub struct SendFlags {
	pub signaled: bool,
	pub must_poll: bool
}

/// Outstanding-write window per connection; every S_DEPTH-th write is signaled and the
/// write after a full window drains one completion first
pub const S_DEPTH: u32 = 64;

/// Writes at or below this size are sent inline (bookkeeping on non-RDMA backends)
pub const INLINE_THRESHOLD: usize = 256;


/// A reliable one-sided transport
///
/// Contract highlights (the sentinel protocol depends on them):
/// - write delivers the final byte of the range last, so a reader polling that byte
///   observes the complete write;
/// - writes between one pair of peers are delivered in issue order;
/// - a peer that revoked log access causes writes to its log region to complete with
///   failure instead of landing;
/// - persistent delivery failure marks the peer disconnected, observable through
///   is_connected and failed completions.
pub trait Transport: Send + Sync {
	/// Queues a one-sided write of `local` into the peer's memory at rm. Returns after
	/// local queuing; delivery status arrives via poll_completions
	fn write(&self, peer: ServerIdx, local: &[u8], rm: RemoteMem, flags: SendFlags) -> Result<()>;

	/// Synchronously pulls bytes from the peer's memory into `local`
	fn read(&self, peer: ServerIdx, local: &mut [u8], rm: RemoteMem) -> Result<()>;

	/// Best-effort message side channel (cluster join, RC-info exchange, snapshots); may
	/// drop messages
	fn send_msg(&self, peer: ServerIdx, bytes: &[u8]) -> Result<()>;

	/// Non-blocking receive from the side channel
	fn recv_msg(&self) -> Option<Vec<u8>>;

	/// Drains up to max completed work requests for this peer
	fn poll_completions(&self, peer: ServerIdx, max: usize) -> Vec<Completion>;

	/// Advances the peer's send window and reports whether the next write must be
	/// signaled and/or preceded by a completion poll. Called under the submission lock
	fn reserve_send(&self, peer: ServerIdx) -> SendFlags;

	/// Tears down the connection to the peer; idempotent
	fn disconnect(&self, peer: ServerIdx);

	fn is_connected(&self, peer: ServerIdx) -> bool;

	/// Revokes remote write access to the local log region (election step); in-flight and
	/// subsequent writes targeting it fail until restored
	fn revoke_log_access(&self);

	fn restore_log_access(&self);

	/// Registration info peers use to address our regions
	fn local_rc_info(&self) -> RcInfo;

	fn peer_rc_info(&self, peer: ServerIdx) -> Option<RcInfo>;

	fn set_peer_rc_info(&self, peer: ServerIdx, rc: RcInfo);

	/// Registers an additional region (snapshot buffers) and returns its address
	fn register(&self, region: Arc<Region>) -> RemoteMem;
}
