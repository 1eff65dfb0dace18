use std::sync::Arc;
use std::sync::atomic::Ordering;

use byteorder::{ByteOrder, LittleEndian};
use core::align_up;

use protos::*;
use region::Region;


// Control-region layout. Every per-peer slot sits in its own cacheline-sized stride so a
// one-sided write from one peer can never tear a neighbouring slot.
pub const SLOT_STRIDE: usize = 64;

pub const OFF_SID: usize = 0;
pub const OFF_HB: usize = SLOT_STRIDE;
pub const OFF_VOTE_REQ: usize = OFF_HB + MAX_SERVERS * SLOT_STRIDE;
pub const OFF_VOTE_ACK: usize = OFF_VOTE_REQ + MAX_SERVERS * SLOT_STRIDE;
pub const OFF_LOG_OFFSETS: usize = OFF_VOTE_ACK + MAX_SERVERS * SLOT_STRIDE;
pub const OFF_APPLY_OFFSETS: usize = OFF_LOG_OFFSETS + MAX_SERVERS * SLOT_STRIDE;
pub const OFF_VOTE_SID: usize = OFF_APPLY_OFFSETS + MAX_SERVERS * SLOT_STRIDE;
pub const CTRL_LEN: usize = OFF_VOTE_SID + MAX_SERVERS * SLOT_STRIDE;


/// The remotely writable control region of one server: heartbeat slots, vote requests and
/// acks, cached remote log offsets and the replicated private vote
///
/// All cross-server traffic lands here as one-sided writes; the local side only ever polls
/// and clears. The local cached SID also lives here and is updated exclusively by CAS
pub struct CtrlRegion {
	region: Arc<Region>
}

impl CtrlRegion {
	pub fn new() -> CtrlRegion {
		// The stride must keep every slot group aligned for the atomic accessors
		debug_assert_eq!(OFF_HB, align_up(8, SLOT_STRIDE));
		debug_assert_eq!(align_up(VOTE_REQ_SIZE, SLOT_STRIDE), SLOT_STRIDE);

		CtrlRegion {
			region: Arc::new(Region::new(CTRL_LEN))
		}
	}

	pub fn region(&self) -> Arc<Region> {
		self.region.clone()
	}

	/* Local SID */

	pub fn sid(&self) -> Sid {
		Sid(self.region.atomic_u64(OFF_SID).load(Ordering::Acquire))
	}

	/// The only way the SID may change: a single 64-bit compare-and-swap
	pub fn cas_sid(&self, old: Sid, new: Sid) -> bool {
		self.region.atomic_u64(OFF_SID)
			.compare_exchange(old.0, new.0, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
	}

	/* Heartbeat slots */

	pub fn hb_offset(idx: ServerIdx) -> u64 {
		(OFF_HB + (idx as usize) * SLOT_STRIDE) as u64
	}

	/// Atomically reads and clears the heartbeat slot for peer idx
	pub fn hb_fetch_clear(&self, idx: ServerIdx) -> u64 {
		self.region.atomic_u64(OFF_HB + (idx as usize) * SLOT_STRIDE).swap(0, Ordering::AcqRel)
	}

	pub fn hb_peek(&self, idx: ServerIdx) -> u64 {
		self.region.atomic_u64(OFF_HB + (idx as usize) * SLOT_STRIDE).load(Ordering::Acquire)
	}

	/* Vote request slots (candidate writes into slot[candidate_idx] of every peer) */

	pub fn vote_req_offset(idx: ServerIdx) -> u64 {
		(OFF_VOTE_REQ + (idx as usize) * SLOT_STRIDE) as u64
	}

	/// Reads the vote request in slot idx; None while empty. The SID word is published last
	/// by the writer, so a non-zero SID means the slot is complete
	pub fn vote_req(&self, idx: ServerIdx) -> Option<VoteRequest> {
		let base = OFF_VOTE_REQ + (idx as usize) * SLOT_STRIDE;

		if self.region.atomic_u64(base + 32).load(Ordering::Acquire) == 0 {
			return None;
		}

		let mut buf = [0u8; VOTE_REQ_SIZE];
		self.region.read(base, &mut buf);
		VoteRequest::read_from(&buf)
	}

	pub fn clear_vote_req(&self, idx: ServerIdx) {
		self.region.atomic_u64(OFF_VOTE_REQ + (idx as usize) * SLOT_STRIDE + 32)
			.store(0, Ordering::Release);
	}

	/* Vote ack slots (voter writes its commit offset into the candidate's slot[voter_idx]) */

	pub fn vote_ack_offset(idx: ServerIdx) -> u64 {
		(OFF_VOTE_ACK + (idx as usize) * SLOT_STRIDE) as u64
	}

	pub fn vote_ack(&self, idx: ServerIdx) -> u64 {
		self.region.atomic_u64(OFF_VOTE_ACK + (idx as usize) * SLOT_STRIDE).load(Ordering::Acquire)
	}

	pub fn set_vote_ack(&self, idx: ServerIdx, v: u64) {
		self.region.atomic_u64(OFF_VOTE_ACK + (idx as usize) * SLOT_STRIDE).store(v, Ordering::Release);
	}

	/* Cached remote log offsets used during reconciliation */

	pub fn peer_commit(&self, idx: ServerIdx) -> u64 {
		self.region.atomic_u64(OFF_LOG_OFFSETS + (idx as usize) * SLOT_STRIDE).load(Ordering::Acquire)
	}

	pub fn set_peer_commit(&self, idx: ServerIdx, v: u64) {
		self.region.atomic_u64(OFF_LOG_OFFSETS + (idx as usize) * SLOT_STRIDE).store(v, Ordering::Release);
	}

	pub fn peer_end(&self, idx: ServerIdx) -> u64 {
		self.region.atomic_u64(OFF_LOG_OFFSETS + (idx as usize) * SLOT_STRIDE + 8).load(Ordering::Acquire)
	}

	pub fn set_peer_end(&self, idx: ServerIdx, v: u64) {
		self.region.atomic_u64(OFF_LOG_OFFSETS + (idx as usize) * SLOT_STRIDE + 8).store(v, Ordering::Release);
	}

	/* Remote apply offsets gathered for log pruning */

	pub fn apply_offset(&self, idx: ServerIdx) -> u64 {
		self.region.atomic_u64(OFF_APPLY_OFFSETS + (idx as usize) * SLOT_STRIDE).load(Ordering::Acquire)
	}

	pub fn set_apply_offset(&self, idx: ServerIdx, v: u64) {
		self.region.atomic_u64(OFF_APPLY_OFFSETS + (idx as usize) * SLOT_STRIDE).store(v, Ordering::Release);
	}

	pub fn apply_offsets_offset(idx: ServerIdx) -> u64 {
		(OFF_APPLY_OFFSETS + (idx as usize) * SLOT_STRIDE) as u64
	}

	/* Replicated private vote */

	pub fn vote_sid_offset(idx: ServerIdx) -> u64 {
		(OFF_VOTE_SID + (idx as usize) * SLOT_STRIDE) as u64
	}

	pub fn vote_sid(&self, idx: ServerIdx) -> Sid {
		Sid(self.region.atomic_u64(OFF_VOTE_SID + (idx as usize) * SLOT_STRIDE).load(Ordering::Acquire))
	}
}
