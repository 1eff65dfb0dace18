use std::fmt;

use byteorder::{ByteOrder, LittleEndian};


/// Index of a server inside the cluster configuration. These are positional: slot i of the
/// configuration bitmask, the ack array inside every log entry, and the per-peer control
/// region all refer to the same server
pub type ServerIdx = u8;

pub type Term = u64;

/// Upper bound on the cluster size; the ack array inside every log entry and all per-peer
/// control slots are statically sized by this
pub const MAX_SERVERS: usize = 16;


/// The 64-bit state identifier: [term:55 | L:1 | idx:8]
///
/// The idx is the low byte, the L flag is bit 8 and the term occupies the remaining high
/// bits. Ordering between SIDs is plain unsigned compare, which gives exactly the election
/// semantics we need: a higher term always wins, and within a term a known leader
/// ([term|1|idx]) beats every vote request ([term|0|idx])
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sid(pub u64);

impl Sid {
	pub fn new(term: Term, leader: bool, idx: ServerIdx) -> Sid {
		let mut v = (term << 9) | (idx as u64);
		if leader {
			v |= 1 << 8;
		}
		Sid(v)
	}

	pub fn zero() -> Sid {
		Sid(0)
	}

	pub fn term(&self) -> Term {
		self.0 >> 9
	}

	pub fn has_leader(&self) -> bool {
		self.0 & (1 << 8) != 0
	}

	pub fn idx(&self) -> ServerIdx {
		(self.0 & 0xff) as ServerIdx
	}

	pub fn with_leader(&self) -> Sid {
		Sid(self.0 | (1 << 8))
	}

	pub fn without_leader(&self) -> Sid {
		Sid(self.0 & !(1 << 8))
	}

	pub fn with_term(&self, term: Term) -> Sid {
		Sid((term << 9) | (self.0 & 0x1ff))
	}

	pub fn with_idx(&self, idx: ServerIdx) -> Sid {
		Sid(((self.0 >> 8) << 8) | (idx as u64))
	}
}

impl fmt::Debug for Sid {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "[{}|{}|{}]", self.term(), if self.has_leader() { 1 } else { 0 }, self.idx())
	}
}


/// A logical log position: dense request ids within a view
///
/// Every committed client event is named by exactly one of these; it doubles as the durable
/// record key and as the connection identifier for CONNECT entries
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct ViewStamp {
	pub view_id: u8,
	pub req_id: u32
}

/// Packed on-wire size of a view stamp inside a log entry
pub const VIEW_STAMP_SIZE: usize = 5;

impl ViewStamp {
	pub fn new(view_id: u8, req_id: u32) -> ViewStamp {
		ViewStamp { view_id, req_id }
	}

	/// The 8-byte record key: req_id in the low word, view_id zero-extended into the high word
	pub fn to_key(&self) -> u64 {
		((self.view_id as u64) << 32) | (self.req_id as u64)
	}

	pub fn from_key(key: u64) -> ViewStamp {
		ViewStamp {
			view_id: (key >> 32) as u8,
			req_id: key as u32
		}
	}

	pub fn next(&self) -> ViewStamp {
		ViewStamp { view_id: self.view_id, req_id: self.req_id + 1 }
	}

	pub fn write_to(&self, buf: &mut [u8]) {
		buf[0] = self.view_id;
		LittleEndian::write_u32(&mut buf[1..5], self.req_id);
	}

	pub fn read_from(buf: &[u8]) -> ViewStamp {
		ViewStamp {
			view_id: buf[0],
			req_id: LittleEndian::read_u32(&buf[1..5])
		}
	}
}


/// Type tag of a log entry
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EntryType {
	/// A new inbound TCP connection was accepted at the leader
	Connect,
	/// Bytes received over an existing connection
	Send,
	/// The connection was closed
	Close,
	/// An output-hash sample for divergence checking
	Output,
	/// Padding entry used only to flush a preceding CLOSE commit to the replicas
	Nop,
	/// First datagram from a new UDP source address
	UdpConnect,
	/// A configuration change (carries a packed CID)
	Config,
	/// Log-head advancement for pruning (carries the new head offset)
	Head,
	/// Blank entry appended by a fresh leader so earlier-term entries can commit
	Noop
}

impl EntryType {
	pub fn to_u8(&self) -> u8 {
		match *self {
			EntryType::Connect => 1,
			EntryType::Send => 2,
			EntryType::Close => 3,
			EntryType::Output => 4,
			EntryType::Nop => 5,
			EntryType::UdpConnect => 6,
			EntryType::Config => 7,
			EntryType::Head => 8,
			EntryType::Noop => 9
		}
	}

	pub fn from_u8(v: u8) -> Option<EntryType> {
		Some(match v {
			1 => EntryType::Connect,
			2 => EntryType::Send,
			3 => EntryType::Close,
			4 => EntryType::Output,
			5 => EntryType::Nop,
			6 => EntryType::UdpConnect,
			7 => EntryType::Config,
			8 => EntryType::Head,
			9 => EntryType::Noop,
			_ => return None
		})
	}
}


/// State of a cluster configuration
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum CidState {
	/// One group; plain majority
	Stable,
	/// A joining server was added beyond the old group; only the old majority decides
	Extended,
	/// Old and new groups overlap; joint majorities decide
	Transit
}

impl CidState {
	pub fn to_u8(&self) -> u8 {
		match *self {
			CidState::Stable => 0,
			CidState::Transit => 1,
			CidState::Extended => 2
		}
	}

	pub fn from_u8(v: u8) -> Option<CidState> {
		Some(match v {
			0 => CidState::Stable,
			1 => CidState::Transit,
			2 => CidState::Extended,
			_ => return None
		})
	}
}


/// Packed on-wire size of a CID (inside CONFIG entries and vote requests)
pub const CID_SIZE: usize = 16;

/// Configuration identifier
///
/// A configuration is the tuple [epoch, N, N', state, bitmask]: N is the primary group size,
/// N' the secondary size during a transition, and the bitmask has a bit set for every member
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub struct Cid {
	pub epoch: u64,
	pub size: [u8; 2],
	pub state: CidState,
	pub bitmask: u32
}

impl Cid {
	pub fn bootstrap(group_size: u8) -> Cid {
		let mut bitmask = 0;
		for i in 0..group_size {
			bitmask |= 1 << i;
		}

		Cid {
			epoch: 0,
			size: [group_size, 0],
			state: CidState::Stable,
			bitmask
		}
	}

	pub fn is_on(&self, idx: ServerIdx) -> bool {
		self.bitmask & (1 << idx) != 0
	}

	pub fn server_add(&mut self, idx: ServerIdx) {
		self.bitmask |= 1 << idx;
	}

	pub fn server_rm(&mut self, idx: ServerIdx) {
		self.bitmask &= !(1 << idx);
	}

	/// Size of the group including servers added in an extended configuration
	pub fn extended_size(&self) -> u8 {
		if self.state == CidState::Stable {
			return self.size[0];
		}
		if self.size[0] < self.size[1] { self.size[1] } else { self.size[0] }
	}

	/// Size of the group ignoring extra servers that are not yet counted for votes
	pub fn group_size(&self) -> u8 {
		if self.state != CidState::Transit {
			return self.size[0];
		}
		if self.size[0] < self.size[1] { self.size[1] } else { self.size[0] }
	}

	/// Whether the given member bitmap satisfies this configuration's quorum rule
	///
	/// In Stable and Extended states only the primary group decides; in Transit both the
	/// primary and the secondary group must independently reach a majority
	pub fn quorum(&self, bitmap: u32) -> bool {
		let count_below = |n: u8| -> u32 {
			(bitmap & ((1u32 << n) - 1)).count_ones()
		};

		if count_below(self.size[0]) < (self.size[0] / 2 + 1) as u32 {
			return false;
		}

		if self.state == CidState::Transit {
			if count_below(self.size[1]) < (self.size[1] / 2 + 1) as u32 {
				return false;
			}
		}

		true
	}

	pub fn write_to(&self, buf: &mut [u8]) {
		LittleEndian::write_u64(&mut buf[0..8], self.epoch);
		buf[8] = self.size[0];
		buf[9] = self.size[1];
		buf[10] = self.state.to_u8();
		buf[11] = 0;
		LittleEndian::write_u32(&mut buf[12..16], self.bitmask);
	}

	pub fn read_from(buf: &[u8]) -> Option<Cid> {
		Some(Cid {
			epoch: LittleEndian::read_u64(&buf[0..8]),
			size: [buf[8], buf[9]],
			state: CidState::from_u8(buf[10])?,
			bitmask: LittleEndian::read_u32(&buf[12..16])
		})
	}
}


/// Packed on-wire size of a vote request slot
///
/// The SID is deliberately the last field: the transport delivers the final byte of a write
/// last, so a non-zero SID guarantees the rest of the slot is complete
pub const VOTE_REQ_SIZE: usize = 40;

/// A candidate's pre-election proposal, written into each peer's control region
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct VoteRequest {
	pub last_index: u32,
	pub last_term: Term,
	pub cid: Cid,
	pub sid: Sid
}

impl VoteRequest {
	pub fn write_to(&self, buf: &mut [u8]) {
		LittleEndian::write_u64(&mut buf[0..8], self.last_index as u64);
		LittleEndian::write_u64(&mut buf[8..16], self.last_term);
		self.cid.write_to(&mut buf[16..32]);
		LittleEndian::write_u64(&mut buf[32..40], (self.sid).0);
	}

	pub fn read_from(buf: &[u8]) -> Option<VoteRequest> {
		Some(VoteRequest {
			last_index: LittleEndian::read_u64(&buf[0..8]) as u32,
			last_term: LittleEndian::read_u64(&buf[8..16]),
			cid: Cid::read_from(&buf[16..32])?,
			sid: Sid(LittleEndian::read_u64(&buf[32..40]))
		})
	}
}


#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sid_layout() {
		let sid = Sid::new(42, true, 7);
		assert_eq!(sid.term(), 42);
		assert!(sid.has_leader());
		assert_eq!(sid.idx(), 7);

		let no_leader = sid.without_leader();
		assert!(!no_leader.has_leader());
		assert_eq!(no_leader.term(), 42);
		assert_eq!(no_leader.idx(), 7);
	}

	#[test]
	fn sid_ordering() {
		// A higher term always wins
		assert!(Sid::new(3, false, 0) > Sid::new(2, true, 9));
		// Within a term, a known leader beats any bare vote request
		assert!(Sid::new(3, true, 0) > Sid::new(3, false, 9));
	}

	#[test]
	fn view_stamp_key_round_trip() {
		let vs = ViewStamp::new(3, 77);
		assert_eq!(ViewStamp::from_key(vs.to_key()), vs);
		assert_eq!(vs.to_key(), (3u64 << 32) | 77);
	}

	#[test]
	fn view_stamp_ordering() {
		assert!(ViewStamp::new(2, 0) > ViewStamp::new(1, 100));
		assert!(ViewStamp::new(1, 5) > ViewStamp::new(1, 4));
	}

	#[test]
	fn cid_quorum_stable() {
		let cid = Cid::bootstrap(3);
		assert!(!cid.quorum(0b001));
		assert!(cid.quorum(0b011));
		assert!(cid.quorum(0b111));
	}

	#[test]
	fn cid_quorum_joint() {
		// Downsize 5 -> 3: majorities of both groups are required
		let cid = Cid {
			epoch: 1,
			size: [5, 3],
			state: CidState::Transit,
			bitmask: 0b11111
		};

		// 3 of 5 but only 1 of the new group of 3
		assert!(!cid.quorum(0b11001));
		// 3 of 5 and 2 of 3
		assert!(cid.quorum(0b10011));
		// 2 of 5 is not enough even with 2 of 3
		assert!(!cid.quorum(0b00011));
	}

	#[test]
	fn cid_quorum_extended() {
		// Join extending 3 -> 4: only the old majority decides
		let cid = Cid {
			epoch: 1,
			size: [3, 4],
			state: CidState::Extended,
			bitmask: 0b1111
		};

		assert!(cid.quorum(0b011));
		assert!(!cid.quorum(0b1001));
	}

	#[test]
	fn vote_request_round_trip() {
		let req = VoteRequest {
			last_index: 12,
			last_term: 4,
			cid: Cid::bootstrap(3),
			sid: Sid::new(5, false, 2)
		};

		let mut buf = [0u8; VOTE_REQ_SIZE];
		req.write_to(&mut buf);
		assert_eq!(VoteRequest::read_from(&buf).unwrap(), req);

		// The publishing field must be last on the wire
		assert_eq!(&buf[32..40], &(req.sid).0.to_le_bytes()[..]);
	}
}
