use std::sync::Arc;
use std::sync::atomic::Ordering;

use byteorder::{ByteOrder, LittleEndian};

use protos::*;
use region::Region;


// Region layout: a small header of offsets, the not-committed buffer a voter publishes for
// log reconciliation, then the circular entry area. Everything before the entry area is at a
// fixed offset so peers can address individual fields with one-sided writes.
pub const OFF_HEAD: usize = 0;
pub const OFF_COMMIT: usize = 8;
pub const OFF_APPLY: usize = 16;
pub const OFF_END: usize = 24;
pub const OFF_TAIL: usize = 32;
pub const OFF_LEN: usize = 40;
pub const OFF_NC_LEN: usize = 48;
pub const OFF_NC_ENTRIES: usize = 56;

pub const NC_MAX: usize = 64;
pub const NC_ENTRY_SIZE: usize = 16;

/// Byte offset of the circular entry area inside the log region
pub const ENTRIES_OFF: usize = 1088;

/// Default entry-area length: 16 MiB
pub const DEFAULT_LOG_LEN: u64 = 16 * 1024 * 1024;

pub const ACK_SLOT_SIZE: usize = 9;
pub const ACK_AREA_SIZE: usize = ACK_SLOT_SIZE * MAX_SERVERS;

// Field offsets inside an entry, after the ack area
const HDR_MSG_VS: usize = ACK_AREA_SIZE;
const HDR_REQ_EXED: usize = HDR_MSG_VS + VIEW_STAMP_SIZE;
const HDR_NODE_ID: usize = HDR_REQ_EXED + VIEW_STAMP_SIZE;
const HDR_DATA_SIZE: usize = HDR_NODE_ID + 1;
const HDR_TYPE: usize = HDR_DATA_SIZE + 4;
const HDR_CLT_ID: usize = HDR_TYPE + 1;

pub const ENTRY_HEADER_SIZE: usize = HDR_CLT_ID + VIEW_STAMP_SIZE;

/// Trailing byte of every complete entry; the only completion signal a follower has
pub const SENTINEL: u8 = b'f';

/// data_size value marking "the next entry starts back at offset 0"; stamped when an entry's
/// header would fit before the wrap boundary but its payload would not
pub const WRAP_MARK: u32 = ::std::u32::MAX;


/// Fixed-prefix fields of a log entry (the ack area is accessed separately)
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct EntryHeader {
	pub msg_vs: ViewStamp,
	/// The leader's highest committed stamp at append time; followers apply up to here
	pub req_canbe_exed: ViewStamp,
	pub node_id: ServerIdx,
	/// Payload length plus one for the trailing sentinel
	pub data_size: u32,
	pub entry_type: EntryType,
	pub clt_id: ViewStamp
}

impl EntryHeader {
	pub fn entry_len(&self) -> u64 {
		ENTRY_HEADER_SIZE as u64 + self.data_size as u64
	}
}

pub fn entry_len_for(payload_len: usize) -> u64 {
	ENTRY_HEADER_SIZE as u64 + payload_len as u64 + 1
}


/// The local replicated log: a circular byte buffer of variable-length entries, remotely
/// writable by the current leader, with in-entry ack slots written back by followers
///
/// Offset fields live inside the region itself so a leader can adjust a follower's end and
/// commit offsets directly during log reconciliation
pub struct Log {
	region: Arc<Region>
}

impl Log {
	pub fn new(len: u64) -> Log {
		let region = Arc::new(Region::new(ENTRIES_OFF + len as usize));
		let log = Log { region };

		log.region.atomic_u64(OFF_LEN).store(len, Ordering::Release);
		// Empty-log convention: end == tail == len until the first entry is placed
		log.region.atomic_u64(OFF_END).store(len, Ordering::Release);
		log.region.atomic_u64(OFF_TAIL).store(len, Ordering::Release);

		log
	}

	pub fn region(&self) -> Arc<Region> {
		self.region.clone()
	}

	pub fn len(&self) -> u64 {
		self.region.atomic_u64(OFF_LEN).load(Ordering::Acquire)
	}

	pub fn head(&self) -> u64 {
		self.region.atomic_u64(OFF_HEAD).load(Ordering::Acquire)
	}

	pub fn commit(&self) -> u64 {
		self.region.atomic_u64(OFF_COMMIT).load(Ordering::Acquire)
	}

	pub fn apply(&self) -> u64 {
		self.region.atomic_u64(OFF_APPLY).load(Ordering::Acquire)
	}

	pub fn end(&self) -> u64 {
		self.region.atomic_u64(OFF_END).load(Ordering::Acquire)
	}

	pub fn tail(&self) -> u64 {
		self.region.atomic_u64(OFF_TAIL).load(Ordering::Acquire)
	}

	pub fn set_head(&self, v: u64) {
		self.region.atomic_u64(OFF_HEAD).store(v, Ordering::Release);
	}

	pub fn set_apply(&self, v: u64) {
		self.region.atomic_u64(OFF_APPLY).store(v, Ordering::Release);
	}

	pub fn set_end(&self, v: u64) {
		self.region.atomic_u64(OFF_END).store(v, Ordering::Release);
	}

	pub fn set_tail(&self, v: u64) {
		self.region.atomic_u64(OFF_TAIL).store(v, Ordering::Release);
	}

	pub fn set_commit(&self, v: u64) {
		self.region.atomic_u64(OFF_COMMIT).store(v, Ordering::Release);
	}

	pub fn is_empty(&self) -> bool {
		self.end() == self.len()
	}

	pub fn fit_entry_header(&self, off: u64) -> bool {
		self.len() - off >= ENTRY_HEADER_SIZE as u64
	}

	/// True iff the full entry (header and payload) fits before the wrap boundary
	pub fn fit_entry(&self, off: u64, hdr: &EntryHeader) -> bool {
		self.len() - off >= hdr.entry_len()
	}

	/// Distance in bytes walking forward from `off` to the end offset (0 when the log is
	/// empty or off is the end)
	pub fn offset_end_distance(&self, off: u64) -> u64 {
		if self.is_empty() {
			return 0;
		}

		let end = self.end();
		if off <= end {
			end - off
		} else {
			self.len() - off + end
		}
	}

	/// Orders two offsets by their distance from the head (the circular "later than" test)
	pub fn is_offset_larger(&self, a: u64, b: u64) -> bool {
		let head = self.head();
		let len = self.len();

		let dist = |x: u64| -> u64 {
			if x >= head { x - head } else { len - head + x }
		};

		dist(a) > dist(b)
	}

	/// Advances the commit offset; the invariant head <= commit <= end (in circular order)
	/// must already hold for the new value
	pub fn advance_commit(&self, new_commit: u64) {
		debug_assert!(!self.is_offset_larger(new_commit, self.end()));
		self.set_commit(new_commit);
	}

	pub fn is_committed(&self, off: u64) -> bool {
		self.is_offset_larger(self.commit(), off)
	}

	/// Reserves space for the next entry, applying the wrap rule. Returns the entry offset
	/// and, when wrapping skipped usable space, the offset where a wrap marker must be
	/// stamped so readers follow the same jump. Must be called under the submission lock
	pub fn reserve(&self, payload_len: usize) -> (u64, Option<u64>) {
		let len = self.len();
		let entry_len = entry_len_for(payload_len);
		assert!(entry_len <= len);

		let mut end = self.end();
		let mut marker = None;

		if end == len {
			// First entry ever
			end = 0;
		} else if !self.fit_entry_header(end) {
			// Too little space even for a header; readers re-wrap implicitly
			end = 0;
		} else if end + entry_len > len {
			// Header fits but the payload does not; leave an explicit marker behind
			marker = Some(end);
			end = 0;
		}

		self.set_tail(end);
		self.set_end(end + entry_len);

		(end, marker)
	}

	/// Stamps a wrap marker at the given entry offset (see WRAP_MARK)
	pub fn stamp_wrap_marker(&self, off: u64) {
		let mut buf = [0u8; 4];
		LittleEndian::write_u32(&mut buf, WRAP_MARK);
		self.region.write_final_byte_last(ENTRIES_OFF + off as usize + HDR_DATA_SIZE, &buf);
	}

	pub fn is_wrap_marker(&self, off: u64) -> bool {
		// All four bytes of WRAP_MARK are 0xff, so observing the published last byte means
		// the whole field is visible
		let base = ENTRIES_OFF + off as usize + HDR_DATA_SIZE;
		if self.region.atomic_u8(base + 3).load(Ordering::Acquire) != 0xff {
			return false;
		}
		let mut buf = [0u8; 4];
		self.region.read(base, &mut buf);
		LittleEndian::read_u32(&buf) == WRAP_MARK
	}

	/// Fills a reserved entry: ack area zeroed, payload and header fields first, the
	/// trailing sentinel last. After this returns, the bytes at [off, off+entry_len) are
	/// the exact image replicated to the followers
	pub fn write_entry(&self, off: u64, hdr: &EntryHeader, payload: &[u8]) {
		debug_assert_eq!(hdr.data_size as usize, payload.len() + 1);

		let base = ENTRIES_OFF + off as usize;

		// A wrapped log reuses old bytes; stale ack slots must never count toward quorum
		let zeros = [0u8; ACK_AREA_SIZE];
		self.region.write(base, &zeros);

		let mut fixed = [0u8; ENTRY_HEADER_SIZE - ACK_AREA_SIZE];
		hdr.msg_vs.write_to(&mut fixed[0..VIEW_STAMP_SIZE]);
		hdr.req_canbe_exed.write_to(&mut fixed[VIEW_STAMP_SIZE..2 * VIEW_STAMP_SIZE]);
		fixed[HDR_NODE_ID - ACK_AREA_SIZE] = hdr.node_id;
		LittleEndian::write_u32(&mut fixed[HDR_DATA_SIZE - ACK_AREA_SIZE..HDR_TYPE - ACK_AREA_SIZE], hdr.data_size);
		fixed[HDR_TYPE - ACK_AREA_SIZE] = hdr.entry_type.to_u8();
		hdr.clt_id.write_to(&mut fixed[HDR_CLT_ID - ACK_AREA_SIZE..]);
		self.region.write(base + ACK_AREA_SIZE, &fixed);

		self.region.write(base + ENTRY_HEADER_SIZE, payload);

		let sentinel_off = base + ENTRY_HEADER_SIZE + payload.len();
		self.region.atomic_u8(sentinel_off).store(SENTINEL, Ordering::Release);
	}

	/// Raw data_size field, used by pollers before the header is trusted
	pub fn data_size_at(&self, off: u64) -> u32 {
		let mut buf = [0u8; 4];
		self.region.read(ENTRIES_OFF + off as usize + HDR_DATA_SIZE, &mut buf);
		LittleEndian::read_u32(&buf)
	}

	/// Checks the trailing sentinel of the entry at `off` assuming the given data_size
	pub fn sentinel_ok(&self, off: u64, data_size: u32) -> bool {
		if data_size == 0 || data_size == WRAP_MARK {
			return false;
		}
		let sentinel_off = ENTRIES_OFF + off as usize + ENTRY_HEADER_SIZE + data_size as usize - 1;
		if sentinel_off >= self.region.len() {
			return false;
		}
		self.region.atomic_u8(sentinel_off).load(Ordering::Acquire) == SENTINEL
	}

	/// Decodes the fixed header of the entry at `off`; the caller must have validated the
	/// sentinel first
	pub fn read_header(&self, off: u64) -> Option<EntryHeader> {
		let base = ENTRIES_OFF + off as usize;
		let mut buf = [0u8; ENTRY_HEADER_SIZE - ACK_AREA_SIZE];
		self.region.read(base + ACK_AREA_SIZE, &mut buf);

		Some(EntryHeader {
			msg_vs: ViewStamp::read_from(&buf[0..VIEW_STAMP_SIZE]),
			req_canbe_exed: ViewStamp::read_from(&buf[VIEW_STAMP_SIZE..2 * VIEW_STAMP_SIZE]),
			node_id: buf[HDR_NODE_ID - ACK_AREA_SIZE],
			data_size: LittleEndian::read_u32(&buf[HDR_DATA_SIZE - ACK_AREA_SIZE..HDR_TYPE - ACK_AREA_SIZE]),
			entry_type: EntryType::from_u8(buf[HDR_TYPE - ACK_AREA_SIZE])?,
			clt_id: ViewStamp::read_from(&buf[HDR_CLT_ID - ACK_AREA_SIZE..])
		})
	}

	pub fn read_payload(&self, off: u64, data_size: u32) -> Vec<u8> {
		let mut out = vec![0u8; data_size as usize - 1];
		self.region.read(ENTRIES_OFF + off as usize + ENTRY_HEADER_SIZE, &mut out);
		out
	}

	/// The full replicated image of an entry (header, payload and sentinel)
	pub fn read_entry_bytes(&self, off: u64, entry_len: u64) -> Vec<u8> {
		let mut out = vec![0u8; entry_len as usize];
		self.region.read(ENTRIES_OFF + off as usize, &mut out);
		out
	}

	/// Region offset at which peer `idx` writes its ack for the entry at `off`
	pub fn ack_slot_offset(entry_off: u64, idx: ServerIdx) -> u64 {
		ENTRIES_OFF as u64 + entry_off + (idx as u64) * ACK_SLOT_SIZE as u64
	}

	/// Region offset of the data_size field of the entry at `off` (wrap-marker writes)
	pub fn marker_field_offset(entry_off: u64) -> u64 {
		ENTRIES_OFF as u64 + entry_off + HDR_DATA_SIZE as u64
	}

	/// Reads ack slot i of the entry at `off`; returns None while the slot is empty.
	/// Slots carry idx+1 on the wire so that zero can mean "no ack yet"
	pub fn read_ack(&self, entry_off: u64, i: usize) -> Option<(ServerIdx, u64)> {
		let base = ENTRIES_OFF + entry_off as usize + i * ACK_SLOT_SIZE;

		let marker = self.region.atomic_u8(base).load(Ordering::Acquire);
		if marker == 0 {
			return None;
		}

		let mut buf = [0u8; 8];
		self.region.read(base + 1, &mut buf);
		Some((marker - 1, LittleEndian::read_u64(&buf)))
	}

	/// Enumerates entries from `start` to the current end, following wrap markers. The
	/// callback returns false to stop early
	pub fn for_each_from<F: FnMut(u64, &EntryHeader) -> bool>(&self, start: u64, mut f: F) {
		let mut off = start;

		while self.offset_end_distance(off) != 0 {
			if !self.fit_entry_header(off) || self.is_wrap_marker(off) {
				off = 0;
				continue;
			}

			let hdr = match self.read_header(off) {
				Some(h) => h,
				None => break
			};
			if hdr.data_size == 0 {
				break;
			}

			if !f(off, &hdr) {
				break;
			}
			off += hdr.entry_len();
		}
	}

	/// Enumerates committed-but-not-applied entries in order
	pub fn for_each_nc<F: FnMut(u64, &EntryHeader) -> bool>(&self, mut f: F) {
		let commit = self.commit();
		let mut off = self.apply();

		while self.is_offset_larger(commit, off) {
			if !self.fit_entry_header(off) || self.is_wrap_marker(off) {
				off = 0;
				continue;
			}

			let hdr = match self.read_header(off) {
				Some(h) => h,
				None => break
			};
			if hdr.data_size == 0 {
				break;
			}

			if !f(off, &hdr) {
				break;
			}
			off += hdr.entry_len();
		}
	}

	/// Publishes this log's not-committed entries (commit..end) into the nc buffer so a
	/// new leader can read them for reconciliation. Done while remote log access is
	/// revoked, so the snapshot is stable
	pub fn fill_nc_buf(&self) {
		let mut count = 0usize;

		self.for_each_from(self.commit(), |off, hdr| {
			if count == NC_MAX {
				return false;
			}

			let base = OFF_NC_ENTRIES + count * NC_ENTRY_SIZE;
			let mut buf = [0u8; NC_ENTRY_SIZE];
			LittleEndian::write_u64(&mut buf[0..8], hdr.msg_vs.to_key());
			LittleEndian::write_u64(&mut buf[8..16], off);
			self.region.write(base, &buf);

			count += 1;
			true
		});

		self.region.atomic_u64(OFF_NC_LEN).store(count as u64, Ordering::Release);
	}

	/// Decodes an nc buffer image fetched from a peer (len word plus entries)
	pub fn parse_nc_buf(buf: &[u8]) -> Vec<(u64, u64)> {
		let count = LittleEndian::read_u64(&buf[0..8]) as usize;
		let mut out = Vec::with_capacity(count);

		for i in 0..count.min(NC_MAX) {
			let base = 8 + i * NC_ENTRY_SIZE;
			let key = LittleEndian::read_u64(&buf[base..base + 8]);
			let off = LittleEndian::read_u64(&buf[base + 8..base + 16]);
			out.push((key, off));
		}

		out
	}
}


#[cfg(test)]
mod tests {
	use super::*;

	fn append(log: &Log, vs: ViewStamp, payload: &[u8]) -> u64 {
		let (off, marker) = log.reserve(payload.len());
		if let Some(m) = marker {
			log.stamp_wrap_marker(m);
		}

		log.write_entry(off, &EntryHeader {
			msg_vs: vs,
			req_canbe_exed: ViewStamp::new(1, 0),
			node_id: 0,
			data_size: payload.len() as u32 + 1,
			entry_type: EntryType::Send,
			clt_id: ViewStamp::new(1, 1)
		}, payload);

		off
	}

	#[test]
	fn first_entry_lands_at_zero() {
		let log = Log::new(4096);
		assert!(log.is_empty());

		let off = append(&log, ViewStamp::new(1, 1), b"hello");
		assert_eq!(off, 0);
		assert_eq!(log.tail(), 0);
		assert_eq!(log.end(), entry_len_for(5));
		assert!(!log.is_empty());
	}

	#[test]
	fn sentinel_gates_visibility() {
		let log = Log::new(4096);
		let (off, _) = log.reserve(5);

		// Reserved but not yet filled: nothing observable
		assert_eq!(log.data_size_at(off), 0);
		assert!(!log.sentinel_ok(off, log.data_size_at(off)));

		log.write_entry(off, &EntryHeader {
			msg_vs: ViewStamp::new(1, 1),
			req_canbe_exed: ViewStamp::new(1, 0),
			node_id: 2,
			data_size: 6,
			entry_type: EntryType::Send,
			clt_id: ViewStamp::new(1, 1)
		}, b"hello");

		let ds = log.data_size_at(off);
		assert_eq!(ds, 6);
		assert!(log.sentinel_ok(off, ds));

		let hdr = log.read_header(off).unwrap();
		assert_eq!(hdr.msg_vs, ViewStamp::new(1, 1));
		assert_eq!(hdr.node_id, 2);
		assert_eq!(log.read_payload(off, ds), b"hello");
	}

	#[test]
	fn no_entry_straddles_the_wrap() {
		// Size the log so the second entry's header fits at the tail but its payload
		// does not: the reserve must jump to zero and leave a marker behind
		let e1 = entry_len_for(16);
		let log = Log::new(e1 + ENTRY_HEADER_SIZE as u64 + 8);

		let off1 = append(&log, ViewStamp::new(1, 1), &[7u8; 16]);
		assert_eq!(off1, 0);

		let (off2, marker) = log.reserve(64);
		assert_eq!(off2, 0);
		assert_eq!(marker, Some(e1));

		log.stamp_wrap_marker(e1);
		assert!(log.is_wrap_marker(e1));
	}

	#[test]
	fn ack_slots_round_trip() {
		let log = Log::new(4096);
		let off = append(&log, ViewStamp::new(1, 1), b"x");

		assert_eq!(log.read_ack(off, 1), None);

		// Simulate a one-sided ack write from server 1 (wire id 2)
		let slot = Log::ack_slot_offset(off, 1);
		let region = log.region();
		let mut hash = [0u8; 8];
		LittleEndian::write_u64(&mut hash, 0xdead);
		region.write(slot as usize + 1, &hash);
		region.atomic_u8(slot as usize).store(2, Ordering::Release);

		assert_eq!(log.read_ack(off, 1), Some((1, 0xdead)));
	}

	#[test]
	fn wrapped_entries_have_clean_ack_slots() {
		// Fill and reuse the start of the log; the second lap must not inherit acks
		let log = Log::new(2 * entry_len_for(8));

		let off = append(&log, ViewStamp::new(1, 1), &[1u8; 8]);
		let slot = Log::ack_slot_offset(off, 0);
		log.region().atomic_u8(slot as usize).store(3, Ordering::Release);
		assert!(log.read_ack(off, 0).is_some());

		append(&log, ViewStamp::new(1, 2), &[2u8; 8]);
		// Wraps back over offset 0
		let off3 = append(&log, ViewStamp::new(1, 3), &[3u8; 8]);
		assert_eq!(off3, 0);
		assert_eq!(log.read_ack(off3, 0), None);
	}

	#[test]
	fn for_each_nc_walks_commit_to_apply_gap() {
		let log = Log::new(65536);

		let mut offs = vec![];
		for i in 1..5 {
			offs.push(append(&log, ViewStamp::new(1, i), b"pay"));
		}

		// Commit the first three, apply none
		log.advance_commit(offs[3]);

		let mut seen = vec![];
		log.for_each_nc(|off, hdr| {
			seen.push((off, hdr.msg_vs.req_id));
			true
		});

		assert_eq!(seen.len(), 3);
		assert_eq!(seen[0], (offs[0], 1));
		assert_eq!(seen[2], (offs[2], 3));
	}

	#[test]
	fn nc_buf_round_trip() {
		let log = Log::new(65536);

		for i in 1..4 {
			append(&log, ViewStamp::new(1, i), b"abc");
		}
		log.advance_commit(entry_len_for(3));

		log.fill_nc_buf();

		// Read the nc area the way a remote leader would
		let mut img = vec![0u8; 8 + NC_MAX * NC_ENTRY_SIZE];
		log.region().read(OFF_NC_LEN, &mut img);

		let parsed = Log::parse_nc_buf(&img);
		assert_eq!(parsed.len(), 2);
		assert_eq!(parsed[0].0, ViewStamp::new(1, 2).to_key());
		assert_eq!(parsed[1].0, ViewStamp::new(1, 3).to_key());
	}

	#[test]
	fn offset_ordering_respects_wrap() {
		let log = Log::new(1024);
		log.set_head(800);
		log.set_end(700);

		// 100 is "after" 900 when the head sits at 800
		assert!(log.is_offset_larger(100, 900));
		assert!(!log.is_offset_larger(900, 100));
	}
}
