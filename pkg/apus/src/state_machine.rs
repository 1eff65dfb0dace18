use std::collections::HashMap;
use std::sync::Mutex;

use byteorder::{ByteOrder, LittleEndian};

use protos::{EntryType, ViewStamp};


/// A record as handed to the replay sink: the decoded payload of one committed entry
#[derive(Clone, PartialEq, Debug)]
pub struct Record {
	pub entry_type: EntryType,
	pub clt_id: ViewStamp,
	pub data: Vec<u8>
}

impl Record {
	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(6 + self.data.len());
		out.push(self.entry_type.to_u8());
		let mut vs = [0u8; 5];
		self.clt_id.write_to(&mut vs);
		out.extend_from_slice(&vs);
		out.extend_from_slice(&self.data);
		out
	}

	pub fn decode(bytes: &[u8]) -> Option<Record> {
		if bytes.len() < 6 {
			return None;
		}

		Some(Record {
			entry_type: EntryType::from_u8(bytes[0])?,
			clt_id: ViewStamp::read_from(&bytes[1..6]),
			data: bytes[6..].to_vec()
		})
	}
}


/// The boundary between committed records and whatever consumes them
///
/// Followers drive their local application replica through this; tests plug in an
/// in-memory implementation. Applies arrive in commit order and implementations must treat
/// the key as an at-most-once token
pub trait StateMachine: Send + Sync {
	/// Deliver one committed record. Returns false if the key was already applied
	fn apply(&self, key: u64, record: &Record) -> bool;

	/// The local output hash at the given logical position of a connection (OUTPUT checks)
	fn output_hash(&self, clt_id: ViewStamp, hash_index: i64) -> u64;

	/// Opaque snapshot of the whole machine state
	fn snapshot(&self) -> Vec<u8>;

	/// Replace the machine state with a snapshot
	fn restore(&self, data: &[u8]);
}


/// In-memory state machine used by the tests: remembers every applied record in order and
/// enforces at-most-once by key
pub struct MemoryStateMachine {
	inner: Mutex<MemoryInner>
}

struct MemoryInner {
	applied: Vec<(u64, Record)>,
	seen: HashMap<u64, ()>
}

impl MemoryStateMachine {
	pub fn new() -> MemoryStateMachine {
		MemoryStateMachine {
			inner: Mutex::new(MemoryInner {
				applied: vec![],
				seen: HashMap::new()
			})
		}
	}

	pub fn applied(&self) -> Vec<(u64, Record)> {
		self.inner.lock().unwrap().applied.clone()
	}

	pub fn applied_len(&self) -> usize {
		self.inner.lock().unwrap().applied.len()
	}
}

impl StateMachine for MemoryStateMachine {
	fn apply(&self, key: u64, record: &Record) -> bool {
		let mut inner = self.inner.lock().unwrap();
		if inner.seen.contains_key(&key) {
			return false;
		}

		inner.seen.insert(key, ());
		inner.applied.push((key, record.clone()));
		true
	}

	fn output_hash(&self, _clt_id: ViewStamp, _hash_index: i64) -> u64 {
		0
	}

	fn snapshot(&self) -> Vec<u8> {
		let inner = self.inner.lock().unwrap();

		let mut out = vec![];
		for (key, rec) in inner.applied.iter() {
			let enc = rec.encode();
			let mut hdr = [0u8; 12];
			LittleEndian::write_u64(&mut hdr[0..8], *key);
			LittleEndian::write_u32(&mut hdr[8..12], enc.len() as u32);
			out.extend_from_slice(&hdr);
			out.extend_from_slice(&enc);
		}
		out
	}

	fn restore(&self, data: &[u8]) {
		let mut inner = self.inner.lock().unwrap();
		inner.applied.clear();
		inner.seen.clear();

		let mut off = 0usize;
		while off + 12 <= data.len() {
			let key = LittleEndian::read_u64(&data[off..off + 8]);
			let len = LittleEndian::read_u32(&data[off + 8..off + 12]) as usize;
			off += 12;

			if off + len > data.len() {
				break;
			}
			if let Some(rec) = Record::decode(&data[off..off + len]) {
				inner.seen.insert(key, ());
				inner.applied.push((key, rec));
			}
			off += len;
		}
	}
}


#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn record_codec_round_trip() {
		let rec = Record {
			entry_type: EntryType::Send,
			clt_id: ViewStamp::new(1, 4),
			data: b"hello".to_vec()
		};

		assert_eq!(Record::decode(&rec.encode()), Some(rec));
	}

	#[test]
	fn memory_sm_is_at_most_once() {
		let sm = MemoryStateMachine::new();
		let rec = Record {
			entry_type: EntryType::Send,
			clt_id: ViewStamp::new(1, 1),
			data: vec![1]
		};

		assert!(sm.apply(10, &rec));
		assert!(!sm.apply(10, &rec));
		assert_eq!(sm.applied_len(), 1);
	}

	#[test]
	fn snapshot_restore_round_trip() {
		let sm = MemoryStateMachine::new();
		for i in 1..4u32 {
			sm.apply(i as u64, &Record {
				entry_type: EntryType::Send,
				clt_id: ViewStamp::new(1, i),
				data: vec![i as u8]
			});
		}

		let snap = sm.snapshot();

		let other = MemoryStateMachine::new();
		other.restore(&snap);
		assert_eq!(other.applied(), sm.applied());

		// Restored keys still count for dedup
		assert!(!other.apply(2, &Record {
			entry_type: EntryType::Nop,
			clt_id: ViewStamp::new(0, 0),
			data: vec![]
		}));
	}
}
