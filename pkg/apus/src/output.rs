use std::collections::HashMap;
use std::sync::Mutex;

use libc::c_int;

use protos::ServerIdx;


/// Reflected form of the Jones polynomial
const CRC64_POLY: u64 = 0x95ac9329ac4bc9b5;

/// Rolling 64-bit CRC; feeding chunks in sequence equals hashing the concatenation.
/// The chunks are small (16 bytes), so the bitwise form beats carrying a table around
pub fn crc64(mut crc: u64, data: &[u8]) -> u64 {
	for b in data {
		crc ^= *b as u64;
		for _ in 0..8 {
			crc = if crc & 1 != 0 { (crc >> 1) ^ CRC64_POLY } else { crc >> 1 };
		}
	}
	crc
}


/// Every CHECK_PERIOD-th probe of a connection proposes an output consistency check
const CHECK_PERIOD: u64 = 10;
/// The proposed hash is from this many rounds back, so slow replicas have caught up
const CHECK_GOBACK: i64 = 5;
/// Output bytes are folded into the hash in chunks of this size
const HASH_BUFFER_SIZE: usize = 16;


struct OutputHandler {
	/// Hash after each full chunk, indexed by round
	hashes: Vec<u64>,
	hash: u64,
	buf: [u8; HASH_BUFFER_SIZE],
	buf_len: usize,
	/// How many times determine_output was called for this fd
	called: u64
}

impl OutputHandler {
	fn new() -> OutputHandler {
		OutputHandler {
			hashes: vec![],
			hash: 0,
			buf: [0u8; HASH_BUFFER_SIZE],
			buf_len: 0,
			called: 0
		}
	}
}

/// Per-fd output hash bookkeeping for the divergence detector
pub struct OutputManager {
	handlers: Mutex<HashMap<c_int, OutputHandler>>
}

impl OutputManager {
	pub fn new() -> OutputManager {
		OutputManager {
			handlers: Mutex::new(HashMap::new())
		}
	}

	/// Folds application output bytes into the connection's rolling hash. Returns how many
	/// new hash rounds completed
	pub fn store_output(&self, fd: c_int, buf: &[u8]) -> usize {
		if buf.is_empty() {
			return 0;
		}

		let mut handlers = self.handlers.lock().unwrap();
		let handler = handlers.entry(fd).or_insert_with(OutputHandler::new);

		let mut pushed = 0usize;
		let mut rounds = 0usize;

		while pushed < buf.len() {
			let space = HASH_BUFFER_SIZE - handler.buf_len;
			let take = space.min(buf.len() - pushed);

			handler.buf[handler.buf_len..handler.buf_len + take]
				.copy_from_slice(&buf[pushed..pushed + take]);
			handler.buf_len += take;
			pushed += take;

			if handler.buf_len == HASH_BUFFER_SIZE {
				handler.hash = crc64(handler.hash, &handler.buf);
				handler.buf_len = 0;
				let h = handler.hash;
				handler.hashes.push(h);
				rounds += 1;
			}
		}

		rounds
	}

	/// Decides whether this probe should trigger a consistency check; if so, returns the
	/// hash round to propose (a few rounds back)
	pub fn determine_output(&self, fd: c_int) -> i64 {
		let mut handlers = self.handlers.lock().unwrap();
		let handler = handlers.entry(fd).or_insert_with(OutputHandler::new);

		handler.called += 1;
		if handler.called % CHECK_PERIOD != 0 {
			return -1;
		}

		let round = handler.hashes.len() as i64 - CHECK_GOBACK;
		if round >= 0 { round } else { -1 }
	}

	/// Hash at the given round; 0 when the replica has not reached that round yet
	pub fn get_hash(&self, fd: c_int, hash_index: i64) -> u64 {
		if hash_index < 0 {
			return 0;
		}

		let handlers = self.handlers.lock().unwrap();
		match handlers.get(&fd) {
			Some(h) => h.hashes.get(hash_index as usize).cloned().unwrap_or(0),
			None => 0
		}
	}

	pub fn del_output(&self, fd: c_int) {
		self.handlers.lock().unwrap().remove(&fd);
	}
}


/// One replica's contribution to a divergence decision
#[derive(Clone, Copy, Debug)]
pub struct OutputPeer {
	pub node_id: ServerIdx,
	pub hash: u64,
	pub hash_index: i64
}

/// Outcome of a divergence check
#[derive(Clone, PartialEq, Debug)]
pub enum Decision {
	/// D0: everybody agrees
	AllAgree,
	/// D1: the leader sides with the majority; the listed replicas must be restored
	RestoreMinority(Vec<ServerIdx>),
	/// D2: the leader disagrees with the majority; leader and minority must be restored
	RestoreLeaderAndMinority(Vec<ServerIdx>),
	/// D3: no majority exists; everybody must be restored
	RestoreAll
}

/// The divergence decision over one hash round. None when any replica reported hash 0
/// (it has not computed that round yet), making the round inconclusive
pub fn decide(peers: &[OutputPeer], leader: ServerIdx) -> Option<Decision> {
	if peers.is_empty() {
		return None;
	}
	if peers.iter().any(|p| p.hash == 0) {
		return None;
	}

	let group_size = peers.len();
	let threshold = group_size / 2 + 1;

	let leader_hash = peers.iter()
		.find(|p| p.node_id == leader)
		.map(|p| p.hash)?;

	let count_of = |hash: u64| peers.iter().filter(|p| p.hash == hash).count();

	let leader_count = count_of(leader_hash);
	if leader_count == group_size {
		return Some(Decision::AllAgree);
	}

	if leader_count >= threshold {
		let minority = peers.iter()
			.filter(|p| p.hash != leader_hash)
			.map(|p| p.node_id)
			.collect();
		return Some(Decision::RestoreMinority(minority));
	}

	// Is there a majority at all?
	let mut major_hash = 0;
	let mut major_count = 0;
	for p in peers {
		let c = count_of(p.hash);
		if c > major_count {
			major_count = c;
			major_hash = p.hash;
		}
	}

	if major_count >= threshold {
		let to_restore = peers.iter()
			.filter(|p| p.hash != major_hash)
			.map(|p| p.node_id)
			.collect();
		return Some(Decision::RestoreLeaderAndMinority(to_restore));
	}

	Some(Decision::RestoreAll)
}
