use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

use config_state::ConfigAction;
use consensus::ConsensusModule;
use ctrl::CtrlRegion;
use errors::*;
use log::{self, Log, EntryHeader};
use protos::*;
use state_machine::{Record, StateMachine};
use sync::{Event, SpinLock};
use transport::{SendFlags, Transport};


/// Result of a leader submission: where the entry sits and the stamp it was assigned
#[derive(Clone, Copy, Debug)]
pub struct Submitted {
	pub vs: ViewStamp,
	pub offset: u64
}


/// The replication engine: the leader submission path, commit advancement, the follower
/// accept loop and the apply machinery shared by both roles
pub struct Engine {
	idx: ServerIdx,

	log: Arc<Log>,
	ctrl: Arc<CtrlRegion>,
	transport: Arc<Transport>,
	consensus: Arc<Mutex<ConsensusModule>>,
	store: Arc<::record_store::RecordStore>,
	sink: Mutex<Arc<StateMachine>>,

	/// Cached configuration for lock-free-ish quorum checks on the hot path; refreshed
	/// whenever a CONFIG entry applies
	cid: Mutex<Cid>,

	/// Serialises offset reservation and per-peer send-window bookkeeping
	submit_lock: SpinLock<()>,

	/// Serialises commit advancement between submitters and the idle-path poller
	commit_lock: Mutex<()>,
	commit_event: Event,

	highest_seen: AtomicU64,
	highest_committed: AtomicU64,
	applied_up_to: AtomicU64,

	/// Checkpoint protocol: a set flag makes the accept loop return
	pub pause: AtomicBool,
	pub shutdown: Arc<AtomicBool>
}

impl Engine {
	pub fn new(idx: ServerIdx, log: Arc<Log>, ctrl: Arc<CtrlRegion>, transport: Arc<Transport>,
		consensus: Arc<Mutex<ConsensusModule>>, store: Arc<::record_store::RecordStore>,
		sink: Arc<StateMachine>, cid: Cid, shutdown: Arc<AtomicBool>) -> Engine
	{
		Engine {
			idx,
			log,
			ctrl,
			transport,
			consensus,
			store,
			sink: Mutex::new(sink),
			cid: Mutex::new(cid),
			submit_lock: SpinLock::new(()),
			commit_lock: Mutex::new(()),
			commit_event: Event::new(),
			highest_seen: AtomicU64::new(0),
			highest_committed: AtomicU64::new(0),
			applied_up_to: AtomicU64::new(0),
			pause: AtomicBool::new(false),
			shutdown
		}
	}

	pub fn set_cid(&self, cid: Cid) {
		*self.cid.lock().unwrap() = cid;
	}

	/// Swaps in the real replay sink; used once during server assembly, since the sink
	/// itself needs a handle on this engine to submit captured events
	pub fn set_sink(&self, sink: Arc<StateMachine>) {
		*self.sink.lock().unwrap() = sink;
	}

	fn sink(&self) -> Arc<StateMachine> {
		self.sink.lock().unwrap().clone()
	}

	pub fn cid(&self) -> Cid {
		*self.cid.lock().unwrap()
	}

	pub fn is_leader(&self) -> bool {
		let sid = self.ctrl.sid();
		sid.has_leader() && sid.idx() == self.idx
	}

	/// Snapshot of the ack slots of one entry (output divergence checks)
	pub fn entry_acks(&self, off: u64) -> Vec<(ServerIdx, u64)> {
		(0..MAX_SERVERS).filter_map(|i| self.log.read_ack(off, i)).collect()
	}

	pub fn highest_committed(&self) -> ViewStamp {
		ViewStamp::from_key(self.highest_committed.load(Ordering::Acquire))
	}

	pub fn applied(&self) -> ViewStamp {
		ViewStamp::from_key(self.applied_up_to.load(Ordering::Acquire))
	}

	/// Installs the stamps a recovering server learned from a snapshot, so replay resumes
	/// right after the snapshot instead of from the beginning
	pub fn install_watermarks(&self, applied_key: u64, committed_key: u64) {
		self.applied_up_to.store(applied_key, Ordering::Release);
		self.highest_committed.store(committed_key, Ordering::Release);
		if applied_key > self.highest_seen.load(Ordering::Acquire) {
			self.highest_seen.store(applied_key, Ordering::Release);
		}
	}

	pub fn commit_event(&self) -> &Event {
		&self.commit_event
	}

	fn peers(&self) -> Vec<ServerIdx> {
		let cid = *self.cid.lock().unwrap();
		(0..cid.extended_size())
			.filter(|i| *i != self.idx && cid.is_on(*i))
			.collect()
	}

	fn quorum(&self, bitmap: u32) -> bool {
		self.cid.lock().unwrap().quorum(bitmap)
	}

	/* ================================================================== */
	/* Leader submission path */

	/// Submits one captured event for replication and blocks until it is committed.
	/// For CONNECT entries the assigned stamp becomes the connection's identity
	pub fn leader_submit(&self, entry_type: EntryType, payload: &[u8],
		clt_id: Option<ViewStamp>) -> Result<Submitted>
	{
		let sid = self.ctrl.sid();
		if !sid.has_leader() || sid.idx() != self.idx {
			bail!("not the leader");
		}
		let view = sid.term() as u8;

		let peers = self.peers();
		let mut flags = [SendFlags::default(); MAX_SERVERS];

		// Critical section: stamp assignment, offset reservation and send-window flags.
		// Nothing here may block
		let (next, off, marker) = {
			let _guard = self.submit_lock.lock();

			let seen = ViewStamp::from_key(self.highest_seen.load(Ordering::Acquire));
			let next = if seen.view_id != view {
				ViewStamp::new(view, 1)
			} else {
				seen.next()
			};
			self.highest_seen.store(next.to_key(), Ordering::Release);

			let (off, marker) = self.log.reserve(payload.len());

			for i in peers.iter() {
				if self.transport.is_connected(*i) {
					flags[*i as usize] = self.transport.reserve_send(*i);
				}
			}

			(next, off, marker)
		};

		let clt = match entry_type {
			EntryType::Connect | EntryType::UdpConnect => next,
			EntryType::Nop => ViewStamp::new(0, 0),
			_ => clt_id.unwrap_or(ViewStamp::new(0, 0))
		};

		let hdr = EntryHeader {
			msg_vs: next,
			req_canbe_exed: self.highest_committed(),
			node_id: self.idx,
			data_size: payload.len() as u32 + 1,
			entry_type,
			clt_id: clt
		};

		if let Some(m) = marker {
			self.log.stamp_wrap_marker(m);
		}
		self.log.write_entry(off, &hdr, payload);
		self.consensus.lock().unwrap().note_append();

		// Durable before replication on the leader; a failure here is logged and the
		// client sees an error, while the entry itself still replicates
		let record = Record { entry_type, clt_id: clt, data: payload.to_vec() };
		let store_res = self.store.store_record(next.to_key(), &record.encode());
		if let Err(ref e) = store_res {
			eprintln!("record store write failed for {:?}: {}", next, e);
		}

		self.fan_out(&peers, &flags, off, hdr.entry_len(), marker);

		// Busy-wait on the ack slots until the configuration's quorum is reached
		let mut bitmap: u32 = 1 << self.idx;
		let mut spins = 0u64;
		loop {
			for i in 0..MAX_SERVERS {
				if let Some((node, _)) = self.log.read_ack(off, i) {
					bitmap |= 1 << node;
				}
			}
			if self.quorum(bitmap) {
				break;
			}

			spins += 1;
			if spins & 0x3ff == 0 {
				if self.shutdown.load(Ordering::Acquire) {
					bail!("shutting down");
				}
				let now = self.ctrl.sid();
				if !now.has_leader() || now.idx() != self.idx || now.term() != sid.term() {
					bail!("leadership lost while waiting for quorum");
				}
			}
			::std::sync::atomic::spin_loop_hint();
		}

		if !self.commit_in_order(off, hdr.entry_len(), next) {
			bail!("leadership lost before the entry committed");
		}

		store_res?;
		Ok(Submitted { vs: next, offset: off })
	}

	/// Appends and replicates a control entry (CONFIG, HEAD, blank NOOP) without waiting
	/// for the quorum; commit is picked up by the idle-path poller
	pub fn submit_control(&self, entry_type: EntryType, payload: &[u8]) -> Result<Submitted> {
		let sid = self.ctrl.sid();
		if !sid.has_leader() || sid.idx() != self.idx {
			bail!("not the leader");
		}
		let view = sid.term() as u8;

		let peers = self.peers();
		let mut flags = [SendFlags::default(); MAX_SERVERS];

		let (next, off, marker) = {
			let _guard = self.submit_lock.lock();

			let seen = ViewStamp::from_key(self.highest_seen.load(Ordering::Acquire));
			let next = if seen.view_id != view {
				ViewStamp::new(view, 1)
			} else {
				seen.next()
			};
			self.highest_seen.store(next.to_key(), Ordering::Release);

			let (off, marker) = self.log.reserve(payload.len());

			for i in peers.iter() {
				if self.transport.is_connected(*i) {
					flags[*i as usize] = self.transport.reserve_send(*i);
				}
			}

			(next, off, marker)
		};

		let hdr = EntryHeader {
			msg_vs: next,
			req_canbe_exed: self.highest_committed(),
			node_id: self.idx,
			data_size: payload.len() as u32 + 1,
			entry_type,
			clt_id: ViewStamp::new(0, 0)
		};

		if let Some(m) = marker {
			self.log.stamp_wrap_marker(m);
		}
		self.log.write_entry(off, &hdr, payload);
		if entry_type != EntryType::Head {
			self.consensus.lock().unwrap().note_append();
		}

		let record = Record { entry_type, clt_id: ViewStamp::new(0, 0), data: payload.to_vec() };
		if let Err(e) = self.store.store_record(next.to_key(), &record.encode()) {
			eprintln!("record store write failed for {:?}: {}", next, e);
		}

		self.fan_out(&peers, &flags, off, hdr.entry_len(), marker);

		Ok(Submitted { vs: next, offset: off })
	}

	fn fan_out(&self, peers: &[ServerIdx], flags: &[SendFlags; MAX_SERVERS], off: u64,
		entry_len: u64, marker: Option<u64>)
	{
		let bytes = self.log.read_entry_bytes(off, entry_len);

		for i in peers.iter() {
			if !self.transport.is_connected(*i) {
				continue;
			}
			let rc = match self.transport.peer_rc_info(*i) {
				Some(rc) => rc,
				None => continue
			};

			if flags[*i as usize].must_poll {
				self.transport.poll_completions(*i, 1);
			}

			// The wrap marker must land before the wrapped entry so the remote accept
			// loop follows the same jump
			if let Some(m) = marker {
				let mark = [0xffu8; 4];
				let _ = self.transport.write(*i, &mark,
					rc.log_mr.at(Log::marker_field_offset(m)), SendFlags::default());
			}

			let _ = self.transport.write(*i, &bytes,
				rc.log_mr.at(log::ENTRIES_OFF as u64 + off), flags[*i as usize]);
		}
	}

	/// Waits until every earlier entry has committed, then moves the commit offset over
	/// this entry. Wake-ups ride on the commit event rather than a request-id spin.
	/// Returns false if the wait was abandoned (shutdown or leadership loss)
	fn commit_in_order(&self, off: u64, entry_len: u64, vs: ViewStamp) -> bool {
		loop {
			let done = self.commit_event.wait_while_timeout(|| {
				let c = self.log.commit();
				c != off && !self.log.is_offset_larger(c, off)
			}, Duration::from_millis(100));

			if done {
				break;
			}
			if self.shutdown.load(Ordering::Acquire) {
				return false;
			}
			let sid = self.ctrl.sid();
			if !sid.has_leader() || sid.idx() != self.idx || sid.term() as u8 != vs.view_id {
				// Deposed while waiting; a successor decides this entry's fate
				return false;
			}
		}

		{
			let _guard = self.commit_lock.lock().unwrap();
			if self.log.commit() == off {
				self.log.advance_commit(off + entry_len);
				self.highest_committed.store(vs.to_key(), Ordering::Release);
			}
		}
		self.commit_event.notify_all();
		true
	}

	/// Idle-path commit advancement: walks from the commit offset over entries whose ack
	/// slots already satisfy the quorum (control entries and anything whose submitter is
	/// no longer waiting)
	pub fn poll_commit(&self) {
		let sid = self.ctrl.sid();
		if !sid.has_leader() || sid.idx() != self.idx {
			return;
		}

		let _guard = self.commit_lock.lock().unwrap();
		let mut advanced = false;

		loop {
			let c = self.log.commit();
			if self.log.offset_end_distance(c) == 0 {
				break;
			}

			if !self.log.fit_entry_header(c) || self.log.is_wrap_marker(c) {
				self.log.set_commit(0);
				continue;
			}

			let ds = self.log.data_size_at(c);
			if !self.log.sentinel_ok(c, ds) {
				break;
			}
			let hdr = match self.log.read_header(c) {
				Some(h) => h,
				None => break
			};

			let mut bitmap: u32 = 1 << self.idx;
			for i in 0..MAX_SERVERS {
				if let Some((node, _)) = self.log.read_ack(c, i) {
					bitmap |= 1 << node;
				}
			}
			if !self.quorum(bitmap) {
				break;
			}

			self.log.advance_commit(c + hdr.entry_len());
			self.highest_committed.store(hdr.msg_vs.to_key(), Ordering::Release);
			advanced = true;
		}

		drop(_guard);
		if advanced {
			self.commit_event.notify_all();
		}
	}

	/* ================================================================== */
	/* Apply paths */

	/// Leader-side apply: walk committed entries, fold in CONFIG and HEAD, and advance
	/// the apply offset. Client entries are not replayed here: the leader hosts the live
	/// application. Returns configuration actions for the server to execute.
	/// Note that the cached quorum configuration is NOT refreshed here; the server first
	/// flushes a NOP to the outgoing member set so removed servers still learn the commit
	pub fn apply_committed(&self) -> Vec<ConfigAction> {
		if !self.is_leader() {
			return vec![];
		}

		let mut actions = vec![];

		loop {
			let a = self.log.apply();
			let commit = self.log.commit();
			if !self.log.is_offset_larger(commit, a) {
				break;
			}

			if !self.log.fit_entry_header(a) || self.log.is_wrap_marker(a) {
				self.log.set_apply(0);
				continue;
			}

			let hdr = match self.log.read_header(a) {
				Some(h) => h,
				None => break
			};
			if hdr.data_size == 0 {
				break;
			}

			let key = hdr.msg_vs.to_key();
			match hdr.entry_type {
				EntryType::Config => {
					let payload = self.log.read_payload(a, hdr.data_size);
					if let Some(cid) = Cid::read_from(&payload) {
						let mut consensus = self.consensus.lock().unwrap();
						actions.extend(consensus.apply_config_entry(cid, key));
					}
				},
				EntryType::Head => {
					let payload = self.log.read_payload(a, hdr.data_size);
					if payload.len() >= 8 {
						let head = LittleEndian::read_u64(&payload[0..8]);
						self.consensus.lock().unwrap().apply_head_entry(head);
					}
				},
				_ => {}
			}

			let mut applied = ViewStamp::from_key(self.applied_up_to.load(Ordering::Acquire));
			if hdr.msg_vs > applied {
				applied = hdr.msg_vs;
				self.applied_up_to.store(applied.to_key(), Ordering::Release);
			}

			self.log.set_apply(a + hdr.entry_len());
		}

		actions
	}

	/// Replays stored records in key order up to the given stamp (follower side); stops
	/// early if a record has not been persisted yet. Returns how far it actually got
	fn apply_records_up_to(&self, to: ViewStamp) -> ViewStamp {
		let mut cur = ViewStamp::from_key(self.applied_up_to.load(Ordering::Acquire));

		'outer: while cur < to {
			let next = if self.store.contains(cur.next().to_key()) {
				cur.next()
			} else if cur.view_id < to.view_id {
				// The view changed; entries restart at request id 1 in the first view
				// that actually has entries
				let mut found = None;
				let mut v = cur.view_id.wrapping_add(1);
				loop {
					let cand = ViewStamp::new(v, 1);
					if cand > to {
						break;
					}
					if self.store.contains(cand.to_key()) {
						found = Some(cand);
						break;
					}
					if v == to.view_id {
						break;
					}
					v = v.wrapping_add(1);
				}
				match found {
					Some(vs) => vs,
					None => break 'outer
				}
			} else {
				break;
			};

			if next > to {
				break;
			}

			let bytes = match self.store.retrieve_record(next.to_key()) {
				Some(b) => b,
				None => break
			};
			let record = match Record::decode(&bytes) {
				Some(r) => r,
				None => break
			};

			match record.entry_type {
				EntryType::Config => {
					if let Some(cid) = Cid::read_from(&record.data) {
						let actions = {
							let mut consensus = self.consensus.lock().unwrap();
							let acts = consensus.apply_config_entry(cid, next.to_key());
							self.set_cid(consensus.config.cid);
							acts
						};
						for action in actions {
							match action {
								ConfigAction::Disconnect(i) => self.transport.disconnect(i),
								ConfigAction::ShutdownSelf => {
									self.shutdown.store(true, Ordering::Release);
								},
								// Leader-only actions cannot arise on this path
								_ => {}
							}
						}
					}
				},
				EntryType::Head => {
					if record.data.len() >= 8 {
						let head = LittleEndian::read_u64(&record.data[0..8]);
						self.consensus.lock().unwrap().apply_head_entry(head);
					}
				},
				_ => {
					self.sink().apply(next.to_key(), &record);
				}
			}

			cur = next;
			self.applied_up_to.store(cur.to_key(), Ordering::Release);
		}

		cur
	}

	/* ================================================================== */
	/* Follower accept loop */

	/// The dedicated accept-loop thread body: busy-polls the local log tail for entries
	/// delivered by the leader's one-sided writes. Returns on shutdown or checkpoint pause
	pub fn follower_loop(&self) {
		// Offsets of consumed entries not yet known to be committed
		let mut pending: VecDeque<(ViewStamp, u64)> = VecDeque::new();

		loop {
			if self.shutdown.load(Ordering::Acquire) || self.pause.load(Ordering::Acquire) {
				return;
			}

			let sid = self.ctrl.sid();
			if sid.has_leader() && sid.idx() == self.idx {
				// We are the leader; the accept loop idles
				::std::thread::yield_now();
				continue;
			}

			let end = self.log.end();
			if end == self.log.len() {
				::std::thread::yield_now();
				continue;
			}

			if !self.log.fit_entry_header(end) || self.log.is_wrap_marker(end) {
				self.log.set_end(0);
				continue;
			}

			let ds = self.log.data_size_at(end);
			if ds == 0 || !self.log.sentinel_ok(end, ds) {
				::std::thread::yield_now();
				continue;
			}
			// The sentinel is in; data_size must read back stable before it is trusted
			if self.log.data_size_at(end) != ds {
				continue;
			}

			let hdr = match self.log.read_header(end) {
				Some(h) => h,
				None => continue
			};

			let cur_view = sid.term() as u8;
			let leader = if sid.has_leader() { Some(sid.idx()) } else { None };

			if hdr.msg_vs.view_id > cur_view {
				// Our SID lags behind an election; the heartbeat path will catch us up
				::std::thread::yield_now();
				continue;
			}
			if hdr.msg_vs.view_id == cur_view {
				if let Some(l) = leader {
					if hdr.node_id != l {
						// Not from the current leader; ignore
						::std::thread::yield_now();
						continue;
					}
				}
			}

			let key = hdr.msg_vs.to_key();
			if key > self.highest_seen.load(Ordering::Acquire) {
				self.highest_seen.store(key, Ordering::Release);
			}

			// Persist before acking; a follower that cannot persist must not ack
			let payload = self.log.read_payload(end, ds);
			let record = Record {
				entry_type: hdr.entry_type,
				clt_id: hdr.clt_id,
				data: payload.clone()
			};
			if let Err(e) = self.store.store_record(key, &record.encode()) {
				eprintln!("fatal: record store write failed on follower: {}", e);
				self.shutdown.store(true, Ordering::Release);
				return;
			}

			let entry_end = end + hdr.entry_len();
			self.log.set_tail(end);
			self.log.set_end(entry_end);

			// Type-specific ack bytes: OUTPUT entries carry our local output hash
			let hash = if hdr.entry_type == EntryType::Output && payload.len() >= 8 {
				let hash_index = LittleEndian::read_i64(&payload[0..8]);
				self.sink().output_hash(hdr.clt_id, hash_index)
			} else {
				0
			};

			self.write_ack(leader.unwrap_or(hdr.node_id), end, hash);

			pending.push_back((hdr.msg_vs, entry_end));

			// Apply everything the leader has declared committed
			let canbe = hdr.req_canbe_exed;
			if canbe.to_key() > self.highest_committed.load(Ordering::Acquire) {
				let reached = self.apply_records_up_to(canbe);

				if reached.to_key() > self.highest_committed.load(Ordering::Acquire) {
					let mut new_apply = None;
					while let Some(&(vs, off)) = pending.front() {
						if vs > reached {
							break;
						}
						new_apply = Some(off);
						pending.pop_front();
					}
					if let Some(off) = new_apply {
						let _guard = self.commit_lock.lock().unwrap();
						if self.log.is_offset_larger(off, self.log.commit()) {
							self.log.set_commit(off);
						}
						if self.log.is_offset_larger(off, self.log.apply()) {
							self.log.set_apply(off);
						}
					}

					self.highest_committed.store(reached.to_key(), Ordering::Release);
					self.commit_event.notify_all();
				}
			}
		}
	}

	/// One-sided ack write-back into the appender's log entry: the 8 hash bytes first,
	/// then the single node marker the leader polls on
	fn write_ack(&self, target: ServerIdx, entry_off: u64, hash: u64) {
		let rc = match self.transport.peer_rc_info(target) {
			Some(rc) => rc,
			None => return
		};

		let slot = Log::ack_slot_offset(entry_off, self.idx);

		let mut hash_buf = [0u8; 8];
		LittleEndian::write_u64(&mut hash_buf, hash);
		let flags = self.transport.reserve_send(target);
		if flags.must_poll {
			self.transport.poll_completions(target, 1);
		}
		let _ = self.transport.write(target, &hash_buf, rc.log_mr.at(slot + 1), flags);

		let marker = [self.idx + 1];
		let flags = self.transport.reserve_send(target);
		if flags.must_poll {
			self.transport.poll_completions(target, 1);
		}
		let _ = self.transport.write(target, &marker, rc.log_mr.at(slot), flags);
	}
}


#[cfg(test)]
mod tests {
	use super::*;
	use config_state::ConfigState;
	use consensus::Timing;
	use record_store::RecordStore;
	use state_machine::MemoryStateMachine;
	use transport::mem::{MemHub, MemTransport};
	use std::env;
	use std::thread;
	use std::time::Instant;

	struct TestNode {
		engine: Arc<Engine>,
		sink: Arc<MemoryStateMachine>,
		ctrl: Arc<CtrlRegion>
	}

	fn cluster(n: u8, tag: &str) -> Vec<TestNode> {
		let hub = MemHub::new();

		let mut parts = vec![];
		for i in 0..n {
			let log = Arc::new(Log::new(256 * 1024));
			let ctrl = Arc::new(CtrlRegion::new());
			let transport = Arc::new(MemTransport::new(&hub, i, log.region(), ctrl.region()));
			parts.push((log, ctrl, transport));
		}
		for i in 0..n as usize {
			for j in 0..n as usize {
				if i != j {
					let rc = parts[j].2.local_rc_info();
					parts[i].2.set_peer_rc_info(j as u8, rc);
				}
			}
		}

		parts.into_iter().enumerate().map(|(i, (log, ctrl, transport))| {
			let dir = env::temp_dir().join(
				format!("apus-engine-{}-{}-{}", tag, ::std::process::id(), i));
			let _ = ::std::fs::remove_dir_all(&dir);

			let store = Arc::new(RecordStore::open(dir, false).unwrap());
			let sink = Arc::new(MemoryStateMachine::new());
			let transport = transport as Arc<Transport>;

			let consensus = Arc::new(Mutex::new(ConsensusModule::new(
				i as u8, ConfigState::new(i as u8, n),
				log.clone(), ctrl.clone(), transport.clone(), Timing::default())));

			let engine = Arc::new(Engine::new(i as u8, log, ctrl.clone(), transport,
				consensus, store, sink.clone() as Arc<StateMachine>,
				Cid::bootstrap(n), Arc::new(AtomicBool::new(false))));

			TestNode { engine, sink, ctrl }
		}).collect()
	}

	fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
		let deadline = Instant::now() + Duration::from_secs(5);
		while !cond() {
			if Instant::now() > deadline {
				panic!("timed out waiting for {}", what);
			}
			thread::sleep(Duration::from_millis(1));
		}
	}

	#[test]
	fn three_server_replication_applies_in_order() {
		let nodes = cluster(3, "basic");

		// Server 0 is the established leader of term 1
		let leader_sid = Sid::new(1, true, 0);
		for node in nodes.iter() {
			assert!(node.ctrl.cas_sid(Sid::zero(), leader_sid));
		}

		let mut loops = vec![];
		for i in 1..3 {
			let engine = nodes[i].engine.clone();
			loops.push(thread::spawn(move || engine.follower_loop()));
		}

		// The client connects, sends "hello" and closes; a NOP flushes the close
		let connect = nodes[0].engine
			.leader_submit(EntryType::Connect, &[], None).unwrap();
		let clt = connect.vs;

		nodes[0].engine.leader_submit(EntryType::Send, b"hello", Some(clt)).unwrap();
		nodes[0].engine.leader_submit(EntryType::Close, &[], Some(clt)).unwrap();
		nodes[0].engine.leader_submit(EntryType::Nop, &[], None).unwrap();

		// Every follower replays CONNECT, SEND, CLOSE in that order
		for i in 1..3 {
			let sink = nodes[i].sink.clone();
			wait_for(|| sink.applied_len() >= 3, "follower apply");

			let applied = sink.applied();
			assert_eq!(applied[0].1.entry_type, EntryType::Connect);
			assert_eq!(applied[1].1.entry_type, EntryType::Send);
			assert_eq!(applied[1].1.data, b"hello");
			assert_eq!(applied[1].1.clt_id, clt);
			assert_eq!(applied[2].1.entry_type, EntryType::Close);
		}

		for node in nodes.iter() {
			node.engine.shutdown.store(true, Ordering::Release);
		}
		for l in loops {
			l.join().unwrap();
		}
	}

	#[test]
	fn minority_cannot_commit() {
		let nodes = cluster(3, "minority");

		let leader_sid = Sid::new(1, true, 0);
		for node in nodes.iter() {
			assert!(node.ctrl.cas_sid(Sid::zero(), leader_sid));
		}

		// No follower loops are running: no acks ever arrive, so the submission must
		// observe the lost leadership instead of committing
		let engine = nodes[0].engine.clone();
		let submit = thread::spawn(move || {
			engine.leader_submit(EntryType::Connect, &[], None)
		});

		thread::sleep(Duration::from_millis(50));
		// Quorum never forms; a higher term appears and the submitter gives up
		nodes[0].ctrl.cas_sid(leader_sid, Sid::new(2, true, 1));

		assert!(submit.join().unwrap().is_err());
	}

	#[test]
	fn control_entries_commit_via_poller() {
		let nodes = cluster(3, "control");

		let leader_sid = Sid::new(1, true, 0);
		for node in nodes.iter() {
			assert!(node.ctrl.cas_sid(Sid::zero(), leader_sid));
		}

		let mut loops = vec![];
		for i in 1..3 {
			let engine = nodes[i].engine.clone();
			loops.push(thread::spawn(move || engine.follower_loop()));
		}

		let blank = nodes[0].engine
			.submit_control(EntryType::Noop, &[]).unwrap();

		// Followers ack; the idle-path poller advances the commit
		wait_for(|| {
			nodes[0].engine.poll_commit();
			nodes[0].engine.highest_committed() == blank.vs
		}, "control entry commit");

		for node in nodes.iter() {
			node.engine.shutdown.store(true, Ordering::Release);
		}
		for l in loops {
			l.join().unwrap();
		}
	}
}
