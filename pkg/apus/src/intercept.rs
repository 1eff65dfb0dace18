use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};

use output::{decide, Decision, OutputManager, OutputPeer};
use protos::*;
use replication::Engine;
use state_machine::{Record, StateMachine};


/// Receives divergence information; the actual restore machinery is external
pub trait DivergenceHook: Send + Sync {
	/// Leader side: the decision over one hash round
	fn on_decision(&self, _decision: &Decision, _hash_index: i64) {}

	/// Follower side: the local hash at the position the leader sampled
	fn on_follower_sample(&self, _leader_hash: u64, _my_hash: u64, _hash_index: i64) {}
}


enum ReplaySock {
	Tcp(TcpStream),
	Udp(UdpSocket)
}

impl ReplaySock {
	fn raw_fd(&self) -> RawFd {
		match *self {
			ReplaySock::Tcp(ref s) => s.as_raw_fd(),
			ReplaySock::Udp(ref s) => s.as_raw_fd()
		}
	}

	fn send(&mut self, data: &[u8]) {
		// Best effort by design: the replica application may lag or have closed early
		let _ = match *self {
			ReplaySock::Tcp(ref mut s) => s.write(data).map(|_| ()),
			ReplaySock::Udp(ref s) => s.send(data).map(|_| ())
		};
	}
}

struct ReplicaConn {
	sock: Option<ReplaySock>,
	/// The application-side fd of this connection, learned when the replica application
	/// accepts; output hashes are keyed by it
	app_fd: RawFd,
	accepted: bool
}

fn keep_alive(fd: RawFd) {
	unsafe {
		let val: ::libc::c_int = 1;
		::libc::setsockopt(fd, ::libc::SOL_SOCKET, ::libc::SO_KEEPALIVE,
			&val as *const ::libc::c_int as *const ::libc::c_void,
			::std::mem::size_of::<::libc::c_int>() as ::libc::socklen_t);
	}
}

/// How long a replayed CONNECT waits for the replica application to accept
const ACCEPT_WAIT: Duration = Duration::from_secs(1);


/// The interception and replay manager
///
/// On the leader it receives connection-level events captured from the application's
/// sockets and routes them through consensus. On followers it is the replay sink: applied
/// entries drive sockets against the local application replica. At-most-once delivery is
/// enforced here by record key
pub struct EventManager {
	idx: ServerIdx,
	engine: Arc<Engine>,

	pub output: OutputManager,

	/// Whether captured reads are replicated at all
	rsm: bool,
	/// Whether application output is hashed and checked
	check_output: bool,

	/// Address of the local application replica that replayed connections attach to
	sys_addr: SocketAddr,

	/// Leader: fd of an accepted connection -> its connection identity
	leader_tcp: Mutex<HashMap<RawFd, ViewStamp>>,
	/// Leader: UDP source address -> connection identity
	leader_udp: Mutex<HashMap<String, ViewStamp>>,

	/// Follower: connection identity -> replay socket
	replica: Mutex<HashMap<u64, ReplicaConn>>,
	/// Follower: the CONNECT currently being replayed (pairs the application's accept
	/// with its identity)
	cur_connect: Mutex<Option<u64>>,

	excluded_threads: Mutex<HashSet<thread::ThreadId>>,
	excluded_fds: Mutex<HashSet<RawFd>>,

	/// Applied record keys (at-most-once)
	applied: Mutex<HashSet<u64>>,

	hook: Mutex<Option<Arc<DivergenceHook>>>
}

impl EventManager {
	pub fn new(idx: ServerIdx, engine: Arc<Engine>, sys_addr: SocketAddr,
		rsm: bool, check_output: bool) -> EventManager
	{
		EventManager {
			idx,
			engine,
			output: OutputManager::new(),
			rsm,
			check_output,
			sys_addr,
			leader_tcp: Mutex::new(HashMap::new()),
			leader_udp: Mutex::new(HashMap::new()),
			replica: Mutex::new(HashMap::new()),
			cur_connect: Mutex::new(None),
			excluded_threads: Mutex::new(HashSet::new()),
			excluded_fds: Mutex::new(HashSet::new()),
			applied: Mutex::new(HashSet::new()),
			hook: Mutex::new(None)
		}
	}

	pub fn set_hook(&self, hook: Arc<DivergenceHook>) {
		*self.hook.lock().unwrap() = Some(hook);
	}

	/// Open replayed connections; the checkpoint protocol only approves a disconnect when
	/// this reaches zero
	pub fn active_connections(&self) -> usize {
		self.replica.lock().unwrap().len()
	}

	pub fn has_applied(&self, key: u64) -> bool {
		self.applied.lock().unwrap().contains(&key)
	}

	pub fn applied_count(&self) -> usize {
		self.applied.lock().unwrap().len()
	}

	/// Internal threads (event loop, accept loop, checkpoint control) never have their
	/// socket activity captured
	pub fn exclude_current_thread(&self) {
		self.excluded_threads.lock().unwrap().insert(thread::current().id());
	}

	pub fn exclude_thread(&self, id: thread::ThreadId) {
		self.excluded_threads.lock().unwrap().insert(id);
	}

	pub fn exclude_fd(&self, fd: RawFd) {
		self.excluded_fds.lock().unwrap().insert(fd);
	}

	fn internal_thread(&self) -> bool {
		self.excluded_threads.lock().unwrap().contains(&thread::current().id())
	}

	/* ================================================================== */
	/* Captured events (leader side of the stream) */

	/// accept/accept4 returned a new connection fd
	pub fn on_accept(&self, fd: RawFd) {
		if self.internal_thread() {
			return;
		}

		if self.engine.is_leader() {
			match self.engine.leader_submit(EntryType::Connect, &[], None) {
				Ok(sub) => {
					self.leader_tcp.lock().unwrap().insert(fd, sub.vs);
				},
				Err(e) => eprintln!("CONNECT submission failed: {}", e)
			}
		} else {
			// The replica application accepted the connection we are replaying
			let key = self.cur_connect.lock().unwrap().take();
			if let Some(key) = key {
				let mut replica = self.replica.lock().unwrap();
				if let Some(conn) = replica.get_mut(&key) {
					conn.app_fd = fd;
					conn.accepted = true;
				}
			}
		}
	}

	/// read/recv/recvmsg returned n > 0 bytes on a socket fd
	pub fn on_read(&self, fd: RawFd, buf: &[u8]) {
		if self.internal_thread() || !self.rsm || !self.engine.is_leader() {
			return;
		}
		if self.excluded_fds.lock().unwrap().contains(&fd) {
			return;
		}

		let clt = match self.leader_tcp.lock().unwrap().get(&fd) {
			Some(vs) => *vs,
			// Unknown fd: not one of the application's accepted sockets
			None => return
		};

		if let Err(e) = self.engine.leader_submit(EntryType::Send, buf, Some(clt)) {
			eprintln!("SEND submission failed: {}", e);
		}
	}

	/// recvfrom returned a datagram; the source address keys the logical connection
	pub fn on_recvfrom(&self, buf: &[u8], src: &str) {
		if self.internal_thread() || !self.engine.is_leader() {
			return;
		}

		let existing = self.leader_udp.lock().unwrap().get(src).cloned();
		let clt = match existing {
			Some(vs) => vs,
			None => {
				match self.engine.leader_submit(EntryType::UdpConnect, &[], None) {
					Ok(sub) => {
						self.leader_udp.lock().unwrap().insert(src.to_owned(), sub.vs);
						sub.vs
					},
					Err(e) => {
						eprintln!("UDP_CONNECT submission failed: {}", e);
						return;
					}
				}
			}
		};

		if let Err(e) = self.engine.leader_submit(EntryType::Send, buf, Some(clt)) {
			eprintln!("SEND submission failed: {}", e);
		}
	}

	/// close on a socket fd
	pub fn on_close(&self, fd: RawFd) {
		if self.internal_thread() {
			return;
		}

		self.output.del_output(fd);

		if !self.engine.is_leader() {
			return;
		}

		let clt = match self.leader_tcp.lock().unwrap().remove(&fd) {
			Some(vs) => vs,
			None => return
		};

		if let Err(e) = self.engine.leader_submit(EntryType::Close, &[], Some(clt)) {
			eprintln!("CLOSE submission failed: {}", e);
			return;
		}
		// The NOP exists purely to carry the CLOSE commit to the replicas
		if let Err(e) = self.engine.leader_submit(EntryType::Nop, &[], None) {
			eprintln!("NOP submission failed: {}", e);
		}
	}

	/// write/send of application output; feeds the divergence detector
	pub fn on_check(&self, fd: RawFd, buf: &[u8]) -> Option<Decision> {
		if self.internal_thread() || !self.check_output {
			return None;
		}
		if self.excluded_fds.lock().unwrap().contains(&fd) {
			return None;
		}

		if self.output.store_output(fd, buf) == 0 {
			return None;
		}
		if !self.engine.is_leader() {
			return None;
		}

		let hash_index = self.output.determine_output(fd);
		if hash_index == -1 {
			return None;
		}

		let clt = match self.leader_tcp.lock().unwrap().get(&fd) {
			Some(vs) => *vs,
			None => return None
		};

		let leader_hash = self.output.get_hash(fd, hash_index);
		let mut payload = [0u8; 16];
		LittleEndian::write_i64(&mut payload[0..8], hash_index);
		LittleEndian::write_u64(&mut payload[8..16], leader_hash);

		let sub = match self.engine.leader_submit(EntryType::Output, &payload, Some(clt)) {
			Ok(sub) => sub,
			Err(e) => {
				eprintln!("OUTPUT submission failed: {}", e);
				return None;
			}
		};

		// The submission returns at quorum; stragglers get a moment to write their hash
		thread::sleep(Duration::from_micros(5));

		let mut peers = vec![OutputPeer {
			node_id: self.idx,
			hash: leader_hash,
			hash_index
		}];
		for (node, hash) in self.engine.entry_acks(sub.offset) {
			peers.push(OutputPeer { node_id: node, hash, hash_index });
		}

		let decision = decide(&peers, self.idx);
		if let Some(ref d) = decision {
			if let Some(ref hook) = *self.hook.lock().unwrap() {
				hook.on_decision(d, hash_index);
			}
		}
		decision
	}

	/* ================================================================== */
	/* Replay actions (follower side) */

	fn do_action_connect(&self, key: u64, udp: bool) {
		{
			let mut replica = self.replica.lock().unwrap();
			replica.entry(key).or_insert(ReplicaConn {
				sock: None,
				app_fd: -1,
				accepted: false
			});
		}
		*self.cur_connect.lock().unwrap() = Some(key);

		let sock = if udp {
			match UdpSocket::bind("0.0.0.0:0").and_then(|s| {
				s.connect(self.sys_addr)?;
				s.set_nonblocking(true)?;
				Ok(s)
			}) {
				Ok(s) => {
					keep_alive(s.as_raw_fd());
					Some(ReplaySock::Udp(s))
				},
				Err(e) => {
					eprintln!("replay UDP connect failed: {}", e);
					None
				}
			}
		} else {
			match TcpStream::connect(self.sys_addr).and_then(|s| {
				s.set_nodelay(true)?;
				s.set_nonblocking(true)?;
				Ok(s)
			}) {
				Ok(s) => {
					keep_alive(s.as_raw_fd());
					Some(ReplaySock::Tcp(s))
				},
				Err(e) => {
					eprintln!("replay connect failed: {}", e);
					None
				}
			}
		};

		let connected = sock.is_some();
		{
			let mut replica = self.replica.lock().unwrap();
			if let Some(conn) = replica.get_mut(&key) {
				conn.sock = sock;
			}
		}

		// Wait for the replica application to accept so subsequent SENDs land on an
		// established connection; bounded, the application may not be interposed
		if connected && !udp {
			let deadline = Instant::now() + ACCEPT_WAIT;
			loop {
				{
					let replica = self.replica.lock().unwrap();
					match replica.get(&key) {
						Some(conn) if conn.accepted => break,
						Some(_) => {},
						None => break
					}
				}
				if Instant::now() > deadline {
					break;
				}
				thread::yield_now();
			}
		}
	}

	fn do_action_send(&self, key: u64, data: &[u8]) {
		let mut replica = self.replica.lock().unwrap();
		if let Some(conn) = replica.get_mut(&key) {
			if let Some(ref mut sock) = conn.sock {
				sock.send(data);
			}
		}
	}

	fn do_action_close(&self, key: u64) {
		let mut replica = self.replica.lock().unwrap();
		if let Some(conn) = replica.remove(&key) {
			if conn.app_fd >= 0 {
				self.output.del_output(conn.app_fd);
			}
			// Dropping the socket closes it
		}
	}

	fn do_action_output(&self, key: u64, data: &[u8]) {
		if data.len() < 16 {
			return;
		}
		let hash_index = LittleEndian::read_i64(&data[0..8]);
		let leader_hash = LittleEndian::read_u64(&data[8..16]);

		let my_hash = {
			let replica = self.replica.lock().unwrap();
			match replica.get(&key) {
				Some(conn) if conn.app_fd >= 0 =>
					self.output.get_hash(conn.app_fd, hash_index),
				_ => 0
			}
		};

		if let Some(ref hook) = *self.hook.lock().unwrap() {
			hook.on_follower_sample(leader_hash, my_hash, hash_index);
		}
	}
}

impl StateMachine for EventManager {
	fn apply(&self, key: u64, record: &Record) -> bool {
		{
			let mut applied = self.applied.lock().unwrap();
			if applied.contains(&key) {
				return false;
			}
			applied.insert(key);
		}

		let clt_key = record.clt_id.to_key();
		match record.entry_type {
			EntryType::Connect => self.do_action_connect(clt_key, false),
			EntryType::UdpConnect => self.do_action_connect(clt_key, true),
			EntryType::Send => self.do_action_send(clt_key, &record.data),
			EntryType::Close => self.do_action_close(clt_key),
			EntryType::Output => self.do_action_output(clt_key, &record.data),
			// NOP only exists to push the preceding CLOSE's commit across
			EntryType::Nop | EntryType::Noop | EntryType::Config | EntryType::Head => {}
		}

		true
	}

	fn output_hash(&self, clt_id: ViewStamp, hash_index: i64) -> u64 {
		let replica = self.replica.lock().unwrap();
		match replica.get(&clt_id.to_key()) {
			Some(conn) if conn.app_fd >= 0 => self.output.get_hash(conn.app_fd, hash_index),
			_ => 0
		}
	}

	/// The durable part of the replay state is the at-most-once key set; the application
	/// replica's own state is snapshotted by external means
	fn snapshot(&self) -> Vec<u8> {
		let applied = self.applied.lock().unwrap();
		let mut keys: Vec<u64> = applied.iter().cloned().collect();
		keys.sort();

		let mut out = vec![0u8; keys.len() * 8];
		for (i, key) in keys.iter().enumerate() {
			LittleEndian::write_u64(&mut out[i * 8..(i + 1) * 8], *key);
		}
		out
	}

	fn restore(&self, data: &[u8]) {
		let mut applied = self.applied.lock().unwrap();
		applied.clear();
		for chunk in data.chunks(8) {
			if chunk.len() == 8 {
				applied.insert(LittleEndian::read_u64(chunk));
			}
		}
	}
}


#[cfg(test)]
mod tests {
	use super::*;
	use config_state::ConfigState;
	use consensus::{ConsensusModule, Timing};
	use ctrl::CtrlRegion;
	use log::Log;
	use record_store::RecordStore;
	use transport::Transport;
	use transport::mem::{MemHub, MemTransport};
	use std::io::Read;
	use std::net::TcpListener;
	use std::sync::atomic::AtomicBool;
	use std::env;

	fn single_node_engine(tag: &str) -> Arc<Engine> {
		let hub = MemHub::new();
		let log = Arc::new(Log::new(256 * 1024));
		let ctrl = Arc::new(CtrlRegion::new());
		let transport = Arc::new(MemTransport::new(&hub, 0, log.region(), ctrl.region()))
			as Arc<Transport>;

		let dir = env::temp_dir().join(format!("apus-icept-{}-{}", tag, ::std::process::id()));
		let _ = ::std::fs::remove_dir_all(&dir);
		let store = Arc::new(RecordStore::open(dir, false).unwrap());

		let consensus = Arc::new(Mutex::new(ConsensusModule::new(
			0, ConfigState::new(0, 1), log.clone(), ctrl.clone(),
			transport.clone(), Timing::default())));

		// Single-server cluster: the quorum is the leader alone
		assert!(ctrl.cas_sid(Sid::zero(), Sid::new(1, true, 0)));

		Arc::new(Engine::new(0, log, ctrl, transport, consensus, store,
			Arc::new(::state_machine::MemoryStateMachine::new()),
			Cid::bootstrap(1), Arc::new(AtomicBool::new(false))))
	}

	#[test]
	fn leader_capture_drives_connect_send_close() {
		let engine = single_node_engine("cap");
		let mgr = EventManager::new(0, engine.clone(),
			"127.0.0.1:1".parse().unwrap(), true, false);

		mgr.on_accept(33);
		mgr.on_read(33, b"payload");
		mgr.on_close(33);

		// CONNECT, SEND, CLOSE and the trailing NOP all committed
		assert_eq!(engine.highest_committed(), ViewStamp::new(1, 4));

		// The fd mapping is gone after close; further reads are no-ops
		mgr.on_read(33, b"late");
		assert_eq!(engine.highest_committed(), ViewStamp::new(1, 4));
	}

	#[test]
	fn internal_threads_are_not_captured() {
		let engine = single_node_engine("internal");
		let mgr = EventManager::new(0, engine.clone(),
			"127.0.0.1:1".parse().unwrap(), true, false);

		mgr.exclude_current_thread();
		mgr.on_accept(12);
		mgr.on_read(12, b"x");

		assert_eq!(engine.highest_committed(), ViewStamp::new(0, 0));
	}

	#[test]
	fn replay_reaches_the_local_application() {
		let engine = single_node_engine("replay");

		// A stand-in application replica
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap();
		let received = Arc::new(Mutex::new(vec![]));
		let received2 = received.clone();
		let app = thread::spawn(move || {
			let (mut conn, _) = listener.accept().unwrap();
			let mut buf = vec![];
			let _ = conn.read_to_end(&mut buf);
			*received2.lock().unwrap() = buf;
		});

		let mgr = EventManager::new(1, engine, addr, true, false);

		let clt = ViewStamp::new(1, 1);
		let connect = Record {
			entry_type: EntryType::Connect,
			clt_id: clt,
			data: vec![]
		};
		let send = Record {
			entry_type: EntryType::Send,
			clt_id: clt,
			data: b"hello".to_vec()
		};
		let close = Record {
			entry_type: EntryType::Close,
			clt_id: clt,
			data: vec![]
		};

		assert!(mgr.apply(clt.to_key(), &connect));
		assert!(mgr.apply(ViewStamp::new(1, 2).to_key(), &send));

		// At-most-once: replaying the same SEND again is rejected and nothing doubles
		assert!(!mgr.apply(ViewStamp::new(1, 2).to_key(), &send));

		assert!(mgr.apply(ViewStamp::new(1, 3).to_key(), &close));

		app.join().unwrap();
		assert_eq!(*received.lock().unwrap(), b"hello");
	}

	#[test]
	fn applied_keys_survive_snapshot() {
		let engine = single_node_engine("snap");
		let mgr = EventManager::new(1, engine.clone(),
			"127.0.0.1:1".parse().unwrap(), true, false);

		let rec = Record {
			entry_type: EntryType::Nop,
			clt_id: ViewStamp::new(0, 0),
			data: vec![]
		};
		assert!(mgr.apply(41, &rec));
		assert!(mgr.apply(42, &rec));

		let snap = mgr.snapshot();

		let mgr2 = EventManager::new(2, engine,
			"127.0.0.1:1".parse().unwrap(), true, false);
		mgr2.restore(&snap);
		assert!(!mgr2.apply(41, &rec));
		assert!(mgr2.apply(43, &rec));
	}
}
