use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};

use config_state::{ConfigAction, ConfigState};
use consensus::{ConsensusModule, Tick, Timing};
use ctrl::CtrlRegion;
use errors::*;
use intercept::EventManager;
use log::Log;
use protos::*;
use record_store::RecordStore;
use replication::Engine;
use rpc::{marshal, unmarshal, CfgReply, Message, MessageBody, RcAck, RcSyn, SmRequest};
use snapshot::{self, SnapshotService};
use transport::Transport;


#[derive(Clone, Copy, PartialEq, Debug)]
pub enum ServerType {
	/// Founding member of a fresh cluster
	Start,
	/// Joins an existing cluster and recovers before serving
	Join
}

#[derive(Clone, Copy, PartialEq, Debug)]
enum RecoveryState {
	Running,
	/// Join request sent; waiting for the admitting CfgReply
	JoinSent,
	/// Admitted; waiting for a snapshot from the given peer
	AwaitSnapshot(ServerIdx)
}


/// The operational disconnect/reconnect protocol, driven only on the event loop
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum CheckpointState {
	NoDisconnected,
	Request,
	Approve
}

pub struct CheckpointCtl {
	state: Mutex<CheckpointState>,
	changed: Condvar
}

impl CheckpointCtl {
	pub fn new() -> CheckpointCtl {
		CheckpointCtl {
			state: Mutex::new(CheckpointState::NoDisconnected),
			changed: Condvar::new()
		}
	}

	/// Control-thread side: file a request and wait for the event loop's verdict.
	/// Returns true once disconnecting is safe
	pub fn request_disconnect(&self) -> bool {
		let mut state = self.state.lock().unwrap();
		if *state != CheckpointState::NoDisconnected {
			return false;
		}

		*state = CheckpointState::Request;
		while *state == CheckpointState::Request {
			state = self.changed.wait(state).unwrap();
		}

		*state == CheckpointState::Approve
	}

	pub fn finish_disconnect(&self) {
		let mut state = self.state.lock().unwrap();
		*state = CheckpointState::NoDisconnected;
		self.changed.notify_all();
	}

	/// Event-loop side: answer a pending request. A disconnect is approved only while no
	/// replayed connection is open
	fn tick(&self, active_connections: usize) -> bool {
		let mut state = self.state.lock().unwrap();
		if *state != CheckpointState::Request {
			return false;
		}

		*state = if active_connections == 0 {
			CheckpointState::Approve
		} else {
			CheckpointState::NoDisconnected
		};
		self.changed.notify_all();

		*state == CheckpointState::Approve
	}
}


pub struct ServerConfig {
	pub idx: ServerIdx,
	pub group_size: u8,
	pub server_type: ServerType,
	pub timing: Timing,
	pub data_dir: PathBuf,
	/// Address of the local application replica for replayed connections
	pub app_addr: SocketAddr,
	pub rsm: bool,
	pub check_output: bool,
	/// Unix socket path for the operational disconnect/reconnect hook
	pub checkpoint_sock: Option<PathBuf>
}


/// One APUS server: owns the regions, the consensus module, the replication engine and
/// the event manager, and runs the timer event loop
pub struct Server {
	idx: ServerIdx,
	timing: Timing,

	log: Arc<Log>,
	transport: Arc<Transport>,
	consensus: Arc<Mutex<ConsensusModule>>,
	engine: Arc<Engine>,
	ev_mgr: Arc<EventManager>,
	snapshots: SnapshotService,

	recovery: Mutex<RecoveryState>,
	checkpoint: Arc<CheckpointCtl>,
	checkpoint_sock: Option<PathBuf>,

	/// The accept loop needs respawning after a checkpoint reconnect
	accept_running: Arc<AtomicBool>,

	shutdown: Arc<AtomicBool>
}

impl Server {
	pub fn new(config: ServerConfig, transport: Arc<Transport>, log: Arc<Log>,
		ctrl: Arc<CtrlRegion>) -> Result<Arc<Server>>
	{
		let store = Arc::new(RecordStore::open(config.data_dir.join("db"), true)?);

		let shutdown = Arc::new(AtomicBool::new(false));

		let consensus = Arc::new(Mutex::new(ConsensusModule::new(
			config.idx,
			ConfigState::new(config.idx, config.group_size),
			log.clone(), ctrl.clone(), transport.clone(), config.timing)));

		let cid = Cid::bootstrap(config.group_size);
		let engine = Arc::new(Engine::new(config.idx, log.clone(), ctrl, transport.clone(),
			consensus.clone(), store,
			Arc::new(::state_machine::MemoryStateMachine::new()), cid, shutdown.clone()));

		let ev_mgr = Arc::new(EventManager::new(config.idx, engine.clone(),
			config.app_addr, config.rsm, config.check_output));
		engine.set_sink(ev_mgr.clone());

		let snapshots = SnapshotService::new(transport.clone());

		let recovery = if config.server_type == ServerType::Join {
			RecoveryState::JoinSent
		} else {
			RecoveryState::Running
		};

		Ok(Arc::new(Server {
			idx: config.idx,
			timing: config.timing,
			log,
			transport,
			consensus,
			engine,
			ev_mgr,
			snapshots,
			recovery: Mutex::new(recovery),
			checkpoint: Arc::new(CheckpointCtl::new()),
			checkpoint_sock: config.checkpoint_sock,
			accept_running: Arc::new(AtomicBool::new(false)),
			shutdown
		}))
	}

	pub fn engine(&self) -> Arc<Engine> {
		self.engine.clone()
	}

	pub fn ev_mgr(&self) -> Arc<EventManager> {
		self.ev_mgr.clone()
	}

	pub fn checkpoint(&self) -> Arc<CheckpointCtl> {
		self.checkpoint.clone()
	}

	pub fn is_leader(&self) -> bool {
		self.engine.is_leader()
	}

	pub fn shutdown(&self) {
		self.shutdown.store(true, Ordering::Release);
		self.engine.commit_event().notify_all();
	}

	pub fn is_shut_down(&self) -> bool {
		self.shutdown.load(Ordering::Acquire)
	}

	/// Starts the accept loop, the checkpoint control thread and the event loop; returns
	/// the event-loop handle
	pub fn start(self: &Arc<Server>) -> JoinHandle<()> {
		self.spawn_accept_loop();

		if let Some(path) = self.checkpoint_sock.clone() {
			let server = self.clone();
			thread::spawn(move || server.checkpoint_thread(path));
		}

		let server = self.clone();
		thread::spawn(move || server.run())
	}

	fn spawn_accept_loop(&self) {
		if self.accept_running.swap(true, Ordering::AcqRel) {
			return;
		}

		self.engine.pause.store(false, Ordering::Release);

		let engine = self.engine.clone();
		let ev_mgr = self.ev_mgr.clone();
		let running = self.accept_running.clone();
		thread::spawn(move || {
			ev_mgr.exclude_current_thread();
			engine.follower_loop();
			running.store(false, Ordering::Release);
		});
	}

	/// Re-registers the internal threads after a fork: threads do not survive into the
	/// child, so a forked application replica calls this to resume replay
	pub fn on_fork_child(self: &Arc<Server>) {
		self.accept_running.store(false, Ordering::Release);
		self.spawn_accept_loop();

		if let Some(path) = self.checkpoint_sock.clone() {
			let server = self.clone();
			thread::spawn(move || server.checkpoint_thread(path));
		}
	}

	/* ================================================================== */
	/* The event loop */

	fn run(&self) {
		self.ev_mgr.exclude_current_thread();

		let now = Instant::now();
		let mut hb_at = now + self.timing.hb_period * 10;
		let mut adjust_at = Some(now + self.timing.hb_period * 10);
		let mut rc_at = now + self.timing.rc_info_period;
		let mut prune_at = now + self.timing.prune_period;
		let mut retransmit_at = now;

		loop {
			if self.shutdown.load(Ordering::Acquire) {
				return;
			}

			let now = Instant::now();

			// Side-channel messages
			while let Some(bytes) = self.transport.recv_msg() {
				match unmarshal::<Message>(&bytes) {
					Ok(msg) => self.dispatch(msg),
					Err(_) => {
						// Garbage on a lossy channel; ignore
					}
				}
			}

			let recovering = *self.recovery.lock().unwrap() != RecoveryState::Running;

			// Heartbeat timer: send mode for leaders, receive mode otherwise
			if now >= hb_at && !recovering {
				let mut tick = Tick::empty();
				tick.time = now;
				{
					let mut consensus = self.consensus.lock().unwrap();
					if consensus.is_leader() {
						consensus.hb_send(&mut tick);
					} else {
						consensus.hb_receive(&mut tick);
					}
				}
				hb_at = now + self.timing.hb_period;
				self.process_tick(tick, &mut hb_at, &mut adjust_at);
			}

			// Timeout adjuster
			if let Some(at) = adjust_at {
				if now >= at && !recovering {
					let mut tick = Tick::empty();
					tick.time = now;
					self.consensus.lock().unwrap().to_adjust(&mut tick);
					adjust_at = tick.rearm_adjust.map(|d| now + d);
					self.process_tick(tick, &mut hb_at, &mut adjust_at);
				}
			}

			// Continuous polling work
			if !recovering {
				let mut tick = Tick::empty();
				tick.time = now;
				let removal = {
					let mut consensus = self.consensus.lock().unwrap();
					consensus.poll_vote_requests(&mut tick);
					consensus.poll_vote_count(&mut tick);
					consensus.reconcile();
					consensus.check_failure_count(&mut tick)
				};
				self.process_tick(tick, &mut hb_at, &mut adjust_at);

				if let Some(cid) = removal {
					self.append_config(cid);
				}

				self.engine.poll_commit();
				let actions = self.engine.apply_committed();
				if !actions.is_empty() {
					// Flush the commit watermark to the old member set before adopting
					// the new one: a removed server only learns of its removal's commit
					// through a later entry
					if let Err(e) = self.engine.submit_control(EntryType::Nop, &[]) {
						eprintln!("flush NOP append failed: {}", e);
					}
					let cid = self.consensus.lock().unwrap().config.cid;
					self.engine.set_cid(cid);
					self.exec_actions(actions);
				}
			}

			// Log pruning, forced when the log runs hot
			let force = self.consensus.lock().unwrap().needs_forced_pruning();
			if (now >= prune_at || force) && !recovering {
				let head = self.consensus.lock().unwrap().prune_log();
				if let Some(head) = head {
					let mut payload = [0u8; 8];
					LittleEndian::write_u64(&mut payload, head);
					if let Err(e) = self.engine.submit_control(EntryType::Head, &payload) {
						eprintln!("HEAD append failed: {}", e);
					}
				}
				prune_at = now + self.timing.prune_period;
			}

			// RC info repair for disconnected members
			if now >= rc_at {
				self.exchange_rc_info();
				rc_at = now + self.timing.rc_info_period;
			}

			// Join/recovery retransmissions
			if now >= retransmit_at {
				self.drive_recovery();
				retransmit_at = now + self.timing.retransmit_period;
			}

			// Checkpoint verdicts and accept-loop upkeep
			self.checkpoint_tick();
			if !self.engine.pause.load(Ordering::Acquire)
				&& !self.accept_running.load(Ordering::Acquire)
			{
				self.spawn_accept_loop();
			}

			thread::sleep(Duration::from_micros(200));
		}
	}

	fn process_tick(&self, tick: Tick, hb_at: &mut Instant, adjust_at: &mut Option<Instant>) {
		if let Some(d) = tick.rearm_hb {
			*hb_at = tick.time + d;
		}
		if let Some(d) = tick.rearm_adjust {
			*adjust_at = Some(tick.time + d);
		}

		if let Some(blank) = tick.append_blank {
			match blank {
				EntryType::Config => {
					let cid = self.consensus.lock().unwrap().config.cid;
					self.append_config(cid);
				},
				_ => {
					if let Err(e) = self.engine.submit_control(EntryType::Noop, &[]) {
						eprintln!("blank NOOP append failed: {}", e);
					}
				}
			}
		}

		self.exec_actions(tick.config_actions);

		if tick.shutdown {
			self.shutdown();
		}
	}

	fn append_config(&self, cid: Cid) {
		let mut payload = [0u8; CID_SIZE];
		cid.write_to(&mut payload);
		if let Err(e) = self.engine.submit_control(EntryType::Config, &payload) {
			eprintln!("CONFIG append failed: {}", e);
		}
	}

	fn exec_actions(&self, actions: Vec<ConfigAction>) {
		for action in actions {
			match action {
				ConfigAction::Disconnect(peer) => self.transport.disconnect(peer),
				ConfigAction::ShutdownSelf => {
					println!("removed from the configuration; shutting down");
					self.shutdown();
				},
				ConfigAction::AppendConfig(cid) => self.append_config(cid),
				ConfigAction::NotifyJoiner(joiner) => {
					let (cid, cid_key) = {
						let consensus = self.consensus.lock().unwrap();
						(consensus.config.cid, consensus.config.cid_key)
					};
					self.send_to(joiner, MessageBody::CfgReply(CfgReply {
						idx: joiner,
						cid,
						cid_key,
						head: self.log.head()
					}));
				}
			}
		}
	}

	fn send_to(&self, peer: ServerIdx, body: MessageBody) {
		let msg = Message { from: self.idx, body };
		if let Ok(bytes) = marshal(&msg) {
			let _ = self.transport.send_msg(peer, &bytes);
		}
	}

	/* ================================================================== */
	/* Side-channel dispatch */

	fn dispatch(&self, msg: Message) {
		let from = msg.from;
		match msg.body {
			MessageBody::Join(_) => {
				let cid = self.consensus.lock().unwrap().handle_join(Some(from));
				if let Some(cid) = cid {
					self.append_config(cid);
				}
			},
			MessageBody::Downsize(req) => {
				let cid = self.consensus.lock().unwrap().handle_downsize(req.new_size);
				if let Some(cid) = cid {
					self.append_config(cid);
				}
			},
			MessageBody::RcSyn(syn) => {
				self.transport.set_peer_rc_info(from, syn.rc);
				self.send_to(from, MessageBody::RcAck(RcAck {
					rc: self.transport.local_rc_info()
				}));
			},
			MessageBody::RcAck(ack) => {
				self.transport.set_peer_rc_info(from, ack.rc);
			},
			MessageBody::SmRequest(_) => {
				let (sid, cid, cid_key) = {
					let consensus = self.consensus.lock().unwrap();
					(consensus.sid().0, consensus.config.cid, consensus.config.cid_key)
				};
				let reply = self.snapshots.handle_request(
					&*self.ev_mgr, &self.log, &self.engine, sid, cid, cid_key);
				self.send_to(from, MessageBody::SmReply(reply));
			},
			MessageBody::CfgReply(reply) => {
				let mut recovery = self.recovery.lock().unwrap();
				if *recovery != RecoveryState::JoinSent {
					return;
				}

				// Adopt the configuration we were admitted under
				{
					let mut consensus = self.consensus.lock().unwrap();
					consensus.config = ConfigState::from_cid(
						reply.idx, reply.cid, reply.cid_key);
				}
				self.engine.set_cid(reply.cid);
				self.log.set_head(reply.head);

				// Bootstrap watermark from the admitting leader's log header
				if let Ok((commit, end)) = snapshot::bootstrap_watermark(&*self.transport, from) {
					let _ = (commit, end);
				}

				*recovery = RecoveryState::AwaitSnapshot(from);
				drop(recovery);
				self.send_to(from, MessageBody::SmRequest(SmRequest));
			},
			MessageBody::SmReply(reply) => {
				let mut recovery = self.recovery.lock().unwrap();
				let peer = match *recovery {
					RecoveryState::AwaitSnapshot(p) if p == from => p,
					_ => return
				};

				match snapshot::install(&reply, &*self.transport, peer, &self.log,
					&*self.ev_mgr, &self.engine)
				{
					Ok(()) => {
						// Adopt the configuration the snapshot was taken under
						{
							let mut consensus = self.consensus.lock().unwrap();
							consensus.config = ConfigState::from_cid(
								self.idx, reply.cid, reply.cid_key);
						}
						self.engine.set_cid(reply.cid);

						*recovery = RecoveryState::Running;
						println!("recovery complete; serving as follower");
					},
					Err(e) => {
						// Stay recovering; the retransmit timer will retry
						eprintln!("snapshot install failed: {}", e);
					}
				}
			}
		}
	}

	/// Retransmits whatever message the current recovery state is waiting on
	fn drive_recovery(&self) {
		let state = *self.recovery.lock().unwrap();
		match state {
			RecoveryState::Running => {},
			RecoveryState::JoinSent => {
				let group = self.consensus.lock().unwrap().config.cid.extended_size();
				for i in 0..group {
					if i != self.idx {
						self.send_to(i, MessageBody::Join(::rpc::JoinRequest {
							peer_addr: None
						}));
					}
				}
			},
			RecoveryState::AwaitSnapshot(peer) => {
				self.send_to(peer, MessageBody::SmRequest(SmRequest));
			}
		}
	}

	/* ================================================================== */
	/* Checkpoint control */

	fn checkpoint_tick(&self) {
		if self.checkpoint.tick(self.ev_mgr.active_connections()) {
			// Approved: stop the accept loop until the operator reconnects
			self.engine.pause.store(true, Ordering::Release);
		}
	}

	/// Serves the operational unix socket: "disconnect" and "reconnect" commands
	fn checkpoint_thread(&self, path: PathBuf) {
		use std::io::{Read, Write};
		use std::os::unix::net::UnixListener;

		let _ = ::std::fs::remove_file(&path);
		let listener = match UnixListener::bind(&path) {
			Ok(l) => l,
			Err(e) => {
				eprintln!("cannot bind checkpoint socket {:?}: {}", path, e);
				return;
			}
		};

		for stream in listener.incoming() {
			if self.shutdown.load(Ordering::Acquire) {
				return;
			}

			let mut stream = match stream {
				Ok(s) => s,
				Err(_) => continue
			};

			let mut buf = [0u8; 128];
			let n = match stream.read(&mut buf) {
				Ok(n) => n,
				Err(_) => continue
			};
			let cmd = String::from_utf8_lossy(&buf[..n]).into_owned();

			let ok = if cmd.contains("disconnect") {
				if self.checkpoint.request_disconnect() {
					let group = self.consensus.lock().unwrap().config.cid.extended_size();
					for i in 0..group {
						if i != self.idx {
							self.transport.disconnect(i);
						}
					}
					self.checkpoint.finish_disconnect();
					true
				} else {
					false
				}
			} else if cmd.contains("reconnect") {
				// The accept loop respawns on the event loop; RC info repair brings the
				// connections back
				self.engine.pause.store(false, Ordering::Release);
				true
			} else {
				false
			};

			let _ = stream.write_all(if ok { b"OK\n" } else { b"ERR\n" });
		}
	}

	/// Sends our registrations to members we have no connection to
	fn exchange_rc_info(&self) {
		let (size, me) = {
			let consensus = self.consensus.lock().unwrap();
			(consensus.config.cid.extended_size(), consensus.idx())
		};

		for i in 0..size {
			if i == me || self.transport.is_connected(i) {
				continue;
			}
			let on = self.consensus.lock().unwrap().config.cid.is_on(i);
			if on {
				self.send_to(i, MessageBody::RcSyn(RcSyn {
					rc: self.transport.local_rc_info()
				}));
			}
		}
	}
}
