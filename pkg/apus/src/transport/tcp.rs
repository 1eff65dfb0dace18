//! Inter-machine transport backend. One framed TCP connection per peer pair emulates the
//! reliable one-sided channel: an agent thread on the receiving side applies WRITE frames
//! straight into the registered local regions (final byte last) without touching any upper
//! layer, and answers READ frames from the same regions. The lossy message side channel is
//! a UDP socket, optionally joined to an IPv6 multicast group for discovery.
//!
//! Connection bootstrap mirrors the usual rc exchange: every server connects to the peers
//! below its own index and accepts from the ones above, then both sides swap a hello frame
//! carrying their index and region registrations.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Ipv6Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::{Arc, Mutex, mpsc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

use errors::*;
use protos::{ServerIdx, MAX_SERVERS};
use region::Region;
use rpc::{marshal, unmarshal};
use transport::*;


const OP_WRITE: u8 = 1;
const OP_WRITE_ERR: u8 = 2;
const OP_READ: u8 = 3;
const OP_READ_RESP: u8 = 4;

const READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
struct Hello {
	idx: ServerIdx,
	rc: RcInfo
}


struct PeerState {
	stream: Option<Arc<Mutex<TcpStream>>>,
	rc: Option<RcInfo>,
	send_count: u32,
	completions: Vec<Completion>,
	pending_reads: HashMap<u64, mpsc::Sender<Vec<u8>>>
}

impl PeerState {
	fn empty() -> PeerState {
		PeerState {
			stream: None,
			rc: None,
			send_count: 0,
			completions: vec![],
			pending_reads: HashMap::new()
		}
	}
}

struct Inner {
	me: ServerIdx,

	/// rkey -> locally registered region
	regions: Mutex<HashMap<u32, Arc<Region>>>,
	next_rkey: AtomicU64,
	log_rkey: u32,
	log_revoked: AtomicBool,

	peers: Mutex<Vec<PeerState>>
}

impl Inner {
	fn apply_write(&self, rkey: u32, raddr: u64, data: &[u8]) -> bool {
		if rkey == self.log_rkey && self.log_revoked.load(Ordering::Acquire) {
			return false;
		}

		let regions = self.regions.lock().unwrap();
		match regions.get(&rkey) {
			Some(region) if raddr as usize + data.len() <= region.len() => {
				region.write_final_byte_last(raddr as usize, data);
				true
			},
			_ => false
		}
	}

	fn read_local(&self, rkey: u32, raddr: u64, len: usize) -> Option<Vec<u8>> {
		let regions = self.regions.lock().unwrap();
		regions.get(&rkey).and_then(|region| {
			if raddr as usize + len > region.len() {
				return None;
			}
			let mut out = vec![0u8; len];
			region.read(raddr as usize, &mut out);
			Some(out)
		})
	}
}


pub struct TcpTransport {
	inner: Arc<Inner>,
	local_rc: RcInfo,
	udp: UdpSocket,
	msg_addrs: Vec<SocketAddr>,
	next_seq: AtomicU64
}

fn write_frame(stream: &Mutex<TcpStream>, frame: &[u8]) -> Result<()> {
	let mut s = stream.lock().unwrap();
	s.write_all(frame)?;
	Ok(())
}

fn read_exact_vec(stream: &mut TcpStream, len: usize) -> Result<Vec<u8>> {
	let mut buf = vec![0u8; len];
	stream.read_exact(&mut buf)?;
	Ok(buf)
}

/// Consumes inbound frames of one established connection for its whole lifetime
fn agent_loop(inner: Arc<Inner>, peer: ServerIdx, mut stream: TcpStream) {
	loop {
		let mut op = [0u8; 1];
		if stream.read_exact(&mut op).is_err() {
			break;
		}

		let res = match op[0] {
			OP_WRITE => handle_write(&inner, peer, &mut stream),
			OP_WRITE_ERR => handle_write_err(&inner, peer, &mut stream),
			OP_READ => handle_read(&inner, peer, &mut stream),
			OP_READ_RESP => handle_read_resp(&inner, peer, &mut stream),
			_ => Err("unknown frame op".into())
		};

		if res.is_err() {
			break;
		}
	}

	// The connection died: mark the peer disconnected
	let mut peers = inner.peers.lock().unwrap();
	peers[peer as usize].stream = None;
	peers[peer as usize].pending_reads.clear();
}

fn handle_write(inner: &Arc<Inner>, peer: ServerIdx, stream: &mut TcpStream) -> Result<()> {
	let mut hdr = [0u8; 24];
	stream.read_exact(&mut hdr)?;

	let seq = LittleEndian::read_u64(&hdr[0..8]);
	let rkey = LittleEndian::read_u64(&hdr[8..16]) as u32;
	let raddr = LittleEndian::read_u64(&hdr[16..24]);

	let mut len_buf = [0u8; 4];
	stream.read_exact(&mut len_buf)?;
	let data = read_exact_vec(stream, LittleEndian::read_u32(&len_buf) as usize)?;

	if !inner.apply_write(rkey, raddr, &data) {
		// Report the rejected write back so the sender sees a failed completion
		let mut frame = [0u8; 9];
		frame[0] = OP_WRITE_ERR;
		LittleEndian::write_u64(&mut frame[1..9], seq);

		let stream_arc = {
			let peers = inner.peers.lock().unwrap();
			peers[peer as usize].stream.clone()
		};
		if let Some(s) = stream_arc {
			let _ = write_frame(&s, &frame);
		}
	}

	Ok(())
}

fn handle_write_err(inner: &Arc<Inner>, peer: ServerIdx, stream: &mut TcpStream) -> Result<()> {
	let mut buf = [0u8; 8];
	stream.read_exact(&mut buf)?;

	let mut peers = inner.peers.lock().unwrap();
	let state = &mut peers[peer as usize];
	state.completions.push(Completion { peer, ok: false });
	state.stream = None;

	Ok(())
}

fn handle_read(inner: &Arc<Inner>, peer: ServerIdx, stream: &mut TcpStream) -> Result<()> {
	let mut hdr = [0u8; 28];
	stream.read_exact(&mut hdr)?;

	let seq = LittleEndian::read_u64(&hdr[0..8]);
	let rkey = LittleEndian::read_u64(&hdr[8..16]) as u32;
	let raddr = LittleEndian::read_u64(&hdr[16..24]);
	let len = LittleEndian::read_u32(&hdr[24..28]) as usize;

	let data = inner.read_local(rkey, raddr, len).unwrap_or_else(|| vec![]);

	let mut frame = Vec::with_capacity(13 + data.len());
	frame.push(OP_READ_RESP);
	let mut meta = [0u8; 12];
	LittleEndian::write_u64(&mut meta[0..8], seq);
	LittleEndian::write_u32(&mut meta[8..12], data.len() as u32);
	frame.extend_from_slice(&meta);
	frame.extend_from_slice(&data);

	let stream_arc = {
		let peers = inner.peers.lock().unwrap();
		peers[peer as usize].stream.clone()
	};
	match stream_arc {
		Some(s) => write_frame(&s, &frame),
		None => Ok(())
	}
}

fn handle_read_resp(inner: &Arc<Inner>, peer: ServerIdx, stream: &mut TcpStream) -> Result<()> {
	let mut meta = [0u8; 12];
	stream.read_exact(&mut meta)?;

	let seq = LittleEndian::read_u64(&meta[0..8]);
	let data = read_exact_vec(stream, LittleEndian::read_u32(&meta[8..12]) as usize)?;

	let sender = {
		let mut peers = inner.peers.lock().unwrap();
		peers[peer as usize].pending_reads.remove(&seq)
	};
	if let Some(tx) = sender {
		let _ = tx.send(data);
	}

	Ok(())
}


impl TcpTransport {
	/// Builds the transport and starts the listener and UDP side channel. peer_addrs and
	/// msg_addrs are indexed by server idx; only slots of known peers need to be valid
	pub fn new(me: ServerIdx, peer_addrs: Vec<SocketAddr>, msg_addrs: Vec<SocketAddr>,
		mcast_group: Option<Ipv6Addr>, log_region: Arc<Region>, ctrl_region: Arc<Region>)
		-> Result<Arc<TcpTransport>>
	{
		let mut regions = HashMap::new();
		regions.insert(1u32, log_region);
		regions.insert(2u32, ctrl_region);

		let inner = Arc::new(Inner {
			me,
			regions: Mutex::new(regions),
			next_rkey: AtomicU64::new(3),
			log_rkey: 1,
			log_revoked: AtomicBool::new(false),
			peers: Mutex::new((0..MAX_SERVERS).map(|_| PeerState::empty()).collect())
		});

		let udp = UdpSocket::bind(msg_addrs[me as usize])?;
		udp.set_nonblocking(true)?;
		if let Some(group) = mcast_group {
			udp.join_multicast_v6(&group, 0)?;
		}

		let transport = Arc::new(TcpTransport {
			inner: inner.clone(),
			local_rc: RcInfo {
				log_mr: RemoteMem { raddr: 0, rkey: 1 },
				ctrl_mr: RemoteMem { raddr: 0, rkey: 2 }
			},
			udp,
			msg_addrs,
			next_seq: AtomicU64::new(1)
		});

		// Accept inbound connections forever; joiners may arrive at any time
		let listener = TcpListener::bind(peer_addrs[me as usize])?;
		{
			let t = transport.clone();
			thread::spawn(move || {
				for stream in listener.incoming() {
					if let Ok(stream) = stream {
						let _ = t.handshake(stream);
					}
				}
			});
		}

		Ok(transport)
	}

	/// Connects to every configured peer below our own index (the higher ones connect to
	/// us); retries until each link is up
	pub fn connect_initial(&self, peer_addrs: &[SocketAddr]) -> Result<()> {
		for (idx, addr) in peer_addrs.iter().enumerate() {
			if idx >= self.inner.me as usize {
				break;
			}

			loop {
				match TcpStream::connect(addr) {
					Ok(stream) => {
						self.handshake(stream)?;
						break;
					},
					Err(_) => thread::sleep(Duration::from_millis(50))
				}
			}
		}

		Ok(())
	}

	/// Connects to one specific peer (used by joiners and by RC-info repair)
	pub fn connect_peer(&self, addr: SocketAddr) -> Result<ServerIdx> {
		let stream = TcpStream::connect(addr).chain_err(|| "connect failed")?;
		self.handshake(stream)
	}

	/// Exchanges hello frames and installs the connection
	fn handshake(&self, mut stream: TcpStream) -> Result<ServerIdx> {
		stream.set_nodelay(true)?;

		let hello = Hello { idx: self.inner.me, rc: self.local_rc };
		let bytes = marshal(&hello)?;
		let mut len_buf = [0u8; 4];
		LittleEndian::write_u32(&mut len_buf, bytes.len() as u32);
		stream.write_all(&len_buf)?;
		stream.write_all(&bytes)?;

		let mut len_buf = [0u8; 4];
		stream.read_exact(&mut len_buf)?;
		let theirs = read_exact_vec(&mut stream, LittleEndian::read_u32(&len_buf) as usize)?;
		let peer_hello: Hello = unmarshal(&theirs)?;

		let agent_stream = stream.try_clone()?;
		{
			let mut peers = self.inner.peers.lock().unwrap();
			let state = &mut peers[peer_hello.idx as usize];
			state.stream = Some(Arc::new(Mutex::new(stream)));
			state.rc = Some(peer_hello.rc);
		}

		let inner = self.inner.clone();
		let idx = peer_hello.idx;
		thread::spawn(move || agent_loop(inner, idx, agent_stream));

		Ok(peer_hello.idx)
	}

	fn peer_stream(&self, peer: ServerIdx) -> Result<Arc<Mutex<TcpStream>>> {
		let peers = self.inner.peers.lock().unwrap();
		match peers[peer as usize].stream {
			Some(ref s) => Ok(s.clone()),
			None => bail!("peer {} is disconnected", peer)
		}
	}
}

impl Transport for TcpTransport {
	fn write(&self, peer: ServerIdx, local: &[u8], rm: RemoteMem, flags: SendFlags) -> Result<()> {
		let stream = match self.peer_stream(peer) {
			Ok(s) => s,
			Err(e) => {
				let mut peers = self.inner.peers.lock().unwrap();
				peers[peer as usize].completions.push(Completion { peer, ok: false });
				return Err(e);
			}
		};

		let mut frame = Vec::with_capacity(29 + local.len());
		frame.push(OP_WRITE);
		let mut hdr = [0u8; 28];
		LittleEndian::write_u64(&mut hdr[0..8], self.next_seq.fetch_add(1, Ordering::Relaxed));
		LittleEndian::write_u64(&mut hdr[8..16], rm.rkey as u64);
		LittleEndian::write_u64(&mut hdr[16..24], rm.raddr);
		LittleEndian::write_u32(&mut hdr[24..28], local.len() as u32);
		frame.extend_from_slice(&hdr);
		frame.extend_from_slice(local);

		match write_frame(&stream, &frame) {
			Ok(()) => {
				if flags.signaled {
					let mut peers = self.inner.peers.lock().unwrap();
					peers[peer as usize].completions.push(Completion { peer, ok: true });
				}
				Ok(())
			},
			Err(e) => {
				let mut peers = self.inner.peers.lock().unwrap();
				peers[peer as usize].stream = None;
				peers[peer as usize].completions.push(Completion { peer, ok: false });
				Err(e)
			}
		}
	}

	fn read(&self, peer: ServerIdx, local: &mut [u8], rm: RemoteMem) -> Result<()> {
		let stream = self.peer_stream(peer)?;
		let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

		let (tx, rx) = mpsc::channel();
		{
			let mut peers = self.inner.peers.lock().unwrap();
			peers[peer as usize].pending_reads.insert(seq, tx);
		}

		let mut frame = [0u8; 29];
		frame[0] = OP_READ;
		LittleEndian::write_u64(&mut frame[1..9], seq);
		LittleEndian::write_u64(&mut frame[9..17], rm.rkey as u64);
		LittleEndian::write_u64(&mut frame[17..25], rm.raddr);
		LittleEndian::write_u32(&mut frame[25..29], local.len() as u32);
		write_frame(&stream, &frame)?;

		let data = rx.recv_timeout(READ_TIMEOUT)
			.chain_err(|| "remote read timed out")?;
		if data.len() != local.len() {
			bail!("remote read returned {} of {} bytes", data.len(), local.len());
		}

		local.copy_from_slice(&data);
		Ok(())
	}

	fn send_msg(&self, peer: ServerIdx, bytes: &[u8]) -> Result<()> {
		// Best effort by contract: send errors and unknown peers are dropped
		if let Some(addr) = self.msg_addrs.get(peer as usize) {
			let _ = self.udp.send_to(bytes, addr);
		}
		Ok(())
	}

	fn recv_msg(&self) -> Option<Vec<u8>> {
		let mut buf = vec![0u8; 64 * 1024];
		match self.udp.recv_from(&mut buf) {
			Ok((n, _)) => {
				buf.truncate(n);
				Some(buf)
			},
			Err(_) => None
		}
	}

	fn poll_completions(&self, peer: ServerIdx, max: usize) -> Vec<Completion> {
		let mut peers = self.inner.peers.lock().unwrap();
		let state = &mut peers[peer as usize];

		let take = state.completions.len().min(max);
		state.completions.drain(0..take).collect()
	}

	fn reserve_send(&self, peer: ServerIdx) -> SendFlags {
		let mut peers = self.inner.peers.lock().unwrap();
		let state = &mut peers[peer as usize];

		let window = state.send_count & (S_DEPTH - 1);
		state.send_count += 1;

		SendFlags {
			signaled: window == 0,
			must_poll: window == S_DEPTH - 1
		}
	}

	fn disconnect(&self, peer: ServerIdx) {
		let mut peers = self.inner.peers.lock().unwrap();
		peers[peer as usize].stream = None;
		peers[peer as usize].rc = None;
		peers[peer as usize].pending_reads.clear();
	}

	fn is_connected(&self, peer: ServerIdx) -> bool {
		self.inner.peers.lock().unwrap()[peer as usize].stream.is_some()
	}

	fn revoke_log_access(&self) {
		self.inner.log_revoked.store(true, Ordering::Release);
	}

	fn restore_log_access(&self) {
		self.inner.log_revoked.store(false, Ordering::Release);
	}

	fn local_rc_info(&self) -> RcInfo {
		self.local_rc
	}

	fn peer_rc_info(&self, peer: ServerIdx) -> Option<RcInfo> {
		self.inner.peers.lock().unwrap()[peer as usize].rc
	}

	fn set_peer_rc_info(&self, peer: ServerIdx, rc: RcInfo) {
		self.inner.peers.lock().unwrap()[peer as usize].rc = Some(rc);
	}

	fn register(&self, region: Arc<Region>) -> RemoteMem {
		let rkey = self.inner.next_rkey.fetch_add(1, Ordering::Relaxed) as u32;
		self.inner.regions.lock().unwrap().insert(rkey, region);
		RemoteMem { raddr: 0, rkey }
	}
}


#[cfg(test)]
mod tests {
	use super::*;

	fn local(port: u16) -> SocketAddr {
		format!("127.0.0.1:{}", port).parse().unwrap()
	}

	#[test]
	fn two_servers_exchange_writes() {
		let log0 = Arc::new(Region::new(4096));
		let log1 = Arc::new(Region::new(4096));

		let t0 = TcpTransport::new(0, vec![local(14810), local(14811)],
			vec![local(14910), local(14911)], None,
			log0.clone(), Arc::new(Region::new(256))).unwrap();
		let t1 = TcpTransport::new(1, vec![local(14810), local(14811)],
			vec![local(14910), local(14911)], None,
			log1.clone(), Arc::new(Region::new(256))).unwrap();

		t1.connect_initial(&[local(14810), local(14811)]).unwrap();

		// Wait for the handshake to land on side 0
		for _ in 0..100 {
			if t0.is_connected(1) {
				break;
			}
			thread::sleep(Duration::from_millis(10));
		}
		assert!(t0.is_connected(1));

		let rm = t0.peer_rc_info(1).unwrap().log_mr.at(64);
		t0.write(1, b"over tcp", rm, SendFlags { signaled: true, must_poll: false }).unwrap();

		// The agent applies the write asynchronously; poll the published final byte
		let mut ok = false;
		for _ in 0..100 {
			if log1.atomic_u8(64 + 7).load(Ordering::Acquire) == b'p' {
				ok = true;
				break;
			}
			thread::sleep(Duration::from_millis(10));
		}
		assert!(ok);

		let mut out = [0u8; 8];
		log1.read(64, &mut out);
		assert_eq!(&out, b"over tcp");

		// And a one-sided read in the other direction
		log0.write(10, b"readback");
		let rm0 = t1.peer_rc_info(0).unwrap().log_mr.at(10);
		let mut got = [0u8; 8];
		t1.read(0, &mut got, rm0).unwrap();
		assert_eq!(&got, b"readback");

		// Side channel
		t0.send_msg(1, b"hello msg").unwrap();
		let mut msg = None;
		for _ in 0..100 {
			msg = t1.recv_msg();
			if msg.is_some() {
				break;
			}
			thread::sleep(Duration::from_millis(10));
		}
		assert_eq!(msg.unwrap(), b"hello msg");
	}
}
