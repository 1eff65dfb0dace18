//! In-process transport backend: all servers share one hub and one-sided writes are plain
//! copies into the destination region, performed on the caller's thread. Used by the tests
//! and by single-host clusters; the delivery guarantees mirror the hardware ones exactly
//! (final byte last, in-order per pair, failures on revoked or partitioned targets).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use errors::*;
use protos::{ServerIdx, MAX_SERVERS};
use region::Region;
use transport::*;


struct HubInner {
	regions: HashMap<u32, Arc<Region>>,
	next_rkey: u32,

	/// rkey of each server's log region, for access revocation
	log_rkeys: HashMap<ServerIdx, u32>,
	revoked: HashSet<ServerIdx>,

	msgs: HashMap<ServerIdx, VecDeque<Vec<u8>>>,

	/// Severed pairs (both directions), for partition tests
	cut: HashSet<(ServerIdx, ServerIdx)>
}

/// The shared fabric connecting every in-process server
pub struct MemHub {
	inner: Mutex<HubInner>
}

impl MemHub {
	pub fn new() -> Arc<MemHub> {
		Arc::new(MemHub {
			inner: Mutex::new(HubInner {
				regions: HashMap::new(),
				next_rkey: 1,
				log_rkeys: HashMap::new(),
				revoked: HashSet::new(),
				msgs: HashMap::new(),
				cut: HashSet::new()
			})
		})
	}

	/// Cuts or restores the link between two servers (both directions)
	pub fn set_link(&self, a: ServerIdx, b: ServerIdx, up: bool) {
		let mut inner = self.inner.lock().unwrap();
		if up {
			inner.cut.remove(&(a, b));
			inner.cut.remove(&(b, a));
		} else {
			inner.cut.insert((a, b));
			inner.cut.insert((b, a));
		}
	}

	/// Partitions the cluster into two sides
	pub fn partition(&self, side_a: &[ServerIdx], side_b: &[ServerIdx]) {
		for a in side_a {
			for b in side_b {
				self.set_link(*a, *b, false);
			}
		}
	}

	fn register_region(&self, region: Arc<Region>) -> u32 {
		let mut inner = self.inner.lock().unwrap();
		let rkey = inner.next_rkey;
		inner.next_rkey += 1;
		inner.regions.insert(rkey, region);
		rkey
	}
}


struct PeerState {
	connected: bool,
	send_count: u32,
	rc: Option<RcInfo>,
	completions: VecDeque<Completion>
}

/// One server's handle onto the hub
pub struct MemTransport {
	hub: Arc<MemHub>,
	me: ServerIdx,
	local_rc: RcInfo,
	peers: Mutex<Vec<PeerState>>
}

impl MemTransport {
	pub fn new(hub: &Arc<MemHub>, me: ServerIdx, log_region: Arc<Region>, ctrl_region: Arc<Region>) -> MemTransport {
		let log_rkey = hub.register_region(log_region);
		let ctrl_rkey = hub.register_region(ctrl_region);

		{
			let mut inner = hub.inner.lock().unwrap();
			inner.log_rkeys.insert(me, log_rkey);
			inner.msgs.insert(me, VecDeque::new());
		}

		let mut peers = Vec::with_capacity(MAX_SERVERS);
		for _ in 0..MAX_SERVERS {
			peers.push(PeerState {
				connected: true,
				send_count: 0,
				rc: None,
				completions: VecDeque::new()
			});
		}

		MemTransport {
			hub: hub.clone(),
			me,
			local_rc: RcInfo {
				log_mr: RemoteMem { raddr: 0, rkey: log_rkey },
				ctrl_mr: RemoteMem { raddr: 0, rkey: ctrl_rkey }
			},
			peers: Mutex::new(peers)
		}
	}

	fn link_up(&self, peer: ServerIdx) -> bool {
		let inner = self.hub.inner.lock().unwrap();
		!inner.cut.contains(&(self.me, peer))
	}
}

impl Transport for MemTransport {
	fn write(&self, peer: ServerIdx, local: &[u8], rm: RemoteMem, flags: SendFlags) -> Result<()> {
		let ok = {
			let inner = self.hub.inner.lock().unwrap();

			if inner.cut.contains(&(self.me, peer)) {
				false
			} else {
				// A write into a revoked log region completes with failure
				let revoked = inner.log_rkeys.iter()
					.any(|(idx, rkey)| *rkey == rm.rkey && inner.revoked.contains(idx));

				if revoked {
					false
				} else {
					match inner.regions.get(&rm.rkey) {
						Some(region) => {
							region.write_final_byte_last(rm.raddr as usize, local);
							true
						},
						None => false
					}
				}
			}
		};

		let mut peers = self.peers.lock().unwrap();
		let state = &mut peers[peer as usize];
		if !ok {
			state.connected = false;
		}
		if flags.signaled || !ok {
			state.completions.push_back(Completion { peer, ok });
		}

		if ok { Ok(()) } else { bail!("write to disconnected peer {}", peer) }
	}

	fn read(&self, peer: ServerIdx, local: &mut [u8], rm: RemoteMem) -> Result<()> {
		let inner = self.hub.inner.lock().unwrap();

		if inner.cut.contains(&(self.me, peer)) {
			bail!("read from disconnected peer {}", peer);
		}

		match inner.regions.get(&rm.rkey) {
			Some(region) => {
				region.read(rm.raddr as usize, local);
				Ok(())
			},
			None => bail!("read from unknown rkey {}", rm.rkey)
		}
	}

	fn send_msg(&self, peer: ServerIdx, bytes: &[u8]) -> Result<()> {
		let mut inner = self.hub.inner.lock().unwrap();

		if inner.cut.contains(&(self.me, peer)) {
			// Lossy channel: silently dropped
			return Ok(());
		}

		if let Some(queue) = inner.msgs.get_mut(&peer) {
			queue.push_back(bytes.to_vec());
		}
		Ok(())
	}

	fn recv_msg(&self) -> Option<Vec<u8>> {
		let mut inner = self.hub.inner.lock().unwrap();
		inner.msgs.get_mut(&self.me).and_then(|q| q.pop_front())
	}

	fn poll_completions(&self, peer: ServerIdx, max: usize) -> Vec<Completion> {
		let mut peers = self.peers.lock().unwrap();
		let state = &mut peers[peer as usize];

		let mut out = vec![];
		while out.len() < max {
			match state.completions.pop_front() {
				Some(c) => out.push(c),
				None => break
			}
		}
		out
	}

	fn reserve_send(&self, peer: ServerIdx) -> SendFlags {
		let mut peers = self.peers.lock().unwrap();
		let state = &mut peers[peer as usize];

		let window = state.send_count & (S_DEPTH - 1);
		state.send_count += 1;

		SendFlags {
			signaled: window == 0,
			must_poll: window == S_DEPTH - 1
		}
	}

	fn disconnect(&self, peer: ServerIdx) {
		let mut peers = self.peers.lock().unwrap();
		peers[peer as usize].connected = false;
		peers[peer as usize].rc = None;
	}

	fn is_connected(&self, peer: ServerIdx) -> bool {
		if !self.link_up(peer) {
			return false;
		}
		let peers = self.peers.lock().unwrap();
		peers[peer as usize].connected && peers[peer as usize].rc.is_some()
	}

	fn revoke_log_access(&self) {
		self.hub.inner.lock().unwrap().revoked.insert(self.me);
	}

	fn restore_log_access(&self) {
		self.hub.inner.lock().unwrap().revoked.remove(&self.me);
	}

	fn local_rc_info(&self) -> RcInfo {
		self.local_rc
	}

	fn peer_rc_info(&self, peer: ServerIdx) -> Option<RcInfo> {
		self.peers.lock().unwrap()[peer as usize].rc
	}

	fn set_peer_rc_info(&self, peer: ServerIdx, rc: RcInfo) {
		let mut peers = self.peers.lock().unwrap();
		peers[peer as usize].rc = Some(rc);
		peers[peer as usize].connected = true;
	}

	fn register(&self, region: Arc<Region>) -> RemoteMem {
		RemoteMem { raddr: 0, rkey: self.hub.register_region(region) }
	}
}


#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::Ordering;

	fn pair() -> (Arc<MemHub>, MemTransport, MemTransport, Arc<Region>) {
		let hub = MemHub::new();

		let log0 = Arc::new(Region::new(4096));
		let ctrl0 = Arc::new(Region::new(4096));
		let log1 = Arc::new(Region::new(4096));
		let ctrl1 = Arc::new(Region::new(4096));

		let t0 = MemTransport::new(&hub, 0, log0, ctrl0);
		let t1 = MemTransport::new(&hub, 1, log1.clone(), ctrl1);

		let rc1 = t1.local_rc_info();
		t0.set_peer_rc_info(1, rc1);

		(hub, t0, t1, log1)
	}

	#[test]
	fn write_lands_in_peer_region() {
		let (_, t0, _t1, log1) = pair();

		let rm = t0.peer_rc_info(1).unwrap().log_mr.at(100);
		t0.write(1, b"payload", rm, SendFlags::default()).unwrap();

		let mut out = [0u8; 7];
		log1.read(100, &mut out);
		assert_eq!(&out, b"payload");
	}

	#[test]
	fn revoked_log_rejects_writes() {
		let (_, t0, t1, log1) = pair();

		t1.revoke_log_access();

		let rm = t0.peer_rc_info(1).unwrap().log_mr.at(0);
		assert!(t0.write(1, b"x", rm, SendFlags::default()).is_err());

		assert_eq!(log1.atomic_u8(0).load(Ordering::Acquire), 0);

		t1.restore_log_access();
		t0.set_peer_rc_info(1, t1.local_rc_info());
		assert!(t0.write(1, b"x", rm, SendFlags::default()).is_ok());
	}

	#[test]
	fn partition_fails_writes_and_drops_msgs() {
		let (hub, t0, t1, _) = pair();

		hub.partition(&[0], &[1]);

		let rm = t0.peer_rc_info(1).unwrap().log_mr.at(0);
		assert!(t0.write(1, b"x", rm, SendFlags::default()).is_err());
		assert!(!t0.is_connected(1));

		t0.send_msg(1, b"m").unwrap();
		assert_eq!(t1.recv_msg(), None);

		hub.set_link(0, 1, true);
		assert!(t0.link_up(1));
	}

	#[test]
	fn send_window_flags() {
		let (_, t0, _, _) = pair();

		let first = t0.reserve_send(1);
		assert!(first.signaled && !first.must_poll);

		for _ in 0..S_DEPTH - 2 {
			let mid = t0.reserve_send(1);
			assert!(!mid.signaled);
		}

		let last = t0.reserve_send(1);
		assert!(last.must_poll && !last.signaled);

		let next = t0.reserve_send(1);
		assert!(next.signaled);
	}
}
