use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, LittleEndian};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

use config_state::{ConfigAction, ConfigState};
use ctrl::CtrlRegion;
use log::{self, Log};
use protos::*;
use state::*;
use transport::Transport;


/// Timer periods; file-configurable, defaults match the design values
#[derive(Clone, Copy, Debug)]
pub struct Timing {
	pub hb_period: Duration,
	pub elec_low_us: u64,
	pub elec_high_us: u64,
	pub rc_info_period: Duration,
	pub retransmit_period: Duration,
	pub prune_period: Duration
}

impl Default for Timing {
	fn default() -> Timing {
		Timing {
			hb_period: Duration::from_millis(1),
			elec_low_us: 10_000,
			elec_high_us: 30_000,
			rc_info_period: Duration::from_millis(100),
			retransmit_period: Duration::from_millis(2),
			prune_period: Duration::from_millis(100)
		}
	}
}


/// External side effects requested by the consensus module during a single operation; the
/// server executes them after releasing the module lock
pub struct Tick {
	pub time: Instant,

	/// Rearm the heartbeat timer (send mode for leaders, receive mode otherwise)
	pub rearm_hb: Option<Duration>,
	/// Rearm the timeout adjuster
	pub rearm_adjust: Option<Duration>,

	/// A fresh leader must append a blank entry of this type so earlier-term entries can
	/// be committed
	pub append_blank: Option<EntryType>,

	pub config_actions: Vec<ConfigAction>,

	pub shutdown: bool
}

impl Tick {
	pub fn empty() -> Tick {
		Tick {
			time: Instant::now(),
			rearm_hb: None,
			rearm_adjust: None,
			append_blank: None,
			config_actions: vec![],
			shutdown: false
		}
	}
}


/// Number of failed control-path deliveries after which a server is suspected permanently
pub const PERMANENT_FAILURE: u8 = 2;

/// Fraction of the log that may fill up before pruning is forced
const FORCE_PRUNE_RATIO: f64 = 0.75;


pub struct ConsensusModule {
	idx: ServerIdx,

	pub config: ConfigState,

	log: Arc<Log>,
	ctrl: Arc<CtrlRegion>,
	transport: Arc<Transport>,

	state: ServerState,
	adjuster: TimeoutAdjuster,
	timing: Timing,

	/// Set once a HEAD entry was the last append, to avoid appending another until new
	/// entries arrive
	prev_append_was_head: bool
}

impl ConsensusModule {
	pub fn new(idx: ServerIdx, config: ConfigState, log: Arc<Log>, ctrl: Arc<CtrlRegion>,
		transport: Arc<Transport>, timing: Timing) -> ConsensusModule
	{
		ConsensusModule {
			idx,
			config,
			log,
			ctrl,
			transport,
			state: ServerState::new_follower(Instant::now()),
			adjuster: TimeoutAdjuster::new(timing.hb_period),
			timing,
			prev_append_was_head: false
		}
	}

	pub fn idx(&self) -> ServerIdx {
		self.idx
	}

	pub fn sid(&self) -> Sid {
		self.ctrl.sid()
	}

	pub fn is_leader(&self) -> bool {
		let sid = self.sid();
		sid.has_leader() && sid.idx() == self.idx
	}

	pub fn timing(&self) -> Timing {
		self.timing
	}

	fn update_sid(&self, new: Sid, old: Sid) -> bool {
		self.ctrl.cas_sid(old, new)
	}

	/// Member peers we talk to: on in the configuration, not ourselves
	fn peer_list(&self) -> Vec<ServerIdx> {
		let size = self.config.cid.extended_size();
		(0..size).filter(|i| *i != self.idx && self.config.cid.is_on(*i)).collect()
	}

	fn write_u64_to_peer(&self, peer: ServerIdx, value: u64, ctrl_slot: u64, to_log_region: bool) {
		let rc = match self.transport.peer_rc_info(peer) {
			Some(rc) => rc,
			None => return
		};
		let mr = if to_log_region { rc.log_mr } else { rc.ctrl_mr };

		let mut buf = [0u8; 8];
		LittleEndian::write_u64(&mut buf, value);

		let flags = self.transport.reserve_send(peer);
		if flags.must_poll {
			self.transport.poll_completions(peer, 1);
		}
		let _ = self.transport.write(peer, &buf, mr.at(ctrl_slot), flags);
	}

	/* ================================================================== */
	/* Heartbeats */

	/// Leader-side heartbeat tick: first check for replies carrying a higher term, then
	/// push our SID into every member's heartbeat slot
	pub fn hb_send(&mut self, tick: &mut Tick) {
		let sid = self.sid();

		for i in self.peer_list() {
			let hb = Sid(self.ctrl.hb_fetch_clear(i));
			if hb.0 == 0 || hb <= sid {
				continue;
			}

			// Somebody answered with a higher term: our leadership is over
			if self.update_sid(hb, sid) {
				self.become_follower(tick, None);
			}
			return;
		}

		for i in self.peer_list() {
			if !self.transport.is_connected(i) {
				continue;
			}
			self.write_u64_to_peer(i, sid.0, CtrlRegion::hb_offset(self.idx), false);
		}

		tick.rearm_hb = Some(self.timing.hb_period);
	}

	/// Follower/candidate heartbeat tick: drain heartbeat slots, adopt a leader's SID, or
	/// start an election when nothing up-to-date arrived in time
	pub fn hb_receive(&mut self, tick: &mut Tick) {
		// A tail left over from a previous leadership must not confuse the accept loop
		if !self.is_leader() {
			self.log.set_tail(self.log.len());
		}

		let cur = self.sid();
		let leader = cur.idx();
		let mut new_sid = cur;
		let mut timeout = true;

		for i in self.peer_list() {
			let hb = if i == leader {
				// Heartbeats from the leader are consumed by the timeout adjuster
				let mut hb = self.adjuster.latest_hb;
				self.adjuster.latest_hb = 0;
				if hb == 0 {
					hb = self.ctrl.hb_fetch_clear(i);
				}
				Sid(hb)
			} else {
				Sid(self.ctrl.hb_fetch_clear(i))
			};

			if hb.0 == 0 {
				continue;
			}
			if hb < new_sid {
				if hb.has_leader() {
					// An outdated leader: answer with our SID so it steps down
					self.write_u64_to_peer(i, cur.0, CtrlRegion::hb_offset(self.idx), false);
				}
				continue;
			}

			timeout = false;
			if hb.has_leader() {
				new_sid = hb;
			}
		}

		if timeout {
			self.start_election(tick);
			return;
		}

		if new_sid != cur {
			if self.update_sid(new_sid, cur) {
				self.become_follower(tick, Some(new_sid.idx()));
				return;
			}
		}

		tick.rearm_hb = Some(self.hb_timeout());
	}

	/// Adaptive timeout tick; runs only on followers
	pub fn to_adjust(&mut self, tick: &mut Tick) {
		if self.adjuster.locked || self.is_leader() {
			return;
		}

		let leader = self.sid().idx();
		let hb = self.ctrl.hb_fetch_clear(leader);
		if hb != 0 {
			// Keep the value for the receive timer
			self.adjuster.latest_hb = hb;
		}
		self.adjuster.observe(hb);

		if !self.adjuster.locked {
			tick.rearm_adjust = Some(self.adjuster.timeout);
		}
	}

	fn hb_timeout(&self) -> Duration {
		self.adjuster.timeout
	}

	fn become_follower(&mut self, tick: &mut Tick, leader: Option<ServerIdx>) {
		self.state = ServerState::Follower(ServerFollowerState {
			last_heartbeat: tick.time,
			leader
		});

		// A known leader needs write access to our log again
		if leader.is_some() {
			self.transport.restore_log_access();
		}

		tick.rearm_hb = Some(self.hb_timeout());
		if !self.adjuster.locked {
			tick.rearm_adjust = Some(self.adjuster.timeout);
		}
	}

	/* ================================================================== */
	/* Elections */

	fn new_election_timeout(&self) -> Duration {
		// Reseeded per attempt, biased by our index so ties break differently on every
		// server
		let now_us = SystemTime::now().duration_since(UNIX_EPOCH)
			.map(|d| d.as_secs() * 1_000_000 + d.subsec_micros() as u64)
			.unwrap_or(1);
		let seed = (self.idx as u64 + 1).wrapping_mul(now_us % 100_000_000);

		let mut rng = StdRng::seed_from_u64(seed);
		let span = (self.timing.elec_high_us - self.timing.elec_low_us).max(1);
		Duration::from_micros(self.timing.elec_low_us + rng.gen_range(0, span))
	}

	/// Last entry of the local log as an up-to-date measure
	fn last_entry_position(&self) -> (Term, u32) {
		let tail = self.log.tail();
		if tail == self.log.len() || self.log.is_empty() {
			return (0, 0);
		}

		match self.log.read_header(tail) {
			Some(hdr) => (hdr.msg_vs.view_id as Term, hdr.msg_vs.req_id),
			None => (0, 0)
		}
	}

	pub fn start_election(&mut self, tick: &mut Tick) {
		let cur = self.sid();
		let new_sid = Sid::new(cur.term() + 1, false, self.idx);
		if !self.update_sid(new_sid, cur) {
			return;
		}

		// Exclusive access to the local log for the duration of the election
		self.transport.revoke_log_access();

		for i in 0..self.config.cid.extended_size() {
			self.ctrl.set_vote_ack(i, self.log.len());
		}

		self.state = ServerState::Candidate(ServerCandidateState {
			election_start: tick.time,
			election_timeout: self.new_election_timeout()
		});

		let (last_term, last_index) = self.last_entry_position();
		let req = VoteRequest {
			last_index,
			last_term,
			cid: self.config.cid,
			sid: new_sid
		};
		let mut buf = [0u8; VOTE_REQ_SIZE];
		req.write_to(&mut buf);

		for i in self.peer_list() {
			if !self.transport.is_connected(i) {
				continue;
			}
			if let Some(rc) = self.transport.peer_rc_info(i) {
				let flags = self.transport.reserve_send(i);
				if flags.must_poll {
					self.transport.poll_completions(i, 1);
				}
				let _ = self.transport.write(i, &buf,
					rc.ctrl_mr.at(CtrlRegion::vote_req_offset(self.idx)), flags);
			}
		}

		if let ServerState::Candidate(ref s) = self.state {
			tick.rearm_hb = Some(s.election_timeout);
		}
	}

	/// Examines incoming vote requests; grants at most one vote per term
	pub fn poll_vote_requests(&mut self, tick: &mut Tick) {
		// An active leader is known; ignore disruptions
		if self.sid().has_leader() {
			return;
		}

		// Maybe the outcome of the election we voted in is already visible
		let possible_leader = self.sid().idx();
		let hb = Sid(self.ctrl.hb_peek(possible_leader));
		if hb.0 != 0 && hb.term() == self.sid().term() && hb.has_leader() {
			let cur = self.sid();
			if self.update_sid(hb, cur) {
				self.become_follower(tick, Some(hb.idx()));
			}
			return;
		}

		// Setting the L bit here means [term|1|voted] compares above every other request
		// of the same term: one vote per term across all candidates
		let old_sid = self.sid().with_leader();
		let mut best_sid = old_sid;

		let size = self.config.cid.extended_size();
		for i in 0..size {
			if i == self.idx {
				continue;
			}
			let req = match self.ctrl.vote_req(i) {
				Some(r) => r,
				None => continue
			};
			if best_sid >= req.sid {
				self.ctrl.clear_vote_req(i);
				continue;
			}
			best_sid = req.sid;
		}

		if best_sid == old_sid {
			return;
		}

		// There is a plausible candidate; freeze the log and compare histories
		self.transport.revoke_log_access();
		self.log.fill_nc_buf();

		let (my_term, my_index) = self.last_entry_position();
		let mut best = VoteRequest {
			last_index: my_index,
			last_term: my_term,
			cid: self.config.cid,
			sid: old_sid
		};
		let mut highest_term = best_sid.term();

		for i in 0..size {
			let req = match self.ctrl.vote_req(i) {
				Some(r) => r,
				None => continue
			};
			if best.sid > req.sid {
				self.ctrl.clear_vote_req(i);
				continue;
			}
			if highest_term < req.sid.term() {
				highest_term = req.sid.term();
			}
			// The strictly-lexicographic up-to-date test
			if best.last_term > req.last_term
				|| (best.last_term == req.last_term && best.last_index > req.last_index)
			{
				self.ctrl.clear_vote_req(i);
				continue;
			}

			best = req;
			self.ctrl.clear_vote_req(i);
		}

		if best.sid == old_sid {
			// Every candidate's log is worse than ours, but their terms are higher: raise
			// our term without voting so our next election attempt can win
			let cur = self.sid();
			let new_sid = cur.with_term(highest_term).with_idx(self.idx);
			self.update_sid(new_sid, cur);
			return;
		}

		// Cast the vote
		let cur = self.sid();
		if !self.update_sid(best.sid, cur) {
			return;
		}

		let candidate = best.sid.idx();

		// Adopt the candidate's configuration if it is newer
		if best.cid.epoch > self.config.cid.epoch {
			let entry_key = self.config.cid_key;
			let actions = self.config.apply_config(best.cid, entry_key, false);
			tick.config_actions.extend(actions);
		}

		// Replicate the vote so a crash cannot make us vote twice in this term
		self.write_u64_to_peer(candidate, best.sid.0,
			CtrlRegion::vote_sid_offset(self.idx), false);

		self.adjuster.leader_failed = false;
		if !self.adjuster.locked {
			tick.rearm_adjust = Some(self.adjuster.timeout);
		}

		// The supported candidate gets our log back
		self.transport.restore_log_access();

		// Ack with our commit offset; the candidate reconciles from there
		self.write_u64_to_peer(candidate, self.log.commit(),
			CtrlRegion::vote_ack_offset(self.idx), false);

		self.state = ServerState::Follower(ServerFollowerState {
			last_heartbeat: tick.time,
			leader: None
		});
		tick.rearm_hb = Some(self.hb_timeout());
	}

	/// Candidate-side vote counting under the joint-quorum rule
	pub fn poll_vote_count(&mut self, tick: &mut Tick) {
		match self.state {
			ServerState::Candidate(_) => {},
			_ => return
		}

		let mut bitmap: u32 = 1 << self.idx;
		let len = self.log.len();

		let size = self.config.cid.extended_size();
		for i in 0..size {
			if i == self.idx {
				continue;
			}
			let remote_commit = self.ctrl.vote_ack(i);
			if remote_commit == len {
				continue;
			}

			bitmap |= 1 << i;
			self.ctrl.set_peer_commit(i, remote_commit);

			// A voter may know of commits we have not learned about yet
			if self.log.is_offset_larger(remote_commit, self.log.commit()) {
				self.log.set_commit(remote_commit);
			}
		}

		if !self.config.quorum(bitmap) {
			return;
		}

		self.become_leader(tick, bitmap);
	}

	fn become_leader(&mut self, tick: &mut Tick, voters: u32) {
		let cur = self.sid();
		if !self.update_sid(cur.with_leader(), cur) {
			return;
		}

		let mut peers = [PeerProgress::new(); MAX_SERVERS];
		for i in 0..self.config.cid.extended_size() {
			if i != self.idx && (voters & (1 << i)) != 0 {
				peers[i as usize].step = LrStep::GetNc;
			}
		}
		self.state = ServerState::Leader(ServerLeaderState { peers });

		for i in 0..MAX_SERVERS as u8 {
			self.ctrl.set_apply_offset(i, self.log.head());
		}

		// We own the log again
		self.transport.restore_log_access();

		// The blank entry lets previous-term entries commit; a CONFIG blank re-asserts a
		// stable configuration, a NOOP leaves an in-flight transition alone
		tick.append_blank = Some(if self.config.cid.state == CidState::Stable {
			EntryType::Config
		} else {
			EntryType::Noop
		});

		// Heartbeats start immediately; the adjuster is suspended while leading
		tick.rearm_hb = Some(Duration::from_millis(0));
		tick.rearm_adjust = None;
	}

	/* ================================================================== */
	/* Log reconciliation */

	/// Walks every follower one step further through the reconciliation ladder. Called
	/// from the event loop while leading
	pub fn reconcile(&mut self) {
		if !self.is_leader() {
			return;
		}

		let my_end = self.log.end();
		let len = self.log.len();

		let peer_idxs = self.peer_list();
		for i in peer_idxs {
			let step = match self.state {
				ServerState::Leader(ref s) => s.peers[i as usize].step,
				_ => return
			};

			if !self.transport.is_connected(i) {
				continue;
			}

			match step {
				LrStep::Idle => {
					// A vote ack may have arrived after the election ended
					if self.ctrl.vote_ack(i) != len {
						self.ctrl.set_peer_commit(i, self.ctrl.vote_ack(i));
						self.set_step(i, LrStep::GetNc);
					}
				},
				LrStep::GetNc => {
					if self.step_get_nc(i).is_err() {
						self.record_failure(i);
					}
				},
				LrStep::SetEnd => {
					let peer_end = self.ctrl.peer_end(i);
					if let Some(rc) = self.transport.peer_rc_info(i) {
						let mut buf = [0u8; 8];
						LittleEndian::write_u64(&mut buf, peer_end);
						let flags = self.transport.reserve_send(i);
						match self.transport.write(i, &buf, rc.log_mr.at(log::OFF_END as u64), flags) {
							Ok(_) => self.set_step(i, LrStep::UpdateLog),
							Err(_) => self.record_failure(i)
						}
					}
				},
				LrStep::UpdateLog => {
					let peer_end = self.ctrl.peer_end(i);
					if peer_end == my_end {
						self.set_step(i, LrStep::Done);
						continue;
					}
					if self.step_update_log(i, peer_end, my_end).is_err() {
						self.record_failure(i);
					}
				},
				LrStep::UpdateEnd => {
					// The follower advances its own end as it consumes the pushed bytes;
					// we only refresh our cache and lazily share the commit offset
					let cached = match self.state {
						ServerState::Leader(ref s) => s.peers[i as usize].cached_end,
						_ => return
					};
					self.ctrl.set_peer_end(i, cached);

					if let Some(rc) = self.transport.peer_rc_info(i) {
						let mut buf = [0u8; 8];
						LittleEndian::write_u64(&mut buf, self.log.commit());
						let flags = self.transport.reserve_send(i);
						let _ = self.transport.write(i, &buf, rc.log_mr.at(log::OFF_COMMIT as u64), flags);
					}
					self.set_step(i, LrStep::Done);
				},
				LrStep::Done => {}
			}
		}

		if let Some(watermark) = self.commit_watermark() {
			if self.log.is_offset_larger(watermark, self.log.commit()) {
				self.log.advance_commit(watermark);
			}
		}
	}

	fn set_step(&mut self, i: ServerIdx, step: LrStep) {
		if let ServerState::Leader(ref mut s) = self.state {
			s.peers[i as usize].step = step;
		}
	}

	fn record_failure(&mut self, i: ServerIdx) {
		if let ServerState::Leader(ref mut s) = self.state {
			let p = &mut s.peers[i as usize];
			if p.fail_count < ::std::u8::MAX {
				p.fail_count += 1;
			}
		}
	}

	/// Phase I: fetch the follower's not-committed entries and find the first divergence
	fn step_get_nc(&mut self, i: ServerIdx) -> ::errors::Result<()> {
		let rc = match self.transport.peer_rc_info(i) {
			Some(rc) => rc,
			None => bail!("no rc info for peer {}", i)
		};

		let mut img = vec![0u8; 8 + log::NC_MAX * log::NC_ENTRY_SIZE];
		self.transport.read(i, &mut img, rc.log_mr.at(log::OFF_NC_LEN as u64))?;
		let nc = Log::parse_nc_buf(&img);

		// Logs are position-aligned: entries live at the same byte offsets everywhere, so
		// the follower's correct end is the offset of its first entry that differs from
		// ours (or the end of its listing if everything matches)
		let mut peer_end = self.ctrl.peer_commit(i);
		for (key, off) in nc {
			if off != peer_end {
				break;
			}
			if self.log.offset_end_distance(off) == 0 {
				// The follower has entries beyond our log; truncate them
				break;
			}
			let hdr = match self.log.read_header(off) {
				Some(h) => h,
				None => break
			};
			if hdr.msg_vs.to_key() != key {
				break;
			}
			peer_end = off + hdr.entry_len();
		}

		self.ctrl.set_peer_end(i, peer_end);
		self.set_step(i, LrStep::SetEnd);
		Ok(())
	}

	/// Phase II: push the missing byte range, as two writes when it wraps
	fn step_update_log(&mut self, i: ServerIdx, peer_end: u64, my_end: u64) -> ::errors::Result<()> {
		let rc = match self.transport.peer_rc_info(i) {
			Some(rc) => rc,
			None => bail!("no rc info for peer {}", i)
		};

		let len = self.log.len();

		if my_end > peer_end {
			let bytes = self.log.read_entry_bytes(peer_end, my_end - peer_end);
			let flags = self.transport.reserve_send(i);
			self.transport.write(i, &bytes,
				rc.log_mr.at(log::ENTRIES_OFF as u64 + peer_end), flags)?;
		} else {
			let first = self.log.read_entry_bytes(peer_end, len - peer_end);
			let flags = self.transport.reserve_send(i);
			self.transport.write(i, &first,
				rc.log_mr.at(log::ENTRIES_OFF as u64 + peer_end), flags)?;

			let second = self.log.read_entry_bytes(0, my_end);
			let flags = self.transport.reserve_send(i);
			self.transport.write(i, &second,
				rc.log_mr.at(log::ENTRIES_OFF as u64), flags)?;
		}

		if let ServerState::Leader(ref mut s) = self.state {
			s.peers[i as usize].cached_end = my_end;
		}
		self.set_step(i, LrStep::UpdateEnd);
		Ok(())
	}

	/// The committable watermark after a leader change: the largest offset replicated on a
	/// quorum, judged by the known end offsets (joint rule in transitions)
	fn commit_watermark(&self) -> Option<u64> {
		let ends = match self.state {
			ServerState::Leader(ref s) => {
				let mut ends = vec![];
				for i in self.peer_list() {
					if s.peers[i as usize].step == LrStep::Done
						|| s.peers[i as usize].step == LrStep::UpdateEnd
					{
						ends.push((i, self.ctrl.peer_end(i)));
					}
				}
				ends
			},
			_ => return None
		};

		let mut candidates: Vec<u64> = ends.iter().map(|e| e.1).collect();
		candidates.push(self.log.end());
		candidates.sort();
		candidates.dedup();

		// The largest candidate offset that a quorum of servers has reached
		let mut best = None;
		for w in candidates {
			let mut bitmap: u32 = 1 << self.idx;
			for (i, end) in ends.iter() {
				if !self.log.is_offset_larger(w, *end) {
					bitmap |= 1 << i;
				}
			}
			if self.log.is_offset_larger(w, self.log.end()) {
				continue;
			}
			if self.config.quorum(bitmap) {
				best = Some(w);
			}
		}

		best
	}

	/* ================================================================== */
	/* Failure suspicion and pruning */

	/// Counts delivery failures; in a stable configuration the leader removes servers that
	/// failed permanently, and a leader that lost its majority steps down
	pub fn check_failure_count(&mut self, tick: &mut Tick) -> Option<Cid> {
		if !self.is_leader() {
			return None;
		}

		// Fold in completion outcomes
		let peer_idxs = self.peer_list();
		for i in peer_idxs.iter() {
			for c in self.transport.poll_completions(*i, 16) {
				if !c.ok {
					self.record_failure(*i);
				}
			}
		}

		let mut suspect = None;

		if let ServerState::Leader(ref s) = self.state {
			for i in peer_idxs.iter() {
				if s.peers[*i as usize].fail_count >= PERMANENT_FAILURE && suspect.is_none() {
					suspect = Some(*i);
				}
			}
		}

		// Quorum unreachable: give up leadership and retry after the timeout
		if !self.config.quorum(self.connected_bitmap()) {
			let sid = self.sid();
			self.update_sid(sid.without_leader(), sid);
			self.become_follower(tick, None);
			return None;
		}

		if let Some(target) = suspect {
			if let Some(cid) = self.config.plan_remove(target) {
				self.transport.disconnect(target);
				return Some(cid);
			}
		}

		None
	}

	fn connected_bitmap(&self) -> u32 {
		let mut bitmap: u32 = 1 << self.idx;
		for i in self.peer_list() {
			let ok = match self.state {
				ServerState::Leader(ref s) =>
					s.peers[i as usize].fail_count < PERMANENT_FAILURE
						&& self.transport.is_connected(i),
				_ => self.transport.is_connected(i)
			};
			if ok {
				bitmap |= 1 << i;
			}
		}
		bitmap
	}

	/// Log pruning tick: advance our head to the smallest remote apply offset, announce it
	/// with a HEAD entry, and refresh the remote apply offsets for the next round
	pub fn prune_log(&mut self) -> Option<u64> {
		if !self.is_leader() {
			return None;
		}

		let mut min_offset = self.log.apply();
		for i in 0..self.config.cid.extended_size() {
			if i == self.idx {
				continue;
			}
			if !self.config.cid.is_on(i) {
				self.ctrl.set_apply_offset(i, self.log.apply());
				continue;
			}
			let off = self.ctrl.apply_offset(i);
			if self.log.is_offset_larger(min_offset, off) {
				min_offset = off;
			}
		}

		let mut head_update = None;
		if self.log.is_offset_larger(min_offset, self.log.head()) && !self.prev_append_was_head {
			self.log.set_head(min_offset);
			self.prev_append_was_head = true;
			head_update = Some(min_offset);
		}

		// Refresh remote apply offsets for the next round
		for i in self.peer_list() {
			if !self.transport.is_connected(i) {
				continue;
			}
			if let Some(rc) = self.transport.peer_rc_info(i) {
				let mut buf = [0u8; 8];
				if self.transport.read(i, &mut buf, rc.log_mr.at(log::OFF_APPLY as u64)).is_ok() {
					self.ctrl.set_apply_offset(i, LittleEndian::read_u64(&buf));
				}
			}
		}

		head_update
	}

	/// Lifts the head-entry latch once something else was appended
	pub fn note_append(&mut self) {
		self.prev_append_was_head = false;
	}

	/// Whether the log is full enough that pruning cannot wait for its timer
	pub fn needs_forced_pruning(&self) -> bool {
		if !self.is_leader() {
			return false;
		}
		let used = self.log.offset_end_distance(self.log.head());
		used as f64 >= FORCE_PRUNE_RATIO * self.log.len() as f64
	}

	/* ================================================================== */
	/* Membership entry points */

	/// JOIN request from the side channel; leader-only. Returns the CONFIG CID to append
	pub fn handle_join(&mut self, requested: Option<ServerIdx>) -> Option<Cid> {
		if !self.is_leader() {
			return None;
		}
		self.config.plan_join(requested).map(|(_, cid)| cid)
	}

	/// DOWNSIZE request; leader-only
	pub fn handle_downsize(&mut self, new_size: u8) -> Option<Cid> {
		if !self.is_leader() {
			return None;
		}
		self.config.plan_downsize(new_size)
	}

	/// A committed CONFIG entry reached the apply offset
	pub fn apply_config_entry(&mut self, cid: Cid, entry_key: u64) -> Vec<ConfigAction> {
		let is_leader = self.is_leader();
		self.config.apply_config(cid, entry_key, is_leader)
	}

	/// A committed HEAD entry reached the apply offset
	pub fn apply_head_entry(&mut self, new_head: u64) {
		if self.log.is_offset_larger(new_head, self.log.head()) {
			self.log.set_head(new_head);
		}
	}
}


#[cfg(test)]
mod tests {
	use super::*;
	use transport::mem::{MemHub, MemTransport};

	struct Node {
		module: ConsensusModule,
		log: Arc<Log>,
		ctrl: Arc<CtrlRegion>,
		transport: Arc<MemTransport>
	}

	fn cluster(n: u8) -> (Arc<MemHub>, Vec<Node>) {
		let hub = MemHub::new();

		let mut parts = vec![];
		for i in 0..n {
			let log = Arc::new(Log::new(256 * 1024));
			let ctrl = Arc::new(CtrlRegion::new());
			let transport = Arc::new(MemTransport::new(&hub, i, log.region(), ctrl.region()));
			parts.push((log, ctrl, transport));
		}

		// Everybody learns everybody's registrations
		for i in 0..n as usize {
			for j in 0..n as usize {
				if i != j {
					let rc = parts[j].2.local_rc_info();
					parts[i].2.set_peer_rc_info(j as u8, rc);
				}
			}
		}

		let nodes = parts.into_iter().enumerate().map(|(i, (log, ctrl, transport))| {
			let module = ConsensusModule::new(i as u8, ConfigState::new(i as u8, n),
				log.clone(), ctrl.clone(),
				transport.clone() as Arc<Transport>, Timing::default());
			Node { module, log, ctrl, transport }
		}).collect();

		(hub, nodes)
	}

	fn append_entry(log: &Log, vs: ViewStamp, payload: &[u8]) -> u64 {
		let (off, marker) = log.reserve(payload.len());
		if let Some(m) = marker {
			log.stamp_wrap_marker(m);
		}
		log.write_entry(off, &::log::EntryHeader {
			msg_vs: vs,
			req_canbe_exed: ViewStamp::new(0, 0),
			node_id: 0,
			data_size: payload.len() as u32 + 1,
			entry_type: EntryType::Send,
			clt_id: vs
		}, payload);
		off
	}

	#[test]
	fn three_way_election() {
		let (_hub, mut nodes) = cluster(3);

		// Node 0 times out first and campaigns
		let mut tick = Tick::empty();
		nodes[0].module.start_election(&mut tick);
		assert_eq!(nodes[0].module.sid(), Sid::new(1, false, 0));

		// The others see the request and vote
		for i in 1..3 {
			let mut tick = Tick::empty();
			nodes[i].module.poll_vote_requests(&mut tick);
			assert_eq!(nodes[i].module.sid(), Sid::new(1, false, 0));
		}

		// Votes arrive; node 0 wins
		let mut tick = Tick::empty();
		nodes[0].module.poll_vote_count(&mut tick);
		assert!(nodes[0].module.is_leader());
		assert_eq!(nodes[0].module.sid(), Sid::new(1, true, 0));
		assert_eq!(tick.append_blank, Some(EntryType::Config));

		// Heartbeats assert the leadership; followers adopt the L-flagged SID
		let mut tick = Tick::empty();
		nodes[0].module.hb_send(&mut tick);
		for i in 1..3 {
			let mut tick = Tick::empty();
			nodes[i].module.hb_receive(&mut tick);
			assert_eq!(nodes[i].module.sid(), Sid::new(1, true, 0));
			assert!(!nodes[i].module.is_leader());
		}
	}

	#[test]
	fn vote_is_granted_once_per_term() {
		let (_hub, mut nodes) = cluster(3);

		// Two candidates campaign in the same term; node 2 sees both requests at once
		let mut tick = Tick::empty();
		nodes[0].module.start_election(&mut tick);
		let mut tick = Tick::empty();
		nodes[1].module.start_election(&mut tick);

		let mut tick = Tick::empty();
		nodes[2].module.poll_vote_requests(&mut tick);
		let first_vote = nodes[2].module.sid();
		assert_eq!(first_vote.term(), 1);

		// Re-polling must not switch the vote within the term
		let mut tick = Tick::empty();
		nodes[2].module.poll_vote_requests(&mut tick);
		assert_eq!(nodes[2].module.sid(), first_vote);
	}

	#[test]
	fn stale_log_cannot_win() {
		let (_hub, mut nodes) = cluster(3);

		// Nodes 1 and 2 hold an entry from view 1 that node 0 never got
		for i in 1..3 {
			append_entry(&nodes[i].log, ViewStamp::new(1, 1), b"x");
		}

		let mut tick = Tick::empty();
		nodes[0].module.start_election(&mut tick);

		for i in 1..3 {
			let mut tick = Tick::empty();
			nodes[i].module.poll_vote_requests(&mut tick);
			// Terms rise, but no vote is granted to the stale candidate
			assert_eq!(nodes[i].module.sid().idx(), i as u8);
		}

		let mut tick = Tick::empty();
		nodes[0].module.poll_vote_count(&mut tick);
		assert!(!nodes[0].module.is_leader());
	}

	#[test]
	fn higher_term_heartbeat_dethrones_leader() {
		let (_hub, mut nodes) = cluster(3);

		let mut tick = Tick::empty();
		nodes[0].module.start_election(&mut tick);
		for i in 1..3 {
			let mut tick = Tick::empty();
			nodes[i].module.poll_vote_requests(&mut tick);
		}
		let mut tick = Tick::empty();
		nodes[0].module.poll_vote_count(&mut tick);
		assert!(nodes[0].module.is_leader());

		// A heartbeat reply with a higher term lands in our slot
		let newer = Sid::new(5, true, 2);
		let region = nodes[0].ctrl.region();
		region.atomic_u64(::ctrl::OFF_HB + 2 * ::ctrl::SLOT_STRIDE)
			.store(newer.0, ::std::sync::atomic::Ordering::Release);

		let mut tick = Tick::empty();
		nodes[0].module.hb_send(&mut tick);
		assert!(!nodes[0].module.is_leader());
		assert_eq!(nodes[0].module.sid(), newer);
	}

	#[test]
	fn minority_partition_cannot_win() {
		// Five servers; the old leader 0 ends up isolated with server 1 while the
		// majority side elects a successor at a higher term
		let (hub, mut nodes) = cluster(5);

		// Node 0 is the established leader
		let mut tick = Tick::empty();
		nodes[0].module.start_election(&mut tick);
		for i in 1..5 {
			let mut tick = Tick::empty();
			nodes[i].module.poll_vote_requests(&mut tick);
		}
		let mut tick = Tick::empty();
		nodes[0].module.poll_vote_count(&mut tick);
		assert!(nodes[0].module.is_leader());

		hub.partition(&[0, 1], &[2, 3, 4]);

		// The minority side campaigns and fails
		let mut tick = Tick::empty();
		nodes[1].module.start_election(&mut tick);
		let mut tick = Tick::empty();
		nodes[1].module.poll_vote_count(&mut tick);
		assert!(!nodes[1].module.is_leader());

		// The majority side succeeds with a higher term
		let mut tick = Tick::empty();
		nodes[2].module.start_election(&mut tick);
		for i in 3..5 {
			let mut tick = Tick::empty();
			nodes[i].module.poll_vote_requests(&mut tick);
		}
		let mut tick = Tick::empty();
		nodes[2].module.poll_vote_count(&mut tick);
		assert!(nodes[2].module.is_leader());
		assert!(nodes[2].module.sid().term() > 1);

		// The deposed leader loses its majority and steps down
		let mut tick = Tick::empty();
		nodes[0].module.check_failure_count(&mut tick);
		assert!(!nodes[0].module.is_leader());
	}

	#[test]
	fn reconciliation_discards_divergent_tail() {
		// The new leader has e1..e3; the follower shares e1 but has a divergent e2 and
		// never saw e3. After reconciliation the follower's bytes match the leader's
		let (_hub, mut nodes) = cluster(3);

		let l1 = append_entry(&nodes[0].log, ViewStamp::new(1, 1), b"one");
		let _l2 = append_entry(&nodes[0].log, ViewStamp::new(1, 2), b"two");
		let _l3 = append_entry(&nodes[0].log, ViewStamp::new(1, 3), b"333");
		let _ = l1;

		append_entry(&nodes[1].log, ViewStamp::new(1, 1), b"one");
		append_entry(&nodes[1].log, ViewStamp::new(2, 9), b"bad");

		// The follower voted: its commit covers e1 only, its nc buffer lists the rest
		let e1_len = ::log::entry_len_for(3);
		nodes[1].log.advance_commit(e1_len);
		nodes[1].log.fill_nc_buf();

		// Make node 0 the leader and feed it the follower's vote ack
		let mut tick = Tick::empty();
		nodes[0].module.start_election(&mut tick);
		nodes[0].ctrl.set_vote_ack(1, e1_len);
		nodes[0].ctrl.set_vote_ack(2, 0);
		let mut tick = Tick::empty();
		nodes[0].module.poll_vote_count(&mut tick);
		assert!(nodes[0].module.is_leader());

		// Walk the ladder to completion
		for _ in 0..4 {
			nodes[0].module.reconcile();
		}

		// The follower's log now matches the leader's byte for byte
		let leader_end = nodes[0].log.end();
		let leader_bytes = nodes[0].log.read_entry_bytes(0, leader_end);
		let follower_bytes = nodes[1].log.read_entry_bytes(0, leader_end);
		assert_eq!(leader_bytes, follower_bytes);

		// And the divergent follower entry is gone from its visible range
		let hdr = nodes[1].log.read_header(e1_len).unwrap();
		assert_eq!(hdr.msg_vs, ViewStamp::new(1, 2));
	}

	#[test]
	fn prune_appends_head_watermark() {
		let (_hub, mut nodes) = cluster(3);

		let mut tick = Tick::empty();
		nodes[0].module.start_election(&mut tick);
		for i in 1..3 {
			let mut tick = Tick::empty();
			nodes[i].module.poll_vote_requests(&mut tick);
		}
		let mut tick = Tick::empty();
		nodes[0].module.poll_vote_count(&mut tick);
		assert!(nodes[0].module.is_leader());

		let e1 = append_entry(&nodes[0].log, ViewStamp::new(1, 1), b"a");
		let _ = e1;
		let e2 = append_entry(&nodes[0].log, ViewStamp::new(1, 2), b"b");
		nodes[0].log.advance_commit(e2);
		nodes[0].log.set_apply(e2);

		// Followers report their apply offsets at e2 as well
		nodes[0].ctrl.set_apply_offset(1, e2);
		nodes[0].ctrl.set_apply_offset(2, e2);
		nodes[0].module.note_append();

		let head = nodes[0].module.prune_log();
		assert_eq!(head, Some(e2));
		assert_eq!(nodes[0].log.head(), e2);

		// No second HEAD until something else lands in the log
		nodes[0].ctrl.set_apply_offset(1, nodes[0].log.end());
		assert_eq!(nodes[0].module.prune_log(), None);
	}
}
