use std::time::{Duration, Instant};

use protos::*;


/// Step of the per-follower log reconciliation ladder a new leader walks
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum LrStep {
	/// No vote ack from this server yet; nothing can be reconciled
	Idle,
	/// Read the follower's not-committed buffer
	GetNc,
	/// Rewind the follower's end offset to the first divergence
	SetEnd,
	/// Push the missing byte range
	UpdateLog,
	/// Refresh cached offsets and lazily write the commit offset
	UpdateEnd,
	/// Follower is in sync; normal submissions keep it that way
	Done
}

/// Leader-side bookkeeping for one peer
#[derive(Clone, Copy)]
pub struct PeerProgress {
	pub step: LrStep,
	/// Our end offset at the time the last UpdateLog write was issued
	pub cached_end: u64,
	/// Failed deliveries on the control path; two in a row means permanent suspicion
	pub fail_count: u8
}

impl PeerProgress {
	pub fn new() -> PeerProgress {
		PeerProgress {
			step: LrStep::Idle,
			cached_end: 0,
			fail_count: 0
		}
	}
}


pub struct ServerFollowerState {
	pub last_heartbeat: Instant,
	pub leader: Option<ServerIdx>
}

pub struct ServerCandidateState {
	pub election_start: Instant,
	pub election_timeout: Duration
}

pub struct ServerLeaderState {
	pub peers: [PeerProgress; MAX_SERVERS]
}

pub enum ServerState {
	Follower(ServerFollowerState),
	Candidate(ServerCandidateState),
	Leader(ServerLeaderState)
}

impl ServerState {
	pub fn new_follower(now: Instant) -> ServerState {
		ServerState::Follower(ServerFollowerState {
			last_heartbeat: now,
			leader: None
		})
	}
}


/// Adaptive follower heartbeat timeout
///
/// Starts at ten heartbeat periods and grows by one period on every false positive (we
/// declared the leader dead, then its heartbeat arrived). Once the false-positive rate over
/// enough samples drops below one in ten thousand the timeout locks
pub struct TimeoutAdjuster {
	hb_period: Duration,
	pub timeout: Duration,
	total: u64,
	fp: u64,
	pub locked: bool,
	pub leader_failed: bool,
	/// Heartbeat consumed by the adjuster, handed to the receive timer
	pub latest_hb: u64
}

const ADJUST_MIN_SAMPLES: u64 = 100_000;
const ADJUST_MAX_FP_RATE: f64 = 0.0001;

impl TimeoutAdjuster {
	pub fn new(hb_period: Duration) -> TimeoutAdjuster {
		TimeoutAdjuster {
			hb_period,
			timeout: hb_period * 10,
			total: 0,
			fp: 0,
			locked: false,
			leader_failed: false,
			latest_hb: 0
		}
	}

	/// One adjuster tick with the freshly cleared leader heartbeat slot
	pub fn observe(&mut self, hb: u64) {
		if self.locked {
			return;
		}

		self.total += 1;

		if hb != 0 {
			self.latest_hb = hb;
			if self.leader_failed {
				self.fp += 1;
				self.leader_failed = false;
				self.timeout += self.hb_period;
			}
		} else {
			self.leader_failed = true;
		}

		if self.total > ADJUST_MIN_SAMPLES
			&& (self.fp as f64 / self.total as f64) < ADJUST_MAX_FP_RATE
		{
			self.locked = true;
		}
	}
}


#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn adjuster_grows_on_false_positive() {
		let period = Duration::from_millis(1);
		let mut adj = TimeoutAdjuster::new(period);
		assert_eq!(adj.timeout, period * 10);

		// Missed beat, then a late arrival: one false positive, timeout grows
		adj.observe(0);
		assert!(adj.leader_failed);
		adj.observe(42);
		assert_eq!(adj.latest_hb, 42);
		assert_eq!(adj.timeout, period * 11);
	}

	#[test]
	fn adjuster_locks_after_quiet_run() {
		let mut adj = TimeoutAdjuster::new(Duration::from_millis(1));

		for _ in 0..(ADJUST_MIN_SAMPLES + 1) {
			adj.observe(1);
		}
		assert!(adj.locked);

		let before = adj.timeout;
		adj.observe(0);
		adj.observe(1);
		assert_eq!(adj.timeout, before);
	}
}
