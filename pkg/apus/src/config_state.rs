use protos::*;


/// Side effects requested by a configuration transition; executed by the server outside
/// the consensus lock
#[derive(Clone, PartialEq, Debug)]
pub enum ConfigAction {
	/// Tear down the connection to a removed server
	Disconnect(ServerIdx),
	/// We were removed; shut down now that the removal has committed
	ShutdownSelf,
	/// The leader must append a follow-up CONFIG entry carrying this CID
	AppendConfig(Cid),
	/// The leader must send a CfgReply to an admitted joiner
	NotifyJoiner(ServerIdx)
}


/// The configuration state machine
///
/// The current CID only ever changes when a CONFIG log entry commits; everything else here
/// is planning (building the CID a join/downsize/removal would move to) and bookkeeping for
/// the scan offset of control entries
pub struct ConfigState {
	pub idx: ServerIdx,
	pub cid: Cid,

	/// Record key of the newest CONFIG entry applied; entries at or below are stale
	pub cid_key: u64,

	/// Joiner waiting for its admitting CONFIG entry to commit (leader only)
	pub pending_join: Option<ServerIdx>
}

impl ConfigState {
	pub fn new(idx: ServerIdx, group_size: u8) -> ConfigState {
		ConfigState {
			idx,
			cid: Cid::bootstrap(group_size),
			cid_key: 0,
			pending_join: None
		}
	}

	/// Starts from a CID handed over by the cluster (joining server)
	pub fn from_cid(idx: ServerIdx, cid: Cid, cid_key: u64) -> ConfigState {
		ConfigState {
			idx,
			cid,
			cid_key,
			pending_join: None
		}
	}

	pub fn quorum(&self, bitmap: u32) -> bool {
		self.cid.quorum(bitmap)
	}

	/// Plans admission of a joining server: reuse the lowest free slot of the current group
	/// if one exists, otherwise grow into an extended configuration. None unless stable.
	/// A requested slot is honored when it is actually free
	pub fn plan_join(&mut self, requested: Option<ServerIdx>) -> Option<(ServerIdx, Cid)> {
		if self.cid.state != CidState::Stable || self.pending_join.is_some() {
			return None;
		}

		// A hole left by a removed server keeps the group size unchanged
		let hole = match requested {
			Some(r) if r < self.cid.size[0] && !self.cid.is_on(r) => Some(r),
			Some(_) => None,
			None => (0..self.cid.size[0]).find(|i| !self.cid.is_on(*i))
		};

		if let Some(i) = hole {
			let mut cid = self.cid;
			cid.epoch += 1;
			cid.server_add(i);

			self.pending_join = Some(i);
			return Some((i, cid));
		}

		let idx = self.cid.size[0];
		if idx as usize >= MAX_SERVERS {
			return None;
		}
		if let Some(r) = requested {
			if r != idx {
				return None;
			}
		}

		// The joiner is only counted into the bitmask once the extension stabilises
		let cid = Cid {
			epoch: self.cid.epoch + 1,
			size: [self.cid.size[0], self.cid.size[0] + 1],
			state: CidState::Extended,
			bitmask: self.cid.bitmask
		};

		self.pending_join = Some(idx);
		Some((idx, cid))
	}

	/// Plans a downsize to the given size; the joint-consensus transition
	pub fn plan_downsize(&self, new_size: u8) -> Option<Cid> {
		if self.cid.state != CidState::Stable || new_size == 0 || new_size >= self.cid.size[0] {
			return None;
		}

		Some(Cid {
			epoch: self.cid.epoch + 1,
			size: [self.cid.size[0], new_size],
			state: CidState::Transit,
			bitmask: self.cid.bitmask
		})
	}

	/// Plans removal of a permanently failed server; stays stable, leaves a hole
	pub fn plan_remove(&self, target: ServerIdx) -> Option<Cid> {
		if self.cid.state != CidState::Stable || !self.cid.is_on(target) || target == self.idx {
			return None;
		}

		let mut cid = self.cid;
		cid.epoch += 1;
		cid.server_rm(target);
		Some(cid)
	}

	/// Applies a committed CONFIG entry. Both leaders and followers run this from the apply
	/// path; only the leader acts on AppendConfig/NotifyJoiner
	pub fn apply_config(&mut self, entry_cid: Cid, entry_key: u64, is_leader: bool) -> Vec<ConfigAction> {
		let mut actions = vec![];

		// A later configuration supersedes this entry (also covers replays and entries
		// from before a join)
		if entry_cid.epoch <= self.cid.epoch && entry_key <= self.cid_key && self.cid_key != 0 {
			return actions;
		}
		if entry_cid.epoch < self.cid.epoch {
			return actions;
		}

		let old = self.cid;
		self.cid = entry_cid;
		self.cid_key = entry_key;

		match entry_cid.state {
			CidState::Extended => {
				// The joiner may now recover; the leader answers it and immediately
				// schedules the stabilising CONFIG (committable under the old majority)
				if is_leader {
					let joiner = self.pending_join.take().unwrap_or(entry_cid.size[1] - 1);
					actions.push(ConfigAction::NotifyJoiner(joiner));

					let mut next = Cid {
						epoch: entry_cid.epoch + 1,
						size: [entry_cid.size[1], 0],
						state: CidState::Stable,
						bitmask: entry_cid.bitmask
					};
					next.server_add(joiner);
					actions.push(ConfigAction::AppendConfig(next));
				}
			},
			CidState::Transit => {
				// Joint decisions from here on; the leader schedules the stabilising
				// CONFIG which drops the surplus members
				if is_leader {
					let mut next = Cid {
						epoch: entry_cid.epoch + 1,
						size: [entry_cid.size[1], 0],
						state: CidState::Stable,
						bitmask: entry_cid.bitmask
					};
					for i in entry_cid.size[1]..entry_cid.size[0] {
						next.server_rm(i);
					}
					actions.push(ConfigAction::AppendConfig(next));
				}
			},
			CidState::Stable => {
				// Hole-filling joins land here directly
				if is_leader && self.pending_join.is_some() {
					if let Some(joiner) = self.pending_join.take() {
						if entry_cid.is_on(joiner) && !old.is_on(joiner) {
							actions.push(ConfigAction::NotifyJoiner(joiner));
						}
					}
				}

				for i in 0..MAX_SERVERS as u8 {
					if old.is_on(i) && !entry_cid.is_on(i) {
						if i == self.idx {
							actions.push(ConfigAction::ShutdownSelf);
						} else {
							actions.push(ConfigAction::Disconnect(i));
						}
					}
				}
			}
		}

		actions
	}
}
