use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};

use errors::*;
use log::{self, Log};
use protos::ServerIdx;
use region::Region;
use replication::Engine;
use rpc::SmReply;
use state_machine::StateMachine;
use transport::{RemoteMem, Transport};


/// Snapshots at or below this size reuse one pre-registered buffer instead of allocating
/// and registering a fresh region per request
pub const PREREG_SNAPSHOT_SIZE: usize = 64 * 1024;


/// Serves state-machine snapshots to recovering peers over one-sided reads
pub struct SnapshotService {
	transport: Arc<Transport>,
	prereg: Mutex<Option<(Arc<Region>, RemoteMem)>>
}

impl SnapshotService {
	pub fn new(transport: Arc<Transport>) -> SnapshotService {
		SnapshotService {
			transport,
			prereg: Mutex::new(None)
		}
	}

	/// Builds a snapshot of the local SM, places it in a registered region and returns
	/// the description the requester needs to pull it
	pub fn handle_request(&self, sink: &StateMachine, log: &Log, engine: &Engine,
		sid_raw: u64, cid: ::protos::Cid, cid_key: u64) -> SmReply
	{
		let data = sink.snapshot();

		let mr = if data.len() <= PREREG_SNAPSHOT_SIZE {
			let mut prereg = self.prereg.lock().unwrap();
			if prereg.is_none() {
				let region = Arc::new(Region::new(PREREG_SNAPSHOT_SIZE));
				let mr = self.transport.register(region.clone());
				*prereg = Some((region, mr));
			}

			let (ref region, mr) = *prereg.as_ref().unwrap();
			region.write(0, &data);
			mr
		} else {
			let region = Arc::new(Region::new(data.len()));
			region.write(0, &data);
			self.transport.register(region)
		};

		SmReply {
			mr,
			len: data.len() as u32,
			sid: sid_raw,
			last_key: engine.applied().to_key(),
			last_offset: log.apply(),
			head: log.head(),
			commit: log.commit(),
			end: log.end(),
			cid,
			cid_key
		}
	}
}


/// First recovery step: a one-sided read of the peer's log header gives the bootstrap
/// watermark (commit and end offsets) before anything else is transferred
pub fn bootstrap_watermark(transport: &Transport, peer: ServerIdx) -> Result<(u64, u64)> {
	let rc = match transport.peer_rc_info(peer) {
		Some(rc) => rc,
		None => bail!("no rc info for peer {}", peer)
	};

	let mut hdr = [0u8; 48];
	transport.read(peer, &mut hdr, rc.log_mr)?;

	let commit = LittleEndian::read_u64(&hdr[log::OFF_COMMIT..log::OFF_COMMIT + 8]);
	let end = LittleEndian::read_u64(&hdr[log::OFF_END..log::OFF_END + 8]);
	Ok((commit, end))
}

/// Installs a snapshot reply: pulls the SM blob, restores it, then pulls the live log
/// tail [head, end) and adopts the peer's offsets. Afterwards the server can run as a
/// normal follower
pub fn install(reply: &SmReply, transport: &Transport, peer: ServerIdx, local_log: &Log,
	sink: &StateMachine, engine: &Engine) -> Result<()>
{
	let rc = match transport.peer_rc_info(peer) {
		Some(rc) => rc,
		None => bail!("no rc info for peer {}", peer)
	};

	// The opaque SM state
	let mut blob = vec![0u8; reply.len as usize];
	transport.read(peer, &mut blob, reply.mr)?;
	sink.restore(&blob);
	engine.install_watermarks(reply.last_key, reply.last_key);

	// The retained log range, as two reads when it wraps
	let len = local_log.len();
	if reply.end != len {
		let region = local_log.region();

		if reply.head <= reply.end {
			let span = (reply.end - reply.head) as usize;
			if span > 0 {
				let mut buf = vec![0u8; span];
				transport.read(peer, &mut buf,
					rc.log_mr.at(log::ENTRIES_OFF as u64 + reply.head))?;
				region.write(log::ENTRIES_OFF + reply.head as usize, &buf);
			}
		} else {
			let mut first = vec![0u8; (len - reply.head) as usize];
			transport.read(peer, &mut first,
				rc.log_mr.at(log::ENTRIES_OFF as u64 + reply.head))?;
			region.write(log::ENTRIES_OFF + reply.head as usize, &first);

			let mut second = vec![0u8; reply.end as usize];
			transport.read(peer, &mut second, rc.log_mr.at(log::ENTRIES_OFF as u64))?;
			region.write(log::ENTRIES_OFF, &second);
		}
	}

	local_log.set_head(reply.head);
	local_log.set_apply(reply.last_offset);
	local_log.set_commit(reply.commit);
	local_log.set_end(reply.end);
	// The tail is unknown until the next leadership interaction
	local_log.set_tail(len);

	Ok(())
}


#[cfg(test)]
mod tests {
	use super::*;
	use config_state::ConfigState;
	use consensus::{ConsensusModule, Timing};
	use ctrl::CtrlRegion;
	use log::EntryHeader;
	use protos::*;
	use record_store::RecordStore;
	use state_machine::{MemoryStateMachine, Record};
	use transport::mem::{MemHub, MemTransport};
	use std::env;
	use std::sync::atomic::AtomicBool;

	fn node(hub: &Arc<MemHub>, idx: u8, tag: &str)
		-> (Arc<Log>, Arc<Engine>, Arc<MemoryStateMachine>, Arc<Transport>)
	{
		let log = Arc::new(Log::new(64 * 1024));
		let ctrl = Arc::new(CtrlRegion::new());
		let transport = Arc::new(MemTransport::new(hub, idx, log.region(), ctrl.region()))
			as Arc<Transport>;

		let dir = env::temp_dir().join(
			format!("apus-snap-{}-{}-{}", tag, ::std::process::id(), idx));
		let _ = ::std::fs::remove_dir_all(&dir);
		let store = Arc::new(RecordStore::open(dir, false).unwrap());

		let sink = Arc::new(MemoryStateMachine::new());
		let consensus = Arc::new(Mutex::new(ConsensusModule::new(
			idx, ConfigState::new(idx, 2), log.clone(), ctrl.clone(),
			transport.clone(), Timing::default())));

		let engine = Arc::new(Engine::new(idx, log.clone(), ctrl, transport.clone(),
			consensus, store, sink.clone(), Cid::bootstrap(2),
			Arc::new(AtomicBool::new(false))));

		(log, engine, sink, transport)
	}

	#[test]
	fn snapshot_install_reproduces_peer_state() {
		let hub = MemHub::new();
		let (log0, engine0, sink0, t0) = node(&hub, 0, "serve");
		let (log1, engine1, sink1, t1) = node(&hub, 1, "join");

		t1.set_peer_rc_info(0, t0.local_rc_info());

		// Peer 0 has applied three records and retains two log entries
		for i in 1..4u32 {
			sink0.apply(ViewStamp::new(1, i).to_key(), &Record {
				entry_type: EntryType::Send,
				clt_id: ViewStamp::new(1, 1),
				data: vec![i as u8]
			});
		}

		for i in 4..6u32 {
			let (off, _) = log0.reserve(3);
			log0.write_entry(off, &EntryHeader {
				msg_vs: ViewStamp::new(1, i),
				req_canbe_exed: ViewStamp::new(1, 3),
				node_id: 0,
				data_size: 4,
				entry_type: EntryType::Send,
				clt_id: ViewStamp::new(1, 1)
			}, b"abc");
		}
		let end = log0.end();
		log0.set_commit(end);
		log0.set_apply(end);
		engine0.install_watermarks(ViewStamp::new(1, 3).to_key(), ViewStamp::new(1, 5).to_key());

		// The joiner reads the watermark, asks for the snapshot and installs it
		let (commit, remote_end) = bootstrap_watermark(&*t1, 0).unwrap();
		assert_eq!(commit, end);
		assert_eq!(remote_end, end);

		let service = SnapshotService::new(t0.clone());
		let reply = service.handle_request(&*sink0, &log0, &engine0,
			Sid::new(1, true, 0).0, Cid::bootstrap(2), 0);
		assert_eq!(reply.last_key, ViewStamp::new(1, 3).to_key());
		assert_eq!(reply.cid, Cid::bootstrap(2));

		install(&reply, &*t1, 0, &log1, &*sink1, &engine1).unwrap();

		assert_eq!(sink1.applied(), sink0.applied());
		assert_eq!(log1.end(), log0.end());
		assert_eq!(log1.commit(), log0.commit());

		// The transferred log range decodes identically
		let hdr = log1.read_header(0).unwrap();
		assert_eq!(hdr.msg_vs, ViewStamp::new(1, 4));
		assert_eq!(log1.read_payload(0, hdr.data_size), b"abc");
	}
}
