use serde::Serialize;
use serde::de::DeserializeOwned;

use errors::*;
use protos::{Cid, ServerIdx};
use transport::{RcInfo, RemoteMem};


pub fn marshal<T: Serialize>(obj: &T) -> Result<Vec<u8>> {
	::rmps::encode::to_vec(obj).chain_err(|| "failed to serialize message")
}

pub fn unmarshal<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
	::rmps::decode::from_slice(data).chain_err(|| "failed to parse message")
}


/// A request to be admitted into the cluster, retransmitted until a CfgReply arrives
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct JoinRequest {
	/// Transport address the cluster should connect back to (unused by in-process hubs)
	pub peer_addr: Option<String>
}

/// Leader's answer once the admitting CONFIG entry has committed
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CfgReply {
	pub idx: ServerIdx,
	pub cid: Cid,
	/// Record key of the admitting CONFIG entry; the joiner ignores earlier CONFIGs
	pub cid_key: u64,
	pub head: u64
}

/// Region registration exchange; the answer mirrors it back
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RcSyn {
	pub rc: RcInfo
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RcAck {
	pub rc: RcInfo
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DownsizeRequest {
	pub new_size: u8
}

/// Ask a peer for a snapshot of the external state machine
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SmRequest;

/// Points the recovering server at a registered snapshot buffer it can read one-sided
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SmReply {
	pub mr: RemoteMem,
	pub len: u32,
	pub sid: u64,
	/// Key and offset of the last entry folded into the snapshot
	pub last_key: u64,
	pub last_offset: u64,
	pub head: u64,
	pub commit: u64,
	pub end: u64,
	/// Configuration as of the snapshot, so the joiner need not replay CONFIG entries
	/// that are already folded in
	pub cid: Cid,
	pub cid_key: u64
}


#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum MessageBody {
	Join(JoinRequest),
	CfgReply(CfgReply),
	RcSyn(RcSyn),
	RcAck(RcAck),
	Downsize(DownsizeRequest),
	SmRequest(SmRequest),
	SmReply(SmReply)
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Message {
	pub from: ServerIdx,
	pub body: MessageBody
}
