use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use errors::*;
use consensus::Timing;


// Option names are kept exactly as the operators know them; the file format is TOML.

#[derive(Deserialize, Clone, Debug)]
pub struct ConsensusPeer {
	pub ip_address: String,
	pub port: u16,
	#[serde(default)]
	pub sys_log: i64,
	#[serde(default)]
	pub stat_log: i64,
	pub db_name: String
}

/// Legacy slot; only the port is ever read
#[derive(Deserialize, Clone, Debug)]
pub struct ZookeeperPeer {
	pub port: u16
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct MgrGlobalConfig {
	#[serde(default)]
	pub rsm: i64,
	#[serde(default)]
	pub check_output: i64
}

#[derive(Deserialize, Clone, Debug)]
pub struct MgrPeer {
	#[serde(default)]
	pub time_stamp_log: i64,
	#[serde(default)]
	pub sys_log: i64,
	#[serde(default)]
	pub stat_log: i64,
	#[serde(default)]
	pub req_log: i64,
	pub ip_address: String,
	pub port: u16,
	pub db_name: String
}

#[derive(Deserialize, Clone, Debug)]
pub struct DareGlobalConfig {
	#[serde(default = "default_hb_period")]
	pub hb_period: f64,
	#[serde(default = "default_elec_low")]
	pub elec_timeout_low: u64,
	#[serde(default = "default_elec_high")]
	pub elec_timeout_high: u64,
	#[serde(default = "default_rc_info_period")]
	pub rc_info_period: f64,
	#[serde(default = "default_retransmit_period")]
	pub retransmit_period: f64,
	#[serde(default = "default_log_pruning_period")]
	pub log_pruning_period: f64
}

fn default_hb_period() -> f64 { 0.001 }
fn default_elec_low() -> u64 { 10_000 }
fn default_elec_high() -> u64 { 30_000 }
fn default_rc_info_period() -> f64 { 0.1 }
fn default_retransmit_period() -> f64 { 0.002 }
fn default_log_pruning_period() -> f64 { 0.1 }

impl Default for DareGlobalConfig {
	fn default() -> DareGlobalConfig {
		DareGlobalConfig {
			hb_period: default_hb_period(),
			elec_timeout_low: default_elec_low(),
			elec_timeout_high: default_elec_high(),
			rc_info_period: default_rc_info_period(),
			retransmit_period: default_retransmit_period(),
			log_pruning_period: default_log_pruning_period()
		}
	}
}

#[derive(Deserialize, Clone, Debug)]
pub struct ClusterConfig {
	pub group_size: u32,
	pub consensus_config: Vec<ConsensusPeer>,
	#[serde(default)]
	pub zookeeper_config: Vec<ZookeeperPeer>,
	#[serde(default)]
	pub mgr_global_config: MgrGlobalConfig,
	#[serde(default)]
	pub mgr_config: Vec<MgrPeer>,
	#[serde(default)]
	pub dare_global_config: DareGlobalConfig
}

/// Offset between a peer's consensus port and its message side-channel port
const MSG_PORT_OFFSET: u16 = 1000;

impl ClusterConfig {
	/// Configuration-load failure is fatal at startup; callers exit on Err
	pub fn load(path: &Path) -> Result<ClusterConfig> {
		let text = fs::read_to_string(path)
			.chain_err(|| format!("cannot read config file {:?}", path))?;
		let config: ClusterConfig = ::toml::from_str(&text)
			.chain_err(|| format!("cannot parse config file {:?}", path))?;

		if config.group_size == 0 {
			bail!("group_size must be positive");
		}
		if config.consensus_config.len() < config.group_size as usize {
			bail!("consensus_config must describe every member");
		}

		Ok(config)
	}

	pub fn timing(&self) -> Timing {
		let g = &self.dare_global_config;
		Timing {
			hb_period: secs(g.hb_period),
			elec_low_us: g.elec_timeout_low,
			elec_high_us: g.elec_timeout_high,
			rc_info_period: secs(g.rc_info_period),
			retransmit_period: secs(g.retransmit_period),
			prune_period: secs(g.log_pruning_period)
		}
	}

	pub fn peer_addr(&self, idx: usize) -> Result<SocketAddr> {
		let peer = self.consensus_config.get(idx)
			.ok_or_else(|| Error::from(format!("no consensus_config entry for {}", idx)))?;
		format!("{}:{}", peer.ip_address, peer.port).parse()
			.chain_err(|| format!("bad address for server {}", idx))
	}

	pub fn msg_addr(&self, idx: usize) -> Result<SocketAddr> {
		let peer = self.consensus_config.get(idx)
			.ok_or_else(|| Error::from(format!("no consensus_config entry for {}", idx)))?;
		format!("{}:{}", peer.ip_address, peer.port + MSG_PORT_OFFSET).parse()
			.chain_err(|| format!("bad address for server {}", idx))
	}

	/// The local application address the replay side connects to
	pub fn app_addr(&self, idx: usize) -> Result<SocketAddr> {
		let peer = self.mgr_config.get(idx)
			.ok_or_else(|| Error::from(format!("no mgr_config entry for {}", idx)))?;
		format!("{}:{}", peer.ip_address, peer.port).parse()
			.chain_err(|| format!("bad mgr address for server {}", idx))
	}
}

fn secs(v: f64) -> Duration {
	Duration::from_micros((v * 1e6) as u64)
}


/// The environment-variable surface; flags take precedence over these
#[derive(Clone, Debug, Default)]
pub struct EnvOptions {
	pub server_idx: Option<u8>,
	pub group_size: Option<u8>,
	pub server_type: Option<String>,
	pub config_path: Option<String>,
	pub dare_log_file: Option<String>,
	pub mgid: Option<String>,
	pub node_id: Option<u8>,
	pub cfg_path: Option<String>
}

impl EnvOptions {
	pub fn from_env() -> EnvOptions {
		EnvOptions {
			server_idx: env::var("server_idx").ok().and_then(|v| v.parse().ok()),
			group_size: env::var("group_size").ok().and_then(|v| v.parse().ok()),
			server_type: env::var("server_type").ok(),
			config_path: env::var("config_path").ok(),
			dare_log_file: env::var("dare_log_file").ok(),
			mgid: env::var("mgid").ok(),
			node_id: env::var("node_id").ok().and_then(|v| v.parse().ok()),
			cfg_path: env::var("cfg_path").ok()
		}
	}

	pub fn idx(&self) -> Option<u8> {
		self.server_idx.or(self.node_id)
	}

	pub fn config(&self) -> Option<&String> {
		self.config_path.as_ref().or(self.cfg_path.as_ref())
	}
}


#[cfg(test)]
mod tests {
	use super::*;

	const SAMPLE: &str = r#"
group_size = 3

[[consensus_config]]
ip_address = "10.0.0.1"
port = 7000
sys_log = 1
db_name = "node0"

[[consensus_config]]
ip_address = "10.0.0.2"
port = 7000
db_name = "node1"

[[consensus_config]]
ip_address = "10.0.0.3"
port = 7000
db_name = "node2"

[[zookeeper_config]]
port = 2181

[mgr_global_config]
rsm = 1
check_output = 1

[[mgr_config]]
ip_address = "127.0.0.1"
port = 9000
db_name = "mgr0"
req_log = 1

[dare_global_config]
hb_period = 0.002
elec_timeout_low = 12000
"#;

	#[test]
	fn parses_and_defaults() {
		let config: ClusterConfig = ::toml::from_str(SAMPLE).unwrap();

		assert_eq!(config.group_size, 3);
		assert_eq!(config.consensus_config.len(), 3);
		assert_eq!(config.consensus_config[0].sys_log, 1);
		assert_eq!(config.consensus_config[1].sys_log, 0);
		assert_eq!(config.zookeeper_config[0].port, 2181);
		assert_eq!(config.mgr_global_config.check_output, 1);
		assert_eq!(config.mgr_config[0].req_log, 1);

		let timing = config.timing();
		assert_eq!(timing.hb_period, Duration::from_millis(2));
		assert_eq!(timing.elec_low_us, 12_000);
		// Unset fields fall back to the design values
		assert_eq!(timing.elec_high_us, 30_000);

		assert_eq!(config.peer_addr(1).unwrap(),
			"10.0.0.2:7000".parse::<SocketAddr>().unwrap());
		assert_eq!(config.msg_addr(1).unwrap(),
			"10.0.0.2:8000".parse::<SocketAddr>().unwrap());
		assert_eq!(config.app_addr(0).unwrap(),
			"127.0.0.1:9000".parse::<SocketAddr>().unwrap());
	}

	#[test]
	fn rejects_short_member_list() {
		let text = "group_size = 5\n[[consensus_config]]\nip_address = \"a\"\nport = 1\ndb_name = \"x\"\n";
		let config: ClusterConfig = ::toml::from_str(text).unwrap();
		// load() would reject this; the validation lives there
		assert!(config.consensus_config.len() < config.group_size as usize);
	}
}
