extern crate apus;
extern crate clap;
extern crate core;
extern crate ctrlc;

use std::fs::{self, File};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{App, Arg};

use apus::errors::*;
use apus::ctrl::CtrlRegion;
use apus::log::{Log, DEFAULT_LOG_LEN};
use apus::node_config::{ClusterConfig, EnvOptions};
use apus::server::{Server, ServerConfig, ServerType};
use apus::transport::Transport;
use apus::transport::tcp::TcpTransport;
use core::DirLock;


fn main_task() -> Result<()> {
	let matches = App::new("apus")
		.about("Replicated server-agreement node")
		.arg(Arg::with_name("config")
			.long("config")
			.short("c")
			.value_name("CONFIG_PATH")
			.help("Path to the cluster configuration file")
			.takes_value(true))
		.arg(Arg::with_name("idx")
			.long("idx")
			.short("i")
			.value_name("SERVER_IDX")
			.help("This server's index in the configuration")
			.takes_value(true))
		.arg(Arg::with_name("type")
			.long("type")
			.short("t")
			.value_name("TYPE")
			.help("start (founding member) or join (admission into a running cluster)")
			.takes_value(true))
		.arg(Arg::with_name("dir")
			.long("dir")
			.short("d")
			.value_name("DIRECTORY_PATH")
			.help("Data directory for the record store; also receives the log files")
			.takes_value(true))
		.get_matches();

	let env = EnvOptions::from_env();

	// Flags win over the environment surface
	let config_path = matches.value_of("config").map(|s| s.to_owned())
		.or_else(|| env.config().cloned())
		.ok_or_else(|| Error::from("no configuration file given (--config or config_path)"))?;

	let idx = match matches.value_of("idx") {
		Some(v) => v.parse::<u8>().chain_err(|| "bad --idx")?,
		None => env.idx().ok_or_else(|| Error::from("no server index given (--idx or server_idx)"))?
	};

	let server_type = match matches.value_of("type").or(env.server_type.as_ref().map(|s| s.as_str())) {
		Some("join") => ServerType::Join,
		Some("start") | None => ServerType::Start,
		Some(other) => {
			return Err(format!("unknown server type {:?}", other).into());
		}
	};

	// Configuration-load failures are fatal before anything is initialized
	let cluster = ClusterConfig::load(Path::new(&config_path))?;
	let group_size = env.group_size.unwrap_or(cluster.group_size as u8);

	let data_dir = matches.value_of("dir").map(|s| PathBuf::from(s))
		.or_else(|| env.dare_log_file.as_ref().map(PathBuf::from))
		.unwrap_or_else(|| PathBuf::from(format!("./apus-node-{}", idx)));
	let dir_lock = DirLock::open(&data_dir)?;

	open_node_logs(&cluster, idx, dir_lock.path())?;

	// Regions and transport
	let log = Arc::new(Log::new(DEFAULT_LOG_LEN));
	let ctrl = Arc::new(CtrlRegion::new());

	let known = cluster.consensus_config.len();
	let mut peer_addrs: Vec<SocketAddr> = Vec::with_capacity(known);
	let mut msg_addrs: Vec<SocketAddr> = Vec::with_capacity(known);
	for i in 0..known {
		peer_addrs.push(cluster.peer_addr(i)?);
		msg_addrs.push(cluster.msg_addr(i)?);
	}

	let mcast = match env.mgid {
		Some(ref group) => Some(group.parse()
			.chain_err(|| format!("bad multicast group {:?}", group))?),
		None => None
	};

	let transport = TcpTransport::new(idx, peer_addrs.clone(), msg_addrs, mcast,
		log.region(), ctrl.region())?;

	match server_type {
		ServerType::Start => {
			transport.connect_initial(&peer_addrs[..group_size as usize])?;
		},
		ServerType::Join => {
			// A joiner dials every known member; whoever leads will answer the JOIN
			for (i, addr) in peer_addrs.iter().enumerate() {
				if i == idx as usize {
					continue;
				}
				if let Err(e) = transport.connect_peer(*addr) {
					eprintln!("cannot reach server {} yet: {}", i, e);
				}
			}
		}
	}

	let app_addr = cluster.app_addr(idx as usize)
		.unwrap_or_else(|_| "127.0.0.1:1".parse().unwrap());

	let server = Server::new(ServerConfig {
		idx,
		group_size,
		server_type,
		timing: cluster.timing(),
		data_dir: data_dir.clone(),
		app_addr,
		rsm: cluster.mgr_global_config.rsm != 0,
		check_output: cluster.mgr_global_config.check_output != 0,
		checkpoint_sock: Some(data_dir.join("control.sock"))
	}, transport as Arc<Transport>, log, ctrl)?;

	{
		let server = server.clone();
		ctrlc::set_handler(move || {
			server.shutdown();
		}).chain_err(|| "cannot install signal handler")?;
	}

	println!("server {} up ({:?})", idx, server_type);
	let handle = server.start();

	let _ = handle.join();
	// Give the worker threads a moment to observe the flag
	thread::sleep(Duration::from_millis(50));

	Ok(())
}

/// Creates the per-node log files the configuration flags ask for
fn open_node_logs(cluster: &ClusterConfig, idx: u8, dir: &Path) -> Result<()> {
	let peer = match cluster.consensus_config.get(idx as usize) {
		Some(p) => p,
		None => return Ok(())
	};

	fs::create_dir_all(dir)?;

	if peer.sys_log != 0 || peer.stat_log != 0 {
		let mut f = File::create(dir.join(format!("node-{}-sys.log", idx)))?;
		writeln!(f, "server {} starting (db {})", idx, peer.db_name)?;
	}

	if let Some(mgr) = cluster.mgr_config.get(idx as usize) {
		if mgr.req_log != 0 {
			File::create(dir.join(format!("node-{}-req.log", idx)))?;
		}
	}

	Ok(())
}

fn main() {
	if let Err(e) = main_task() {
		eprintln!("{}", e);
		for cause in e.iter().skip(1) {
			eprintln!("  caused by: {}", cause);
		}
		exit(1);
	}
}
