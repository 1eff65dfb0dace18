extern crate apus;

use std::env;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use apus::ctrl::CtrlRegion;
use apus::log::Log;
use apus::protos::{Cid, CidState, ServerIdx};
use apus::rpc::{marshal, DownsizeRequest, Message, MessageBody};
use apus::server::{Server, ServerConfig, ServerType};
use apus::transport::Transport;
use apus::transport::mem::{MemHub, MemTransport};


struct Harness {
	hub: Arc<MemHub>,
	servers: Vec<Arc<Server>>,
	transports: Vec<Arc<MemTransport>>
}

fn make_server(hub: &Arc<MemHub>, idx: ServerIdx, group_size: u8,
	server_type: ServerType, tag: &str) -> (Arc<Server>, Arc<MemTransport>)
{
	let log = Arc::new(Log::new(256 * 1024));
	let ctrl = Arc::new(CtrlRegion::new());
	let transport = Arc::new(MemTransport::new(hub, idx, log.region(), ctrl.region()));

	let dir = env::temp_dir().join(
		format!("apus-cluster-{}-{}-{}", tag, ::std::process::id(), idx));
	let _ = ::std::fs::remove_dir_all(&dir);

	let server = Server::new(ServerConfig {
		idx,
		group_size,
		server_type,
		timing: Default::default(),
		data_dir: dir,
		app_addr: "127.0.0.1:1".parse().unwrap(),
		rsm: true,
		check_output: false,
		checkpoint_sock: None
	}, transport.clone() as Arc<Transport>, log, ctrl).unwrap();

	(server, transport)
}

fn start_cluster(n: u8, tag: &str) -> Harness {
	let hub = MemHub::new();

	let mut servers = vec![];
	let mut transports = vec![];
	for i in 0..n {
		let (server, transport) = make_server(&hub, i, n, ServerType::Start, tag);
		servers.push(server);
		transports.push(transport);
	}

	// Every founding member knows every other member's registrations
	for i in 0..n as usize {
		for j in 0..n as usize {
			if i != j {
				let rc = transports[j].local_rc_info();
				transports[i].set_peer_rc_info(j as u8, rc);
			}
		}
	}

	for server in servers.iter() {
		server.start();
	}

	Harness { hub, servers, transports }
}

fn wait_for<F: Fn() -> bool>(cond: F, what: &str, secs: u64) {
	let deadline = Instant::now() + Duration::from_secs(secs);
	while !cond() {
		if Instant::now() > deadline {
			panic!("timed out waiting for {}", what);
		}
		thread::sleep(Duration::from_millis(5));
	}
}

fn leader_of(harness: &Harness) -> usize {
	harness.servers.iter().position(|s| s.is_leader()).unwrap()
}


#[test]
fn healthy_cluster_replays_client_events_in_order() {
	let harness = start_cluster(3, "healthy");

	wait_for(|| harness.servers.iter().filter(|s| s.is_leader()).count() == 1,
		"a single leader", 10);
	let leader = leader_of(&harness);

	// One client: connect, send "hello", close
	let ev = harness.servers[leader].ev_mgr();
	ev.on_accept(71);
	ev.on_read(71, b"hello");
	ev.on_close(71);

	for (i, server) in harness.servers.iter().enumerate() {
		if i == leader {
			continue;
		}
		let ev = server.ev_mgr();
		wait_for(|| ev.applied_count() >= 3, "follower replay of three events", 10);
	}

	for server in harness.servers.iter() {
		server.shutdown();
	}
}

#[test]
fn join_extends_the_cluster_and_recovers() {
	let harness = start_cluster(3, "join");

	wait_for(|| harness.servers.iter().filter(|s| s.is_leader()).count() == 1,
		"a single leader", 10);
	let leader = leader_of(&harness);

	// Some history before the join
	let ev = harness.servers[leader].ev_mgr();
	ev.on_accept(71);
	ev.on_read(71, b"pre-join");

	// Server 3 arrives; it knows the members' registrations (its config file), the
	// members learn its registration through the RC-info exchange
	let (joiner, joiner_transport) = make_server(&harness.hub, 3, 3, ServerType::Join, "join");
	for i in 0..3usize {
		let rc = harness.transports[i].local_rc_info();
		joiner_transport.set_peer_rc_info(i as u8, rc);
	}
	joiner.start();

	// The committed configuration sequence ends in a stable four-server group
	let expect_stable = Cid {
		epoch: 2,
		size: [4, 0],
		state: CidState::Stable,
		bitmask: 0b1111
	};
	wait_for(|| joiner.engine().cid() == expect_stable, "joiner reaching the stable CID", 20);
	wait_for(|| harness.servers[leader].engine().cid() == expect_stable,
		"leader reaching the stable CID", 20);

	// The joiner now participates: new client activity reaches its replay sink
	let before = joiner.ev_mgr().applied_count();
	ev.on_read(71, b"post-join");
	ev.on_close(71);
	wait_for(|| joiner.ev_mgr().applied_count() > before, "joiner replaying new entries", 20);

	for server in harness.servers.iter() {
		server.shutdown();
	}
	joiner.shutdown();
}

#[test]
fn downsize_removes_surplus_servers() {
	let harness = start_cluster(5, "downsize");

	wait_for(|| harness.servers.iter().filter(|s| s.is_leader()).count() == 1,
		"a single leader", 10);
	let leader = leader_of(&harness);

	// Operator asks the leader to shrink the group to three
	let msg = marshal(&Message {
		from: 0,
		body: MessageBody::Downsize(DownsizeRequest { new_size: 3 })
	}).unwrap();
	harness.transports[0].send_msg(leader as ServerIdx, &msg).unwrap();

	// Servers 3 and 4 shut down once their removal commits
	wait_for(|| harness.servers[3].is_shut_down() && harness.servers[4].is_shut_down(),
		"removed servers shutting down", 20);

	// The survivors converge on the stable three-server configuration
	let expect_stable = Cid {
		epoch: 2,
		size: [3, 0],
		state: CidState::Stable,
		bitmask: 0b00111
	};
	wait_for(|| (0..3).all(|i| {
		harness.servers[i].is_shut_down()
			|| harness.servers[i].engine().cid() == expect_stable
	}), "survivors adopting the stable CID", 20);

	// And they can still commit: a fresh leader among the survivors replicates
	wait_for(|| (0..3).any(|i| harness.servers[i].is_leader()
		&& !harness.servers[i].is_shut_down()),
		"a surviving leader", 20);
	let survivor = (0..3).find(|i| harness.servers[*i].is_leader()).unwrap();

	let ev = harness.servers[survivor].ev_mgr();
	ev.on_accept(80);
	ev.on_read(80, b"after downsize");

	for i in 0..3 {
		if i == survivor || harness.servers[i].is_shut_down() {
			continue;
		}
		let ev = harness.servers[i].ev_mgr();
		wait_for(|| ev.applied_count() >= 2, "survivor replay", 20);
	}

	for server in harness.servers.iter() {
		server.shutdown();
	}
}
