#[macro_use] extern crate serde_derive;
#[macro_use] extern crate error_chain;

extern crate byteorder;
extern crate core;
extern crate crc32c;
extern crate libc;
extern crate rand;
extern crate rmp_serde as rmps;
extern crate serde;
extern crate toml;


pub mod errors {
	error_chain! {
		foreign_links {
			Io(::std::io::Error);
		}
	}
}

pub mod sync;
pub mod protos;
pub mod rpc;
pub mod region;
pub mod log;
pub mod ctrl;
pub mod transport;
pub mod config_state;
mod state;
pub mod consensus;
pub mod replication;
pub mod record_store;
pub mod output;
pub mod state_machine;
pub mod intercept;
pub mod snapshot;
pub mod node_config;
pub mod server;
