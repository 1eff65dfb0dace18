use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use byteorder::{ByteOrder, LittleEndian};
use core::DirLock;
use crc32c::crc32c;

use errors::*;


// On-disk frame: key, value length, crc32c of the value, value bytes
const FRAME_HEADER_SIZE: usize = 16;

/// Durable append-only record store
///
/// Every committed entry's payload is persisted here keyed by its 8-byte view-stamp key,
/// both for crash recovery and so the replay side can fetch records without touching the
/// circular log. Appends are synced before returning on the leader path
pub struct RecordStore {
	_lock: DirLock,

	inner: Mutex<StoreInner>,

	/// Sync every append (leader); followers ack before durability per the design
	sync_writes: bool
}

struct StoreInner {
	file: File,
	index: BTreeMap<u64, (u64, u32)>,
	write_offset: u64
}

impl RecordStore {
	pub fn open(path: PathBuf, sync_writes: bool) -> Result<RecordStore> {
		let lock = DirLock::open(&path)?;

		let file_path = path.join("records.log");
		let mut file = OpenOptions::new()
			.read(true).append(true).create(true)
			.open(&file_path)?;

		let (index, write_offset) = Self::build_index(&mut file)?;

		Ok(RecordStore {
			_lock: lock,
			inner: Mutex::new(StoreInner {
				file,
				index,
				write_offset
			}),
			sync_writes
		})
	}

	/// Scans the whole file, recovering the index; a torn tail frame (crash mid-append)
	/// is truncated away
	fn build_index(file: &mut File) -> Result<(BTreeMap<u64, (u64, u32)>, u64)> {
		let len = file.seek(SeekFrom::End(0))?;
		file.seek(SeekFrom::Start(0))?;

		let mut index = BTreeMap::new();
		let mut off = 0u64;

		while off + FRAME_HEADER_SIZE as u64 <= len {
			let mut hdr = [0u8; FRAME_HEADER_SIZE];
			file.read_exact(&mut hdr)?;

			let key = LittleEndian::read_u64(&hdr[0..8]);
			let vlen = LittleEndian::read_u32(&hdr[8..12]);
			let crc = LittleEndian::read_u32(&hdr[12..16]);

			if off + FRAME_HEADER_SIZE as u64 + vlen as u64 > len {
				break;
			}

			let mut value = vec![0u8; vlen as usize];
			file.read_exact(&mut value)?;

			if crc32c(&value) != crc {
				break;
			}

			index.insert(key, (off + FRAME_HEADER_SIZE as u64, vlen));
			off += FRAME_HEADER_SIZE as u64 + vlen as u64;
		}

		file.set_len(off)?;
		file.seek(SeekFrom::End(0))?;

		Ok((index, off))
	}

	pub fn store_record(&self, key: u64, value: &[u8]) -> Result<()> {
		let mut inner = self.inner.lock().unwrap();

		let mut hdr = [0u8; FRAME_HEADER_SIZE];
		LittleEndian::write_u64(&mut hdr[0..8], key);
		LittleEndian::write_u32(&mut hdr[8..12], value.len() as u32);
		LittleEndian::write_u32(&mut hdr[12..16], crc32c(value));

		inner.file.write_all(&hdr)?;
		inner.file.write_all(value)?;
		if self.sync_writes {
			inner.file.sync_data()?;
		}

		let off = inner.write_offset + FRAME_HEADER_SIZE as u64;
		inner.index.insert(key, (off, value.len() as u32));
		inner.write_offset = off + value.len() as u64;

		Ok(())
	}

	pub fn retrieve_record(&self, key: u64) -> Option<Vec<u8>> {
		let mut inner = self.inner.lock().unwrap();

		let (off, len) = match inner.index.get(&key) {
			Some(v) => *v,
			None => return None
		};

		let mut value = vec![0u8; len as usize];
		let res: io::Result<()> = (|| {
			inner.file.seek(SeekFrom::Start(off))?;
			inner.file.read_exact(&mut value)?;
			inner.file.seek(SeekFrom::End(0))?;
			Ok(())
		})();

		match res {
			Ok(()) => Some(value),
			Err(_) => None
		}
	}

	pub fn contains(&self, key: u64) -> bool {
		self.inner.lock().unwrap().index.contains_key(&key)
	}

	pub fn last_key(&self) -> Option<u64> {
		self.inner.lock().unwrap().index.keys().next_back().cloned()
	}

	/// Serializes every record in key order (snapshot transfer)
	pub fn dump_records<W: Write>(&self, out: &mut W) -> Result<()> {
		let mut inner = self.inner.lock().unwrap();

		let entries: Vec<(u64, (u64, u32))> =
			inner.index.iter().map(|(k, v)| (*k, *v)).collect();

		for (key, (off, len)) in entries {
			let mut value = vec![0u8; len as usize];
			inner.file.seek(SeekFrom::Start(off))?;
			inner.file.read_exact(&mut value)?;

			let mut hdr = [0u8; FRAME_HEADER_SIZE];
			LittleEndian::write_u64(&mut hdr[0..8], key);
			LittleEndian::write_u32(&mut hdr[8..12], len);
			LittleEndian::write_u32(&mut hdr[12..16], crc32c(&value));
			out.write_all(&hdr)?;
			out.write_all(&value)?;
		}

		inner.file.seek(SeekFrom::End(0))?;
		Ok(())
	}

	/// Loads a dump produced by dump_records, replacing nothing (append semantics:
	/// records already present keep their existing value, matching at-most-once keys)
	pub fn load_records<R: Read>(&self, input: &mut R) -> Result<()> {
		let mut data = vec![];
		input.read_to_end(&mut data)?;

		let mut off = 0usize;
		while off + FRAME_HEADER_SIZE <= data.len() {
			let key = LittleEndian::read_u64(&data[off..off + 8]);
			let vlen = LittleEndian::read_u32(&data[off + 8..off + 12]) as usize;
			let crc = LittleEndian::read_u32(&data[off + 12..off + 16]);
			off += FRAME_HEADER_SIZE;

			if off + vlen > data.len() {
				bail!("truncated record dump");
			}

			let value = &data[off..off + vlen];
			if crc32c(value) != crc {
				bail!("corrupt record dump");
			}
			off += vlen;

			if !self.contains(key) {
				self.store_record(key, value)?;
			}
		}

		Ok(())
	}
}


#[cfg(test)]
mod tests {
	use super::*;
	use std::env;

	fn tmp(name: &str) -> PathBuf {
		let dir = env::temp_dir().join(format!("apus-store-{}-{}", name, ::std::process::id()));
		let _ = ::std::fs::remove_dir_all(&dir);
		dir
	}

	#[test]
	fn store_then_retrieve() {
		let store = RecordStore::open(tmp("basic"), true).unwrap();

		store.store_record(7, b"seven").unwrap();
		store.store_record(9, b"nine").unwrap();

		assert_eq!(store.retrieve_record(7).unwrap(), b"seven");
		assert_eq!(store.retrieve_record(9).unwrap(), b"nine");
		assert_eq!(store.retrieve_record(8), None);
		assert_eq!(store.last_key(), Some(9));
	}

	#[test]
	fn index_rebuilds_on_reopen() {
		let dir = tmp("reopen");
		{
			let store = RecordStore::open(dir.clone(), true).unwrap();
			store.store_record(1, b"a").unwrap();
			store.store_record(2, b"bb").unwrap();
		}

		let store = RecordStore::open(dir, true).unwrap();
		assert_eq!(store.retrieve_record(1).unwrap(), b"a");
		assert_eq!(store.retrieve_record(2).unwrap(), b"bb");
	}

	#[test]
	fn torn_tail_is_truncated() {
		let dir = tmp("torn");
		{
			let store = RecordStore::open(dir.clone(), true).unwrap();
			store.store_record(1, b"good").unwrap();
		}

		// Simulate a crash mid-append
		{
			let mut file = OpenOptions::new().append(true)
				.open(dir.join("records.log")).unwrap();
			file.write_all(&[0xde, 0xad, 0xbe]).unwrap();
		}

		let store = RecordStore::open(dir, true).unwrap();
		assert_eq!(store.retrieve_record(1).unwrap(), b"good");
		assert_eq!(store.last_key(), Some(1));
	}

	#[test]
	fn dump_load_dump_is_identity() {
		let a = RecordStore::open(tmp("dump-a"), true).unwrap();
		a.store_record(5, b"five").unwrap();
		a.store_record(6, b"six").unwrap();

		let mut dump1 = vec![];
		a.dump_records(&mut dump1).unwrap();

		let b = RecordStore::open(tmp("dump-b"), true).unwrap();
		b.load_records(&mut &dump1[..]).unwrap();

		let mut dump2 = vec![];
		b.dump_records(&mut dump2).unwrap();

		assert_eq!(dump1, dump2);
	}
}
