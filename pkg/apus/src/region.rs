use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};


/// A registered memory region: a fixed block of bytes that remote peers write into through
/// the transport without involving the local CPU
///
/// Concurrency discipline (the same one the hardware enforces for one-sided writes):
/// - any byte range has at most one writer at a time (the appender for its reserved range,
///   a single remote peer for its ack slot, the owner for everything else);
/// - readers that need a happens-before edge go through the atomic accessors: the publishing
///   byte/word of every record is stored with Release and polled with Acquire;
/// - bulk payload bytes are copied with plain stores and become visible to a reader once it
///   has observed the publishing byte of the enclosing record.
pub struct Region {
	words: UnsafeCell<Box<[u64]>>,
	len: usize
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
	/// Allocates a zeroed region of at least len bytes (rounded up to a whole word so every
	/// 8-aligned offset can be read as an AtomicU64)
	pub fn new(len: usize) -> Region {
		let nwords = (len + 7) / 8;
		let words = vec![0u64; nwords].into_boxed_slice();

		Region {
			words: UnsafeCell::new(words),
			len: nwords * 8
		}
	}

	pub fn len(&self) -> usize {
		self.len
	}

	fn base(&self) -> *mut u8 {
		unsafe { (*self.words.get()).as_mut_ptr() as *mut u8 }
	}

	/// Views the 8 bytes at the given 8-aligned offset as an atomic word
	pub fn atomic_u64(&self, off: usize) -> &AtomicU64 {
		assert!(off % 8 == 0 && off + 8 <= self.len);
		unsafe { &*(self.base().add(off) as *const AtomicU64) }
	}

	pub fn atomic_u8(&self, off: usize) -> &AtomicU8 {
		assert!(off < self.len);
		unsafe { &*(self.base().add(off) as *const AtomicU8) }
	}

	pub fn read(&self, off: usize, out: &mut [u8]) {
		assert!(off + out.len() <= self.len);
		unsafe {
			ptr::copy_nonoverlapping(self.base().add(off), out.as_mut_ptr(), out.len());
		}
	}

	/// Plain copy into the region; only valid while the caller is the unique writer of the
	/// target range
	pub fn write(&self, off: usize, data: &[u8]) {
		assert!(off + data.len() <= self.len);
		unsafe {
			ptr::copy_nonoverlapping(data.as_ptr(), self.base().add(off), data.len());
		}
	}

	/// The delivery primitive backing every one-sided write: all bytes except the last are
	/// copied first, then the final byte is published with a Release store. A reader that
	/// observes the final byte (Acquire) therefore observes the complete write
	pub fn write_final_byte_last(&self, off: usize, data: &[u8]) {
		if data.is_empty() {
			return;
		}

		assert!(off + data.len() <= self.len);

		let body = data.len() - 1;
		unsafe {
			ptr::copy_nonoverlapping(data.as_ptr(), self.base().add(off), body);
		}
		self.atomic_u8(off + body).store(data[body], Ordering::Release);
	}
}


#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use std::thread;

	#[test]
	fn rounds_up_to_words() {
		let r = Region::new(13);
		assert_eq!(r.len(), 16);
	}

	#[test]
	fn write_then_read_back() {
		let r = Region::new(64);
		r.write(3, b"hello");

		let mut out = [0u8; 5];
		r.read(3, &mut out);
		assert_eq!(&out, b"hello");
	}

	#[test]
	fn final_byte_publishes_body() {
		// A polling reader that sees the last byte must see every preceding byte
		let r = Arc::new(Region::new(4096));
		let payload = vec![0xabu8; 1024];

		let reader = {
			let r = r.clone();
			thread::spawn(move || {
				while r.atomic_u8(1023).load(Ordering::Acquire) != 0xab {
					::std::sync::atomic::spin_loop_hint();
				}
				let mut out = vec![0u8; 1024];
				r.read(0, &mut out);
				out
			})
		};

		r.write_final_byte_last(0, &payload);
		assert_eq!(reader.join().unwrap(), payload);
	}
}
