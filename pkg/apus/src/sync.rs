use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;


/// A plain spin lock guarding the submission critical section
///
/// The submission path only reserves an offset and bumps per-peer send counters while
/// holding this, so spinning is cheaper than parking; nothing may sleep with the lock held
pub struct SpinLock<T> {
	locked: AtomicBool,
	value: UnsafeCell<T>
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

pub struct SpinLockGuard<'a, T: 'a> {
	lock: &'a SpinLock<T>
}

impl<T> SpinLock<T> {
	pub fn new(value: T) -> SpinLock<T> {
		SpinLock {
			locked: AtomicBool::new(false),
			value: UnsafeCell::new(value)
		}
	}

	pub fn lock(&self) -> SpinLockGuard<T> {
		while self.locked.compare_and_swap(false, true, Ordering::Acquire) {
			while self.locked.load(Ordering::Relaxed) {
				::std::sync::atomic::spin_loop_hint();
			}
		}

		SpinLockGuard { lock: self }
	}
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
	type Target = T;
	fn deref(&self) -> &T {
		unsafe { &*self.lock.value.get() }
	}
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
	fn deref_mut(&mut self) -> &mut T {
		unsafe { &mut *self.lock.value.get() }
	}
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
	fn drop(&mut self) {
		self.lock.locked.store(false, Ordering::Release);
	}
}


/// A broadcast wake-up used for waiting on commit/apply advancement
///
/// Waiters block on a generation counter; every notify bumps it and wakes everyone. This is
/// what the submission path parks on between reaching quorum and its predecessors committing
pub struct Event {
	generation: Mutex<u64>,
	cond: Condvar
}

impl Event {
	pub fn new() -> Event {
		Event {
			generation: Mutex::new(0),
			cond: Condvar::new()
		}
	}

	pub fn notify_all(&self) {
		let mut gen = self.generation.lock().unwrap();
		*gen += 1;
		self.cond.notify_all();
	}

	/// Blocks until notify_all is called or the predicate turns true; re-checks the
	/// predicate on every wake-up
	pub fn wait_while<F: FnMut() -> bool>(&self, mut still_waiting: F) {
		let mut gen = self.generation.lock().unwrap();
		while still_waiting() {
			let seen = *gen;
			while *gen == seen {
				gen = self.cond.wait(gen).unwrap();
			}
		}
	}

	/// Same as wait_while but gives up after the timeout; returns false on timeout
	pub fn wait_while_timeout<F: FnMut() -> bool>(&self, mut still_waiting: F, timeout: Duration) -> bool {
		let deadline = ::std::time::Instant::now() + timeout;

		let mut gen = self.generation.lock().unwrap();
		while still_waiting() {
			let now = ::std::time::Instant::now();
			if now >= deadline {
				return false;
			}

			let (g, res) = self.cond.wait_timeout(gen, deadline - now).unwrap();
			gen = g;
			if res.timed_out() && still_waiting() {
				return false;
			}
		}

		true
	}
}


#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use std::sync::atomic::AtomicUsize;
	use std::thread;

	#[test]
	fn spin_lock_counts() {
		let lock = Arc::new(SpinLock::new(0u64));

		let mut handles = vec![];
		for _ in 0..4 {
			let lock = lock.clone();
			handles.push(thread::spawn(move || {
				for _ in 0..1000 {
					*lock.lock() += 1;
				}
			}));
		}
		for h in handles {
			h.join().unwrap();
		}

		assert_eq!(*lock.lock(), 4000);
	}

	#[test]
	fn event_wakes_waiter() {
		let event = Arc::new(Event::new());
		let flag = Arc::new(AtomicUsize::new(0));

		let waiter = {
			let event = event.clone();
			let flag = flag.clone();
			thread::spawn(move || {
				event.wait_while(|| flag.load(Ordering::SeqCst) == 0);
			})
		};

		thread::sleep(Duration::from_millis(20));
		flag.store(1, Ordering::SeqCst);
		event.notify_all();
		waiter.join().unwrap();
	}

	#[test]
	fn event_wait_times_out() {
		let event = Event::new();
		assert!(!event.wait_while_timeout(|| true, Duration::from_millis(10)));
	}
}
