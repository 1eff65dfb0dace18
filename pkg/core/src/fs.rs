use std::fs::{File, OpenOptions, create_dir_all};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;


/// An exclusive lock on a data directory held for the lifetime of this object
///
/// Every node owns at most one record-store directory and one snapshot directory; taking the
/// lock up front turns the "two nodes configured with the same db_name" operator mistake into
/// an immediate startup error instead of silent corruption
pub struct DirLock {
	/// The file holding the lock (kept open so the lock stays held)
	_file: File,

	path: PathBuf
}

impl DirLock {

	/// Locks the given directory, creating it if it does not exist yet
	pub fn open(path: &Path) -> io::Result<DirLock> {
		create_dir_all(path)?;

		let lockfile_path = path.join("LOCK");

		let lockfile = OpenOptions::new()
			.write(true).create(true)
			.open(&lockfile_path)?;

		// NOTE: Dropped automatically when the File is closed
		lockfile.try_lock_exclusive()?;

		Ok(DirLock {
			_file: lockfile,
			path: path.to_owned()
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}


#[cfg(test)]
mod tests {
	use super::*;
	use std::env;

	#[test]
	fn dir_lock_excludes_second_owner() {
		let dir = env::temp_dir().join("apus-dirlock-test");

		let first = DirLock::open(&dir).expect("first lock");
		assert!(DirLock::open(&dir).is_err());

		drop(first);
		DirLock::open(&dir).expect("relock after drop");
	}
}
