//! Cached Access tokens. Tokens live at a deterministic path derived from the
//! app URL so separate invocations find each other's logins; a `.lock`
//! sibling file serializes refreshes across processes.

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::*;

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);
/// A lock older than this belongs to a dead process and is evicted.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum TokenError {
	#[error("no configuration directory available on this system")]
	NoConfigDir,
	#[error("timed out waiting for the token lock at {0}")]
	LockTimeout(PathBuf),
	#[error("io error: {0}")]
	Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct TokenStore {
	dir: PathBuf,
}

impl TokenStore {
	pub fn new() -> Result<Self, TokenError> {
		let dir = dirs::config_dir()
			.ok_or(TokenError::NoConfigDir)?
			.join("tunneld")
			.join("tokens");
		Ok(TokenStore { dir })
	}

	pub fn with_dir(dir: PathBuf) -> Self {
		TokenStore { dir }
	}

	/// One file per app URL; the name is a digest so arbitrary URLs map to
	/// safe filenames and repeated runs agree on the location.
	pub fn token_path(&self, app_url: &str) -> PathBuf {
		let digest = Sha256::digest(app_url.as_bytes());
		self.dir.join(format!("{}.token", hex::encode(&digest[..16])))
	}

	pub fn load(&self, app_url: &str) -> Result<Option<String>, TokenError> {
		match fs_err::read_to_string(self.token_path(app_url)) {
			Ok(token) => {
				let token = token.trim().to_string();
				Ok((!token.is_empty()).then_some(token))
			},
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	pub fn save(&self, app_url: &str, token: &str) -> Result<(), TokenError> {
		fs_err::create_dir_all(&self.dir)?;
		let path = self.token_path(app_url);
		let _lock = Lockfile::acquire(&lock_path(&path), LOCK_STALE_AFTER)?;
		fs_err::write(&path, token)?;
		Ok(())
	}

	/// Remove an invalidated token so the next attempt forces a fresh login.
	pub fn delete(&self, app_url: &str) -> Result<(), TokenError> {
		match fs_err::remove_file(self.token_path(app_url)) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}
}

fn lock_path(token_path: &Path) -> PathBuf {
	let mut p = token_path.as_os_str().to_owned();
	p.push(".lock");
	PathBuf::from(p)
}

/// Filesystem-level mutex: exists while held, interoperable with any process
/// that respects the same protocol.
#[derive(Debug)]
pub struct Lockfile {
	path: PathBuf,
}

impl Lockfile {
	pub fn acquire(path: &Path, timeout: Duration) -> Result<Lockfile, TokenError> {
		let deadline = Instant::now() + timeout;
		loop {
			match fs_err::OpenOptions::new()
				.write(true)
				.create_new(true)
				.open(path)
			{
				Ok(_) => {
					return Ok(Lockfile {
						path: path.to_path_buf(),
					});
				},
				Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
					// Evict locks left behind by dead processes.
					if let Ok(meta) = fs_err::metadata(path) {
						let stale = meta
							.modified()
							.ok()
							.and_then(|m| m.elapsed().ok())
							.map(|age| age > LOCK_STALE_AFTER)
							.unwrap_or(false);
						if stale {
							let _ = fs_err::remove_file(path);
							continue;
						}
					}
					if Instant::now() >= deadline {
						return Err(TokenError::LockTimeout(path.to_path_buf()));
					}
					std::thread::sleep(LOCK_RETRY_INTERVAL);
				},
				Err(e) => return Err(e.into()),
			}
		}
	}
}

impl Drop for Lockfile {
	fn drop(&mut self) {
		let _ = fs_err::remove_file(&self.path);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn save_load_delete_round_trip() {
		let tmp = tempfile::tempdir().unwrap();
		let store = TokenStore::with_dir(tmp.path().to_path_buf());
		let app = "https://app.example.com";

		assert_eq!(store.load(app).unwrap(), None);
		store.save(app, "tok-123").unwrap();
		assert_eq!(store.load(app).unwrap(), Some("tok-123".to_string()));
		store.delete(app).unwrap();
		assert_eq!(store.load(app).unwrap(), None);
		// Deleting again is not an error.
		store.delete(app).unwrap();
	}

	#[test]
	fn token_paths_are_deterministic_and_distinct() {
		let store = TokenStore::with_dir(PathBuf::from("/var/empty"));
		let a1 = store.token_path("https://a.example.com");
		let a2 = store.token_path("https://a.example.com");
		let b = store.token_path("https://b.example.com");
		assert_eq!(a1, a2);
		assert_ne!(a1, b);
	}

	#[test]
	fn lockfile_excludes_and_releases() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("t.lock");
		let lock = Lockfile::acquire(&path, Duration::from_secs(1)).unwrap();
		// A second acquire with a tiny timeout fails while the lock is held.
		let err = Lockfile::acquire(&path, Duration::from_millis(120)).unwrap_err();
		assert!(matches!(err, TokenError::LockTimeout(_)));
		drop(lock);
		// Released on drop.
		Lockfile::acquire(&path, Duration::from_secs(1)).unwrap();
	}

	#[test]
	fn stale_locks_are_evicted() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("t.lock");
		fs_err::write(&path, "pid").unwrap();
		let old = std::time::SystemTime::now() - Duration::from_secs(60);
		let file = fs_err::OpenOptions::new().write(true).open(&path).unwrap();
		file.file().set_modified(old).unwrap();
		drop(file);
		Lockfile::acquire(&path, Duration::from_millis(500)).unwrap();
	}
}
