//! Serializes notifications of the same alert group inside one process.
//!
//! Two concurrent notifications for a new group would otherwise both miss the
//! search and create two work items. Other processes aren't covered.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex, PoisonError, Weak},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Key = (String, String);

#[derive(Debug, Default)]
pub struct GroupLocks {
	locks: Mutex<HashMap<Key, Weak<AsyncMutex<()>>>>,
}

impl GroupLocks {
	/// Waits until no other notification holds the lock of the group and
	/// returns a guard releasing it on drop.
	pub async fn lock(&self, project: &str, group_key: &str) -> OwnedMutexGuard<()> {
		let mutex = {
			let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);

			// drop entries of groups nobody holds anymore
			locks.retain(|_, lock| lock.strong_count() > 0);

			let key = (project.to_owned(), group_key.to_owned());
			match locks.get(&key).and_then(Weak::upgrade) {
				Some(mutex) => mutex,
				None => {
					let mutex = Arc::new(AsyncMutex::new(()));
					locks.insert(key, Arc::downgrade(&mutex));
					mutex
				}
			}
		};

		mutex.lock_owned().await
	}

	#[cfg(test)]
	fn len(&self) -> usize {
		self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
	}
}
