//! Registry of live packet flows ("funnels"). All insert/replace/remove
//! pairs happen under one lock, and every funnel is closed exactly once: on
//! replacement, explicit unregistration, idle sweep, or final teardown.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::*;

pub trait Funnel: Send + Sync + 'static {
	/// Tokio-clock timestamp of the flow's most recent activity.
	fn last_active(&self) -> tokio::time::Instant;
	/// Release the funnel's resources. The tracker calls this exactly once.
	fn close(&self);
}

pub struct FunnelTracker<K, F> {
	funnels: Mutex<HashMap<K, Arc<F>>>,
}

impl<K, F> Default for FunnelTracker<K, F>
where
	K: Eq + Hash + Clone + Debug + Send + 'static,
	F: Funnel,
{
	fn default() -> Self {
		Self::new()
	}
}

impl<K, F> FunnelTracker<K, F>
where
	K: Eq + Hash + Clone + Debug + Send + 'static,
	F: Funnel,
{
	pub fn new() -> Self {
		FunnelTracker {
			funnels: Mutex::new(HashMap::new()),
		}
	}

	/// Fetch the funnel for `id`, creating it if absent. When present,
	/// `should_replace` decides (under the lock, so no two funnels can race
	/// for one id) whether the existing funnel is stale; a replaced funnel is
	/// closed before the new one is inserted.
	pub fn get_or_register(
		&self,
		id: K,
		should_replace: impl FnOnce(&Arc<F>) -> bool,
		new_funnel: impl FnOnce() -> anyhow::Result<Arc<F>>,
	) -> anyhow::Result<(Arc<F>, bool)> {
		let mut funnels = self.funnels.lock();
		if let Some(existing) = funnels.get(&id) {
			if !should_replace(existing) {
				return Ok((existing.clone(), false));
			}
			if let Some(old) = funnels.remove(&id) {
				debug!(?id, "replacing funnel");
				old.close();
			}
		}
		let funnel = new_funnel()?;
		funnels.insert(id, funnel.clone());
		Ok((funnel, true))
	}

	/// Remove `id` only if it still holds exactly `expected` (pointer
	/// identity), then close it.
	pub fn unregister(&self, id: &K, expected: &Arc<F>) -> bool {
		let removed = {
			let mut funnels = self.funnels.lock();
			match funnels.get(id) {
				Some(current) if Arc::ptr_eq(current, expected) => funnels.remove(id),
				_ => None,
			}
		};
		match removed {
			Some(funnel) => {
				funnel.close();
				true
			},
			None => false,
		}
	}

	pub fn get(&self, id: &K) -> Option<Arc<F>> {
		self.funnels.lock().get(id).cloned()
	}

	pub fn len(&self) -> usize {
		self.funnels.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.funnels.lock().is_empty()
	}

	/// Close everything; used at teardown.
	pub fn close_all(&self) {
		let drained: Vec<_> = self.funnels.lock().drain().collect();
		for (id, funnel) in drained {
			trace!(?id, "closing funnel at teardown");
			funnel.close();
		}
	}

	fn sweep(&self, idle_timeout: Duration) {
		let now = tokio::time::Instant::now();
		let expired: Vec<(K, Arc<F>)> = {
			let mut funnels = self.funnels.lock();
			let ids: Vec<K> = funnels
				.iter()
				.filter(|(_, f)| now.duration_since(f.last_active()) >= idle_timeout)
				.map(|(id, _)| id.clone())
				.collect();
			ids
				.into_iter()
				.filter_map(|id| funnels.remove(&id).map(|f| (id, f)))
				.collect()
		};
		for (id, funnel) in expired {
			debug!(?id, "closing idle funnel");
			funnel.close();
		}
	}

	/// Periodically close funnels idle longer than `idle_timeout`; the sweep
	/// interval equals the timeout. Cancellation closes every live funnel.
	pub async fn schedule_cleanup(&self, ctx: CancellationToken, idle_timeout: Duration) {
		let start = tokio::time::Instant::now() + idle_timeout;
		let mut ticker = tokio::time::interval_at(start, idle_timeout);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				_ = ctx.cancelled() => {
					self.close_all();
					return;
				}
				_ = ticker.tick() => {
					self.sweep(idle_timeout);
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicBool, Ordering};

	use super::*;

	struct TestFunnel {
		conn_index: u8,
		last_active: Mutex<tokio::time::Instant>,
		closed: AtomicBool,
	}

	impl TestFunnel {
		fn new(conn_index: u8) -> Arc<Self> {
			Arc::new(TestFunnel {
				conn_index,
				last_active: Mutex::new(tokio::time::Instant::now()),
				closed: AtomicBool::new(false),
			})
		}
	}

	impl Funnel for TestFunnel {
		fn last_active(&self) -> tokio::time::Instant {
			*self.last_active.lock()
		}

		fn close(&self) {
			let already = self.closed.swap(true, Ordering::SeqCst);
			assert!(!already, "funnel closed twice");
		}
	}

	#[test]
	fn registers_once_and_returns_existing() {
		let tracker: FunnelTracker<u16, TestFunnel> = FunnelTracker::new();
		let (first, is_new) = tracker
			.get_or_register(7, |_| false, || Ok(TestFunnel::new(0)))
			.unwrap();
		assert!(is_new);
		let (second, is_new) = tracker
			.get_or_register(7, |_| false, || panic!("must not build a new funnel"))
			.unwrap();
		assert!(!is_new);
		assert!(Arc::ptr_eq(&first, &second));
	}

	#[test]
	fn replace_closes_the_old_funnel() {
		let tracker: FunnelTracker<u16, TestFunnel> = FunnelTracker::new();
		let (old, _) = tracker
			.get_or_register(1, |_| false, || Ok(TestFunnel::new(0)))
			.unwrap();
		let (new, is_new) = tracker
			.get_or_register(
				1,
				|existing| existing.conn_index != 1,
				|| Ok(TestFunnel::new(1)),
			)
			.unwrap();
		assert!(is_new);
		assert!(!Arc::ptr_eq(&old, &new));
		assert!(old.closed.load(Ordering::SeqCst));
		assert!(!new.closed.load(Ordering::SeqCst));
	}

	#[test]
	fn unregister_checks_identity() {
		let tracker: FunnelTracker<u16, TestFunnel> = FunnelTracker::new();
		let (current, _) = tracker
			.get_or_register(3, |_| false, || Ok(TestFunnel::new(0)))
			.unwrap();
		let stranger = TestFunnel::new(9);
		assert!(!tracker.unregister(&3, &stranger));
		assert_eq!(tracker.len(), 1);
		assert!(tracker.unregister(&3, &current));
		assert!(current.closed.load(Ordering::SeqCst));
		// Already removed.
		assert!(!tracker.unregister(&3, &current));
	}

	#[tokio::test(start_paused = true)]
	async fn idle_funnels_are_swept() {
		let tracker: Arc<FunnelTracker<u16, TestFunnel>> = Arc::new(FunnelTracker::new());
		let idle = Duration::from_secs(10);
		let (funnel, _) = tracker
			.get_or_register(5, |_| false, || Ok(TestFunnel::new(0)))
			.unwrap();

		let ctx = CancellationToken::new();
		let sweeper = {
			let tracker = tracker.clone();
			let ctx = ctx.clone();
			tokio::spawn(async move { tracker.schedule_cleanup(ctx, idle).await })
		};

		// Stay active through the first tick.
		tokio::time::sleep(Duration::from_secs(6)).await;
		*funnel.last_active.lock() = tokio::time::Instant::now();
		tokio::time::sleep(Duration::from_secs(5)).await;
		assert_eq!(tracker.len(), 1);

		// Then go idle past a full interval.
		tokio::time::sleep(Duration::from_secs(11)).await;
		assert_eq!(tracker.len(), 0);
		assert!(funnel.closed.load(Ordering::SeqCst));

		ctx.cancel();
		sweeper.await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn cancellation_closes_live_funnels() {
		let tracker: Arc<FunnelTracker<u16, TestFunnel>> = Arc::new(FunnelTracker::new());
		let (funnel, _) = tracker
			.get_or_register(8, |_| false, || Ok(TestFunnel::new(0)))
			.unwrap();
		let ctx = CancellationToken::new();
		let sweeper = {
			let tracker = tracker.clone();
			let ctx = ctx.clone();
			tokio::spawn(async move {
				tracker
					.schedule_cleanup(ctx, Duration::from_secs(60))
					.await
			})
		};
		ctx.cancel();
		sweeper.await.unwrap();
		assert!(funnel.closed.load(Ordering::SeqCst));
		assert!(tracker.is_empty());
	}
}
