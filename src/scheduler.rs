//! Debounce timers on a virtual clock.

use crate::runtime::InstanceId;
use core::time::Duration;
use hashbrown::HashMap;
use std::collections::BTreeMap;
use tracing::trace;

/// Which of an instance's two debounced passes a timer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Pass {
	Render,
	Css,
}

/// At most one pending timer per `(instance, pass)`. Scheduling again replaces the previous timer.
#[derive(Debug, Default)]
pub(crate) struct Scheduler {
	now: Duration,
	sequence: u64,
	timers: BTreeMap<(Duration, u64), (InstanceId, Pass)>,
	pending: HashMap<(InstanceId, Pass), (Duration, u64)>,
}

impl Scheduler {
	pub fn now(&self) -> Duration {
		self.now
	}

	pub fn schedule(&mut self, instance: InstanceId, pass: Pass, delay: Duration) {
		self.cancel(instance, pass);
		let key = (self.now + delay, self.sequence);
		self.sequence += 1;
		trace!(?instance, ?pass, deadline = ?key.0, "Scheduled");
		self.timers.insert(key, (instance, pass));
		self.pending.insert((instance, pass), key);
	}

	/// Returns whether a timer was pending.
	pub fn cancel(&mut self, instance: InstanceId, pass: Pass) -> bool {
		match self.pending.remove(&(instance, pass)) {
			Some(key) => {
				self.timers.remove(&key);
				true
			}
			None => false,
		}
	}

	#[cfg(test)]
	fn is_pending(&self, instance: InstanceId, pass: Pass) -> bool {
		self.pending.contains_key(&(instance, pass))
	}

	pub fn next_deadline(&self) -> Option<Duration> {
		self.timers.keys().next().map(|&(deadline, _)| deadline)
	}

	/// Removes the earliest timer due at or before `until` and moves the clock to its deadline.
	pub fn pop_due(&mut self, until: Duration) -> Option<(InstanceId, Pass)> {
		let (&key, _) = self.timers.iter().next()?;
		if key.0 > until {
			return None;
		}
		let (instance, pass) = self.timers.remove(&key)?;
		self.pending.remove(&(instance, pass));
		self.now = self.now.max(key.0);
		Some((instance, pass))
	}

	pub fn advance_to(&mut self, time: Duration) {
		self.now = self.now.max(time);
	}

	pub fn len(&self) -> usize {
		self.timers.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const MS: Duration = Duration::from_millis(1);

	#[test]
	fn rescheduling_replaces() {
		let mut scheduler = Scheduler::default();
		let a = InstanceId::new(0);
		scheduler.schedule(a, Pass::Render, 10 * MS);
		scheduler.advance_to(5 * MS);
		scheduler.schedule(a, Pass::Render, 10 * MS);
		assert_eq!(scheduler.len(), 1);
		assert_eq!(scheduler.pop_due(10 * MS), None);
		assert_eq!(scheduler.pop_due(15 * MS), Some((a, Pass::Render)));
		assert_eq!(scheduler.now(), 15 * MS);
		assert!(!scheduler.is_pending(a, Pass::Render));
	}

	#[test]
	fn deadline_order() {
		let mut scheduler = Scheduler::default();
		let (a, b) = (InstanceId::new(0), InstanceId::new(1));
		scheduler.schedule(a, Pass::Css, 20 * MS);
		scheduler.schedule(b, Pass::Render, 10 * MS);
		scheduler.schedule(a, Pass::Render, 10 * MS);
		assert_eq!(scheduler.pop_due(Duration::MAX), Some((b, Pass::Render)));
		assert_eq!(scheduler.pop_due(Duration::MAX), Some((a, Pass::Render)));
		assert!(scheduler.cancel(a, Pass::Css));
		assert_eq!(scheduler.next_deadline(), None);
	}
}
