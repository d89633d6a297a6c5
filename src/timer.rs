use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
    time::{Duration, Instant},
};

#[derive(Debug, PartialEq, Eq, Clone)]
struct TimerKey {
    task_id: u64,
    fire_at: Instant,
}

impl Ord for TimerKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then(self.task_id.cmp(&other.task_id))
    }
}

impl PartialOrd for TimerKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// One-shot timer wheel.
///
/// Scheduling returns a task id; `cancel` is idempotent and race-safe
/// against expiry. `schedule` hands the task id to the value
/// constructor so fired events can carry it, letting the owner verify
/// on wake that the firing timer is still the one stored in its slot.
pub struct Timer<T> {
    tasks: RwLock<BTreeMap<TimerKey, T>>,
    id_index: RwLock<HashMap<u64, Instant>>,
    last_task_id: AtomicU64,
}

impl<T> Default for Timer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Timer {
            tasks: RwLock::new(BTreeMap::new()),
            id_index: RwLock::new(HashMap::new()),
            last_task_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.read().map(|ts| ts.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn schedule<F>(&self, duration: Duration, make: F) -> u64
    where
        F: FnOnce(u64) -> T,
    {
        self.schedule_at(Instant::now() + duration, make)
    }

    pub fn schedule_at<F>(&self, fire_at: Instant, make: F) -> u64
    where
        F: FnOnce(u64) -> T,
    {
        let task_id = self.last_task_id.fetch_add(1, Ordering::Relaxed);
        let value = make(task_id);
        self.tasks
            .write()
            .as_mut()
            .map(|ts| ts.insert(TimerKey { task_id, fire_at }, value))
            .ok();
        self.id_index
            .write()
            .as_mut()
            .map(|it| it.insert(task_id, fire_at))
            .ok();
        task_id
    }

    pub fn timeout(&self, duration: Duration, value: T) -> u64 {
        self.schedule(duration, |_| value)
    }

    pub fn cancel(&self, task_id: u64) -> Option<T> {
        let fire_at = self
            .id_index
            .write()
            .as_mut()
            .map(|it| it.remove(&task_id))
            .ok()
            .flatten()?;
        self.tasks
            .write()
            .as_mut()
            .map(|ts| ts.remove(&TimerKey { task_id, fire_at }))
            .ok()
            .flatten()
    }

    pub fn poll(&self, now: Instant) -> Vec<T> {
        let mut fired = Vec::new();
        let due_keys = {
            let mut tasks = match self.tasks.write() {
                Ok(tasks) => tasks,
                Err(_) => return fired,
            };
            let due_keys = tasks
                .range(
                    ..=TimerKey {
                        task_id: u64::MAX,
                        fire_at: now,
                    },
                )
                .map(|(key, _)| key.clone())
                .collect::<Vec<_>>();
            if due_keys.is_empty() {
                return fired;
            }
            fired.reserve(due_keys.len());
            for key in due_keys.iter() {
                if let Some(value) = tasks.remove(key) {
                    fired.push(value);
                }
            }
            due_keys
        };
        self.id_index
            .write()
            .as_mut()
            .map(|it| {
                for key in due_keys {
                    it.remove(&key.task_id);
                }
            })
            .ok();
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_cancel_poll() {
        let timer = Timer::new();
        let now = Instant::now();
        let id = timer.schedule_at(now, |id| ("one", id));
        assert_eq!(timer.cancel(id), Some(("one", id)));
        assert_eq!(timer.cancel(id), None);

        timer.schedule_at(now, |_| ("two", 0));
        let fired = timer.poll(now + Duration::from_secs(1));
        assert_eq!(fired.len(), 1);

        timer.schedule_at(now + Duration::from_millis(1500), |_| ("late", 0));
        assert!(timer.poll(now + Duration::from_secs(1)).is_empty());
        assert_eq!(timer.len(), 1);
    }

    #[test]
    fn test_value_carries_task_id() {
        let timer = Timer::new();
        let now = Instant::now();
        let id = timer.schedule_at(now, |id| id);
        let fired = timer.poll(now);
        assert_eq!(fired, vec![id]);
    }
}
