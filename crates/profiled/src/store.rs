//! Concurrent store of in-progress profiles.
//!
//! The store maps each [`WindowKey`] to an entry holding the profile for the current
//! window. Entries live in a sharded map and carry their own guard, so writers for
//! different keys never contend on a shared lock and writers for the same key are
//! serialised.
//!
//! Rotation removes every entry present when it starts, takes its profile under the
//! entry guard and marks the entry retired. A writer that acquires a retired entry's
//! guard (because it looked the entry up just before rotation removed it) retries
//! against the fresh entry. Every observation therefore lands in exactly one window:
//! the one being rotated out, or the one that follows it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::key::WindowKey;
use crate::profile::{Profile, ProfileSnapshot};

/// A finished window for one key, detached from the store.
#[derive(Debug, Clone)]
pub struct RotatedProfile {
    pub key: WindowKey,
    /// The epoch this window belonged to.
    pub epoch: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Time of the last observation recorded into this window.
    pub last_activity: DateTime<Utc>,
    pub snapshot: Arc<ProfileSnapshot>,
}

#[derive(Debug)]
struct EntryState {
    profile: Profile,
    last_activity: DateTime<Utc>,
    retired: bool,
}

#[derive(Debug)]
struct ProfileEntry {
    state: Mutex<EntryState>,
}

impl ProfileEntry {
    fn new() -> Self {
        Self {
            state: Mutex::new(EntryState {
                profile: Profile::new(),
                last_activity: Utc::now(),
                retired: false,
            }),
        }
    }
}

/// Process-wide store of current-window profiles.
#[derive(Debug)]
pub struct ProfileStore {
    entries: DashMap<WindowKey, Arc<ProfileEntry>>,
    epoch: AtomicU64,
    window_start: Mutex<DateTime<Utc>>,
}

impl ProfileStore {
    /// Creates an empty store whose first window starts now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            epoch: AtomicU64::new(0),
            window_start: Mutex::new(Utc::now()),
        }
    }

    /// Runs `f` against the current profile for `key`, creating it if needed.
    ///
    /// `f` runs while holding only this key's guard; keep it short and free of I/O.
    pub fn with_current<F, R>(&self, key: &WindowKey, f: F) -> R
    where
        F: FnOnce(&mut Profile) -> R,
    {
        loop {
            let entry = self.current_entry(key);
            let mut state = entry.state.lock();
            if state.retired {
                tracing::trace!(key = %key, "entry retired by rotation, retrying");
                continue;
            }
            state.last_activity = Utc::now();
            return f(&mut state.profile);
        }
    }

    fn current_entry(&self, key: &WindowKey) -> Arc<ProfileEntry> {
        if let Some(entry) = self.entries.get(key) {
            return entry.value().clone();
        }
        self.entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(ProfileEntry::new()))
            .value()
            .clone()
    }

    /// Closes the current window and detaches every non-empty profile.
    ///
    /// Keys whose profile received no observations are evicted without producing a
    /// snapshot. Keys first seen while the rotation is running belong to the next
    /// window.
    pub fn rotate_all(&self) -> Vec<RotatedProfile> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst);
        let window_end = Utc::now();
        let window_start = std::mem::replace(&mut *self.window_start.lock(), window_end);

        let keys: Vec<WindowKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut rotated = Vec::with_capacity(keys.len());

        for key in keys {
            let Some((key, entry)) = self.entries.remove(&key) else {
                continue;
            };

            let (profile, last_activity) = {
                let mut state = entry.state.lock();
                state.retired = true;
                (std::mem::take(&mut state.profile), state.last_activity)
            };

            if profile.is_empty() {
                tracing::trace!(key = %key, epoch, "evicting idle entry");
                continue;
            }

            rotated.push(RotatedProfile {
                key,
                epoch,
                window_start,
                window_end,
                last_activity,
                snapshot: Arc::new(profile.snapshot()),
            });
        }

        tracing::debug!(
            epoch,
            profiles = rotated.len(),
            remaining = self.entries.len(),
            "rotated profile window"
        );

        rotated
    }

    /// Reads the current profile for `key` without creating it.
    pub fn inspect<F, R>(&self, key: &WindowKey, f: F) -> Option<R>
    where
        F: FnOnce(&Profile) -> R,
    {
        let entry = self.entries.get(key).map(|e| e.value().clone())?;
        let state = entry.state.lock();
        Some(f(&state.profile))
    }

    /// Number of completed rotations.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Start of the window currently accumulating.
    pub fn window_start(&self) -> DateTime<Utc> {
        *self.window_start.lock()
    }

    /// Number of keys with a live entry.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ProfileStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::FeatureValue;
    use std::sync::mpsc;
    use std::time::Duration;

    fn key(dataset: &str) -> WindowKey {
        WindowKey::new("org-1", dataset)
    }

    fn record(store: &ProfileStore, key: &WindowKey, feature: &str) {
        store
            .with_current(key, |p| p.record(feature, &FeatureValue::Number(1.0)))
            .unwrap();
    }

    #[test]
    fn creates_entry_on_first_observation() {
        let store = ProfileStore::new();
        assert!(store.is_empty());

        record(&store, &key("m1"), "f");

        assert_eq!(store.len(), 1);
        let count = store.inspect(&key("m1"), Profile::observation_count);
        assert_eq!(count, Some(1));
        assert!(store.inspect(&key("m2"), Profile::observation_count).is_none());
    }

    #[test]
    fn rotation_detaches_and_resets() {
        let store = ProfileStore::new();
        record(&store, &key("m1"), "f");
        record(&store, &key("m1"), "f");
        record(&store, &key("m2"), "g");

        let rotated = store.rotate_all();
        assert_eq!(rotated.len(), 2);
        assert_eq!(store.epoch(), 1);
        assert!(store.is_empty());

        let m1 = rotated.iter().find(|r| r.key == key("m1")).unwrap();
        assert_eq!(m1.epoch, 0);
        assert_eq!(m1.snapshot.feature("f").unwrap().count, 2);
        assert!(m1.window_start <= m1.window_end);

        // The key resumes in a fresh window.
        record(&store, &key("m1"), "f");
        let rotated = store.rotate_all();
        assert_eq!(rotated.len(), 1);
        assert_eq!(rotated[0].epoch, 1);
        assert_eq!(rotated[0].snapshot.observations, 1);
        assert_eq!(rotated[0].window_start, m1.window_end);
    }

    #[test]
    fn empty_profiles_are_skipped() {
        let store = ProfileStore::new();
        store.with_current(&key("m1"), |_| ());

        assert_eq!(store.len(), 1);
        let rotated = store.rotate_all();
        assert!(rotated.is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn rotating_empty_store_advances_epoch() {
        let store = ProfileStore::new();
        assert!(store.rotate_all().is_empty());
        assert!(store.rotate_all().is_empty());
        assert_eq!(store.epoch(), 2);
    }

    #[test]
    fn same_key_writers_are_serialised() {
        let store = Arc::new(ProfileStore::new());
        let threads = 8;
        let per_thread = 500;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..per_thread {
                        record(&store, &key("m1"), "f");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let rotated = store.rotate_all();
        assert_eq!(rotated.len(), 1);
        assert_eq!(rotated[0].snapshot.observations, threads * per_thread);
    }

    #[test]
    fn held_guard_does_not_block_other_keys() {
        let store = Arc::new(ProfileStore::new());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = {
            let store = store.clone();
            std::thread::spawn(move || {
                store.with_current(&key("a"), |profile| {
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    profile.record("f", &FeatureValue::Null).unwrap();
                });
            })
        };

        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Key "a" is held; key "b" must still make progress.
        let (done_tx, done_rx) = mpsc::channel();
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for _ in 0..100 {
                    record(&store, &key("b"), "g");
                }
                done_tx.send(()).unwrap();
            })
        };
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("writer on another key was blocked");

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        writer.join().unwrap();

        assert_eq!(store.inspect(&key("a"), Profile::observation_count), Some(1));
        assert_eq!(store.inspect(&key("b"), Profile::observation_count), Some(100));
    }

    #[test]
    fn rotation_waits_for_in_flight_writer() {
        let store = Arc::new(ProfileStore::new());
        record(&store, &key("a"), "f");

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        // Hold the guard so rotation has to wait for this writer.
        let holder = {
            let store = store.clone();
            std::thread::spawn(move || {
                store.with_current(&key("a"), |profile| {
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    profile.record("f", &FeatureValue::Null).unwrap();
                });
            })
        };
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let rotator = {
            let store = store.clone();
            std::thread::spawn(move || store.rotate_all())
        };

        std::thread::sleep(Duration::from_millis(20));
        release_tx.send(()).unwrap();
        holder.join().unwrap();

        let rotated = rotator.join().unwrap();
        record(&store, &key("a"), "f");

        let first: u64 = rotated.iter().map(|r| r.snapshot.observations).sum();
        let live = store
            .inspect(&key("a"), Profile::observation_count)
            .unwrap_or(0);
        assert_eq!(first, 2, "held write belongs to the rotated window");
        assert_eq!(live, 1);
    }
}
