//! Locked, atomically written JSON record store.
//!
//! Every stateful component persists its records through [`StateStore`]. In
//! directory mode each record is a `<name>.json` file guarded by a sibling
//! `<name>.lock` file; an exclusive advisory lock is held only for the duration
//! of one read-modify-write and is never held across an `.await`. Writes go
//! through [`write_text_atomic`] so lock-free readers always observe a whole
//! snapshot.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::atomic_io::write_text_atomic;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Errors surfaced by [`StateStore`]. Corrupt record content is not an error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("timed out after {waited_ms}ms waiting for the lock on state record '{record}'")]
    LockTimeout { record: String, waited_ms: u64 },
    #[error("invalid state record name '{0}': use [A-Za-z0-9_.-] and no leading dot")]
    InvalidRecordName(String),
    #[error("state store i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode state record '{record}': {source}")]
    Encode {
        record: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to persist state record '{record}': {message}")]
    Persist { record: String, message: String },
}

impl StoreError {
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

#[derive(Debug)]
enum Backend {
    Directory { root: PathBuf },
    Memory { records: Mutex<BTreeMap<String, String>> },
}

/// Handle to a set of named JSON records. Cloning shares the backend.
#[derive(Debug, Clone)]
pub struct StateStore {
    backend: Arc<Backend>,
    lock_timeout: Duration,
}

impl StateStore {
    /// Opens (creating if needed) a directory-backed store shared across processes.
    pub fn open_dir(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self {
            backend: Arc::new(Backend::Directory { root }),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// Process-local store for single-process deployments and tests.
    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(Backend::Memory {
                records: Mutex::new(BTreeMap::new()),
            }),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// True when records live on disk and may be shared with other processes.
    pub fn is_shared(&self) -> bool {
        matches!(self.backend.as_ref(), Backend::Directory { .. })
    }

    pub fn root_dir(&self) -> Option<&Path> {
        match self.backend.as_ref() {
            Backend::Directory { root } => Some(root.as_path()),
            Backend::Memory { .. } => None,
        }
    }

    /// Backing file of `record` in directory mode.
    pub fn record_path(&self, record: &str) -> Option<PathBuf> {
        self.root_dir().map(|root| root.join(format!("{record}.json")))
    }

    /// Loads `record` under an exclusive lock, lets `mutate` change it, and
    /// persists the result before releasing the lock.
    ///
    /// Absent or unparsable content is replaced by `T::default()`. A value that
    /// serializes to `null` (a `None` slot) deletes the record. A contended
    /// lock blocks the calling thread for up to the lock timeout; async code
    /// uses [`Self::update_async`].
    pub fn update<T, R, F>(&self, record: &str, mutate: F) -> Result<R, StoreError>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> R,
    {
        validate_record_name(record)?;
        match self.backend.as_ref() {
            Backend::Directory { root } => {
                let _lock = RecordLock::acquire(root, record, self.lock_timeout)?;
                update_record_file(root, record, mutate)
            }
            Backend::Memory { records } => update_memory_record(records, record, mutate),
        }
    }

    /// [`Self::update`] whose lock wait yields to the runtime between
    /// attempts instead of blocking the worker thread.
    pub async fn update_async<T, R, F>(&self, record: &str, mutate: F) -> Result<R, StoreError>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> R,
    {
        validate_record_name(record)?;
        match self.backend.as_ref() {
            Backend::Directory { root } => {
                let _lock = RecordLock::acquire_async(root, record, self.lock_timeout).await?;
                update_record_file(root, record, mutate)
            }
            Backend::Memory { records } => update_memory_record(records, record, mutate),
        }
    }

    /// Best-effort lock-free read of the last atomically written snapshot.
    pub fn read_only<T>(&self, record: &str) -> T
    where
        T: DeserializeOwned + Default,
    {
        if let Err(error) = validate_record_name(record) {
            tracing::warn!(record, %error, "refusing to read invalid state record name");
            return T::default();
        }
        match self.backend.as_ref() {
            Backend::Directory { root } => {
                let data_path = root.join(format!("{record}.json"));
                match load_record_file::<T>(&data_path, record) {
                    Ok(value) => value,
                    Err(error) => {
                        tracing::warn!(record, %error, "state record read failed; using default");
                        T::default()
                    }
                }
            }
            Backend::Memory { records } => {
                let records = match records.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                records
                    .get(record)
                    .map(|raw| decode_or_default::<T>(raw, record))
                    .unwrap_or_default()
            }
        }
    }
}

struct RecordLock {
    file: File,
}

impl RecordLock {
    fn acquire(root: &Path, record: &str, timeout: Duration) -> Result<Self, StoreError> {
        let (file, lock_path) = open_lock_file(root, record)?;
        let started = Instant::now();
        loop {
            if try_lock(&file, &lock_path)? {
                return Ok(Self { file });
            }
            let pause = poll_pause(record, started, timeout)?;
            std::thread::sleep(pause);
        }
    }

    async fn acquire_async(root: &Path, record: &str, timeout: Duration) -> Result<Self, StoreError> {
        let (file, lock_path) = open_lock_file(root, record)?;
        let started = Instant::now();
        loop {
            if try_lock(&file, &lock_path)? {
                return Ok(Self { file });
            }
            let pause = poll_pause(record, started, timeout)?;
            tokio::time::sleep(pause).await;
        }
    }
}

fn open_lock_file(root: &Path, record: &str) -> Result<(File, PathBuf), StoreError> {
    let lock_path = root.join(format!("{record}.lock"));
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|source| StoreError::Io {
            path: lock_path.clone(),
            source,
        })?;
    Ok((file, lock_path))
}

/// `Ok(false)` when another holder owns the lock.
fn try_lock(file: &File, lock_path: &Path) -> Result<bool, StoreError> {
    match FileExt::try_lock_exclusive(file) {
        Ok(()) => Ok(true),
        Err(error) if is_contended(&error) => Ok(false),
        Err(source) => Err(StoreError::Io {
            path: lock_path.to_path_buf(),
            source,
        }),
    }
}

/// Next pause before retrying a contended lock, or `LockTimeout` once the
/// deadline has passed.
fn poll_pause(record: &str, started: Instant, timeout: Duration) -> Result<Duration, StoreError> {
    let waited = started.elapsed();
    if waited >= timeout {
        let waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX);
        tracing::warn!(record, waited_ms, "state record lock timed out");
        return Err(StoreError::LockTimeout {
            record: record.to_string(),
            waited_ms,
        });
    }
    Ok(LOCK_POLL_INTERVAL.min(timeout.saturating_sub(waited)))
}

fn update_record_file<T, R, F>(root: &Path, record: &str, mutate: F) -> Result<R, StoreError>
where
    T: Serialize + DeserializeOwned + Default,
    F: FnOnce(&mut T) -> R,
{
    let data_path = root.join(format!("{record}.json"));
    let mut value = load_record_file::<T>(&data_path, record)?;
    let result = mutate(&mut value);
    let payload = encode_record(record, &value)?;
    if is_null_payload(&payload) {
        match std::fs::remove_file(&data_path) {
            Ok(()) => tracing::debug!(record, "state record removed"),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(StoreError::Io {
                    path: data_path,
                    source,
                })
            }
        }
        return Ok(result);
    }
    write_text_atomic(&data_path, &payload).map_err(|error| StoreError::Persist {
        record: record.to_string(),
        message: format!("{error:#}"),
    })?;
    Ok(result)
}

fn update_memory_record<T, R, F>(
    records: &Mutex<BTreeMap<String, String>>,
    record: &str,
    mutate: F,
) -> Result<R, StoreError>
where
    T: Serialize + DeserializeOwned + Default,
    F: FnOnce(&mut T) -> R,
{
    let mut records = match records.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let mut value = records
        .get(record)
        .map(|raw| decode_or_default::<T>(raw, record))
        .unwrap_or_default();
    let result = mutate(&mut value);
    let payload = encode_record(record, &value)?;
    if is_null_payload(&payload) {
        records.remove(record);
    } else {
        records.insert(record.to_string(), payload);
    }
    Ok(result)
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(error: &std::io::Error) -> bool {
    error.kind() == ErrorKind::WouldBlock
        || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn validate_record_name(record: &str) -> Result<(), StoreError> {
    let valid = !record.is_empty()
        && !record.starts_with('.')
        && record
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidRecordName(record.to_string()))
    }
}

fn load_record_file<T>(path: &Path, record: &str) -> Result<T, StoreError>
where
    T: DeserializeOwned + Default,
{
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(decode_or_default(&raw, record)),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(T::default()),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn decode_or_default<T>(raw: &str, record: &str) -> T
where
    T: DeserializeOwned + Default,
{
    if raw.trim().is_empty() {
        return T::default();
    }
    match serde_json::from_str::<T>(raw) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(
                record,
                %error,
                "state record is corrupt; continuing with the safe default"
            );
            T::default()
        }
    }
}

fn is_null_payload(payload: &str) -> bool {
    payload.trim_end() == "null"
}

fn encode_record<T: Serialize>(record: &str, value: &T) -> Result<String, StoreError> {
    let mut payload = serde_json::to_string_pretty(value).map_err(|source| StoreError::Encode {
        record: record.to_string(),
        source,
    })?;
    payload.push('\n');
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::mpsc;
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    use super::{StateStore, StoreError};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct CounterRecord {
        #[serde(default)]
        count: u64,
        #[serde(default)]
        labels: BTreeMap<String, String>,
    }

    #[test]
    fn unit_update_starts_from_default_and_persists_result() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = StateStore::open_dir(temp.path()).expect("open");
        let seen = store
            .update("counter", |record: &mut CounterRecord| {
                record.count += 1;
                record.count
            })
            .expect("update");
        assert_eq!(seen, 1);

        let reopened = StateStore::open_dir(temp.path()).expect("reopen");
        let record: CounterRecord = reopened.read_only("counter");
        assert_eq!(record.count, 1);
        assert!(temp.path().join("counter.json").exists());
    }

    #[test]
    fn regression_corrupt_record_falls_back_to_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("counter.json"), "{not json").expect("seed corrupt");
        let store = StateStore::open_dir(temp.path()).expect("open");

        let record: CounterRecord = store.read_only("counter");
        assert_eq!(record, CounterRecord::default());

        let count = store
            .update("counter", |record: &mut CounterRecord| {
                record.count += 5;
                record.count
            })
            .expect("update over corrupt content");
        assert_eq!(count, 5);
    }

    #[test]
    fn unit_invalid_record_names_are_rejected() {
        let store = StateStore::in_memory();
        for name in ["", ".hidden", "../escape", "a/b"] {
            let error = store
                .update(name, |_: &mut CounterRecord| ())
                .expect_err("invalid name");
            assert!(matches!(error, StoreError::InvalidRecordName(_)));
        }
    }

    #[test]
    fn functional_in_memory_store_round_trips_records() {
        let store = StateStore::in_memory();
        assert!(!store.is_shared());
        store
            .update("labels", |record: &mut CounterRecord| {
                record.labels.insert("k".into(), "v".into());
            })
            .expect("update");
        let clone = store.clone();
        let record: CounterRecord = clone.read_only("labels");
        assert_eq!(record.labels.get("k").map(String::as_str), Some("v"));
    }

    #[test]
    fn functional_none_slot_deletes_the_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        for store in [
            StateStore::open_dir(temp.path()).expect("open"),
            StateStore::in_memory(),
        ] {
            store
                .update("slot", |slot: &mut Option<CounterRecord>| {
                    *slot = Some(CounterRecord {
                        count: 3,
                        ..CounterRecord::default()
                    });
                })
                .expect("create");
            let live: Option<CounterRecord> = store.read_only("slot");
            assert_eq!(live.map(|record| record.count), Some(3));

            store
                .update("slot", |slot: &mut Option<CounterRecord>| *slot = None)
                .expect("delete");
            let gone: Option<CounterRecord> = store.read_only("slot");
            assert_eq!(gone, None);
            // Touching an absent slot does not leave a `null` file behind.
            store
                .update("slot", |_: &mut Option<CounterRecord>| ())
                .expect("noop");
        }
        assert!(!temp.path().join("slot.json").exists());
    }

    #[test]
    fn integration_concurrent_handles_never_lose_increments() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();
        let workers = 4;
        let per_worker = 40;

        let handles = (0..workers)
            .map(|_| {
                let root = root.clone();
                std::thread::spawn(move || {
                    // Independent handle per thread, like separate processes.
                    let store = StateStore::open_dir(&root).expect("open");
                    for _ in 0..per_worker {
                        store
                            .update("shared", |record: &mut CounterRecord| record.count += 1)
                            .expect("update");
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("join");
        }

        let store = StateStore::open_dir(&root).expect("open");
        let record: CounterRecord = store.read_only("shared");
        assert_eq!(record.count, (workers * per_worker) as u64);
    }

    #[test]
    fn integration_lock_timeout_is_reported_while_another_handle_holds_the_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();
        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder_root = root.clone();
        let holder = std::thread::spawn(move || {
            let store = StateStore::open_dir(&holder_root).expect("open");
            store
                .update("busy", |record: &mut CounterRecord| {
                    locked_tx.send(()).expect("signal locked");
                    let _ = release_rx.recv_timeout(Duration::from_secs(5));
                    record.count += 1;
                })
                .expect("holder update");
        });

        locked_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("holder acquired lock");
        let contender = StateStore::open_dir(&root)
            .expect("open")
            .with_lock_timeout(Duration::from_millis(40));
        let error = contender
            .update("busy", |record: &mut CounterRecord| record.count += 1)
            .expect_err("lock should time out");
        assert!(error.is_lock_timeout(), "unexpected error: {error}");

        // Lock-free readers are not blocked by the writer.
        let snapshot: CounterRecord = contender.read_only("busy");
        assert_eq!(snapshot.count, 0);

        release_tx.send(()).expect("release");
        holder.join().expect("join");
        let record: CounterRecord = contender.read_only("busy");
        assert_eq!(record.count, 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn regression_async_update_waits_without_stalling_the_runtime() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();
        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder_root = root.clone();
        let holder = std::thread::spawn(move || {
            let store = StateStore::open_dir(&holder_root).expect("open");
            store
                .update("busy", |record: &mut CounterRecord| {
                    locked_tx.send(()).expect("signal locked");
                    let _ = release_rx.recv_timeout(Duration::from_secs(5));
                    record.count += 1;
                })
                .expect("holder update");
        });
        locked_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("holder acquired lock");

        let contender = StateStore::open_dir(&root)
            .expect("open")
            .with_lock_timeout(Duration::from_secs(2));
        // The releasing task only runs if the waiting update yields.
        let releaser = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            release_tx.send(()).expect("release");
        };
        let (updated, ()) = tokio::join!(
            contender.update_async("busy", |record: &mut CounterRecord| {
                record.count += 1;
                record.count
            }),
            releaser
        );
        assert_eq!(updated.expect("update after release"), 2);
        holder.join().expect("join");
    }
}
