use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct WalWatcherConfig {
    pub poll_interval: Duration,
    /// WAL growth smaller than this is ignored.
    pub min_event_bytes: u64,
}

impl Default for WalWatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            min_event_bytes: 0,
        }
    }
}

/// Emitted when the watched database or its `-wal` sidecar changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEvent {
    pub db_path: PathBuf,
    pub bytes_added: u64,
    pub current_size: u64,
}

/// Stops and joins the polling thread on drop.
pub struct WalWatcherHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WalWatcherHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WalWatcherHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Fingerprint {
    len: u64,
    modified: Option<SystemTime>,
}

/// Polls `db_path` and `db_path-wal` and sends one event per observed change.
///
/// The receiver side decides what an event means; a lost or coalesced event
/// only delays detection until the next one or the fallback timer.
pub fn start_wal_watcher<P, T>(
    db_path: P,
    options: WalWatcherConfig,
    sender: UnboundedSender<T>,
) -> Result<WalWatcherHandle>
where
    P: AsRef<Path>,
    T: From<WalEvent> + Send + 'static,
{
    let db_path = db_path.as_ref().canonicalize().with_context(|| {
        format!(
            "failed to canonicalize database path {}",
            db_path.as_ref().display()
        )
    })?;
    if !db_path.is_file() {
        anyhow::bail!("database path {} is not a file", db_path.display());
    }

    let wal_path = wal_file_path(&db_path);
    let poll_interval = options.poll_interval;
    let min_event_bytes = options.min_event_bytes;
    let stop_flag = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop_flag);

    let handle = thread::Builder::new()
        .name("tosh-wal-watch".into())
        .spawn(move || {
            let mut last_wal = fingerprint(&wal_path).unwrap_or_default();
            let mut last_db = fingerprint(&db_path).unwrap_or_default();
            debug!(
                wal = %wal_path.display(),
                wal_len = last_wal.len,
                "wal watcher started"
            );
            while !thread_stop.load(Ordering::SeqCst) {
                let mut event = None;

                match fingerprint(&wal_path) {
                    Ok(current) => {
                        if current.len < last_wal.len {
                            debug!(
                                wal = %wal_path.display(),
                                prev = last_wal.len,
                                current = current.len,
                                "wal checkpointed; resetting baseline"
                            );
                        } else if current.len > last_wal.len {
                            let delta = current.len - last_wal.len;
                            if delta >= min_event_bytes {
                                event = Some(WalEvent {
                                    db_path: db_path.clone(),
                                    bytes_added: delta,
                                    current_size: current.len,
                                });
                            }
                        } else if current.modified != last_wal.modified && current.len > 0 {
                            // Frames rewritten in place after a restart of the WAL.
                            event = Some(WalEvent {
                                db_path: db_path.clone(),
                                bytes_added: 0,
                                current_size: current.len,
                            });
                        }
                        last_wal = current;
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        last_wal = Fingerprint::default();
                    }
                    Err(err) => {
                        warn!(
                            wal = %wal_path.display(),
                            error = %err,
                            "failed to read wal metadata"
                        );
                    }
                }

                match fingerprint(&db_path) {
                    Ok(current) => {
                        if current != last_db && event.is_none() {
                            event = Some(WalEvent {
                                db_path: db_path.clone(),
                                bytes_added: current.len.saturating_sub(last_db.len),
                                current_size: current.len,
                            });
                        }
                        last_db = current;
                    }
                    Err(err) => {
                        warn!(
                            db = %db_path.display(),
                            error = %err,
                            "failed to read database metadata"
                        );
                    }
                }

                if let Some(event) = event {
                    if sender.send(T::from(event)).is_err() {
                        debug!("wal watcher stopping because receiver closed");
                        break;
                    }
                }

                thread::sleep(poll_interval);
            }

            debug!(db = %db_path.display(), "wal watcher exiting");
        })
        .context("failed to spawn wal watcher thread")?;

    Ok(WalWatcherHandle {
        stop: stop_flag,
        thread: Some(handle),
    })
}

pub fn wal_file_path(db_path: &Path) -> PathBuf {
    let mut os_string = OsString::from(db_path.as_os_str());
    os_string.push("-wal");
    PathBuf::from(os_string)
}

fn fingerprint(path: &Path) -> std::io::Result<Fingerprint> {
    let metadata = std::fs::metadata(path)?;
    Ok(Fingerprint {
        len: metadata.len(),
        modified: metadata.modified().ok(),
    })
}
