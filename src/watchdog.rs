use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("directory does not exist: {0}")]
    MissingDirectory(PathBuf),
    #[error("failed to read {dir}: {source}")]
    ReadDir {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
pub enum WatchEvent {
    /// A file was created under a watched directory.
    Created(PathBuf),
    Error(WatchError),
}

/// Filesystem event capability. Native notification and polling
/// implementations are interchangeable behind this seam.
#[async_trait]
pub trait EventSource: Send {
    /// Register a directory. Files already present are not reported.
    fn add_watch(&mut self, dir: &Path) -> Result<(), WatchError>;

    /// Next event, or `None` when the source stream has ended.
    async fn next(&mut self) -> Option<WatchEvent>;
}

/// Polling event source: snapshots directory listings and diffs them on a
/// fixed interval.
pub struct PollingEventSource {
    interval: Duration,
    known: HashMap<PathBuf, HashSet<OsString>>,
    pending: VecDeque<WatchEvent>,
}

impl PollingEventSource {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            known: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    fn list(dir: &Path) -> Result<HashSet<OsString>, WatchError> {
        let entries = std::fs::read_dir(dir).map_err(|source| WatchError::ReadDir {
            dir: dir.to_path_buf(),
            source,
        })?;
        let mut names = HashSet::new();
        for entry in entries {
            let entry = entry.map_err(|source| WatchError::ReadDir {
                dir: dir.to_path_buf(),
                source,
            })?;
            names.insert(entry.file_name());
        }
        Ok(names)
    }

    fn scan(&mut self) {
        let dirs: Vec<PathBuf> = self.known.keys().cloned().collect();
        for dir in dirs {
            match Self::list(&dir) {
                Ok(current) => {
                    let seen = self.known.get_mut(&dir).expect("watched dir entry");
                    for name in current.difference(seen) {
                        self.pending.push_back(WatchEvent::Created(dir.join(name)));
                    }
                    *seen = current;
                }
                Err(err) => self.pending.push_back(WatchEvent::Error(err)),
            }
        }
    }
}

#[async_trait]
impl EventSource for PollingEventSource {
    fn add_watch(&mut self, dir: &Path) -> Result<(), WatchError> {
        if !dir.is_dir() {
            return Err(WatchError::MissingDirectory(dir.to_path_buf()));
        }
        // prime the snapshot so pre-existing files are never reported
        let initial = Self::list(dir)?;
        self.known.insert(dir.to_path_buf(), initial);
        Ok(())
    }

    async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            tokio::time::sleep(self.interval).await;
            self.scan();
        }
    }
}

pub type PathFilter = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// Watches dynamically registered directories for newly created files and
/// forwards accepted paths to a notification channel.
///
/// The notify channel is closed when the watch lifetime is cancelled or the
/// event source ends. Sends may block on a slow consumer; that is the
/// accepted backpressure point.
pub struct WatchDog {
    dir_tx: mpsc::UnboundedSender<PathBuf>,
    task: JoinHandle<()>,
}

impl WatchDog {
    pub fn spawn<S>(
        mut source: S,
        token: CancellationToken,
        notify_tx: mpsc::Sender<PathBuf>,
        filter: Option<PathFilter>,
    ) -> Self
    where
        S: EventSource + 'static,
    {
        let (dir_tx, mut dir_rx) = mpsc::unbounded_channel::<PathBuf>();
        let task = tokio::spawn(async move {
            enum Step {
                Cancelled,
                Add(Option<PathBuf>),
                Event(Option<WatchEvent>),
            }
            let mut accepting_dirs = true;
            loop {
                let step = tokio::select! {
                    _ = token.cancelled() => Step::Cancelled,
                    dir = dir_rx.recv(), if accepting_dirs => Step::Add(dir),
                    event = source.next() => Step::Event(event),
                };
                match step {
                    Step::Cancelled => return,
                    // handle dropped: registered dirs stay watched until the
                    // lifetime token is cancelled
                    Step::Add(None) => accepting_dirs = false,
                    Step::Add(Some(dir)) => match source.add_watch(&dir) {
                        Ok(()) => debug!(dir = %dir.display(), "watching directory"),
                        Err(err) => error!(error = %err, "failed to add watch directory"),
                    },
                    Step::Event(Some(WatchEvent::Created(path))) => {
                        let accepted = filter.as_ref().is_none_or(|f| f(&path));
                        if !accepted {
                            debug!(file = %path.display(), "file ignored by filter");
                            continue;
                        }
                        if notify_tx.send(path).await.is_err() {
                            // consumer went away, nothing left to do
                            return;
                        }
                    }
                    Step::Event(Some(WatchEvent::Error(err))) => {
                        warn!(error = %err, "watch error");
                    }
                    Step::Event(None) => {
                        debug!("event source ended");
                        return;
                    }
                }
            }
        });
        Self { dir_tx, task }
    }

    /// Register a directory for watching. Validation happens inside the
    /// watch task; a missing directory is logged, not fatal, and adding the
    /// same directory twice is harmless.
    pub fn add_dir(&self, dir: impl Into<PathBuf>) {
        let _ = self.dir_tx.send(dir.into());
    }

    /// Wait for the watch loop to exit (after cancelling its token).
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll_source() -> PollingEventSource {
        PollingEventSource::new(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn created_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("preexisting"), b"x").unwrap();

        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let dog = WatchDog::spawn(poll_source(), token.clone(), tx, None);
        dog.add_dir(dir.path());
        tokio::time::sleep(Duration::from_millis(60)).await;

        std::fs::write(dir.path().join("fresh.bin"), b"y").unwrap();
        let path = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event within poll bound")
            .expect("channel open");
        assert_eq!(path.file_name().unwrap(), "fresh.bin");

        token.cancel();
        dog.join().await;
    }

    #[tokio::test]
    async fn filtered_file_never_appears() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let filter: PathFilter = Arc::new(|p: &Path| {
            p.file_name().is_some_and(|n| n != "README.txt")
        });
        let dog = WatchDog::spawn(poll_source(), token.clone(), tx, Some(filter));
        dog.add_dir(dir.path());
        tokio::time::sleep(Duration::from_millis(60)).await;

        std::fs::write(dir.path().join("README.txt"), b"not a crash").unwrap();
        std::fs::write(dir.path().join("crash-000"), b"boom").unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.file_name().unwrap(), "crash-000");
        // nothing else may arrive: the README was excluded
        let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(extra.is_err());

        token.cancel();
        dog.join().await;
    }

    #[tokio::test]
    async fn watching_outlives_a_dropped_handle() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let dog = WatchDog::spawn(poll_source(), token.clone(), tx, None);
        dog.add_dir(dir.path());
        tokio::time::sleep(Duration::from_millis(60)).await;

        // registration is done, the registering task lets go of the handle
        drop(dog);

        std::fs::write(dir.path().join("late.bin"), b"y").unwrap();
        let path = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event within poll bound")
            .expect("channel open");
        assert_eq!(path.file_name().unwrap(), "late.bin");

        token.cancel();
    }

    #[tokio::test]
    async fn missing_directory_is_logged_not_fatal() {
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let dog = WatchDog::spawn(poll_source(), token.clone(), tx, None);
        dog.add_dir("/definitely/not/here");

        let dir = tempfile::tempdir().unwrap();
        dog.add_dir(dir.path());
        tokio::time::sleep(Duration::from_millis(60)).await;
        std::fs::write(dir.path().join("after"), b"z").unwrap();
        let path = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "after");

        token.cancel();
        dog.join().await;
    }
}
