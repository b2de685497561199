//! Background task layer over `ClientSession`.
//!
//! Every long operation runs on its own tokio task and hands back a
//! `TaskHandle`. Outcomes and progress are reported as `SessionEvent`s on
//! one channel, so a front end never blocks on the network.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::ClientSession;
use crate::delete::DeleteStats;
use crate::error::Result;
use crate::plan::Overrides;
use crate::sync::TransferStats;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected {
        entries: usize,
        mixed: BTreeSet<String>,
    },
    Progress {
        done: u64,
        total: u64,
    },
    Synced(TransferStats),
    Deleted(DeleteStats),
    Disconnected {
        reason: String,
    },
}

pub struct TaskHandle<T> {
    inner: JoinHandle<Result<T>>,
}

impl<T> TaskHandle<T> {
    fn new(inner: JoinHandle<Result<T>>) -> Self {
        Self { inner }
    }

    /// Cancel the task. An interrupted transfer drops the connection.
    pub fn abort(&self) {
        self.inner.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    pub async fn wait(self) -> Result<T> {
        self.inner.await?
    }
}

#[derive(Debug, Default)]
struct Flags {
    connected: bool,
    user_closed: bool,
}

#[derive(Clone)]
pub struct Worker {
    session: Arc<AsyncMutex<ClientSession>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    flags: Arc<Mutex<Flags>>,
}

impl Worker {
    pub fn new(mut session: ClientSession) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let flags = Arc::new(Mutex::new(Flags::default()));

        let notify_events = events.clone();
        let notify_flags = flags.clone();
        session.set_disconnect_notifier(move |reason| {
            notify_flags.lock().connected = false;
            let _ = notify_events.send(SessionEvent::Disconnected {
                reason: reason.to_string(),
            });
        });

        let worker = Self {
            session: Arc::new(AsyncMutex::new(session)),
            events,
            flags,
        };
        (worker, rx)
    }

    /// Shared access for reads (manifest, classification, plan building)
    pub fn session(&self) -> Arc<AsyncMutex<ClientSession>> {
        self.session.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.flags.lock().connected
    }

    pub fn connect(&self) -> TaskHandle<()> {
        let worker = self.clone();
        TaskHandle::new(tokio::spawn(async move {
            let mut session = worker.session.lock().await;
            worker.connect_locked(&mut session).await
        }))
    }

    async fn connect_locked(&self, session: &mut ClientSession) -> Result<()> {
        match session.connect().await {
            Ok(()) => {
                {
                    let mut flags = self.flags.lock();
                    flags.connected = true;
                    flags.user_closed = false;
                }
                let _ = self.events.send(SessionEvent::Connected {
                    entries: session.manifest().len(),
                    mixed: session.mixed_folders(&Overrides::new()),
                });
                Ok(())
            }
            Err(e) => {
                self.flags.lock().connected = false;
                let _ = self.events.send(SessionEvent::Disconnected {
                    reason: format!("connection failed: {}", e),
                });
                Err(e)
            }
        }
    }

    pub fn synchronize(&self, keys: Vec<String>, overrides: Overrides) -> TaskHandle<TransferStats> {
        let worker = self.clone();
        TaskHandle::new(tokio::spawn(async move {
            let guard = worker.session.clone().lock_owned().await;
            let mut in_flight = InFlight::new(guard);
            let events = worker.events.clone();
            let result = in_flight
                .session()
                .synchronize(keys.as_slice(), &overrides, |done, total| {
                    let _ = events.send(SessionEvent::Progress { done, total });
                })
                .await;
            in_flight.finish();
            let stats = result?;
            let _ = worker.events.send(SessionEvent::Synced(stats.clone()));
            Ok(stats)
        }))
    }

    pub fn delete(&self, keys: Vec<String>) -> TaskHandle<DeleteStats> {
        let worker = self.clone();
        TaskHandle::new(tokio::spawn(async move {
            let stats = {
                let session = worker.session.lock().await;
                session.delete_local(keys.as_slice()).await?
            };
            let _ = worker.events.send(SessionEvent::Deleted(stats));
            Ok(stats)
        }))
    }

    /// User-initiated disconnect; auto-reconnect stays off until the next
    /// explicit `connect`.
    pub async fn close(&self) {
        {
            let mut flags = self.flags.lock();
            flags.user_closed = true;
            flags.connected = false;
        }
        self.session.lock().await.close();
        let _ = self.events.send(SessionEvent::Disconnected {
            reason: "closed by user".to_string(),
        });
    }

    /// Retry `connect` every `interval` while the session is down and was
    /// not closed by the user. Finishes after the first successful reconnect;
    /// a busy session skips the tick.
    pub fn spawn_auto_reconnect(&self, interval: Duration) -> TaskHandle<()> {
        let worker = self.clone();
        TaskHandle::new(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                {
                    let flags = worker.flags.lock();
                    if flags.connected || flags.user_closed {
                        continue;
                    }
                }
                let Ok(mut session) = worker.session.try_lock() else {
                    debug!("session busy, skipping reconnect");
                    continue;
                };
                if session.is_connected() || session.closed_by_user() {
                    continue;
                }
                info!("reconnecting to {}", session.server_addr());
                match worker.connect_locked(&mut session).await {
                    Ok(()) => return Ok(()),
                    Err(e) => warn!("reconnect failed: {}", e),
                }
            }
        }))
    }
}

/// Holds the session for a running transfer. Dropped unfinished (task
/// aborted), it tears the connection down since the stream position is lost.
struct InFlight {
    guard: OwnedMutexGuard<ClientSession>,
    finished: bool,
}

impl InFlight {
    fn new(guard: OwnedMutexGuard<ClientSession>) -> Self {
        Self {
            guard,
            finished: false,
        }
    }

    fn session(&mut self) -> &mut ClientSession {
        &mut self.guard
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.finished && self.guard.is_connected() {
            self.guard.interrupt("sync cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::plan::LocalRoots;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_connect_failure_reports_disconnected() {
        let tmp = TempDir::new().unwrap();
        // Reserve a port, then free it so nothing listens there
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let session = ClientSession::new(
            addr.to_string(),
            LocalRoots::new(tmp.path().join("A"), tmp.path().join("M")),
        );
        let (worker, mut events) = Worker::new(session);
        assert!(worker.connect().wait().await.is_err());
        assert!(!worker.is_connected());
        match events.recv().await.unwrap() {
            SessionEvent::Disconnected { reason } => assert!(reason.contains("connection failed")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_synchronize_without_connection() {
        let tmp = TempDir::new().unwrap();
        let session = ClientSession::new(
            "127.0.0.1:1",
            LocalRoots::new(tmp.path().join("A"), tmp.path().join("M")),
        );
        let (worker, _events) = Worker::new(session);
        let err = worker
            .synchronize(vec!["1".into()], Overrides::new())
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotConnected));
    }

    #[tokio::test]
    async fn test_close_marks_user_closed() {
        let tmp = TempDir::new().unwrap();
        let session = ClientSession::new(
            "127.0.0.1:1",
            LocalRoots::new(tmp.path().join("A"), tmp.path().join("M")),
        );
        let (worker, mut events) = Worker::new(session);
        worker.close().await;
        assert!(worker.session().lock().await.closed_by_user());
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Disconnected {
                reason: "closed by user".into()
            }
        );
    }
}
