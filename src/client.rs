//! Client session: connection, manifest, classification and synchronization
//!
//! State: `Disconnected -> Connected -> Planned -> Syncing -> Connected`,
//! back to `Disconnected` on `close()` or a lost connection.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

use crate::delete::{delete_local, DeleteStats};
use crate::error::{Result, SyncError};
use crate::manifest::Manifest;
use crate::plan::{
    build_plan, Classification, Destination, DestinationResolver, LocalRoots, Overrides, PlanItem,
};
use crate::protocol::{timeouts::CONNECT_MS, Message};
use crate::protocol_core::{receive_file, receive_message, send_message};
use crate::sync::{evaluate, expand_selection, initial_stats, EvaluatedFile, TransferStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connected,
    Planned,
    Syncing,
}

pub type DisconnectNotifier = Arc<dyn Fn(&str) + Send + Sync>;

pub struct ClientSession {
    server_addr: String,
    roots: LocalRoots,
    stream: Option<TcpStream>,
    manifest: Manifest,
    classification: Classification,
    state: SessionState,
    user_closed: bool,
    on_disconnect: DisconnectNotifier,
}

impl ClientSession {
    pub fn new(server_addr: impl Into<String>, roots: LocalRoots) -> Self {
        Self {
            server_addr: server_addr.into(),
            roots,
            stream: None,
            manifest: Manifest::new(),
            classification: Classification::default(),
            state: SessionState::Disconnected,
            user_closed: false,
            on_disconnect: Arc::new(|_| {}),
        }
    }

    pub fn set_disconnect_notifier<F>(&mut self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_disconnect = Arc::new(f);
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    pub fn roots(&self) -> &LocalRoots {
        &self.roots
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// True when the last disconnect came from `close()`
    pub fn closed_by_user(&self) -> bool {
        self.user_closed
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn classification(&self) -> &Classification {
        &self.classification
    }

    /// Connect (dropping any previous connection), receive the INDEX and
    /// classify every folder it names.
    pub async fn connect(&mut self) -> Result<()> {
        self.drop_connection();
        self.user_closed = false;

        let result = self.open_stream().await;

        match result {
            Ok((stream, manifest)) => {
                info!("index received: {} entries", manifest.len());
                self.classification = Classification::classify(&manifest);
                self.manifest = manifest;
                self.stream = Some(stream);
                self.state = SessionState::Connected;
                Ok(())
            }
            Err(e) => {
                error!("connection to {} failed: {}", self.server_addr, e);
                self.manifest = Manifest::new();
                self.classification = Classification::default();
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn open_stream(&self) -> Result<(TcpStream, Manifest)> {
        let connect = TcpStream::connect(self.server_addr.as_str());
        let mut stream = match timeout(Duration::from_millis(CONNECT_MS), connect).await {
            Ok(res) => res?,
            Err(_) => {
                return Err(SyncError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out ({} ms)", self.server_addr, CONNECT_MS),
                )))
            }
        };
        let _ = stream.set_nodelay(true);
        info!("connected to {}", self.server_addr);

        match receive_message(&mut stream).await? {
            Message::Index { entries } => Ok((stream, entries)),
            other => Err(SyncError::Protocol(format!(
                "expected INDEX, got {}",
                other.action()
            ))),
        }
    }

    /// User-initiated disconnect
    pub fn close(&mut self) {
        self.user_closed = true;
        self.drop_connection();
    }

    fn drop_connection(&mut self) {
        if self.stream.take().is_some() {
            info!("disconnected from {}", self.server_addr);
        }
        self.state = SessionState::Disconnected;
    }

    /// Drop a connection whose stream can no longer be trusted and notify.
    pub fn interrupt(&mut self, reason: &str) {
        self.lost_connection(reason);
    }

    fn lost_connection(&mut self, reason: &str) {
        self.drop_connection();
        (self.on_disconnect)(reason);
    }

    pub fn folder_target(&self, folder_id: &str, overrides: &Overrides) -> Destination {
        self.classification.target(folder_id, overrides)
    }

    pub fn mixed_folders(&self, overrides: &Overrides) -> BTreeSet<String> {
        self.classification.mixed_folders(overrides)
    }

    pub fn resolve_mixed<R>(&self, overrides: &Overrides, resolver: &R) -> Overrides
    where
        R: DestinationResolver + ?Sized,
    {
        self.classification.resolve_mixed(overrides, resolver)
    }

    /// Full reconciliation plan against the local roots. Hashing runs on the
    /// blocking pool.
    pub async fn build_plan(&mut self, overrides: &Overrides) -> Result<Vec<PlanItem>> {
        let manifest = self.manifest.clone();
        let classification = self.classification.clone();
        let overrides = overrides.clone();
        let roots = self.roots.clone();
        let plan = tokio::task::spawn_blocking(move || {
            build_plan(&manifest, &classification, &overrides, &roots)
        })
        .await?;
        if self.is_connected() {
            self.state = SessionState::Planned;
        }
        Ok(plan)
    }

    /// Transfer the NEW/UPDATE files among `keys`.
    ///
    /// A connection failure part-way closes the session, fires the
    /// disconnect notifier and returns the statistics gathered so far.
    pub async fn synchronize<S, P>(
        &mut self,
        keys: &[S],
        overrides: &Overrides,
        mut progress: P,
    ) -> Result<TransferStats>
    where
        S: AsRef<str>,
        P: FnMut(u64, u64),
    {
        if self.stream.is_none() {
            error!("synchronize called while not connected");
            return Err(SyncError::NotConnected);
        }

        let selected = expand_selection(
            keys,
            &self.manifest,
            &self.classification,
            overrides,
            &self.roots,
        );
        let evaluated = tokio::task::spawn_blocking(move || evaluate(selected)).await?;
        let mut stats = initial_stats(&evaluated);

        let requested: Vec<EvaluatedFile> = evaluated
            .into_iter()
            .filter(|e| e.action.needs_transfer())
            .collect();
        if requested.is_empty() {
            info!("nothing to transfer ({} selected, all up to date)", stats.selected_total);
            return Ok(stats);
        }

        self.state = SessionState::Syncing;
        let started = Instant::now();
        let outcome = self.transfer(&requested, &mut stats, &mut progress).await;
        stats.seconds = started.elapsed().as_secs_f64();

        match outcome {
            Ok(()) => {
                self.state = SessionState::Connected;
                info!(
                    "sync finished: {} files, {} bytes in {:.1}s",
                    stats.transferred_files, stats.bytes, stats.seconds
                );
            }
            Err(e) => {
                error!("connection lost during sync: {}", e);
                self.lost_connection("sync interrupted: connection lost");
            }
        }
        Ok(stats)
    }

    async fn transfer<P>(
        &mut self,
        requested: &[EvaluatedFile],
        stats: &mut TransferStats,
        progress: &mut P,
    ) -> Result<()>
    where
        P: FnMut(u64, u64),
    {
        let stream = self.stream.as_mut().ok_or(SyncError::NotConnected)?;

        let files: Manifest = requested.iter().map(|e| e.file.descriptor.clone()).collect();
        send_message(stream, &Message::RequestFiles { files }).await?;

        // Correlate by identity key, never by position
        let by_key: HashMap<String, &EvaluatedFile> = requested
            .iter()
            .map(|e| (e.file.descriptor.key(), e))
            .collect();

        loop {
            // A malformed frame may be a FILE header whose body is still on
            // the wire, so only an unknown action is safe to skip here
            let msg = match receive_message(stream).await {
                Ok(msg) => msg,
                Err(SyncError::UnknownAction(action)) => {
                    warn!("ignoring unknown action {} from host", action);
                    continue;
                }
                Err(e) => return Err(e),
            };
            match msg {
                Message::File {
                    rel_folder, name, ..
                } => {
                    let key = crate::manifest::identity_key(&rel_folder, &name);
                    let Some(entry) = by_key.get(&key) else {
                        return Err(SyncError::Protocol(format!("host sent unrequested file {}", key)));
                    };
                    let written = receive_file(stream, &entry.file.target).await?;
                    stats.add_file(entry.file.dest, written);
                    progress(stats.transferred_files, stats.to_transfer);
                    info!("received {} -> {}", key, entry.file.target.display());
                }
                Message::Done => return Ok(()),
                other => {
                    warn!("unexpected {} during transfer", other.action());
                    return Err(SyncError::Protocol(format!(
                        "unexpected {} during transfer",
                        other.action()
                    )));
                }
            }
        }
    }

    /// Remove local folders/files named by deletion or plain plan keys.
    pub async fn delete_local<S>(&self, keys: &[S]) -> Result<DeleteStats>
    where
        S: AsRef<str>,
    {
        let roots = self.roots.clone();
        let keys: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();
        let stats = tokio::task::spawn_blocking(move || delete_local(&roots, &keys)).await?;
        Ok(stats)
    }
}
