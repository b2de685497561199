//! Host side: accept loop and per-connection handler.
//!
//! Each connection gets a fresh manifest as its INDEX, then any number of
//! REQUEST_FILES batches, each answered by FILE header/body pairs and DONE.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::fs_enum::is_folder_id;
use crate::manifest::{build_manifest, Manifest};
use crate::protocol::Message;
use crate::protocol_core::{join_under_root, receive_message, send_message, send_open_file};

pub struct Server {
    listener: TcpListener,
    root: PathBuf,
}

impl Server {
    pub async fn bind(addr: &str, root: impl Into<PathBuf>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let root = root.into();
        info!(
            "host listening on {} root={}",
            listener.local_addr()?,
            root.display()
        );
        Ok(Self { listener, root })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` flips to true (or its sender is dropped).
    /// Connections already accepted keep running on their own tasks.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("accept failed: {}", e);
                            continue;
                        }
                    };
                    let span = info_span!("session", %peer, id = %Uuid::new_v4());
                    let root = self.root.clone();
                    tokio::spawn(handle_client(stream, root).instrument(span));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("host shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn handle_client(mut stream: TcpStream, root: PathBuf) {
    let _ = stream.set_nodelay(true);
    info!("client connected");

    let scan_root = root.clone();
    let manifest = match tokio::task::spawn_blocking(move || build_manifest(&scan_root)).await {
        Ok(m) => m,
        Err(e) => {
            error!("manifest scan failed: {}", e);
            return;
        }
    };
    if let Err(e) = send_message(&mut stream, &Message::Index { entries: manifest }).await {
        warn!("could not send index: {}", e);
        return;
    }

    loop {
        match receive_message(&mut stream).await {
            Ok(Message::RequestFiles { files }) => {
                if let Err(e) = serve_files(&mut stream, &root, &files).await {
                    warn!("client disconnected: {}", e);
                    return;
                }
            }
            Ok(other) => warn!("ignoring {} from client", other.action()),
            Err(e) if !e.is_fatal() => warn!("ignoring message: {}", e),
            Err(SyncError::ConnectionClosed) => {
                info!("client disconnected");
                return;
            }
            Err(e) => {
                warn!("client disconnected: {}", e);
                return;
            }
        }
    }
}

/// Stream every requested file that still exists, then DONE. Entries that
/// are invalid or unreadable are skipped before their header goes out.
async fn serve_files(stream: &mut TcpStream, root: &Path, files: &Manifest) -> Result<()> {
    info!("client requested {} files", files.len());
    let mut sent = 0usize;

    for desc in files.descriptors() {
        if !is_folder_id(&desc.folder_id) {
            warn!("skipping {}: not a numbered folder", desc.key());
            continue;
        }
        let path = match join_under_root(&root.join(&desc.folder_id), &desc.relative_path) {
            Ok(p) => p,
            Err(e) => {
                warn!("skipping {}: {}", desc.key(), e);
                continue;
            }
        };

        let (file, size) = match open_regular(&path).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("skipping {}: {}", desc.key(), e);
                continue;
            }
        };

        let header = Message::File {
            rel_folder: desc.folder_id.clone(),
            name: desc.relative_path.clone(),
            size,
        };
        send_message(stream, &header).await?;
        send_open_file(stream, file, size, &path).await?;
        sent += 1;
    }

    send_message(stream, &Message::Done).await?;
    info!("sent {} of {} requested files", sent, files.len());
    Ok(())
}

async fn open_regular(path: &Path) -> std::io::Result<(tokio::fs::File, u64)> {
    let file = tokio::fs::File::open(path).await?;
    let metadata = file.metadata().await?;
    if !metadata.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a regular file",
        ));
    }
    Ok((file, metadata.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{FileDescriptor, FileKind};
    use crate::protocol_core::{build_frame_header, receive_file};
    use std::fs;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    async fn start(root: &Path) -> (SocketAddr, watch::Sender<bool>) {
        let server = Server::bind("127.0.0.1:0", root).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(server.run(rx));
        (addr, tx)
    }

    fn request(folder: &str, name: &str) -> FileDescriptor {
        FileDescriptor {
            folder_id: folder.into(),
            relative_path: name.into(),
            size: 0,
            mtime: 0.0,
            sha256: String::new(),
            kind: FileKind::from_path(name),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_index_then_files_skipping_bad_entries() {
        let host = TempDir::new().unwrap();
        fs::create_dir_all(host.path().join("42/sub")).unwrap();
        fs::write(host.path().join("42/sub/a.crp"), b"asset").unwrap();
        fs::write(host.path().join("42/b.txt"), b"bee").unwrap();
        fs::write(host.path().join("secret"), b"nope").unwrap();

        let (addr, _shutdown) = start(host.path()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let entries = match receive_message(&mut stream).await.unwrap() {
            Message::Index { entries } => entries,
            other => panic!("expected INDEX, got {}", other.action()),
        };
        assert_eq!(entries.len(), 2);

        let files: Manifest = vec![
            request("42", "sub/a.crp"),
            request("42", "missing.txt"),
            request("42", "../secret"),
            request("abc", "x"),
        ]
        .into_iter()
        .collect();
        send_message(&mut stream, &Message::RequestFiles { files })
            .await
            .unwrap();

        let dest = TempDir::new().unwrap();
        match receive_message(&mut stream).await.unwrap() {
            Message::File { rel_folder, name, size } => {
                assert_eq!(rel_folder, "42");
                assert_eq!(name, "sub/a.crp");
                assert_eq!(size, 5);
            }
            other => panic!("expected FILE, got {}", other.action()),
        }
        let out = dest.path().join("a.crp");
        assert_eq!(receive_file(&mut stream, &out).await.unwrap(), 5);
        assert_eq!(fs::read(&out).unwrap(), b"asset");
        assert!(matches!(
            receive_message(&mut stream).await.unwrap(),
            Message::Done
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_action_keeps_session_open() {
        let host = TempDir::new().unwrap();
        fs::create_dir_all(host.path().join("1")).unwrap();
        fs::write(host.path().join("1/m.dll"), b"mod").unwrap();

        let (addr, _shutdown) = start(host.path()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let entries = match receive_message(&mut stream).await.unwrap() {
            Message::Index { entries } => entries,
            other => panic!("expected INDEX, got {}", other.action()),
        };

        let bogus = br#"{"action":"PING","n":1}"#;
        stream
            .write_all(&build_frame_header(bogus.len() as u32))
            .await
            .unwrap();
        stream.write_all(bogus).await.unwrap();

        send_message(&mut stream, &Message::RequestFiles { files: entries })
            .await
            .unwrap();
        assert!(matches!(
            receive_message(&mut stream).await.unwrap(),
            Message::File { .. }
        ));
        let dest = TempDir::new().unwrap();
        receive_file(&mut stream, &dest.path().join("m.dll"))
            .await
            .unwrap();
        assert!(matches!(
            receive_message(&mut stream).await.unwrap(),
            Message::Done
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_request_gets_done() {
        let host = TempDir::new().unwrap();
        let (addr, _shutdown) = start(host.path()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        match receive_message(&mut stream).await.unwrap() {
            Message::Index { entries } => assert!(entries.is_empty()),
            other => panic!("expected INDEX, got {}", other.action()),
        }
        send_message(
            &mut stream,
            &Message::RequestFiles {
                files: Manifest::new(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(
            receive_message(&mut stream).await.unwrap(),
            Message::Done
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_stops_accept_loop() {
        let host = TempDir::new().unwrap();
        let server = Server::bind("127.0.0.1:0", host.path()).await.unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(server.run(rx));
        tx.send(true).unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
