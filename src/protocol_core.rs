//! Framing primitives shared by host and client
//!
//! Messages: `len: u32 BE | JSON payload`.
//! Raw files: `len: u64 BE | bytes`, streamed in bounded chunks.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::protocol::{action, Message, FILE_CHUNK_SIZE, MAX_FRAME_SIZE};

/// Validate frame payload size against protocol::MAX_FRAME_SIZE
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        return Err(SyncError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

/// Build message frame header (4 bytes, big-endian length)
pub fn build_frame_header(payload_len: u32) -> [u8; 4] {
    payload_len.to_be_bytes()
}

/// Parse message frame header, returns the payload length
pub fn parse_frame_header(header: &[u8; 4]) -> usize {
    u32::from_be_bytes(*header) as usize
}

fn read_error(e: std::io::Error) -> SyncError {
    match e.kind() {
        ErrorKind::UnexpectedEof => SyncError::ConnectionClosed,
        _ => SyncError::Io(e),
    }
}

fn write_error(e: std::io::Error) -> SyncError {
    match e.kind() {
        ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::WriteZero
        | ErrorKind::UnexpectedEof => {
            SyncError::Protocol(format!("stream closed during write: {}", e))
        }
        _ => SyncError::Io(e),
    }
}

/// Serialize `value` as JSON and write it as one length-prefixed frame.
pub async fn send_json<W, T>(stream: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(value)?;
    validate_frame_size(payload.len())?;
    let header = build_frame_header(payload.len() as u32);
    stream.write_all(&header).await.map_err(write_error)?;
    stream.write_all(&payload).await.map_err(write_error)?;
    stream.flush().await.map_err(write_error)?;
    Ok(())
}

async fn receive_payload<R>(stream: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.map_err(read_error)?;
    let len = parse_frame_header(&header);
    validate_frame_size(len)?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut payload).await.map_err(read_error)?;
    }
    Ok(payload)
}

/// Read one length-prefixed frame and decode its JSON payload.
pub async fn receive_json<R, T>(stream: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let payload = receive_payload(stream).await?;
    Ok(serde_json::from_slice(&payload)?)
}

pub async fn send_message<W>(stream: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    send_json(stream, msg).await?;
    debug!(action = msg.action(), "sent message");
    Ok(())
}

/// Read one frame and decode it as a [`Message`].
///
/// An unknown `action` tag yields [`SyncError::UnknownAction`] only after the
/// whole frame has been consumed, so the stream stays usable.
pub async fn receive_message<R>(stream: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let payload = receive_payload(stream).await?;
    decode_message(&payload)
}

/// Dispatch on the `action` tag of a JSON payload.
pub fn decode_message(payload: &[u8]) -> Result<Message> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| SyncError::InvalidMessage(format!("payload is not valid JSON: {}", e)))?;
    let tag = match value.get("action") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => {
            return Err(SyncError::InvalidMessage(format!(
                "action tag is not a string: {}",
                other
            )))
        }
        None => return Err(SyncError::InvalidMessage("message has no action tag".into())),
    };
    if !action::ALL.contains(&tag.as_str()) {
        return Err(SyncError::UnknownAction(tag));
    }
    serde_json::from_value(value)
        .map_err(|e| SyncError::InvalidMessage(format!("malformed {} message: {}", tag, e)))
}

/// Write the file's current size as u64 BE, then its bytes in chunks.
/// Returns the number of body bytes sent.
pub async fn send_file<W>(stream: &mut W, path: &Path) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    send_open_file(stream, file, size, path).await
}

/// Stream an already opened file whose size was taken at open time.
/// `path` is only used for messages.
pub async fn send_open_file<W>(
    stream: &mut W,
    mut file: tokio::fs::File,
    size: u64,
    path: &Path,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    stream
        .write_all(&size.to_be_bytes())
        .await
        .map_err(write_error)?;

    let mut buf = vec![0u8; FILE_CHUNK_SIZE];
    let mut sent = 0u64;
    while sent < size {
        let want = (size - sent).min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            // The peer expects `size` bytes; anything else desynchronizes the stream
            return Err(SyncError::Protocol(format!(
                "{} shrank during transfer: sent {} of {} bytes",
                path.display(),
                sent,
                size
            )));
        }
        stream.write_all(&buf[..n]).await.map_err(write_error)?;
        sent += n as u64;
    }
    stream.flush().await.map_err(write_error)?;
    debug!("sent file {} ({} B)", path.display(), sent);
    Ok(sent)
}

/// Read a u64 BE size, then write up to that many bytes to `dest`.
///
/// Parent directories are created as needed. If the stream ends early the
/// file is left truncated and the short count is returned; the caller sees
/// the closed stream on its next read.
pub async fn receive_file<R>(stream: &mut R, dest: &Path) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await.map_err(read_error)?;
    let size = u64::from_be_bytes(header);

    ensure_parent_exists(dest).await?;
    let mut file = tokio::fs::File::create(dest).await?;

    let mut buf = vec![0u8; FILE_CHUNK_SIZE];
    let mut written = 0u64;
    while written < size {
        let want = (size - written).min(buf.len() as u64) as usize;
        let n = stream.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        written += n as u64;
    }
    file.flush().await?;

    if written < size {
        warn!(
            "incomplete transfer for {}: {} of {} bytes",
            dest.display(),
            written,
            size
        );
    } else {
        debug!("received file {} ({} B)", dest.display(), written);
    }
    Ok(written)
}

/// Join a posix-style relative path under `root`, rejecting anything that
/// could leave it: absolute paths, parent components, NUL bytes.
pub fn join_under_root(root: &Path, rel: &str) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if rel.contains('\0') {
        return Err(SyncError::InvalidKey("path contains NUL byte".into()));
    }

    let mut safe = PathBuf::new();
    for component in Path::new(rel).components() {
        match component {
            CurDir => {}
            Normal(s) => {
                // On Windows, reject components with ':' (ADS defense)
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    return Err(SyncError::InvalidKey(format!(
                        "path component contains colon: {}",
                        rel
                    )));
                }
                safe.push(s);
            }
            ParentDir | RootDir | Prefix(_) => {
                return Err(SyncError::InvalidKey(format!(
                    "path contains disallowed component: {}",
                    rel
                )));
            }
        }
    }
    if safe.as_os_str().is_empty() {
        return Err(SyncError::InvalidKey(format!("empty path: {:?}", rel)));
    }
    Ok(root.join(safe))
}

/// Create parent directory if needed
pub async fn ensure_parent_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}
