//! Newline-delimited JSON framing over a byte channel.
//!
//! The client side writes `Request` frames and runs a reader task that feeds every
//! decoded `Response` to the [`Correlator`]. Losing the inbound side terminates every
//! in-flight request with `TransportUnavailable`.

use std::{
    ffi::OsStr,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::Mutex,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    correlator::Correlator,
    errors::Error,
    protocol::{ErrorCode, Request, WireError},
    utils::truncate_text,
    Result,
};

/// Serialize one frame, newline included.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode one line. Blank lines yield `None`.
pub fn decode_frame<T: DeserializeOwned>(line: &str) -> Result<Option<T>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line)
        .map(Some)
        .map_err(|e| Error::Protocol(format!("undecodable frame: {e}: {}", truncate_text(line, 200))))
}

/// Read the next line as text. Lines that are not valid UTF-8 are logged and skipped;
/// `None` means end of input.
pub async fn read_frame_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    loop {
        buf.clear();
        if reader.read_until(b'\n', buf).await? == 0 {
            return Ok(None);
        }
        match std::str::from_utf8(buf) {
            Ok(line) => return Ok(Some(line.to_string())),
            Err(e) => warn!(error = %e, len = buf.len(), "skipping frame that is not UTF-8"),
        }
    }
}

/// Writes a frame and flushes it.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let bytes = encode_frame(frame)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Outbound half of the protocol channel.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> Result<()>;

    /// `false` once the channel has been lost.
    fn is_open(&self) -> bool;
}

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct NdjsonTransport {
    writer: Mutex<BoxWriter>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    // Keeps a spawned worker alive; it is killed when the transport is dropped.
    _child: Option<Child>,
}

impl NdjsonTransport {
    pub fn new<R, W>(reader: R, writer: W, correlator: Arc<Correlator>) -> Self
    where
        R: AsyncBufRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_responses(reader, correlator, Arc::clone(&closed)));
        Self {
            writer: Mutex::new(Box::new(writer)),
            closed,
            reader,
            _child: None,
        }
    }

    /// Launch a worker process and talk to it over its stdin/stdout.
    /// The worker's stderr is inherited so its logs stay visible.
    pub fn spawn_worker<S>(program: S, args: &[String], correlator: Arc<Correlator>) -> Result<Self>
    where
        S: AsRef<OsStr>,
    {
        let program = program.as_ref();
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::TransportUnavailable(format!(
                    "failed to start worker {}: {e}",
                    program.to_string_lossy()
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::TransportUnavailable("worker stdin was not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::TransportUnavailable("worker stdout was not captured".into()))?;
        info!(worker = %program.to_string_lossy(), pid = ?child.id(), "worker started");

        let mut transport = Self::new(BufReader::new(stdout), stdin, correlator);
        transport._child = Some(child);
        Ok(transport)
    }
}

#[async_trait]
impl Transport for NdjsonTransport {
    async fn send(&self, request: Request) -> Result<()> {
        if !self.is_open() {
            return Err(Error::TransportUnavailable("channel closed".to_string()));
        }
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &request)
            .await
            .map_err(|e| match e {
                Error::Io(io) => Error::TransportUnavailable(format!("write failed: {io}")),
                other => other,
            })?;
        debug!(request_id = %request.id, kind = ?request.kind, "request sent");
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for NdjsonTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_responses<R>(mut reader: R, correlator: Arc<Correlator>, closed: Arc<AtomicBool>)
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let reason = loop {
        match read_frame_line(&mut reader, &mut buf).await {
            Ok(Some(line)) => match decode_frame(&line) {
                Ok(Some(response)) => {
                    correlator.dispatch(response);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "skipping inbound frame"),
            },
            Ok(None) => break "peer closed the channel".to_string(),
            Err(e) => break format!("read failed: {e}"),
        }
    };

    closed.store(true, Ordering::SeqCst);
    let failed = correlator.fail_all(WireError::new(ErrorCode::TransportUnavailable, reason.clone()));
    warn!(%reason, failed, "transport closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::types::ConversationMessage,
        protocol::{RequestKind, Response},
        stream::MessageStream,
    };
    use tokio::io::{duplex, AsyncBufReadExt, BufReader, DuplexStream};

    /// A transport whose peer is driven by the test.
    struct Peer {
        requests: tokio::io::Lines<BufReader<DuplexStream>>,
        responses: DuplexStream,
    }

    fn connect() -> (NdjsonTransport, Arc<Correlator>, Peer) {
        let correlator = Arc::new(Correlator::new());
        let (client_out, peer_in) = duplex(64 * 1024);
        let (peer_out, client_in) = duplex(64 * 1024);
        let transport =
            NdjsonTransport::new(BufReader::new(client_in), client_out, Arc::clone(&correlator));
        let peer = Peer {
            requests: BufReader::new(peer_in).lines(),
            responses: peer_out,
        };
        (transport, correlator, peer)
    }

    #[tokio::test]
    async fn requests_are_framed_and_responses_routed() {
        let (transport, correlator, mut peer) = connect();
        let request = Request::new(RequestKind::Query, "hello");
        let id = request.id.clone();
        let mut stream = MessageStream::open(&correlator, id.clone(), None);
        transport.send(request).await.unwrap();

        let line = peer.requests.next_line().await.unwrap().unwrap();
        let seen: Request = decode_frame(&line).unwrap().unwrap();
        assert_eq!(seen.id, id);
        assert_eq!(seen.prompt, "hello");

        let reply = Response::message(id.clone(), &ConversationMessage::assistant("hi")).unwrap();
        write_frame(&mut peer.responses, &reply).await.unwrap();
        write_frame(&mut peer.responses, &Response::complete(id)).await.unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap().content, "hi");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn garbage_lines_are_skipped() {
        let (_transport, correlator, mut peer) = connect();
        let mut stream = MessageStream::open(&correlator, "r1".into(), None);

        peer.responses.write_all(b"not json\n\n").await.unwrap();
        write_frame(&mut peer.responses, &Response::complete("r1".into()))
            .await
            .unwrap();

        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn invalid_utf8_lines_are_skipped_without_closing() {
        let (transport, correlator, mut peer) = connect();
        let mut stream = MessageStream::open(&correlator, "r1".into(), None);

        peer.responses.write_all(b"\xff\xfe garbage\n").await.unwrap();
        let reply = Response::message("r1".into(), &ConversationMessage::assistant("ok")).unwrap();
        write_frame(&mut peer.responses, &reply).await.unwrap();
        write_frame(&mut peer.responses, &Response::complete("r1".into()))
            .await
            .unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap().content, "ok");
        assert!(stream.next().await.is_none());
        assert!(transport.is_open());
    }

    #[tokio::test]
    async fn frame_lines_survive_a_missing_final_newline() {
        let mut input: &[u8] = b"\xc3\x28\n{\"a\":1}\nlast";
        let mut buf = Vec::new();
        assert_eq!(
            read_frame_line(&mut input, &mut buf).await.unwrap().as_deref(),
            Some("{\"a\":1}\n")
        );
        assert_eq!(
            read_frame_line(&mut input, &mut buf).await.unwrap().as_deref(),
            Some("last")
        );
        assert!(read_frame_line(&mut input, &mut buf).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn losing_the_peer_fails_in_flight_requests_and_later_sends() {
        let (transport, correlator, peer) = connect();
        let mut stream = MessageStream::open(&correlator, "r1".into(), None);

        drop(peer);

        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, Error::TransportUnavailable(_)));
        assert!(correlator.is_empty());
        assert!(!transport.is_open());

        let err = transport
            .send(Request::new(RequestKind::Query, "late"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransportUnavailable(_)));
    }

    #[test]
    fn frames_end_with_a_newline_and_blank_lines_decode_to_nothing() {
        let bytes = encode_frame(&Response::complete("r1".into())).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert!(decode_frame::<Response>("   ").unwrap().is_none());
        assert!(matches!(
            decode_frame::<Response>("{oops"),
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn spawning_a_missing_worker_is_transport_unavailable() {
        let err = NdjsonTransport::spawn_worker(
            "/nonexistent/ccq-worker",
            &[],
            Arc::new(Correlator::new()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::TransportUnavailable(_)));
    }
}
