//! Transport link: one TCP connection to a peer window. Owns the receive loop, the writer task and the
//! link's heartbeat monitor; every fault is handed to the owner, which tears the edge down.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use wintree_core::wire::{self, FrameDecodeError, FrameEncodeError, LEN_SIZE};
use wintree_core::{NetworkCode, WindowId, WindowInfo, WindowMessage};

use crate::heartbeat::{self, Health};

/// Receiver of everything a link produces. Implemented by the node.
pub(crate) trait LinkOwner: Send + Sync + 'static {
    /// A message arrived; `sender` is already stamped with the peer.
    fn on_message(&self, peer: &WindowInfo, serial: u64, msg: WindowMessage);
    /// The link is dead. Called at most once per failing task; must be idempotent.
    fn on_link_failed(&self, peer: &WindowId, serial: u64, err: LinkError);
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("peer closed the connection")]
    Closed,
    #[error("read timed out")]
    Timeout,
    #[error("undecodable frame: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("unencodable frame: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("unknown code {0:#04x}")]
    UnknownCode(u8),
    #[error("no keep-alive answer within one heartbeat period")]
    HeartbeatTimeout,
}

fn eof_as_closed(e: io::Error) -> LinkError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        LinkError::Closed
    } else {
        LinkError::Io(e)
    }
}

/// Per-link close signal, observed by the receive loop, writer and heartbeat.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum LinkSignal {
    Open,
    /// Stop reading; the writer flushes what is queued, then shuts the socket down.
    Drain,
    /// Stop everything now.
    Abort,
}

/// Resolves once the link is no longer open (or its owner is gone).
pub(crate) async fn closed(signal: &mut watch::Receiver<LinkSignal>) {
    loop {
        if *signal.borrow_and_update() != LinkSignal::Open {
            return;
        }
        if signal.changed().await.is_err() {
            return;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LinkSettings {
    /// Bound on reading a message body once its code byte arrived.
    pub read_timeout: Duration,
    /// Heartbeat period; `None` disables the monitor.
    pub heartbeat: Option<Duration>,
}

/// Local handle to a live link. Dropping it without `close` still stops the tasks.
pub(crate) struct Link {
    pub peer: WindowInfo,
    pub serial: u64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    signal: watch::Sender<LinkSignal>,
}

impl Link {
    /// Start the receive loop, writer and heartbeat for an established connection.
    /// `preamble` is written before anything else (the acceptor's handshake answer).
    pub fn spawn<O: LinkOwner>(
        stream: TcpStream,
        peer: WindowInfo,
        serial: u64,
        settings: LinkSettings,
        owner: Arc<O>,
        preamble: Option<Vec<u8>>,
    ) -> Link {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let (outbound, rx) = mpsc::unbounded_channel();
        if let Some(bytes) = preamble {
            let _ = outbound.send(bytes);
        }
        let (signal, signal_rx) = watch::channel(LinkSignal::Open);
        let health = Arc::new(Health::new());

        tokio::spawn(write_loop(
            writer,
            rx,
            signal_rx.clone(),
            owner.clone(),
            peer.unique_id,
            serial,
        ));
        if let Some(period) = settings.heartbeat {
            tokio::spawn(heartbeat::monitor(
                owner.clone(),
                peer.unique_id,
                serial,
                period,
                health.clone(),
                outbound.clone(),
                signal_rx.clone(),
            ));
        }
        tokio::spawn(read_loop(Receiver {
            reader,
            peer: peer.clone(),
            serial,
            read_timeout: settings.read_timeout,
            outbound: outbound.clone(),
            health,
            signal: signal_rx,
            owner,
        }));

        Link {
            peer,
            serial,
            outbound,
            signal,
        }
    }

    /// Queue a message for the peer. False if it cannot be encoded or the link is already closing.
    pub fn send(&self, msg: &WindowMessage) -> bool {
        match wire::encode_transfer(msg) {
            Ok(bytes) => self.outbound.send(bytes).is_ok(),
            Err(e) => {
                warn!(peer = %self.peer.unique_id, error = %e, "dropping unencodable message");
                false
            }
        }
    }

    /// Stop the link. Graceful close flushes queued units and half-closes so the peer sees EOF promptly.
    pub fn close(self, graceful: bool) {
        let signal = if graceful {
            LinkSignal::Drain
        } else {
            LinkSignal::Abort
        };
        self.signal.send_replace(signal);
    }
}

async fn write_loop<O: LinkOwner>(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut signal: watch::Receiver<LinkSignal>,
    owner: Arc<O>,
    peer: WindowId,
    serial: u64,
) {
    let mut watching = true;
    loop {
        tokio::select! {
            changed = signal.changed(), if watching => match changed {
                Ok(()) if *signal.borrow() == LinkSignal::Abort => return,
                Ok(()) => {}
                Err(_) => watching = false,
            },
            next = rx.recv() => {
                let Some(bytes) = next else { break };
                let written = async {
                    writer.write_all(&bytes).await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = written {
                    warn!(%peer, serial, error = %e, "write failed");
                    owner.on_link_failed(&peer, serial, LinkError::Io(e));
                    return;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
    debug!(%peer, serial, "writer stopped");
}

struct Receiver<O> {
    reader: OwnedReadHalf,
    peer: WindowInfo,
    serial: u64,
    read_timeout: Duration,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    health: Arc<Health>,
    signal: watch::Receiver<LinkSignal>,
    owner: Arc<O>,
}

async fn read_loop<O: LinkOwner>(mut rx: Receiver<O>) {
    match receive(&mut rx).await {
        Ok(()) => debug!(peer = %rx.peer.unique_id, serial = rx.serial, "receive loop stopped"),
        Err(LinkError::Closed) => {
            info!(peer = %rx.peer.unique_id, serial = rx.serial, "peer closed link");
            rx.owner
                .on_link_failed(&rx.peer.unique_id, rx.serial, LinkError::Closed);
        }
        Err(e) => {
            warn!(peer = %rx.peer.unique_id, serial = rx.serial, error = %e, "link failed");
            rx.owner.on_link_failed(&rx.peer.unique_id, rx.serial, e);
        }
    }
}

async fn receive<O: LinkOwner>(rx: &mut Receiver<O>) -> Result<(), LinkError> {
    loop {
        let code = tokio::select! {
            _ = closed(&mut rx.signal) => return Ok(()),
            code = rx.reader.read_u8() => code.map_err(eof_as_closed)?,
        };
        match NetworkCode::try_from(code).map_err(LinkError::UnknownCode)? {
            NetworkCode::WindowMessageTransfer => {
                let mut msg: WindowMessage =
                    tokio::time::timeout(rx.read_timeout, read_frame(&mut rx.reader))
                        .await
                        .map_err(|_| LinkError::Timeout)??;
                msg.sender = Some(rx.peer.clone());
                rx.owner.on_message(&rx.peer, rx.serial, msg);
            }
            NetworkCode::KeepAlive => {
                rx.health.touch();
                let _ = rx
                    .outbound
                    .send(wire::encode_code(NetworkCode::KeepAliveReply));
            }
            NetworkCode::KeepAliveReply => rx.health.touch(),
        }
    }
}

/// Read one length-prefixed bincode frame.
pub(crate) async fn read_frame<T, R>(reader: &mut R) -> Result<T, LinkError>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; LEN_SIZE];
    reader.read_exact(&mut header).await.map_err(eof_as_closed)?;
    let len = wire::frame_len(header)?;
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(eof_as_closed)?;
    Ok(wire::decode_payload(&payload)?)
}

/// Write one length-prefixed bincode frame and flush.
pub(crate) async fn write_frame<T, W>(writer: &mut W, value: &T) -> Result<(), LinkError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let frame = wire::encode_frame(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::net::TcpListener;
    use wintree_core::{Content, MessageCode};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<WindowMessage>>,
        failures: Mutex<Vec<(WindowId, u64, String)>>,
    }

    impl LinkOwner for Recorder {
        fn on_message(&self, _peer: &WindowInfo, _serial: u64, msg: WindowMessage) {
            self.messages.lock().unwrap().push(msg);
        }

        fn on_link_failed(&self, peer: &WindowId, serial: u64, err: LinkError) {
            self.failures
                .lock()
                .unwrap()
                .push((*peer, serial, err.to_string()));
        }
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    fn settings() -> LinkSettings {
        LinkSettings {
            read_timeout: Duration::from_millis(200),
            heartbeat: None,
        }
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn delivers_messages_with_sender_stamped() {
        let (local, remote) = pair().await;
        let peer = WindowInfo::new(2, "lab");
        let owner = Arc::new(Recorder::default());
        let link = Link::spawn(local, peer.clone(), 1, settings(), owner.clone(), None);

        let msg = WindowMessage::new(peer.clone(), None, MessageCode::Text)
            .with_content(Content::Text("over the wire".into()));
        let mut remote = remote;
        remote
            .write_all(&wire::encode_transfer(&msg).unwrap())
            .await
            .unwrap();

        wait_for(|| !owner.messages.lock().unwrap().is_empty()).await;
        let got = owner.messages.lock().unwrap()[0].clone();
        assert_eq!(got.id, msg.id);
        assert_eq!(got.text(), Some("over the wire"));
        assert_eq!(got.sender, Some(peer));
        assert!(owner.failures.lock().unwrap().is_empty());
        link.close(true);
    }

    #[tokio::test]
    async fn send_writes_code_then_frame() {
        let (local, mut remote) = pair().await;
        let peer = WindowInfo::new(2, "lab");
        let link = Link::spawn(local, peer.clone(), 1, settings(), Arc::new(Recorder::default()), None);
        let msg = WindowMessage::new(peer, None, MessageCode::Text);
        assert!(link.send(&msg));

        assert_eq!(remote.read_u8().await.unwrap(), NetworkCode::WindowMessageTransfer as u8);
        let decoded: WindowMessage = read_frame(&mut remote).await.unwrap();
        assert_eq!(decoded.id, msg.id);
        link.close(true);
    }

    #[tokio::test]
    async fn keep_alive_is_answered_once() {
        let (local, mut remote) = pair().await;
        let link = Link::spawn(
            local,
            WindowInfo::new(2, "lab"),
            1,
            settings(),
            Arc::new(Recorder::default()),
            None,
        );
        remote.write_all(&[NetworkCode::KeepAlive as u8]).await.unwrap();
        assert_eq!(remote.read_u8().await.unwrap(), NetworkCode::KeepAliveReply as u8);

        // A reply is not answered.
        remote
            .write_all(&[NetworkCode::KeepAliveReply as u8])
            .await
            .unwrap();
        let mut buf = [0u8; 1];
        let quiet =
            tokio::time::timeout(Duration::from_millis(150), remote.read(&mut buf)).await;
        assert!(quiet.is_err());
        link.close(true);
    }

    #[tokio::test]
    async fn unknown_code_fails_link() {
        let (local, mut remote) = pair().await;
        let owner = Arc::new(Recorder::default());
        let _link = Link::spawn(local, WindowInfo::new(2, "lab"), 7, settings(), owner.clone(), None);
        remote.write_all(&[0x42]).await.unwrap();
        wait_for(|| !owner.failures.lock().unwrap().is_empty()).await;
        let (_, serial, err) = owner.failures.lock().unwrap()[0].clone();
        assert_eq!(serial, 7);
        assert!(err.contains("0x42"));
    }

    #[tokio::test]
    async fn undecodable_body_fails_link() {
        let (local, mut remote) = pair().await;
        let owner = Arc::new(Recorder::default());
        let _link = Link::spawn(local, WindowInfo::new(2, "lab"), 3, settings(), owner.clone(), None);
        // Well-formed length header, body that is not a message.
        remote
            .write_all(&[NetworkCode::WindowMessageTransfer as u8, 3, 0, 0, 0, 0xff, 0xff, 0xff])
            .await
            .unwrap();
        wait_for(|| !owner.failures.lock().unwrap().is_empty()).await;
        let (_, serial, err) = owner.failures.lock().unwrap()[0].clone();
        assert_eq!(serial, 3);
        assert!(err.starts_with("undecodable frame"), "{err}");
        assert!(owner.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stalled_body_times_out() {
        let (local, mut remote) = pair().await;
        let owner = Arc::new(Recorder::default());
        let _link = Link::spawn(local, WindowInfo::new(2, "lab"), 1, settings(), owner.clone(), None);
        remote
            .write_all(&[NetworkCode::WindowMessageTransfer as u8, 10, 0])
            .await
            .unwrap();
        wait_for(|| !owner.failures.lock().unwrap().is_empty()).await;
        assert_eq!(owner.failures.lock().unwrap()[0].2, LinkError::Timeout.to_string());
    }

    #[tokio::test]
    async fn peer_close_fails_link() {
        let (local, remote) = pair().await;
        let owner = Arc::new(Recorder::default());
        let _link = Link::spawn(local, WindowInfo::new(2, "lab"), 1, settings(), owner.clone(), None);
        drop(remote);
        wait_for(|| !owner.failures.lock().unwrap().is_empty()).await;
        assert_eq!(owner.failures.lock().unwrap()[0].2, LinkError::Closed.to_string());
    }

    #[tokio::test]
    async fn graceful_close_flushes_then_half_closes() {
        let (local, mut remote) = pair().await;
        let owner = Arc::new(Recorder::default());
        let peer = WindowInfo::new(2, "lab");
        let link = Link::spawn(
            local,
            peer.clone(),
            1,
            settings(),
            owner.clone(),
            Some(vec![9, 9]),
        );
        assert!(link.send(&WindowMessage::new(peer, None, MessageCode::Text)));
        link.close(true);
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert_eq!(&rest[..3], &[9, 9, NetworkCode::WindowMessageTransfer as u8]);
        let (decoded, n): (WindowMessage, usize) = wire::decode_frame(&rest[3..]).unwrap();
        assert_eq!(n, rest.len() - 3);
        assert_eq!(decoded.code, MessageCode::Text);
        // Closing locally is not a failure.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(owner.failures.lock().unwrap().is_empty());
    }
}
