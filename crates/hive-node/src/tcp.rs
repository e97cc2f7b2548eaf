//! Length-prefixed framing over TCP.
//!
//! Each transport frame is a big-endian length (2 or 4 bytes) followed by
//! the frame body. A [`TcpAgent`] runs one read task and one write task; the
//! [`Listener`] accepts inbound connections and hands each one, unstarted,
//! to an acceptor.

use crate::agent::{
    Agent, AgentCore, AgentOptions, ConnectedHook, Connector, DisconnectedHook, FrameReceiver,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use hive_types::{HiveError, HiveResult, Shutdown};
use hive_wire::Value;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Read one frame body. `Ok(None)` means the peer closed cleanly between frames.
pub async fn read_frame<R>(reader: &mut R, prefix: u8, max: u32) -> HiveResult<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let width = if prefix == 2 { 2 } else { 4 };
    let mut header = [0u8; 4];
    let header = &mut header[..width];
    match reader.read_exact(header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(HiveError::Io(e)),
    }

    let len = header.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
    if len == 0 {
        return Err(HiveError::unmarshal("frame", "empty frame"));
    }
    if len > max {
        return Err(HiveError::unmarshal(
            "frame",
            format!("frame of {len} bytes exceeds max {max}"),
        ));
    }

    let mut body = BytesMut::zeroed(len as usize);
    reader.read_exact(&mut body).await?;
    Ok(Some(body.freeze()))
}

/// Write one frame body behind its length prefix.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8], prefix: u8) -> HiveResult<()>
where
    W: AsyncWrite + Unpin,
{
    let len = frame.len();
    match prefix {
        2 => {
            let len = u16::try_from(len).map_err(|_| {
                HiveError::Marshal(format!("frame of {len} bytes does not fit a 2-byte prefix"))
            })?;
            writer.write_all(&len.to_be_bytes()).await?;
        }
        _ => {
            let len = u32::try_from(len).map_err(|_| {
                HiveError::Marshal(format!("frame of {len} bytes does not fit a 4-byte prefix"))
            })?;
            writer.write_all(&len.to_be_bytes()).await?;
        }
    }
    writer.write_all(frame).await?;
    Ok(())
}

/// A framed TCP connection.
pub struct TcpAgent {
    core: Arc<AgentCore>,
    stream: Mutex<Option<TcpStream>>,
    reader: Mutex<Option<AbortHandle>>,
    options: AgentOptions,
    shutdown: Shutdown,
}

impl TcpAgent {
    pub fn new(stream: TcpStream, options: AgentOptions, shutdown: Shutdown) -> Self {
        let addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let _ = stream.set_nodelay(true);
        Self {
            core: Arc::new(AgentCore::new(addr, &options)),
            stream: Mutex::new(Some(stream)),
            reader: Mutex::new(None),
            options,
            shutdown,
        }
    }
}

impl Agent for TcpAgent {
    fn id(&self) -> u64 {
        self.core.id()
    }

    fn send(&self, frame: Bytes) -> HiveResult<()> {
        self.core.enqueue(frame)
    }

    fn start(&self) {
        let Some(stream) = self.stream.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            warn!(agent = self.core.id(), "Agent already started");
            return;
        };
        let (read_half, write_half) = stream.into_split();

        let reader = tokio::spawn(read_loop(
            Arc::clone(&self.core),
            read_half,
            self.options,
            self.shutdown.clone(),
        ));
        *self.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(reader.abort_handle());
        tokio::spawn(write_loop(Arc::clone(&self.core), write_half, self.options));

        self.core.connected();
    }

    fn bind_connected(&self, hook: ConnectedHook) {
        self.core.bind_connected(hook);
    }

    fn bind_disconnected(&self, hook: DisconnectedHook) {
        self.core.bind_disconnected(hook);
    }

    fn bind_receiver(&self, receiver: FrameReceiver) {
        self.core.bind_receiver(receiver);
    }

    fn head(&self, key: &str) -> Option<Value> {
        self.core.head(key)
    }

    fn set_head(&self, key: &str, value: Value) {
        self.core.set_head(key, value);
    }

    fn remote_addr(&self) -> String {
        self.core.addr().to_string()
    }

    fn is_closed(&self) -> bool {
        !self.core.is_enabled()
    }

    fn dispose(&self) {
        if let Some(reader) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            reader.abort();
        }
        // Never started: drop the socket.
        self.stream.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.core.close(None);
    }
}

impl Drop for TcpAgent {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            reader.abort();
        }
        // Wakes the write loop so it shuts the socket down and exits.
        self.core.close(None);
    }
}

async fn read_loop(
    core: Arc<AgentCore>,
    mut reader: OwnedReadHalf,
    options: AgentOptions,
    mut shutdown: Shutdown,
) {
    loop {
        tokio::select! {
            frame = read_frame(&mut reader, options.length_prefix, options.max_frame_size) => {
                match frame {
                    Ok(Some(frame)) => core.deliver(frame),
                    Ok(None) => {
                        core.close(None);
                        return;
                    }
                    Err(e) => {
                        core.close(Some(e));
                        return;
                    }
                }
            }
            _ = shutdown.wait() => {
                core.close(None);
                return;
            }
        }
    }
}

async fn write_loop(core: Arc<AgentCore>, mut writer: OwnedWriteHalf, options: AgentOptions) {
    let mut batch = VecDeque::new();
    loop {
        core.take_outbound(&mut batch);
        if batch.is_empty() {
            if !core.is_enabled() {
                break;
            }
            core.wake.notified().await;
            continue;
        }
        while let Some(frame) = batch.pop_front() {
            if let Err(e) = write_frame(&mut writer, &frame, options.length_prefix).await {
                warn!(agent = core.id(), error = %e, "Write failed");
                core.close(Some(e));
                return;
            }
        }
        if let Err(e) = writer.flush().await {
            core.close(Some(HiveError::Io(e)));
            return;
        }
    }
    let _ = writer.shutdown().await;
    debug!(agent = core.id(), "Write loop finished");
}

/// Dials TCP peers.
pub struct TcpConnector {
    options: AgentOptions,
    shutdown: Shutdown,
}

impl TcpConnector {
    pub fn new(options: AgentOptions, shutdown: Shutdown) -> Self {
        Self { options, shutdown }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str) -> HiveResult<Arc<dyn Agent>> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| HiveError::Connect {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Arc::new(TcpAgent::new(stream, self.options, self.shutdown.clone())))
    }
}

/// Receives every accepted, unstarted agent.
pub type Acceptor = Arc<dyn Fn(Arc<dyn Agent>) + Send + Sync>;

/// A bound TCP listener.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
    options: AgentOptions,
    shutdown: Shutdown,
}

impl Listener {
    pub async fn bind(addr: &str, options: AgentOptions, shutdown: Shutdown) -> HiveResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| HiveError::Listen {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Listening");
        Ok(Self {
            listener,
            local_addr,
            options,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop until shutdown.
    pub fn run(self, acceptor: Acceptor) -> JoinHandle<()> {
        tokio::spawn(accept_loop(self, acceptor))
    }
}

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

async fn accept_loop(listener: Listener, acceptor: Acceptor) {
    let Listener {
        listener,
        local_addr,
        options,
        mut shutdown,
    } = listener;
    let mut backoff = ACCEPT_BACKOFF_MIN;
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    backoff = ACCEPT_BACKOFF_MIN;
                    debug!(%peer, "Accepted connection");
                    acceptor(Arc::new(TcpAgent::new(stream, options, shutdown.clone())));
                }
                Err(e) => {
                    let e = HiveError::Accept(e.to_string());
                    error!(addr = %local_addr, error = %e, ?backoff, "Accept failed");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.wait() => break,
                    }
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                }
            },
            _ = shutdown.wait() => break,
        }
    }
    info!(addr = %local_addr, "Listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_types::Supervisor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"\x02hello", 2).await.unwrap();
        write_frame(&mut a, b"\x01", 2).await.unwrap();
        drop(a);

        let first = read_frame(&mut b, 2, 1024).await.unwrap().unwrap();
        assert_eq!(&first[..], b"\x02hello");
        let second = read_frame(&mut b, 2, 1024).await.unwrap().unwrap();
        assert_eq!(&second[..], b"\x01");
        assert!(read_frame(&mut b, 2, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_and_empty_frames_are_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &[7u8; 64], 4).await.unwrap();
        let err = read_frame(&mut b, 4, 16).await.unwrap_err();
        assert!(matches!(err, HiveError::Unmarshal { field: "frame", .. }));

        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0]).await.unwrap();
        assert!(read_frame(&mut b, 2, 16).await.is_err());
    }

    #[tokio::test]
    async fn test_two_byte_prefix_limit() {
        let (mut a, _b) = tokio::io::duplex(16);
        let big = vec![0u8; u16::MAX as usize + 1];
        assert!(matches!(
            write_frame(&mut a, &big, 2).await,
            Err(HiveError::Marshal(_))
        ));
    }

    #[tokio::test]
    async fn test_tcp_agents_exchange_frames() {
        let supervisor = Supervisor::new();
        let options = AgentOptions::default();
        let listener = Listener::bind("127.0.0.1:0", options, supervisor.subscribe())
            .await
            .unwrap();
        let addr = listener.local_addr().to_string();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Bytes>();
        let accepted: Acceptor = Arc::new(move |agent: Arc<dyn Agent>| {
            let echo = Arc::clone(&agent);
            let tx = tx.clone();
            agent.bind_receiver(Arc::new(move |frame: Bytes| {
                let _ = tx.send(frame.clone());
                let _ = echo.send(frame);
            }));
            agent.start();
        });
        let handle = listener.run(accepted);

        let connector = TcpConnector::new(options, supervisor.subscribe());
        let client = connector.connect(&addr).await.unwrap();
        let (etx, mut erx) = tokio::sync::mpsc::unbounded_channel::<Bytes>();
        client.bind_receiver(Arc::new(move |frame: Bytes| {
            let _ = etx.send(frame);
        }));
        let closed = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&closed);
        client.bind_disconnected(Box::new(move |_: Option<&HiveError>| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        client.start();

        client.send(Bytes::from_static(b"\x02ping")).unwrap();
        assert_eq!(&rx.recv().await.unwrap()[..], b"\x02ping");
        assert_eq!(&erx.recv().await.unwrap()[..], b"\x02ping");

        client.dispose();
        assert!(client.is_closed());
        assert!(matches!(
            client.send(Bytes::from_static(b"\x01")),
            Err(HiveError::Closed)
        ));
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        supervisor.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_agent_releases_its_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (mut peer, _) = accepted.unwrap();

        let agent = TcpAgent::new(client.unwrap(), AgentOptions::default(), Shutdown::never());
        let closed = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&closed);
        agent.bind_disconnected(Box::new(move |_: Option<&HiveError>| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        agent.start();
        drop(agent);

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(1), peer.read(&mut buf))
            .await
            .expect("write loop should exit and close the socket")
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let connector = TcpConnector::new(AgentOptions::default(), Shutdown::never());
        let err = connector.connect(&addr).await.err().unwrap();
        assert!(matches!(err, HiveError::Connect { .. }));
    }
}
