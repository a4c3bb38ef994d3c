//! Correlated async client for the emulator command channel.
use crate::chunking::{ChunkPolicy, DEFAULT_CHUNK_CEILING, DEFAULT_GROWTH_WINDOW, initial_chunk};
use crate::wire;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("emulator unreachable: {0}")]
    Unreachable(#[from] std::io::Error),

    #[error("request timed out")]
    Timeout,

    #[error("malformed reply: {0}")]
    Decode(wire::WireError),

    #[error("emulator refused the request")]
    Emulator,

    #[error("client closed")]
    Cancelled,
}

impl From<wire::WireError> for TransportError {
    fn from(err: wire::WireError) -> Self {
        match err {
            wire::WireError::EmulatorSignaled => TransportError::Emulator,
            other => TransportError::Decode(other),
        }
    }
}

/// Connection settings for [`RetroClient::connect`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Per-request reply timeout.
    pub request_timeout: Duration,
    /// Platform name driving the initial chunk size.
    pub platform: String,
    pub chunk_ceiling: usize,
    pub growth_window: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 55355,
            request_timeout: Duration::from_millis(64),
            platform: String::new(),
            chunk_ceiling: DEFAULT_CHUNK_CEILING,
            growth_window: DEFAULT_GROWTH_WINDOW,
        }
    }
}

impl ClientConfig {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn with_chunk_ceiling(mut self, chunk_ceiling: usize) -> Self {
        self.chunk_ceiling = chunk_ceiling;
        self
    }

    pub fn with_growth_window(mut self, growth_window: u32) -> Self {
        self.growth_window = growth_window;
        self
    }
}

type PayloadWaiter = (u64, oneshot::Sender<Vec<String>>);

#[derive(Default)]
struct Waiters {
    /// Outstanding requests keyed by the literal `(verb, addr)` reply head.
    by_key: HashMap<(String, String), VecDeque<PayloadWaiter>>,
    /// Probe waiters; replies without a correlation head resolve these FIFO.
    uncorrelated: VecDeque<(u64, oneshot::Sender<String>)>,
}

struct Shared {
    waiters: Mutex<Waiters>,
    closed: AtomicBool,
    next_waiter_id: AtomicU64,
}

/// Datagram client with a background reader demultiplexing replies to
/// outstanding requests.
pub struct RetroClient {
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    chunks: Mutex<ChunkPolicy>,
    request_timeout: Duration,
    reader: JoinHandle<()>,
}

impl RetroClient {
    /// Binds a local socket, connects it to the emulator, and spawns the
    /// reply reader.
    pub async fn connect(config: ClientConfig) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .connect((config.host.as_str(), config.port))
            .await?;
        let socket = Arc::new(socket);

        let shared = Arc::new(Shared {
            waiters: Mutex::new(Waiters::default()),
            closed: AtomicBool::new(false),
            next_waiter_id: AtomicU64::new(0),
        });

        let reader = tokio::spawn(Self::read_loop(socket.clone(), shared.clone()));

        let initial = if config.platform.is_empty() {
            initial_chunk("")
        } else {
            initial_chunk(&config.platform)
        };

        Ok(Self {
            socket,
            shared,
            chunks: Mutex::new(ChunkPolicy::new(
                initial,
                config.chunk_ceiling,
                config.growth_window,
            )),
            request_timeout: config.request_timeout,
            reader,
        })
    }

    async fn read_loop(socket: Arc<UdpSocket>, shared: Arc<Shared>) {
        let mut buf = vec![0u8; 65536];
        loop {
            let n = match socket.recv(&mut buf).await {
                Ok(n) => n,
                Err(err) => {
                    if shared.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    tracing::warn!(error = %err, "reader recv failed");
                    continue;
                }
            };
            let text = String::from_utf8_lossy(&buf[..n]);
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                Self::dispatch_line(&shared, line);
            }
        }
    }

    fn dispatch_line(shared: &Shared, line: &str) {
        let mut waiters = shared.waiters.lock().unwrap();
        match wire::parse_reply_line(line) {
            Some(reply) => {
                let key = (reply.verb, reply.addr_token);
                let Some(queue) = waiters.by_key.get_mut(&key) else {
                    tracing::trace!(verb = %key.0, addr = %key.1, "reply with no waiter");
                    return;
                };
                if let Some((_, tx)) = queue.pop_front() {
                    let _ = tx.send(reply.payload);
                }
                if queue.is_empty() {
                    waiters.by_key.remove(&key);
                }
            }
            None => {
                if let Some((_, tx)) = waiters.uncorrelated.pop_front() {
                    let _ = tx.send(line.to_string());
                }
            }
        }
    }

    fn waiter_id(&self) -> u64 {
        self.shared.next_waiter_id.fetch_add(1, Ordering::Relaxed)
    }

    fn remove_waiter(&self, key: &(String, String), id: u64) {
        let mut waiters = self.shared.waiters.lock().unwrap();
        if let Some(queue) = waiters.by_key.get_mut(key) {
            queue.retain(|(waiter_id, _)| *waiter_id != id);
            if queue.is_empty() {
                waiters.by_key.remove(key);
            }
        }
    }

    /// Sends one command and waits for its correlated reply payload.
    async fn request(
        &self,
        verb: &str,
        addr_token: &str,
        command: &str,
    ) -> Result<Vec<String>, TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Cancelled);
        }

        let key = (verb.to_string(), addr_token.to_string());
        let id = self.waiter_id();
        let (tx, rx) = oneshot::channel();
        self.shared
            .waiters
            .lock()
            .unwrap()
            .by_key
            .entry(key.clone())
            .or_default()
            .push_back((id, tx));

        if let Err(err) = self.socket.send(command.as_bytes()).await {
            self.remove_waiter(&key, id);
            return Err(TransportError::Unreachable(err));
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            // Sender dropped without sending: the client was closed.
            Ok(Err(_)) => Err(TransportError::Cancelled),
            Err(_) => {
                self.remove_waiter(&key, id);
                if self.shared.closed.load(Ordering::SeqCst) {
                    Err(TransportError::Cancelled)
                } else {
                    Err(TransportError::Timeout)
                }
            }
        }
    }

    /// Reads exactly `len` bytes starting at `addr` in a single command.
    async fn read_chunk(&self, addr: u32, len: usize) -> Result<Vec<u8>, TransportError> {
        let addr_token = wire::format_addr(addr);
        let command = wire::read_command(addr, len);
        let payload = self.request(wire::READ_VERB, &addr_token, &command).await?;
        Ok(wire::parse_read_payload(&payload, len)?)
    }

    /// Reads a contiguous range, splitting it into chunks sized by the
    /// adaptive policy and re-stitching the result.
    ///
    /// A refused or timed-out chunk halves the chunk size and retries the
    /// same offset; the error only surfaces once the floor is reached.
    pub async fn read_range(&self, addr: u32, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut out = Vec::with_capacity(len);
        let mut offset = 0usize;
        while offset < len {
            let chunk = self.chunks.lock().unwrap().current();
            let want = chunk.min(len - offset);
            match self.read_chunk(addr + offset as u32, want).await {
                Ok(bytes) => {
                    self.chunks.lock().unwrap().on_success();
                    out.extend_from_slice(&bytes);
                    offset += want;
                }
                Err(err @ (TransportError::Emulator | TransportError::Timeout)) => {
                    let retry = self.chunks.lock().unwrap().on_failure();
                    if !retry {
                        return Err(err);
                    }
                    tracing::debug!(
                        addr = offset as u32 + addr,
                        refused = want,
                        "read refused, halving chunk size"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    /// Reads every region and returns the blocks keyed by start address.
    pub async fn read_regions(
        &self,
        regions: &[(u32, usize)],
    ) -> Result<HashMap<u32, Vec<u8>>, TransportError> {
        let mut blocks = HashMap::with_capacity(regions.len());
        for &(start, len) in regions {
            let bytes = self.read_range(start, len).await?;
            blocks.insert(start, bytes);
        }
        Ok(blocks)
    }

    /// Writes raw bytes at `addr` and waits for the status reply.
    pub async fn write_bytes(&self, addr: u32, bytes: &[u8]) -> Result<(), TransportError> {
        let addr_token = wire::format_addr(addr);
        let command = wire::write_command(addr, bytes);
        let payload = self
            .request(wire::WRITE_VERB, &addr_token, &command)
            .await?;
        Ok(wire::parse_write_status(&payload)?)
    }

    /// Connection probe: any reply to `VERSION` means the channel is alive.
    pub async fn probe(&self) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Cancelled);
        }
        let id = self.waiter_id();
        let (tx, rx) = oneshot::channel();
        self.shared
            .waiters
            .lock()
            .unwrap()
            .uncorrelated
            .push_back((id, tx));

        if let Err(err) = self.socket.send(b"VERSION\n").await {
            self.shared
                .waiters
                .lock()
                .unwrap()
                .uncorrelated
                .retain(|(waiter_id, _)| *waiter_id != id);
            return Err(TransportError::Unreachable(err));
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Cancelled),
            Err(_) => {
                self.shared
                    .waiters
                    .lock()
                    .unwrap()
                    .uncorrelated
                    .retain(|(waiter_id, _)| *waiter_id != id);
                Err(TransportError::Timeout)
            }
        }
    }

    /// Stops the reader and fails every outstanding waiter with `Cancelled`.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.reader.abort();
        let mut waiters = self.shared.waiters.lock().unwrap();
        waiters.by_key.clear();
        waiters.uncorrelated.clear();
    }
}

impl Drop for RetroClient {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal emulator double: 64 KiB of RAM behind the wire dialect, with
    /// an optional list of chunk lengths to refuse with `-1`.
    struct MockEmulator {
        socket: UdpSocket,
        ram: Vec<u8>,
        refuse_lens: Vec<usize>,
    }

    impl MockEmulator {
        async fn bind() -> (std::net::SocketAddr, Self) {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let addr = socket.local_addr().unwrap();
            let mut ram = vec![0u8; 0x10000];
            for (i, b) in ram.iter_mut().enumerate() {
                *b = (i % 251) as u8;
            }
            (
                addr,
                Self {
                    socket,
                    ram,
                    refuse_lens: Vec::new(),
                },
            )
        }

        fn parse_addr(token: &str) -> u32 {
            match token.parse::<u32>() {
                Ok(v) if v <= 9 => v,
                _ => u32::from_str_radix(token, 16).unwrap(),
            }
        }

        async fn serve(mut self) {
            let mut buf = vec![0u8; 65536];
            loop {
                let Ok((n, peer)) = self.socket.recv_from(&mut buf).await else {
                    return;
                };
                let text = String::from_utf8_lossy(&buf[..n]).to_string();
                for line in text.lines() {
                    let tokens: Vec<&str> = line.split_whitespace().collect();
                    let reply = match tokens.as_slice() {
                        ["VERSION"] => "1.19.1\n".to_string(),
                        ["READ_CORE_MEMORY", addr_token, len] => {
                            let addr = Self::parse_addr(addr_token) as usize;
                            let len: usize = len.parse().unwrap();
                            if let Some(pos) =
                                self.refuse_lens.iter().position(|&l| l == len)
                            {
                                self.refuse_lens.remove(pos);
                                format!("READ_CORE_MEMORY {} -1\n", addr_token)
                            } else {
                                let mut reply =
                                    format!("READ_CORE_MEMORY {}", addr_token);
                                for b in &self.ram[addr..addr + len] {
                                    reply.push_str(&format!(" {:02x}", b));
                                }
                                reply.push('\n');
                                reply
                            }
                        }
                        ["WRITE_CORE_MEMORY", addr_token, rest @ ..] => {
                            let addr = Self::parse_addr(addr_token) as usize;
                            for (i, token) in rest.iter().enumerate() {
                                self.ram[addr + i] =
                                    u8::from_str_radix(token, 16).unwrap();
                            }
                            format!("WRITE_CORE_MEMORY {} {}\n", addr_token, rest.len())
                        }
                        _ => continue,
                    };
                    let _ = self.socket.send_to(reply.as_bytes(), peer).await;
                }
            }
        }
    }

    async fn client_for(addr: std::net::SocketAddr) -> RetroClient {
        RetroClient::connect(
            ClientConfig::default()
                .with_host(addr.ip().to_string())
                .with_port(addr.port())
                .with_request_timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn read_range_round_trip() {
        let (addr, emulator) = MockEmulator::bind().await;
        let expected = emulator.ram[0xC000..0xC000 + 32].to_vec();
        tokio::spawn(emulator.serve());

        let client = client_for(addr).await;
        let bytes = client.read_range(0xC000, 32).await.unwrap();
        assert_eq!(bytes, expected);
    }

    #[tokio::test]
    async fn oversized_region_is_chunked_and_stitched() {
        let (addr, emulator) = MockEmulator::bind().await;
        let expected = emulator.ram[0..1024].to_vec();
        tokio::spawn(emulator.serve());

        // Initial chunk 256 < region 1024 forces four sequential sub-reads.
        let client = client_for(addr).await;
        let bytes = client.read_range(0, 1024).await.unwrap();
        assert_eq!(bytes.len(), 1024);
        assert_eq!(bytes, expected);
    }

    #[tokio::test]
    async fn refused_chunk_halves_and_recovers() {
        let (addr, mut emulator) = MockEmulator::bind().await;
        // First 256-byte read gets `-1`; 128-byte reads succeed.
        emulator.refuse_lens.push(256);
        let expected = emulator.ram[0x2000..0x2000 + 1024].to_vec();
        tokio::spawn(emulator.serve());

        let client = client_for(addr).await;
        let bytes = client.read_range(0x2000, 1024).await.unwrap();
        assert_eq!(bytes, expected, "stitched bytes must stay contiguous");
        assert_eq!(client.chunks.lock().unwrap().current(), 128);
    }

    #[tokio::test]
    async fn write_patches_emulator_ram() {
        let (addr, emulator) = MockEmulator::bind().await;
        tokio::spawn(emulator.serve());

        let client = client_for(addr).await;
        client
            .write_bytes(0xD347, &[0x12, 0x34, 0x56])
            .await
            .unwrap();
        let bytes = client.read_range(0xD347, 3).await.unwrap();
        assert_eq!(bytes, vec![0x12, 0x34, 0x56]);
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        // Bind a socket that never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();

        let client = RetroClient::connect(
            ClientConfig::default()
                .with_host(addr.ip().to_string())
                .with_port(addr.port())
                .with_request_timeout(Duration::from_millis(30)),
        )
        .await
        .unwrap();

        // Chunk floor is reached after repeated timeouts, then the error
        // surfaces.
        let err = client.read_range(0x100, 16).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout), "got {err:?}");
    }

    #[tokio::test]
    async fn close_cancels_outstanding_requests() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();

        let client = Arc::new(
            RetroClient::connect(
                ClientConfig::default()
                    .with_host(addr.ip().to_string())
                    .with_port(addr.port())
                    .with_request_timeout(Duration::from_secs(5)),
            )
            .await
            .unwrap(),
        );

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.read_range(0, 16).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.close();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Cancelled), "got {err:?}");
    }

    #[tokio::test]
    async fn probe_resolves_on_any_uncorrelated_reply() {
        let (addr, emulator) = MockEmulator::bind().await;
        tokio::spawn(emulator.serve());

        let client = client_for(addr).await;
        client.probe().await.unwrap();
    }
}
