use std::{
    io::Read,
    net::{SocketAddr, ToSocketAddrs},
    sync::{
        Arc, Mutex, MutexGuard, TryLockError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use reqwest::Url;
use suppaftp::{FtpError, FtpStream, types::FileType};
use tokio::sync::oneshot;

use super::{ChunkStream, ProtocolAdapter};
use crate::{
    connection_cache::{ConnectionCache, PooledConnection},
    error::AdapterError,
    protocol::Protocol,
};

const FTP_DEFAULT_PORT: u16 = 21;
const FTP_READ_BUFFER: usize = 64 * 1024;
/// Chunks buffered between the blocking reader and the async consumer.
const FTP_CHANNEL_DEPTH: usize = 8;
const SESSION_POLL_INTERVAL: Duration = Duration::from_millis(20);
/// A request gets one fresh session after the cached one is found dead.
const SESSION_ATTEMPTS: usize = 2;

type StartSignal = Result<Option<u64>, AdapterError>;

/// A logged-in control connection. The mutex also serializes data transfers,
/// since FTP allows one at a time per control connection.
pub struct FtpSession {
    key: String,
    stream: Mutex<FtpStream>,
    broken: AtomicBool,
    opened_at: Instant,
    /// Milliseconds after `opened_at` at which the holder last made progress.
    last_activity: AtomicU64,
}

impl FtpSession {
    fn new(key: String, stream: FtpStream) -> Self {
        Self {
            key,
            stream: Mutex::new(stream),
            broken: AtomicBool::new(false),
            opened_at: Instant::now(),
            last_activity: AtomicU64::new(0),
        }
    }

    fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Flags the session for reconnect when the error came from the socket.
    fn note_error(&self, e: &FtpError) {
        if matches!(e, FtpError::ConnectionError(_)) {
            self.mark_broken();
        }
    }

    fn touch(&self) {
        let now = self.opened_at.elapsed().as_millis() as u64;
        self.last_activity.store(now, Ordering::SeqCst);
    }

    fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity.load(Ordering::SeqCst));
        self.opened_at.elapsed().saturating_sub(last)
    }

    /// Waits for the control connection for as long as its current holder
    /// keeps making progress. Returns `None` once the session is unusable:
    /// broken, poisoned, or held by a transfer silent for `stall_limit`.
    fn acquire(&self, stall_limit: Duration) -> Option<MutexGuard<'_, FtpStream>> {
        loop {
            if self.is_broken() {
                return None;
            }
            match self.stream.try_lock() {
                Ok(guard) => {
                    if self.is_broken() {
                        return None;
                    }
                    self.touch();
                    return Some(guard);
                }
                Err(TryLockError::Poisoned(_)) => {
                    self.mark_broken();
                    return None;
                }
                Err(TryLockError::WouldBlock) => {
                    if self.idle() > stall_limit {
                        tracing::debug!(
                            "FTP session {} silent for {:?}, giving it up",
                            self.key,
                            self.idle()
                        );
                        self.mark_broken();
                        return None;
                    }
                    std::thread::sleep(SESSION_POLL_INTERVAL);
                }
            }
        }
    }
}

#[async_trait]
impl PooledConnection for FtpSession {
    async fn close(self: Arc<Self>) {
        let _ = tokio::task::spawn_blocking(move || {
            // a session stuck in a transfer is simply dropped
            if let Ok(mut stream) = self.stream.try_lock()
                && let Err(e) = stream.quit()
            {
                tracing::debug!("QUIT on {} failed: {}", self.key, e);
            }
        })
        .await;
    }
}

/// Anonymous (or URL-credentialed) FTP in binary mode.
pub struct FtpAdapter {
    connect_timeout: Duration,
    read_timeout: Duration,
    sessions: ConnectionCache<FtpSession>,
}

impl FtpAdapter {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
            sessions: ConnectionCache::new(),
        }
    }

    /// How long a caller waits behind another transfer that stopped moving.
    fn stall_limit(&self) -> Duration {
        self.read_timeout * 2
    }

    async fn session(&self, url: &Url) -> Result<Arc<FtpSession>, AdapterError> {
        let key = session_key(url)?;
        let session = self.connect(url, &key).await?;
        if !session.is_broken() {
            return Ok(session);
        }
        tracing::debug!("FTP session for {} is broken, reconnecting", key);
        self.sessions.evict(&key).await;
        self.connect(url, &key).await
    }

    async fn connect(&self, url: &Url, key: &str) -> Result<Arc<FtpSession>, AdapterError> {
        let host = url
            .host_str()
            .ok_or_else(|| AdapterError::unreachable(url, "missing host"))?
            .to_string();
        let port = url.port().unwrap_or(FTP_DEFAULT_PORT);
        let user = match url.username() {
            "" => "anonymous".to_string(),
            user => percent_decode_str(user).decode_utf8_lossy().into_owned(),
        };
        let password = url
            .password()
            .map(|p| percent_decode_str(p).decode_utf8_lossy().into_owned())
            .unwrap_or_else(|| "anonymous@".to_string());
        let connect_timeout = self.connect_timeout;
        let read_timeout = self.read_timeout;
        let session_key = key.to_string();

        self.sessions
            .get_or_connect(key, || async move {
                tokio::task::spawn_blocking(move || {
                    let addr: SocketAddr = (host.as_str(), port)
                        .to_socket_addrs()?
                        .next()
                        .ok_or_else(|| AdapterError::unreachable(&session_key, "no address"))?;
                    let mut stream = FtpStream::connect_timeout(addr, connect_timeout)?;
                    stream.get_ref().set_read_timeout(Some(read_timeout))?;
                    stream.login(user.as_str(), password.as_str())?;
                    stream.transfer_type(FileType::Binary)?;
                    tracing::debug!("Logged in to {} as {}", session_key, user);
                    Ok::<_, AdapterError>(FtpSession::new(session_key, stream))
                })
                .await?
            })
            .await
    }
}

#[async_trait]
impl ProtocolAdapter for FtpAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Ftp
    }

    async fn resolve_size(&self, url: &Url) -> Result<u64, AdapterError> {
        for _ in 0..SESSION_ATTEMPTS {
            let session = self.session(url).await?;
            let path = remote_path(url);
            let url_string = url.to_string();
            let stall_limit = self.stall_limit();

            let size = tokio::task::spawn_blocking(move || {
                let Some(mut stream) = session.acquire(stall_limit) else {
                    return Ok(None);
                };
                match stream.size(path.as_str()) {
                    Ok(size) => Ok(Some(size as u64)),
                    Err(e) => {
                        session.note_error(&e);
                        Err(AdapterError::unreachable(&url_string, e))
                    }
                }
            })
            .await??;
            if let Some(size) = size {
                return Ok(size);
            }
        }
        Err(AdapterError::unreachable(url, "FTP session unavailable"))
    }

    async fn open(&self, url: &Url, resume_offset: u64) -> Result<ChunkStream, AdapterError> {
        for _ in 0..SESSION_ATTEMPTS {
            let session = self.session(url).await?;
            let (started_rx, rx) = spawn_retrieval(
                session,
                url.to_string(),
                remote_path(url),
                resume_offset,
                self.read_timeout,
                self.stall_limit(),
            );
            let started = started_rx
                .await
                .map_err(|_| AdapterError::unreachable(url, "transfer task ended early"))??;
            if let Some(starts_at) = started {
                return Ok(ChunkStream::new(url, starts_at, rx).with_read_timeout(self.read_timeout));
            }
        }
        Err(AdapterError::unreachable(url, "FTP session unavailable"))
    }

    async fn close(&self) {
        self.sessions.close_all().await;
    }
}

/// Runs `REST` + `RETR` on the blocking pool and pumps the data connection
/// into a channel. The oneshot reports the offset the data starts at, or
/// `None` when the session could not be used at all.
fn spawn_retrieval(
    session: Arc<FtpSession>,
    url_string: String,
    path: String,
    resume_offset: u64,
    read_timeout: Duration,
    stall_limit: Duration,
) -> (
    oneshot::Receiver<StartSignal>,
    async_channel::Receiver<Result<Bytes, AdapterError>>,
) {
    let (tx, rx) = async_channel::bounded::<Result<Bytes, AdapterError>>(FTP_CHANNEL_DEPTH);
    let (started_tx, started_rx) = oneshot::channel::<StartSignal>();

    tokio::task::spawn_blocking(move || {
        let Some(mut stream) = session.acquire(stall_limit) else {
            let _ = started_tx.send(Ok(None));
            return;
        };

        let mut starts_at = 0;
        if resume_offset > 0 {
            match stream.resume_transfer(resume_offset as usize) {
                Ok(()) => starts_at = resume_offset,
                Err(e) => {
                    session.note_error(&e);
                    tracing::debug!("REST refused by {}: {}", url_string, e);
                }
            }
        }

        let mut data = match stream.retr_as_stream(path.as_str()) {
            Ok(data) => data,
            Err(e) => {
                session.note_error(&e);
                let _ = started_tx.send(Err(AdapterError::unreachable(&url_string, e)));
                return;
            }
        };
        // the control socket timeout does not cover the data connection
        if let Err(e) = data.get_ref().set_read_timeout(Some(read_timeout)) {
            session.mark_broken();
            let _ = started_tx.send(Err(AdapterError::unreachable(&url_string, e)));
            return;
        }
        if started_tx.send(Ok(Some(starts_at))).is_err() {
            session.mark_broken();
            return;
        }

        let mut buf = vec![0u8; FTP_READ_BUFFER];
        loop {
            if tx.is_closed() {
                // consumer gave up mid transfer; control channel state is unknown
                session.mark_broken();
                return;
            }
            match data.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    session.touch();
                    if tx.send_blocking(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        session.mark_broken();
                        return;
                    }
                    session.touch();
                }
                Err(e) => {
                    session.mark_broken();
                    let _ = tx.send_blocking(Err(AdapterError::unreachable(&url_string, e)));
                    return;
                }
            }
        }

        if let Err(e) = stream.finalize_retr_stream(data) {
            session.note_error(&e);
            let _ = tx.send_blocking(Err(AdapterError::unreachable(&url_string, e)));
        }
    });

    (started_rx, rx)
}

/// One control connection per `host:port`.
fn session_key(url: &Url) -> Result<String, AdapterError> {
    let host = url
        .host_str()
        .ok_or_else(|| AdapterError::unreachable(url, "missing host"))?;
    Ok(format!("{}:{}", host, url.port().unwrap_or(FTP_DEFAULT_PORT)))
}

fn remote_path(url: &Url) -> String {
    percent_decode_str(url.path())
        .decode_utf8_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::{BufRead, BufReader, Write},
        net::{TcpListener, TcpStream},
        thread,
    };

    /// Passive-mode FTP server on a loopback port. Every control connection
    /// gets its own thread. When `stall` is set the data connection sends the
    /// first three bytes and then goes quiet without closing.
    fn spawn_ftp_server(payload: &'static [u8], stall: bool) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            for conn in listener.incoming() {
                let Ok(conn) = conn else { return };
                thread::spawn(move || {
                    let _ = serve_control(conn, payload, stall);
                });
            }
        });
        port
    }

    fn serve_control(conn: TcpStream, payload: &[u8], stall: bool) -> std::io::Result<()> {
        let mut reader = BufReader::new(conn.try_clone()?);
        let mut out = conn;
        out.write_all(b"220 ready\r\n")?;
        let mut data_listener: Option<TcpListener> = None;
        let mut offset = 0usize;
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Ok(());
            }
            let mut parts = line.trim_end().splitn(2, ' ');
            let verb = parts.next().unwrap_or_default().to_ascii_uppercase();
            let arg = parts.next().unwrap_or_default();
            match verb.as_str() {
                "USER" => out.write_all(b"331 password please\r\n")?,
                "PASS" => out.write_all(b"230 logged in\r\n")?,
                "TYPE" => out.write_all(b"200 type set\r\n")?,
                "SIZE" => write!(out, "213 {}\r\n", payload.len())?,
                "REST" => {
                    offset = arg.parse().unwrap_or(0);
                    out.write_all(b"350 restarting\r\n")?;
                }
                "PASV" => {
                    let data = TcpListener::bind("127.0.0.1:0")?;
                    let port = data.local_addr()?.port();
                    write!(
                        out,
                        "227 Entering Passive Mode (127,0,0,1,{},{})\r\n",
                        port >> 8,
                        port & 0xff
                    )?;
                    data_listener = Some(data);
                }
                "RETR" => {
                    let Some(data) = data_listener.take() else {
                        out.write_all(b"425 use PASV first\r\n")?;
                        continue;
                    };
                    out.write_all(b"150 sending\r\n")?;
                    let (mut data, _) = data.accept()?;
                    if stall {
                        data.write_all(&payload[offset..offset + 3])?;
                        thread::sleep(Duration::from_secs(30));
                        return Ok(());
                    }
                    data.write_all(&payload[offset..])?;
                    drop(data);
                    offset = 0;
                    out.write_all(b"226 transfer complete\r\n")?;
                }
                "QUIT" => {
                    out.write_all(b"221 bye\r\n")?;
                    return Ok(());
                }
                _ => out.write_all(b"502 not implemented\r\n")?,
            }
        }
    }

    async fn read_all(stream: &mut ChunkStream) -> Result<Vec<u8>, AdapterError> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.read_chunk(1024).await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_size_and_resumed_retrieval() {
        const PAYLOAD: &[u8] = b"0123456789abcdefghij";
        let port = spawn_ftp_server(PAYLOAD, false);
        let adapter = FtpAdapter::new(Duration::from_secs(2), Duration::from_secs(2));
        let url = Url::parse(&format!("ftp://127.0.0.1:{}/pub/f.bin", port)).unwrap();

        assert_eq!(adapter.resolve_size(&url).await.unwrap(), 20);

        let mut stream = adapter.open(&url, 5).await.unwrap();
        assert_eq!(stream.starts_at(), 5);
        assert_eq!(read_all(&mut stream).await.unwrap(), &PAYLOAD[5..]);

        // the control connection is reused once the transfer is finalized
        let mut stream = adapter.open(&url, 0).await.unwrap();
        assert_eq!(stream.starts_at(), 0);
        assert_eq!(read_all(&mut stream).await.unwrap(), PAYLOAD);
        assert_eq!(adapter.sessions.len().await, 1);
        adapter.close().await;
    }

    #[tokio::test]
    async fn test_stalled_transfer_does_not_block_the_host() {
        const PAYLOAD: &[u8] = b"0123456789";
        let port = spawn_ftp_server(PAYLOAD, true);
        let adapter = FtpAdapter::new(Duration::from_secs(1), Duration::from_millis(300));
        let url = Url::parse(&format!("ftp://127.0.0.1:{}/f.bin", port)).unwrap();

        let mut stream = adapter.open(&url, 0).await.unwrap();
        assert!(read_all(&mut stream).await.is_err());
        drop(stream);

        let size = tokio::time::timeout(Duration::from_secs(5), adapter.resolve_size(&url))
            .await
            .expect("resolve_size waited on the stalled session");
        assert_eq!(size.unwrap(), 10);
    }

    #[test]
    fn test_session_key_defaults_port() {
        let url = Url::parse("ftp://ftp.example.org/pub/file.bam").unwrap();
        assert_eq!(session_key(&url).unwrap(), "ftp.example.org:21");
        let url = Url::parse("ftp://ftp.example.org:2121/pub/file.bam").unwrap();
        assert_eq!(session_key(&url).unwrap(), "ftp.example.org:2121");
    }

    #[test]
    fn test_remote_path_is_decoded() {
        let url = Url::parse("ftp://host/pub/my%20file.bam").unwrap();
        assert_eq!(remote_path(&url), "/pub/my file.bam");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_candidate_failure() {
        // nothing listens on port 1 of the loopback interface
        let adapter = FtpAdapter::new(Duration::from_millis(500), Duration::from_secs(1));
        let url = Url::parse("ftp://127.0.0.1:1/file.bin").unwrap();
        let err = adapter.resolve_size(&url).await.unwrap_err();
        assert!(matches!(err, AdapterError::EndpointUnreachable { .. }));
        assert!(adapter.sessions.is_empty().await);
    }
}
