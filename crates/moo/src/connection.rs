//! One transport endpoint: a lazily opened TCP socket with serialized
//! writes and line-oriented inbound reassembly.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use {
    anyhow::Result,
    async_trait::async_trait,
    moobridge_common::{Backlog, Cycle, QueueWorker, TaskQueue},
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{
            TcpStream,
            tcp::{OwnedReadHalf, OwnedWriteHalf},
        },
        sync::{Mutex, broadcast},
        task::JoinHandle,
    },
    tracing::{debug, warn},
};

use crate::error::TransportError;

/// A connection to the MOO server.
///
/// Created UNCONNECTED; the socket opens on the first queued send
/// (transmitting one login line if an identity is attached). Any connect or
/// write failure, and any remote close, destroys the connection for good —
/// callers get a fresh one from the multiplexer on the next send.
pub struct Connection {
    inner: Arc<ConnInner>,
    outbound: TaskQueue<SendWorker>,
}

struct ConnInner {
    host: String,
    port: u16,
    login: Option<String>,
    destroyed: AtomicBool,
    io: Mutex<IoState>,
    data_tx: broadcast::Sender<String>,
    receive: TaskQueue<RecvWorker>,
}

enum IoState {
    Unconnected,
    Connecting,
    Connected {
        writer: OwnedWriteHalf,
        reader: JoinHandle<()>,
    },
    Destroyed,
}

impl Connection {
    pub fn new(host: String, port: u16, login: Option<String>) -> Self {
        let (data_tx, _) = broadcast::channel(256);
        let receive = TaskQueue::new(RecvWorker {
            data_tx: data_tx.clone(),
        });
        let inner = Arc::new(ConnInner {
            host,
            port,
            login,
            destroyed: AtomicBool::new(false),
            io: Mutex::new(IoState::Unconnected),
            data_tx,
            receive,
        });
        let outbound = TaskQueue::new(SendWorker {
            conn: Arc::clone(&inner),
        });
        Self { inner, outbound }
    }

    /// Queue one line for transmission. Fails immediately once destroyed;
    /// transport failures during the actual write surface by destroying the
    /// connection and dropping whatever was still queued.
    pub fn send(&self, line: &str) -> Result<(), TransportError> {
        if self.is_destroyed() {
            return Err(TransportError::Destroyed);
        }
        self.outbound.enqueue([line.to_string()]);
        Ok(())
    }

    /// Subscribe to reassembled inbound data. Each event is one drain
    /// cycle's worth of complete lines, joined by `\n` — never a partial
    /// line.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.inner.data_tx.subscribe()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }
}

/// Outbound queue logic: one line per cycle, connecting on demand.
struct SendWorker {
    conn: Arc<ConnInner>,
}

#[async_trait]
impl QueueWorker for SendWorker {
    type Item = String;
    type Payload = String;
    type Output = ();

    async fn extract(
        &self,
        backlog: &mut Backlog<String>,
        _previous: Option<&Cycle<String, ()>>,
    ) -> Result<String> {
        backlog
            .pop()
            .ok_or_else(|| anyhow::anyhow!("extract called on empty backlog"))
    }

    async fn execute(&self, payload: &String, _previous: Option<&Cycle<String, ()>>) -> Result<()> {
        write_line(&self.conn, payload).await?;
        Ok(())
    }
}

async fn write_line(conn: &Arc<ConnInner>, line: &str) -> Result<(), TransportError> {
    let mut io = conn.io.lock().await;

    if matches!(&*io, IoState::Unconnected) {
        *io = IoState::Connecting;
        match open_socket(conn).await {
            Ok(connected) => *io = connected,
            Err(e) => {
                drop(io);
                conn.destroy().await;
                return Err(e);
            },
        }
    }

    match &mut *io {
        IoState::Connected { writer, .. } => {
            let mut bytes = Vec::with_capacity(line.len() + 1);
            bytes.extend_from_slice(line.as_bytes());
            bytes.push(b'\n');
            if let Err(e) = writer.write_all(&bytes).await {
                drop(io);
                conn.destroy().await;
                return Err(TransportError::Write(e));
            }
            Ok(())
        },
        // The outbound queue is single-flight, so nobody can observe
        // Connecting here; Destroyed means a racing reader killed us.
        _ => Err(TransportError::Destroyed),
    }
}

async fn open_socket(conn: &Arc<ConnInner>) -> Result<IoState, TransportError> {
    debug!(host = %conn.host, port = conn.port, "connecting to MOO server");
    let stream = TcpStream::connect((conn.host.as_str(), conn.port))
        .await
        .map_err(|source| TransportError::Connect {
            host: conn.host.clone(),
            port: conn.port,
            source,
        })?;
    let (read_half, mut writer) = stream.into_split();

    if let Some(login) = &conn.login {
        let line = format!("connect {login}\n");
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(TransportError::Write)?;
    }

    let reader = tokio::spawn(read_loop(Arc::clone(conn), read_half));
    Ok(IoState::Connected { writer, reader })
}

impl ConnInner {
    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        let mut io = self.io.lock().await;
        if let IoState::Connected { reader, .. } = &*io {
            reader.abort();
        }
        // Dropping the write half closes the socket.
        *io = IoState::Destroyed;
    }
}

async fn read_loop(conn: Arc<ConnInner>, mut read_half: OwnedReadHalf) {
    let mut buf = vec![0u8; 4096];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                debug!(host = %conn.host, "remote closed connection");
                break;
            },
            Ok(n) => conn.receive.enqueue([buf[..n].to_vec()]),
            Err(error) => {
                warn!(%error, host = %conn.host, "socket read failed");
                break;
            },
        }
    }
    conn.destroy().await;
}

/// Inbound queue logic: gather every buffered chunk plus the previous
/// cycle's remainder, cut at the last line terminator, carry the tail.
struct RecvWorker {
    data_tx: broadcast::Sender<String>,
}

struct ReadyChunk {
    data: String,
    remaining: Vec<u8>,
}

#[async_trait]
impl QueueWorker for RecvWorker {
    type Item = Vec<u8>;
    type Payload = ReadyChunk;
    type Output = ();

    async fn extract(
        &self,
        backlog: &mut Backlog<Vec<u8>>,
        previous: Option<&Cycle<ReadyChunk, ()>>,
    ) -> Result<ReadyChunk> {
        let mut buffer = previous
            .map(|c| c.payload.remaining.clone())
            .unwrap_or_default();
        while let Some(chunk) = backlog.pop() {
            buffer.extend(chunk.into_iter().filter(|&b| b != b'\r'));
        }
        Ok(split_ready(buffer))
    }

    async fn execute(
        &self,
        payload: &ReadyChunk,
        _previous: Option<&Cycle<ReadyChunk, ()>>,
    ) -> Result<()> {
        // No complete line yet: emit nothing, keep accumulating.
        if !payload.data.is_empty() {
            let _ = self.data_tx.send(payload.data.clone());
        }
        Ok(())
    }
}

fn split_ready(buffer: Vec<u8>) -> ReadyChunk {
    match buffer.iter().rposition(|&b| b == b'\n') {
        Some(idx) => ReadyChunk {
            data: String::from_utf8_lossy(&buffer[..idx]).into_owned(),
            remaining: buffer[idx + 1..].to_vec(),
        },
        None => ReadyChunk {
            data: String::new(),
            remaining: buffer,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncBufReadExt, BufReader},
        net::TcpListener,
    };

    use super::*;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn split_ready_cuts_at_last_terminator() {
        let r = split_ready(b"abc\nde\nf".to_vec());
        assert_eq!(r.data, "abc\nde");
        assert_eq!(r.remaining, b"f");
    }

    #[test]
    fn split_ready_without_terminator_keeps_everything() {
        let r = split_ready(b"partial".to_vec());
        assert_eq!(r.data, "");
        assert_eq!(r.remaining, b"partial");
    }

    #[tokio::test]
    async fn reassembly_joins_chunks_and_carries_remainder() {
        let (tx, mut rx) = broadcast::channel(16);
        let queue = TaskQueue::new(RecvWorker { data_tx: tx });

        queue.enqueue([b"ab".to_vec()]);
        settle().await;
        queue.enqueue([b"c\n".to_vec()]);
        settle().await;
        assert_eq!(rx.recv().await.unwrap(), "abc");

        queue.enqueue([b"de\nf".to_vec()]);
        settle().await;
        assert_eq!(rx.recv().await.unwrap(), "de");

        // "f" stays buffered until its line terminator shows up.
        queue.enqueue([b"g\n".to_vec()]);
        settle().await;
        assert_eq!(rx.recv().await.unwrap(), "fg");
    }

    #[tokio::test]
    async fn reassembly_strips_carriage_returns() {
        let (tx, mut rx) = broadcast::channel(16);
        let queue = TaskQueue::new(RecvWorker { data_tx: tx });
        queue.enqueue([b"one\r\ntwo\r\n".to_vec()]);
        settle().await;
        assert_eq!(rx.recv().await.unwrap(), "one\ntwo");
    }

    #[tokio::test]
    async fn connects_lazily_and_sends_login_then_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let conn = Connection::new("127.0.0.1".to_string(), port, Some("Wizard".to_string()));
        conn.send("look").unwrap();

        let (sock, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(sock);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "connect Wizard\n");
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "look\n");
    }

    #[tokio::test]
    async fn no_login_line_without_identity() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let conn = Connection::new("127.0.0.1".to_string(), port, None);
        conn.send("look").unwrap();

        let (sock, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(sock);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "look\n");
    }

    #[tokio::test]
    async fn writes_stay_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let conn = Connection::new("127.0.0.1".to_string(), port, None);
        for i in 0..10 {
            conn.send(&format!("line {i}")).unwrap();
        }

        let (sock, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(sock);
        for i in 0..10 {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line, format!("line {i}\n"));
        }
    }

    #[tokio::test]
    async fn inbound_data_reaches_subscribers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let conn = Connection::new("127.0.0.1".to_string(), port, None);
        let mut rx = conn.subscribe();
        conn.send("hello").unwrap();

        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(b"You see nothing special.\n").await.unwrap();

        let blob = rx.recv().await.unwrap();
        assert_eq!(blob, "You see nothing special.");
    }

    #[tokio::test]
    async fn remote_close_destroys_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let conn = Connection::new("127.0.0.1".to_string(), port, None);
        conn.send("hello").unwrap();

        let (sock, _) = listener.accept().await.unwrap();
        drop(sock);
        settle().await;

        assert!(conn.is_destroyed());
        assert!(matches!(
            conn.send("too late"),
            Err(TransportError::Destroyed)
        ));
    }

    #[tokio::test]
    async fn connect_failure_destroys_connection() {
        // Grab a port with no listener behind it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let conn = Connection::new("127.0.0.1".to_string(), port, None);
        conn.send("into the void").unwrap();
        settle().await;

        assert!(conn.is_destroyed());
    }
}
