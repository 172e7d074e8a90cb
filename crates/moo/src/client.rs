//! Session multiplexer: one MOO connection per chat user, plus a privileged
//! service connection, behind a single client handle.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use {
    moobridge_common::UserId,
    tokio::{sync::broadcast, task::JoinHandle},
    tracing::debug,
};

use crate::{connection::Connection, error::TransportError, identity::PlayerResolver};

/// Multiplexes per-user sessions to one MOO server.
///
/// Connections are created lazily on first send and replaced transparently
/// once destroyed. Inbound data fans out on two distinct streams: per-user
/// `(user, data)` events and the service connection's data.
pub struct MooClient {
    host: String,
    port: u16,
    resolver: Arc<dyn PlayerResolver>,
    service_login: Option<String>,
    sessions: Mutex<HashMap<UserId, Session>>,
    service: Mutex<Session>,
    data_tx: broadcast::Sender<(UserId, String)>,
    service_tx: broadcast::Sender<String>,
}

struct Session {
    conn: Arc<Connection>,
    pump: JoinHandle<()>,
}

impl MooClient {
    /// `address` is `host:port`. The service connection is created up front
    /// (its socket still opens lazily, on the first service send).
    pub fn new(
        address: &str,
        service_login: Option<String>,
        resolver: Arc<dyn PlayerResolver>,
    ) -> Result<Self, TransportError> {
        let (host, port) = parse_address(address)?;
        let (data_tx, _) = broadcast::channel(256);
        let (service_tx, _) = broadcast::channel(256);

        let conn = Arc::new(Connection::new(host.clone(), port, service_login.clone()));
        let pump = pump_service(Arc::clone(&conn), service_tx.clone());

        Ok(Self {
            host,
            port,
            resolver,
            service_login,
            sessions: Mutex::new(HashMap::new()),
            service: Mutex::new(Session { conn, pump }),
            data_tx,
            service_tx,
        })
    }

    /// Forward one line to the user's session, creating or replacing the
    /// connection as needed.
    pub async fn send(&self, user: &UserId, text: &str) -> Result<(), TransportError> {
        let conn = self.session(user).await;
        conn.send(text)
    }

    /// Forward one line to the privileged service connection.
    pub fn service_send(&self, text: &str) -> Result<(), TransportError> {
        let conn = {
            let mut service = self.service.lock().unwrap_or_else(|e| e.into_inner());
            if service.conn.is_destroyed() {
                debug!("replacing destroyed service connection");
                let conn = Arc::new(Connection::new(
                    self.host.clone(),
                    self.port,
                    self.service_login.clone(),
                ));
                let pump = pump_service(Arc::clone(&conn), self.service_tx.clone());
                let old = std::mem::replace(&mut *service, Session {
                    conn: Arc::clone(&conn),
                    pump,
                });
                old.pump.abort();
                conn
            } else {
                Arc::clone(&service.conn)
            }
        };
        conn.send(text)
    }

    /// The user's live connection, if one exists right now. Never creates.
    pub fn existing(&self, user: &UserId) -> Option<Arc<Connection>> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(user)
            .filter(|s| !s.conn.is_destroyed())
            .map(|s| Arc::clone(&s.conn))
    }

    /// Per-user inbound data, as `(user, data)` pairs.
    pub fn subscribe_data(&self) -> broadcast::Receiver<(UserId, String)> {
        self.data_tx.subscribe()
    }

    /// Service connection inbound data.
    pub fn subscribe_service_data(&self) -> broadcast::Receiver<String> {
        self.service_tx.subscribe()
    }

    async fn session(&self, user: &UserId) -> Arc<Connection> {
        if let Some(live) = self.existing(user) {
            return live;
        }

        let login = self.resolver.resolve_player_name(user).await;
        debug!(user = %user, login = login.as_deref().unwrap_or("<none>"), "opening session");
        let conn = Arc::new(Connection::new(self.host.clone(), self.port, login));
        let pump = pump_user(Arc::clone(&conn), user.clone(), self.data_tx.clone());

        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match sessions.get(user) {
            // Someone else won the race with a live connection; use theirs.
            Some(existing) if !existing.conn.is_destroyed() => {
                pump.abort();
                Arc::clone(&existing.conn)
            },
            _ => {
                if let Some(old) = sessions.insert(user.clone(), Session {
                    conn: Arc::clone(&conn),
                    pump,
                }) {
                    old.pump.abort();
                }
                conn
            },
        }
    }
}

fn pump_user(
    conn: Arc<Connection>,
    user: UserId,
    data_tx: broadcast::Sender<(UserId, String)>,
) -> JoinHandle<()> {
    let mut rx = conn.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(blob) => {
                    let _ = data_tx.send((user.clone(), blob));
                },
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn pump_service(conn: Arc<Connection>, service_tx: broadcast::Sender<String>) -> JoinHandle<()> {
    let mut rx = conn.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(blob) => {
                    let _ = service_tx.send(blob);
                },
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn parse_address(address: &str) -> Result<(String, u16), TransportError> {
    let invalid = || TransportError::InvalidAddress(address.to_string());
    let (host, port) = address.split_once(':').ok_or_else(invalid)?;
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
    };

    use crate::identity::{PassthroughResolver, UnresolvedPlayers};

    use super::*;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn address_parsing() {
        assert!(parse_address("moo.example.net:7777").is_ok());
        for bad in ["", "nocolon", ":7777", "host:", "host:notaport"] {
            assert!(
                matches!(parse_address(bad), Err(TransportError::InvalidAddress(_))),
                "accepted '{bad}'"
            );
        }
    }

    #[tokio::test]
    async fn creates_session_lazily_with_resolved_login() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        let client = MooClient::new(&addr, None, Arc::new(PassthroughResolver)).unwrap();

        client.send(&UserId::from("alice"), "look").await.unwrap();

        let (sock, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(sock);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "connect alice\n");
    }

    #[tokio::test]
    async fn separate_users_get_separate_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        let client = MooClient::new(&addr, None, Arc::new(UnresolvedPlayers)).unwrap();

        client.send(&UserId::from("alice"), "look").await.unwrap();
        client.send(&UserId::from("bob"), "look").await.unwrap();

        listener.accept().await.unwrap();
        listener.accept().await.unwrap();
    }

    #[tokio::test]
    async fn per_user_data_is_tagged_with_the_user() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        let client = MooClient::new(&addr, None, Arc::new(UnresolvedPlayers)).unwrap();
        let mut rx = client.subscribe_data();

        client.send(&UserId::from("alice"), "look").await.unwrap();
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(b"A small white house.\n").await.unwrap();

        let (user, blob) = rx.recv().await.unwrap();
        assert_eq!(user, UserId::from("alice"));
        assert_eq!(blob, "A small white house.");
    }

    #[tokio::test]
    async fn destroyed_session_is_replaced_on_next_send() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        let client = MooClient::new(&addr, None, Arc::new(UnresolvedPlayers)).unwrap();
        let user = UserId::from("alice");

        client.send(&user, "one").await.unwrap();
        let (sock, _) = listener.accept().await.unwrap();
        drop(sock);
        settle().await;
        assert!(client.existing(&user).is_none());

        client.send(&user, "two").await.unwrap();
        let (sock, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(sock);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "two\n");
    }

    #[tokio::test]
    async fn service_connection_carries_its_login_and_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        let client =
            MooClient::new(&addr, Some("slackbot".to_string()), Arc::new(UnresolvedPlayers))
                .unwrap();
        let mut rx = client.subscribe_service_data();

        client.service_send("= C123 general alice Alice who").unwrap();

        let (sock, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(sock);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "connect slackbot\n");
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "= C123 general alice Alice who\n");

        reader
            .into_inner()
            .write_all(b"#SLACK# C123 hello\n")
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), "#SLACK# C123 hello");
    }
}
