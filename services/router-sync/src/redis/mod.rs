//! Redis-backed routing store.
//!
//! A single RESP2 connection guarded by a mutex. Batches are sent as one
//! `MULTI` ... `EXEC` pipeline so readers never see a half-written entry.
//! A connection that fails is dropped and re-established on the next call.

mod resp;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use expose_reconcile::{Batch, BatchOp, KvStore, StoreError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use resp::{encode_command, parse_reply, Reply};

/// Default Redis port.
pub const DEFAULT_PORT: u16 = 6379;

/// Keys requested per `SCAN` round trip.
const SCAN_COUNT: &str = "100";

/// Parsed `redis://[[user]:password@]host[:port][/db]` URL.
#[derive(Clone, PartialEq, Eq)]
pub struct RedisUrl {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub db: u32,
}

impl fmt::Debug for RedisUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisUrl")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("db", &self.db)
            .finish()
    }
}

impl fmt::Display for RedisUrl {
    /// Credential-free form, safe to log.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "redis://[{}]:{}/{}", self.host, self.port, self.db)
        } else {
            write!(f, "redis://{}:{}/{}", self.host, self.port, self.db)
        }
    }
}

impl FromStr for RedisUrl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .trim()
            .strip_prefix("redis://")
            .ok_or_else(|| format!("unsupported store URL {s:?} (expected redis://...)"))?;

        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (rest, ""),
        };

        let (credentials, host_port) = match authority.rsplit_once('@') {
            Some((credentials, host_port)) => (Some(credentials), host_port),
            None => (None, authority),
        };

        let (username, password) = match credentials {
            None => (None, None),
            Some(credentials) => match credentials.split_once(':') {
                Some((user, pass)) => (
                    Some(user.to_string()).filter(|u| !u.is_empty()),
                    Some(pass.to_string()).filter(|p| !p.is_empty()),
                ),
                None => (Some(credentials.to_string()).filter(|u| !u.is_empty()), None),
            },
        };

        let (host, port) = split_host_port(host_port)?;
        if host.is_empty() {
            return Err(format!("store URL {s:?} has no host"));
        }

        let db = match path.trim_matches('/') {
            "" => 0,
            db => db
                .parse()
                .map_err(|_| format!("invalid database index {db:?} in store URL"))?,
        };

        Ok(Self {
            host,
            port,
            username,
            password,
            db,
        })
    }
}

fn split_host_port(host_port: &str) -> Result<(String, u16), String> {
    let parse_port = |raw: &str| {
        raw.parse::<u16>()
            .map_err(|_| format!("invalid port {raw:?} in store URL"))
    };

    if let Some(bracketed) = host_port.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| format!("unterminated IPv6 host in {host_port:?}"))?;
        let port = match after.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None => DEFAULT_PORT,
        };
        return Ok((host.to_string(), port));
    }

    match host_port.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), parse_port(port)?)),
        None => Ok((host_port.to_string(), DEFAULT_PORT)),
    }
}

/// One open RESP2 connection.
struct Connection {
    stream: TcpStream,
    buf: BytesMut,
}

impl Connection {
    async fn open(url: &RedisUrl) -> Result<Self, StoreError> {
        let stream = TcpStream::connect((url.host.as_str(), url.port))
            .await
            .map_err(|e| StoreError::Connection(format!("connect to {url}: {e}")))?;

        let mut conn = Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        };

        if let Some(password) = &url.password {
            let reply = match &url.username {
                Some(user) => {
                    conn.command(&["AUTH", user.as_str(), password.as_str()])
                        .await?
                }
                None => conn.command(&["AUTH", password.as_str()]).await?,
            };
            reply.into_result()?;
        }

        if url.db != 0 {
            let db = url.db.to_string();
            conn.command(&["SELECT", db.as_str()])
                .await?
                .into_result()?;
        }

        Ok(conn)
    }

    /// Send pipelined commands in one write.
    async fn send(&mut self, commands: &[Vec<&str>]) -> Result<(), StoreError> {
        let mut out = BytesMut::new();
        for args in commands {
            encode_command(&mut out, args);
        }
        self.stream
            .write_all(&out)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    async fn read_reply(&mut self) -> Result<Reply, StoreError> {
        loop {
            if let Some((reply, used)) = parse_reply(&self.buf)? {
                self.buf.advance(used);
                return Ok(reply);
            }

            let n = self
                .stream
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            if n == 0 {
                return Err(StoreError::Connection("connection closed by server".into()));
            }
        }
    }

    async fn command(&mut self, args: &[&str]) -> Result<Reply, StoreError> {
        self.send(&[args.to_vec()]).await?;
        self.read_reply().await
    }
}

/// [`KvStore`] backed by a Redis server.
pub struct RedisStore {
    url: RedisUrl,
    conn: Mutex<Option<Connection>>,
}

impl RedisStore {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(url: RedisUrl) -> Result<Self, StoreError> {
        let store = Self {
            url,
            conn: Mutex::new(None),
        };
        store.ping().await?;
        info!(url = %store.url, "connected to redis");
        Ok(store)
    }

    pub fn url(&self) -> &RedisUrl {
        &self.url
    }

    /// Run `op` on the connection, opening it first if needed.
    ///
    /// The connection is discarded when `op` fails with a connection or
    /// protocol error, since its reply stream may be out of step.
    async fn with_connection<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: for<'c> FnOnce(
            &'c mut Connection,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<T, StoreError>> + Send + 'c>,
        >,
    {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            debug!(url = %self.url, "opening redis connection");
            *guard = Some(Connection::open(&self.url).await?);
        }

        let Some(conn) = guard.as_mut() else {
            return Err(StoreError::Connection("no connection".into()));
        };

        let result = op(conn).await;
        if let Err(e @ (StoreError::Connection(_) | StoreError::Protocol(_))) = &result {
            warn!(error = %e, "dropping redis connection");
            *guard = None;
        }
        result
    }
}

/// Escape glob metacharacters for `SCAN ... MATCH`.
fn escape_glob(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Check the replies of a `MULTI` ... `EXEC` pipeline, in order.
fn check_transaction(replies: Vec<Reply>) -> Result<(), StoreError> {
    let Some((exec, queued)) = replies.split_last() else {
        return Err(StoreError::Protocol("empty transaction reply".into()));
    };

    // MULTI and every queued command answer with a status; a rejected
    // command makes EXEC fail with EXECABORT.
    for reply in queued {
        if let Reply::Error(message) = reply {
            return Err(StoreError::Server(message.clone()));
        }
    }

    match exec {
        Reply::Array(Some(results)) => {
            for result in results {
                if let Reply::Error(message) = result {
                    return Err(StoreError::Server(message.clone()));
                }
            }
            Ok(())
        }
        Reply::Array(None) => Err(StoreError::TransactionAborted),
        Reply::Error(message) => Err(StoreError::Server(message.clone())),
        other => Err(StoreError::Protocol(format!(
            "unexpected EXEC reply {other:?}"
        ))),
    }
}

/// Split a `SCAN` reply into the next cursor and the keys of this page.
fn parse_scan_page(reply: Reply) -> Result<(String, Vec<String>), StoreError> {
    let Reply::Array(Some(mut parts)) = reply.into_result()? else {
        return Err(StoreError::Protocol("SCAN reply is not an array".into()));
    };
    if parts.len() != 2 {
        return Err(StoreError::Protocol(format!(
            "SCAN reply has {} elements",
            parts.len()
        )));
    }

    let keys = parts.pop().unwrap_or(Reply::Array(None));
    let cursor = parts.pop().unwrap_or(Reply::Bulk(None)).into_string()?;

    let keys = match keys {
        Reply::Array(Some(items)) => items
            .into_iter()
            .map(Reply::into_string)
            .collect::<Result<Vec<_>, _>>()?,
        other => {
            return Err(StoreError::Protocol(format!(
                "unexpected SCAN key list {other:?}"
            )))
        }
    };
    Ok((cursor, keys))
}

/// `GET` answers with a null bulk string for a missing key.
fn parse_get_reply(reply: Reply) -> Result<Option<String>, StoreError> {
    match reply.into_result()? {
        Reply::Bulk(None) => Ok(None),
        other => other.into_string().map(Some),
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            Box::pin(async move {
                let pong = conn.command(&["PING"]).await?.into_string()?;
                if pong != "PONG" {
                    return Err(StoreError::Protocol(format!("unexpected PING reply {pong:?}")));
                }
                Ok(())
            })
        })
        .await
    }

    async fn apply(&self, batch: Batch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let (sets, deletes) = (batch.sets(), batch.deletes());
        self.with_connection(move |conn| {
            Box::pin(async move {
                let mut commands: Vec<Vec<&str>> = Vec::with_capacity(batch.len() + 2);
                commands.push(vec!["MULTI"]);
                for op in batch.ops() {
                    match op {
                        BatchOp::Set { key, value } => {
                            commands.push(vec!["SET", key.as_str(), value.as_str()])
                        }
                        BatchOp::Delete { key } => commands.push(vec!["DEL", key.as_str()]),
                    }
                }
                commands.push(vec!["EXEC"]);

                conn.send(&commands).await?;
                let mut replies = Vec::with_capacity(commands.len());
                for _ in 0..commands.len() {
                    replies.push(conn.read_reply().await?);
                }
                check_transaction(replies)
            })
        })
        .await?;

        debug!(sets, deletes, "redis batch committed");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.with_connection(move |conn| {
            Box::pin(async move { parse_get_reply(conn.command(&["GET", key.as_str()]).await?) })
        })
        .await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{}*", escape_glob(prefix));
        self.with_connection(move |conn| {
            Box::pin(async move {
                let mut keys = Vec::new();
                let mut cursor = "0".to_string();
                loop {
                    let reply = conn
                        .command(&[
                            "SCAN",
                            cursor.as_str(),
                            "MATCH",
                            pattern.as_str(),
                            "COUNT",
                            SCAN_COUNT,
                        ])
                        .await?;
                    let (next, page) = parse_scan_page(reply)?;
                    keys.extend(page);
                    if next == "0" {
                        break;
                    }
                    cursor = next;
                }
                keys.sort();
                keys.dedup();
                Ok(keys)
            })
        })
        .await
    }
}
