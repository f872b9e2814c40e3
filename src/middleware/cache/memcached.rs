//! Memcached store speaking the text protocol over TCP.
//!
//! # Responsibilities
//! - `get` / `set` against a list of servers
//! - Pick a server per key with a stable hash
//! - Keep a few idle connections per server
//!
//! # Design Decisions
//! - One request per connection checkout; a failed connection is dropped
//! - Every operation runs under a single deadline
//! - Expirations over 30 days are sent as absolute unix time (memcached rule)

use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

use super::entry::MAX_KEY_LEN;
use super::store::{CacheStore, StoreError, StoreItem};

/// Idle connections kept per server.
const MAX_IDLE_CONNS: usize = 2;

/// Relative expirations above this are read as unix timestamps by memcached.
const RELATIVE_EXPIRATION_LIMIT: u32 = 60 * 60 * 24 * 30;

type Conn = BufStream<TcpStream>;

struct Server {
    addr: String,
    idle: Mutex<Vec<Conn>>,
}

/// A memcached client over one or more servers.
pub struct MemcachedStore {
    servers: Vec<Server>,
    timeout: Duration,
}

impl MemcachedStore {
    pub fn new<I, S>(servers: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let servers = servers
            .into_iter()
            .map(|addr| Server {
                addr: addr.into(),
                idle: Mutex::new(Vec::new()),
            })
            .collect();
        Self { servers, timeout }
    }

    fn pick(&self, key: &str) -> Result<&Server, StoreError> {
        if self.servers.is_empty() {
            return Err(StoreError::NoServers);
        }
        let index = fnv1a(key.as_bytes()) as usize % self.servers.len();
        Ok(&self.servers[index])
    }

    async fn checkout(&self, server: &Server) -> Result<Conn, StoreError> {
        let idle = server.idle.lock().expect("memcached pool mutex poisoned").pop();
        match idle {
            Some(conn) => Ok(conn),
            None => {
                let stream = TcpStream::connect(&server.addr).await?;
                stream.set_nodelay(true)?;
                Ok(BufStream::new(stream))
            }
        }
    }

    fn checkin(&self, server: &Server, conn: Conn) {
        let mut idle = server.idle.lock().expect("memcached pool mutex poisoned");
        if idle.len() < MAX_IDLE_CONNS {
            idle.push(conn);
        }
    }

    async fn with_deadline<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.timeout, op)
            .await
            .unwrap_or(Err(StoreError::Timeout))
    }
}

#[async_trait]
impl CacheStore for MemcachedStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        check_key(key)?;
        let server = self.pick(key)?;
        self.with_deadline(async {
            let mut conn = self.checkout(server).await?;
            let value = read_get(&mut conn, key).await?;
            self.checkin(server, conn);
            Ok(value)
        })
        .await
    }

    async fn set(&self, item: StoreItem) -> Result<(), StoreError> {
        check_key(&item.key)?;
        let server = self.pick(&item.key)?;
        let exptime = wire_expiration(item.expiration_secs, SystemTime::now());
        self.with_deadline(async {
            let mut conn = self.checkout(server).await?;
            write_set(&mut conn, &item.key, exptime, &item.value).await?;
            self.checkin(server, conn);
            Ok(())
        })
        .await
    }
}

fn check_key(key: &str) -> Result<(), StoreError> {
    if key.len() > MAX_KEY_LEN {
        return Err(StoreError::KeyTooLong);
    }
    if key.is_empty() || key.bytes().any(|b| b <= b' ' || b == 0x7f) {
        return Err(StoreError::Protocol(format!("malformed key {key:?}")));
    }
    Ok(())
}

fn wire_expiration(secs: u32, now: SystemTime) -> u32 {
    if secs <= RELATIVE_EXPIRATION_LIMIT {
        return secs;
    }
    let now = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    u32::try_from(now + u64::from(secs)).unwrap_or(u32::MAX)
}

fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5u32, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(0x0100_0193)
    })
}

async fn read_line<S>(conn: &mut S) -> Result<String, StoreError>
where
    S: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    if conn.read_line(&mut line).await? == 0 {
        return Err(StoreError::Protocol("connection closed".into()));
    }
    if !line.ends_with("\r\n") {
        return Err(StoreError::Protocol(format!("unterminated line {line:?}")));
    }
    line.truncate(line.len() - 2);
    Ok(line)
}

fn server_error(line: &str) -> StoreError {
    StoreError::Protocol(line.to_string())
}

async fn read_get<S>(conn: &mut S, key: &str) -> Result<Option<Vec<u8>>, StoreError>
where
    S: AsyncBufReadExt + AsyncWriteExt + Unpin,
{
    conn.write_all(format!("get {key}\r\n").as_bytes()).await?;
    conn.flush().await?;

    let line = read_line(conn).await?;
    if line == "END" {
        return Ok(None);
    }
    // VALUE <key> <flags> <bytes> [<cas unique>]
    let mut fields = line.split(' ');
    if fields.next() != Some("VALUE") || fields.next() != Some(key) {
        return Err(server_error(&line));
    }
    let len: usize = fields
        .nth(1)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| server_error(&line))?;

    let mut value = vec![0u8; len + 2];
    conn.read_exact(&mut value).await?;
    if !value.ends_with(b"\r\n") {
        return Err(StoreError::Protocol("value not terminated".into()));
    }
    value.truncate(len);

    let end = read_line(conn).await?;
    if end != "END" {
        return Err(server_error(&end));
    }
    Ok(Some(value))
}

async fn write_set<S>(conn: &mut S, key: &str, exptime: u32, value: &[u8]) -> Result<(), StoreError>
where
    S: AsyncBufReadExt + AsyncWriteExt + Unpin,
{
    conn.write_all(format!("set {key} 0 {exptime} {}\r\n", value.len()).as_bytes())
        .await?;
    conn.write_all(value).await?;
    conn.write_all(b"\r\n").await?;
    conn.flush().await?;

    match read_line(conn).await?.as_str() {
        "STORED" => Ok(()),
        "NOT_STORED" => Err(StoreError::NotStored),
        other => Err(server_error(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_wire_expiration() {
        let now = UNIX_EPOCH + Duration::from_secs(1_000_000);
        assert_eq!(wire_expiration(0, now), 0);
        assert_eq!(wire_expiration(3600, now), 3600);
        assert_eq!(wire_expiration(RELATIVE_EXPIRATION_LIMIT + 1, now), 1_000_000 + RELATIVE_EXPIRATION_LIMIT + 1);
    }

    #[test]
    fn test_check_key() {
        assert!(check_key("ch/ABC").is_ok());
        assert!(matches!(check_key("has space"), Err(StoreError::Protocol(_))));
        assert!(matches!(check_key(&"k".repeat(251)), Err(StoreError::KeyTooLong)));
    }

    #[tokio::test]
    async fn test_get_parses_value() {
        let (client, mut server) = duplex(1024);
        let mut client = BufStream::new(client);
        server
            .write_all(b"VALUE ch/K 0 5\r\nhello\r\nEND\r\n")
            .await
            .unwrap();

        let value = read_get(&mut client, "ch/K").await.unwrap();
        assert_eq!(value.as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn test_get_miss_and_error() {
        let (client, mut server) = duplex(1024);
        let mut client = BufStream::new(client);
        server.write_all(b"END\r\nSERVER_ERROR out of memory\r\n").await.unwrap();

        assert!(read_get(&mut client, "k").await.unwrap().is_none());
        assert!(matches!(read_get(&mut client, "k").await, Err(StoreError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_set_outcomes() {
        let (client, mut server) = duplex(1024);
        let mut client = BufStream::new(client);
        server.write_all(b"STORED\r\nNOT_STORED\r\n").await.unwrap();

        write_set(&mut client, "k", 10, b"v").await.unwrap();
        assert!(matches!(write_set(&mut client, "k", 10, b"v").await, Err(StoreError::NotStored)));
    }

    /// A tiny single-key memcached stand-in.
    async fn fake_memcached() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut conn = BufStream::new(socket);
            let mut stored: Option<Vec<u8>> = None;
            loop {
                let Ok(line) = read_line(&mut conn).await else { return };
                let parts: Vec<&str> = line.split(' ').collect();
                match parts[0] {
                    "set" => {
                        let len: usize = parts[4].parse().unwrap();
                        let mut data = vec![0u8; len + 2];
                        conn.read_exact(&mut data).await.unwrap();
                        data.truncate(len);
                        stored = Some(data);
                        conn.write_all(b"STORED\r\n").await.unwrap();
                    }
                    "get" => {
                        if let Some(data) = &stored {
                            let head = format!("VALUE {} 0 {}\r\n", parts[1], data.len());
                            conn.write_all(head.as_bytes()).await.unwrap();
                            conn.write_all(data).await.unwrap();
                            conn.write_all(b"\r\n").await.unwrap();
                        }
                        conn.write_all(b"END\r\n").await.unwrap();
                    }
                    _ => conn.write_all(b"ERROR\r\n").await.unwrap(),
                }
                conn.flush().await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_store_reuses_connection() {
        let addr = fake_memcached().await;
        let store = MemcachedStore::new([addr], Duration::from_secs(1));

        assert!(store.get("ch/K").await.unwrap().is_none());
        store
            .set(StoreItem { key: "ch/K".into(), value: b"entry".to_vec(), expiration_secs: 60 })
            .await
            .unwrap();
        // The fake accepts a single connection, so this only passes if pooled.
        assert_eq!(store.get("ch/K").await.unwrap().as_deref(), Some(&b"entry"[..]));
    }

    #[tokio::test]
    async fn test_store_without_servers() {
        let store = MemcachedStore::new(Vec::<String>::new(), Duration::from_secs(1));
        assert!(matches!(store.get("k").await, Err(StoreError::NoServers)));
    }
}
