//! Shared cache tier backed by Redis.
//!
//! The tier is optional: when no URL is configured or the connection cannot
//! be established, every read is a miss and every write is a no-op. Errors
//! after connecting are logged and swallowed the same way, so callers never
//! see this tier fail.

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A value read from the shared tier
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry<V> {
    pub value: V,
    /// Time the entry has left; `None` when the key carries no expiry
    pub ttl: Option<Duration>,
}

pub struct RemoteCache {
    conn: Option<ConnectionManager>,
    prefix: String,
}

impl RemoteCache {
    /// A tier that is permanently unavailable.
    pub fn disabled() -> Self {
        Self {
            conn: None,
            prefix: String::new(),
        }
    }

    /// Connect to Redis. Never fails: an unreachable server yields a
    /// disabled tier and a warning.
    pub async fn connect(redis_url: &str, prefix: &str, timeout: Duration) -> Self {
        let client = match redis::Client::open(redis_url) {
            Ok(client) => client,
            Err(e) => {
                warn!("Invalid Redis URL, shared cache disabled: {}", e);
                return Self::disabled();
            }
        };

        match tokio::time::timeout(timeout, ConnectionManager::new(client)).await {
            Ok(Ok(conn)) => {
                info!("Connected to shared cache (prefix: {})", prefix);
                Self {
                    conn: Some(conn),
                    prefix: prefix.to_string(),
                }
            }
            Ok(Err(e)) => {
                warn!("Redis connection failed, shared cache disabled: {}", e);
                Self::disabled()
            }
            Err(_) => {
                warn!(
                    "Redis connection timed out after {:?}, shared cache disabled",
                    timeout
                );
                Self::disabled()
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.conn.is_some()
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Read an entry together with its remaining TTL, fetched in the same
    /// round trip so a local copy never outlives the shared one.
    pub async fn get<V: DeserializeOwned>(&self, key: &str) -> Option<RemoteEntry<V>> {
        let mut conn = self.conn.clone()?;
        let name = self.key(key);
        let read: RedisResult<(Option<String>, i64)> = redis::pipe()
            .get(&name)
            .cmd("PTTL")
            .arg(&name)
            .query_async(&mut conn)
            .await;
        let (raw, remaining_ms) = match read {
            Ok(read) => read,
            Err(e) => {
                debug!(key = %key, "Shared cache read failed: {}", e);
                return None;
            }
        };

        let ttl = match remaining_ms {
            -1 => None,
            ms if ms > 0 => Some(Duration::from_millis(ms.unsigned_abs())),
            // -2: the key expired between GET and PTTL
            _ => return None,
        };

        match serde_json::from_str(&raw?) {
            Ok(value) => Some(RemoteEntry { value, ttl }),
            Err(e) => {
                debug!(key = %key, "Discarding undecodable shared cache entry: {}", e);
                None
            }
        }
    }

    pub async fn set<V: Serialize>(&self, key: &str, value: &V, ttl: Duration) {
        let Some(mut conn) = self.conn.clone() else {
            return;
        };
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(key = %key, "Could not encode shared cache entry: {}", e);
                return;
            }
        };

        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        if let Err(e) = conn
            .pset_ex::<_, _, ()>(self.key(key), payload, millis)
            .await
        {
            debug!(key = %key, "Shared cache write failed: {}", e);
        }
    }

    /// Delete every key under this tier's prefix, optionally narrowed to a
    /// class prefix such as `stats:`.
    pub async fn clear(&self, class_prefix: &str) {
        let Some(mut conn) = self.conn.clone() else {
            return;
        };
        let pattern = format!("{}{}*", self.prefix, class_prefix);
        let mut cursor: u64 = 0;
        let mut deleted = 0usize;

        loop {
            let scanned: Result<(u64, Vec<String>), _> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await;

            let (next, keys) = match scanned {
                Ok(page) => page,
                Err(e) => {
                    warn!("Shared cache scan failed: {}", e);
                    return;
                }
            };

            if !keys.is_empty() {
                deleted += keys.len();
                if let Err(e) = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async::<()>(&mut conn)
                    .await
                {
                    warn!("Shared cache delete failed: {}", e);
                    return;
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        info!("Cleared {} shared cache keys matching {}", deleted, pattern);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::{TcpListener, TcpStream};

    type Store = Arc<Mutex<HashMap<String, (Vec<u8>, Option<Instant>)>>>;

    /// In-process Redis speaking enough RESP2 for the shared tier: GET,
    /// PSETEX, PTTL, SCAN and DEL. Any other command gets `+OK`.
    pub struct FakeRedis {
        pub url: String,
        store: Store,
    }

    impl FakeRedis {
        pub async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("redis://{}/", listener.local_addr().unwrap());
            let store: Store = Arc::default();
            let shared = Arc::clone(&store);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(stream, Arc::clone(&shared)));
                }
            });
            Self { url, store }
        }

        /// Raw payload stored under the fully prefixed key
        pub fn raw(&self, key: &str) -> Option<String> {
            let store = self.store.lock().unwrap();
            store
                .get(key)
                .filter(|(_, expires)| expires.map_or(true, |at| at > Instant::now()))
                .map(|(value, _)| String::from_utf8_lossy(value).into_owned())
        }

        pub fn insert_raw(&self, key: &str, value: &str, ttl: Option<Duration>) {
            self.store.lock().unwrap().insert(
                key.to_string(),
                (value.as_bytes().to_vec(), ttl.map(|ttl| Instant::now() + ttl)),
            );
        }
    }

    async fn serve(stream: TcpStream, store: Store) {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        while let Some(args) = read_command(&mut reader).await {
            let reply = respond(&store, &args);
            if write.write_all(&reply).await.is_err() {
                break;
            }
        }
    }

    async fn read_command(reader: &mut BufReader<OwnedReadHalf>) -> Option<Vec<Vec<u8>>> {
        let mut line = String::new();
        reader.read_line(&mut line).await.ok()?;
        let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;

        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            line.clear();
            reader.read_line(&mut line).await.ok()?;
            let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
            let mut arg = vec![0; len + 2];
            reader.read_exact(&mut arg).await.ok()?;
            arg.truncate(len);
            args.push(arg);
        }
        Some(args)
    }

    fn bulk(value: Option<&[u8]>) -> Vec<u8> {
        match value {
            Some(value) => {
                let mut out = format!("${}\r\n", value.len()).into_bytes();
                out.extend_from_slice(value);
                out.extend_from_slice(b"\r\n");
                out
            }
            None => b"$-1\r\n".to_vec(),
        }
    }

    fn respond(store: &Store, args: &[Vec<u8>]) -> Vec<u8> {
        let text = |i: usize| String::from_utf8_lossy(&args[i]).into_owned();
        let now = Instant::now();
        let mut store = store.lock().unwrap();
        store.retain(|_, (_, expires)| expires.map_or(true, |at| at > now));

        match text(0).to_ascii_uppercase().as_str() {
            "GET" => bulk(store.get(&text(1)).map(|(value, _)| value.as_slice())),
            "PSETEX" => {
                let millis: u64 = text(2).parse().unwrap();
                let expires = now + Duration::from_millis(millis);
                store.insert(text(1), (args[3].clone(), Some(expires)));
                b"+OK\r\n".to_vec()
            }
            "PTTL" => match store.get(&text(1)) {
                None => b":-2\r\n".to_vec(),
                Some((_, None)) => b":-1\r\n".to_vec(),
                Some((_, Some(at))) => format!(":{}\r\n", (*at - now).as_millis()).into_bytes(),
            },
            "DEL" => {
                let removed = args[1..]
                    .iter()
                    .filter(|key| store.remove(String::from_utf8_lossy(key).as_ref()).is_some())
                    .count();
                format!(":{}\r\n", removed).into_bytes()
            }
            // One page holding every match: SCAN cursor MATCH pattern COUNT n
            "SCAN" => {
                let prefix = text(3).trim_end_matches('*').to_string();
                let keys: Vec<&String> = store.keys().filter(|k| k.starts_with(&prefix)).collect();
                let mut out = format!("*2\r\n$1\r\n0\r\n*{}\r\n", keys.len()).into_bytes();
                for key in keys {
                    out.extend(bulk(Some(key.as_bytes())));
                }
                out
            }
            _ => b"+OK\r\n".to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeRedis;
    use super::*;

    async fn connect(redis: &FakeRedis) -> RemoteCache {
        RemoteCache::connect(&redis.url, "t:", Duration::from_secs(2)).await
    }

    #[tokio::test]
    async fn test_disabled_tier_misses_and_ignores_writes() {
        let remote = RemoteCache::disabled();
        assert!(!remote.is_available());

        remote.set("stats:1:ALL", &"value", Duration::from_secs(60)).await;
        let value: Option<RemoteEntry<String>> = remote.get("stats:1:ALL").await;
        assert!(value.is_none());

        remote.clear("").await;
    }

    #[tokio::test]
    async fn test_invalid_url_degrades_to_disabled() {
        let remote = RemoteCache::connect("not a url", "t:", Duration::from_millis(100)).await;
        assert!(!remote.is_available());
    }

    #[tokio::test]
    async fn test_unreachable_server_degrades_to_disabled() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("redis://{}/", listener.local_addr().unwrap());
        drop(listener);

        let remote = RemoteCache::connect(&url, "t:", Duration::from_millis(500)).await;
        assert!(!remote.is_available());
    }

    #[tokio::test]
    async fn test_get_reports_remaining_ttl() {
        let redis = FakeRedis::start().await;
        let remote = connect(&redis).await;
        assert!(remote.is_available());

        remote
            .set("stats:1:ALL", &"value", Duration::from_millis(1500))
            .await;
        assert_eq!(redis.raw("t:stats:1:ALL").as_deref(), Some("\"value\""));

        let entry: RemoteEntry<String> = remote.get("stats:1:ALL").await.unwrap();
        assert_eq!(entry.value, "value");
        let ttl = entry.ttl.unwrap();
        assert!(ttl <= Duration::from_millis(1500));
        assert!(ttl > Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_entry_without_expiry_and_undecodable_entry() {
        let redis = FakeRedis::start().await;
        let remote = connect(&redis).await;
        redis.insert_raw("t:forever", "[1,2]", None);
        redis.insert_raw("t:garbage", "{not json", Some(Duration::from_secs(60)));

        let entry: RemoteEntry<Vec<u32>> = remote.get("forever").await.unwrap();
        assert_eq!(entry.value, vec![1, 2]);
        assert_eq!(entry.ttl, None);

        let garbage: Option<RemoteEntry<Vec<u32>>> = remote.get("garbage").await;
        assert!(garbage.is_none());
    }

    #[tokio::test]
    async fn test_clear_removes_only_matching_class() {
        let redis = FakeRedis::start().await;
        let remote = connect(&redis).await;
        remote.set("stats:1:ALL", &1, Duration::from_secs(60)).await;
        remote.set("search:abc", &2, Duration::from_secs(60)).await;

        remote.clear("stats:").await;
        assert!(redis.raw("t:stats:1:ALL").is_none());
        assert!(redis.raw("t:search:abc").is_some());
    }
}
