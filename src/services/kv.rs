use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use redis::AsyncCommands;

/// Durable string key-value store holding serialized queue state.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Every stored key starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, KvError>;

    /// Connectivity check for the health endpoint.
    async fn health_check(&self) -> Result<(), KvError> {
        Ok(())
    }
}

/// Redis-backed store, shared by every host process.
pub struct RedisKvStore {
    client: redis::Client,
}

impl RedisKvStore {
    pub fn new(redis_url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{}*", prefix))
            .query_async(&mut conn)
            .await?;
        Ok(keys.into_iter().filter(|k| k.starts_with(prefix)).collect())
    }

    async fn health_check(&self) -> Result<(), KvError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

/// One file per key under a directory. Writes go through a temp file and a
/// rename so a crash never leaves a half-written value behind.
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, KvError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_file_name(key)))
    }
}

/// Reversible key to file name mapping: ASCII alphanumerics and `-` pass
/// through, `_` becomes `__`, every other byte becomes `_XX` (uppercase hex).
fn encode_file_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'_' => name.push_str("__"),
            b if b.is_ascii_alphanumeric() || b == b'-' => name.push(char::from(b)),
            b => name.push_str(&format!("_{:02X}", b)),
        }
    }
    name
}

fn decode_file_name(name: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(name.len());
    let mut rest = name.as_bytes();
    while let Some((&byte, tail)) = rest.split_first() {
        if byte != b'_' {
            bytes.push(byte);
            rest = tail;
            continue;
        }
        match tail {
            [b'_', tail @ ..] => {
                bytes.push(b'_');
                rest = tail;
            }
            [hi, lo, tail @ ..] => {
                let hex = std::str::from_utf8(&[*hi, *lo]).ok()?.to_string();
                bytes.push(u8::from_str_radix(&hex, 16).ok()?);
                rest = tail;
            }
            _ => return None,
        }
    }
    String::from_utf8(bytes).ok()
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(encoded) = file_name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            match decode_file_name(encoded) {
                Some(key) if key.starts_with(prefix) => keys.push(key),
                Some(_) => {}
                None => tracing::warn!(file = %encoded, "Skipping file with undecodable key name"),
            }
        }
        Ok(keys)
    }
}

/// Process-local store. Survives queue instances, not the process.
#[derive(Default)]
pub struct MemoryKvStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("File store error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).await.unwrap();

        assert_eq!(store.get("generation_queue:user-1").await.unwrap(), None);

        store.set("generation_queue:user-1", "[1]").await.unwrap();
        store.set("generation_queue:user-1", "[1,2]").await.unwrap();
        assert_eq!(
            store.get("generation_queue:user-1").await.unwrap().as_deref(),
            Some("[1,2]")
        );

        // A second handle on the same directory sees the value (restart).
        let reopened = FileKvStore::open(dir.path()).await.unwrap();
        assert_eq!(
            reopened.get("generation_queue:user-1").await.unwrap().as_deref(),
            Some("[1,2]")
        );
    }

    #[tokio::test]
    async fn test_file_store_keys_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).await.unwrap();

        store.set("generation_queue:a", "a").await.unwrap();
        store.set("generation_queue:b", "b").await.unwrap();

        assert_eq!(store.get("generation_queue:a").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.get("generation_queue:b").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_owner_ids_differing_in_punctuation_stay_apart() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).await.unwrap();

        store.set("generation_queue:auth0|alice", "[\"alice-job\"]").await.unwrap();
        store.set("generation_queue:auth0_alice", "[\"other-job\"]").await.unwrap();
        store.set("generation_queue:auth0_7Calice", "[\"third-job\"]").await.unwrap();

        assert_eq!(
            store.get("generation_queue:auth0|alice").await.unwrap().as_deref(),
            Some("[\"alice-job\"]")
        );
        assert_eq!(
            store.get("generation_queue:auth0_alice").await.unwrap().as_deref(),
            Some("[\"other-job\"]")
        );
        assert_eq!(
            store.get("generation_queue:auth0_7Calice").await.unwrap().as_deref(),
            Some("[\"third-job\"]")
        );
    }

    #[tokio::test]
    async fn test_file_store_lists_keys_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).await.unwrap();

        store.set("generation_queue:auth0|alice", "[]").await.unwrap();
        store.set("generation_queue:bob_1", "[]").await.unwrap();
        store.set("other:carol", "[]").await.unwrap();
        tokio::fs::write(dir.path().join("stray.txt"), "x").await.unwrap();

        let mut keys = store.keys("generation_queue:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["generation_queue:auth0|alice", "generation_queue:bob_1"]);
    }

    #[test]
    fn test_file_name_decoding() {
        for key in ["user-1", "a_b", "a|b", "a_7Cb", "generation_queue:u@x.io", "ünï"] {
            assert_eq!(decode_file_name(&encode_file_name(key)).as_deref(), Some(key));
        }
        assert_eq!(decode_file_name("dangling_"), None);
        assert_eq!(decode_file_name("bad_ZZ"), None);
    }

    #[test]
    fn test_file_name_encoding() {
        assert_eq!(encode_file_name("user-1"), "user-1");
        assert_eq!(encode_file_name("a_b"), "a__b");
        assert_eq!(encode_file_name("a|b"), "a_7Cb");
        assert_eq!(encode_file_name("a_7Cb"), "a__7Cb");
        assert_eq!(encode_file_name("generation_queue:u@x.io"), "generation__queue_3Au_40x_2Eio");
    }
}
