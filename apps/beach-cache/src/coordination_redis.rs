//! [`CoordinationStore`] on Redis.
//!
//! Redis has no leases, so they are emulated with key expiry:
//!
//! - `{ns}:lease:{id}` holds the lease TTL in milliseconds and expires after it;
//! - `{ns}:endpoint:{service}/{addr}` holds the JSON [`Endpoint`] and never
//!   outlives the lease it was published under;
//! - `{ns}:lease:{id}:keys` lists the endpoint keys attached to the lease.
//!
//! A refresh re-arms the expiry of all three; a revoke deletes them.

use std::time::Duration;

use async_trait::async_trait;
use cache_sdk::coordination::{
    endpoint_key, CoordinationError, CoordinationStore, Endpoint, Lease, LeaseId,
};
use redis::aio::ConnectionManager;
use redis::RedisError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const SCAN_COUNT: usize = 100;

pub struct RedisCoordinator {
    conn: ConnectionManager,
    namespace: String,
    session: CancellationToken,
}

impl RedisCoordinator {
    pub async fn connect(url: &str, namespace: &str) -> Result<Self, CoordinationError> {
        let client = redis::Client::open(url).map_err(store_error)?;
        let conn = ConnectionManager::new(client).await.map_err(store_error)?;
        debug!(namespace, "connected to redis coordination store");
        Ok(Self {
            conn,
            namespace: namespace.to_string(),
            session: CancellationToken::new(),
        })
    }

    fn lease_key(&self, lease: LeaseId) -> String {
        format!("{}:lease:{lease}", self.namespace)
    }

    fn lease_members_key(&self, lease: LeaseId) -> String {
        format!("{}:lease:{lease}:keys", self.namespace)
    }

    fn endpoint_key(&self, service: &str, addr: &str) -> String {
        format!("{}:endpoint:{}", self.namespace, endpoint_key(service, addr))
    }

    fn endpoint_pattern(&self, prefix: &str) -> String {
        format!("{}:endpoint:{}*", escape_glob(&self.namespace), escape_glob(prefix))
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordinator {
    async fn grant(&self, ttl: Duration) -> Result<Lease, CoordinationError> {
        let mut conn = self.conn.clone();
        let ttl_ms = ttl_millis(ttl);
        let id: LeaseId = redis::cmd("INCR")
            .arg(format!("{}:lease:seq", self.namespace))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        redis::cmd("SET")
            .arg(self.lease_key(id))
            .arg(ttl_ms)
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(Lease { id, ttl })
    }

    async fn refresh(&self, lease: LeaseId) -> Result<Option<Duration>, CoordinationError> {
        let mut conn = self.conn.clone();
        let ttl_ms: Option<u64> = redis::cmd("GET")
            .arg(self.lease_key(lease))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        let Some(ttl_ms) = ttl_ms else {
            return Ok(None);
        };
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.lease_members_key(lease))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("PEXPIRE")
            .arg(self.lease_key(lease))
            .arg(ttl_ms)
            .cmd("PEXPIRE")
            .arg(self.lease_members_key(lease))
            .arg(ttl_ms)
            .ignore();
        for member in &members {
            pipe.cmd("PEXPIRE").arg(member).arg(ttl_ms).ignore();
        }
        let (renewed,): (i64,) = pipe.query_async(&mut conn).await.map_err(store_error)?;
        // The lease key can lapse between GET and PEXPIRE.
        if renewed == 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_millis(ttl_ms)))
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), CoordinationError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.lease_members_key(lease))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        let removed: i64 = redis::cmd("DEL")
            .arg(self.lease_key(lease))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        redis::cmd("DEL")
            .arg(self.lease_members_key(lease))
            .arg(&members)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_error)?;
        if removed == 0 {
            return Err(CoordinationError::LeaseNotFound(lease));
        }
        Ok(())
    }

    async fn publish(
        &self,
        service: &str,
        addr: &str,
        lease: LeaseId,
    ) -> Result<(), CoordinationError> {
        let mut conn = self.conn.clone();
        // Remaining lifetime, so the endpoint expires together with the lease.
        let remaining_ms: i64 = redis::cmd("PTTL")
            .arg(self.lease_key(lease))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        if remaining_ms <= 0 {
            return Err(CoordinationError::LeaseNotFound(lease));
        }

        let endpoint = Endpoint {
            service: service.to_string(),
            addr: addr.to_string(),
            lease,
        };
        let payload = serde_json::to_string(&endpoint)
            .map_err(|err| CoordinationError::Store(err.to_string()))?;
        let key = self.endpoint_key(service, addr);
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(&key)
            .arg(payload)
            .arg("PX")
            .arg(remaining_ms)
            .ignore()
            .cmd("SADD")
            .arg(self.lease_members_key(lease))
            .arg(&key)
            .ignore()
            .cmd("PEXPIRE")
            .arg(self.lease_members_key(lease))
            .arg(remaining_ms)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Endpoint>, CoordinationError> {
        let mut conn = self.conn.clone();
        let pattern = self.endpoint_pattern(prefix);
        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(store_error)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        keys.sort();
        keys.dedup();

        let payloads: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        let mut endpoints = Vec::with_capacity(payloads.len());
        for (key, payload) in keys.iter().zip(payloads) {
            // Expired between SCAN and MGET.
            let Some(payload) = payload else { continue };
            match serde_json::from_str::<Endpoint>(&payload) {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(err) => debug!(key = %key, error = %err, "skipping malformed endpoint"),
            }
        }
        Ok(endpoints)
    }

    fn session(&self) -> CancellationToken {
        self.session.clone()
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn store_error(err: RedisError) -> CoordinationError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        CoordinationError::Unavailable(err.to_string())
    } else {
        CoordinationError::Store(err.to_string())
    }
}

fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_metacharacters_are_escaped() {
        assert_eq!(escape_glob("beach-cache/"), "beach-cache/");
        assert_eq!(escape_glob("svc[1]*?"), "svc\\[1\\]\\*\\?");
        assert_eq!(escape_glob("a\\b"), "a\\\\b");
    }

    #[test]
    fn sub_millisecond_ttls_round_up() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(5)), 5_000);
    }
}
