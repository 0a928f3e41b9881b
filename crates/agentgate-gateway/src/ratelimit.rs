use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Deserialize;

/// Quota dimension derived from the request path. Unknown routes fall
/// into the global class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RouteClass {
    Chat,
    Memory,
    Agents,
    Global,
}

impl RouteClass {
    pub fn of_path(path: &str) -> Self {
        if path.starts_with("/v1/") {
            RouteClass::Chat
        } else if path == "/memory" || path.starts_with("/memory/") {
            RouteClass::Memory
        } else if path == "/agents" {
            RouteClass::Agents
        } else {
            RouteClass::Global
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RouteClass::Chat => "chat",
            RouteClass::Memory => "memory",
            RouteClass::Agents => "agents",
            RouteClass::Global => "global",
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct WindowLimit {
    pub limit: u32,
    pub window_ms: u64,
}

impl WindowLimit {
    const fn per_minute(limit: u32) -> Self {
        Self {
            limit,
            window_ms: 60_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub chat: WindowLimit,
    pub memory: WindowLimit,
    pub agents: WindowLimit,
    pub global: WindowLimit,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            chat: WindowLimit::per_minute(60),
            memory: WindowLimit::per_minute(120),
            agents: WindowLimit::per_minute(30),
            global: WindowLimit::per_minute(200),
        }
    }
}

impl RateLimitSettings {
    fn for_class(&self, class: RouteClass) -> WindowLimit {
        match class {
            RouteClass::Chat => self.chat,
            RouteClass::Memory => self.memory,
            RouteClass::Agents => self.agents,
            RouteClass::Global => self.global,
        }
    }
}

/// Outcome of one rate-limit check; header material included.
#[derive(Clone, Debug, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_unix: u64,
    pub retry_after: u64,
}

/// Counter storage seam. The in-process map ships here; an external
/// key-value store plugs in behind the same contract with entries put
/// under TTL `window + grace`.
pub trait WindowStore: Send + Sync {
    /// Atomically bump the counter for `key`, creating it with the given
    /// absolute expiry. Returns the counter after the bump. Expired keys
    /// must never be resurrected — an expired bucket restarts at one.
    fn incr(&self, key: &str, expires_at_ms: u64, now_ms: u64) -> u32;
}

struct Bucket {
    count: u32,
    expires_at_ms: u64,
}

#[derive(Default)]
pub struct MemoryWindowStore {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl WindowStore for MemoryWindowStore {
    fn incr(&self, key: &str, expires_at_ms: u64, now_ms: u64) -> u32 {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            count: 0,
            expires_at_ms,
        });
        if bucket.expires_at_ms <= now_ms {
            bucket.count = 0;
            bucket.expires_at_ms = expires_at_ms;
        }
        bucket.count += 1;
        let count = bucket.count;
        // Sweep expired windows on the first hit of a fresh one.
        if count == 1 {
            buckets.retain(|_, bucket| bucket.expires_at_ms > now_ms);
        }
        count
    }
}

const GRACE_MS: u64 = 5_000;

/// Fixed-window limiter keyed by `(client, route class, window start)`.
pub struct RateLimiter {
    settings: RateLimitSettings,
    store: Arc<dyn WindowStore>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            store: Arc::new(MemoryWindowStore::default()),
        }
    }

    pub fn check(&self, client: &str, class: RouteClass) -> Decision {
        self.check_at(client, class, now_ms())
    }

    fn check_at(&self, client: &str, class: RouteClass, now_ms: u64) -> Decision {
        let limit = self.settings.for_class(class);
        let window_ms = limit.window_ms.max(1);
        let window_start = now_ms / window_ms * window_ms;
        let window_end = window_start + window_ms;
        let key = format!("{client}:{}:{window_start}", class.as_str());

        let count = self.store.incr(&key, window_end + GRACE_MS, now_ms);
        let reset_unix = window_end / 1000;
        if count > limit.limit {
            Decision {
                allowed: false,
                remaining: 0,
                reset_unix,
                retry_after: (window_end - now_ms).div_ceil(1000),
            }
        } else {
            Decision {
                allowed: true,
                remaining: limit.limit - count,
                reset_unix,
                retry_after: 0,
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
