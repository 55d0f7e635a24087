use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;

const BUCKET_TTL: Duration = Duration::from_secs(600);
const MAX_BUCKETS: usize = 10_000;

/// Per-client token buckets refilled continuously at `per_minute / 60` tokens per second.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
    refill_per_sec: f64,
    burst: f64,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    pub fn new(per_minute: u64, burst: u64) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            refill_per_sec: per_minute as f64 / 60.0,
            burst: burst as f64,
        }
    }

    pub fn allow(&self, ip: IpAddr) -> bool {
        self.allow_at(ip, Instant::now())
    }

    fn allow_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if buckets.len() >= MAX_BUCKETS {
            evict(&mut buckets, now);
        }
        let bucket = buckets.entry(ip).or_insert(Bucket {
            tokens: self.burst,
            refilled_at: now,
        });
        let elapsed = now.saturating_duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.burst);
        bucket.refilled_at = now;
        if bucket.tokens < 1.0 {
            return false;
        }
        bucket.tokens -= 1.0;
        true
    }
}

/// Drops idle buckets, then the oldest ones until the map is back under its cap.
fn evict(buckets: &mut HashMap<IpAddr, Bucket>, now: Instant) {
    buckets.retain(|_, bucket| now.saturating_duration_since(bucket.refilled_at) <= BUCKET_TTL);
    let over = buckets.len().saturating_sub(MAX_BUCKETS - 1);
    if over == 0 {
        return;
    }
    let mut by_age: Vec<(IpAddr, Instant)> = buckets
        .iter()
        .map(|(ip, bucket)| (*ip, bucket.refilled_at))
        .collect();
    by_age.sort_by_key(|(_, at)| *at);
    for (ip, _) in by_age.into_iter().take(over) {
        buckets.remove(&ip);
    }
}

/// Peer address, or the first parseable forwarded address when the gateway sits behind a proxy.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr, trust_proxy: bool) -> IpAddr {
    if !trust_proxy {
        return peer.ip();
    }
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').find_map(parse_ip));
    let real = || {
        headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_ip)
    };
    forwarded.or_else(real).unwrap_or_else(|| peer.ip())
}

fn parse_ip(value: &str) -> Option<IpAddr> {
    let value = value.trim();
    value
        .parse::<IpAddr>()
        .ok()
        .or_else(|| value.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}
