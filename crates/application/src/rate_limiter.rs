use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use config::{RateLimitConfig, RatePolicy};
use dashmap::DashMap;
use domain::UserId;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;

/// 令牌桶
///
/// 惰性补充：不做后台计时，每次访问时按流逝时间补充令牌。
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
    last_access: Instant,
}

impl TokenBucket {
    /// 新桶是满的
    pub fn new(policy: RatePolicy, now: Instant) -> Self {
        let capacity = f64::from(policy.burst);
        Self {
            tokens: capacity,
            capacity,
            refill_rate: policy.rate_per_sec,
            last_refill: now,
            last_access: now,
        }
    }

    pub fn allow(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.last_access = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// 空闲超过 ttl 的桶可以被丢弃，之后按需重建为满桶
    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_access) > ttl
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

/// 受保护的资源类别，每类对应一个限流档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    General,
    Auth,
    Chat,
    Upload,
}

/// 限流主体：已认证用户或客户端 IP
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Actor {
    User(UserId),
    Ip(IpAddr),
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::User(id) => write!(f, "user:{}", id),
            Actor::Ip(ip) => write!(f, "ip:{}", ip),
        }
    }
}

/// 各资源类别的 (速率, 突发) 档位
#[derive(Debug, Clone, Copy)]
pub struct RateLimitTiers {
    pub general: RatePolicy,
    pub auth: RatePolicy,
    pub chat: RatePolicy,
    pub upload: RatePolicy,
}

impl RateLimitTiers {
    pub fn policy(&self, class: ResourceClass) -> RatePolicy {
        match class {
            ResourceClass::General => self.general,
            ResourceClass::Auth => self.auth,
            ResourceClass::Chat => self.chat,
            ResourceClass::Upload => self.upload,
        }
    }
}

impl From<&RateLimitConfig> for RateLimitTiers {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            general: config.general,
            auth: config.auth,
            chat: config.chat,
            upload: config.upload,
        }
    }
}

impl Default for RateLimitTiers {
    fn default() -> Self {
        Self::from(&RateLimitConfig::default())
    }
}

/// 共享限流器，HTTP 中间件和实时通道共用
///
/// 拒绝从不以错误形式抛给业务逻辑：调用方检查布尔值，自行转换为
/// error 信封或 HTTP 429。
pub struct RateLimiter {
    tiers: RateLimitTiers,
    buckets: DashMap<(Actor, ResourceClass), TokenBucket>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(tiers: RateLimitTiers, clock: Arc<dyn Clock>) -> Self {
        Self {
            tiers,
            buckets: DashMap::new(),
            clock,
        }
    }

    pub fn allow(&self, actor: &Actor, class: ResourceClass) -> bool {
        let now = self.clock.now();
        let policy = self.tiers.policy(class);
        let mut bucket = self
            .buckets
            .entry((actor.clone(), class))
            .or_insert_with(|| TokenBucket::new(policy, now));
        bucket.allow(now)
    }

    /// 清理空闲桶，返回清理数量
    pub fn sweep(&self, ttl: Duration) -> usize {
        let now = self.clock.now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_expired(now, ttl));
        before.saturating_sub(self.buckets.len())
    }

    pub fn tracked_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// 启动后台清理任务。进程启动时调用一次，随取消令牌退出。
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        ttl: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = limiter.sweep(ttl);
                        if removed > 0 {
                            tracing::debug!(removed, remaining = limiter.tracked_buckets(), "swept idle rate limit buckets");
                        }
                    }
                }
            }
            tracing::info!("rate limit sweeper stopped");
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitTiers::default(), Arc::new(crate::clock::SystemClock))
    }
}
