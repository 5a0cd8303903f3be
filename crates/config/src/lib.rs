//! 统一配置中心
//!
//! 配置按以下优先级合并：内置默认值 -> 可选配置文件（`APP_CONFIG_FILE`，
//! 支持 toml/yaml/json）-> `APP_` 前缀的环境变量（`__` 表示嵌套，
//! 例如 `APP_HEARTBEAT__TIMEOUT_SECS=120`）。

use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// 全局应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
pub struct AppConfig {
    #[serde(default)]
    #[validate(nested)]
    pub server: ServerConfig,
    #[serde(default)]
    #[validate(nested)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    #[validate(nested)]
    pub jwt: JwtConfig,
    #[serde(default)]
    #[validate(nested)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    #[validate(nested)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    #[validate(nested)]
    pub client: ClientConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            cors_origins: vec!["*".into()],
        }
    }
}

/// 数据库配置。未配置 url 时使用内存存储。
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[validate(range(min = 1))]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

/// Redis配置。未配置 url 时在线状态只保存在进程内。
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RedisConfig {
    #[serde(default)]
    pub url: Option<String>,
}

/// JWT配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct JwtConfig {
    #[validate(length(min = 32))]
    pub secret: String,
    #[validate(range(min = 1))]
    pub expiration_hours: i64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: "dev-secret-key-not-for-production-use-minimum-32-chars".into(),
            expiration_hours: 24,
        }
    }
}

/// 心跳配置。服务端和客户端共用同一个超时阈值。
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct HeartbeatConfig {
    #[validate(range(min = 1))]
    pub interval_secs: u64,
    #[validate(range(min = 1))]
    pub timeout_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 90,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// 单个限流档位：稳定速率 + 突发容量
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
pub struct RatePolicy {
    #[validate(range(min = 0.001))]
    pub rate_per_sec: f64,
    #[validate(range(min = 1))]
    pub burst: u32,
}

impl RatePolicy {
    pub const fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            rate_per_sec,
            burst,
        }
    }
}

/// 限流配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RateLimitConfig {
    /// 普通 HTTP 请求
    #[validate(nested)]
    pub general: RatePolicy,
    /// 登录/注册等认证接口
    #[validate(nested)]
    pub auth: RatePolicy,
    /// 长连接上的聊天消息，比普通 HTTP 更严格
    #[validate(nested)]
    pub chat: RatePolicy,
    /// 文件上传
    #[validate(nested)]
    pub upload: RatePolicy,
    /// 令牌桶空闲多久后可被回收
    #[validate(range(min = 1))]
    pub bucket_ttl_secs: u64,
    /// 回收任务的运行间隔
    #[validate(range(min = 1))]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            general: RatePolicy::new(10.0, 20),
            auth: RatePolicy::new(0.2, 5),
            chat: RatePolicy::new(2.0, 5),
            upload: RatePolicy::new(0.5, 3),
            bucket_ttl_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn bucket_ttl(&self) -> Duration {
        Duration::from_secs(self.bucket_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// 离线队列溢出策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// 丢弃最早入队的消息
    #[default]
    DropOldest,
    /// 拒绝新消息
    RejectNew,
}

/// 客户端弹性层配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ClientConfig {
    #[validate(length(min = 1))]
    pub url: String,
    #[validate(range(min = 1))]
    pub reconnect_base_ms: u64,
    #[validate(range(min = 1))]
    pub reconnect_max_ms: u64,
    #[validate(range(min = 1))]
    pub heartbeat_interval_secs: u64,
    #[validate(range(min = 1))]
    pub heartbeat_timeout_secs: u64,
    #[validate(range(min = 1))]
    pub queue_capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/api/v1/ws".into(),
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            queue_capacity: 256,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

impl ClientConfig {
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

impl AppConfig {
    /// 默认值 -> APP_CONFIG_FILE -> APP_* 环境变量
    pub fn load() -> Result<Self, ConfigError> {
        let mut fig = Figment::new().merge(Serialized::defaults(AppConfig::default()));
        if let Ok(path) = std::env::var("APP_CONFIG_FILE") {
            if path.ends_with(".yml") || path.ends_with(".yaml") {
                fig = fig.merge(Yaml::file(path));
            } else if path.ends_with(".json") {
                fig = fig.merge(Json::file(path));
            } else {
                fig = fig.merge(Toml::file(path));
            }
        }
        fig = fig.merge(Env::prefixed("APP_").split("__"));
        Self::extract(fig)
    }

    /// 在默认值之上合并一段 TOML
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        let fig = Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string(source));
        Self::extract(fig)
    }

    fn extract(fig: Figment) -> Result<Self, ConfigError> {
        let cfg: AppConfig = fig.extract().map_err(Box::new)?;
        cfg.check()?;
        Ok(cfg)
    }

    /// 字段校验 + 跨字段一致性检查
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;

        if self.heartbeat.timeout_secs <= self.heartbeat.interval_secs {
            return Err(ConfigError::Inconsistent(
                "heartbeat.timeout_secs must be greater than heartbeat.interval_secs".into(),
            ));
        }
        if self.client.heartbeat_timeout_secs <= self.client.heartbeat_interval_secs {
            return Err(ConfigError::Inconsistent(
                "client.heartbeat_timeout_secs must be greater than client.heartbeat_interval_secs"
                    .into(),
            ));
        }
        if self.client.reconnect_max_ms < self.client.reconnect_base_ms {
            return Err(ConfigError::Inconsistent(
                "client.reconnect_max_ms must not be below client.reconnect_base_ms".into(),
            ));
        }
        if self.rate_limit.chat.rate_per_sec > self.rate_limit.general.rate_per_sec {
            return Err(ConfigError::Inconsistent(
                "rate_limit.chat must not be looser than rate_limit.general".into(),
            ));
        }
        Ok(())
    }

    /// 用于日志输出的脱敏表示
    pub fn sanitize(&self) -> String {
        let mut copy = self.clone();
        copy.jwt.secret = "[REDACTED]".into();
        if copy.database.url.is_some() {
            copy.database.url = Some("postgres://[REDACTED]".into());
        }
        format!("{:?}", copy)
    }
}
