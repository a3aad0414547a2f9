//! 服务器配置
//!
//! TOML 文件格式见 `config/sipio.example.toml`：`[server]` 为核心字段，
//! `[[did]]` 与 `[[gateway]]` 为静态资源。

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::transport::{StackOptions, TraceLevel, TransportKind, DEFAULT_MAX_MESSAGE_SIZE};

/// 注册租期上限：一年
pub const MAX_LEASE_MINUTES: u64 = 365 * 24 * 60;

const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// 核心服务器配置，启动后只读
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 本机地址（IP 或主机名），为空时自动探测第一个非回环接口
    pub ip: Option<String>,
    pub external_ip: Option<String>,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub ws_port: u16,
    pub trace_level: TraceLevel,
    /// 网关注册租期（分钟）
    pub registration_lease_minutes: u64,
    /// 提前刷新的余量（分钟），周期 = 租期 - 余量
    pub registration_margin_minutes: u64,
    pub registration_attempt_timeout_secs: u64,
    pub max_message_size: usize,
    pub cache_client_connections: bool,
    pub user_agent: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: None,
            external_ip: None,
            tcp_port: 5060,
            udp_port: 5060,
            ws_port: 5062,
            trace_level: TraceLevel::Off,
            registration_lease_minutes: 5,
            registration_margin_minutes: 1,
            registration_attempt_timeout_secs: 10,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            cache_client_connections: false,
            user_agent: None,
        }
    }
}

impl ServerConfig {
    /// 校验核心字段
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ip) = &self.ip {
            if ip.trim().is_empty() {
                return Err(ConfigError::Missing("server.ip".into()));
            }
        }
        if self.registration_lease_minutes == 0 {
            return Err(ConfigError::Invalid(
                "registration_lease_minutes must be positive".into(),
            ));
        }
        self.registration_policy().validate()?;
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid("max_message_size must be positive".into()));
        }
        if self.tcp_port != 0 && self.tcp_port == self.ws_port {
            return Err(ConfigError::Invalid(format!(
                "tcp_port and ws_port both use {}",
                self.tcp_port
            )));
        }
        Ok(())
    }

    pub fn resolved_user_agent(&self) -> String {
        self.user_agent
            .as_ref()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(|value| value.to_string())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// 构造传输栈参数
    pub fn stack_options(&self, address: IpAddr) -> StackOptions {
        StackOptions {
            address,
            stream_port: self.tcp_port,
            datagram_port: self.udp_port,
            web_port: self.ws_port,
            max_message_size: self.max_message_size,
            cache_client_connections: self.cache_client_connections,
            trace_level: self.trace_level,
            user_agent: self.resolved_user_agent(),
        }
    }

    pub fn registration_policy(&self) -> RegistrationPolicy {
        RegistrationPolicy {
            lease_minutes: self.registration_lease_minutes,
            margin_minutes: self.registration_margin_minutes,
            initial_delay: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(self.registration_attempt_timeout_secs.max(1)),
        }
    }
}

/// 网关注册策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationPolicy {
    pub lease_minutes: u64,
    pub margin_minutes: u64,
    pub initial_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RegistrationPolicy {
    fn default() -> Self {
        Self {
            lease_minutes: 5,
            margin_minutes: 1,
            initial_delay: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RegistrationPolicy {
    /// 余量至少 1 分钟且小于租期，保证刷新周期严格小于租期
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_minutes > MAX_LEASE_MINUTES {
            return Err(ConfigError::Invalid(format!(
                "registration lease ({}m) exceeds {}m",
                self.lease_minutes, MAX_LEASE_MINUTES
            )));
        }
        if self.margin_minutes == 0 {
            return Err(ConfigError::Invalid(
                "registration_margin_minutes must be at least 1".into(),
            ));
        }
        if self.margin_minutes >= self.lease_minutes {
            return Err(ConfigError::Invalid(format!(
                "registration margin ({}m) must be below the lease ({}m)",
                self.margin_minutes, self.lease_minutes
            )));
        }
        Ok(())
    }

    /// 注册请求携带的 Expires（秒）
    pub fn expires_secs(&self) -> u32 {
        u32::try_from(self.lease_minutes.saturating_mul(60)).unwrap_or(u32::MAX)
    }
}

/// 静态配置的 DID（电话号码）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidRecord {
    pub e164num: String,
    pub contact: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayMetadata {
    #[serde(default)]
    pub name: String,
}

/// 上游网关
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayTarget {
    pub username: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub registries: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: GatewayMetadata,
}

impl GatewayTarget {
    pub fn display_name(&self) -> &str {
        if self.metadata.name.is_empty() {
            &self.username
        } else {
            &self.metadata.name
        }
    }

    /// 该网关是否负责给定的注册主机（主机或别名注册服务器）
    pub fn serves_host(&self, host: &str) -> bool {
        self.host.as_deref() == Some(host)
            || self
                .registries
                .as_ref()
                .is_some_and(|registries| registries.iter().any(|r| r == host))
    }
}

/// 完整的配置文件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub did: Vec<DidRecord>,
    #[serde(default)]
    pub gateway: Vec<GatewayTarget>,
}

impl ConfigFile {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        file.server.validate()?;
        Ok(file)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }
}
