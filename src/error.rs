use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportKind;

/// 监听端口绑定失败（致命，启动中止）
#[derive(Error, Debug)]
#[error("failed to bind {transport} listener on {address}:{port}: {source}")]
pub struct BindError {
    pub transport: TransportKind,
    pub address: IpAddr,
    pub port: u16,
    #[source]
    pub source: std::io::Error,
}

/// 本机地址解析失败（致命，启动中止）
#[derive(Error, Debug)]
#[error("unable to resolve local address {host}: {reason}")]
pub struct AddressResolutionError {
    pub host: String,
    pub reason: String,
}

/// DID 记录的 contact 无法解析（可恢复，跳过该记录）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed contact for DID {did}: {reason}")]
pub struct MalformedContactError {
    pub did: String,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing required field: {0}")]
    Missing(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<&str> for ConfigError {
    fn from(s: &str) -> Self {
        ConfigError::Parse(s.to_string())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

/// 信令通道（传输层）错误
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message of {size} bytes exceeds the {limit} byte ceiling")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("no route to {target}: {reason}")]
    Unreachable { target: String, reason: String },

    #[error("outbound queue to {target} is full")]
    Congested { target: String },

    #[error("signaling channel is closed")]
    Closed,

    #[error("dispatch listener already attached")]
    ListenerAttached,
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(err.to_string())
    }
}

/// 单次网关注册尝试失败（可恢复，记录日志，下一周期自动重试）
#[derive(Error, Debug)]
pub enum RegistrationAttemptError {
    #[error("cannot resolve registrar {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("no credentials configured for {username}@{host}")]
    MissingCredentials { username: String, host: String },

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid challenge from {host}: {reason}")]
    Challenge { host: String, reason: String },

    #[error("registration with {host} timed out after {after:?}")]
    Timeout { host: String, after: Duration },

    #[error("registration transaction with {host} ended without a final response")]
    NoResponse { host: String },

    #[error("failed to build REGISTER: {0}")]
    Build(String),
}

impl From<rsip::Error> for RegistrationAttemptError {
    fn from(err: rsip::Error) -> Self {
        RegistrationAttemptError::Build(err.to_string())
    }
}

/// 生命周期控制器对外暴露的错误
#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    AddressResolution(#[from] AddressResolutionError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("control plane error: {0}")]
    ControlPlane(String),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("system error: {0}")]
    System(#[from] std::io::Error),
}

impl ServerError {
    /// 判断错误是否可恢复
    pub fn is_recoverable(&self) -> bool {
        match self {
            ServerError::Bind(_) => false,
            ServerError::AddressResolution(_) => false,
            ServerError::Config(_) => false,
            ServerError::Transport(_) => true,
            ServerError::ControlPlane(_) => false,
            ServerError::AlreadyRunning => true,
            ServerError::System(_) => false,
        }
    }

    /// 获取标准错误代码，用于日志分析和监控
    pub fn error_code(&self) -> &'static str {
        match self {
            ServerError::Bind(_) => "BIND_ERROR",
            ServerError::AddressResolution(_) => "ADDRESS_RESOLUTION_ERROR",
            ServerError::Config(_) => "CONFIGURATION_ERROR",
            ServerError::Transport(_) => "TRANSPORT_ERROR",
            ServerError::ControlPlane(_) => "CONTROL_PLANE_ERROR",
            ServerError::AlreadyRunning => "ALREADY_RUNNING",
            ServerError::System(_) => "SYSTEM_ERROR",
        }
    }

    /// 创建控制面错误
    pub fn control_plane(msg: impl std::fmt::Display) -> Self {
        ServerError::ControlPlane(msg.to_string())
    }
}
