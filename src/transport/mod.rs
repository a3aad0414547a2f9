//! 信令传输层
//!
//! 同一本机地址上的 TCP / UDP / WebSocket 三个监听端点，
//! 统一成一个收发通道 [`Channel`]。

mod channel;
mod codec;
mod connection;

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use channel::{Channel, ClientTransaction};
pub use codec::SipStreamCodec;

/// 防止恶意或畸形输入占用过多内存
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// 传输类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransportKind {
    /// 可靠流（TCP）
    #[serde(rename = "tcp", alias = "TCP")]
    Stream,
    /// 不可靠数据报（UDP）
    #[default]
    #[serde(rename = "udp", alias = "UDP")]
    Datagram,
    /// 面向消息的 Web 传输（WebSocket）
    #[serde(rename = "ws", alias = "WS")]
    WebTransport,
}

impl TransportKind {
    pub const ALL: [TransportKind; 3] = [
        TransportKind::Stream,
        TransportKind::Datagram,
        TransportKind::WebTransport,
    ];

    /// Via 头中的传输标记
    pub fn via_token(&self) -> &'static str {
        match self {
            TransportKind::Stream => "TCP",
            TransportKind::Datagram => "UDP",
            TransportKind::WebTransport => "WS",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TransportKind::WebTransport => 80,
            _ => 5060,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stream => "tcp",
            TransportKind::Datagram => "udp",
            TransportKind::WebTransport => "ws",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 协议栈报文跟踪级别
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    #[default]
    Off,
    /// 每条报文记录首行
    Messages,
    /// 记录完整报文
    Verbose,
}

/// 已绑定的监听端点，绑定后不可变
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListeningEndpoint {
    pub local_address: IpAddr,
    pub port: u16,
    pub transport: TransportKind,
}

impl ListeningEndpoint {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.local_address, self.port)
    }
}

impl fmt::Display for ListeningEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport, self.socket_addr())
    }
}

/// 报文的对端：传输类型 + 地址
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SipTarget {
    pub transport: TransportKind,
    pub addr: SocketAddr,
}

impl SipTarget {
    pub fn new(transport: TransportKind, addr: SocketAddr) -> Self {
        Self { transport, addr }
    }

    /// 解析 `host[:port]`，未指定端口时使用传输默认端口
    pub async fn resolve(host: &str, transport: TransportKind) -> std::io::Result<SipTarget> {
        let host = host.trim();
        if let Ok(addr) = host.parse::<SocketAddr>() {
            return Ok(Self::new(transport, addr));
        }
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(Self::new(transport, SocketAddr::new(ip, transport.default_port())));
        }

        let mut candidates = match host.rsplit_once(':') {
            Some((name, port)) if port.parse::<u16>().is_ok() => {
                tokio::net::lookup_host(format!("{}:{}", name, port))
                    .await?
                    .collect::<Vec<_>>()
            }
            _ => tokio::net::lookup_host((host, transport.default_port()))
                .await?
                .collect::<Vec<_>>(),
        }
        .into_iter();

        candidates
            .next()
            .map(|addr| Self::new(transport, addr))
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} resolved to no addresses", host),
                )
            })
    }
}

impl fmt::Display for SipTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport, self.addr)
    }
}

/// 协议栈参数（原先散落在属性字符串中的调优项）
#[derive(Debug, Clone)]
pub struct StackOptions {
    pub address: IpAddr,
    pub stream_port: u16,
    pub datagram_port: u16,
    pub web_port: u16,
    pub max_message_size: usize,
    /// 为 false 时，本端发起的流连接在客户端事务结束后关闭
    pub cache_client_connections: bool,
    pub trace_level: TraceLevel,
    pub user_agent: String,
}

impl StackOptions {
    /// 三个传输都使用临时端口，测试用
    pub fn ephemeral(address: IpAddr) -> Self {
        Self {
            address,
            stream_port: 0,
            datagram_port: 0,
            web_port: 0,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            cache_client_connections: false,
            trace_level: TraceLevel::Off,
            user_agent: concat!("sipio/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    pub fn port_for(&self, transport: TransportKind) -> u16 {
        match transport {
            TransportKind::Stream => self.stream_port,
            TransportKind::Datagram => self.datagram_port,
            TransportKind::WebTransport => self.web_port,
        }
    }
}

/// 入站分发监听器（通道唯一的入站消费者）
#[async_trait]
pub trait SipListener: Send + Sync + 'static {
    async fn on_request(&self, request: rsip::Request, source: SipTarget);

    /// 没有匹配客户端事务的响应
    async fn on_response(&self, response: rsip::Response, source: SipTarget) {
        debug!(status = %response.status_code, %source, "dropping stray response");
    }
}
