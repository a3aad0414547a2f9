//! SIP 工具函数模块
//!
//! 日志初始化、本机地址探测以及 Call-ID 生成等辅助函数

use std::net::IpAddr;

use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// 初始化日志
///
/// `RUST_LOG` 环境变量优先于传入的级别；重复调用不会 panic
pub fn initialize_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// 获取第一个非回环的网络接口 IP 地址
///
/// 遍历系统所有网络接口，返回第一个非回环的 IPv4 地址
///
/// # 返回
/// - `Ok(IpAddr)` - 成功找到的 IPv4 地址
/// - `Err` - 未找到可用的 IPv4 接口
pub fn get_first_non_loopback_interface() -> Result<IpAddr, std::io::Error> {
    for interface in get_if_addrs::get_if_addrs()? {
        if !interface.is_loopback() {
            match interface.addr {
                get_if_addrs::IfAddr::V4(ref addr) => return Ok(IpAddr::V4(addr.ip)),
                _ => continue,
            }
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "no non-loopback IPv4 interface found",
    ))
}

/// 生成基于 UUID 的 Call-ID
///
/// # 示例
/// ```rust
/// let call_id = sipio::utils::make_call_id(Some("example.com"));
/// assert!(call_id.to_string().ends_with("@example.com"));
/// ```
pub fn make_call_id(domain: Option<&str>) -> rsip::headers::CallId {
    let uuid = Uuid::new_v4();

    match domain {
        Some(d) => format!("{}@{}", uuid, d).into(),
        None => uuid.to_string().into(),
    }
}

/// 生成 Via branch，带 RFC 3261 的 magic cookie
pub fn make_branch() -> String {
    format!("z9hG4bK{}", Uuid::new_v4().simple())
}

/// 格式化 IP 用于 SIP URI（IPv6 需要方括号）
pub fn format_ip_for_uri(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    }
}
