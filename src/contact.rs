//! 本机联系身份
//!
//! 启动时解析一次本机地址，派生出 `sip:<address>` 形式的 Contact URI，
//! 之后在整个运行期内保持不变。

use std::net::IpAddr;

use tracing::{debug, info};

use crate::error::AddressResolutionError;
use crate::utils::{format_ip_for_uri, get_first_non_loopback_interface};

/// 解析配置的本机地址
///
/// # 参数
/// - `configured`: 配置中的 IP 字面量或主机名；为空时探测第一个非回环接口
///
/// # 返回
/// - `Ok(IpAddr)` - 监听端点和 Contact 共用的地址
/// - `Err(AddressResolutionError)` - 主机名无法解析
pub async fn resolve_local_address(
    configured: Option<&str>,
) -> Result<IpAddr, AddressResolutionError> {
    let Some(host) = configured.map(str::trim).filter(|host| !host.is_empty()) else {
        let address =
            get_first_non_loopback_interface().map_err(|e| AddressResolutionError {
                host: "<auto>".into(),
                reason: e.to_string(),
            })?;
        info!(%address, "no local address configured, using first interface");
        return Ok(address);
    };

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(address) = bare.parse::<IpAddr>() {
        return Ok(address);
    }

    let mut addresses = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| AddressResolutionError {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
    let address = addresses
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| AddressResolutionError {
            host: host.to_string(),
            reason: "no addresses returned".into(),
        })?;
    debug!(host, %address, "resolved local address");
    Ok(address)
}

/// 本服务器对外宣告的 Contact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactIdentity {
    uri: rsip::Uri,
    local_address: IpAddr,
}

impl ContactIdentity {
    /// 由已解析的本机地址派生，IPv6 地址带方括号
    pub fn derive(local_address: IpAddr) -> Result<Self, AddressResolutionError> {
        let text = format!("sip:{}", format_ip_for_uri(&local_address));
        let uri = rsip::Uri::try_from(text.as_str()).map_err(|e| AddressResolutionError {
            host: local_address.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { uri, local_address })
    }

    pub fn uri(&self) -> &rsip::Uri {
        &self.uri
    }

    pub fn local_address(&self) -> IpAddr {
        self.local_address
    }

    /// 带用户部分的 Contact URI（注册请求使用）
    pub fn uri_for_user(&self, user: &str) -> rsip::Uri {
        let mut uri = self.uri.clone();
        uri.auth = Some(rsip::auth::Auth {
            user: user.to_string(),
            password: None,
        });
        uri
    }

    pub fn contact_header(&self) -> rsip::headers::Contact {
        rsip::typed::Contact {
            display_name: None,
            uri: self.uri.clone(),
            params: vec![],
        }
        .into()
    }
}

impl std::fmt::Display for ContactIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_ipv4() {
        let identity = ContactIdentity::derive("10.0.0.5".parse().unwrap()).unwrap();
        assert_eq!(identity.to_string(), "sip:10.0.0.5");
        assert_eq!(identity.local_address(), "10.0.0.5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_derive_ipv6_is_bracketed() {
        let identity = ContactIdentity::derive("2001:db8::1".parse().unwrap()).unwrap();
        assert!(identity.to_string().contains("[2001:db8::1]"));
    }

    #[test]
    fn test_uri_for_user() {
        let identity = ContactIdentity::derive("10.0.0.5".parse().unwrap()).unwrap();
        assert_eq!(identity.uri_for_user("acme").to_string(), "sip:acme@10.0.0.5");
        assert!(identity
            .contact_header()
            .to_string()
            .contains("sip:10.0.0.5"));
    }

    #[tokio::test]
    async fn test_resolve_literal_and_name() {
        let address = resolve_local_address(Some("127.0.0.1")).await.unwrap();
        assert_eq!(address, "127.0.0.1".parse::<IpAddr>().unwrap());

        let address = resolve_local_address(Some("localhost")).await.unwrap();
        assert!(address.is_loopback());
    }

    #[tokio::test]
    async fn test_unresolvable_host_fails() {
        let err = resolve_local_address(Some("no-such-host.invalid"))
            .await
            .unwrap_err();
        assert_eq!(err.host, "no-such-host.invalid");
    }
}
