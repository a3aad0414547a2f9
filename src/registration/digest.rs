//! 基于信令通道的 REGISTER 与 MD5 摘要认证

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use rsip::headers::UntypedHeader;
use rsip::prelude::HeadersExt;
use rsipstack::dialog::authenticate::Credential;
use rsipstack::transaction::make_tag;
use tracing::{debug, info, warn};

use super::{GatewayState, RegistrationOutcome, RegistryHelper};
use crate::config::RegistrationPolicy;
use crate::contact::ContactIdentity;
use crate::error::RegistrationAttemptError;
use crate::resources::ResourcesApi;
use crate::transport::{Channel, SipTarget, TransportKind};
use crate::utils::{make_branch, make_call_id};

const ALLOW: &str = "INVITE, ACK, CANCEL, BYE, OPTIONS, REGISTER";

/// 解析后的认证挑战（WWW-Authenticate / Proxy-Authenticate）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    /// 来自 407，应答时使用 Proxy-Authorization
    pub proxy: bool,
}

impl DigestChallenge {
    /// 解析挑战头的值，例如 `Digest realm="x", nonce="y", qop="auth"`
    pub fn parse(value: &str, proxy: bool) -> Result<Self, String> {
        let value = value.trim();
        let params = value
            .get(..6)
            .filter(|scheme| scheme.eq_ignore_ascii_case("digest"))
            .map(|_| &value[6..])
            .ok_or_else(|| format!("unsupported challenge scheme: {}", value))?;

        let pattern = Regex::new(r#"([A-Za-z0-9_-]+)\s*=\s*(?:"([^"]*)"|([^\s,]+))"#)
            .map_err(|e| e.to_string())?;

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut algorithm = None;
        let mut qop = None;
        for caps in pattern.captures_iter(params) {
            let name = caps[1].to_ascii_lowercase();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            match name.as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "algorithm" => algorithm = Some(value),
                "qop" => qop = Some(value),
                _ => {}
            }
        }

        if let Some(algorithm) = &algorithm {
            if !algorithm.eq_ignore_ascii_case("MD5") {
                return Err(format!("unsupported digest algorithm: {}", algorithm));
            }
        }
        let qop = match qop {
            Some(offered) => {
                if offered
                    .split(',')
                    .any(|option| option.trim().eq_ignore_ascii_case("auth"))
                {
                    Some("auth".to_string())
                } else {
                    return Err(format!("unsupported qop: {}", offered));
                }
            }
            None => None,
        };

        Ok(Self {
            realm: realm.ok_or("challenge has no realm")?,
            nonce: nonce.ok_or("challenge has no nonce")?,
            opaque,
            algorithm,
            qop,
            proxy,
        })
    }

    /// 生成 Authorization 头的值
    pub fn authorization(&self, credential: &Credential, method: &str, uri: &str) -> String {
        let realm = credential.realm.as_deref().unwrap_or(&self.realm);
        let mut value = if self.qop.is_some() {
            let nc = "00000001";
            let cnonce = uuid::Uuid::new_v4().simple().to_string()[..16].to_string();
            let response = digest_response(
                credential,
                realm,
                method,
                uri,
                &self.nonce,
                Some((nc, &cnonce)),
            );
            format!(
                "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5, qop=auth, nc={}, cnonce=\"{}\"",
                credential.username, realm, self.nonce, uri, response, nc, cnonce
            )
        } else {
            let response = digest_response(credential, realm, method, uri, &self.nonce, None);
            format!(
                "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
                credential.username, realm, self.nonce, uri, response
            )
        };
        if let Some(opaque) = &self.opaque {
            value.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        value
    }
}

/// 计算 RFC 2617 摘要
///
/// # 参数
/// - `qop`: `Some((nc, cnonce))` 时按 `qop=auth` 计算
pub fn digest_response(
    credential: &Credential,
    realm: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    qop: Option<(&str, &str)>,
) -> String {
    let ha1 = md5_hash(&format!(
        "{}:{}:{}",
        credential.username, realm, credential.password
    ));
    let ha2 = md5_hash(&format!("{}:{}", method, uri));
    match qop {
        Some((nc, cnonce)) => md5_hash(&format!(
            "{}:{}:{}:{}:auth:{}",
            ha1, nonce, nc, cnonce, ha2
        )),
        None => md5_hash(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

fn md5_hash(input: &str) -> String {
    use md5::{Digest, Md5};
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 通过信令通道完成注册的 RegistryHelper
pub struct DigestRegistryHelper {
    channel: Channel,
    contact: ContactIdentity,
    resources: Arc<dyn ResourcesApi>,
    expires: u32,
}

impl DigestRegistryHelper {
    pub fn new(
        channel: Channel,
        contact: ContactIdentity,
        resources: Arc<dyn ResourcesApi>,
        policy: &RegistrationPolicy,
    ) -> Self {
        Self {
            channel,
            contact,
            resources,
            expires: policy.expires_secs(),
        }
    }

    /// 在当前网关快照中查找凭证
    fn credential_for(&self, username: &str, host: &str) -> Option<Credential> {
        let gateways = match self.resources.gateways() {
            Ok(gateways) => gateways,
            Err(e) => {
                warn!("cannot read gateway snapshot: {}", e);
                return None;
            }
        };
        gateways
            .into_iter()
            .find(|gateway| gateway.username == username && gateway.serves_host(host))
            .and_then(|gateway| gateway.secret)
            .map(|password| Credential {
                username: username.to_string(),
                password,
                realm: None,
            })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_register(
        &self,
        request_uri: &rsip::Uri,
        aor: &rsip::Uri,
        transport: TransportKind,
        call_id: &rsip::headers::CallId,
        from_tag: &rsip::param::Tag,
        cseq: u32,
        username: &str,
        authorization: Option<rsip::Header>,
    ) -> rsip::Request {
        let from = rsip::typed::From {
            display_name: None,
            uri: aor.clone(),
            params: vec![],
        }
        .with_tag(from_tag.clone());
        let to = rsip::typed::To {
            display_name: None,
            uri: aor.clone(),
            params: vec![],
        };
        let contact = rsip::typed::Contact {
            display_name: None,
            uri: self.contact.uri_for_user(username),
            params: vec![],
        };

        let mut headers = rsip::Headers::default();
        headers.push(self.channel.via_header(transport, &make_branch()).into());
        headers.push(rsip::headers::MaxForwards::new("70").into());
        headers.push(from.into());
        headers.push(to.into());
        headers.push(call_id.clone().into());
        headers.push(
            rsip::typed::CSeq {
                seq: cseq,
                method: rsip::Method::Register,
            }
            .into(),
        );
        headers.push(contact.into());
        headers.push(rsip::headers::Expires::from(self.expires).into());
        headers.push(rsip::headers::Allow::new(ALLOW).into());
        headers.push(rsip::headers::UserAgent::new(self.channel.options().user_agent.clone()).into());
        if let Some(authorization) = authorization {
            headers.push(authorization);
        }
        headers.push(rsip::headers::ContentLength::new("0").into());

        rsip::Request {
            method: rsip::Method::Register,
            uri: request_uri.clone(),
            version: rsip::Version::V2,
            headers,
            body: vec![],
        }
    }
}

#[async_trait]
impl RegistryHelper for DigestRegistryHelper {
    async fn request_challenge(
        &self,
        username: &str,
        host: &str,
        transport: TransportKind,
    ) -> Result<RegistrationOutcome, RegistrationAttemptError> {
        let target = SipTarget::resolve(host, transport)
            .await
            .map_err(|e| RegistrationAttemptError::Resolve {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        let request_uri = rsip::Uri::try_from(format!("sip:{}", host).as_str())?;
        let aor = rsip::Uri::try_from(format!("sip:{}@{}", username, host).as_str())?;
        let call_id = make_call_id(Some(&self.contact.local_address().to_string()));
        let from_tag = make_tag();
        let mut cseq = 1;
        let mut state = GatewayState::Idle;

        let request = self.build_register(
            &request_uri,
            &aor,
            transport,
            &call_id,
            &from_tag,
            cseq,
            username,
            None,
        );
        debug!(%target, "REGISTER {}@{}", username, host);
        let mut tx = self.channel.send_request(request, &target).await?;

        while let Some(response) = tx.receive().await {
            let code = response.status_code.code();
            match code {
                100..=199 => continue,
                200..=299 => {
                    state = GatewayState::Registered;
                    info!(
                        gateway = %aor,
                        %state,
                        expires = self.expires,
                        "registration accepted"
                    );
                    return Ok(RegistrationOutcome::Registered { status: code });
                }
                401 | 407 if state == GatewayState::Idle => {
                    state = GatewayState::ChallengeRequested;
                    let credential = self.credential_for(username, host).ok_or_else(|| {
                        RegistrationAttemptError::MissingCredentials {
                            username: username.to_string(),
                            host: host.to_string(),
                        }
                    })?;
                    let challenge = challenge_of(&response, code == 407).map_err(|reason| {
                        RegistrationAttemptError::Challenge {
                            host: host.to_string(),
                            reason,
                        }
                    })?;
                    debug!(realm = %challenge.realm, %state, "answering {} challenge", code);

                    let value = challenge.authorization(
                        &credential,
                        "REGISTER",
                        &request_uri.to_string(),
                    );
                    let header = if challenge.proxy {
                        rsip::Header::ProxyAuthorization(rsip::headers::ProxyAuthorization::new(value))
                    } else {
                        rsip::Header::Authorization(rsip::headers::Authorization::new(value))
                    };

                    cseq += 1;
                    let request = self.build_register(
                        &request_uri,
                        &aor,
                        transport,
                        &call_id,
                        &from_tag,
                        cseq,
                        username,
                        Some(header),
                    );
                    tx = self.channel.send_request(request, &target).await?;
                }
                _ => {
                    state = GatewayState::Failed;
                    debug!(gateway = %aor, %state, "registration rejected: {}", response.status_code);
                    return Ok(RegistrationOutcome::Rejected { status: code });
                }
            }
        }

        Err(RegistrationAttemptError::NoResponse {
            host: host.to_string(),
        })
    }
}

fn challenge_of(response: &rsip::Response, proxy: bool) -> Result<DigestChallenge, String> {
    let value = if proxy {
        response.headers.iter().find_map(|header| match header {
            rsip::Header::ProxyAuthenticate(h) => Some(h.value().to_string()),
            _ => None,
        })
    } else {
        response
            .www_authenticate_header()
            .map(|h| h.value().to_string())
    };
    let value = value.ok_or("challenge response has no authenticate header")?;
    DigestChallenge::parse(&value, proxy)
}
