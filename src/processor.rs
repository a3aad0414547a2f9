//! 默认的入站请求处理器
//!
//! 只做最小的注册与重定向：OPTIONS 应答 200，REGISTER 写入位置表，
//! 其他请求按位置表查找目标并回 302，找不到回 404。

use std::sync::Arc;

use async_trait::async_trait;
use rsip::headers::{ToTypedHeader, UntypedHeader};
use rsip::prelude::HeadersExt;
use rsipstack::transaction::make_tag;
use tracing::{debug, info, warn};

use crate::contact::ContactIdentity;
use crate::location::{normalize_e164, parse_contact, tel_key, LocationService};
use crate::transport::{Channel, SipListener, SipTarget};

const ALLOW: &str = "INVITE, ACK, CANCEL, BYE, OPTIONS, REGISTER";

pub struct Processor {
    channel: Channel,
    contact: ContactIdentity,
    location: Arc<dyn LocationService>,
}

impl Processor {
    pub fn new(
        channel: Channel,
        contact: ContactIdentity,
        location: Arc<dyn LocationService>,
    ) -> Self {
        Self {
            channel,
            contact,
            location,
        }
    }

    /// 处理请求并生成响应；ACK 不需要响应
    pub fn handle(&self, request: &rsip::Request) -> Option<rsip::Response> {
        match request.method {
            rsip::Method::Ack => None,
            rsip::Method::Options => Some(self.reply(
                request,
                rsip::StatusCode::OK,
                vec![
                    self.contact.contact_header().into(),
                    rsip::headers::Allow::new(ALLOW).into(),
                ],
            )),
            rsip::Method::Cancel => Some(self.reply(request, rsip::StatusCode::OK, vec![])),
            rsip::Method::Register => Some(self.register(request)),
            _ => Some(self.redirect(request)),
        }
    }

    fn register(&self, request: &rsip::Request) -> rsip::Response {
        let Some(aor) = request
            .to_header()
            .ok()
            .and_then(|to| to.typed().ok())
            .and_then(|to| address_of_record(&to.uri))
        else {
            return self.reply(request, rsip::StatusCode::BadRequest, vec![]);
        };

        let contact = request.headers.iter().find_map(|header| match header {
            rsip::Header::Contact(contact) => Some(contact.value().to_string()),
            _ => None,
        });
        let expires = contact
            .as_deref()
            .and_then(contact_expires)
            .or_else(|| {
                request.headers.iter().find_map(|header| match header {
                    rsip::Header::Expires(expires) => expires.value().trim().parse::<u32>().ok(),
                    _ => None,
                })
            });

        if expires == Some(0) {
            let removed = self.location.remove(&aor);
            info!(%aor, removed = removed.is_some(), "binding removed");
            return self.reply(request, rsip::StatusCode::OK, vec![]);
        }

        let Some(contact) = contact else {
            // 只查询绑定
            let extra = self
                .location
                .get(&aor)
                .map(|target| vec![contact_for(&target)])
                .unwrap_or_default();
            return self.reply(request, rsip::StatusCode::OK, extra);
        };

        match parse_contact(&aor, &contact) {
            Ok(target) => {
                info!(%aor, %target, "binding updated");
                let header = contact_for(&target);
                self.location.put(aor, target);
                let mut extra = vec![header];
                if let Some(expires) = expires {
                    extra.push(rsip::headers::Expires::from(expires).into());
                }
                self.reply(request, rsip::StatusCode::OK, extra)
            }
            Err(e) => {
                warn!(%aor, "rejecting REGISTER: {}", e);
                self.reply(request, rsip::StatusCode::BadRequest, vec![])
            }
        }
    }

    fn redirect(&self, request: &rsip::Request) -> rsip::Response {
        let user = request.uri.auth.as_ref().map(|auth| auth.user.clone());
        let host = request.uri.host_with_port.host.to_string();

        let by_number = user
            .as_deref()
            .and_then(normalize_e164)
            .and_then(|e164| self.location.get(&tel_key(&e164)));
        let target = by_number.or_else(|| {
            user.as_deref()
                .and_then(|user| self.location.get(&format!("sip:{}@{}", user, host)))
        });

        match target {
            Some(target) => {
                debug!(method = %request.method, uri = %request.uri, %target, "redirecting");
                self.reply(
                    request,
                    rsip::StatusCode::MovedTemporarily,
                    vec![contact_for(&target)],
                )
            }
            None => {
                debug!(method = %request.method, uri = %request.uri, "no location");
                self.reply(request, rsip::StatusCode::NotFound, vec![])
            }
        }
    }

    fn reply(
        &self,
        request: &rsip::Request,
        status_code: rsip::StatusCode,
        extra: Vec<rsip::Header>,
    ) -> rsip::Response {
        let mut headers = rsip::Headers::default();
        for header in request.headers.iter() {
            match header {
                rsip::Header::Via(_)
                | rsip::Header::From(_)
                | rsip::Header::CallId(_)
                | rsip::Header::CSeq(_) => headers.push(header.clone()),
                rsip::Header::To(to) => headers.push(with_to_tag(to).into()),
                _ => {}
            }
        }
        for header in extra {
            headers.push(header);
        }
        headers.push(rsip::headers::UserAgent::new(self.channel.options().user_agent.clone()).into());
        headers.push(rsip::headers::ContentLength::new("0").into());

        rsip::Response {
            status_code,
            version: rsip::Version::V2,
            headers,
            body: vec![],
        }
    }
}

#[async_trait]
impl SipListener for Processor {
    async fn on_request(&self, request: rsip::Request, source: SipTarget) {
        debug!(method = %request.method, %source, "inbound request");
        let Some(response) = self.handle(&request) else {
            return;
        };
        if let Err(e) = self.channel.send(response.into(), &source).await {
            warn!(%source, "failed to send response: {}", e);
        }
    }
}

/// `sip:user@host` 形式的地址记录键
fn address_of_record(uri: &rsip::Uri) -> Option<String> {
    let user = uri.auth.as_ref()?.user.clone();
    Some(format!("sip:{}@{}", user, uri.host_with_port.host))
}

/// Contact 头中 `expires` 参数
fn contact_expires(contact: &str) -> Option<u32> {
    let params = match contact.rfind('>') {
        Some(close) => &contact[close + 1..],
        None => contact.split_once(';').map(|(_, rest)| rest).unwrap_or(""),
    };
    params.split(';').find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("expires")
            .then(|| value.trim().parse::<u32>().ok())
            .flatten()
    })
}

fn contact_for(target: &rsip::Uri) -> rsip::Header {
    rsip::typed::Contact {
        display_name: None,
        uri: target.clone(),
        params: vec![],
    }
    .into()
}

fn with_to_tag(to: &rsip::headers::To) -> rsip::headers::To {
    match to.typed() {
        Ok(typed) if typed.tag().is_none() => typed.with_tag(make_tag()).into(),
        _ => to.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::LocationTable;
    use crate::transport::StackOptions;

    fn request(text: &str) -> rsip::Request {
        match rsip::SipMessage::try_from(text).unwrap() {
            rsip::SipMessage::Request(request) => request,
            _ => panic!("expected request"),
        }
    }

    fn message(method: &str, uri: &str, extra: &str) -> String {
        format!(
            "{method} {uri} SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.9:5060;branch=z9hG4bKp1\r\n\
From: <sip:caller@10.0.0.9>;tag=abc\r\n\
To: <{uri}>\r\n\
Call-ID: p1@test\r\n\
CSeq: 1 {method}\r\n\
{extra}Content-Length: 0\r\n\r\n"
        )
    }

    async fn processor() -> (Channel, Arc<LocationTable>, Processor) {
        let channel = Channel::bind(StackOptions::ephemeral("127.0.0.1".parse().unwrap()))
            .await
            .unwrap();
        let contact = ContactIdentity::derive(channel.local_address()).unwrap();
        let location = Arc::new(LocationTable::new());
        let processor = Processor::new(channel.clone(), contact, location.clone());
        (channel, location, processor)
    }

    #[tokio::test]
    async fn test_options_answered_with_contact() {
        let (channel, _, processor) = processor().await;
        let response = processor
            .handle(&request(&message("OPTIONS", "sip:127.0.0.1", "")))
            .unwrap();
        assert_eq!(response.status_code, rsip::StatusCode::OK);
        let text = response.to_string();
        assert!(text.contains("Contact: "));
        assert!(text.contains("sip:127.0.0.1"));
        assert!(text.contains("Allow: "));
        assert!(text.contains(";tag="));
        channel.stop().await;
    }

    #[tokio::test]
    async fn test_redirect_to_preloaded_did() {
        let (channel, location, processor) = processor().await;
        location.put(
            "tel:15551234567".into(),
            rsip::Uri::try_from("sip:15551234567@gw.example").unwrap(),
        );

        let response = processor
            .handle(&request(&message("INVITE", "sip:+15551234567@127.0.0.1", "")))
            .unwrap();
        assert_eq!(response.status_code, rsip::StatusCode::MovedTemporarily);
        assert!(response
            .to_string()
            .contains("sip:15551234567@gw.example"));

        let response = processor
            .handle(&request(&message("INVITE", "sip:19998887777@127.0.0.1", "")))
            .unwrap();
        assert_eq!(response.status_code, rsip::StatusCode::NotFound);
        channel.stop().await;
    }

    #[tokio::test]
    async fn test_register_binding_lifecycle() {
        let (channel, location, processor) = processor().await;
        let register = message(
            "REGISTER",
            "sip:alice@127.0.0.1",
            "Contact: <sip:alice@10.0.0.9:5062>\r\nExpires: 3600\r\n",
        );
        let response = processor.handle(&request(&register)).unwrap();
        assert_eq!(response.status_code, rsip::StatusCode::OK);
        assert_eq!(
            location.get("sip:alice@127.0.0.1").unwrap().to_string(),
            "sip:alice@10.0.0.9:5062"
        );

        let response = processor
            .handle(&request(&message("MESSAGE", "sip:alice@127.0.0.1", "")))
            .unwrap();
        assert_eq!(response.status_code, rsip::StatusCode::MovedTemporarily);

        let unregister = message(
            "REGISTER",
            "sip:alice@127.0.0.1",
            "Contact: <sip:alice@10.0.0.9:5062>;expires=0\r\n",
        );
        processor.handle(&request(&unregister)).unwrap();
        assert!(location.get("sip:alice@127.0.0.1").is_none());
        channel.stop().await;
    }

    #[tokio::test]
    async fn test_ack_absorbed() {
        let (channel, _, processor) = processor().await;
        assert!(processor
            .handle(&request(&message("ACK", "sip:bob@127.0.0.1", "")))
            .is_none());
        channel.stop().await;
    }

    #[test]
    fn test_contact_expires() {
        assert_eq!(contact_expires("<sip:a@b;transport=tcp>;expires=0"), Some(0));
        assert_eq!(contact_expires("sip:a@b;expires=60"), Some(60));
        assert_eq!(contact_expires("<sip:a@b;expires=5>"), None);
        assert_eq!(contact_expires("*"), None);
    }
}
