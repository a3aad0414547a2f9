//! 位置表与 DID 预加载
//!
//! 启动时把静态配置的 DID 写入位置表，键为 `tel:<E.164>`，值为解析后的 contact URI。

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::DidRecord;
use crate::error::MalformedContactError;

/// 位置服务：地址键到目标 URI 的映射，允许并发读写，后写覆盖先写
pub trait LocationService: Send + Sync {
    fn put(&self, key: String, target: rsip::Uri);

    fn get(&self, key: &str) -> Option<rsip::Uri>;

    fn remove(&self, key: &str) -> Option<rsip::Uri>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 基于 DashMap 的内存位置表
#[derive(Debug, Default)]
pub struct LocationTable {
    entries: DashMap<String, rsip::Uri>,
}

impl LocationTable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocationService for LocationTable {
    fn put(&self, key: String, target: rsip::Uri) {
        self.entries.insert(key, target);
    }

    fn get(&self, key: &str) -> Option<rsip::Uri> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn remove(&self, key: &str) -> Option<rsip::Uri> {
        self.entries.remove(key).map(|(_, target)| target)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// 预加载结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PreloadReport {
    pub loaded: usize,
    pub skipped: Vec<MalformedContactError>,
}

/// 规范化 E.164 号码：去掉 `+` 和常见分隔符，结果只能是数字
pub fn normalize_e164(raw: &str) -> Option<String> {
    let digits: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '+' | ' ' | '-' | '.' | '(' | ')'))
        .collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(digits)
}

pub fn tel_key(e164: &str) -> String {
    format!("tel:{}", e164)
}

/// 解析 DID 的 contact：`sip:`/`sips:` URI，可以写成 `"Name" <sip:...>` 形式
pub fn parse_contact(did: &str, contact: &str) -> Result<rsip::Uri, MalformedContactError> {
    let malformed = |reason: &str| MalformedContactError {
        did: did.to_string(),
        reason: reason.to_string(),
    };

    let contact = contact.trim();
    let uri_text = match (contact.find('<'), contact.rfind('>')) {
        (Some(open), Some(close)) if open < close => &contact[open + 1..close],
        (None, None) => contact,
        _ => return Err(malformed("unbalanced angle brackets")),
    };
    let uri_text = uri_text.trim();

    if uri_text.is_empty() {
        return Err(malformed("empty contact"));
    }
    if uri_text.chars().any(char::is_whitespace) {
        return Err(malformed("contact contains whitespace"));
    }
    let lower = uri_text.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("sips:")
        .or_else(|| lower.strip_prefix("sip:"))
        .ok_or_else(|| malformed("contact must be a sip: or sips: URI"))?;
    if rest.is_empty() || rest.ends_with('@') {
        return Err(malformed("contact has no host"));
    }

    rsip::Uri::try_from(uri_text).map_err(|e| malformed(&e.to_string()))
}

/// 把静态 DID 写入位置表
///
/// 单条记录出错只记录并跳过，不影响其余记录
pub fn preload(dids: &[DidRecord], location: &dyn LocationService) -> PreloadReport {
    let mut report = PreloadReport::default();

    for record in dids {
        let Some(e164) = normalize_e164(&record.e164num) else {
            let err = MalformedContactError {
                did: record.e164num.clone(),
                reason: "number is not E.164".into(),
            };
            warn!(did = %record.e164num, "skipping DID: {}", err);
            report.skipped.push(err);
            continue;
        };

        match parse_contact(&e164, &record.contact) {
            Ok(target) => {
                let key = tel_key(&e164);
                debug!(%key, %target, "preloaded DID");
                location.put(key, target);
                report.loaded += 1;
            }
            Err(err) => {
                warn!(did = %e164, contact = %record.contact, "skipping DID: {}", err);
                report.skipped.push(err);
            }
        }
    }

    info!(
        loaded = report.loaded,
        skipped = report.skipped.len(),
        "location preload finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn did(e164num: &str, contact: &str) -> DidRecord {
        DidRecord {
            e164num: e164num.into(),
            contact: contact.into(),
        }
    }

    #[test]
    fn test_preload_single_did() {
        let table = LocationTable::new();
        let report = preload(&[did("15551234567", "sip:15551234567@gw.example")], &table);

        assert_eq!(report.loaded, 1);
        assert!(report.skipped.is_empty());
        let target = table.get("tel:15551234567").unwrap();
        assert_eq!(target.to_string(), "sip:15551234567@gw.example");
    }

    #[test]
    fn test_malformed_contact_is_skipped() {
        let table = LocationTable::new();
        let report = preload(
            &[
                did("15550000001", "sip:alice@gw.example"),
                did("15550000002", "not a contact"),
                did("15550000003", "<sip:carol@gw.example>"),
            ],
            &table,
        );

        assert_eq!(report.loaded, 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].did, "15550000002");
        assert!(table.get("tel:15550000002").is_none());
        assert_eq!(
            table.get("tel:15550000003").unwrap().to_string(),
            "sip:carol@gw.example"
        );
    }

    #[test]
    fn test_duplicate_did_last_write_wins() {
        let table = LocationTable::new();
        preload(
            &[
                did("15551234567", "sip:first@gw.example"),
                did("+1 555-123-4567", "sip:second@gw.example"),
            ],
            &table,
        );
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.get("tel:15551234567").unwrap().to_string(),
            "sip:second@gw.example"
        );
    }

    #[test]
    fn test_normalize_e164() {
        assert_eq!(normalize_e164("+1 (555) 123-4567").as_deref(), Some("15551234567"));
        assert_eq!(normalize_e164("1.555.123.4567").as_deref(), Some("15551234567"));
        assert_eq!(normalize_e164("555-CALL"), None);
        assert_eq!(normalize_e164("+"), None);
    }

    #[test]
    fn test_parse_contact_variants() {
        assert!(parse_contact("1", "\"Front desk\" <sips:desk@gw.example:5061>").is_ok());
        assert!(parse_contact("1", "http://gw.example").is_err());
        assert!(parse_contact("1", "sip:").is_err());
        assert!(parse_contact("1", "<sip:a@gw.example").is_err());
    }

    #[test]
    fn test_remove_and_empty() {
        let table = LocationTable::new();
        assert!(table.is_empty());
        table.put("tel:1".into(), rsip::Uri::try_from("sip:a@b").unwrap());
        assert!(table.remove("tel:1").is_some());
        assert!(table.remove("tel:1").is_none());
    }

    #[test]
    fn test_concurrent_writers() {
        let table = Arc::new(LocationTable::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        let uri = rsip::Uri::try_from(format!("sip:u{}@h{}", j, i).as_str()).unwrap();
                        table.put(format!("tel:{}", j), uri);
                        let _ = table.get(&format!("tel:{}", j));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.len(), 100);
    }
}
