//! 面向流传输（TCP）的 SIP 分帧编解码
//!
//! 按 `Content-Length` 切分消息；头部或总长度超过上限时直接报错，
//! 不等到解析阶段。

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TransportError;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone)]
pub struct SipStreamCodec {
    max_message_size: usize,
}

impl SipStreamCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl Decoder for SipStreamCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
        // RFC 5626 keep-alive
        while src.starts_with(b"\r\n") {
            src.advance(2);
        }
        if src.is_empty() {
            return Ok(None);
        }

        let Some(header_end) = find_subsequence(src, HEADER_TERMINATOR) else {
            if src.len() > self.max_message_size {
                return Err(TransportError::MessageTooLarge {
                    size: src.len(),
                    limit: self.max_message_size,
                });
            }
            return Ok(None);
        };

        let body_len = content_length(&src[..header_end])?;
        // 对端声明的长度不可信，按饱和加法判断
        let head_len = header_end + HEADER_TERMINATOR.len();
        let total = head_len.saturating_add(body_len);
        if total > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: total,
                limit: self.max_message_size,
            });
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(total).freeze()))
    }
}

impl Encoder<Bytes> for SipStreamCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), TransportError> {
        if item.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: item.len(),
                limit: self.max_message_size,
            });
        }
        dst.extend_from_slice(&item);
        Ok(())
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// 读取头部中的 Content-Length（含紧凑形式 `l`），缺省为 0
fn content_length(head: &[u8]) -> Result<usize, TransportError> {
    let head = std::str::from_utf8(head)
        .map_err(|_| TransportError::Malformed("header block is not UTF-8".into()))?;

    for line in head.split("\r\n").skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            return value.trim().parse::<usize>().map_err(|_| {
                TransportError::Malformed(format!("invalid Content-Length: {}", value.trim()))
            });
        }
    }
    Ok(0)
}
