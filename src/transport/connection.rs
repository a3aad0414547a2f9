//! 监听循环与连接任务
//!
//! 每条流 / WebSocket 连接拆成读、写两个任务；写任务退出时取消读任务，
//! 读任务退出时从连接表中移除自己。

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use super::channel::{ChannelInner, ConnectionKey};
use super::{SipStreamCodec, SipTarget, TransportKind};
use crate::error::TransportError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_QUEUE_DEPTH: usize = 64;
const MAX_DATAGRAM: usize = 65535;
const SIP_SUBPROTOCOL: &str = "sip";

/// TCP 监听循环
pub(super) async fn accept_streams(inner: Arc<ChannelInner>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted tcp connection");
                spawn_stream(&inner, stream, SipTarget::new(TransportKind::Stream, peer), false);
            }
            Err(e) => {
                warn!("tcp accept failed: {}", e);
            }
        }
    }
    debug!("tcp accept loop stopped");
}

/// UDP 接收循环，超过上限的数据报直接丢弃
pub(super) async fn serve_datagrams(inner: Arc<ChannelInner>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; (inner.options.max_message_size + 1).min(MAX_DATAGRAM)];
    loop {
        let received = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (len, peer) = match received {
            Ok(received) => received,
            Err(e) => {
                // ICMP 不可达等错误不影响后续接收
                debug!("udp recv error: {}", e);
                continue;
            }
        };
        if len > inner.options.max_message_size {
            warn!(%peer, size = len, "dropping oversized datagram");
            continue;
        }

        let source = SipTarget::new(TransportKind::Datagram, peer);
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = inner.deliver(&buf[..len], source) => {}
        }
    }
    debug!("udp receive loop stopped");
}

/// WebSocket 监听循环
pub(super) async fn accept_web(inner: Arc<ChannelInner>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("ws accept failed: {}", e);
                continue;
            }
        };

        let conn_inner = inner.clone();
        inner.tracker.spawn(async move {
            let config = web_config(conn_inner.options.max_message_size);
            let handshake = tokio_tungstenite::accept_hdr_async_with_config(
                stream,
                negotiate_subprotocol,
                Some(config),
            );
            let ws = tokio::select! {
                _ = conn_inner.cancel.cancelled() => return,
                result = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake) => match result {
                    Ok(Ok(ws)) => ws,
                    Ok(Err(e)) => {
                        debug!(%peer, "ws handshake failed: {}", e);
                        return;
                    }
                    Err(_) => {
                        debug!(%peer, "ws handshake timed out");
                        return;
                    }
                },
            };
            debug!(%peer, "accepted ws connection");
            spawn_web(
                &conn_inner,
                ws,
                SipTarget::new(TransportKind::WebTransport, peer),
                false,
            );
        });
    }
    debug!("ws accept loop stopped");
}

/// 对端声明了 `sip` 子协议时在响应中确认
fn negotiate_subprotocol(request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
    let offers_sip = request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|protocol| protocol.trim().eq_ignore_ascii_case(SIP_SUBPROTOCOL));
    if offers_sip {
        response
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SIP_SUBPROTOCOL));
    }
    Ok(response)
}

fn web_config(max_message_size: usize) -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(max_message_size))
        .max_frame_size(Some(max_message_size))
}

/// 在通道自己的运行时上建立到目标的出站连接，返回发送端和连接编号
///
/// 调用方可能位于其他运行时（例如注册调度线程），I/O 对象必须归属通道运行时
pub(super) async fn connect(
    inner: &Arc<ChannelInner>,
    target: SipTarget,
) -> Result<(mpsc::Sender<Bytes>, u64), TransportError> {
    let handle = inner.runtime.spawn(open_outbound(inner.clone(), target));
    handle.await.map_err(|e| TransportError::Unreachable {
        target: target.to_string(),
        reason: e.to_string(),
    })?
}

async fn open_outbound(
    inner: Arc<ChannelInner>,
    target: SipTarget,
) -> Result<(mpsc::Sender<Bytes>, u64), TransportError> {
    let unreachable = |reason: String| TransportError::Unreachable {
        target: target.to_string(),
        reason,
    };

    match target.transport {
        TransportKind::Stream => {
            let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(target.addr))
                .await
                .map_err(|_| unreachable("connect timed out".into()))?
                .map_err(|e| unreachable(e.to_string()))?;
            info!(peer = %target.addr, "opened tcp connection");
            Ok(spawn_stream(&inner, stream, target, true))
        }
        TransportKind::WebTransport => {
            let mut request = format!("ws://{}", target.addr).into_client_request()?;
            request
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SIP_SUBPROTOCOL));
            let config = web_config(inner.options.max_message_size);
            let (ws, _) = tokio::time::timeout(
                CONNECT_TIMEOUT,
                tokio_tungstenite::connect_async_with_config(request, Some(config), false),
            )
            .await
            .map_err(|_| unreachable("connect timed out".into()))?
            .map_err(|e| unreachable(e.to_string()))?;
            info!(peer = %target.addr, "opened ws connection");
            Ok(spawn_web(&inner, ws, target, true))
        }
        TransportKind::Datagram => Err(unreachable("datagrams are connectionless".into())),
    }
}

fn spawn_stream(
    inner: &Arc<ChannelInner>,
    stream: TcpStream,
    peer: SipTarget,
    outbound: bool,
) -> (mpsc::Sender<Bytes>, u64) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let codec = SipStreamCodec::new(inner.options.max_message_size);
    let mut reader = FramedRead::new(read_half, codec.clone());
    let mut writer = FramedWrite::new(write_half, codec);

    let (tx, mut rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE_DEPTH);
    let key: ConnectionKey = (TransportKind::Stream, peer.addr);
    let id = inner.register_connection(key, tx.clone(), outbound);
    let closed = inner.cancel.child_token();

    let writer_closed = closed.clone();
    inner.tracker.spawn(async move {
        loop {
            let payload = tokio::select! {
                _ = writer_closed.cancelled() => break,
                payload = rx.recv() => payload,
            };
            let Some(payload) = payload else {
                break;
            };
            // 对端不读时写操作会一直挂起，必须能被取消
            let written = tokio::select! {
                _ = writer_closed.cancelled() => break,
                written = writer.send(payload) => written,
            };
            if let Err(e) = written {
                debug!(%peer, "tcp write failed: {}", e);
                break;
            }
        }
        writer_closed.cancel();
    });

    let reader_inner = inner.clone();
    inner.tracker.spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = closed.cancelled() => break,
                frame = reader.next() => frame,
            };
            match frame {
                Some(Ok(frame)) => {
                    tokio::select! {
                        _ = closed.cancelled() => break,
                        _ = reader_inner.deliver(&frame, peer) => {}
                    }
                }
                Some(Err(e)) => {
                    warn!(%peer, "closing tcp connection: {}", e);
                    break;
                }
                None => break,
            }
        }
        closed.cancel();
        reader_inner.forget_connection(&key, id);
        debug!(%peer, "tcp connection closed");
    });

    (tx, id)
}

fn spawn_web<S>(
    inner: &Arc<ChannelInner>,
    ws: WebSocketStream<S>,
    peer: SipTarget,
    outbound: bool,
) -> (mpsc::Sender<Bytes>, u64)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE_DEPTH);
    let key: ConnectionKey = (TransportKind::WebTransport, peer.addr);
    let id = inner.register_connection(key, tx.clone(), outbound);
    let closed = inner.cancel.child_token();

    let writer_closed = closed.clone();
    inner.tracker.spawn(async move {
        loop {
            let payload = tokio::select! {
                _ = writer_closed.cancelled() => break,
                payload = rx.recv() => payload,
            };
            let Some(payload) = payload else {
                break;
            };
            let written = tokio::select! {
                _ = writer_closed.cancelled() => break,
                written = sink.send(web_message(payload)) => written,
            };
            if let Err(e) = written {
                debug!(%peer, "ws write failed: {}", e);
                break;
            }
        }
        if !writer_closed.is_cancelled() {
            let _ = sink.close().await;
        }
        writer_closed.cancel();
    });

    let reader_inner = inner.clone();
    inner.tracker.spawn(async move {
        loop {
            let message = tokio::select! {
                _ = closed.cancelled() => break,
                message = stream.next() => message,
            };
            let data: Bytes = match message {
                Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_bytes()),
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(%peer, "ws read failed: {}", e);
                    break;
                }
            };
            tokio::select! {
                _ = closed.cancelled() => break,
                _ = reader_inner.deliver(&data, peer) => {}
            }
        }
        closed.cancel();
        reader_inner.forget_connection(&key, id);
        debug!(%peer, "ws connection closed");
    });

    (tx, id)
}

/// UTF-8 报文用文本帧，否则用二进制帧
fn web_message(payload: Bytes) -> Message {
    match std::str::from_utf8(&payload) {
        Ok(text) => Message::text(text.to_string()),
        Err(_) => Message::binary(payload),
    }
}
