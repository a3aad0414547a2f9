use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::DashMap;
use rsip::headers::UntypedHeader;
use rsip::SipMessage;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::connection;
use super::{ListeningEndpoint, SipListener, SipTarget, StackOptions, TraceLevel, TransportKind};
use crate::error::{BindError, TransportError};

const INBOUND_QUEUE_DEPTH: usize = 1024;

pub(super) type ConnectionKey = (TransportKind, SocketAddr);

/// 本端发起的连接的一次占用：连接键 + 连接编号
type Lease = (ConnectionKey, u64);

pub(super) struct ConnectionHandle {
    pub(super) id: u64,
    pub(super) sender: mpsc::Sender<Bytes>,
    /// 本端发起的连接；只有这类连接受 `cache_client_connections` 约束
    outbound: bool,
    leases: usize,
}

pub(super) enum InboundEvent {
    Request {
        request: rsip::Request,
        source: SipTarget,
    },
    Response {
        response: rsip::Response,
        source: SipTarget,
    },
}

pub(super) struct ChannelInner {
    pub(super) options: StackOptions,
    endpoints: Vec<ListeningEndpoint>,
    udp: Mutex<Option<Arc<UdpSocket>>>,
    pub(super) connections: DashMap<ConnectionKey, ConnectionHandle>,
    next_connection_id: AtomicU64,
    pending: DashMap<String, mpsc::UnboundedSender<rsip::Response>>,
    inbound_tx: mpsc::Sender<InboundEvent>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundEvent>>>,
    send_lock: tokio::sync::Mutex<()>,
    pub(super) cancel: CancellationToken,
    pub(super) tracker: TaskTracker,
    pub(super) runtime: tokio::runtime::Handle,
}

/// 统一的 SIP 信令通道
///
/// 所有出站请求（注册调度、呼叫发起）和入站事件（分发监听器）都经由它收发。
/// 可以在多个任务间克隆共享。
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// 在同一地址上绑定 TCP、UDP、WebSocket 三个端点
    ///
    /// 三个套接字全部获取成功后才启动任何任务；任一失败则已获取的套接字随之释放，
    /// 返回带传输类型和端口的 [`BindError`]。
    pub async fn bind(options: StackOptions) -> Result<Channel, BindError> {
        let address = options.address;

        let stream_listener =
            bind_listener(address, options.stream_port, TransportKind::Stream).await?;
        let datagram_socket = bind_datagram(address, options.datagram_port).await?;
        let web_listener =
            bind_listener(address, options.web_port, TransportKind::WebTransport).await?;

        let endpoints = vec![
            endpoint_of(
                address,
                options.stream_port,
                TransportKind::Stream,
                stream_listener.local_addr(),
            )?,
            endpoint_of(
                address,
                options.datagram_port,
                TransportKind::Datagram,
                datagram_socket.local_addr(),
            )?,
            endpoint_of(
                address,
                options.web_port,
                TransportKind::WebTransport,
                web_listener.local_addr(),
            )?,
        ];

        let datagram_socket = Arc::new(datagram_socket);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let inner = Arc::new(ChannelInner {
            options,
            endpoints,
            udp: Mutex::new(Some(datagram_socket.clone())),
            connections: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
            pending: DashMap::new(),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            send_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            runtime: tokio::runtime::Handle::current(),
        });

        inner
            .tracker
            .spawn(connection::accept_streams(inner.clone(), stream_listener));
        inner
            .tracker
            .spawn(connection::serve_datagrams(inner.clone(), datagram_socket));
        inner
            .tracker
            .spawn(connection::accept_web(inner.clone(), web_listener));

        for endpoint in &inner.endpoints {
            info!(
                transport = %endpoint.transport,
                address = %endpoint.local_address,
                port = endpoint.port,
                "listening point bound"
            );
        }

        Ok(Channel { inner })
    }

    pub fn endpoints(&self) -> &[ListeningEndpoint] {
        &self.inner.endpoints
    }

    pub fn endpoint(&self, transport: TransportKind) -> Option<&ListeningEndpoint> {
        self.inner
            .endpoints
            .iter()
            .find(|endpoint| endpoint.transport == transport)
    }

    pub fn local_address(&self) -> IpAddr {
        self.inner.options.address
    }

    pub fn options(&self) -> &StackOptions {
        &self.inner.options
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// 安装唯一的入站分发监听器
    ///
    /// 安装之前收到的请求会排队，安装后按到达顺序分发。
    pub fn attach_listener(&self, listener: Arc<dyn SipListener>) -> Result<(), TransportError> {
        let mut receiver = self
            .inner
            .inbound_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(TransportError::ListenerAttached)?;

        let cancel = self.inner.cancel.clone();
        self.inner.tracker.spawn_on(
            async move {
                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = receiver.recv() => event,
                    };
                    let Some(event) = event else {
                        break;
                    };

                    let listener = listener.clone();
                    tokio::spawn(async move {
                        match event {
                            InboundEvent::Request { request, source } => {
                                listener.on_request(request, source).await
                            }
                            InboundEvent::Response { response, source } => {
                                listener.on_response(response, source).await
                            }
                        }
                    });
                }
                debug!("dispatch loop stopped");
            },
            &self.inner.runtime,
        );
        Ok(())
    }

    /// 构造本端 Via 头
    pub fn via_header(&self, transport: TransportKind, branch: &str) -> rsip::headers::Via {
        let port = self
            .endpoint(transport)
            .map(|endpoint| endpoint.port)
            .unwrap_or_else(|| self.inner.options.port_for(transport));
        rsip::headers::Via::new(format!(
            "SIP/2.0/{} {}:{};branch={};rport",
            transport.via_token(),
            crate::utils::format_ip_for_uri(&self.inner.options.address),
            port,
            branch
        ))
    }

    /// 发送一条 SIP 消息
    ///
    /// 不缓存客户端连接时，为本次发送打开的连接在写完后关闭
    pub async fn send(&self, message: SipMessage, target: &SipTarget) -> Result<(), TransportError> {
        if let Some((key, id)) = self.send_tracked(message, target).await? {
            self.inner.release_lease(&key, id);
        }
        Ok(())
    }

    /// 发送请求并按顶层 Via branch 接收对应的响应
    pub async fn send_request(
        &self,
        request: rsip::Request,
        target: &SipTarget,
    ) -> Result<ClientTransaction, TransportError> {
        let branch = top_via_branch(&request.headers)
            .ok_or_else(|| TransportError::Malformed("request has no Via branch".into()))?;

        let (tx, responses) = mpsc::unbounded_channel();
        self.inner.pending.insert(branch.clone(), tx);
        let mut transaction = ClientTransaction {
            branch,
            responses,
            channel: self.clone(),
            lease: None,
        };
        // 发送失败时 transaction 被丢弃，登记随之移除
        transaction.lease = self.send_tracked(request.into(), target).await?;
        Ok(transaction)
    }

    async fn send_tracked(
        &self,
        message: SipMessage,
        target: &SipTarget,
    ) -> Result<Option<Lease>, TransportError> {
        if self.inner.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let payload = Bytes::from(message.to_string());
        let limit = self.inner.options.max_message_size;
        if payload.len() > limit {
            return Err(TransportError::MessageTooLarge {
                size: payload.len(),
                limit,
            });
        }
        self.inner.trace("send", &payload, target);

        match target.transport {
            TransportKind::Datagram => {
                let socket = self.inner.datagram_socket()?;
                let _guard = self.inner.send_lock.lock().await;
                socket.send_to(&payload, target.addr).await?;
                Ok(None)
            }
            TransportKind::Stream | TransportKind::WebTransport => {
                let key = (target.transport, target.addr);
                let (sender, lease) = match self.inner.reuse_connection(&key) {
                    Some(reused) => reused,
                    None => {
                        let (sender, id) = connection::connect(&self.inner, *target).await?;
                        (sender, Some((key, id)))
                    }
                };

                // 只做非阻塞入队，对端不读时不拖住其他发送方
                let queued = {
                    let _guard = self.inner.send_lock.lock().await;
                    sender.try_send(payload)
                };
                if let Err(err) = queued {
                    if let Some((key, id)) = lease {
                        self.inner.release_lease(&key, id);
                    }
                    return Err(match err {
                        mpsc::error::TrySendError::Full(_) => {
                            warn!(%target, "outbound queue full, dropping message");
                            TransportError::Congested {
                                target: target.to_string(),
                            }
                        }
                        mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
                    });
                }
                Ok(lease)
            }
        }
    }

    /// 停止通道：取消所有任务并等待其退出，释放三个端点
    ///
    /// 可重复调用
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner
            .udp
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.inner.connections.clear();
        self.inner.pending.clear();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("signaling channel stopped");
    }
}

impl ChannelInner {
    fn datagram_socket(&self) -> Result<Arc<UdpSocket>, TransportError> {
        self.udp
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(TransportError::Closed)
    }

    /// 登记新连接；本端发起的连接登记时即带一次占用
    pub(super) fn register_connection(
        &self,
        key: ConnectionKey,
        sender: mpsc::Sender<Bytes>,
        outbound: bool,
    ) -> u64 {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(
            key,
            ConnectionHandle {
                id,
                sender,
                outbound,
                leases: usize::from(outbound),
            },
        );
        id
    }

    /// 复用到目标的已有连接；本端发起的连接同时增加一次占用
    fn reuse_connection(
        &self,
        key: &ConnectionKey,
    ) -> Option<(mpsc::Sender<Bytes>, Option<Lease>)> {
        let mut handle = self.connections.get_mut(key)?;
        if handle.sender.is_closed() {
            return None;
        }
        let lease = if handle.outbound {
            handle.leases += 1;
            Some((*key, handle.id))
        } else {
            None
        };
        Some((handle.sender.clone(), lease))
    }

    /// 释放一次占用；不缓存客户端连接时，最后一次占用释放后关闭连接
    ///
    /// 移除发送端后写任务会先写完队列中的报文再退出
    fn release_lease(&self, key: &ConnectionKey, id: u64) {
        if let Some(mut handle) = self.connections.get_mut(key) {
            if handle.id == id {
                handle.leases = handle.leases.saturating_sub(1);
            }
        }
        if self.options.cache_client_connections {
            return;
        }
        let closed = self
            .connections
            .remove_if(key, |_, handle| handle.id == id && handle.leases == 0);
        if closed.is_some() {
            debug!(transport = %key.0, peer = %key.1, "closing client connection");
        }
    }

    pub(super) fn forget_connection(&self, key: &ConnectionKey, id: u64) {
        self.connections.remove_if(key, |_, handle| handle.id == id);
    }

    /// 入站字节：解析后把响应交给等待中的客户端事务，其余进入分发队列
    pub(super) async fn deliver(&self, data: &[u8], source: SipTarget) {
        if data.iter().all(|byte| byte.is_ascii_whitespace()) {
            return;
        }
        if data.len() > self.options.max_message_size {
            warn!(%source, size = data.len(), "dropping oversized message");
            return;
        }
        self.trace("recv", data, &source);

        let message = match std::str::from_utf8(data)
            .map_err(|err| err.to_string())
            .and_then(|text| SipMessage::try_from(text).map_err(|err| err.to_string()))
        {
            Ok(message) => message,
            Err(err) => {
                debug!(%source, error = %err, "discarding unparsable message");
                return;
            }
        };

        match message {
            SipMessage::Response(response) => {
                let waiting = top_via_branch(&response.headers)
                    .and_then(|branch| self.pending.get(&branch).map(|tx| tx.value().clone()));
                if let Some(tx) = waiting {
                    if tx.send(response).is_err() {
                        debug!(%source, "client transaction already gone");
                    }
                    return;
                }
                let _ = self
                    .inbound_tx
                    .send(InboundEvent::Response { response, source })
                    .await;
            }
            SipMessage::Request(request) => {
                if self
                    .inbound_tx
                    .send(InboundEvent::Request { request, source })
                    .await
                    .is_err()
                {
                    debug!(%source, "dispatch queue closed");
                }
            }
        }
    }

    fn trace(&self, direction: &str, payload: &[u8], peer: &SipTarget) {
        match self.options.trace_level {
            TraceLevel::Off => {}
            TraceLevel::Messages => {
                let first_line = payload
                    .split(|byte| *byte == b'\r' || *byte == b'\n')
                    .next()
                    .unwrap_or_default();
                debug!(
                    target: "sipio::wire",
                    %peer,
                    size = payload.len(),
                    "{} {}",
                    direction,
                    String::from_utf8_lossy(first_line)
                );
            }
            TraceLevel::Verbose => {
                debug!(
                    target: "sipio::wire",
                    %peer,
                    "{}\n{}",
                    direction,
                    String::from_utf8_lossy(payload)
                );
            }
        }
    }
}

/// 客户端事务：接收与请求顶层 Via branch 匹配的响应
pub struct ClientTransaction {
    branch: String,
    responses: mpsc::UnboundedReceiver<rsip::Response>,
    channel: Channel,
    lease: Option<Lease>,
}

impl ClientTransaction {
    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// 等待下一条响应；通道停止时返回 None
    pub async fn receive(&mut self) -> Option<rsip::Response> {
        let cancel = self.channel.inner.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => None,
            response = self.responses.recv() => response,
        }
    }
}

impl Drop for ClientTransaction {
    fn drop(&mut self) {
        self.channel.inner.pending.remove(&self.branch);
        if let Some((key, id)) = self.lease.take() {
            self.channel.inner.release_lease(&key, id);
        }
    }
}

async fn bind_listener(
    address: IpAddr,
    port: u16,
    transport: TransportKind,
) -> Result<TcpListener, BindError> {
    TcpListener::bind(SocketAddr::new(address, port))
        .await
        .map_err(|source| BindError {
            transport,
            address,
            port,
            source,
        })
}

async fn bind_datagram(address: IpAddr, port: u16) -> Result<UdpSocket, BindError> {
    UdpSocket::bind(SocketAddr::new(address, port))
        .await
        .map_err(|source| BindError {
            transport: TransportKind::Datagram,
            address,
            port,
            source,
        })
}

fn endpoint_of(
    address: IpAddr,
    requested_port: u16,
    transport: TransportKind,
    bound: std::io::Result<SocketAddr>,
) -> Result<ListeningEndpoint, BindError> {
    let bound = bound.map_err(|source| BindError {
        transport,
        address,
        port: requested_port,
        source,
    })?;
    Ok(ListeningEndpoint {
        local_address: address,
        port: bound.port(),
        transport,
    })
}

/// 取顶层 Via 的 branch 参数
pub(crate) fn top_via_branch(headers: &rsip::Headers) -> Option<String> {
    let via = headers.iter().find_map(|header| match header {
        rsip::Header::Via(via) => Some(via.value().to_string()),
        _ => None,
    })?;
    let first = via.split(',').next()?;
    first.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("branch")
            .then(|| value.trim().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    const LOCALHOST: &str = "127.0.0.1";

    struct Recorder {
        requests: mpsc::UnboundedSender<(rsip::Request, SipTarget)>,
    }

    #[async_trait]
    impl SipListener for Recorder {
        async fn on_request(&self, request: rsip::Request, source: SipTarget) {
            let _ = self.requests.send((request, source));
        }
    }

    fn options() -> StackOptions {
        StackOptions::ephemeral(LOCALHOST.parse().unwrap())
    }

    fn options_request(transport: &str, branch: &str) -> String {
        format!(
            "OPTIONS sip:{LOCALHOST} SIP/2.0\r\n\
Via: SIP/2.0/{transport} {LOCALHOST}:5999;branch={branch}\r\n\
From: <sip:tester@{LOCALHOST}>;tag=1\r\n\
To: <sip:{LOCALHOST}>\r\n\
Call-ID: {branch}@test\r\n\
CSeq: 1 OPTIONS\r\n\
Max-Forwards: 70\r\n\
Content-Length: 0\r\n\r\n"
        )
    }

    #[tokio::test]
    async fn test_bind_all_three_transports() {
        let channel = Channel::bind(options()).await.unwrap();
        assert_eq!(channel.endpoints().len(), 3);
        for transport in TransportKind::ALL {
            let endpoint = channel.endpoint(transport).unwrap();
            assert_ne!(endpoint.port, 0);
        }
        channel.stop().await;
        channel.stop().await;
    }

    #[tokio::test]
    async fn test_port_in_use_is_bind_error_and_releases_others() {
        let occupied = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
        let busy_port = occupied.local_addr().unwrap().port();
        let free_tcp = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
        let free_udp = std::net::UdpSocket::bind((LOCALHOST, 0)).unwrap();
        let tcp_port = free_tcp.local_addr().unwrap().port();
        let udp_port = free_udp.local_addr().unwrap().port();
        drop(free_tcp);
        drop(free_udp);

        let mut opts = options();
        opts.stream_port = tcp_port;
        opts.datagram_port = udp_port;
        opts.web_port = busy_port;

        let err = match Channel::bind(opts.clone()).await {
            Ok(_) => panic!("bind should fail while the ws port is taken"),
            Err(err) => err,
        };
        assert_eq!(err.transport, TransportKind::WebTransport);
        assert_eq!(err.port, busy_port);

        // 已获取的 TCP / UDP 端口必须已释放
        drop(occupied);
        let channel = Channel::bind(opts).await.unwrap();
        assert_eq!(channel.endpoint(TransportKind::Stream).unwrap().port, tcp_port);
        assert_eq!(channel.endpoint(TransportKind::Datagram).unwrap().port, udp_port);
        channel.stop().await;
    }

    #[tokio::test]
    async fn test_stop_releases_ports_for_rebind() {
        let first = Channel::bind(options()).await.unwrap();
        let mut opts = options();
        opts.stream_port = first.endpoint(TransportKind::Stream).unwrap().port;
        opts.datagram_port = first.endpoint(TransportKind::Datagram).unwrap().port;
        opts.web_port = first.endpoint(TransportKind::WebTransport).unwrap().port;
        first.stop().await;

        let second = Channel::bind(opts).await.unwrap();
        assert!(first.is_closed());
        assert!(!second.is_closed());
        second.stop().await;
    }

    #[tokio::test]
    async fn test_udp_request_reaches_listener_attached_later() {
        let channel = Channel::bind(options()).await.unwrap();
        let udp_addr = channel
            .endpoint(TransportKind::Datagram)
            .unwrap()
            .socket_addr();

        let client = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        client
            .send_to(options_request("UDP", "z9hG4bKearly").as_bytes(), udp_addr)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        channel
            .attach_listener(Arc::new(Recorder { requests: tx }))
            .unwrap();

        let (request, source) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.method, rsip::Method::Options);
        assert_eq!(source.transport, TransportKind::Datagram);
        assert_eq!(source.addr, client.local_addr().unwrap());

        let (tx2, _rx2) = mpsc::unbounded_channel();
        assert!(matches!(
            channel.attach_listener(Arc::new(Recorder { requests: tx2 })),
            Err(TransportError::ListenerAttached)
        ));
        channel.stop().await;
    }

    #[tokio::test]
    async fn test_oversized_datagram_dropped() {
        let mut opts = options();
        opts.max_message_size = 300;
        let channel = Channel::bind(opts).await.unwrap();
        let udp_addr = channel
            .endpoint(TransportKind::Datagram)
            .unwrap()
            .socket_addr();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel
            .attach_listener(Arc::new(Recorder { requests: tx }))
            .unwrap();

        let client = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        let mut oversized = options_request("UDP", "z9hG4bKbig");
        oversized.insert_str(oversized.len() - 4, &format!("\r\nX-Pad: {}", "p".repeat(400)));
        client.send_to(oversized.as_bytes(), udp_addr).await.unwrap();
        client
            .send_to(options_request("UDP", "z9hG4bKsmall").as_bytes(), udp_addr)
            .await
            .unwrap();

        let (request, _) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(top_via_branch(&request.headers).as_deref(), Some("z9hG4bKsmall"));
        channel.stop().await;
    }

    #[tokio::test]
    async fn test_tcp_framing_delivers_request() {
        let channel = Channel::bind(options()).await.unwrap();
        let tcp_addr = channel
            .endpoint(TransportKind::Stream)
            .unwrap()
            .socket_addr();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel
            .attach_listener(Arc::new(Recorder { requests: tx }))
            .unwrap();

        let mut stream = tokio::net::TcpStream::connect(tcp_addr).await.unwrap();
        let message = options_request("TCP", "z9hG4bKtcp");
        let (head, tail) = message.split_at(20);
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.write_all(tail.as_bytes()).await.unwrap();

        let (request, source) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.method, rsip::Method::Options);
        assert_eq!(source.transport, TransportKind::Stream);
        channel.stop().await;
    }

    #[tokio::test]
    async fn test_send_request_matches_response_by_branch() {
        let channel = Channel::bind(options()).await.unwrap();
        let peer = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        let target = SipTarget::new(TransportKind::Datagram, peer.local_addr().unwrap());

        let branch = crate::utils::make_branch();
        let request: rsip::Request = rsip::SipMessage::try_from(
            options_request("UDP", &branch).as_str(),
        )
        .ok()
        .and_then(|message| match message {
            rsip::SipMessage::Request(request) => Some(request),
            _ => None,
        })
        .unwrap();

        let mut transaction = channel.send_request(request, &target).await.unwrap();
        assert_eq!(transaction.branch(), branch);

        let mut buf = vec![0u8; 4096];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        let received = String::from_utf8_lossy(&buf[..len]).to_string();
        assert!(received.starts_with("OPTIONS"));

        let response = format!(
            "SIP/2.0 200 OK\r\n\
Via: SIP/2.0/UDP {LOCALHOST}:5999;branch={branch}\r\n\
From: <sip:tester@{LOCALHOST}>;tag=1\r\n\
To: <sip:{LOCALHOST}>;tag=2\r\n\
Call-ID: {branch}@test\r\n\
CSeq: 1 OPTIONS\r\n\
Content-Length: 0\r\n\r\n"
        );
        peer.send_to(response.as_bytes(), from).await.unwrap();

        let response = tokio::time::timeout(Duration::from_secs(2), transaction.receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status_code, rsip::StatusCode::OK);

        drop(transaction);
        assert!(channel.inner.pending.is_empty());
        channel.stop().await;
    }

    #[tokio::test]
    async fn test_send_after_stop_is_closed() {
        let channel = Channel::bind(options()).await.unwrap();
        channel.stop().await;
        let request = rsip::SipMessage::try_from(options_request("UDP", "z9hG4bKlate").as_str())
            .unwrap();
        let target = SipTarget::new(TransportKind::Datagram, "127.0.0.1:5999".parse().unwrap());
        assert!(matches!(
            channel.send(request, &target).await,
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_top_via_branch() {
        let mut headers = rsip::Headers::default();
        headers.push(rsip::Header::Via(rsip::headers::Via::new(
            "SIP/2.0/UDP 10.0.0.1:5060;rport;branch=z9hG4bK1, SIP/2.0/UDP 10.0.0.2;branch=z9hG4bK2",
        )));
        assert_eq!(top_via_branch(&headers).as_deref(), Some("z9hG4bK1"));
        assert_eq!(top_via_branch(&rsip::Headers::default()), None);
    }
}
