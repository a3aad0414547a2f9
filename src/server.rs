//! 生命周期控制器
//!
//! 启动顺序：解析本机地址 → 绑定监听端点 → 派生 Contact → 预加载位置表 →
//! 安装分发监听器 → 启动注册调度 → 启动控制面。任何一步失败都会撤销已完成的步骤。
//!
//! 停止顺序：控制面 → 注册调度 → 信令通道。

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::contact::{resolve_local_address, ContactIdentity};
use crate::control::{ControlPlane, NoopControlPlane};
use crate::error::ServerError;
use crate::location::{preload, LocationService, LocationTable};
use crate::processor::Processor;
use crate::registration::{DigestRegistryHelper, RegistrationScheduler, RegistryHelper, ScheduledTask};
use crate::resources::{ResourcesApi, StaticResources};
use crate::transport::{Channel, ListeningEndpoint, SipListener};

/// 服务器构建器
pub struct ServerBuilder {
    config: ServerConfig,
    resources: Option<Arc<dyn ResourcesApi>>,
    location: Option<Arc<dyn LocationService>>,
    control: Option<Arc<dyn ControlPlane>>,
    listener: Option<Arc<dyn SipListener>>,
    helper: Option<Arc<dyn RegistryHelper>>,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            resources: None,
            location: None,
            control: None,
            listener: None,
            helper: None,
        }
    }

    pub fn with_resources(mut self, resources: Arc<dyn ResourcesApi>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn with_location(mut self, location: Arc<dyn LocationService>) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_control_plane(mut self, control: Arc<dyn ControlPlane>) -> Self {
        self.control = Some(control);
        self
    }

    /// 替换默认的 [`Processor`]
    pub fn with_listener(mut self, listener: Arc<dyn SipListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// 替换默认的 [`DigestRegistryHelper`]
    pub fn with_registry_helper(mut self, helper: Arc<dyn RegistryHelper>) -> Self {
        self.helper = Some(helper);
        self
    }

    pub fn build(self) -> Server {
        Server {
            config: self.config,
            resources: self
                .resources
                .unwrap_or_else(|| Arc::new(StaticResources::default())),
            location: self
                .location
                .unwrap_or_else(|| Arc::new(LocationTable::new())),
            control: self.control.unwrap_or_else(|| Arc::new(NoopControlPlane)),
            listener: self.listener,
            helper: self.helper,
            running: Mutex::new(None),
        }
    }
}

struct Running {
    channel: Channel,
    contact: ContactIdentity,
    scheduler: ScheduledTask,
}

/// SIP 服务器
pub struct Server {
    config: ServerConfig,
    resources: Arc<dyn ResourcesApi>,
    location: Arc<dyn LocationService>,
    control: Arc<dyn ControlPlane>,
    listener: Option<Arc<dyn SipListener>>,
    helper: Option<Arc<dyn RegistryHelper>>,
    running: Mutex<Option<Running>>,
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    /// 启动服务器
    ///
    /// # 返回
    /// - `Ok(())` - 所有组件都已启动
    /// - `Err(ServerError)` - 第一个失败步骤的错误，已启动的部分已被撤销
    pub async fn start(&self) -> Result<(), ServerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        self.config.validate()?;
        let address = resolve_local_address(self.config.ip.as_deref()).await?;
        if let Some(external) = &self.config.external_ip {
            info!(external_ip = %external, "external address configured");
        }

        let channel = Channel::bind(self.config.stack_options(address)).await?;

        match self.bring_up(&channel).await {
            Ok((contact, scheduler)) => {
                info!(
                    contact = %contact,
                    endpoints = ?channel.endpoints(),
                    "sip server started"
                );
                *running = Some(Running {
                    channel,
                    contact,
                    scheduler,
                });
                Ok(())
            }
            Err(e) => {
                error!(code = e.error_code(), "startup aborted: {}", e);
                channel.stop().await;
                Err(e)
            }
        }
    }

    /// 通道绑定之后的启动步骤
    async fn bring_up(
        &self,
        channel: &Channel,
    ) -> Result<(ContactIdentity, ScheduledTask), ServerError> {
        let contact = ContactIdentity::derive(channel.local_address())?;

        let dids = self.resources.dids()?;
        let report = preload(&dids, self.location.as_ref());
        if !report.skipped.is_empty() {
            warn!(skipped = report.skipped.len(), "some DIDs were not loaded");
        }

        let listener = self.listener.clone().unwrap_or_else(|| {
            Arc::new(Processor::new(
                channel.clone(),
                contact.clone(),
                self.location.clone(),
            ))
        });
        channel.attach_listener(listener)?;

        let policy = self.config.registration_policy();
        let helper = self.helper.clone().unwrap_or_else(|| {
            Arc::new(DigestRegistryHelper::new(
                channel.clone(),
                contact.clone(),
                self.resources.clone(),
                &policy,
            ))
        });
        let scheduler = RegistrationScheduler::new(self.resources.clone(), helper, &policy)?.spawn()?;

        if let Err(e) = self.control.start().await {
            scheduler.cancel().await;
            return Err(e);
        }

        Ok((contact, scheduler))
    }

    /// 停止服务器；未运行时直接返回
    pub async fn stop(&self) -> Result<(), ServerError> {
        let Some(running) = self.running.lock().await.take() else {
            debug!("server is not running");
            return Ok(());
        };

        let control = self.control.stop().await;
        if let Err(e) = &control {
            warn!("control plane stop failed: {}", e);
        }
        running.scheduler.cancel().await;
        running.channel.stop().await;
        info!("sip server stopped");
        control
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn endpoints(&self) -> Vec<ListeningEndpoint> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.channel.endpoints().to_vec())
            .unwrap_or_default()
    }

    pub async fn channel(&self) -> Option<Channel> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.channel.clone())
    }

    pub async fn contact(&self) -> Option<ContactIdentity> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.contact.clone())
    }

    pub fn location(&self) -> Arc<dyn LocationService> {
        self.location.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DidRecord;
    use crate::error::RegistrationAttemptError;
    use crate::registration::RegistrationOutcome;
    use crate::transport::TransportKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingControl {
        started: AtomicUsize,
        stopped: AtomicUsize,
        fail_start: bool,
    }

    #[async_trait]
    impl ControlPlane for RecordingControl {
        async fn start(&self) -> Result<(), ServerError> {
            if self.fail_start {
                return Err(ServerError::control_plane("refused"));
            }
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), ServerError> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct IdleHelper;

    #[async_trait]
    impl RegistryHelper for IdleHelper {
        async fn request_challenge(
            &self,
            _username: &str,
            _host: &str,
            _transport: TransportKind,
        ) -> Result<RegistrationOutcome, RegistrationAttemptError> {
            Ok(RegistrationOutcome::Registered { status: 200 })
        }
    }

    fn free_ports() -> (u16, u16, u16) {
        let tcp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let ws = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let udp = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        (
            tcp.local_addr().unwrap().port(),
            udp.local_addr().unwrap().port(),
            ws.local_addr().unwrap().port(),
        )
    }

    fn config((tcp_port, udp_port, ws_port): (u16, u16, u16)) -> ServerConfig {
        ServerConfig {
            ip: Some("127.0.0.1".into()),
            tcp_port,
            udp_port,
            ws_port,
            ..Default::default()
        }
    }

    fn server(config: ServerConfig, control: Arc<RecordingControl>) -> Server {
        let resources = StaticResources::new(
            vec![
                DidRecord {
                    e164num: "15551234567".into(),
                    contact: "sip:15551234567@gw.example".into(),
                },
                DidRecord {
                    e164num: "15550000000".into(),
                    contact: "not a contact".into(),
                },
            ],
            vec![],
        );
        Server::builder(config)
            .with_resources(Arc::new(resources))
            .with_control_plane(control)
            .with_registry_helper(Arc::new(IdleHelper))
            .build()
    }

    #[tokio::test]
    async fn test_start_stop_restart() {
        let ports = free_ports();
        let control = Arc::new(RecordingControl::default());
        let server = server(config(ports), control.clone());

        server.start().await.unwrap();
        assert!(server.is_running().await);
        assert_eq!(control.started.load(Ordering::SeqCst), 1);
        assert_eq!(server.endpoints().await.len(), 3);
        assert_eq!(
            server.location().get("tel:15551234567").unwrap().to_string(),
            "sip:15551234567@gw.example"
        );
        assert!(server.location().get("tel:15550000000").is_none());
        assert_eq!(server.contact().await.unwrap().to_string(), "sip:127.0.0.1");

        assert!(matches!(server.start().await, Err(ServerError::AlreadyRunning)));

        server.stop().await.unwrap();
        assert!(!server.is_running().await);
        assert_eq!(control.stopped.load(Ordering::SeqCst), 1);
        server.stop().await.unwrap();
        assert_eq!(control.stopped.load(Ordering::SeqCst), 1);

        server.start().await.unwrap();
        let ports_after: Vec<_> = server.endpoints().await.iter().map(|e| e.port).collect();
        assert_eq!(ports_after, vec![ports.0, ports.1, ports.2]);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_aborts_startup() {
        let ports = free_ports();
        let occupied = std::net::TcpListener::bind(("127.0.0.1", ports.2)).unwrap();
        let control = Arc::new(RecordingControl::default());
        let server = server(config(ports), control.clone());

        let err = server.start().await.unwrap_err();
        match &err {
            ServerError::Bind(bind) => {
                assert_eq!(bind.transport, TransportKind::WebTransport);
                assert_eq!(bind.port, ports.2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!err.is_recoverable());
        assert!(!server.is_running().await);
        assert_eq!(control.started.load(Ordering::SeqCst), 0);
        assert!(server.location().is_empty());

        drop(occupied);
        server.start().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_control_plane_failure_releases_endpoints() {
        let ports = free_ports();
        let control = Arc::new(RecordingControl {
            fail_start: true,
            ..Default::default()
        });
        let failing = server(config(ports), control);
        assert!(matches!(
            failing.start().await,
            Err(ServerError::ControlPlane(_))
        ));
        assert!(!failing.is_running().await);

        let healthy = server(config(ports), Arc::new(RecordingControl::default()));
        healthy.start().await.unwrap();
        healthy.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unresolvable_address_fails() {
        let mut config = config(free_ports());
        config.ip = Some("no-such-host.invalid".into());
        let server = server(config, Arc::new(RecordingControl::default()));
        assert!(matches!(
            server.start().await,
            Err(ServerError::AddressResolution(_))
        ));
    }

    #[tokio::test]
    async fn test_running_server_answers_options() {
        let ports = free_ports();
        let server = server(config(ports), Arc::new(RecordingControl::default()));
        server.start().await.unwrap();

        let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let options = "OPTIONS sip:127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5999;branch=z9hG4bKsrv\r\n\
From: <sip:tester@127.0.0.1>;tag=1\r\n\
To: <sip:127.0.0.1>\r\n\
Call-ID: srv@test\r\n\
CSeq: 1 OPTIONS\r\n\
Max-Forwards: 70\r\n\
Content-Length: 0\r\n\r\n";
        client
            .send_to(options.as_bytes(), ("127.0.0.1", ports.1))
            .await
            .unwrap();

        let mut buf = vec![0u8; 4096];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = String::from_utf8_lossy(&buf[..len]);
        assert!(reply.starts_with("SIP/2.0 200"));

        server.stop().await.unwrap();
    }
}
