/// Registration 模块
///
/// 周期性地向上游网关注册本服务器
///
/// ## 组成
///
/// - `RegistryHelper` trait: 单次注册尝试（发起 REGISTER 并应答认证挑战）
/// - `DigestRegistryHelper`: 基于信令通道和 MD5 摘要认证的实现
/// - `RegistrationScheduler`: 首次延迟 5 秒、之后按 (租期 - 余量) 周期触发，
///   每个周期对每个网关的主机和别名注册服务器各发起一次独立尝试
///
/// ## 使用示例
///
/// ```rust,no_run
/// # async fn demo(
/// #     channel: sipio::transport::Channel,
/// #     contact: sipio::contact::ContactIdentity,
/// #     resources: std::sync::Arc<dyn sipio::resources::ResourcesApi>,
/// # ) {
/// use std::sync::Arc;
/// use sipio::config::RegistrationPolicy;
/// use sipio::registration::*;
///
/// let policy = RegistrationPolicy::default();
/// let helper = DigestRegistryHelper::new(channel, contact, resources.clone(), &policy);
/// let scheduler = RegistrationScheduler::new(resources, Arc::new(helper), &policy).unwrap();
/// let task = scheduler.spawn().unwrap();
/// // ...
/// task.cancel().await;
/// # }
/// ```
mod digest;
mod scheduler;

use std::fmt;

use async_trait::async_trait;

use crate::error::RegistrationAttemptError;
use crate::transport::TransportKind;

pub use digest::{digest_response, DigestChallenge, DigestRegistryHelper};
pub use scheduler::{RegistrationSchedule, RegistrationScheduler, ScheduledTask, TickReport};

/// 注册尝试的结果（收到了最终响应）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// 2xx
    Registered { status: u16 },
    /// 非 2xx 最终响应，下一周期重试
    Rejected { status: u16 },
}

impl RegistrationOutcome {
    pub fn is_registered(&self) -> bool {
        matches!(self, RegistrationOutcome::Registered { .. })
    }
}

/// 单个网关注册尝试的状态，仅用于日志
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Idle,
    ChallengeRequested,
    Registered,
    Failed,
}

impl fmt::Display for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            GatewayState::Idle => "idle",
            GatewayState::ChallengeRequested => "challenge-requested",
            GatewayState::Registered => "registered",
            GatewayState::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// 一次注册尝试的目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationAttempt {
    /// 网关显示名
    pub gateway: String,
    pub username: String,
    pub host: String,
    pub transport: TransportKind,
}

impl fmt::Display for RegistrationAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}@{} via {})",
            self.gateway, self.username, self.host, self.transport
        )
    }
}

/// 注册辅助接口
///
/// 实现者负责一次完整的注册交互；失败只影响本次尝试
#[async_trait]
pub trait RegistryHelper: Send + Sync {
    /// 向 `host` 以 `username` 发起注册并处理认证挑战
    ///
    /// # 参数
    /// - `username`: 网关账号
    /// - `host`: 注册服务器（主机或别名）
    /// - `transport`: 使用的传输
    ///
    /// # 返回
    /// - `Ok(RegistrationOutcome)`: 收到最终响应
    /// - `Err(RegistrationAttemptError)`: 解析、传输或认证失败
    async fn request_challenge(
        &self,
        username: &str,
        host: &str,
        transport: TransportKind,
    ) -> Result<RegistrationOutcome, RegistrationAttemptError>;
}
