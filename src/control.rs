//! 控制面服务
//!
//! 生命周期控制器在信令和注册都就绪后启动控制面，停止时最先停止它。

use async_trait::async_trait;
use tracing::debug;

use crate::error::ServerError;

#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn start(&self) -> Result<(), ServerError>;

    async fn stop(&self) -> Result<(), ServerError>;
}

/// 不提供任何接口的控制面
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopControlPlane;

#[async_trait]
impl ControlPlane for NoopControlPlane {
    async fn start(&self) -> Result<(), ServerError> {
        debug!("control plane disabled");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServerError> {
        Ok(())
    }
}
