//! 资源接口：DID 与网关配置的只读快照
//!
//! 每次调用返回一份新的快照，调度器在每个周期重新读取，
//! 网关配置修改后在下一个周期生效。

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::config::{ConfigFile, DidRecord, GatewayTarget};
use crate::error::ConfigError;

pub trait ResourcesApi: Send + Sync {
    fn dids(&self) -> Result<Vec<DidRecord>, ConfigError>;

    fn gateways(&self) -> Result<Vec<GatewayTarget>, ConfigError>;
}

/// 从 TOML 配置文件读取资源，每次快照都重新读文件
#[derive(Debug, Clone)]
pub struct FileResources {
    path: PathBuf,
}

impl FileResources {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn snapshot(&self) -> Result<ConfigFile, ConfigError> {
        ConfigFile::load(&self.path)
    }
}

impl ResourcesApi for FileResources {
    fn dids(&self) -> Result<Vec<DidRecord>, ConfigError> {
        Ok(self.snapshot()?.did)
    }

    fn gateways(&self) -> Result<Vec<GatewayTarget>, ConfigError> {
        Ok(self.snapshot()?.gateway)
    }
}

/// 内存中的资源，可在运行期整体替换
#[derive(Debug, Default)]
pub struct StaticResources {
    inner: RwLock<(Vec<DidRecord>, Vec<GatewayTarget>)>,
}

impl StaticResources {
    pub fn new(dids: Vec<DidRecord>, gateways: Vec<GatewayTarget>) -> Self {
        Self {
            inner: RwLock::new((dids, gateways)),
        }
    }

    pub fn replace_gateways(&self, gateways: Vec<GatewayTarget>) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.1 = gateways;
    }

    pub fn replace_dids(&self, dids: Vec<DidRecord>) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.0 = dids;
    }
}

impl ResourcesApi for StaticResources {
    fn dids(&self) -> Result<Vec<DidRecord>, ConfigError> {
        let guard = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(guard.0.clone())
    }

    fn gateways(&self) -> Result<Vec<GatewayTarget>, ConfigError> {
        let guard = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(guard.1.clone())
    }
}
