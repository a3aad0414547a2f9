// 声明所有模块
pub mod config;
pub mod contact;
pub mod control;
pub mod error;
pub mod location;
pub mod processor;
pub mod registration;
pub mod resources;
pub mod server;
pub mod transport;
pub mod utils;

/// 重新导出thiserror错误类型
pub use crate::error::{
    AddressResolutionError, BindError, ConfigError, MalformedContactError,
    RegistrationAttemptError, ServerError, TransportError,
};

/// 主要API重新导出，简化使用
pub use crate::config::{ConfigFile, ServerConfig};
pub use crate::contact::ContactIdentity;
pub use crate::location::{LocationService, LocationTable};
pub use crate::resources::{FileResources, ResourcesApi, StaticResources};
pub use crate::server::{Server, ServerBuilder};
pub use crate::transport::{Channel, TransportKind};

/// sipio 库的版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 便捷函数：从配置文件构建服务器
///
/// 核心配置在构建时读取一次；DID 与网关在每次使用时重新读取文件
pub fn server_from_file(path: impl AsRef<std::path::Path>) -> Result<Server, ConfigError> {
    let path = path.as_ref();
    let file = ConfigFile::load(path)?;
    Ok(Server::builder(file.server)
        .with_resources(std::sync::Arc::new(FileResources::new(path)))
        .build())
}
