// rust_tcp_utils/src/config.rs

//! TCP 服务端配置。

use crate::error::TcpUtilError;
use log::debug;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// 默认绑定的主机地址
pub const DEFAULT_HOST: &str = "0.0.0.0";
/// 操作系统 listen 调用的默认等待队列长度
pub const DEFAULT_BACKLOG: u32 = 20;
/// 每个连接读取缓冲区的默认大小（单位：字节）
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// TCP 服务端配置结构体
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// 绑定的主机地址
    pub host: String,
    /// 监听的端口号，0 表示由操作系统分配
    pub port: u16,
    /// 最大并发客户端数量，`None` 表示不限制
    pub max_clients: Option<usize>,
    /// 尚未 accept 的连接在内核中的排队长度
    pub backlog: u32,
    /// 读取任务每次读取的缓冲区大小
    pub read_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: 0,
            max_clients: None,
            backlog: DEFAULT_BACKLOG,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl ServerConfig {
    /// 以默认值为基础，指定端口和最大客户端数量。
    pub fn new(port: u16, max_clients: Option<usize>) -> Self {
        Self {
            port,
            max_clients,
            ..Self::default()
        }
    }

    /// 从 JSON 文本加载配置，缺省字段使用默认值。
    pub fn from_json_str(content: &str) -> Result<Self, TcpUtilError> {
        let config: ServerConfig = serde_json::from_str(content)?;
        config.validate()?;
        debug!("[配置模块] 已从 JSON 加载服务端配置: {:?}", config);
        Ok(config)
    }

    /// 检查配置是否合法。
    pub fn validate(&self) -> Result<(), TcpUtilError> {
        if self.backlog == 0 {
            return Err(TcpUtilError::InvalidConfig("backlog 必须大于 0".to_string()));
        }
        if self.read_buffer_size == 0 {
            return Err(TcpUtilError::InvalidConfig(
                "read_buffer_size 必须大于 0".to_string(),
            ));
        }
        if self.max_clients == Some(0) {
            return Err(TcpUtilError::InvalidConfig(
                "max_clients 为 Some(0) 时服务器无法接受任何连接".to_string(),
            ));
        }
        self.host
            .parse::<IpAddr>()
            .map_err(|e| TcpUtilError::InvalidConfig(format!("无效的主机地址 '{}': {}", self.host, e)))?;
        Ok(())
    }

    /// 解析出监听使用的套接字地址。
    pub fn socket_addr(&self) -> Result<SocketAddr, TcpUtilError> {
        let ip = self
            .host
            .parse::<IpAddr>()
            .map_err(|e| TcpUtilError::InvalidConfig(format!("无效的主机地址 '{}': {}", self.host, e)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}
