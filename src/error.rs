// rust_tcp_utils/src/error.rs

//! 定义 TCP 连接管理库相关的错误类型。
//!
//! 只有配置错误和绑定失败会以 `Err` 的形式返回给调用方；
//! 已建立连接上的网络错误会被转换为连接关闭事件，而不是向上传播。

use std::net::SocketAddr;
use thiserror::Error;

/// TCP 工具库的统一错误类型。
#[derive(Error, Debug)]
pub enum TcpUtilError {
    /// 监听套接字无法绑定到指定地址 (例如端口已被占用)。
    #[error("TCP 监听器绑定失败 ({addr}): {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// 服务器已经处于监听状态时再次调用 `listen`。
    #[error("服务器已在监听中")]
    AlreadyListening,

    /// 配置项取值非法。
    #[error("无效的配置: {0}")]
    InvalidConfig(String),

    /// 配置文本无法解析。
    #[error("配置解析错误: {0}")]
    Config(String),

    /// 底层 I/O 错误。
    #[error("I/O错误: {0}")]
    Io(#[from] std::io::Error),

    /// 连接已关闭，无法继续操作。
    #[error("连接已关闭")]
    ConnectionClosed,
}

impl From<serde_json::Error> for TcpUtilError {
    fn from(e: serde_json::Error) -> Self {
        TcpUtilError::Config(e.to_string())
    }
}
