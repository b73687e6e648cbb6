//! `rust_tcp_utils` 是一个可嵌入应用程序的 TCP 连接管理 Crate。
//! 它负责接受连接、在有容量上限的注册表中维护活动连接，
//! 并通过回调把连接的生命周期事件通知给上层应用。
//!
//! 主要模块包括：
//! - `config`: 服务端配置 `ServerConfig`。
//! - `error`: 库中使用的错误类型 `TcpUtilError`。
//! - `connection`: 单个已接受连接 `Connection` 及其关闭原因 `CloseReason`。
//! - `registry`: 线程安全、有容量上限的连接注册表 `ConnectionRegistry`。
//! - `server`: 接受循环与对外的 `TcpServer`。
//! - `client`: 简单的 TCP 客户端传输层。

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod registry;
pub mod server;

pub use config::ServerConfig;
pub use connection::{CloseReason, Connection, ConnectionId};
pub use error::TcpUtilError;
pub use registry::ConnectionRegistry;
pub use server::TcpServer;
