// rust_tcp_utils/src/server/mod.rs

//! TCP 服务端模块。
//!
//! 本模块对外提供 `TcpServer`，它把以下几部分组合在一起：
//! - **接受循环** (`transport`): 在后台任务中接受新连接并注册到注册表。
//! - **连接注册表** (`crate::registry`): 维护活动连接，执行容量上限。
//! - **生命周期回调** (`callbacks`): `on_connect` / `on_data` / `on_close`。
//!
//! 连接上的网络错误不会以错误的形式返回给应用，而是转换为连接关闭事件；
//! 只有配置错误和绑定失败会从 `listen` 返回。

pub mod callbacks;
pub mod transport;

use crate::config::ServerConfig;
use crate::connection::{CloseReason, Connection, ConnectionId};
use crate::error::TcpUtilError;
use crate::registry::ConnectionRegistry;
use callbacks::{Callbacks, CloseCallback, ConnectCallback, DataCallback};
use futures_util::FutureExt;
use log::{info, warn};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use transport::AcceptLoop;
pub use transport::AcceptState;

/// 接受循环、各连接和 `TcpServer` 之间共享的状态。
pub(crate) struct ServerShared {
    pub(crate) registry: ConnectionRegistry,
    pub(crate) callbacks: Callbacks,
}

impl ServerShared {
    /// 连接关闭路径的最后一步：从注册表移除并 (在 `on_connect` 之后) 通知应用。
    pub(crate) async fn connection_closed(&self, connection: &Arc<Connection>, reason: CloseReason) {
        self.registry.remove(&connection.id());
        if connection.should_notify_close(reason) {
            self.callbacks.fire_close(connection, reason).await;
        }
    }
}

/// 可嵌入应用程序的 TCP 服务器。
///
/// ```no_run
/// # async fn demo() -> Result<(), rust_tcp_utils::TcpUtilError> {
/// use rust_tcp_utils::TcpServer;
///
/// let server = TcpServer::new();
/// server.set_on_connect(|conn| async move {
///     conn.send(b"welcome\n").await;
/// });
/// server.set_on_close(|conn, reason| async move {
///     println!("{} closed: {}", conn.peer_addr(), reason);
/// });
/// server.listen(9000, Some(100)).await?;
/// server.broadcast(b"hello everyone\n").await;
/// server.shutdown().await;
/// # Ok(())
/// # }
/// ```
///
/// 在 `on_connect` 回调中调用 `close` / `shutdown` 会与等待接受任务退出相互等待，
/// 需要时应在回调中 `tokio::spawn` 一个任务去做。
pub struct TcpServer {
    shared: Arc<ServerShared>,
    accept_loop: tokio::sync::Mutex<AcceptLoop>,
}

impl TcpServer {
    /// 创建一个尚未监听的服务器。
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ServerShared {
                registry: ConnectionRegistry::new(None),
                callbacks: Callbacks::default(),
            }),
            accept_loop: tokio::sync::Mutex::new(AcceptLoop::new()),
        }
    }

    /// 在所有网络接口的 `port` 端口上开始监听，返回实际绑定的地址。
    ///
    /// `max_clients` 为 `None` 时不限制并发客户端数量。
    pub async fn listen(
        &self,
        port: u16,
        max_clients: Option<usize>,
    ) -> Result<SocketAddr, TcpUtilError> {
        self.listen_with(ServerConfig::new(port, max_clients)).await
    }

    /// 按给定配置开始监听。
    ///
    /// 已在监听时返回 `TcpUtilError::AlreadyListening`，正在运行的监听不受影响。
    pub async fn listen_with(&self, config: ServerConfig) -> Result<SocketAddr, TcpUtilError> {
        config.validate()?;

        let mut accept_loop = self.accept_loop.lock().await;
        if accept_loop.state() != AcceptState::Stopped {
            warn!("[TCP服务器] 服务器已在监听 {:?}，忽略重复的 listen 调用", accept_loop.local_addr());
            return Err(TcpUtilError::AlreadyListening);
        }
        let previous_capacity = self.shared.registry.max_capacity();
        if !self.shared.registry.set_max_capacity(config.max_clients) {
            return Err(TcpUtilError::InvalidConfig(format!(
                "当前已有 {} 个连接，超过新的最大客户端数量 {:?}",
                self.shared.registry.len(),
                config.max_clients
            )));
        }
        // 绑定失败时恢复原来的上限，失败的 listen 不留下任何状态变化
        accept_loop.start(&config, Arc::clone(&self.shared)).inspect_err(|_| {
            self.shared.registry.set_max_capacity(previous_capacity);
        })
    }

    /// 设置新连接回调。
    pub fn set_on_connect<F, Fut>(&self, callback: F)
    where
        F: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped: ConnectCallback =
            Arc::new(move |connection: Arc<Connection>| callback(connection).boxed());
        self.shared.callbacks.set_on_connect(wrapped);
    }

    /// 设置连接关闭回调。每个连接至多触发一次，且总在其 `on_connect` 之后。
    pub fn set_on_close<F, Fut>(&self, callback: F)
    where
        F: Fn(Arc<Connection>, CloseReason) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped: CloseCallback = Arc::new(move |connection: Arc<Connection>, reason: CloseReason| {
            callback(connection, reason).boxed()
        });
        self.shared.callbacks.set_on_close(wrapped);
    }

    /// 设置数据到达回调。数据是原始字节流片段，没有消息边界。
    pub fn set_on_data<F, Fut>(&self, callback: F)
    where
        F: Fn(Arc<Connection>, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped: DataCallback = Arc::new(move |connection: Arc<Connection>, data: Vec<u8>| {
            callback(connection, data).boxed()
        });
        self.shared.callbacks.set_on_data(wrapped);
    }

    /// 向所有已注册连接发送同一份数据。单个连接的失败不影响其他连接。
    pub async fn broadcast(&self, data: &[u8]) {
        self.shared.registry.broadcast(data).await;
    }

    /// 停止接受新连接并关闭监听套接字。已建立的连接保持不变。
    pub async fn close(&self) {
        self.accept_loop.lock().await.stop().await;
    }

    /// 关闭所有客户端连接，返回被关闭的数量。
    pub async fn close_all_clients(&self) -> usize {
        self.shared.registry.clear_all().await
    }

    /// 完整关闭：先停止接受新连接，再关闭所有已有连接。
    pub async fn shutdown(&self) {
        info!("[TCP服务器] 正在关闭服务器...");
        self.close().await;
        let closed = self.close_all_clients().await;
        info!("[TCP服务器] 服务器已关闭，共关闭 {} 个客户端连接", closed);
    }

    /// 接受循环当前的状态。
    pub async fn state(&self) -> AcceptState {
        self.accept_loop.lock().await.state()
    }

    pub async fn is_listening(&self) -> bool {
        self.accept_loop.lock().await.state() == AcceptState::Listening
    }

    /// 当前监听的地址，未监听时为 `None`。
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.accept_loop.lock().await.local_addr()
    }

    /// 当前生效的最大客户端数量，`None` 表示不限制。
    pub fn max_clients(&self) -> Option<usize> {
        self.shared.registry.max_capacity()
    }

    pub fn client_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// 当前所有已注册连接的快照。
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared.registry.snapshot()
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.shared.registry.get(id)
    }
}

impl Default for TcpServer {
    fn default() -> Self {
        Self::new()
    }
}
