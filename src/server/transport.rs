// rust_tcp_utils/src/server/transport.rs

//! 服务端接受循环：监听、接受连接并交给注册表。

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::TcpUtilError;
use crate::server::ServerShared;
use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// 接受连接出错后，下一次尝试前的等待时间。
/// 像文件描述符耗尽这样的错误会立即重复出现，不等待会空转。
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// 接受循环的状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptState {
    Stopped,
    Listening,
    ShuttingDown,
}

/// `AcceptLoop` 负责监听套接字和后台接受任务的生命周期。
pub(crate) struct AcceptLoop {
    state: AcceptState,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl AcceptLoop {
    pub(crate) fn new() -> Self {
        Self {
            state: AcceptState::Stopped,
            local_addr: None,
            shutdown_tx: None,
            handle: None,
        }
    }

    pub(crate) fn state(&self) -> AcceptState {
        self.state
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// 绑定监听套接字并在后台启动接受任务，返回实际绑定的地址。
    ///
    /// 绑定失败 (例如端口已被占用) 会立即返回错误，状态保持 `Stopped`。
    pub(crate) fn start(
        &mut self,
        config: &ServerConfig,
        shared: Arc<ServerShared>,
    ) -> Result<SocketAddr, TcpUtilError> {
        if self.state != AcceptState::Stopped {
            return Err(TcpUtilError::AlreadyListening);
        }

        let addr = config.socket_addr()?;
        let listener = bind_listener(addr, config.backlog)
            .map_err(|source| TcpUtilError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        info!(
            "[接受循环] TCP 服务器正在监听地址: {} (backlog: {}, 最大客户端数: {:?})",
            local_addr, config.backlog, config.max_clients
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let read_buffer_size = config.read_buffer_size;
        self.handle = Some(tokio::spawn(run(listener, shutdown_rx, shared, read_buffer_size)));
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);
        self.state = AcceptState::Listening;
        Ok(local_addr)
    }

    /// 停止接受新连接，并等待接受任务退出。
    ///
    /// 返回之后不会再有新的 `on_connect` 回调发生。已建立的连接不受影响。
    pub(crate) async fn stop(&mut self) {
        if self.state != AcceptState::Listening {
            debug!("[接受循环] 当前状态为 {:?}，无需停止", self.state);
            return;
        }
        self.state = AcceptState::ShuttingDown;
        info!("[接受循环] 正在停止接受新连接...");

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!("[接受循环] 接受任务异常结束: {}", e);
            }
        }

        self.local_addr = None;
        self.state = AcceptState::Stopped;
        info!("[接受循环] 已停止，监听套接字已关闭");
    }
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    #[cfg(not(windows))]
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// 接受循环主体，直到收到关闭信号 (或发送端被丢弃) 为止。
async fn run(
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
    shared: Arc<ServerShared>,
    read_buffer_size: usize,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                info!("[接受循环] 收到关闭信号，退出接受循环");
                break;
            }

            result = listener.accept() => match result {
                Ok((stream, peer_addr)) => {
                    info!("[接受循环] 从 {} 接受了新的 TCP 连接", peer_addr);
                    handle_accepted(&shared, stream, peer_addr, read_buffer_size).await;
                }
                Err(e) => {
                    // 单次接受失败不会终止服务器
                    error!("[接受循环] 接受 TCP 连接失败: {}。服务器将继续运行。", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
    // listener 在此处被丢弃，监听套接字随之关闭
}

async fn handle_accepted(
    shared: &Arc<ServerShared>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    read_buffer_size: usize,
) {
    let (connection, read_half) = Connection::new(stream, peer_addr, Arc::downgrade(shared));

    if !shared.registry.try_add(Arc::clone(&connection)) {
        // 从应用的角度看该连接从未建立过，因此不触发任何回调
        warn!("[接受循环] 连接 {} 未能注册，立即关闭", peer_addr);
        connection.discard().await;
        return;
    }

    shared.callbacks.fire_connect(&connection).await;

    match connection.mark_announced() {
        Some(reason) => {
            debug!("[接受循环] 连接 {} 在 on_connect 期间已关闭，补发 on_close", connection.id());
            shared.callbacks.fire_close(&connection, reason).await;
        }
        None => {
            tokio::spawn(connection.run_reader(read_half, read_buffer_size));
        }
    }
}
