// rust_tcp_utils/src/connection.rs

//! 单个已接受的 TCP 连接。
//!
//! `Connection` 负责该连接上的全部写入与关闭。读取由一个独立的读取任务完成，
//! 它在对端断开或出错时关闭连接，并把收到的数据交给 `on_data` 回调。
//!
//! 关闭只会真正执行一次：`closed` 标志通过 compare-and-swap 翻转，
//! 之后的任何 `close` / `send` 调用都是空操作。

use crate::server::ServerShared;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Notify, watch};
use uuid::Uuid;

/// 连接的唯一标识，在接受连接时生成 (UUID v4)。
pub type ConnectionId = Uuid;

/// 连接关闭的原因，会随 `on_close` 回调一起交给应用。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// 由本端主动关闭 (调用 `close` 或服务器关闭所有客户端)。
    Local,
    /// 对端断开连接或重置了连接。
    Remote,
    /// 读写过程中发生了其他 I/O 错误。
    Error,
}

impl CloseReason {
    /// 根据 I/O 错误的类型判断关闭原因。
    pub fn from_io_error(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected => CloseReason::Remote,
            _ => CloseReason::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Local => "local",
            CloseReason::Remote => "remote",
            CloseReason::Error => "error",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `on_connect` 与 `on_close` 之间的先后关系。
///
/// 在 `on_connect` 返回之前发生的关闭不会立即通知应用，而是记在 `pending_close` 中，
/// 由接受循环在 `on_connect` 返回后补发。
#[derive(Debug, Default)]
struct Lifecycle {
    announced: bool,
    pending_close: Option<CloseReason>,
}

/// 代表一个已被服务器接受的 TCP 连接。
///
/// 实例总是以 `Arc<Connection>` 的形式在注册表、读取任务和应用回调之间共享。
pub struct Connection {
    /// 接受连接时生成的唯一标识。
    id: ConnectionId,
    /// 对端的网络地址。
    peer_addr: SocketAddr,
    /// 连接被接受的时间 (UTC)。
    connected_at: DateTime<Utc>,
    /// 一旦为 `true` 就不会再变回 `false`。
    closed: AtomicBool,
    /// 写入端。关闭后为 `None`。
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// 通知读取任务退出。
    reader_shutdown: Notify,
    /// 关闭时置为 `true`，取消正在等待写锁或阻塞在写入上的 `send`。
    write_cancel: watch::Sender<bool>,
    lifecycle: Mutex<Lifecycle>,
    /// 所属服务器的共享状态，用于从注册表中移除自身并触发回调。
    owner: Weak<ServerShared>,
}

impl Connection {
    /// 包装一个刚被接受的 `TcpStream`。
    ///
    /// 返回连接本身以及读取端；读取端由调用方交给 `run_reader`。
    pub(crate) fn new(
        stream: TcpStream,
        peer_addr: SocketAddr,
        owner: Weak<ServerShared>,
    ) -> (Arc<Self>, OwnedReadHalf) {
        let (read_half, write_half) = stream.into_split();
        let connection = Arc::new(Self {
            id: Uuid::new_v4(),
            peer_addr,
            connected_at: Utc::now(),
            closed: AtomicBool::new(false),
            writer: tokio::sync::Mutex::new(Some(write_half)),
            reader_shutdown: Notify::new(),
            write_cancel: watch::Sender::new(false),
            lifecycle: Mutex::new(Lifecycle::default()),
            owner,
        });
        debug!("[连接] 已创建连接 id={}, addr={}", connection.id, peer_addr);
        (connection, read_half)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 向对端发送数据。
    ///
    /// 连接已关闭时直接忽略。写入失败时连接会被关闭 (原因由错误类型决定)，
    /// 错误本身不会返回给调用方，这样广播时一个坏掉的对端不会打断其他发送。
    pub async fn send(self: &Arc<Self>, data: &[u8]) {
        if self.is_closed() {
            debug!("[连接] 连接 {} 已关闭，忽略 {} 字节的发送请求", self.id, data.len());
            return;
        }

        // 先订阅再检查，close 在两者之间发出的取消信号也不会丢失
        let mut cancelled = self.write_cancel.subscribe();
        if *cancelled.borrow() {
            return;
        }

        // 写锁必须在调用 close 之前释放，close 还需要再次获取它。
        let result = {
            let mut guard = tokio::select! {
                biased;
                _ = cancelled.changed() => return,
                guard = self.writer.lock() => guard,
            };
            let Some(writer) = guard.as_mut() else {
                return;
            };
            // 对端不读取时 write_all 可能一直阻塞，关闭信号会中断它并释放写锁
            tokio::select! {
                biased;
                _ = cancelled.changed() => {
                    debug!("[连接] 连接 {} 已关闭，中断未完成的发送", self.id);
                    return;
                }
                result = writer.write_all(data) => result,
            }
        };

        if let Err(e) = result {
            let reason = CloseReason::from_io_error(&e);
            warn!("[连接] 向 {} ({}) 发送数据失败: {}，连接将以 '{}' 原因关闭", self.id, self.peer_addr, e, reason);
            self.close(reason).await;
        }
    }

    /// 关闭连接。重复调用是空操作。
    ///
    /// 第一次调用会关闭写入端、让读取任务退出、把连接从注册表中移除，
    /// 并且恰好触发一次 `on_close` 回调。
    pub async fn close(self: &Arc<Self>, reason: CloseReason) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("[连接] 连接 {} 已经关闭，忽略重复的关闭请求 (原因: {})", self.id, reason);
            return;
        }

        info!("[连接] 正在关闭连接 id={}, addr={}, 原因: {}", self.id, self.peer_addr, reason);
        self.reader_shutdown.notify_one();
        self.write_cancel.send_replace(true);
        self.shutdown_writer().await;

        match self.owner.upgrade() {
            Some(owner) => owner.connection_closed(self, reason).await,
            None => debug!("[连接] 连接 {} 所属的服务器已释放，跳过关闭通知", self.id),
        }
    }

    /// 关闭一个因容量不足而被拒绝的连接，不触发任何回调。
    pub(crate) async fn discard(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reader_shutdown.notify_one();
        self.write_cancel.send_replace(true);
        self.shutdown_writer().await;
        debug!("[连接] 已丢弃被拒绝的连接 id={}, addr={}", self.id, self.peer_addr);
    }

    /// 记录 `on_connect` 已经完成。
    ///
    /// 如果在 `on_connect` 执行期间连接已被关闭，返回当时的关闭原因，
    /// 调用方需要据此补发 `on_close`。
    pub(crate) fn mark_announced(&self) -> Option<CloseReason> {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        lifecycle.announced = true;
        lifecycle.pending_close.take()
    }

    /// 关闭路径调用：`on_connect` 已完成时返回 `true`，表示现在就应触发 `on_close`；
    /// 否则把原因暂存起来。
    pub(crate) fn should_notify_close(&self, reason: CloseReason) -> bool {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if lifecycle.announced {
            true
        } else {
            lifecycle.pending_close = Some(reason);
            false
        }
    }

    /// 读取任务：持续读取对端数据，直到连接被关闭。
    ///
    /// 读到 EOF 时以 `Remote` 关闭；读取出错时按错误类型关闭。
    pub(crate) async fn run_reader(self: Arc<Self>, mut reader: OwnedReadHalf, buffer_size: usize) {
        let mut buf = vec![0u8; buffer_size];
        debug!("[连接] 连接 {} 的读取任务已启动", self.id);

        while !self.is_closed() {
            tokio::select! {
                biased;

                _ = self.reader_shutdown.notified() => {
                    debug!("[连接] 连接 {} 的读取任务收到退出通知", self.id);
                    break;
                }

                result = reader.read(&mut buf) => match result {
                    Ok(0) => {
                        info!("[连接] 对端 {} ({}) 已关闭连接", self.id, self.peer_addr);
                        self.close(CloseReason::Remote).await;
                        break;
                    }
                    Ok(n) => {
                        debug!("[连接] 从 {} 收到 {} 字节", self.id, n);
                        if let Some(owner) = self.owner.upgrade() {
                            owner.callbacks.fire_data(&self, buf[..n].to_vec()).await;
                        }
                    }
                    Err(e) => {
                        let reason = CloseReason::from_io_error(&e);
                        warn!("[连接] 从 {} ({}) 读取数据失败: {}", self.id, self.peer_addr, e);
                        self.close(reason).await;
                        break;
                    }
                }
            }
        }
        debug!("[连接] 连接 {} 的读取任务已结束", self.id);
    }

    /// 取出并关闭写入端。调用前必须已发出 `write_cancel`，保证写锁很快被释放。
    async fn shutdown_writer(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!("[连接] 关闭 {} 的写入端时出错 (可忽略): {}", self.id, e);
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("connected_at", &self.connected_at)
            .field("closed", &self.is_closed())
            .finish()
    }
}
