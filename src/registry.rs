// rust_tcp_utils/src/registry.rs

//! 活动连接注册表。
//!
//! 所有成员变更 (接受循环的添加、连接关闭路径的移除) 以及广播前的快照
//! 都由同一把互斥锁串行化。锁内只做引用的增删，任何 I/O 都在释放锁之后、
//! 基于快照进行。

use crate::connection::{CloseReason, Connection, ConnectionId};
use futures_util::future::join_all;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct RegistryInner {
    members: HashMap<ConnectionId, Arc<Connection>>,
    /// `None` 表示不限制连接数量。
    max_capacity: Option<usize>,
    /// 批量关闭进行中。此时各连接自身关闭路径触发的 `remove` 会被直接跳过。
    mass_close_in_progress: bool,
}

/// 线程安全、有容量上限的活动连接集合。
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
}

impl ConnectionRegistry {
    /// 创建一个注册表，`max_capacity` 为 `None` 时不限制数量。
    pub fn new(max_capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                max_capacity,
                ..RegistryInner::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 尝试注册一个连接。
    ///
    /// 已达到容量上限或批量关闭正在进行时返回 `false`，此时调用方负责关闭该连接。
    /// 两种情况下被拒绝的客户端都只是被静默断开：不排队，不会收到任何提示消息，
    /// 也不会触发 `on_connect` 或 `on_close`。
    pub fn try_add(&self, connection: Arc<Connection>) -> bool {
        let mut inner = self.lock();
        if inner.mass_close_in_progress {
            debug!("[连接注册表] 批量关闭进行中，拒绝注册连接 {}", connection.id());
            return false;
        }
        if let Some(max) = inner.max_capacity {
            if inner.members.len() >= max {
                warn!(
                    "[连接注册表] 已达到最大客户端数量 {}，拒绝来自 {} 的连接",
                    max,
                    connection.peer_addr()
                );
                return false;
            }
        }
        let id = connection.id();
        inner.members.insert(id, connection);
        debug!("[连接注册表] 已注册连接 {}，当前连接数: {}", id, inner.members.len());
        true
    }

    /// 移除一个连接。连接不存在或批量关闭进行中时什么也不做。
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let mut inner = self.lock();
        if inner.mass_close_in_progress {
            return None;
        }
        let removed = inner.members.remove(id);
        match &removed {
            Some(_) => debug!("[连接注册表] 已移除连接 {}，当前连接数: {}", id, inner.members.len()),
            None => debug!("[连接注册表] 连接 {} 不在注册表中，忽略移除请求", id),
        }
        removed
    }

    /// 关闭并移除所有连接，返回被关闭的连接数量。
    ///
    /// 快照在持锁时取得，关闭在释放锁之后逐个进行；关闭期间各连接对 `remove`
    /// 的回调会被识别为多余并跳过，最后统一清空。
    pub async fn clear_all(&self) -> usize {
        let snapshot: Vec<Arc<Connection>> = {
            let mut inner = self.lock();
            if inner.mass_close_in_progress {
                debug!("[连接注册表] 批量关闭已在进行中，忽略本次请求");
                return 0;
            }
            inner.mass_close_in_progress = true;
            inner.members.values().cloned().collect()
        };

        info!("[连接注册表] 开始关闭全部 {} 个连接", snapshot.len());
        for connection in &snapshot {
            connection.close(CloseReason::Local).await;
        }

        let mut inner = self.lock();
        inner.members.clear();
        inner.mass_close_in_progress = false;
        info!("[连接注册表] 全部连接已关闭");
        snapshot.len()
    }

    /// 向所有已注册连接发送同一份数据。
    ///
    /// 发送基于快照并发进行，不保证各连接之间的先后顺序；
    /// 单个连接的失败只会关闭该连接，不影响其他连接。
    pub async fn broadcast(&self, data: &[u8]) {
        let snapshot = self.snapshot();
        debug!("[连接注册表] 向 {} 个连接广播 {} 字节", snapshot.len(), data.len());
        join_all(snapshot.iter().map(|connection| connection.send(data))).await;
    }

    /// 当前所有成员的快照。
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.lock().members.values().cloned().collect()
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.lock().members.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().members.is_empty()
    }

    pub fn max_capacity(&self) -> Option<usize> {
        self.lock().max_capacity
    }

    /// 修改容量上限。当前成员数已超过新上限时不做修改并返回 `false`。
    pub fn set_max_capacity(&self, max_capacity: Option<usize>) -> bool {
        let mut inner = self.lock();
        if let Some(max) = max_capacity {
            if inner.members.len() > max {
                return false;
            }
        }
        inner.max_capacity = max_capacity;
        true
    }
}
