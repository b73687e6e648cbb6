// rust_tcp_utils/src/server/callbacks.rs

//! 应用注册的生命周期回调。
//!
//! 回调可以在 `listen` 之前或之后随时设置或替换，对之后发生的事件生效。
//! 每次调用都被单独隔离：回调中的 panic 只会被记录，不会终止接受循环或关闭流程。

use crate::connection::{CloseReason, Connection};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use log::error;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

/// 新连接注册成功后调用。
pub type ConnectCallback = Arc<dyn Fn(Arc<Connection>) -> BoxFuture<'static, ()> + Send + Sync>;
/// 连接关闭后调用，每个连接至多一次。
pub type CloseCallback =
    Arc<dyn Fn(Arc<Connection>, CloseReason) -> BoxFuture<'static, ()> + Send + Sync>;
/// 从连接读取到数据时调用。
pub type DataCallback = Arc<dyn Fn(Arc<Connection>, Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
pub(crate) struct Callbacks {
    on_connect: RwLock<Option<ConnectCallback>>,
    on_close: RwLock<Option<CloseCallback>>,
    on_data: RwLock<Option<DataCallback>>,
}

impl Callbacks {
    pub(crate) fn set_on_connect(&self, callback: ConnectCallback) {
        *self.on_connect.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub(crate) fn set_on_close(&self, callback: CloseCallback) {
        *self.on_close.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub(crate) fn set_on_data(&self, callback: DataCallback) {
        *self.on_data.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub(crate) async fn fire_connect(&self, connection: &Arc<Connection>) {
        // 先克隆出回调再调用，避免在回调执行期间持有读锁
        let callback = self.on_connect.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(callback) = callback {
            let connection = Arc::clone(connection);
            run_isolated("on_connect", &connection.id().to_string(), || callback(connection)).await;
        }
    }

    pub(crate) async fn fire_close(&self, connection: &Arc<Connection>, reason: CloseReason) {
        let callback = self.on_close.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(callback) = callback {
            let connection = Arc::clone(connection);
            run_isolated("on_close", &connection.id().to_string(), || callback(connection, reason)).await;
        }
    }

    pub(crate) async fn fire_data(&self, connection: &Arc<Connection>, data: Vec<u8>) {
        let callback = self.on_data.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(callback) = callback {
            let connection = Arc::clone(connection);
            run_isolated("on_data", &connection.id().to_string(), || callback(connection, data)).await;
        }
    }
}

/// 调用回调并等待其完成，捕获创建 future 时和轮询 future 时的 panic。
async fn run_isolated<F>(name: &str, connection_id: &str, make_future: F)
where
    F: FnOnce() -> BoxFuture<'static, ()>,
{
    let future = match catch_unwind(AssertUnwindSafe(make_future)) {
        Ok(future) => future,
        Err(_) => {
            error!("[回调] 连接 {} 的 {} 回调发生 panic，已忽略", connection_id, name);
            return;
        }
    };
    if AssertUnwindSafe(future).catch_unwind().await.is_err() {
        error!("[回调] 连接 {} 的 {} 回调发生 panic，已忽略", connection_id, name);
    }
}
