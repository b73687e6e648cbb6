// rust_tcp_utils/src/client/transport.rs

//! 客户端 TCP 传输层。

use crate::error::TcpUtilError;
use log::{debug, error, info};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// 客户端单次读取的缓冲区大小
const CLIENT_READ_BUFFER_SIZE: usize = 4096;

/// `ClientConnection` 代表一个活动的客户端 TCP 连接。
#[derive(Debug)]
pub struct ClientConnection {
    stream: TcpStream,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

/// 异步连接到指定的 TCP 服务器。
pub async fn connect_client(addr: SocketAddr) -> Result<ClientConnection, TcpUtilError> {
    info!("客户端：开始尝试连接到 TCP 服务器: {}", addr);
    match TcpStream::connect(addr).await {
        Ok(stream) => {
            let local_addr = stream.local_addr()?;
            info!("客户端：已成功连接到 {} (本地地址: {})", addr, local_addr);
            Ok(ClientConnection {
                stream,
                local_addr,
                peer_addr: addr,
            })
        }
        Err(e) => {
            error!("客户端：连接到 {} 失败，错误: {}", addr, e);
            Err(TcpUtilError::Io(e))
        }
    }
}

impl ClientConnection {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// 发送全部数据。
    pub async fn send(&mut self, data: &[u8]) -> Result<(), TcpUtilError> {
        self.stream.write_all(data).await?;
        debug!("客户端：已向 {} 发送 {} 字节", self.peer_addr, data.len());
        Ok(())
    }

    /// 接收下一段数据。
    ///
    /// # Returns
    /// * `Some(Ok(bytes))`：收到了数据 (长度不定，不代表完整的消息)。
    /// * `Some(Err(e))`：读取出错。
    /// * `None`：服务器已关闭连接。
    pub async fn receive(&mut self) -> Option<Result<Vec<u8>, TcpUtilError>> {
        let mut buf = vec![0u8; CLIENT_READ_BUFFER_SIZE];
        match self.stream.read(&mut buf).await {
            Ok(0) => {
                debug!("客户端：服务器 {} 已关闭连接", self.peer_addr);
                None
            }
            Ok(n) => {
                buf.truncate(n);
                Some(Ok(buf))
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                debug!("客户端：连接被服务器 {} 重置", self.peer_addr);
                None
            }
            Err(e) => Some(Err(TcpUtilError::Io(e))),
        }
    }

    /// 精确接收 `len` 字节；连接在此之前关闭时返回 `TcpUtilError::ConnectionClosed`。
    pub async fn receive_exact(&mut self, len: usize) -> Result<Vec<u8>, TcpUtilError> {
        let mut buf = vec![0u8; len];
        match self.stream.read_exact(&mut buf).await {
            Ok(_) => Ok(buf),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(TcpUtilError::ConnectionClosed),
            Err(e) => Err(TcpUtilError::Io(e)),
        }
    }

    /// 正常关闭：发送 FIN 后释放连接。
    pub async fn close(mut self) -> Result<(), TcpUtilError> {
        self.stream.shutdown().await?;
        info!("客户端：已关闭到 {} 的连接", self.peer_addr);
        Ok(())
    }

    /// 以 RST 方式立即中断连接，模拟进程异常退出。
    pub fn abort(self) -> Result<(), TcpUtilError> {
        #[allow(deprecated)]
        self.stream.set_linger(Some(Duration::ZERO))?;
        info!("客户端：已中断到 {} 的连接 (RST)", self.peer_addr);
        Ok(())
    }
}
