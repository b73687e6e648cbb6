// rust_tcp_utils/src/client/mod.rs

//! TCP 客户端模块。
//!
//! 提供连接到 TCP 服务器、收发原始字节以及关闭 (包括以 RST 方式中断) 连接的简单封装。
//! 库本身不做任何消息分帧，消息边界由应用自行约定。

pub mod transport;
