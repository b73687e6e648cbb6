// rust_tcp_utils/tests/tcp_server_integration_test.rs

use log::{LevelFilter, info};
use rust_tcp_utils::client::transport::{ClientConnection, connect_client};
use rust_tcp_utils::{CloseReason, ConnectionId, ServerConfig, TcpServer, TcpUtilError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

/// 服务端回调观察到的生命周期事件
#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Connected(ConnectionId),
    Data(ConnectionId, Vec<u8>),
    Closed(ConnectionId, CloseReason),
}

// 辅助函数：初始化日志，仅用于测试，避免多次初始化
fn init_test_logger() {
    let _ = env_logger::builder().filter_level(LevelFilter::Debug).is_test(true).try_init();
}

fn local_config(max_clients: Option<usize>) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        ..ServerConfig::new(0, max_clients)
    }
}

/// 启动一个监听本地随机端口的服务器，所有回调事件都转发到返回的通道中。
async fn start_server(
    max_clients: Option<usize>,
) -> (Arc<TcpServer>, SocketAddr, mpsc::UnboundedReceiver<Event>) {
    init_test_logger();
    let server = Arc::new(TcpServer::new());
    let (tx, rx) = mpsc::unbounded_channel();
    install_event_callbacks(&server, tx);
    let addr = server
        .listen_with(local_config(max_clients))
        .await
        .expect("服务器监听失败");
    info!("[Test Main] 服务器已在 {} 上监听", addr);
    (server, addr, rx)
}

fn install_event_callbacks(server: &TcpServer, tx: mpsc::UnboundedSender<Event>) {
    let connect_tx = tx.clone();
    server.set_on_connect(move |conn| {
        let tx = connect_tx.clone();
        async move {
            let _ = tx.send(Event::Connected(conn.id()));
        }
    });
    let data_tx = tx.clone();
    server.set_on_data(move |conn, data| {
        let tx = data_tx.clone();
        async move {
            let _ = tx.send(Event::Data(conn.id(), data));
        }
    });
    server.set_on_close(move |conn, reason| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(Event::Closed(conn.id(), reason));
        }
    });
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("等待服务端事件超时")
        .expect("事件通道已关闭")
}

async fn expect_connected(rx: &mut mpsc::UnboundedReceiver<Event>) -> ConnectionId {
    match next_event(rx).await {
        Event::Connected(id) => id,
        other => panic!("期望 Connected 事件，实际收到 {:?}", other),
    }
}

/// 等待一小段时间后，断言通道中没有更多事件。
async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Event>) {
    sleep(Duration::from_millis(300)).await;
    if let Ok(event) = rx.try_recv() {
        panic!("不应再有事件，实际收到 {:?}", event);
    }
}

async fn connect(addr: SocketAddr) -> ClientConnection {
    connect_client(addr).await.expect("客户端连接失败")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_capacity_limit_rejects_third_client() {
    let (server, addr, mut rx) = start_server(Some(2)).await;

    let (a, b, c) = tokio::join!(connect(addr), connect(addr), connect(addr));
    let mut clients = vec![a, b, c];

    expect_connected(&mut rx).await;
    expect_connected(&mut rx).await;
    assert_quiet(&mut rx).await;
    assert_eq!(server.client_count(), 2);

    // 恰好一个客户端被服务器关闭，其余两个仍保持连接
    let mut rejected = 0;
    for client in clients.iter_mut() {
        if let Ok(None) = timeout(Duration::from_millis(500), client.receive()).await {
            rejected += 1;
        }
    }
    assert_eq!(rejected, 1);
    assert_eq!(server.client_count(), 2);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slot_is_reusable_after_client_leaves() {
    let (server, addr, mut rx) = start_server(Some(1)).await;

    let first = connect(addr).await;
    let first_id = expect_connected(&mut rx).await;
    first.close().await.unwrap();
    assert_eq!(next_event(&mut rx).await, Event::Closed(first_id, CloseReason::Remote));

    let _second = connect(addr).await;
    expect_connected(&mut rx).await;
    assert_eq!(server.client_count(), 1);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_close_fires_on_close_once() {
    let (server, addr, mut rx) = start_server(None).await;

    let client = connect(addr).await;
    let id = expect_connected(&mut rx).await;
    assert_eq!(server.client_count(), 1);

    client.close().await.unwrap();
    assert_eq!(next_event(&mut rx).await, Event::Closed(id, CloseReason::Remote));
    assert_quiet(&mut rx).await;
    assert_eq!(server.client_count(), 0);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_reset_is_detected() {
    let (server, addr, mut rx) = start_server(None).await;

    let client = connect(addr).await;
    let id = expect_connected(&mut rx).await;
    let conn = server.connection(&id).expect("连接应已注册");
    assert_eq!(server.client_count(), 1);

    client.abort().unwrap();
    assert_eq!(next_event(&mut rx).await, Event::Closed(id, CloseReason::Remote));
    assert_eq!(server.client_count(), 0);

    // 关闭后的发送被静默忽略，不会再次触发 on_close
    conn.send(b"after reset").await;
    assert!(conn.is_closed());
    assert_quiet(&mut rx).await;

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_double_close_is_idempotent() {
    let (server, addr, mut rx) = start_server(None).await;

    let mut client = connect(addr).await;
    let id = expect_connected(&mut rx).await;
    let conn = server.connection(&id).unwrap();

    conn.close(CloseReason::Local).await;
    conn.close(CloseReason::Local).await;

    assert_eq!(next_event(&mut rx).await, Event::Closed(id, CloseReason::Local));
    assert_quiet(&mut rx).await;
    assert!(conn.is_closed());
    assert_eq!(server.client_count(), 0);
    assert!(timeout(Duration::from_secs(5), client.receive()).await.unwrap().is_none());

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_close_notifies_once() {
    let (server, addr, mut rx) = start_server(None).await;

    let _client = connect(addr).await;
    let id = expect_connected(&mut rx).await;
    let conn = server.connection(&id).unwrap();

    let reasons = [CloseReason::Local, CloseReason::Error, CloseReason::Remote];
    let handles: Vec<_> = (0..12)
        .map(|i| {
            let conn = Arc::clone(&conn);
            let reason = reasons[i % reasons.len()];
            tokio::spawn(async move { conn.close(reason).await })
        })
        .collect();
    // 与服务端的批量关闭同时竞争
    tokio::join!(await_all(handles), server.close_all_clients());

    match next_event(&mut rx).await {
        Event::Closed(closed_id, _) => assert_eq!(closed_id, id),
        other => panic!("期望 Closed 事件，实际收到 {:?}", other),
    }
    assert_quiet(&mut rx).await;
    assert_eq!(server.client_count(), 0);

    server.shutdown().await;
}

async fn await_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_connect_after_shutdown() {
    let (server, addr, mut rx) = start_server(None).await;

    // 持续发起连接，直到测试结束
    let connector = tokio::spawn(async move {
        let mut clients = Vec::new();
        loop {
            if let Ok(client) = connect_client(addr).await {
                clients.push(client);
            }
            sleep(Duration::from_millis(5)).await;
        }
    });

    expect_connected(&mut rx).await;
    server.shutdown().await;
    assert!(!server.is_listening().await);
    assert_eq!(server.client_count(), 0);

    // shutdown 返回前产生的事件全部取出
    while rx.try_recv().is_ok() {}

    sleep(Duration::from_millis(300)).await;
    while let Ok(event) = rx.try_recv() {
        assert!(!matches!(event, Event::Connected(_)), "shutdown 之后出现了新的连接: {:?}", event);
    }
    assert_eq!(server.client_count(), 0);

    connector.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_broadcast_skips_broken_connection() {
    let (server, addr, mut rx) = start_server(None).await;

    let mut clients = Vec::new();
    let mut ids = Vec::new();
    for _ in 0..4 {
        clients.push(connect(addr).await);
        ids.push(expect_connected(&mut rx).await);
    }

    // 第二个连接在广播前已由服务端关闭
    let broken = server.connection(&ids[1]).unwrap();
    broken.close(CloseReason::Local).await;
    assert_eq!(next_event(&mut rx).await, Event::Closed(ids[1], CloseReason::Local));

    let payload = b"broadcast payload";
    server.broadcast(payload).await;

    for (index, client) in clients.iter_mut().enumerate() {
        if index == 1 {
            continue;
        }
        let received = timeout(Duration::from_secs(5), client.receive_exact(payload.len()))
            .await
            .expect("等待广播数据超时")
            .expect("接收广播数据失败");
        assert_eq!(received, payload);
    }
    assert_eq!(server.client_count(), 3);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_on_data_receives_client_bytes() {
    init_test_logger();
    let server = Arc::new(TcpServer::new());
    // 回显服务器
    server.set_on_data(|conn, data| async move {
        conn.send(&data).await;
    });
    let addr = server.listen_with(local_config(None)).await.unwrap();

    let mut client = connect(addr).await;
    client.send(b"echo me").await.unwrap();
    let echoed = timeout(Duration::from_secs(5), client.receive_exact(7))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, b"echo me");

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_data_events_follow_connect() {
    let (server, addr, mut rx) = start_server(None).await;

    let mut client = connect(addr).await;
    let id = expect_connected(&mut rx).await;
    client.send(b"abc").await.unwrap();

    let mut collected = Vec::new();
    while collected.len() < 3 {
        match next_event(&mut rx).await {
            Event::Data(data_id, data) => {
                assert_eq!(data_id, id);
                collected.extend(data);
            }
            other => panic!("期望 Data 事件，实际收到 {:?}", other),
        }
    }
    assert_eq!(collected, b"abc");

    server.shutdown().await;
    assert_eq!(next_event(&mut rx).await, Event::Closed(id, CloseReason::Local));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_during_on_connect_is_reported_after_it() {
    init_test_logger();
    let server = Arc::new(TcpServer::new());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let connect_tx = tx.clone();
    server.set_on_connect(move |conn| {
        let tx = connect_tx.clone();
        async move {
            conn.close(CloseReason::Local).await;
            sleep(Duration::from_millis(50)).await;
            let _ = tx.send(Event::Connected(conn.id()));
        }
    });
    server.set_on_close(move |conn, reason| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(Event::Closed(conn.id(), reason));
        }
    });
    let addr = server.listen_with(local_config(None)).await.unwrap();

    let _client = connect(addr).await;
    let id = expect_connected(&mut rx).await;
    assert_eq!(next_event(&mut rx).await, Event::Closed(id, CloseReason::Local));
    assert_quiet(&mut rx).await;
    assert_eq!(server.client_count(), 0);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_callback_does_not_stop_accept_loop() {
    init_test_logger();
    let server = Arc::new(TcpServer::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let counter = Arc::clone(&calls);
    server.set_on_connect(move |conn| {
        let tx = tx.clone();
        let call = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if call == 0 {
                panic!("on_connect 回调中的测试 panic");
            }
            let _ = tx.send(Event::Connected(conn.id()));
        }
    });
    let addr = server.listen_with(local_config(None)).await.unwrap();

    let _first = connect(addr).await;
    let _second = connect(addr).await;
    expect_connected(&mut rx).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(server.is_listening().await);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_listen_twice_and_port_in_use() {
    let (server, addr, _rx) = start_server(None).await;

    let second_call = server.listen_with(local_config(None)).await;
    assert!(matches!(second_call, Err(TcpUtilError::AlreadyListening)));
    assert_eq!(server.local_addr().await, Some(addr));

    let other = TcpServer::new();
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        ..ServerConfig::new(addr.port(), Some(3))
    };
    assert!(matches!(other.listen_with(config).await, Err(TcpUtilError::Bind { .. })));
    assert!(!other.is_listening().await);
    // 绑定失败的 listen 不改变容量上限
    assert_eq!(other.max_clients(), None);

    // 之前生效的上限同样保持不变
    let limited = TcpServer::new();
    limited.listen_with(local_config(Some(5))).await.unwrap();
    limited.close().await;
    let busy = ServerConfig {
        host: "127.0.0.1".to_string(),
        ..ServerConfig::new(addr.port(), Some(1))
    };
    assert!(matches!(limited.listen_with(busy).await, Err(TcpUtilError::Bind { .. })));
    assert_eq!(limited.max_clients(), Some(5));

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_interrupts_send_to_unread_client() {
    let (server, addr, mut rx) = start_server(None).await;

    // 客户端始终不读取，服务器的发送最终阻塞在缓冲区已满的套接字上
    let mut client = connect(addr).await;
    let id = expect_connected(&mut rx).await;
    let conn = server.connection(&id).expect("连接应已注册");
    let sender = tokio::spawn(async move {
        conn.send(&vec![0u8; 64 * 1024 * 1024]).await;
    });
    sleep(Duration::from_millis(200)).await;
    assert!(!sender.is_finished(), "发送应阻塞在未读取的客户端上");

    timeout(Duration::from_secs(1), server.shutdown())
        .await
        .expect("shutdown 不应被阻塞的发送拖住");
    timeout(Duration::from_secs(1), sender)
        .await
        .expect("阻塞的发送应在关闭后返回")
        .unwrap();
    assert_eq!(next_event(&mut rx).await, Event::Closed(id, CloseReason::Local));

    // 读完已缓冲的数据后，客户端看到连接关闭 (EOF 或重置)
    let saw_close = timeout(Duration::from_secs(5), async {
        loop {
            match client.receive().await {
                Some(Ok(_)) => continue,
                None | Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(saw_close.is_ok(), "客户端未在超时前看到连接关闭");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_keeps_clients_and_allows_relisten() {
    let (server, addr, mut rx) = start_server(None).await;

    let mut client = connect(addr).await;
    let id = expect_connected(&mut rx).await;

    server.close().await;
    assert!(!server.is_listening().await);
    assert_eq!(server.client_count(), 1);

    // 停止监听后已有连接仍可收发
    server.broadcast(b"still here").await;
    assert_eq!(client.receive_exact(10).await.unwrap(), b"still here");

    let new_addr = server.listen_with(local_config(None)).await.unwrap();
    let _late = connect(new_addr).await;
    let late_id = expect_connected(&mut rx).await;
    assert_ne!(late_id, id);
    assert_eq!(server.client_count(), 2);

    assert_eq!(server.close_all_clients().await, 2);
    assert_eq!(server.client_count(), 0);
    assert!(server.is_listening().await);

    server.shutdown().await;
}
