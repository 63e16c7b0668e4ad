//! 进程内回环传输
//!
//! 出站方言经编解码器往返一次后交给可替换的应答器，应答经单一分发任务
//! 按序投递给监听器；出站字节通道的数据被完整记录，便于校验。
//! 用于测试以及嵌入式场景下的本地服务桩。

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{DialectTransport, InboundListener, OutboundStream};
use crate::dialect::{self, ActionDialect, NOTIFIER_KEY};
use crate::error::{CubeError, Result};

/// 应答器：根据请求生成可选的响应
pub type Responder = Arc<dyn Fn(&ActionDialect) -> Option<ActionDialect> + Send + Sync>;

/// 单个出站字节通道的记录
#[derive(Debug, Clone, Default)]
pub struct StreamCapture {
    pub data: Vec<u8>,
    /// 每次写入的字节数
    pub writes: Vec<usize>,
    pub closed: bool,
    pub aborted: bool,
}

type StreamMap = Arc<Mutex<HashMap<String, StreamCapture>>>;

/// 进程内回环传输
pub struct LoopbackTransport {
    connected: AtomicBool,
    listener: Arc<RwLock<Option<Arc<dyn InboundListener>>>>,
    inbound_tx: mpsc::UnboundedSender<ActionDialect>,
    responder: RwLock<Option<(Responder, Duration)>>,
    sent: Mutex<Vec<ActionDialect>>,
    streams: StreamMap,
    /// 每个通道成功写入多少次后注入写失败
    fail_writes_after: Mutex<Option<usize>>,
}

impl LoopbackTransport {
    /// 创建回环传输并启动分发任务（需在 tokio 运行时内调用）
    pub fn new() -> Arc<Self> {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<ActionDialect>();
        let listener: Arc<RwLock<Option<Arc<dyn InboundListener>>>> = Arc::new(RwLock::new(None));

        let dispatch_listener = listener.clone();
        tokio::spawn(async move {
            while let Some(dialect) = inbound_rx.recv().await {
                let current = dispatch_listener.read().clone();
                match current {
                    Some(listener) => listener.on_dialect(dialect),
                    None => warn!("回环传输无监听器，丢弃入站方言: {}", dialect.name),
                }
            }
            debug!("回环传输分发任务退出");
        });

        Arc::new(Self {
            connected: AtomicBool::new(false),
            listener,
            inbound_tx,
            responder: RwLock::new(None),
            sent: Mutex::new(Vec::new()),
            streams: Arc::new(Mutex::new(HashMap::new())),
            fail_writes_after: Mutex::new(None),
        })
    }

    /// 设置应答器与应答延迟
    pub fn set_responder<F>(&self, delay: Duration, responder: F)
    where
        F: Fn(&ActionDialect) -> Option<ActionDialect> + Send + Sync + 'static,
    {
        *self.responder.write() = Some((Arc::new(responder), delay));
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// 注入写失败：每个通道成功写入 `writes` 次之后的写入都会失败
    pub fn fail_writes_after(&self, writes: usize) {
        *self.fail_writes_after.lock() = Some(writes);
    }

    /// 模拟服务端推送
    pub fn deliver(&self, dialect: ActionDialect) -> Result<()> {
        let bytes = dialect::encode(&dialect)?;
        let decoded = dialect::decode(&bytes)?;
        self.inbound_tx
            .send(decoded)
            .map_err(|_| CubeError::Transport("回环分发任务已退出".to_string()))
    }

    /// 已发送的全部方言
    pub fn sent(&self) -> Vec<ActionDialect> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// 指定名称的出站通道记录
    pub fn stream(&self, name: &str) -> Option<StreamCapture> {
        self.streams.lock().get(name).cloned()
    }
}

/// 构造对请求的响应：沿用请求动作名并原样回传关联对象
pub fn reply_to(request: &ActionDialect, params: Value) -> ActionDialect {
    let mut reply = ActionDialect::new(request.name.clone());
    if let Value::Object(map) = params {
        reply.params = map;
    }
    if let Some(notifier) = request.param(NOTIFIER_KEY) {
        reply.params.insert(NOTIFIER_KEY.to_string(), notifier.clone());
    }
    reply
}

#[async_trait]
impl DialectTransport for LoopbackTransport {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, dialect: ActionDialect) -> Result<()> {
        if !self.is_connected() {
            return Err(CubeError::NotConnected);
        }

        // 走一遍线上编解码
        let bytes = dialect::encode(&dialect)?;
        let request = dialect::decode(&bytes)?;
        self.sent.lock().push(request.clone());

        let responder = self.responder.read().clone();
        if let Some((responder, delay)) = responder {
            if let Some(reply) = responder(&request) {
                let bytes = dialect::encode(&reply)?;
                let reply = dialect::decode(&bytes)?;
                let tx = self.inbound_tx.clone();
                if delay.is_zero() {
                    let _ = tx.send(reply);
                } else {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(reply);
                    });
                }
            }
        }
        Ok(())
    }

    async fn open_output_stream(&self, name: &str) -> Result<Box<dyn OutboundStream>> {
        if !self.is_connected() {
            return Err(CubeError::NotConnected);
        }
        self.streams
            .lock()
            .insert(name.to_string(), StreamCapture::default());
        Ok(Box::new(LoopbackStream {
            name: name.to_string(),
            streams: self.streams.clone(),
            fail_after: *self.fail_writes_after.lock(),
            writes: 0,
        }))
    }

    fn set_listener(&self, listener: Arc<dyn InboundListener>) {
        *self.listener.write() = Some(listener);
    }
}

struct LoopbackStream {
    name: String,
    streams: StreamMap,
    fail_after: Option<usize>,
    writes: usize,
}

#[async_trait]
impl OutboundStream for LoopbackStream {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        if matches!(self.fail_after, Some(limit) if self.writes >= limit) {
            return Err(CubeError::IO(format!("通道 {} 写入失败（注入）", self.name)));
        }
        self.writes += 1;
        let mut streams = self.streams.lock();
        let capture = streams.entry(self.name.clone()).or_default();
        if capture.closed || capture.aborted {
            return Err(CubeError::IO(format!("通道 {} 已关闭", self.name)));
        }
        capture.writes.push(chunk.len());
        capture.data.extend_from_slice(&chunk);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut streams = self.streams.lock();
        if let Some(capture) = streams.get_mut(&self.name) {
            capture.closed = true;
        }
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        let mut streams = self.streams.lock();
        if let Some(capture) = streams.get_mut(&self.name) {
            capture.aborted = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct Collector {
        count: AtomicUsize,
        last: Mutex<Option<ActionDialect>>,
    }

    impl InboundListener for Collector {
        fn on_dialect(&self, dialect: ActionDialect) {
            self.count.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some(dialect);
        }
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let transport = LoopbackTransport::new();
        let err = transport.send(ActionDialect::new("Ping")).await.unwrap_err();
        assert!(err.is_not_connected());
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_responder_echoes_notifier() {
        let transport = LoopbackTransport::new();
        let collector = Arc::new(Collector {
            count: AtomicUsize::new(0),
            last: Mutex::new(None),
        });
        transport.set_listener(collector.clone());
        transport.connect().await.unwrap();
        transport.set_responder(Duration::from_millis(5), |request| {
            Some(reply_to(request, json!({ "ok": true })))
        });

        let mut request = ActionDialect::new("GetContact");
        request.set_notifier(11);
        transport.send(request).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(collector.count.load(Ordering::SeqCst), 1);
        let reply = collector.last.lock().clone().unwrap();
        assert_eq!(reply.notifier_id(), Some(11));
        assert_eq!(reply.param("ok"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_stream_capture_and_failure_injection() {
        let transport = LoopbackTransport::new();
        transport.connect().await.unwrap();
        transport.fail_writes_after(1);

        let mut stream = transport.open_output_stream("code").await.unwrap();
        stream.write(Bytes::from_static(b"abc")).await.unwrap();
        assert!(stream.write(Bytes::from_static(b"def")).await.is_err());
        stream.close().await.unwrap();

        let capture = transport.stream("code").unwrap();
        assert_eq!(capture.data, b"abc");
        assert_eq!(capture.writes, vec![3]);
        assert!(capture.closed);
        assert!(!capture.aborted);
    }

    #[tokio::test]
    async fn test_aborted_stream_rejects_writes() {
        let transport = LoopbackTransport::new();
        transport.connect().await.unwrap();

        let mut stream = transport.open_output_stream("partial").await.unwrap();
        stream.write(Bytes::from_static(b"abc")).await.unwrap();
        stream.abort().await.unwrap();
        assert!(stream.write(Bytes::from_static(b"def")).await.is_err());

        let capture = transport.stream("partial").unwrap();
        assert!(capture.aborted);
        assert!(!capture.closed);
        assert_eq!(capture.data, b"abc");
    }
}
