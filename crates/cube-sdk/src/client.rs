//! Cube 客户端上下文
//!
//! 显式构造、显式传递的客户端对象，把传输层、关联调用、入站分发、
//! 事件订阅、上传与后台工作池组装在一起。没有全局单例。

use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::action::{self, Action, EventScope, MarkReadData};
use crate::config::CubeConfig;
use crate::correlation::{Correlator, PendingTable};
use crate::dispatcher::{DispatchStats, InboundDispatcher};
use crate::entity::{Contact, Device, FileLabel, Message};
use crate::error::Result;
use crate::executor::TaskExecutor;
use crate::file_storage::FileStorage;
use crate::history::{HistoryScope, MessageHistory, RemoteMessageSource, WindowSource};
use crate::logging;
use crate::subscription::{ContactEventListener, EventClass, EventSubscriptions, MessageListener};
use crate::transport::DialectTransport;
use crate::upload::{UploadListener, UploadSession, Uploader};
use crate::version;

/// Cube 客户端
pub struct CubeClient {
    config: CubeConfig,
    transport: Arc<dyn DialectTransport>,
    correlator: Arc<Correlator>,
    subscriptions: Arc<EventSubscriptions>,
    dispatcher: Arc<InboundDispatcher>,
    executor: Arc<TaskExecutor>,
    files: FileStorage,
}

impl CubeClient {
    /// 创建客户端并向传输层注册入站分发器（需在 tokio 运行时内调用）
    ///
    /// `debug_mode` 打开时安装 debug 级别的 tracing subscriber；宿主已安装时保持不变。
    pub fn new(config: CubeConfig, transport: Arc<dyn DialectTransport>) -> Self {
        if config.debug_mode {
            logging::init_tracing(true);
        }

        let pending = Arc::new(PendingTable::new());
        let subscriptions = Arc::new(EventSubscriptions::new());
        let dispatcher = Arc::new(InboundDispatcher::new(pending.clone(), subscriptions.clone()));
        transport.set_listener(dispatcher.clone());

        let correlator = Arc::new(Correlator::new(
            transport.clone(),
            pending,
            config.correlation_timeout(),
        ));
        let executor = TaskExecutor::new(config.worker_count);
        let uploader = Arc::new(Uploader::new(
            transport.clone(),
            executor.clone(),
            config.upload_chunk_size,
            config.upload_grace(),
        ));
        let files = FileStorage::new(
            correlator.clone(),
            uploader,
            executor.clone(),
            config.file_chain_timeout(),
        );

        info!(
            "Cube 客户端已创建: {}, endpoint={}, timeout={:?}, workers={}",
            version::build_info(),
            config.endpoint,
            config.correlation_timeout(),
            config.worker_count
        );

        Self {
            config,
            transport,
            correlator,
            subscriptions,
            dispatcher,
            executor,
            files,
        }
    }

    pub fn config(&self) -> &CubeConfig {
        &self.config
    }

    /// 连接服务端点
    pub async fn connect(&self) -> Result<()> {
        info!("正在连接 {} ...", self.config.endpoint);
        self.transport.connect().await?;
        info!("✅ 已连接 {}", self.config.endpoint);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    // ========== 联系人 ==========

    /// 获取联系人
    pub async fn get_contact(&self, domain: &str, contact_id: u64) -> Result<Contact> {
        let response = self
            .correlator
            .call(Action::GetContact {
                domain: domain.to_string(),
                contact_id,
            })
            .await?;
        action::contact_from("GetContact", &response)
    }

    /// 创建联系人
    pub async fn create_contact(&self, domain: &str, id: u64, name: &str, context: Option<Value>) -> Result<Contact> {
        let response = self
            .correlator
            .call(Action::CreateContact {
                domain: domain.to_string(),
                id,
                name: name.to_string(),
                context,
            })
            .await?;
        action::contact_from("CreateContact", &response)
    }

    // ========== 消息 ==========

    /// 推送消息，服务端返回非 OK 状态时报 `Remote`
    ///
    /// # 参数
    /// - `message`: 待推送的消息
    /// - `pretender`: 以该联系人身份发送
    /// - `device`: 发送设备
    pub async fn push_message(&self, message: Message, pretender: Contact, device: Device) -> Result<()> {
        debug!("推送消息: id={}, from={}, to={}", message.id, message.from, message.to);
        let response = self
            .correlator
            .call(Action::PushMessage {
                message,
                pretender,
                device,
            })
            .await?;
        action::push_state_from(&response)
    }

    /// 查询 `[beginning, ending)` 内的消息
    pub async fn query_messages(
        &self,
        domain: &str,
        scope: HistoryScope,
        beginning: i64,
        ending: i64,
    ) -> Result<Vec<Message>> {
        RemoteMessageSource::new(self.correlator.clone(), domain, scope)
            .query_window(beginning, ending)
            .await
    }

    /// 标记已读，返回服务端更新后的消息
    pub async fn mark_read_messages(&self, domain: &str, data: MarkReadData) -> Result<Vec<Message>> {
        let response = self
            .correlator
            .call(Action::MarkReadMessages {
                domain: domain.to_string(),
                data,
            })
            .await?;
        action::read_messages_from(&response)
    }

    /// 从 `beginning` 遍历到当前时间的历史消息，窗口步长取配置值
    pub async fn message_history(
        &self,
        domain: &str,
        scope: HistoryScope,
        beginning: i64,
    ) -> Result<MessageHistory<RemoteMessageSource>> {
        let source = RemoteMessageSource::new(self.correlator.clone(), domain, scope);
        MessageHistory::open(source, beginning, self.config.history_step_ms).await
    }

    // ========== 文件 ==========

    /// 仅上传文件数据，返回通道码
    pub async fn upload(
        &self,
        owner_id: u64,
        domain: &str,
        path: &Path,
        listener: Arc<dyn UploadListener>,
    ) -> Result<String> {
        self.files.uploader().upload(owner_id, domain, path, listener).await
    }

    /// 上传并登记文件
    pub async fn put_file(&self, owner_id: u64, domain: &str, path: &Path) -> Result<FileLabel> {
        self.files.put_file(owner_id, domain, path).await
    }

    pub async fn get_file(&self, domain: &str, file_code: &str) -> Result<FileLabel> {
        self.files.get_file(domain, file_code).await
    }

    // ========== 事件订阅 ==========

    /// 登记消息监听器
    ///
    /// 同一 `(实体, 域)` 上的接收与发送监听器共用一次服务端登记，
    /// 只有该键尚未登记时才发送 `AddEventListener`；替换只在本地生效。
    /// 发送失败时撤销登记标记，本地监听器保留，下一次登记会重新发送。
    ///
    /// # 参数
    /// - `class`: `MessageReceived` 或 `MessageSent`，`Contact` 返回 `InvalidArgument`
    pub async fn add_message_listener(
        &self,
        class: EventClass,
        scope: EventScope,
        listener: Arc<dyn MessageListener>,
    ) -> Result<()> {
        let (id, domain) = (scope.entity_id(), scope.domain().to_string());
        let registration = self.subscriptions.add_message_listener(class, id, &domain, listener)?;
        if !registration.needs_remote {
            return Ok(());
        }
        let sent = self
            .correlator
            .notify(Action::AddEventListener {
                id,
                event: class.remote_event().to_string(),
                param: Some(scope),
            })
            .await;
        if let Err(e) = sent {
            self.subscriptions.release_remote(class, id, &domain);
            return Err(e);
        }
        Ok(())
    }

    /// 移除消息监听器；该键不再有任何消息监听器时发送 `RemoveEventListener`
    pub async fn remove_message_listener(&self, class: EventClass, scope: EventScope) -> Result<bool> {
        let (id, domain) = (scope.entity_id(), scope.domain().to_string());
        let removal = self.subscriptions.remove_message_listener(class, id, &domain)?;
        if removal.release_remote {
            self.correlator
                .notify(Action::RemoveEventListener {
                    id,
                    event: class.remote_event().to_string(),
                    param: Some(scope),
                })
                .await?;
        }
        Ok(removal.removed)
    }

    /// 登记联系人事件监听器（签入、签出、设备超时）
    pub async fn add_contact_listener(
        &self,
        domain: &str,
        contact_id: u64,
        listener: Arc<dyn ContactEventListener>,
    ) -> Result<()> {
        if !self
            .subscriptions
            .add_contact_listener(contact_id, domain, listener)
            .needs_remote
        {
            return Ok(());
        }
        let sent = self
            .correlator
            .notify(Action::AddEventListener {
                id: contact_id,
                event: EventClass::Contact.remote_event().to_string(),
                param: Some(EventScope::Contact {
                    domain: domain.to_string(),
                    contact_id,
                }),
            })
            .await;
        if let Err(e) = sent {
            self.subscriptions.release_remote(EventClass::Contact, contact_id, domain);
            return Err(e);
        }
        Ok(())
    }

    pub async fn remove_contact_listener(&self, domain: &str, contact_id: u64) -> Result<bool> {
        let removal = self.subscriptions.remove_contact_listener(contact_id, domain);
        if removal.release_remote {
            self.correlator
                .notify(Action::RemoveEventListener {
                    id: contact_id,
                    event: EventClass::Contact.remote_event().to_string(),
                    param: Some(EventScope::Contact {
                        domain: domain.to_string(),
                        contact_id,
                    }),
                })
                .await?;
        }
        Ok(removal.removed)
    }

    // ========== 状态 ==========

    /// 尚未收到响应的关联请求数量
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending().len()
    }

    /// 进行中的上传
    pub fn active_uploads(&self) -> Vec<UploadSession> {
        self.files.uploader().active_uploads()
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// 关闭后台工作池；已排队的任务仍会执行完
    pub fn shutdown(&self) {
        if self.executor.is_shutdown() {
            warn!("Cube 客户端已关闭");
            return;
        }
        self.executor.shutdown();
        info!("Cube 客户端已关闭, 剩余待决请求: {}", self.pending_requests());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CubeError;
    use crate::transport::{reply_to, LoopbackTransport};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tokio_test::assert_ok;

    const DOMAIN: &str = "shixincube.com";
    const HOUR: i64 = 60 * 60 * 1000;

    async fn client(config: CubeConfig) -> (Arc<LoopbackTransport>, CubeClient) {
        let transport = LoopbackTransport::new();
        let client = CubeClient::new(config, transport.clone());
        client.connect().await.unwrap();
        (transport, client)
    }

    fn message(id: u64, from: u64, to: u64) -> Message {
        Message {
            id,
            domain: DOMAIN.to_string(),
            from,
            to,
            source: 0,
            lts: 0,
            rts: 0,
            state: 0,
            payload: json!({ "text": "hello" }),
        }
    }

    #[tokio::test]
    async fn test_get_contact_scenario() {
        let (transport, client) = client(CubeConfig::default()).await;
        transport.set_responder(Duration::from_millis(10), |request| {
            let id = request.param("contactId").cloned().unwrap_or_default();
            Some(reply_to(
                request,
                json!({ "contact": { "id": id, "domain": DOMAIN, "name": "Cube" } }),
            ))
        });

        let contact = assert_ok!(client.get_contact(DOMAIN, 50001001).await);
        assert_eq!(contact.id, 50001001);
        assert_eq!(contact.name, "Cube");
        assert_eq!(client.pending_requests(), 0);
        assert_eq!(client.dispatch_stats().responses_delivered, 1);
    }

    #[tokio::test]
    async fn test_debug_mode_client_is_usable() {
        let config = CubeConfig::builder().debug_mode(true).build();
        let (transport, client) = client(config).await;
        assert!(client.config().debug_mode);
        assert!(client.is_connected());
        tracing::debug!("debug mode client created");
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnected_calls_fail_fast() {
        let transport = LoopbackTransport::new();
        let client = CubeClient::new(CubeConfig::default(), transport.clone());

        let started = Instant::now();
        let err = client.get_contact(DOMAIN, 1).await.unwrap_err();
        assert!(err.is_not_connected());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(transport.sent_count(), 0);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_push_message_state() {
        let (transport, client) = client(CubeConfig::default()).await;
        transport.set_responder(Duration::ZERO, |request| {
            let state = if request.param("message").map(|m| m["id"] == 1).unwrap_or(false) { 0 } else { 12 };
            Some(reply_to(request, json!({ "result": { "state": state } })))
        });

        let pretender = Contact::new(10, DOMAIN, "ten");
        assert_ok!(
            client
                .push_message(message(1, 10, 20), pretender.clone(), Device::current())
                .await
        );
        let err = client
            .push_message(message(2, 10, 20), pretender, Device::new("phone", "iOS"))
            .await
            .unwrap_err();
        assert_eq!(err.remote_code(), Some(12));
    }

    #[tokio::test]
    async fn test_mark_read_and_malformed_response() {
        let (transport, client) = client(CubeConfig::default()).await;
        transport.set_responder(Duration::ZERO, |request| match request.name.as_str() {
            "MarkReadMessages" => Some(reply_to(
                request,
                json!({ "result": { "messages": [ { "id": 5, "domain": DOMAIN, "from": 1, "to": 2, "state": 20 } ] } }),
            )),
            _ => Some(reply_to(request, json!({}))),
        });

        let data = MarkReadData { to: 2, from: 1, list: vec![5] };
        let messages = assert_ok!(client.mark_read_messages(DOMAIN, data).await);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].state, 20);

        let err = client.create_contact(DOMAIN, 3, "three", None).await.unwrap_err();
        assert!(matches!(err, CubeError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn test_message_history_walks_to_final_window() {
        let (transport, client) = client(CubeConfig::builder().history_step(Duration::from_secs(12 * 3600)).build()).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        transport.set_responder(Duration::ZERO, move |request| {
            // 只有最后一个窗口有数据
            let list = if counter.fetch_add(1, Ordering::SeqCst) == 2 {
                json!([ { "id": 77, "domain": DOMAIN, "from": 1, "to": 2 } ])
            } else {
                json!([])
            };
            Some(reply_to(request, json!({ "result": { "list": list } })))
        });

        // 留出一秒余量，保证 terminal 落在第三个窗口内
        let beginning = chrono::Utc::now().timestamp_millis() - 36 * HOUR + 1_000;
        let mut history = assert_ok!(client.message_history(DOMAIN, HistoryScope::Group(9), beginning).await);
        assert!(assert_ok!(history.has_next().await));
        assert_eq!(assert_ok!(history.next().await).map(|m| m.id), Some(77));
        assert!(!assert_ok!(history.has_next().await));
        assert_eq!(history.queries(), 3);

        let sent = transport.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].param("groupId"), Some(&json!(9)));
        assert!(sent[0].param("contactId").is_none());
    }

    #[tokio::test]
    async fn test_listener_registration_is_deduplicated() {
        let (transport, client) = client(CubeConfig::default()).await;
        let scope = EventScope::Contact {
            domain: DOMAIN.to_string(),
            contact_id: 20,
        };

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        assert_ok!(
            client
                .add_message_listener(
                    EventClass::MessageReceived,
                    scope.clone(),
                    Arc::new(move |m: &Message| sink.lock().push(m.id)),
                )
                .await
        );
        assert_ok!(
            client
                .add_message_listener(EventClass::MessageReceived, scope.clone(), Arc::new(|_: &Message| {}))
                .await
        );
        assert_ok!(
            client
                .add_message_listener(EventClass::MessageSent, scope.clone(), Arc::new(|_: &Message| {}))
                .await
        );
        let names: Vec<String> = transport.sent().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["AddEventListener"]);
        assert_eq!(transport.sent()[0].param("param"), Some(&json!({ "domain": DOMAIN, "contactId": 20 })));

        assert!(assert_ok!(client.remove_message_listener(EventClass::MessageReceived, scope.clone()).await));
        assert_eq!(transport.sent_count(), 1);
        assert!(assert_ok!(client.remove_message_listener(EventClass::MessageSent, scope.clone()).await));
        assert!(!assert_ok!(client.remove_message_listener(EventClass::MessageSent, scope).await));

        let names: Vec<String> = transport.sent().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["AddEventListener", "RemoveEventListener"]);
        assert!(received.lock().is_empty());
    }

    #[tokio::test]
    async fn test_pushed_message_reaches_listener() {
        let (transport, client) = client(CubeConfig::default()).await;
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        assert_ok!(
            client
                .add_message_listener(
                    EventClass::MessageReceived,
                    EventScope::Contact { domain: DOMAIN.to_string(), contact_id: 20 },
                    Arc::new(move |m: &Message| {
                        if let Some(tx) = tx.lock().take() {
                            let _ = tx.send(m.id);
                        }
                    }),
                )
                .await
        );

        let push = crate::dialect::ActionDialect::new("Notify")
            .with_param("event", json!("Message"))
            .with_param("message", serde_json::to_value(message(42, 10, 20)).unwrap());
        transport.deliver(push).unwrap();

        let id = tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
        assert_eq!(id, 42);
    }

    #[tokio::test]
    async fn test_contact_listener_registration() {
        struct Quiet;
        impl ContactEventListener for Quiet {}

        let (transport, client) = client(CubeConfig::default()).await;
        assert_ok!(client.add_contact_listener(DOMAIN, 5, Arc::new(Quiet)).await);
        assert_ok!(client.add_contact_listener(DOMAIN, 5, Arc::new(Quiet)).await);
        assert!(assert_ok!(client.remove_contact_listener(DOMAIN, 5).await));

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].param("event"), Some(&json!("Contact")));
        assert_eq!(sent[1].name, "RemoveEventListener");
    }

    #[tokio::test]
    async fn test_failed_listener_registration_is_resent() {
        let transport = LoopbackTransport::new();
        let client = CubeClient::new(CubeConfig::default(), transport.clone());
        let scope = EventScope::Contact {
            domain: DOMAIN.to_string(),
            contact_id: 20,
        };

        let err = client
            .add_message_listener(EventClass::MessageReceived, scope.clone(), Arc::new(|_: &Message| {}))
            .await
            .unwrap_err();
        assert!(err.is_not_connected());
        assert_eq!(transport.sent_count(), 0);

        client.connect().await.unwrap();
        assert_ok!(
            client
                .add_message_listener(EventClass::MessageSent, scope.clone(), Arc::new(|_: &Message| {}))
                .await
        );
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].name, "AddEventListener");
        assert_eq!(sent[0].param("event"), Some(&json!("Message")));

        // 登记成功后不再重复发送
        assert_ok!(
            client
                .add_message_listener(EventClass::MessageReceived, scope, Arc::new(|_: &Message| {}))
                .await
        );
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_contact_registration_is_resent() {
        struct Quiet;
        impl ContactEventListener for Quiet {}

        let transport = LoopbackTransport::new();
        let client = CubeClient::new(CubeConfig::default(), transport.clone());
        assert!(client.add_contact_listener(DOMAIN, 5, Arc::new(Quiet)).await.is_err());

        client.connect().await.unwrap();
        assert_ok!(client.add_contact_listener(DOMAIN, 5, Arc::new(Quiet)).await);
        let names: Vec<String> = transport.sent().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["AddEventListener"]);
    }

    #[tokio::test]
    async fn test_contact_class_rejected_for_message_listener() {
        let (transport, client) = client(CubeConfig::default()).await;
        let scope = EventScope::Contact {
            domain: DOMAIN.to_string(),
            contact_id: 5,
        };

        let err = client
            .add_message_listener(EventClass::Contact, scope.clone(), Arc::new(|_: &Message| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, CubeError::InvalidArgument(_)));
        let err = client.remove_message_listener(EventClass::Contact, scope).await.unwrap_err();
        assert!(matches!(err, CubeError::InvalidArgument(_)));
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_uploads() {
        let (_transport, client) = client(CubeConfig::default()).await;
        client.shutdown();

        struct Silent;
        impl UploadListener for Silent {
            fn on_uploading(&self, _: &str, _: u64) {}
            fn on_completed(&self, _: &crate::upload::UploadReceipt) {}
            fn on_failed(&self, _: &str, _: &CubeError) {}
        }

        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"abc").unwrap();
        let err = client.upload(1, DOMAIN, file.path(), Arc::new(Silent)).await.unwrap_err();
        assert!(matches!(err, CubeError::QueueClosed(_)));
        assert!(client.active_uploads().is_empty());
    }
}
