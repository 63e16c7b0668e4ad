//! 文件存储
//!
//! `put_file` 是一条三段链路：流式上传 → `PutFile` 登记文件标签 → `GetFile`
//! 取回服务端补全后的标签。链路各段在工作池上推进，调用方只在一个
//! 带超时的等待句柄上等待最终结果。

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::action::{self, Action};
use crate::correlation::Correlator;
use crate::entity::{file_type_of, FileLabel};
use crate::error::{CubeError, Result};
use crate::executor::TaskExecutor;
use crate::promise::{Promise, Settle};
use crate::upload::{UploadListener, UploadReceipt, Uploader};

type ChainSender = Arc<Mutex<Option<oneshot::Sender<Result<FileLabel>>>>>;

/// 文件存储服务
pub struct FileStorage {
    correlator: Arc<Correlator>,
    uploader: Arc<Uploader>,
    executor: Arc<TaskExecutor>,
    chain_timeout: Duration,
}

impl FileStorage {
    pub fn new(
        correlator: Arc<Correlator>,
        uploader: Arc<Uploader>,
        executor: Arc<TaskExecutor>,
        chain_timeout: Duration,
    ) -> Self {
        Self {
            correlator,
            uploader,
            executor,
            chain_timeout,
        }
    }

    pub fn uploader(&self) -> &Arc<Uploader> {
        &self.uploader
    }

    /// 上传文件并登记，返回服务端的文件标签
    ///
    /// # 参数
    /// - `owner_id`: 文件所有者
    /// - `domain`: 所属域
    /// - `path`: 本地文件
    ///
    /// # 返回
    /// - 链路在超时内完成时返回 `GetFile` 得到的标签
    pub async fn put_file(&self, owner_id: u64, domain: &str, path: &Path) -> Result<FileLabel> {
        let started = Instant::now();
        let (tx, rx) = oneshot::channel::<Result<FileLabel>>();
        let sender: ChainSender = Arc::new(Mutex::new(Some(tx)));

        let uploader = self.uploader.clone();
        let upload_domain = domain.to_string();
        let upload_path = path.to_path_buf();

        let on_receipt = {
            let sender = sender.clone();
            let correlator = self.correlator.clone();
            let executor = self.executor.clone();
            let domain = domain.to_string();
            move |receipt: UploadReceipt| {
                let job = register_and_fetch(correlator, owner_id, domain, receipt);
                let queued = executor.execute(async move {
                    let result = job.await;
                    finish(&sender, result);
                });
                if let Err(e) = queued {
                    warn!("文件登记任务无法入队: {}", e);
                }
            }
        };
        let on_reject = {
            let sender = sender.clone();
            move |e: CubeError| finish(&sender, Err(e))
        };
        let on_thrown = {
            let sender = sender.clone();
            move |e: CubeError| finish(&sender, Err(e))
        };

        Promise::<UploadReceipt, CubeError>::new(self.executor.clone(), move |settle| async move {
            let listener = Arc::new(ChainListener {
                settle: Mutex::new(Some(settle)),
            });
            if let Err(e) = uploader
                .upload(owner_id, &upload_domain, &upload_path, listener.clone())
                .await
            {
                listener.reject(e);
            }
        })
        .then(on_receipt)
        .catch_reject(on_reject)
        .catch_exception(on_thrown)
        .launch()?;

        match tokio::time::timeout(self.chain_timeout, rx).await {
            Ok(Ok(result)) => {
                if let Ok(label) = &result {
                    info!("✅ 文件已登记: code={}, elapsed={:?}", label.file_code, started.elapsed());
                }
                result
            }
            Ok(Err(_)) => Err(CubeError::Other("文件链路在结束前被取消".to_string())),
            Err(_) => {
                warn!("⏱️ 文件链路超时: path={}", path.display());
                Err(CubeError::Timeout {
                    action: "PutFile".to_string(),
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    /// 查询文件标签
    pub async fn get_file(&self, domain: &str, file_code: &str) -> Result<FileLabel> {
        let response = self
            .correlator
            .call(Action::GetFile {
                domain: domain.to_string(),
                file_code: file_code.to_string(),
            })
            .await?;
        action::file_label_from("GetFile", &response)
    }
}

fn finish(sender: &ChainSender, result: Result<FileLabel>) {
    if let Some(tx) = sender.lock().take() {
        // 调用方已超时离开时接收端已丢弃
        let _ = tx.send(result);
    }
}

/// 由上传回执构造待登记的文件标签
fn label_from_receipt(owner_id: u64, domain: &str, receipt: &UploadReceipt) -> FileLabel {
    FileLabel {
        domain: domain.to_string(),
        file_code: receipt.channel_code.clone(),
        owner_id,
        file_name: receipt.file_name.clone(),
        file_size: receipt.file_size,
        last_modified: receipt.last_modified,
        completed_time: chrono::Utc::now().timestamp_millis(),
        expiry_time: 0,
        file_type: file_type_of(&receipt.file_name),
        md5_code: Some(receipt.md5_code.clone()),
        sha1_code: Some(receipt.sha1_code.clone()),
        file_url: None,
        file_secure_url: None,
    }
}

async fn register_and_fetch(
    correlator: Arc<Correlator>,
    owner_id: u64,
    domain: String,
    receipt: UploadReceipt,
) -> Result<FileLabel> {
    let label = label_from_receipt(owner_id, &domain, &receipt);
    let response = correlator.call(Action::PutFile { file_label: label }).await?;
    let registered = action::file_label_from("PutFile", &response)?;

    let response = correlator
        .call(Action::GetFile {
            domain,
            file_code: registered.file_code,
        })
        .await?;
    action::file_label_from("GetFile", &response)
}

/// 把上传结果转交给 Promise 的监听器
struct ChainListener {
    settle: Mutex<Option<Settle<UploadReceipt, CubeError>>>,
}

impl ChainListener {
    fn reject(&self, error: CubeError) {
        if let Some(settle) = self.settle.lock().take() {
            settle.reject(error);
        }
    }
}

impl UploadListener for ChainListener {
    fn on_uploading(&self, _channel_code: &str, _bytes_sent: u64) {}

    fn on_completed(&self, receipt: &UploadReceipt) {
        if let Some(settle) = self.settle.lock().take() {
            settle.resolve(receipt.clone());
        }
    }

    fn on_failed(&self, _channel_code: &str, error: &CubeError) {
        self.reject(error.clone());
    }
}
