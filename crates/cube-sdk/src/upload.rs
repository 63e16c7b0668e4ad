//! 文件流式上传
//!
//! 上传流程：
//! 1. 由 (所有者, 域, 文件名) 计算通道码，以通道码打开出站字节通道
//! 2. 在工作池上按固定分块读取文件，逐块写入通道并更新 MD5 / SHA1
//! 3. 每块写入后回调 `on_uploading(累计字节数)`
//! 4. 读到 EOF 后关闭通道，等待一个宽限期，再回调 `on_completed`
//!
//! 任何 IO 失败回调 `on_failed`，之后不会再有 `on_completed`。不做重试。

use bytes::Bytes;
use md5::Md5;
use parking_lot::RwLock;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};

use crate::error::{CubeError, Result};
use crate::executor::TaskExecutor;
use crate::transport::{DialectTransport, OutboundStream};

/// 上传结果回执
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub channel_code: String,
    pub file_name: String,
    pub file_size: u64,
    /// 文件最后修改时间（毫秒）
    pub last_modified: i64,
    pub md5_code: String,
    pub sha1_code: String,
}

/// 上传进度监听器
pub trait UploadListener: Send + Sync {
    /// 每块写入后调用，`bytes_sent` 为累计字节数
    fn on_uploading(&self, channel_code: &str, bytes_sent: u64);

    fn on_completed(&self, receipt: &UploadReceipt);

    fn on_failed(&self, channel_code: &str, error: &CubeError);
}

/// 上传会话（仅作记录，不影响上传流程）
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub channel_code: String,
    pub source: PathBuf,
    pub owner_id: u64,
    pub domain: String,
    pub bytes_sent: u64,
    pub file_size: u64,
}

type SessionMap = Arc<RwLock<HashMap<String, UploadSession>>>;

/// 通道码：`sha256("{owner_id}_{domain}_{file_name}")` 的十六进制串
///
/// 同一所有者在同一域上传同名文件得到相同的通道码。
pub fn channel_code(owner_id: u64, domain: &str, file_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}_{}_{}", owner_id, domain, file_name).as_bytes());
    hex::encode(hasher.finalize())
}

/// 上传器
pub struct Uploader {
    transport: Arc<dyn DialectTransport>,
    executor: Arc<TaskExecutor>,
    sessions: SessionMap,
    chunk_size: usize,
    grace: Duration,
}

impl Uploader {
    pub fn new(
        transport: Arc<dyn DialectTransport>,
        executor: Arc<TaskExecutor>,
        chunk_size: usize,
        grace: Duration,
    ) -> Self {
        Self {
            transport,
            executor,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            chunk_size: chunk_size.max(1),
            grace,
        }
    }

    /// 开始上传，返回通道码；数据传输在工作池上异步进行
    pub async fn upload(
        &self,
        owner_id: u64,
        domain: &str,
        path: &Path,
        listener: Arc<dyn UploadListener>,
    ) -> Result<String> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(CubeError::InvalidArgument(format!("不是普通文件: {}", path.display())));
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| CubeError::InvalidArgument(format!("无法获取文件名: {}", path.display())))?;
        let last_modified = metadata
            .modified()
            .ok()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp_millis())
            .unwrap_or_default();

        let code = channel_code(owner_id, domain, &file_name);
        let stream = self.transport.open_output_stream(&code).await?;

        {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&code) {
                // 同名文件的并发上传共用通道码
                warn!("通道码已有进行中的上传: {}", code);
            }
            sessions.insert(
                code.clone(),
                UploadSession {
                    channel_code: code.clone(),
                    source: path.to_path_buf(),
                    owner_id,
                    domain: domain.to_string(),
                    bytes_sent: 0,
                    file_size: metadata.len(),
                },
            );
        }
        info!("📤 开始上传: file={}, size={}, channel={}", file_name, metadata.len(), code);

        let job = StreamJob {
            channel_code: code.clone(),
            path: path.to_path_buf(),
            file_name,
            last_modified,
            chunk_size: self.chunk_size,
            grace: self.grace,
            sessions: self.sessions.clone(),
        };
        if let Err(e) = self.executor.execute(job.run(stream, listener)) {
            self.sessions.write().remove(&code);
            return Err(e);
        }
        Ok(code)
    }

    /// 当前进行中的上传
    pub fn active_uploads(&self) -> Vec<UploadSession> {
        self.sessions.read().values().cloned().collect()
    }
}

struct StreamJob {
    channel_code: String,
    path: PathBuf,
    file_name: String,
    last_modified: i64,
    chunk_size: usize,
    grace: Duration,
    sessions: SessionMap,
}

impl StreamJob {
    async fn run(self, mut stream: Box<dyn OutboundStream>, listener: Arc<dyn UploadListener>) {
        match self.stream_file(stream.as_mut(), listener.as_ref()).await {
            Ok(receipt) => {
                info!(
                    "✅ 上传完成: file={}, size={}, md5={}",
                    receipt.file_name, receipt.file_size, receipt.md5_code
                );
                self.sessions.write().remove(&self.channel_code);
                listener.on_completed(&receipt);
            }
            Err(e) => {
                error!("❌ 上传失败: file={}, channel={}, error={}", self.file_name, self.channel_code, e);
                if let Err(abort_err) = stream.abort().await {
                    warn!("放弃出站通道失败: channel={}, error={}", self.channel_code, abort_err);
                }
                self.sessions.write().remove(&self.channel_code);
                listener.on_failed(&self.channel_code, &e);
            }
        }
    }

    async fn stream_file(&self, stream: &mut dyn OutboundStream, listener: &dyn UploadListener) -> Result<UploadReceipt> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        let mut md5 = Md5::new();
        let mut sha1 = Sha1::new();
        let mut buffer = vec![0u8; self.chunk_size];
        let mut total: u64 = 0;

        loop {
            let filled = fill_chunk(&mut file, &mut buffer).await?;
            if filled == 0 {
                break;
            }
            let chunk = &buffer[..filled];
            stream.write(Bytes::copy_from_slice(chunk)).await?;
            md5.update(chunk);
            sha1.update(chunk);
            total += filled as u64;

            if let Some(session) = self.sessions.write().get_mut(&self.channel_code) {
                session.bytes_sent = total;
            }
            debug!("上传进度: channel={}, sent={}", self.channel_code, total);
            listener.on_uploading(&self.channel_code, total);

            if filled < buffer.len() {
                break;
            }
        }

        if total == 0 {
            listener.on_uploading(&self.channel_code, 0);
        }

        stream.close().await?;
        // 留给对端落盘的时间
        tokio::time::sleep(self.grace).await;

        Ok(UploadReceipt {
            channel_code: self.channel_code.clone(),
            file_name: self.file_name.clone(),
            file_size: total,
            last_modified: self.last_modified,
            md5_code: hex::encode(md5.finalize()),
            sha1_code: hex::encode(sha1.finalize()),
        })
    }
}

/// 尽量填满一块；只有到达 EOF 时返回的长度才会小于缓冲区
async fn fill_chunk(file: &mut tokio::fs::File, buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = file.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use parking_lot::Mutex;
    use std::io::Write;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct Recorder {
        progress: Mutex<Vec<u64>>,
        failed: Mutex<Option<String>>,
        completed: Mutex<u32>,
        done: Mutex<Option<oneshot::Sender<Option<UploadReceipt>>>>,
    }

    impl Recorder {
        fn new() -> (Arc<Self>, oneshot::Receiver<Option<UploadReceipt>>) {
            let (tx, rx) = oneshot::channel();
            let recorder = Arc::new(Recorder::default());
            *recorder.done.lock() = Some(tx);
            (recorder, rx)
        }
    }

    impl UploadListener for Recorder {
        fn on_uploading(&self, _channel_code: &str, bytes_sent: u64) {
            self.progress.lock().push(bytes_sent);
        }

        fn on_completed(&self, receipt: &UploadReceipt) {
            *self.completed.lock() += 1;
            if let Some(tx) = self.done.lock().take() {
                let _ = tx.send(Some(receipt.clone()));
            }
        }

        fn on_failed(&self, _channel_code: &str, error: &CubeError) {
            *self.failed.lock() = Some(error.to_string());
            if let Some(tx) = self.done.lock().take() {
                let _ = tx.send(None);
            }
        }
    }

    fn source_file(data: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn uploader(chunk_size: usize) -> (Arc<LoopbackTransport>, Uploader) {
        let transport = LoopbackTransport::new();
        transport.connect().await.unwrap();
        let uploader = Uploader::new(
            transport.clone(),
            TaskExecutor::new(2),
            chunk_size,
            Duration::from_millis(5),
        );
        (transport, uploader)
    }

    fn reference_digests(data: &[u8]) -> (String, String) {
        (hex::encode(Md5::digest(data)), hex::encode(Sha1::digest(data)))
    }

    #[test]
    fn test_channel_code_is_deterministic() {
        let a = channel_code(100, "shixincube.com", "a.txt");
        assert_eq!(a, channel_code(100, "shixincube.com", "a.txt"));
        assert_ne!(a, channel_code(101, "shixincube.com", "a.txt"));
        assert_ne!(a, channel_code(100, "shixincube.com", "b.txt"));
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_progress_for_300000_bytes() {
        let data = sample(300_000);
        let file = source_file(&data);
        let (transport, uploader) = uploader(128 * 1024).await;
        let (recorder, done) = Recorder::new();

        let code = uploader.upload(100, "shixincube.com", file.path(), recorder.clone()).await.unwrap();
        let receipt = done.await.unwrap().expect("upload should complete");

        assert_eq!(*recorder.progress.lock(), vec![131_072, 262_144, 300_000]);
        assert_eq!(*recorder.completed.lock(), 1);
        assert_eq!(receipt.file_size, 300_000);
        assert_eq!(receipt.channel_code, code);

        let capture = transport.stream(&code).unwrap();
        assert_eq!(capture.data, data);
        assert_eq!(capture.writes, vec![131_072, 131_072, 37_856]);
        assert!(capture.closed);
        assert!(uploader.active_uploads().is_empty());
    }

    #[tokio::test]
    async fn test_digests_match_reference() {
        for len in [0usize, 1024, 1024 + 300] {
            let data = sample(len);
            let file = source_file(&data);
            let (_transport, uploader) = uploader(1024).await;
            let (recorder, done) = Recorder::new();

            uploader.upload(7, "d", file.path(), recorder.clone()).await.unwrap();
            let receipt = done.await.unwrap().expect("upload should complete");

            let (md5, sha1) = reference_digests(&data);
            assert_eq!(receipt.md5_code, md5, "md5 mismatch for {} bytes", len);
            assert_eq!(receipt.sha1_code, sha1, "sha1 mismatch for {} bytes", len);

            let progress = recorder.progress.lock().clone();
            assert_eq!(progress.last().copied(), Some(len as u64));
            assert!(progress.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[tokio::test]
    async fn test_empty_file_reports_zero_once() {
        let file = source_file(&[]);
        let (_transport, uploader) = uploader(1024).await;
        let (recorder, done) = Recorder::new();

        uploader.upload(7, "d", file.path(), recorder.clone()).await.unwrap();
        let receipt = done.await.unwrap().expect("upload should complete");
        assert_eq!(*recorder.progress.lock(), vec![0]);
        assert_eq!(receipt.md5_code, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(receipt.sha1_code, "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[tokio::test]
    async fn test_write_failure_never_completes() {
        let data = sample(5000);
        let file = source_file(&data);
        let (transport, uploader) = uploader(1024).await;
        transport.fail_writes_after(2);
        let (recorder, done) = Recorder::new();

        let code = uploader.upload(7, "d", file.path(), recorder.clone()).await.unwrap();
        assert!(done.await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(*recorder.completed.lock(), 0);
        assert_eq!(*recorder.progress.lock(), vec![1024, 2048]);
        assert!(recorder.failed.lock().as_deref().unwrap().contains("IO error"));
        assert!(uploader.active_uploads().is_empty());

        // 对端收到放弃信号，而不是正常结束
        let capture = transport.stream(&code).unwrap();
        assert!(capture.aborted);
        assert!(!capture.closed);
        assert_eq!(capture.data.len(), 2048);
    }

    #[tokio::test]
    async fn test_missing_file_is_rejected_up_front() {
        let (transport, uploader) = uploader(1024).await;
        let (recorder, _done) = Recorder::new();
        let err = uploader
            .upload(7, "d", Path::new("/definitely/not/here.bin"), recorder)
            .await
            .unwrap_err();
        assert!(matches!(err, CubeError::IO(_)));
        assert_eq!(transport.sent_count(), 0);
    }
}
