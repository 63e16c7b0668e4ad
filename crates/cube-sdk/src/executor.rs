//! 后台工作池
//!
//! 固定数量的工作协程从同一个任务队列里取任务执行。上传流、Promise 的生产者
//! 与后续回调都以任务形式提交到这里，并发度受工作协程数量约束。

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::error::{CubeError, Result};

type Job = BoxFuture<'static, ()>;

/// 有界工作池
pub struct TaskExecutor {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker_count: usize,
    queued: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
}

impl TaskExecutor {
    /// 创建工作池并启动工作协程（需在 tokio 运行时内调用）
    pub fn new(worker_count: usize) -> Arc<Self> {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let queued = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));

        info!("启动工作池: {} 个工作协程", worker_count);
        for worker_id in 0..worker_count {
            Self::spawn_worker(worker_id, receiver.clone(), queued.clone(), active.clone());
        }

        Arc::new(Self {
            sender: Mutex::new(Some(sender)),
            worker_count,
            queued,
            active,
        })
    }

    fn spawn_worker(
        worker_id: usize,
        receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
        queued: Arc<AtomicUsize>,
        active: Arc<AtomicUsize>,
    ) {
        tokio::spawn(async move {
            debug!("工作协程 {} 已启动", worker_id);
            loop {
                // 只在取任务时持锁，执行期间其他工作协程可以继续取
                let job = receiver.lock().await.recv().await;
                let Some(job) = job else { break };

                queued.fetch_sub(1, Ordering::Relaxed);
                active.fetch_add(1, Ordering::Relaxed);
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    error!("❌ 工作协程 {} 执行的任务发生 panic", worker_id);
                }
                active.fetch_sub(1, Ordering::Relaxed);
            }
            debug!("工作协程 {} 已退出", worker_id);
        });
    }

    /// 提交任务（不等待结果）
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.sender.lock();
        let sender = guard
            .as_ref()
            .ok_or_else(|| CubeError::QueueClosed("工作池已关闭".to_string()))?;
        self.queued.fetch_add(1, Ordering::Relaxed);
        sender.send(task.boxed()).map_err(|_| {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            CubeError::QueueClosed("工作池已关闭".to_string())
        })
    }

    /// 提交任务并返回结果接收端
    pub fn submit<F, T>(&self, task: F) -> Result<oneshot::Receiver<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.execute(async move {
            let _ = tx.send(task.await);
        })?;
        Ok(rx)
    }

    /// 关闭任务队列；已排队的任务仍会执行完
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_some() {
            info!("工作池已关闭，剩余排队任务: {}", self.queued_jobs());
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn queued_jobs(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}
