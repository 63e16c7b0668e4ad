//! 异步组合原语
//!
//! 生产者作为工作池任务运行，拿到一次性的 [`Settle`] 句柄；句柄可以被移动到
//! 上传监听器等回调里，稍后再结算。结算时恰好触发 resolved / rejected / thrown
//! 中的一个后续回调，且总是作为新的工作池任务执行，不会在结算方的调用栈上内联运行。

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{CubeError, Result};
use crate::executor::TaskExecutor;

type Producer<R, J> = Box<dyn FnOnce(Settle<R, J>) -> BoxFuture<'static, ()> + Send>;

struct Continuations<R, J> {
    resolved: Option<Box<dyn FnOnce(R) + Send>>,
    rejected: Option<Box<dyn FnOnce(J) + Send>>,
    thrown: Option<Box<dyn FnOnce(CubeError) + Send>>,
}

enum Outcome<R, J> {
    Resolved(R),
    Rejected(J),
    Thrown(CubeError),
}

impl<R, J> Continuations<R, J>
where
    R: Send + 'static,
    J: Send + 'static,
{
    fn dispatch(self, executor: &TaskExecutor, outcome: Outcome<R, J>) {
        let queued = executor.execute(async move {
            match outcome {
                Outcome::Resolved(value) => match self.resolved {
                    Some(f) => f(value),
                    None => debug!("Promise 已解决，未设置 then 回调"),
                },
                Outcome::Rejected(value) => match self.rejected {
                    Some(f) => f(value),
                    None => debug!("Promise 被拒绝，未设置 catch_reject 回调"),
                },
                Outcome::Thrown(e) => match self.thrown {
                    Some(f) => f(e),
                    None => warn!("Promise 异常未处理: {}", e),
                },
            }
        });
        if let Err(e) = queued {
            warn!("Promise 后续回调无法入队: {}", e);
        }
    }
}

/// 一次性结算句柄
///
/// 三个结算方法都按值消费句柄；未结算就被丢弃时按异常处理。
pub struct Settle<R, J>
where
    R: Send + 'static,
    J: Send + 'static,
{
    executor: Arc<TaskExecutor>,
    continuations: Option<Continuations<R, J>>,
}

impl<R, J> Settle<R, J>
where
    R: Send + 'static,
    J: Send + 'static,
{
    pub fn resolve(mut self, value: R) {
        self.settle(Outcome::Resolved(value));
    }

    pub fn reject(mut self, value: J) {
        self.settle(Outcome::Rejected(value));
    }

    pub fn throw(mut self, error: CubeError) {
        self.settle(Outcome::Thrown(error));
    }

    fn settle(&mut self, outcome: Outcome<R, J>) {
        if let Some(continuations) = self.continuations.take() {
            continuations.dispatch(&self.executor, outcome);
        }
    }
}

impl<R, J> Drop for Settle<R, J>
where
    R: Send + 'static,
    J: Send + 'static,
{
    fn drop(&mut self) {
        if self.continuations.is_some() {
            warn!("Promise 未结算即被丢弃");
            self.settle(Outcome::Thrown(CubeError::Other("promise dropped without settling".to_string())));
        }
    }
}

/// 可组合的异步结果
pub struct Promise<R, J>
where
    R: Send + 'static,
    J: Send + 'static,
{
    executor: Arc<TaskExecutor>,
    producer: Producer<R, J>,
    continuations: Continuations<R, J>,
}

impl<R, J> Promise<R, J>
where
    R: Send + 'static,
    J: Send + 'static,
{
    pub fn new<F, Fut>(executor: Arc<TaskExecutor>, producer: F) -> Self
    where
        F: FnOnce(Settle<R, J>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            executor,
            producer: Box::new(move |settle| producer(settle).boxed()),
            continuations: Continuations {
                resolved: None,
                rejected: None,
                thrown: None,
            },
        }
    }

    pub fn then<F>(mut self, f: F) -> Self
    where
        F: FnOnce(R) + Send + 'static,
    {
        self.continuations.resolved = Some(Box::new(f));
        self
    }

    pub fn catch_reject<F>(mut self, f: F) -> Self
    where
        F: FnOnce(J) + Send + 'static,
    {
        self.continuations.rejected = Some(Box::new(f));
        self
    }

    pub fn catch_exception<F>(mut self, f: F) -> Self
    where
        F: FnOnce(CubeError) + Send + 'static,
    {
        self.continuations.thrown = Some(Box::new(f));
        self
    }

    /// 把生产者提交到工作池
    pub fn launch(self) -> Result<()> {
        let Promise {
            executor,
            producer,
            continuations,
        } = self;
        let settle = Settle {
            executor: executor.clone(),
            continuations: Some(continuations),
        };
        executor.execute(async move {
            producer(settle).await;
        })
    }
}
