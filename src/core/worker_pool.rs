//! 有界阻塞线程池
//!
//! 所有引擎调用（生成、加载、卸载）都是阻塞的 CPU/GPU 调用，统一经由这里
//! 转到 `spawn_blocking`。Semaphore 的大小就是全进程同时进行的引擎调用上限，
//! 管线请求和心跳反思共用同一个池。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::error::PoolError;

/// 阻塞调用线程池
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
    /// 排空开始后，排队中和新提交的任务都以 ShuttingDown 失败
    draining: CancellationToken,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            draining: CancellationToken::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// 当前空闲的许可数
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.is_cancelled()
    }

    /// 等待一个许可后在阻塞线程上执行 job
    pub async fn run<F, T>(&self, job: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.draining.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }

        let permit = tokio::select! {
            biased;
            _ = self.draining.cancelled() => return Err(PoolError::ShuttingDown),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| PoolError::ShuttingDown)?
            }
        };

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        });

        handle.await.map_err(|e| {
            if e.is_panic() {
                PoolError::Panicked(panic_message(e.into_panic()))
            } else {
                PoolError::ShuttingDown
            }
        })
    }

    /// 不占许可、不受排空限制地执行（仅用于排空之后释放引擎）
    pub async fn run_unbounded<F, T>(&self, job: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(job).await.map_err(|e| {
            if e.is_panic() {
                PoolError::Panicked(panic_message(e.into_panic()))
            } else {
                PoolError::ShuttingDown
            }
        })
    }

    /// 停止接收新任务并等待在途任务完成；超时返回 false
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.draining.cancel();
        let all = self.size as u32;
        let finished = match tokio::time::timeout(timeout, self.semaphore.acquire_many(all)).await {
            Ok(Ok(permits)) => {
                permits.forget();
                true
            }
            Ok(Err(_)) => true,
            Err(_) => {
                tracing::warn!(
                    "Worker pool drain timed out after {:?}, {} jobs still running",
                    timeout,
                    self.size - self.semaphore.available_permits()
                );
                false
            }
        };
        self.semaphore.close();
        finished
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(4)
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_run_returns_value() {
        let pool = WorkerPool::new(2);
        let v = pool.run(|| 21 * 2).await.unwrap();
        assert_eq!(v, 42);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_panic_is_caught() {
        let pool = WorkerPool::new(1);
        let err = pool.run(|| -> u32 { panic!("engine exploded") }).await.unwrap_err();
        assert_eq!(err, PoolError::Panicked("engine exploded".into()));
        // 许可已归还
        assert_eq!(pool.run(|| 1).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_is_bounded() {
        let pool = Arc::new(WorkerPool::new(2));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let current = current.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                pool.run(move || {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(30));
                    current.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_drain_rejects_new_jobs() {
        let pool = WorkerPool::new(2);
        assert!(pool.drain(Duration::from_secs(1)).await);
        assert!(pool.is_draining());
        assert_eq!(pool.run(|| 1).await, Err(PoolError::ShuttingDown));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drain_waits_for_in_flight_job() {
        let pool = Arc::new(WorkerPool::new(1));
        let done = Arc::new(AtomicUsize::new(0));

        let job_pool = pool.clone();
        let job_done = done.clone();
        let job = tokio::spawn(async move {
            job_pool
                .run(move || {
                    std::thread::sleep(Duration::from_millis(100));
                    job_done.store(1, Ordering::SeqCst);
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(pool.drain(Duration::from_secs(5)).await);
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(job.await.unwrap().is_ok());
    }
}
