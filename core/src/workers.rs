use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Bounded pool shared by every probe task of one scheduler invocation.
pub struct WorkerPool {
    sem: Arc<Semaphore>,
    size: usize,
}

impl Clone for WorkerPool {
    fn clone(&self) -> Self { WorkerPool { sem: self.sem.clone(), size: self.size } }
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        WorkerPool { sem: Arc::new(Semaphore::new(size)), size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `work` while holding one permit.
    pub async fn run<F: Future>(&self, work: F) -> F::Output {
        // never closed, so acquire only fails if that changes
        let _permit = self.sem.acquire().await.ok();
        work.await
    }
}
