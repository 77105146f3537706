//! Shared accelerator contexts.
//!
//! An accelerator (a GPU, say) runs one batch at a time. Every stage and
//! every concurrent conversion that targets the same device name shares one
//! context, and access is granted first-come first-served at the batch
//! dispatch boundary. Tokio's [`Semaphore`] is fair, so a single-permit
//! semaphore gives exactly that FIFO serialization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::Semaphore;
use tracing::debug;

/// Registry of named device contexts.
#[derive(Debug, Default)]
pub struct AcceleratorPool {
    devices: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl AcceleratorPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide pool used unless a converter is given its own.
    pub fn global() -> Arc<AcceleratorPool> {
        static GLOBAL: OnceLock<Arc<AcceleratorPool>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(AcceleratorPool::new())))
    }

    /// The context for `device`, created on first use.
    pub fn context(&self, device: &str) -> Arc<Semaphore> {
        let mut devices = match self.devices.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(devices.entry(device.to_string()).or_insert_with(|| {
            debug!("Creating accelerator context '{}'", device);
            Arc::new(Semaphore::new(1))
        }))
    }

    /// Number of contexts created so far.
    pub fn len(&self) -> usize {
        self.devices.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn same_name_shares_context() {
        let pool = AcceleratorPool::new();
        let a = pool.context("cuda");
        let b = pool.context("cuda");
        let c = pool.context("cuda:1");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn global_pool_is_shared() {
        assert!(Arc::ptr_eq(&AcceleratorPool::global(), &AcceleratorPool::global()));
    }

    #[tokio::test]
    async fn context_serializes_in_arrival_order() {
        let pool = AcceleratorPool::new();
        let ctx = pool.context("cuda");
        let order = Arc::new(Mutex::new(Vec::new()));

        let held = Arc::clone(&ctx).acquire_owned().await.unwrap();
        let mut tasks = Vec::new();
        for i in 0..3 {
            let ctx = Arc::clone(&ctx);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _permit = ctx.acquire_owned().await.unwrap();
                order.lock().unwrap().push(i);
            }));
            // Let each waiter enqueue before the next one.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(held);
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
