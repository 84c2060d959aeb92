#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rabbitmq_bridge::rabbitmq::{Connector, MemoryBroker, RetryPolicy};

pub fn connector(memory: &MemoryBroker) -> Arc<dyn Connector> {
    Arc::new(memory.clone())
}

pub fn quick_retries(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        retry_delay: Duration::from_secs(1),
    }
}

/// Polls `condition`, letting other tasks and (paused) time move on.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
