//! Named serialization lanes: operations that mutate the same named
//! resource (a version head, a map under rewrite) run one at a time,
//! independent lanes run freely.

use futures::lock::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct Lanes {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl Lanes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `task` holding the lane for `key`.
    pub async fn serialized<T>(&self, key: &str, task: impl Future<Output = T>) -> T {
        let lane = {
            let mut lanes = self.inner.lock().await;
            lanes.entry(key.to_string()).or_default().clone()
        };
        let _guard = lane.lock().await;
        task.await
    }
}
