//! 进程内协调存储（单节点部署与测试）

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CoordinationStore, StoreError};

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let data = self.data.lock().await;
        Ok(data.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut data = self.data.lock().await;
        data.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn create_if_absent(&self, key: &str, value: &[u8]) -> Result<bool, StoreError> {
        let mut data = self.data.lock().await;
        if data.contains_key(key) {
            return Ok(false);
        }
        data.insert(key.to_string(), value.to_vec());
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        let mut data = self.data.lock().await;
        match data.get(key) {
            Some(current) if current.as_slice() == expected => {
                data.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        new: &[u8],
    ) -> Result<bool, StoreError> {
        let mut data = self.data.lock().await;
        match data.get_mut(key) {
            Some(current) if current.as_slice() == expected => {
                *current = new.to_vec();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
