//! # 文档本地回退存储
//!
//! 对应页面自身的 localStorage：只在当前文档内可见，没有跨上下文通知。
//! 值以 JSON 字符串形式保存，键名带 `chatgptPinner_` 前缀，
//! 避免与宿主页面自己的数据冲突。

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{Map, Value};
use tokio::sync::broadcast;

use super::{BackendKind, StorageBackend, StorageChange, StorageFuture};

/// 本地存储键名前缀
pub const KEY_PREFIX: &str = "chatgptPinner_";

/// 文档本地存储
#[derive(Default)]
pub struct LocalStore {
    items: Mutex<HashMap<String, String>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn prefixed(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }
}

impl StorageBackend for LocalStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn is_alive(&self) -> bool {
        true
    }

    fn get<'a>(&'a self, keys: &'a [&'a str]) -> StorageFuture<'a, Map<String, Value>> {
        Box::pin(async move {
            let items = self
                .items
                .lock()
                .map_err(|e| format!("本地存储锁已损坏: {}", e))?;

            let mut result = Map::new();
            for key in keys {
                let Some(raw) = items.get(&Self::prefixed(key)) else {
                    continue;
                };
                match serde_json::from_str(raw) {
                    Ok(value) => {
                        result.insert(key.to_string(), value);
                    }
                    Err(e) => log::warn!("本地存储中 {} 的值无法解析，已忽略: {}", key, e),
                }
            }
            Ok(result)
        })
    }

    fn set<'a>(&'a self, items: Map<String, Value>) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let mut encoded = Vec::with_capacity(items.len());
            for (key, value) in &items {
                let raw = serde_json::to_string(value)
                    .map_err(|e| format!("序列化本地存储值失败: {}", e))?;
                encoded.push((Self::prefixed(key), raw));
            }

            let mut store = self
                .items
                .lock()
                .map_err(|e| format!("本地存储锁已损坏: {}", e))?;
            store.extend(encoded);
            Ok(())
        })
    }

    fn clear(&self) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            let mut store = self
                .items
                .lock()
                .map_err(|e| format!("本地存储锁已损坏: {}", e))?;
            store.retain(|key, _| !key.starts_with(KEY_PREFIX));
            Ok(())
        })
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<StorageChange>> {
        None
    }
}
