//! 任务注册表
//!
//! 创建、查找、取消和回收都经过同一把读写锁；锁从不跨越 await。

use crate::task::{TaskHandle, TaskSnapshot};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

#[derive(Debug)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<Uuid, Arc<TaskHandle>>>,
    retention: Duration,
}

impl TaskRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn insert(&self, task: Arc<TaskHandle>) {
        let mut tasks = match self.tasks.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.insert(task.id(), task);
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<TaskHandle>> {
        let tasks = match self.tasks.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        match self.tasks.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 全部任务快照，按创建时间倒序
    pub fn history(&self) -> Vec<TaskSnapshot> {
        let handles: Vec<Arc<TaskHandle>> = match self.tasks.read() {
            Ok(guard) => guard.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        };
        let mut snapshots: Vec<TaskSnapshot> = handles.iter().map(|h| h.snapshot()).collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        snapshots
    }

    /// 移除结束时间早于 `now - retention` 的终止任务，返回移除数量
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::zero());
        let mut tasks = match self.tasks.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = tasks.len();
        tasks.retain(|_, task| match task.finished_at() {
            Some(finished) => finished + retention > now,
            None => true,
        });
        let evicted = before - tasks.len();
        if evicted > 0 {
            info!("回收 {} 个过期任务，剩余 {}", evicted, tasks.len());
        }
        evicted
    }
}
