//! 任务记录与进度事件
//!
//! `TaskHandle` 是任务的唯一可变记录。所有修改都在同一把锁内完成并立即广播，
//! 因此订阅者看到的日志顺序与写入顺序一致。

use crate::request::JobKind;
use crate::result::TaskResult;
use crate::state_machine::{TaskEvent, TaskState, TaskStateMachine};
use chrono::{DateTime, Utc};
use futures::Stream;
use pacs_core::{LogLevel, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// 任务日志行
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// 任务快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub kind: JobKind,
    pub state: TaskState,
    pub progress: u8,
    pub current_step: String,
    pub logs: Vec<LogEntry>,
    pub result: Option<TaskResult>, // 仅 completed 时存在
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// 推送给订阅者的进度事件
///
/// `logs` 只包含上一个事件之后新增的日志；订阅后的第一个事件包含全部日志。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub task_id: Uuid,
    pub seq: u64,
    pub status: TaskState,
    pub progress: u8,
    pub current_step: String,
    pub logs: Vec<LogEntry>,
}

#[derive(Debug)]
struct TaskInner {
    kind: JobKind,
    state: TaskState,
    progress: u8,
    current_step: String,
    logs: Vec<LogEntry>,
    published: usize, // 已广播的日志条数
    seq: u64,
    result: Option<TaskResult>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

/// 单个任务
#[derive(Debug)]
pub struct TaskHandle {
    id: Uuid,
    inner: Mutex<TaskInner>,
    events: broadcast::Sender<ProgressEvent>,
    cancel: CancellationToken,
    machine: Arc<TaskStateMachine>,
}

impl TaskHandle {
    pub fn new(kind: JobKind, machine: Arc<TaskStateMachine>) -> Arc<Self> {
        Self::with_capacity(kind, machine, EVENT_CAPACITY)
    }

    /// `capacity` 为每个订阅者可缓存的事件数
    fn with_capacity(kind: JobKind, machine: Arc<TaskStateMachine>, capacity: usize) -> Arc<Self> {
        let (events, _) = broadcast::channel(capacity);
        Arc::new(Self {
            id: Uuid::new_v4(),
            inner: Mutex::new(TaskInner {
                kind,
                state: TaskState::Pending,
                progress: 0,
                current_step: String::new(),
                logs: Vec::new(),
                published: 0,
                seq: 0,
                result: None,
                created_at: Utc::now(),
                finished_at: None,
            }),
            events,
            cancel: CancellationToken::new(),
            machine,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, TaskInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn event(&self, inner: &TaskInner, logs: Vec<LogEntry>) -> ProgressEvent {
        ProgressEvent {
            task_id: self.id,
            seq: inner.seq,
            status: inner.state,
            progress: inner.progress,
            current_step: inner.current_step.clone(),
            logs,
        }
    }

    fn publish(&self, inner: &mut TaskInner) {
        inner.seq += 1;
        let logs = inner.logs[inner.published..].to_vec();
        inner.published = inner.logs.len();
        let event = self.event(inner, logs);
        // 没有订阅者时发送失败，可以忽略
        let _ = self.events.send(event);
    }

    fn mirror(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!(task_id = %self.id, "{}", message),
            LogLevel::Info | LogLevel::Success => info!(task_id = %self.id, "{}", message),
            LogLevel::Warning => warn!(task_id = %self.id, "{}", message),
            LogLevel::Error => error!(task_id = %self.id, "{}", message),
        }
    }

    /// 追加一条日志
    pub fn log(&self, level: LogLevel, message: &str) {
        self.mirror(level, message);
        let mut inner = self.lock();
        inner.logs.push(LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.to_string(),
        });
        self.publish(&mut inner);
    }

    /// 更新当前步骤
    pub fn set_step(&self, step: &str) {
        let mut inner = self.lock();
        if inner.state.is_terminal() || inner.current_step == step {
            return;
        }
        inner.current_step = step.to_string();
        self.publish(&mut inner);
    }

    /// 更新进度，只增不减且不超过 100
    pub fn set_progress(&self, percent: f64) {
        let value = if percent.is_finite() { percent.clamp(0.0, 100.0) as u8 } else { 0 };
        let mut inner = self.lock();
        if inner.state.is_terminal() || value <= inner.progress {
            return;
        }
        inner.progress = value;
        self.publish(&mut inner);
    }

    fn transition(&self, event: TaskEvent, result: Option<TaskResult>) -> Result<TaskState> {
        let mut inner = self.lock();
        let to = self.machine.transition(inner.state, event)?;
        debug!(task_id = %self.id, "任务状态 {} -> {}", inner.state, to);
        inner.state = to;
        if to == TaskState::Completed {
            inner.progress = 100;
            inner.result = result;
        }
        if to.is_terminal() {
            inner.finished_at = Some(Utc::now());
        }
        self.publish(&mut inner);
        Ok(to)
    }

    pub(crate) fn start(&self) -> Result<TaskState> {
        self.transition(TaskEvent::Start, None)
    }

    pub(crate) fn complete(&self, result: TaskResult) -> Result<TaskState> {
        self.transition(TaskEvent::Complete, Some(result))
    }

    /// 先记录错误，再进入 failed
    pub(crate) fn fail(&self, message: &str) -> Result<TaskState> {
        self.log(LogLevel::Error, message);
        self.transition(TaskEvent::Fail, None)
    }

    pub(crate) fn mark_cancelled(&self) -> Result<TaskState> {
        self.transition(TaskEvent::Cancel, None)
    }

    /// 请求取消；已终止的任务不受影响
    ///
    /// 返回请求是否被接受。重复请求不会重复记录日志。
    pub fn request_cancel(&self) -> bool {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return false;
        }
        if self.cancel.is_cancelled() {
            return true;
        }
        self.cancel.cancel();
        let message = "任务已被用户取消";
        self.mirror(LogLevel::Warning, message);
        inner.logs.push(LogEntry {
            timestamp: Utc::now(),
            level: LogLevel::Warning,
            message: message.to_string(),
        });
        self.publish(&mut inner);
        true
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> TaskState {
        self.lock().state
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.lock().finished_at
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let inner = self.lock();
        TaskSnapshot {
            id: self.id,
            kind: inner.kind,
            state: inner.state,
            progress: inner.progress,
            current_step: inner.current_step.clone(),
            logs: inner.logs.clone(),
            result: inner.result.clone(),
            cancel_requested: self.cancel.is_cancelled(),
            created_at: inner.created_at,
            finished_at: inner.finished_at,
        }
    }

    /// 取走已完成任务的结果，之后快照中不再携带
    pub fn take_result(&self) -> Option<TaskResult> {
        let mut inner = self.lock();
        if inner.state != TaskState::Completed {
            return None;
        }
        inner.result.take()
    }

    fn full_event(&self) -> ProgressEvent {
        let inner = self.lock();
        self.event(&inner, inner.logs.clone())
    }

    /// 订阅进度：先得到当前快照，再接收后续更新
    pub fn subscribe(self: &Arc<Self>) -> TaskSubscription {
        let inner = self.lock();
        // 在锁内订阅，保证快照与后续事件之间没有空隙
        let rx = self.events.subscribe();
        let initial = self.event(&inner, inner.logs.clone());
        drop(inner);
        TaskSubscription {
            task: Arc::clone(self),
            pending: Some(initial),
            rx,
            last_seq: 0,
            finished: false,
        }
    }
}

/// 一个订阅者的事件流，任务进入终止状态后结束
#[derive(Debug)]
pub struct TaskSubscription {
    task: Arc<TaskHandle>,
    pending: Option<ProgressEvent>,
    rx: broadcast::Receiver<ProgressEvent>,
    last_seq: u64,
    finished: bool,
}

impl TaskSubscription {
    fn deliver(&mut self, event: ProgressEvent) -> ProgressEvent {
        self.last_seq = event.seq;
        if event.status.is_terminal() {
            self.finished = true;
        }
        event
    }

    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }
        if let Some(event) = self.pending.take() {
            return Some(self.deliver(event));
        }
        loop {
            match self.rx.recv().await {
                Ok(event) if event.seq <= self.last_seq => continue,
                Ok(event) => return Some(self.deliver(event)),
                Err(RecvError::Lagged(skipped)) => {
                    // 落后太多时用完整快照补齐，允许重复
                    warn!(task_id = %self.task.id(), "订阅者落后 {} 个事件，重新同步", skipped);
                    let event = self.task.full_event();
                    if event.seq > self.last_seq {
                        return Some(self.deliver(event));
                    }
                }
                Err(RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> {
        futures::stream::unfold(self, |mut sub| async move { sub.next().await.map(|event| (event, sub)) })
    }
}
