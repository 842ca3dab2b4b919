//! 任务状态机
//!
//! 管理检索任务的生命周期状态转换

use pacs_core::{PacsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// 终止状态不再发生任何转换
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// 任务状态转换事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskEvent {
    Start,
    Complete,
    Fail,
    Cancel,
}

/// 任务状态机
#[derive(Debug)]
pub struct TaskStateMachine {
    transitions: HashMap<(TaskState, TaskEvent), TaskState>,
}

impl TaskStateMachine {
    pub fn new() -> Self {
        let mut transitions = HashMap::new();

        transitions.insert((TaskState::Pending, TaskEvent::Start), TaskState::Running);
        transitions.insert((TaskState::Running, TaskEvent::Complete), TaskState::Completed);
        transitions.insert((TaskState::Running, TaskEvent::Fail), TaskState::Failed);
        // 取消只能发生在运行中，等待中的取消请求在首个检查点生效
        transitions.insert((TaskState::Running, TaskEvent::Cancel), TaskState::Cancelled);

        Self { transitions }
    }

    /// 检查状态转换是否有效
    pub fn can_transition(&self, from: TaskState, event: TaskEvent) -> bool {
        self.transitions.contains_key(&(from, event))
    }

    /// 执行状态转换
    pub fn transition(&self, from: TaskState, event: TaskEvent) -> Result<TaskState> {
        match self.transitions.get(&(from, event)) {
            Some(to) => Ok(*to),
            None => Err(PacsError::InvalidStateTransition {
                from: from.to_string(),
                event: format!("{:?}", event),
            }),
        }
    }

    /// 获取状态的所有可能事件
    pub fn possible_events(&self, current: TaskState) -> Vec<TaskEvent> {
        self.transitions
            .keys()
            .filter(|(state, _)| *state == current)
            .map(|(_, event)| *event)
            .collect()
    }
}

impl Default for TaskStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
