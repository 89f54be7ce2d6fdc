//! 会话级待办清单：只用于进度跟踪，不参与路由；只保留当前快照

use serde::{Deserialize, Serialize};

use crate::core::ExecutionStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    /// t1, t2, ...
    pub id: String,
    pub description: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl TodoItem {
    fn update(&mut self, status: ExecutionStatus, result: Option<String>) -> bool {
        let mut changed = false;
        if status != self.status {
            self.status = status;
            changed = true;
        }
        if result.is_some() && result != self.result {
            self.result = result;
            changed = true;
        }
        changed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoUpdate {
    pub id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub result: Option<String>,
}

/// 结构性修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TodoPlanOp {
    Add { items: Vec<String> },
    Remove { todo_ids: Vec<String> },
    Replace { items: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTodo {
    #[serde(default)]
    pub goal: Option<String>,
    items: Vec<TodoItem>,
    next_item_id: u32,
}

impl Default for SessionTodo {
    fn default() -> Self {
        Self {
            goal: None,
            items: Vec::new(),
            next_item_id: 1,
        }
    }
}

impl SessionTodo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[TodoItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn add(&mut self, description: impl Into<String>) -> &TodoItem {
        let item = TodoItem {
            id: format!("t{}", self.next_item_id),
            description: description.into(),
            status: ExecutionStatus::Pending,
            result: None,
        };
        self.next_item_id += 1;
        self.items.push(item);
        &self.items[self.items.len() - 1]
    }

    pub fn get(&self, id: &str) -> Option<&TodoItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn next_pending(&self) -> Option<&TodoItem> {
        self.items
            .iter()
            .find(|i| i.status == ExecutionStatus::Pending)
    }

    /// 批量更新状态；终态条目随后被移除。返回是否有变化
    pub fn apply_updates(&mut self, updates: Vec<TodoUpdate>) -> bool {
        let mut changed = false;
        for u in updates {
            if let Some(item) = self.items.iter_mut().find(|i| i.id == u.id) {
                changed |= item.update(u.status, u.result);
            }
        }
        let before = self.items.len();
        self.items.retain(|i| !i.status.is_terminal());
        changed || self.items.len() != before
    }

    pub fn apply_plan(&mut self, ops: Vec<TodoPlanOp>) -> bool {
        let mut changed = false;
        for op in ops {
            changed |= match op {
                TodoPlanOp::Add { items } => self.add_items(items),
                TodoPlanOp::Remove { todo_ids } => {
                    let before = self.items.len();
                    self.items.retain(|i| !todo_ids.iter().any(|id| id.trim() == i.id));
                    self.items.len() != before
                }
                TodoPlanOp::Replace { items } => {
                    let had_items = !self.items.is_empty();
                    self.items.clear();
                    self.next_item_id = 1;
                    self.add_items(items) || had_items
                }
            };
        }
        changed
    }

    fn add_items(&mut self, items: Vec<String>) -> bool {
        let mut changed = false;
        for raw in items {
            let text = raw.trim();
            if text.is_empty() {
                continue;
            }
            self.add(text);
            changed = true;
        }
        changed
    }

    /// 所有条目都已终态（空清单不算完成）
    pub fn is_completed(&self) -> bool {
        !self.items.is_empty() && self.items.iter().all(|i| i.status.is_terminal())
    }

    pub fn to_prompt(&self) -> String {
        if self.items.is_empty() {
            return String::new();
        }
        let mut out = String::from("## Team todo\n");
        if let Some(goal) = &self.goal {
            out.push_str(&format!("Goal: {goal}\n"));
        }
        for item in &self.items {
            out.push_str(&format!("- [{}] [{}] {}", item.status, item.id, item.description));
            if let Some(r) = &item.result {
                out.push_str(&format!(" -> {r}"));
            }
            out.push('\n');
        }
        if let Some(focus) = self.next_pending() {
            out.push_str(&format!("Current focus: [{}] {}\n", focus.id, focus.description));
        }
        out
    }
}
