use std::collections::VecDeque;

use thiserror::Error;

use super::paths::is_same_or_beneath;

/// A corrective action, also the kind under which its echo is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Upload,
    Download,
    LocalDelete,
    RemoteDelete,
    LocalFolder,
    RemoteFolder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub kind: ActionKind,
    pub path_display: String,
    pub path_lower: String,
    pub id: Option<String>,
    pub attempt: u32,
}

impl Action {
    pub fn new(kind: ActionKind, path_display: impl Into<String>, path_lower: impl Into<String>) -> Self {
        Self {
            kind,
            path_display: path_display.into(),
            path_lower: path_lower.into(),
            id: None,
            attempt: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("action queue is empty")]
    Empty,
}

#[derive(Debug, Default)]
pub struct ActionQueue {
    inner: VecDeque<Action>,
}

impl ActionQueue {
    /// Appends in FIFO order. An identical pending action (same kind and path) is replaced in place.
    pub fn enqueue(&mut self, action: Action) {
        if let Some(existing) = self
            .inner
            .iter_mut()
            .find(|queued| queued.kind == action.kind && queued.path_lower == action.path_lower)
        {
            *existing = action;
            return;
        }
        self.inner.push_back(action);
    }

    pub fn dequeue(&mut self) -> Result<Action, QueueError> {
        self.inner.pop_front().ok_or(QueueError::Empty)
    }

    /// Drops every queued action for `path_lower` or anything beneath it.
    pub fn cancel_path(&mut self, path_lower: &str) -> usize {
        let before = self.inner.len();
        self.inner
            .retain(|action| !is_same_or_beneath(&action.path_lower, path_lower));
        before - self.inner.len()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.inner.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_preserved() {
        let mut queue = ActionQueue::default();
        queue.enqueue(Action::new(ActionKind::Upload, "/A", "/a"));
        queue.enqueue(Action::new(ActionKind::Download, "/B", "/b"));

        let first = queue.dequeue().unwrap();
        let second = queue.dequeue().unwrap();

        assert_eq!(first.path_display, "/A");
        assert_eq!(second.path_display, "/B");
        assert!(queue.is_empty());
    }

    #[test]
    fn dequeue_on_empty_returns_error() {
        let mut queue = ActionQueue::default();
        assert!(matches!(queue.dequeue(), Err(QueueError::Empty)));
    }

    #[test]
    fn enqueue_deduplicates_by_kind_and_path() {
        let mut queue = ActionQueue::default();
        queue.enqueue(Action::new(ActionKind::Download, "/doc.txt", "/doc.txt").with_id("id:1"));
        queue.enqueue(Action::new(ActionKind::Upload, "/other.txt", "/other.txt"));
        queue.enqueue(Action::new(ActionKind::Download, "/Doc.txt", "/doc.txt").with_id("id:2"));

        assert_eq!(queue.len(), 2);
        let first = queue.dequeue().unwrap();
        assert_eq!(first.id.as_deref(), Some("id:2"));
        assert_eq!(first.path_display, "/Doc.txt");
    }

    #[test]
    fn cancel_path_drops_path_and_descendants() {
        let mut queue = ActionQueue::default();
        queue.enqueue(Action::new(ActionKind::LocalFolder, "/Docs", "/docs"));
        queue.enqueue(Action::new(ActionKind::Download, "/Docs/A.txt", "/docs/a.txt"));
        queue.enqueue(Action::new(ActionKind::Download, "/Docs2/B.txt", "/docs2/b.txt"));

        assert_eq!(queue.cancel_path("/docs"), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue().unwrap().path_lower, "/docs2/b.txt");
    }
}
