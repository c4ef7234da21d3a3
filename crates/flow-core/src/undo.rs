//! Undo/redo of task-list edits using compressed snapshots
//!
//! Each committed edit pushes the whole task list, serialized and
//! zstd-compressed. Restoring a snapshot replaces the list wholesale, so no
//! edit needs an inverse operation.

use std::collections::VecDeque;

use crate::error::{FlowError, Result};
use crate::types::Task;

/// Bounded undo/redo stack of task-list snapshots
#[derive(Debug)]
pub struct UndoStack {
    /// Compressed task lists (zstd)
    snapshots: VecDeque<Vec<u8>>,
    /// Position of the current state
    current: usize,
    max_snapshots: usize,
}

impl UndoStack {
    /// Stack keeping at most `max_snapshots` states (at least one)
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            snapshots: VecDeque::new(),
            current: 0,
            max_snapshots: max_snapshots.max(1),
        }
    }

    /// Record a new state, discarding any redo history
    pub fn push(&mut self, tasks: &[Task]) -> Result<()> {
        let json = serde_json::to_vec(tasks)?;
        let compressed =
            zstd::encode_all(&json[..], 3).map_err(|e| FlowError::Compression(e.to_string()))?;

        self.snapshots.truncate(self.current + 1);
        self.snapshots.push_back(compressed);
        self.current = self.snapshots.len() - 1;

        while self.snapshots.len() > self.max_snapshots {
            self.snapshots.pop_front();
            self.current = self.current.saturating_sub(1);
        }
        Ok(())
    }

    /// Step back; `None` at the oldest snapshot
    pub fn undo(&mut self) -> Option<Result<Vec<Task>>> {
        if !self.can_undo() {
            return None;
        }
        self.current -= 1;
        Some(self.decompress(self.current))
    }

    /// Step forward; `None` at the newest snapshot
    pub fn redo(&mut self) -> Option<Result<Vec<Task>>> {
        if !self.can_redo() {
            return None;
        }
        self.current += 1;
        Some(self.decompress(self.current))
    }

    /// An older snapshot exists
    pub fn can_undo(&self) -> bool {
        self.current > 0
    }

    /// A snapshot undone earlier can be restored
    pub fn can_redo(&self) -> bool {
        self.current + 1 < self.snapshots.len()
    }

    /// Number of stored snapshots, the current one included
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// No snapshot recorded yet
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Drop all history, e.g. when another version is loaded
    pub fn clear(&mut self) {
        self.snapshots.clear();
        self.current = 0;
    }

    /// Total compressed size of all snapshots
    pub fn compressed_size(&self) -> usize {
        self.snapshots.iter().map(Vec::len).sum()
    }

    fn decompress(&self, index: usize) -> Result<Vec<Task>> {
        let compressed = self
            .snapshots
            .get(index)
            .ok_or_else(|| FlowError::Compression(format!("no snapshot at {}", index)))?;
        let json =
            zstd::decode_all(&compressed[..]).map_err(|e| FlowError::Compression(e.to_string()))?;
        Ok(serde_json::from_slice(&json)?)
    }
}

impl Default for UndoStack {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tasks(names: &[&str]) -> Vec<Task> {
        names.iter().map(|name| Task::simple(*name)).collect()
    }

    fn names(tasks: &[Task]) -> Vec<&str> {
        tasks.iter().map(|t| t.reference_name.as_str()).collect()
    }

    #[test]
    fn test_push_and_undo() {
        let mut stack = UndoStack::new(10);
        stack.push(&tasks(&["a"])).unwrap();
        stack.push(&tasks(&["a", "b"])).unwrap();
        stack.push(&tasks(&["a", "b", "c"])).unwrap();

        let undone = stack.undo().unwrap().unwrap();
        assert_eq!(names(&undone), vec!["a", "b"]);
        let undone = stack.undo().unwrap().unwrap();
        assert_eq!(names(&undone), vec!["a"]);
        assert!(stack.undo().is_none());
    }

    #[test]
    fn test_redo_and_truncation() {
        let mut stack = UndoStack::new(10);
        stack.push(&tasks(&["a"])).unwrap();
        stack.push(&tasks(&["b"])).unwrap();

        stack.undo();
        let redone = stack.redo().unwrap().unwrap();
        assert_eq!(names(&redone), vec!["b"]);
        assert!(stack.redo().is_none());

        stack.undo();
        stack.push(&tasks(&["c"])).unwrap();
        assert!(!stack.can_redo());
        assert_eq!(stack.len(), 2);
    }

    #[test]
    fn test_max_snapshots() {
        let mut stack = UndoStack::new(3);
        for i in 0..5 {
            stack.push(&tasks(&[format!("t{}", i).as_str()])).unwrap();
        }
        assert_eq!(stack.len(), 3);

        stack.undo();
        let oldest = stack.undo().unwrap().unwrap();
        assert_eq!(names(&oldest), vec!["t2"]);
        assert!(!stack.can_undo());
    }

    #[test]
    fn test_unknown_fields_survive_snapshot() {
        let mut task = Task::simple("a");
        task.extra
            .insert("retryCount".into(), serde_json::json!(2));
        let mut stack = UndoStack::new(5);
        stack.push(&[task.clone()]).unwrap();
        stack.push(&[]).unwrap();

        let restored = stack.undo().unwrap().unwrap();
        assert_eq!(restored, vec![task]);
    }
}
