use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::sync::Arc;

use super::{
    BackgroundTask, TaskCompletionInfo, TaskId, TaskProgress, TaskState, TaskType, TaskUpdate,
};

/// Channel end and cancel flag a worker thread takes ownership of.
pub type TaskHandle = (TaskId, mpsc::Sender<TaskUpdate>, Arc<AtomicBool>);

/// Tracks the tasks this process started until each reports a terminal update.
#[derive(Default)]
pub struct BackgroundTaskManager {
    tasks: HashMap<TaskId, BackgroundTask>,
    /// Oldest first.
    order: Vec<TaskId>,
}

impl BackgroundTaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_task(&mut self, task_type: TaskType) -> TaskHandle {
        let (tx, rx) = mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let task = BackgroundTask::new(task_type, cancel.clone(), rx);
        let id = task.id;

        self.tasks.insert(id, task);
        self.order.push(id);
        tracing::debug!(task = task_type.display_name(), "Task registered");

        (id, tx, cancel)
    }

    /// Ask a running task to stop after its current item. Returns false if
    /// the task is unknown or already finished.
    pub fn cancel_task(&mut self, id: TaskId) -> bool {
        match self.tasks.get(&id) {
            Some(task) if task.is_running() => {
                tracing::info!(task = task.task_type.display_name(), "Cancellation requested");
                task.cancel();
                true
            }
            _ => false,
        }
    }

    /// Apply every pending update, then hand back and forget the tasks that
    /// finished. A sender dropped without a terminal update counts as a
    /// failure.
    pub fn poll_updates(&mut self) -> Vec<TaskCompletionInfo> {
        let mut finished = Vec::new();

        for id in &self.order {
            let Some(task) = self.tasks.get_mut(id) else {
                continue;
            };

            while task.is_running() {
                let update = match task.receiver.try_recv() {
                    Ok(update) => update,
                    Err(mpsc::TryRecvError::Empty) => break,
                    Err(mpsc::TryRecvError::Disconnected) => TaskUpdate::Failed {
                        error: "Task ended without reporting".to_string(),
                    },
                };

                let message = match update {
                    TaskUpdate::Started { total } => {
                        task.progress = Some(TaskProgress::new(0, total));
                        continue;
                    }
                    TaskUpdate::Progress(progress) => {
                        task.progress = Some(progress);
                        continue;
                    }
                    TaskUpdate::Completed { message } => {
                        task.state = TaskState::Completed;
                        message
                    }
                    TaskUpdate::Cancelled => {
                        task.state = TaskState::Cancelled;
                        "Cancelled".to_string()
                    }
                    TaskUpdate::Failed { error } => {
                        task.state = TaskState::Failed(error.clone());
                        error
                    }
                };

                finished.push(TaskCompletionInfo {
                    id: *id,
                    task_type: task.task_type,
                    state: task.state.clone(),
                    message,
                    elapsed: task.elapsed(),
                });
            }
        }

        for info in &finished {
            self.tasks.remove(&info.id);
            self.order.retain(|id| *id != info.id);
        }
        finished
    }

    pub fn running_tasks(&self) -> Vec<&BackgroundTask> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| t.is_running())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_progress_then_completion() {
        let mut manager = BackgroundTaskManager::new();
        let (id, tx, _cancel) = manager.register_task(TaskType::CaptionBatch);

        tx.send(TaskUpdate::Started { total: 2 }).unwrap();
        tx.send(TaskUpdate::Progress(TaskProgress::new(1, 2).with_item("a.jpg"))).unwrap();
        assert!(manager.poll_updates().is_empty());
        let progress = manager.running_tasks()[0].progress.clone().unwrap();
        assert_eq!(progress.percent(), 50);
        assert_eq!(progress.current_item.as_deref(), Some("a.jpg"));

        tx.send(TaskUpdate::Completed { message: "2 captioned".into() }).unwrap();
        let done = manager.poll_updates();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, id);
        assert!(done[0].succeeded());
        assert!(manager.running_tasks().is_empty());
    }

    #[test]
    fn test_cancel_reaches_worker_and_reports_cancelled() {
        let mut manager = BackgroundTaskManager::new();
        let (id, tx, cancel) = manager.register_task(TaskType::Scan);
        assert!(manager.cancel_task(id));
        assert!(cancel.load(Ordering::SeqCst));

        tx.send(TaskUpdate::Cancelled).unwrap();
        let done = manager.poll_updates();
        assert_eq!(done[0].state, TaskState::Cancelled);
        assert!(!done[0].succeeded());
        // Finished tasks are forgotten.
        assert!(!manager.cancel_task(id));
    }

    #[test]
    fn test_dropped_sender_reports_failure() {
        let mut manager = BackgroundTaskManager::new();
        let (_id, tx, _cancel) = manager.register_task(TaskType::DetailedCaption);
        drop(tx);

        let done = manager.poll_updates();
        assert_eq!(done.len(), 1);
        assert!(matches!(done[0].state, TaskState::Failed(_)));
        assert!(manager.running_tasks().is_empty());
    }
}
