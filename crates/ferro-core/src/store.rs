use crate::{Message, Task, TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Terminal text written over the last streaming message when its task
/// completes.
pub const COMPLETED_SUMMARY: &str = "Task completed. All processing steps finished.";

/// Synthetic reply returned when sending to a cancelled task.
pub const CANCELLED_NOTICE: &str = "Cannot send: this task was cancelled. Start a new task to continue.";

#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("unknown provisional task: {0}")]
    UnknownProvisional(TaskId),
    #[error("not a provisional id: {0}")]
    NotProvisional(TaskId),
}

/// Whether an outgoing message is allowed for the task's current status.
/// Only ERROR blocks sending; COMPLETED tasks still accept follow-ups.
#[derive(Debug, Clone, PartialEq)]
pub enum SendDecision {
    Accepted,
    Rejected(Message),
}

/// Insertion-ordered task collection. Insertion order is what breaks
/// `updated_at` ties for "most recently updated".
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: Vec<Task>,
}

impl TaskStore {
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|task| &task.id == id)
    }

    /// Insert, replacing an existing task with the same id in place.
    pub fn upsert(&mut self, task: Task) {
        match self.tasks.iter_mut().find(|existing| existing.id == task.id) {
            Some(slot) => *slot = task,
            None => self.tasks.push(task),
        }
    }

    pub fn remove(&mut self, id: &TaskId) -> Option<Task> {
        let index = self.tasks.iter().position(|task| &task.id == id)?;
        Some(self.tasks.remove(index))
    }

    pub fn provisional(&self) -> Option<&Task> {
        self.tasks.iter().find(|task| task.is_provisional())
    }

    /// Merge a status/progress update into an existing task. Unknown ids
    /// are a no-op: updates can race ahead of local creation.
    pub fn apply_update(
        &mut self,
        id: &TaskId,
        status: TaskStatus,
        progress: Option<f64>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|task| &task.id == id) else {
            debug!(task_id = %id, "update for unknown task dropped");
            return false;
        };
        task.status = status;
        if let Some(progress) = progress {
            task.progress = progress;
        }
        task.updated_at = now;
        true
    }

    /// Most recently updated confirmed task; ties keep the earliest
    /// inserted.
    pub fn most_recent_confirmed(&self) -> Option<&Task> {
        let mut best: Option<&Task> = None;
        for task in self.tasks.iter().filter(|task| !task.is_provisional()) {
            match best {
                Some(current) if task.updated_at <= current.updated_at => {}
                _ => best = Some(task),
            }
        }
        best
    }

    /// Replace all confirmed tasks with the backend's authoritative list,
    /// keeping any local provisional draft.
    pub fn replace_confirmed(&mut self, incoming: Vec<Task>) {
        self.tasks.retain(|task| task.is_provisional());
        for task in incoming {
            if task.is_provisional() {
                debug!(task_id = %task.id, "backend task in provisional namespace dropped");
                continue;
            }
            self.upsert(task);
        }
    }
}

/// Ordered conversation history per task. Append-only except for the
/// promotion re-key and the terminal finalization pass.
#[derive(Debug, Default)]
pub struct MessageStore {
    by_task: HashMap<TaskId, Vec<Message>>,
}

impl MessageStore {
    pub fn append(&mut self, id: &TaskId, message: Message) {
        self.by_task.entry(id.clone()).or_default().push(message);
    }

    pub fn messages(&self, id: &TaskId) -> &[Message] {
        self.by_task.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_messages(&self, id: &TaskId) -> bool {
        !self.messages(id).is_empty()
    }

    pub fn remove(&mut self, id: &TaskId) {
        self.by_task.remove(id);
    }

    /// Move everything recorded under `from` to the end of `to`'s
    /// sequence, preserving order.
    pub fn rekey(&mut self, from: &TaskId, to: &TaskId) {
        if let Some(moved) = self.by_task.remove(from) {
            self.by_task.entry(to.clone()).or_default().extend(moved);
        }
    }

    /// Finalize the last open streaming message for the task: clear the
    /// streaming flag, force every step to completed, replace the text
    /// with the terminal summary. Returns false when there is nothing to
    /// finalize.
    pub fn finalize_streaming(&mut self, id: &TaskId) -> bool {
        let Some(messages) = self.by_task.get_mut(id) else {
            return false;
        };
        let Some(message) = messages
            .iter_mut()
            .rev()
            .find(|message| message.is_streaming && !message.steps.is_empty())
        else {
            return false;
        };
        message.is_streaming = false;
        message.text = COMPLETED_SUMMARY.to_string();
        for step in &mut message.steps {
            step.status = crate::StepStatus::Completed;
        }
        true
    }
}

/// Combined task/message/selection state. One `Dashboard` instance is the
/// single writer for all reconciliation; callers on a multi-threaded
/// runtime must serialize access behind one lock.
#[derive(Debug, Default)]
pub struct Dashboard {
    tasks: TaskStore,
    messages: MessageStore,
    active: Option<TaskId>,
}

impl Dashboard {
    pub fn tasks(&self) -> &[Task] {
        self.tasks.tasks()
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn active(&self) -> Option<&TaskId> {
        self.active.as_ref()
    }

    pub fn active_task(&self) -> Option<&Task> {
        self.active.as_ref().and_then(|id| self.tasks.get(id))
    }

    pub fn messages(&self, id: &TaskId) -> &[Message] {
        self.messages.messages(id)
    }

    /// Restore cached state. Provisional entries are never cached and are
    /// dropped if present; the active id is restored only when its task
    /// exists.
    pub fn restore(&mut self, tasks: Vec<Task>, active: Option<TaskId>) {
        for task in tasks {
            if task.is_provisional() {
                continue;
            }
            self.tasks.upsert(task);
        }
        if let Some(id) = active {
            if self.tasks.get(&id).is_some() {
                self.active = Some(id);
            }
        }
    }

    /// Replace all confirmed tasks with the backend's authoritative list.
    /// A selection pointing at a task that vanished falls back to the
    /// most recently updated confirmed task.
    pub fn replace_confirmed(&mut self, incoming: Vec<Task>) {
        self.tasks.replace_confirmed(incoming);
        if let Some(active) = &self.active {
            if self.tasks.get(active).is_none() {
                self.active = self.tasks.most_recent_confirmed().map(|task| task.id.clone());
            }
        }
    }

    /// Start a new local draft and select it. At most one provisional
    /// task exists at a time; an existing draft is silently replaced.
    pub fn create_provisional(&mut self, now: DateTime<Utc>) -> TaskId {
        if let Some(existing) = self.tasks.provisional().map(|task| task.id.clone()) {
            self.tasks.remove(&existing);
            self.messages.remove(&existing);
        }
        let task = Task::provisional(now);
        let id = task.id.clone();
        self.tasks.upsert(task);
        self.active = Some(id.clone());
        id
    }

    /// Swap a provisional entry for the backend-confirmed task, moving
    /// its messages and the active selection to the confirmed id. The
    /// whole exchange happens under one `&mut self` call, so readers
    /// never observe the task under neither id.
    pub fn promote(&mut self, provisional: &TaskId, confirmed: Task) -> Result<TaskId, StoreError> {
        if !provisional.is_provisional() {
            return Err(StoreError::NotProvisional(provisional.clone()));
        }
        if self.tasks.remove(provisional).is_none() {
            return Err(StoreError::UnknownProvisional(provisional.clone()));
        }
        let id = confirmed.id.clone();
        self.tasks.upsert(confirmed);
        self.messages.rekey(provisional, &id);
        if self.active.as_ref() == Some(provisional) {
            self.active = Some(id.clone());
        }
        Ok(id)
    }

    pub fn apply_update(
        &mut self,
        id: &TaskId,
        status: TaskStatus,
        progress: Option<f64>,
        now: DateTime<Utc>,
    ) -> bool {
        self.tasks.apply_update(id, status, progress, now)
    }

    /// Change the active selection. Deselecting an untouched draft with
    /// no recorded messages discards it; when that leaves nothing
    /// selected, the most recently updated confirmed task takes over.
    pub fn select(&mut self, target: Option<TaskId>) {
        if let Some(id) = &target {
            if self.tasks.get(id).is_none() {
                debug!(task_id = %id, "select for unknown task ignored");
                return;
            }
        }
        let previous = self.active.clone();
        self.active = target;
        let Some(prev) = previous else {
            return;
        };
        if self.active.as_ref() == Some(&prev) || !prev.is_provisional() {
            return;
        }
        let untouched = self
            .tasks
            .get(&prev)
            .map(|task| task.is_untouched())
            .unwrap_or(false);
        if untouched && !self.messages.has_messages(&prev) {
            self.tasks.remove(&prev);
            self.messages.remove(&prev);
            if self.active.is_none() {
                self.active = self.tasks.most_recent_confirmed().map(|task| task.id.clone());
            }
        }
    }

    /// Optimistic local cancellation. The backend call is fire-and-forget
    /// and a failure does not roll this back.
    pub fn cancel(&mut self, id: &TaskId, now: DateTime<Utc>) -> bool {
        self.apply_update(id, TaskStatus::Error, None, now)
    }

    pub fn append_message(&mut self, id: &TaskId, message: Message) {
        self.messages.append(id, message);
    }

    pub fn finalize_streaming(&mut self, id: &TaskId) -> bool {
        self.messages.finalize_streaming(id)
    }

    pub fn send_policy(&self, id: &TaskId, now: DateTime<Utc>) -> SendDecision {
        match self.tasks.get(id).map(|task| task.status) {
            Some(TaskStatus::Error) => {
                SendDecision::Rejected(Message::system(CANCELLED_NOTICE, now))
            }
            _ => SendDecision::Accepted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MessageKind, Step, StepStatus};
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_756_000_000 + secs, 0)
            .single()
            .expect("valid test timestamp")
    }

    fn confirmed(id: &str, updated: DateTime<Utc>) -> Task {
        Task {
            id: TaskId::confirmed(id),
            name: String::new(),
            description: format!("task {id}"),
            status: TaskStatus::Pending,
            progress: 0.0,
            created_at: updated,
            updated_at: updated,
        }
    }

    #[test]
    fn updates_merge_and_refresh_updated_at() {
        let mut dash = Dashboard::default();
        dash.tasks.upsert(confirmed("abc", ts(0)));
        let id = TaskId::confirmed("abc");

        assert!(dash.apply_update(&id, TaskStatus::Processing, Some(20.0), ts(1)));
        assert!(dash.apply_update(&id, TaskStatus::Processing, Some(40.0), ts(2)));
        assert!(dash.apply_update(&id, TaskStatus::Completed, None, ts(3)));

        let task = dash.get(&id).expect("task present");
        assert_eq!(task.progress, 40.0);
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.updated_at, ts(3));
    }

    #[test]
    fn unknown_update_is_a_noop() {
        let mut dash = Dashboard::default();
        assert!(!dash.apply_update(
            &TaskId::confirmed("ghost"),
            TaskStatus::Processing,
            Some(10.0),
            ts(0),
        ));
    }

    #[test]
    fn promote_rekeys_task_and_messages() {
        let mut dash = Dashboard::default();
        let draft = dash.create_provisional(ts(0));
        dash.append_message(&draft, Message::user("hello", ts(1)));
        dash.append_message(&draft, Message::system("working on it", ts(2)));

        let promoted = dash
            .promote(&draft, confirmed("abc", ts(3)))
            .expect("promotion succeeds");
        assert_eq!(promoted, TaskId::confirmed("abc"));

        // Messages follow the confirmed id, in order.
        let moved = dash.messages(&promoted);
        assert_eq!(moved.len(), 2);
        assert_eq!(moved[0].text, "hello");
        assert_eq!(moved[0].kind, MessageKind::User);
        assert!(dash.messages(&draft).is_empty());

        // The stale provisional id no longer resolves.
        assert!(!dash.apply_update(&draft, TaskStatus::Processing, None, ts(4)));
        assert!(dash.apply_update(&promoted, TaskStatus::Processing, Some(40.0), ts(4)));
        assert_eq!(dash.active(), Some(&promoted));
    }

    #[test]
    fn promote_rejects_confirmed_and_unknown_ids() {
        let mut dash = Dashboard::default();
        dash.tasks.upsert(confirmed("abc", ts(0)));
        let confirmed_id = TaskId::confirmed("abc");
        assert_eq!(
            dash.promote(&confirmed_id, confirmed("def", ts(1))),
            Err(StoreError::NotProvisional(confirmed_id)),
        );

        let ghost = TaskId::Provisional("ghost".to_string());
        assert_eq!(
            dash.promote(&ghost, confirmed("def", ts(1))),
            Err(StoreError::UnknownProvisional(ghost)),
        );
    }

    #[test]
    fn second_draft_replaces_the_first() {
        let mut dash = Dashboard::default();
        let first = dash.create_provisional(ts(0));
        let second = dash.create_provisional(ts(1));
        assert_ne!(first, second);
        assert!(dash.get(&first).is_none());
        assert_eq!(dash.active(), Some(&second));
        assert_eq!(dash.tasks().len(), 1);
    }

    #[test]
    fn deselecting_untouched_draft_discards_it() {
        let mut dash = Dashboard::default();
        dash.create_provisional(ts(0));
        dash.select(None);
        assert!(dash.tasks().is_empty());
        assert_eq!(dash.active(), None);
    }

    #[test]
    fn deselecting_draft_falls_back_to_most_recent_confirmed() {
        let mut dash = Dashboard::default();
        dash.tasks.upsert(confirmed("old", ts(0)));
        dash.tasks.upsert(confirmed("new", ts(5)));
        dash.create_provisional(ts(6));
        dash.select(None);
        assert_eq!(dash.active(), Some(&TaskId::confirmed("new")));
        assert_eq!(dash.tasks().len(), 2);
    }

    #[test]
    fn recency_ties_keep_insertion_order() {
        let mut dash = Dashboard::default();
        dash.tasks.upsert(confirmed("first", ts(0)));
        dash.tasks.upsert(confirmed("second", ts(0)));
        dash.create_provisional(ts(1));
        dash.select(None);
        assert_eq!(dash.active(), Some(&TaskId::confirmed("first")));
    }

    #[test]
    fn draft_with_messages_survives_deselection() {
        let mut dash = Dashboard::default();
        let draft = dash.create_provisional(ts(0));
        dash.append_message(&draft, Message::user("keep me", ts(1)));
        dash.select(None);
        assert!(dash.get(&draft).is_some());
        assert_eq!(dash.active(), None);
    }

    #[test]
    fn selecting_another_task_also_collects_the_draft() {
        let mut dash = Dashboard::default();
        dash.tasks.upsert(confirmed("abc", ts(0)));
        dash.create_provisional(ts(1));
        dash.select(Some(TaskId::confirmed("abc")));
        assert_eq!(dash.tasks().len(), 1);
        assert_eq!(dash.active(), Some(&TaskId::confirmed("abc")));
    }

    #[test]
    fn send_policy_blocks_only_error_status() {
        let mut dash = Dashboard::default();
        for (id, status) in [
            ("p", TaskStatus::Pending),
            ("r", TaskStatus::Processing),
            ("c", TaskStatus::Completed),
        ] {
            let mut task = confirmed(id, ts(0));
            task.status = status;
            dash.tasks.upsert(task);
            assert_eq!(
                dash.send_policy(&TaskId::confirmed(id), ts(1)),
                SendDecision::Accepted,
            );
        }

        let mut cancelled = confirmed("x", ts(0));
        cancelled.status = TaskStatus::Error;
        dash.tasks.upsert(cancelled);
        match dash.send_policy(&TaskId::confirmed("x"), ts(1)) {
            SendDecision::Rejected(notice) => {
                assert_eq!(notice.kind, MessageKind::System);
                assert_eq!(notice.text, CANCELLED_NOTICE);
            }
            SendDecision::Accepted => panic!("cancelled task must reject sends"),
        }
    }

    #[test]
    fn cancel_is_optimistic() {
        let mut dash = Dashboard::default();
        dash.tasks.upsert(confirmed("abc", ts(0)));
        let id = TaskId::confirmed("abc");
        assert!(dash.cancel(&id, ts(1)));
        assert_eq!(dash.get(&id).expect("present").status, TaskStatus::Error);
    }

    #[test]
    fn finalize_rewrites_last_streaming_message() {
        let mut dash = Dashboard::default();
        let id = TaskId::confirmed("abc");
        dash.tasks.upsert(confirmed("abc", ts(0)));
        dash.append_message(&id, Message::user("hello", ts(1)));
        dash.append_message(
            &id,
            Message::streaming(
                "Working...",
                vec![
                    Step {
                        title: "Queued".to_string(),
                        status: StepStatus::Completed,
                        time_estimate: None,
                    },
                    Step {
                        title: "Processing".to_string(),
                        status: StepStatus::InProgress,
                        time_estimate: Some("~1m".to_string()),
                    },
                ],
                ts(2),
            ),
        );

        assert!(dash.finalize_streaming(&id));
        let last = dash.messages(&id).last().expect("message present");
        assert!(!last.is_streaming);
        assert_eq!(last.text, COMPLETED_SUMMARY);
        assert!(last
            .steps
            .iter()
            .all(|step| step.status == StepStatus::Completed));

        // Nothing left to finalize.
        assert!(!dash.finalize_streaming(&id));
    }

    #[test]
    fn finalize_skips_streaming_messages_without_steps() {
        let mut dash = Dashboard::default();
        let id = TaskId::confirmed("abc");
        dash.append_message(&id, Message::streaming("thinking", Vec::new(), ts(0)));
        assert!(!dash.finalize_streaming(&id));
    }

    #[test]
    fn replace_confirmed_keeps_local_draft() {
        let mut dash = Dashboard::default();
        let draft = dash.create_provisional(ts(0));
        dash.tasks.upsert(confirmed("stale", ts(0)));
        dash.tasks
            .replace_confirmed(vec![confirmed("abc", ts(1)), confirmed("def", ts(2))]);
        assert!(dash.get(&draft).is_some());
        assert!(dash.get(&TaskId::confirmed("stale")).is_none());
        assert_eq!(dash.tasks().len(), 3);
    }
}
