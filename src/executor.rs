use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::anyhow;
use futures::future::join_all;
use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::task::Task;

pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

pub type Priority = u8;

pub const LOW_PRIORITY: Priority = 1;
pub const NORMAL_PRIORITY: Priority = 2;
pub const HIGH_PRIORITY: Priority = 3;

/// Tasks that reached a terminal status during the same tick.
pub type CompletedTasks = Vec<Box<dyn Task>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Maximum amount of tasks being advanced at the same time.
    pub concurrency: usize,
    pub interval: Duration,
    /// When set, a pending task gains one priority point every `aging_interval` it spends
    /// waiting. Without it priorities are strict and low priority tasks can starve.
    pub aging_interval: Option<Duration>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            interval: DEFAULT_INTERVAL,
            aging_interval: None,
        }
    }
}

struct PendingTask {
    task: Box<dyn Task>,
    priority: Priority,
    effective_priority: u32,
    sequence: u64,
    enqueued_at: Instant,
}

impl PendingTask {
    fn order_key(&self) -> (u32, Reverse<u64>) {
        (self.effective_priority, Reverse(self.sequence))
    }
}

impl PartialEq for PendingTask {
    fn eq(&self, other: &Self) -> bool {
        self.order_key() == other.order_key()
    }
}

impl Eq for PendingTask {}

impl PartialOrd for PendingTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// higher priority first, same priority in arrival order
impl Ord for PendingTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

// cancellation tokens of every queued or in flight task, by key
type CancellationTokens = Arc<Mutex<HashMap<String, CancellationToken>>>;

fn lock_tokens(tokens: &CancellationTokens) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
    tokens.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Priority scheduler advancing at most `concurrency` tasks per tick, one step each.
pub struct TasksExecutor {
    options: ExecutorOptions,
    pending: BinaryHeap<PendingTask>,
    in_flight: Vec<Box<dyn Task>>,
    completed: Vec<Box<dyn Task>>,
    sequence: u64,
    tokens: CancellationTokens,
}

impl TasksExecutor {
    pub fn new(options: ExecutorOptions) -> Self {
        Self {
            options: ExecutorOptions {
                concurrency: options.concurrency.max(1),
                ..options
            },
            pending: BinaryHeap::new(),
            in_flight: Vec::new(),
            completed: Vec::new(),
            sequence: 0,
            tokens: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn add_task(&mut self, task: Box<dyn Task>, priority: Priority) {
        tracing::debug!("queueing task {} with priority {}", task.key(), priority);
        lock_tokens(&self.tokens)
            .insert(task.key().to_owned(), task.cancellation_token().clone());
        self.sequence += 1;
        self.pending.push(PendingTask {
            task,
            priority,
            effective_priority: u32::from(priority),
            sequence: self.sequence,
            enqueued_at: Instant::now(),
        });
    }

    /// Cancels the task with the given key, wherever it is. The task will show up as
    /// errored in the next completed batch.
    pub fn cancel_task(&self, key: &str) -> bool {
        cancel(&self.tokens, key)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Keys of the in flight tasks, in promotion order.
    pub fn in_flight_keys(&self) -> Vec<&str> {
        self.in_flight.iter().map(|task| task.key()).collect()
    }

    /// One scheduling round: promotes pending tasks into the free slots, advances every
    /// in flight task by one step concurrently and returns the tasks that reached a
    /// terminal status, if any.
    pub async fn tick(&mut self) -> Option<CompletedTasks> {
        self.age_pending();
        self.drain_cancelled().await;
        while self.in_flight.len() < self.options.concurrency {
            match self.pending.pop() {
                Some(pending) => {
                    tracing::debug!(
                        "promoting task {} (priority {}, effective {})",
                        pending.task.key(),
                        pending.priority,
                        pending.effective_priority
                    );
                    self.in_flight.push(pending.task);
                }
                None => break,
            }
        }

        if !self.in_flight.is_empty() {
            join_all(self.in_flight.iter_mut().map(|task| task.execute())).await;

            let (terminal, running): (Vec<_>, Vec<_>) = self
                .in_flight
                .drain(..)
                .partition(|task| task.status().is_terminal());
            self.in_flight = running;
            self.completed.extend(terminal);
        }

        if self.completed.is_empty() {
            return None;
        }
        let batch = std::mem::take(&mut self.completed);
        let mut tokens = lock_tokens(&self.tokens);
        for task in batch.iter() {
            tokens.remove(task.key());
        }
        Some(batch)
    }

    fn age_pending(&mut self) {
        let aging_interval = match self.options.aging_interval {
            Some(aging_interval) if !aging_interval.is_zero() && !self.pending.is_empty() => {
                aging_interval
            }
            _ => return,
        };
        let now = Instant::now();
        let mut pending = std::mem::take(&mut self.pending).into_vec();
        for task in pending.iter_mut() {
            let waited = now.duration_since(task.enqueued_at).as_millis()
                / aging_interval.as_millis().max(1);
            let bonus = u32::try_from(waited).unwrap_or(u32::MAX);
            task.effective_priority = u32::from(task.priority).saturating_add(bonus);
        }
        self.pending = BinaryHeap::from(pending);
    }

    // cancelled pending tasks fail right away without taking an in flight slot
    async fn drain_cancelled(&mut self) {
        if !self
            .pending
            .iter()
            .any(|pending| pending.task.cancellation_token().is_cancelled())
        {
            return;
        }
        let (cancelled, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_vec()
            .into_iter()
            .partition(|pending| pending.task.cancellation_token().is_cancelled());
        self.pending = BinaryHeap::from(waiting);
        for mut pending in cancelled.into_iter() {
            if pending.task.execute().await.is_terminal() {
                self.completed.push(pending.task);
            } else {
                tracing::warn!(
                    "task {} ignored its cancellation, queueing it again",
                    pending.task.key()
                );
                self.pending.push(pending);
            }
        }
    }

    /// Moves the executor onto its own tokio task, ticking every `interval`. Completed
    /// batches are delivered on the returned receiver. Dropping every handle stops the loop.
    pub fn start_execute(self) -> (TasksExecutorHandle, mpsc::UnboundedReceiver<CompletedTasks>) {
        let (command_sender, command_receiver) = mpsc::unbounded_channel();
        let (completed_sender, completed_receiver) = mpsc::unbounded_channel();
        let tokens = self.tokens.clone();
        tokio::spawn(
            self.run(command_receiver, completed_sender)
                .instrument(tracing::info_span!("tasks-executor")),
        );
        (
            TasksExecutorHandle {
                commands: command_sender,
                tokens,
            },
            completed_receiver,
        )
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        completed: mpsc::UnboundedSender<CompletedTasks>,
    ) {
        tracing::info!(
            "executing tasks every {}ms with concurrency {}",
            self.options.interval.as_millis(),
            self.options.concurrency
        );
        let mut interval = tokio::time::interval(self.options.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::AddTask { task, priority }) => self.add_task(task, priority),
                    None => {
                        tracing::info!("all executor handles dropped, stopping");
                        return;
                    }
                },
                _ = interval.tick() => {
                    if let Some(batch) = self.tick().await {
                        tracing::debug!("{} task(s) reached a terminal status", batch.len());
                        if completed.send(batch).is_err() {
                            tracing::warn!("completed tasks receiver dropped, stopping");
                            return;
                        }
                    }
                }
            }
        }
    }
}

enum Command {
    AddTask {
        task: Box<dyn Task>,
        priority: Priority,
    },
}

fn cancel(tokens: &CancellationTokens, key: &str) -> bool {
    match lock_tokens(tokens).get(key) {
        Some(token) => {
            token.cancel();
            tracing::info!("task {} cancelled", key);
            true
        }
        None => false,
    }
}

#[derive(Clone)]
pub struct TasksExecutorHandle {
    commands: mpsc::UnboundedSender<Command>,
    tokens: CancellationTokens,
}

impl TasksExecutorHandle {
    pub fn add_task(&self, task: Box<dyn Task>, priority: Priority) -> anyhow::Result<()> {
        // registered here so that a cancellation sent right after is not lost
        let key = task.key().to_owned();
        lock_tokens(&self.tokens).insert(key.clone(), task.cancellation_token().clone());
        self.commands
            .send(Command::AddTask { task, priority })
            .map_err(|_| {
                lock_tokens(&self.tokens).remove(&key);
                anyhow!("tasks executor is not running")
            })
    }

    /// Fires the cancellation token of a queued or in flight task without waiting for the
    /// executor loop, which may be stuck awaiting that very task.
    pub fn cancel_task(&self, key: &str) -> bool {
        cancel(&self.tokens, key)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::{ExecutorOptions, TasksExecutor};
    use crate::task::{GetLogsResult, Task, TaskKind, TaskResult, TaskStatus};

    // completes after `steps` executions, or errors on step `fail_at`
    struct CountingTask {
        key: String,
        steps: usize,
        executed: usize,
        fail_at: Option<usize>,
        status: TaskStatus,
        cancellation_token: CancellationToken,
    }

    impl CountingTask {
        fn boxed(key: &str, steps: usize) -> Box<dyn Task> {
            Box::new(Self {
                key: key.to_owned(),
                steps,
                executed: 0,
                fail_at: None,
                status: TaskStatus::InProgress,
                cancellation_token: CancellationToken::new(),
            })
        }

        fn failing(key: &str, fail_at: usize) -> Box<dyn Task> {
            Box::new(Self {
                key: key.to_owned(),
                steps: usize::MAX,
                executed: 0,
                fail_at: Some(fail_at),
                status: TaskStatus::InProgress,
                cancellation_token: CancellationToken::new(),
            })
        }
    }

    #[async_trait]
    impl Task for CountingTask {
        fn key(&self) -> &str {
            &self.key
        }

        fn kind(&self) -> TaskKind {
            TaskKind::GetLogs
        }

        fn status(&self) -> TaskStatus {
            self.status
        }

        async fn execute(&mut self) -> TaskStatus {
            if self.status.is_terminal() {
                return self.status;
            }
            if self.cancellation_token.is_cancelled() {
                self.status = TaskStatus::Error;
                return self.status;
            }
            self.executed += 1;
            if Some(self.executed) == self.fail_at {
                self.status = TaskStatus::Error;
            } else if self.executed >= self.steps {
                self.status = TaskStatus::Completed;
            }
            self.status
        }

        fn take_result(&mut self) -> TaskResult {
            TaskResult::GetLogs(GetLogsResult::default())
        }

        fn error(&self) -> Option<&str> {
            None
        }

        fn cancellation_token(&self) -> &CancellationToken {
            &self.cancellation_token
        }
    }

    // stuck on its first step until cancelled, like a call to an unresponsive node
    struct HungTask {
        key: String,
        status: TaskStatus,
        cancellation_token: CancellationToken,
    }

    #[async_trait]
    impl Task for HungTask {
        fn key(&self) -> &str {
            &self.key
        }

        fn kind(&self) -> TaskKind {
            TaskKind::GetLogs
        }

        fn status(&self) -> TaskStatus {
            self.status
        }

        async fn execute(&mut self) -> TaskStatus {
            if !self.status.is_terminal() {
                self.cancellation_token.cancelled().await;
                self.status = TaskStatus::Error;
            }
            self.status
        }

        fn take_result(&mut self) -> TaskResult {
            TaskResult::GetLogs(GetLogsResult::default())
        }

        fn error(&self) -> Option<&str> {
            None
        }

        fn cancellation_token(&self) -> &CancellationToken {
            &self.cancellation_token
        }
    }

    fn keys(batch: &[Box<dyn Task>]) -> Vec<String> {
        batch.iter().map(|task| task.key().to_owned()).collect()
    }

    fn executor(concurrency: usize) -> TasksExecutor {
        TasksExecutor::new(ExecutorOptions {
            concurrency,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn higher_priority_promoted_first() {
        let mut executor = executor(1);
        executor.add_task(CountingTask::boxed("low", 2), 1);
        executor.add_task(CountingTask::boxed("high", 2), 3);
        executor.add_task(CountingTask::boxed("mid", 2), 2);

        assert!(executor.tick().await.is_none());
        assert_eq!(executor.in_flight_keys(), vec!["high"]);

        let batch = executor.tick().await.unwrap();
        assert_eq!(keys(&batch), vec!["high"]);

        executor.tick().await;
        assert_eq!(executor.in_flight_keys(), vec!["mid"]);
        executor.tick().await;
        executor.tick().await;
        assert_eq!(executor.in_flight_keys(), vec!["low"]);
    }

    #[tokio::test]
    async fn same_priority_in_arrival_order() {
        let mut executor = executor(2);
        for key in ["a", "b", "c", "d"] {
            executor.add_task(CountingTask::boxed(key, 5), 2);
        }
        executor.tick().await;
        assert_eq!(executor.in_flight_keys(), vec!["a", "b"]);
        assert_eq!(executor.pending_len(), 2);
    }

    #[tokio::test]
    async fn bounded_concurrency_and_batches() {
        let mut executor = executor(2);
        executor.add_task(CountingTask::boxed("one-step", 1), 1);
        executor.add_task(CountingTask::boxed("two-steps", 2), 1);
        executor.add_task(CountingTask::boxed("late", 1), 1);

        let batch = executor.tick().await.unwrap();
        assert_eq!(keys(&batch), vec!["one-step"]);
        assert_eq!(executor.in_flight_len(), 1);
        assert_eq!(executor.pending_len(), 1);

        // the freed slot is taken by the pending task, both end in the same tick
        let mut batch = keys(&executor.tick().await.unwrap());
        batch.sort();
        assert_eq!(batch, vec!["late", "two-steps"]);
        assert_eq!(executor.in_flight_len(), 0);
        assert!(executor.tick().await.is_none());
    }

    #[tokio::test]
    async fn errored_tasks_are_reported() {
        let mut executor = executor(4);
        executor.add_task(CountingTask::failing("broken", 2), 1);
        assert!(executor.tick().await.is_none());
        let batch = executor.tick().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].status(), TaskStatus::Error);
    }

    #[tokio::test]
    async fn cancel_pending_task() {
        let mut executor = executor(1);
        executor.add_task(CountingTask::boxed("running", 10), 3);
        executor.add_task(CountingTask::boxed("waiting", 10), 1);
        executor.tick().await;

        assert!(executor.cancel_task("waiting"));
        assert!(!executor.cancel_task("unknown"));

        let batch = executor.tick().await.unwrap();
        assert_eq!(keys(&batch), vec!["waiting"]);
        assert_eq!(batch[0].status(), TaskStatus::Error);
        assert_eq!(executor.in_flight_keys(), vec!["running"]);
    }

    #[tokio::test]
    async fn cancelled_pending_task_takes_no_slot() {
        let mut executor = executor(1);
        executor.add_task(CountingTask::boxed("running", 10), 3);
        executor.add_task(CountingTask::boxed("waiting", 10), 1);
        executor.tick().await;
        executor.cancel_task("waiting");

        let batch = executor.tick().await.unwrap();
        assert_eq!(keys(&batch), vec!["waiting"]);
        assert_eq!(executor.in_flight_len(), 1);
        assert_eq!(executor.pending_len(), 0);

        // reported tasks are forgotten
        assert!(!executor.cancel_task("waiting"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_hung_in_flight_task_through_handle() {
        let (handle, mut completed) = executor(2).start_execute();
        handle
            .add_task(
                Box::new(HungTask {
                    key: "hung".to_owned(),
                    status: TaskStatus::InProgress,
                    cancellation_token: CancellationToken::new(),
                }),
                2,
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(handle.cancel_task("hung"));
        let batch = tokio::time::timeout(Duration::from_secs(2), completed.recv())
            .await
            .expect("cancelled task was never reported")
            .unwrap();
        assert_eq!(keys(&batch), vec!["hung"]);
        assert_eq!(batch[0].status(), TaskStatus::Error);
        assert!(!handle.cancel_task("hung"));
    }

    #[tokio::test(start_paused = true)]
    async fn aging_lets_old_tasks_through() {
        let mut executor = TasksExecutor::new(ExecutorOptions {
            concurrency: 1,
            aging_interval: Some(Duration::from_secs(1)),
            ..Default::default()
        });
        executor.add_task(CountingTask::boxed("old-low", 1), 1);
        tokio::time::advance(Duration::from_secs(5)).await;
        executor.add_task(CountingTask::boxed("fresh-high", 1), 3);

        let batch = executor.tick().await.unwrap();
        assert_eq!(keys(&batch), vec!["old-low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_executor_emits_batches() {
        let (handle, mut completed) = executor(2).start_execute();
        handle.add_task(CountingTask::boxed("a", 1), 1).unwrap();
        handle.add_task(CountingTask::boxed("b", 3), 1).unwrap();

        let first = completed.recv().await.unwrap();
        assert_eq!(keys(&first), vec!["a"]);
        let second = completed.recv().await.unwrap();
        assert_eq!(keys(&second), vec!["b"]);
    }
}
