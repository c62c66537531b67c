//! Coalescing of concurrent work for the same key.
//!
//! A [`TaskRegistry`] tracks at most one running work item per task id. Each work item has a
//! list of waiting requests. The first request for an idle task id starts the work, every
//! following request for the same id only attaches itself as a waiter. Once the work
//! finishes, its result is fanned out to all waiters in the order they were added.
//!
//! Requests can be cancelled individually. When the last waiter of a work item is cancelled,
//! the work item itself is cancelled and forgotten.
//!
//! None of the closures handed to the registry are ever invoked while its internal lock is
//! held, so they are free to call back into the registry.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;

use crate::metric;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a single request that is waiting on a work item.
///
/// Ids are unique across all registries of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type RequestCallback<R> = Box<dyn FnOnce(R) + Send + 'static>;
type TaskCallback<R> = Box<dyn FnOnce(&R) + Send + 'static>;
type CancelCallback = Box<dyn FnOnce() + Send + 'static>;

struct Waiter<R> {
    id: RequestId,
    on_complete: RequestCallback<R>,
}

struct WorkItem<R> {
    generation: u64,
    waiters: Vec<Waiter<R>>,
    cancel: CancelCallback,
    on_task_complete: TaskCallback<R>,
}

struct Tasks<K, R> {
    items: HashMap<K, WorkItem<R>>,
    next_generation: u64,
}

type TaskMap<K, R> = Arc<Mutex<Tasks<K, R>>>;

/// Coalesces concurrent requests for the same task id into a single unit of work.
pub struct TaskRegistry<K, R> {
    name: &'static str,
    queue: Handle,
    tasks: TaskMap<K, R>,
}

impl<K, R> Clone for TaskRegistry<K, R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            queue: self.queue.clone(),
            tasks: self.tasks.clone(),
        }
    }
}

impl<K, R> fmt::Debug for TaskRegistry<K, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_flight = self.tasks.lock().unwrap().items.len();
        f.debug_struct("TaskRegistry")
            .field("name", &self.name)
            .field("in_flight", &in_flight)
            .finish()
    }
}

impl<K, R> TaskRegistry<K, R>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    R: Clone + Send + 'static,
{
    /// Creates a registry that starts its work items on `queue`.
    pub fn new(name: &'static str, queue: Handle) -> Self {
        Self {
            name,
            queue,
            tasks: Arc::new(Mutex::new(Tasks {
                items: HashMap::new(),
                next_generation: 0,
            })),
        }
    }

    /// Adds a request for `task_id`.
    ///
    /// If no work item is in flight for `task_id`, a new one is created from `execute`,
    /// `cancel` and `on_task_complete`, and `execute` is scheduled on the registry's queue.
    /// It is never invoked before this function returns. Otherwise, those three closures are
    /// dropped and the request joins the running work item.
    ///
    /// `on_request_complete` is invoked with the result once the work item finishes, unless
    /// the request is cancelled first.
    pub fn add_request<E, C, T, W>(
        &self,
        task_id: K,
        execute: E,
        cancel: C,
        on_task_complete: T,
        on_request_complete: W,
    ) -> RequestId
    where
        E: FnOnce(Finisher<K, R>) + Send + 'static,
        C: FnOnce() + Send + 'static,
        T: FnOnce(&R) + Send + 'static,
        W: FnOnce(R) + Send + 'static,
    {
        let name = self.name;
        let id = RequestId::next();
        let waiter = Waiter {
            id,
            on_complete: Box::new(on_request_complete),
        };

        let finisher = {
            let mut tasks = self.tasks.lock().unwrap();
            if let Some(item) = tasks.items.get_mut(&task_id) {
                metric!(counter(&format!("registry.{name}.channel.hit")) += 1);
                item.waiters.push(waiter);
                return id;
            }
            metric!(counter(&format!("registry.{name}.channel.miss")) += 1);

            let generation = tasks.next_generation;
            tasks.next_generation += 1;
            tasks.items.insert(
                task_id.clone(),
                WorkItem {
                    generation,
                    waiters: vec![waiter],
                    cancel: Box::new(cancel),
                    on_task_complete: Box::new(on_task_complete),
                },
            );

            Finisher {
                name,
                task_id,
                generation,
                tasks: self.tasks.clone(),
            }
        };

        tracing::trace!(request = %id, task_id = ?finisher.task_id, "Starting {name} work item");
        self.queue.spawn(async move { execute(finisher) });

        id
    }

    /// Cancels the request with the given id.
    ///
    /// The request's completion callback is dropped without being invoked. If this was the
    /// last waiter of its work item, the work item is removed and its `cancel` closure runs.
    /// Unknown ids are ignored.
    pub fn cancel_request(&self, request_id: RequestId) {
        let (waiter, abandoned) = {
            let mut tasks = self.tasks.lock().unwrap();
            let found = tasks.items.iter_mut().find_map(|(task_id, item)| {
                let position = item.waiters.iter().position(|w| w.id == request_id)?;
                Some((task_id.clone(), item.waiters.remove(position)))
            });
            let Some((task_id, waiter)) = found else {
                return;
            };

            let is_abandoned = tasks
                .items
                .get(&task_id)
                .is_some_and(|item| item.waiters.is_empty());
            let abandoned = if is_abandoned {
                tasks.items.remove(&task_id)
            } else {
                None
            };
            (waiter, abandoned)
        };

        // captured state is only dropped outside of the lock
        drop(waiter);
        if let Some(WorkItem { cancel, .. }) = abandoned {
            let name = self.name;
            metric!(counter(&format!("registry.{name}.cancelled")) += 1);
            tracing::trace!(request = %request_id, "Cancelling abandoned {name} work item");
            cancel();
        }
    }

    /// Finishes the work item for `task_id` with `result`.
    ///
    /// This fans the result out to all waiters of whatever work item is currently registered
    /// under `task_id`. Prefer [`Finisher::finish`], which only ever finishes the work item it
    /// was created for.
    pub fn finish(&self, task_id: &K, result: R) {
        complete(self.name, &self.tasks, task_id, None, result);
    }

    /// The number of work items currently in flight.
    pub fn in_flight(&self) -> usize {
        self.tasks.lock().unwrap().items.len()
    }

    /// The number of requests waiting on the work item for `task_id`.
    pub fn waiters(&self, task_id: &K) -> usize {
        let tasks = self.tasks.lock().unwrap();
        tasks.items.get(task_id).map_or(0, |item| item.waiters.len())
    }
}

/// Finishes exactly the work item it was handed out for.
///
/// If that work item was cancelled in the meantime, and possibly replaced by a newer one for
/// the same task id, finishing is a no-op.
pub struct Finisher<K, R> {
    name: &'static str,
    task_id: K,
    generation: u64,
    tasks: TaskMap<K, R>,
}

impl<K, R> Finisher<K, R>
where
    K: Eq + Hash,
    R: Clone,
{
    pub fn task_id(&self) -> &K {
        &self.task_id
    }

    pub fn finish(self, result: R) {
        complete(
            self.name,
            &self.tasks,
            &self.task_id,
            Some(self.generation),
            result,
        );
    }
}

impl<K: fmt::Debug, R> fmt::Debug for Finisher<K, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finisher")
            .field("name", &self.name)
            .field("task_id", &self.task_id)
            .field("generation", &self.generation)
            .finish()
    }
}

fn complete<K, R>(
    name: &'static str,
    tasks: &Mutex<Tasks<K, R>>,
    task_id: &K,
    generation: Option<u64>,
    result: R,
) where
    K: Eq + Hash,
    R: Clone,
{
    let item = {
        let mut tasks = tasks.lock().unwrap();
        let is_current = tasks
            .items
            .get(task_id)
            .is_some_and(|item| generation.is_none_or(|g| g == item.generation));
        if is_current {
            tasks.items.remove(task_id)
        } else {
            None
        }
    };

    let Some(WorkItem {
        mut waiters,
        on_task_complete,
        cancel,
        ..
    }) = item
    else {
        tracing::trace!("Discarding result of finished or cancelled {name} work item");
        return;
    };
    drop(cancel);

    metric!(counter(&format!("registry.{name}.finished")) += 1);
    on_task_complete(&result);

    // the last waiter takes the result, all others get a copy
    let last = waiters.pop();
    for waiter in waiters {
        (waiter.on_complete)(result.clone());
    }
    if let Some(waiter) = last {
        (waiter.on_complete)(result);
    }
}
