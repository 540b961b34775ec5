// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of shortstash.
//
// shortstash is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// shortstash is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with shortstash.  If not,
// see <http://www.gnu.org/licenses/>.

//! # Background Task Processing
//!
//! Interestingly, [axum] makes no provision for compute outside the context of handling HTTP
//! requests, and there doesn't appear to be a "go to" Rust implementation of a task queue, so this
//! module provides a small async one for [shortstash].
//!
//! [shortstash]: crate
//!
//! # Design
//!
//! The goal is to allow request handlers to spawn work off the "hot path" of serving a request.
//! Metadata enrichment is the motivating case: resolving a page's Open Graph data means one or
//! more outbound HTTP exchanges, each of which can take seconds or fail outright; the submission
//! handler should persist the record, return the short code, and leave resolution to a background
//! worker.
//!
//! One could of course just use [tokio::spawn] per task, but that surrenders any control over
//! concurrency (a large batch submission would fan out one connection per link) and leaves no
//! place to stand when shutting down. Instead, handlers "send" tasks to an in-process queue and a
//! single processor drains it, driving at most a configured number of tasks at a time and
//! draining in-flight work on shutdown.
//!
//! The queue is deliberately *not* durable: a task lost to a crash is a record stuck in a
//! non-terminal enrichment state, and the retry operation exists to re-submit exactly that.
//! Accepting re-submission as the recovery path buys a much simpler queue than writing tasks
//! through the data store.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    pin::Pin,
    sync::Arc,
    task::Poll,
    time::Duration,
};

use async_trait::async_trait;
use pin_project::pin_project;
use serde::Deserialize;
use snafu::{prelude::*, Backtrace, IntoError};
use tokio::{
    sync::Notify,
    task::{Id, JoinError, JoinHandle, JoinSet},
};
use uuid::Uuid;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    // Generic error variant trait implementations can use
    #[snafu(display("{source}"))]
    Background {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to mark a task complete: {source}"))]
    Completion {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },
    #[snafu(display("Task processing failed to run to completion: {source}"))]
    Join {
        source: tokio::task::JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("Timeout shutting-down the task processor: {source}"))]
    ShutdownTimeout {
        source: tokio::time::error::Elapsed,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to pick-up a new task: {source}"))]
    Take {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },
    #[snafu(display("Tried to remove an unknown TaskId"))]
    TaskId { backtrace: Backtrace },
    #[snafu(display("Failed to wait for in-flight tasks: {source}"))]
    Timeout { source: tokio::time::error::Elapsed },
}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Background {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             tasks                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Trait defining a "task" for our purposes.
///
/// This is intentionally as general as possible: this system can handle any task that is [Send],
/// and that can convert itself into an async function yielding a `Result<()>`. Persuant to the
/// last point, note especially that the `exec()` method consumes the task!
// This trait *must* be object-safe in order to allow `process()` (below) to handle tasks in a
// generic way.
#[async_trait]
// The generic type parameter has to be at the trait level; putting it in `exec()` would make
// the trait non-object-safe.
pub trait Task<C>: Send {
    /// Consume this task by converting it into a `Future` yielding a `Result<()>`.
    async fn exec(self: Box<Self>, context: C) -> Result<()>;
    fn timeout(&self) -> Option<Duration>;
}

/// Trait defining the ability to collect, or "send" [Task]s.
///
/// This trait is generic over the [Task] type (rather than making the `send()` method generic) so
/// that implementors can express additional constraints on the types of [Task]s they can send.
#[async_trait]
pub trait Sender<C, T: Task<C>> {
    async fn send(&self, task: T) -> Result<()>;
}

/// Trait defining the ability to harvest, or "receive" [Task]s generically.
///
/// A [Receiver] needs to be able to move [Task] trait objects out of the collection, along with a
/// "cookie" or "handle" identifying that task, and then, at a later time, mark them as complete.
#[async_trait]
pub trait Receiver<C> {
    type TaskId: Send + 'static;
    async fn mark_complete(&self, cookie: Self::TaskId) -> Result<()>;
    async fn take_task(&self) -> Result<Option<(Box<dyn Task<C>>, Self::TaskId)>>;
}

/// Blanket implementation for [Arc]s; if `T` is a [Receiver], then so is `Arc<T>`.
#[async_trait]
impl<C, T: Receiver<C> + Send + Sync> Receiver<C> for Arc<T> {
    type TaskId = T::TaskId;
    async fn mark_complete(&self, cookie: Self::TaskId) -> Result<()> {
        self.as_ref().mark_complete(cookie).await
    }
    async fn take_task(&self) -> Result<Option<(Box<dyn Task<C>>, Self::TaskId)>> {
        self.as_ref().take_task().await
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          the processor                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// [Processor] is the type managing the ongoing processing of background tasks. It has a single
/// method, `shutdown()` which will consume the instance & resolve to the result of the processing
/// process (`Result<()>`).
// `Processor` need not be cheaply clonable; will likely be held in one place & then dropped to
// signal that it should shut down.
#[pin_project]
pub struct Processor {
    // This               👇 must match the return type of `process()`
    #[pin]
    processor: JoinHandle<Result<()>>,
    shutdown: Arc<Notify>,
}

impl Future for Processor {
    type Output = std::result::Result<Result<()>, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.processor.poll(cx)
    }
}

impl Processor {
    /// Consume the instance & return the result of processing background tasks
    ///
    /// This method will signal the processing task to shutdown, and wait for time `timeout` for the
    /// task to exit.
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.shutdown.notify_one();
        tokio::time::timeout(timeout, self.processor)
            .await
            .context(ShutdownTimeoutSnafu)?
            .context(JoinSnafu)?
    }
    /// Split the instance back into it's parts
    ///
    /// This is convenient when waiting on the processor along with other futures (in a
    /// `tokio::select!` invocation, e.g.)
    pub fn into_parts(self) -> (JoinHandle<Result<()>>, Arc<Notify>) {
        (self.processor, self.shutdown)
    }
}

/// Configuration parameters for processing background tasks
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Timeout that will be used for any task that doesn't define its own
    #[serde(rename = "default-timeout")]
    pub default_timeout: Duration,
    /// The maximum number of tasks to drive concurrently
    #[serde(rename = "max-concurrent-tasks")]
    pub max_concurrent_tasks: usize,
    /// Amount of time to sleep when we have no tasks in process
    #[serde(rename = "sleep-duration")]
    pub sleep_duration: Duration,
    /// Amount of time to wait for in-flight tasks on shutdown
    #[serde(rename = "shutdown-timeout")]
    pub shutdown_timeout: Duration,
    /// Maximum amount of time to drive in-flight tasks without attempting to pick-up new tasks
    #[serde(rename = "pickup-timeout")]
    pub pickup_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Enrichment tasks carry their own timeout; this is a backstop for anything that
            // doesn't.
            default_timeout: Duration::from_secs(30),
            max_concurrent_tasks: 16,
            sleep_duration: Duration::from_secs(1),
            shutdown_timeout: Duration::from_millis(500),
            pickup_timeout: Duration::from_millis(1000),
        }
    }
}

/// Process background tasks. `receiver` is a [Receiver] from which we can draw tasks. `config`
/// holds configuration parameters for the algorithm. `shutdown` is a [Notify] instance the caller
/// can use to signal this function to exit.
async fn process<C: Clone + 'static, R: Receiver<C>>(
    receiver: R,
    context: C,
    config: Config,
    shutdown: Arc<Notify>,
) -> Result<()> {
    // The basic outline of this logic is to maintain a `JoinSet` of currently running tasks,
    let mut tasks: HashMap<Id, R::TaskId> = HashMap::new();
    // with that, we can setup our `JoinSet`:
    let mut futures = JoinSet::new();
    // The overall structure here is an infinite loop; so long as...
    let mut done = false;
    // `done` is not true, loop:
    while !done {
        // so long as we don't have too much on our plate, try 'n grab another task:
        if futures.len() < config.max_concurrent_tasks {
            if let Some((task, cookie)) = receiver.take_task().await.context(TakeSnafu)? {
                let id = futures
                    .spawn(tokio::time::timeout(
                        task.timeout().unwrap_or(config.default_timeout),
                        task.exec(context.clone()),
                    ))
                    .id();
                tasks.insert(id, cookie);
            }
        }

        if !futures.is_empty() {
            // We've got at least one task; drive 'em all forward, while waiting on our shutdown
            // notification:
            tokio::select! {
                result = futures.join_next_with_id() => {
                    match result {
                        Some(Ok((id, _))) => {
                            // The task has completed succesfully (and been consumed in the
                            // process); now all that remains is to mark it complete.
                            let cookie = tasks.remove(&id).context(TaskIdSnafu)?;
                            receiver.mark_complete(cookie).await.context(CompletionSnafu)?;
                        },
                        Some(Err(err)) => {
                            return Err(JoinSnafu.into_error(err));
                        },
                        None => unimplemented!(), // Precluded by `.is_empty()`, above.
                    }
                },
                // If `futures` has a single task, and that task is long-running, we can get "stuck"
                // in this `select!` statement, driving that task forward, while other tasks pile-up
                // in the queue. By stopping periodically, we can pick-up new tasks.
                _ = tokio::time::sleep(config.pickup_timeout) => (),
                _ = shutdown.notified()=> {
                    done = true;
                }
            }
        } else {
            // We have no tasks; hang out a bit before attempting to pick-up a task, while remaining
            // mindful of our shutdown notification:
            tokio::select! {
                _ = tokio::time::sleep(config.sleep_duration) => (), // Loop around & try again
                _ = shutdown.notified() => {
                    done = true;
                }
            }
        }
    } // End processing loop.

    // Give any in-flight tasks a chance to complete:
    tokio::time::timeout(config.shutdown_timeout, futures.join_all())
        .await
        .context(TimeoutSnafu)?;

    Ok(())
}

/// Create a new [Processor] given a [Receiver].
pub fn new<C: Clone + Send + 'static, R: Receiver<C> + Send + 'static>(
    receiver: R,
    context: C,
    config: Option<Config>,
) -> std::result::Result<Processor, Error> {
    let shutdown = Arc::new(Notify::new());
    let processor = tokio::spawn(process(
        receiver,
        context,
        config.unwrap_or_default(),
        shutdown.clone(),
    ));
    Ok(Processor {
        processor,
        shutdown,
    })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        in-process queue                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// FIFO, in-process implementation of [Sender] & [Receiver]
///
/// Tasks are held in submission order; a taken task moves to a checkout set until the processor
/// marks it complete. "Completion" here just forgets the cookie-- there is nothing to durably
/// update.
pub struct TaskQueue<C> {
    tasks: std::sync::Mutex<VecDeque<(Uuid, Box<dyn Task<C>>)>>,
    checkouts: std::sync::Mutex<HashSet<Uuid>>,
}

impl<C> TaskQueue<C> {
    pub fn new() -> TaskQueue<C> {
        TaskQueue {
            tasks: std::sync::Mutex::new(VecDeque::new()),
            checkouts: std::sync::Mutex::new(HashSet::new()),
        }
    }
    /// The number of tasks waiting to be picked-up (checked-out tasks excluded)
    pub fn depth(&self) -> usize {
        self.tasks.lock().unwrap(/* poisoning is fatal */).len()
    }
}

impl<C> Default for TaskQueue<C> {
    fn default() -> Self {
        TaskQueue::new()
    }
}

#[async_trait]
impl<C: Send, T: Task<C> + 'static> Sender<C, T> for TaskQueue<C> {
    async fn send(&self, task: T) -> Result<()> {
        self.tasks
            .lock()
            .unwrap(/* poisoning is fatal */)
            .push_back((Uuid::new_v4(), Box::new(task)));
        Ok(())
    }
}

#[async_trait]
impl<C: Send> Receiver<C> for TaskQueue<C> {
    type TaskId = Uuid;
    async fn mark_complete(&self, cookie: Self::TaskId) -> Result<()> {
        ensure!(
            self.checkouts
                .lock()
                .unwrap(/* poisoning is fatal */)
                .remove(&cookie),
            TaskIdSnafu
        );
        Ok(())
    }
    async fn take_task(&self) -> Result<Option<(Box<dyn Task<C>>, Self::TaskId)>> {
        let front = self.tasks.lock().unwrap(/* poisoning is fatal */).pop_front();
        match front {
            Some((cookie, task)) => {
                self.checkouts
                    .lock()
                    .unwrap(/* poisoning is fatal */)
                    .insert(cookie);
                Ok(Some((task, cookie)))
            }
            None => Ok(None),
        }
    }
}
