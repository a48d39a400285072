//! Task Queue and Worker Pool
//!
//! Ready tasks go through one unbounded crossbeam channel. Worker threads
//! block on it; with no workers the owner drains it inline.

use std::sync::Weak;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use tracing::{debug, info};

use crate::cache::{CacheManager, Id};
use crate::error::{Error, Result};

/// Message on the task channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Job {
    Run(Id),
    Stop,
}

/// FIFO of ready tasks
#[derive(Debug)]
pub(crate) struct TaskQueue {
    sender: Sender<Job>,
    receiver: Receiver<Job>,
}

impl TaskQueue {
    pub fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        Self { sender, receiver }
    }

    pub fn push(&self, task: Id) {
        // Cannot fail: the queue owns a receiver
        let _ = self.sender.send(Job::Run(task));
    }

    /// Next ready task without blocking
    pub fn try_pop(&self) -> Option<Id> {
        match self.receiver.try_recv() {
            Ok(Job::Run(task)) => Some(task),
            Ok(Job::Stop) => {
                // Belongs to a worker
                let _ = self.sender.send(Job::Stop);
                None
            }
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Discard every queued task, returning how many were dropped
    pub fn drain(&self) -> usize {
        let mut dropped = 0;
        while let Some(_task) = self.try_pop() {
            dropped += 1;
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn receiver(&self) -> Receiver<Job> {
        self.receiver.clone()
    }

    /// Ask `workers` workers to exit
    pub fn stop(&self, workers: usize) {
        for _ in 0..workers {
            let _ = self.sender.send(Job::Stop);
        }
    }
}

/// OS threads executing queued tasks
#[derive(Debug)]
pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `count` workers that execute tasks on `cache` while it is alive
    pub fn spawn(count: usize, receiver: Receiver<Job>, cache: Weak<CacheManager>) -> Result<Self> {
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let receiver = receiver.clone();
            let cache = cache.clone();
            let handle = thread::Builder::new()
                .name(format!("nedata-worker-{}", index))
                .spawn(move || worker_loop(index, receiver, cache))
                .map_err(|e| Error::Worker(format!("failed to spawn worker {}: {}", index, e)))?;
            handles.push(handle);
        }
        info!(workers = count, "Started task workers");
        Ok(Self { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to exit; a worker never joins itself
    pub fn join(self) {
        let current = thread::current().id();
        for handle in self.handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

fn worker_loop(index: usize, receiver: Receiver<Job>, cache: Weak<CacheManager>) {
    while let Ok(job) = receiver.recv() {
        match job {
            Job::Run(task) => match cache.upgrade() {
                Some(cache) => cache.execute_task(task),
                None => break,
            },
            Job::Stop => break,
        }
    }
    debug!(worker = index, "Worker stopped");
}

// =============================================================================
// Tests
// =============================================================================
