// SPDX-License-Identifier: CEPL-1.0
//! Bounded worker pool for the asset loading phase.
//!
//! Jobs go into a FIFO channel, a fixed number of scoped workers drain it, and the
//! caller blocks on a wait group until every worker has exited. Each job's
//! result lands in its own status slot; a failing or panicking job is logged and
//! recorded without disturbing its siblings.
use crate::error::AssetError;
use crossbeam_channel::Receiver;
use crossbeam_utils::sync::WaitGroup;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::thread;
use tracing::{debug, error};

#[derive(Debug)]
pub enum JobStatus<O> {
    Pending,
    InProgress,
    Complete(O),
    Failed(AssetError),
}

impl<O> JobStatus<O> {
    pub fn is_complete(&self) -> bool {
        matches!(self, JobStatus::Complete(_))
    }

    pub fn failure(&self) -> Option<&AssetError> {
        match self {
            JobStatus::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_output(self) -> Option<O> {
        match self {
            JobStatus::Complete(o) => Some(o),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    /// One worker per spare hardware thread, no more than there are jobs, at least one.
    pub fn for_jobs(job_count: usize) -> Self {
        let hw = thread::available_parallelism().map_or(1, |n| n.get());
        Self::with_workers(worker_count(hw, job_count))
    }

    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs every job and returns their statuses in submission order.
    pub fn run<J, O, F>(&self, jobs: Vec<J>, exec: F) -> Vec<JobStatus<O>>
    where
        J: Send,
        O: Send,
        F: Fn(J) -> Result<O, AssetError> + Sync,
    {
        if jobs.is_empty() {
            return Vec::new();
        }

        let slots: Vec<Mutex<JobStatus<O>>> =
            jobs.iter().map(|_| Mutex::new(JobStatus::Pending)).collect();
        let (tx, rx) = crossbeam_channel::unbounded();
        for job in jobs.into_iter().enumerate() {
            // the receiver outlives this loop
            let _ = tx.send(job);
        }
        drop(tx);

        let all_done = WaitGroup::new();
        thread::scope(|s| {
            for id in 0..self.workers {
                let rx = rx.clone();
                let (slots, exec) = (&slots, &exec);
                let done = all_done.clone();
                let spawned = thread::Builder::new()
                    .name(format!("asset-worker-{id}"))
                    .spawn_scoped(s, move || {
                        // released on exit, unwinding included
                        let _done = done;
                        drain(id, &rx, slots, exec);
                    });
                if let Err(e) = spawned {
                    error!(worker = id, error = %e, "failed to spawn asset worker");
                }
            }
            all_done.wait();
            // leftovers only exist if a spawn failed
            drain(usize::MAX, &rx, &slots, &exec);
        });

        slots
            .into_iter()
            .map(|m| m.into_inner().unwrap_or_else(PoisonError::into_inner))
            .collect()
    }
}

/// `min(hardware_threads - 1, jobs)`, never below one.
pub fn worker_count(hardware_threads: usize, job_count: usize) -> usize {
    hardware_threads.saturating_sub(1).min(job_count).max(1)
}

fn drain<J, O, F>(worker: usize, rx: &Receiver<(usize, J)>, slots: &[Mutex<JobStatus<O>>], exec: &F)
where
    F: Fn(J) -> Result<O, AssetError>,
{
    while let Ok((index, job)) = rx.recv() {
        set(&slots[index], JobStatus::InProgress);
        let status = match panic::catch_unwind(AssertUnwindSafe(|| exec(job))) {
            Ok(Ok(out)) => {
                debug!(worker, job = index, "job complete");
                JobStatus::Complete(out)
            }
            Ok(Err(e)) => {
                error!(worker, job = index, error = %e, "job failed");
                JobStatus::Failed(e)
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!(worker, job = index, panic = %msg, "job panicked");
                JobStatus::Failed(AssetError::Panicked(msg))
            }
        };
        set(&slots[index], status);
    }
}

fn set<O>(slot: &Mutex<JobStatus<O>>, status: JobStatus<O>) {
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = status;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
