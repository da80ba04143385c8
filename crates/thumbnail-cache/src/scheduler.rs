//! Production scheduler for background thumbnailing
//!
//! One job per directory listing: a rayon pool classifies every source by
//! cache state (hits are reported immediately), then misses and
//! low-quality entries are produced by spawning one out-of-process child
//! at a time, so a crashing decoder never takes the browser down.
//!
//! A directory change restarts the scheduler: the outstanding child is
//! killed, the queue is discarded, and the new listing is classified from
//! scratch. Workers check the cancellation flag at entry and before every
//! event, so no event of the old job is emitted after a restart.

use crate::{lookup::lookup, Environment, ThumbnailSize};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// One source file of a directory listing, as reported by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub uri: String,
    pub mtime: i64,
    pub size: u64,
}

/// Scheduler-to-browser notifications, identified by URI because
/// production completes out of order relative to rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThumbnailEvent {
    /// A thumbnail is available for the URI.
    Ready { uri: String, low_quality: bool },
    /// The URI could not be thumbnailed; its placeholder stays.
    Failed { uri: String },
    /// The whole job ran to completion without being cancelled.
    Finished,
}

enum CacheState {
    Hit { low_quality: bool },
    LowQuality,
    Missing,
    Skipped,
}

/// Drives thumbnail production for the current directory.
pub struct ProductionScheduler {
    env: Environment,
    child_exe: PathBuf,
    events: Sender<ThumbnailEvent>,
    current: Mutex<Option<JobHandle>>,
}

struct JobHandle {
    cancel: Arc<AtomicBool>,
    child: Arc<Mutex<Option<Child>>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ProductionScheduler {
    /// `child_exe` is the producer binary, normally
    /// `std::env::current_exe()`, invoked as
    /// `<exe> --thumbnail <tag> -- <uri>`.
    pub fn new(env: Environment, child_exe: PathBuf, events: Sender<ThumbnailEvent>) -> Self {
        Self {
            env,
            child_exe,
            events,
            current: Mutex::new(None),
        }
    }

    /// Cancel whatever is outstanding and schedule a fresh listing.
    pub fn restart(&self, sources: Vec<SourceEntry>, size: ThumbnailSize) {
        self.cancel();

        let cancel = Arc::new(AtomicBool::new(false));
        let child = Arc::new(Mutex::new(None));
        let worker = Worker {
            env: self.env.clone(),
            child_exe: self.child_exe.clone(),
            events: self.events.clone(),
            cancel: Arc::clone(&cancel),
            child: Arc::clone(&child),
        };
        let thread = thread::spawn(move || worker.run(sources, size));

        *self.current.lock() = Some(JobHandle {
            cancel,
            child,
            thread: Some(thread),
        });
    }

    /// Kill the outstanding child, discard the queue, and wait for the
    /// worker to wind down. Idempotent.
    pub fn cancel(&self) {
        let handle = self.current.lock().take();
        if let Some(mut handle) = handle {
            handle.cancel.store(true, Ordering::Relaxed);
            if let Some(child) = handle.child.lock().as_mut() {
                // The wait loop reaps the killed child.
                let _ = child.kill();
            }
            if let Some(thread) = handle.thread.take() {
                let _ = thread.join();
            }
        }
    }

    /// Block until the current job finishes, without cancelling it.
    pub fn wait(&self) {
        let thread = self.current.lock().as_mut().and_then(|h| h.thread.take());
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .and_then(|h| h.thread.as_ref())
            .is_some_and(|t| !t.is_finished())
    }
}

impl Drop for ProductionScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct Worker {
    env: Environment,
    child_exe: PathBuf,
    events: Sender<ThumbnailEvent>,
    cancel: Arc<AtomicBool>,
    child: Arc<Mutex<Option<Child>>>,
}

impl Worker {
    fn run(&self, sources: Vec<SourceEntry>, size: ThumbnailSize) {
        // Parallel lookup pass; one source per task, no shared state. The
        // closure borrows only Sync parts of the worker.
        let env = &self.env;
        let cancel = &self.cancel;
        let states: Vec<CacheState> = sources
            .par_iter()
            .map(|entry| {
                if cancel.load(Ordering::Relaxed) {
                    return CacheState::Skipped;
                }
                match lookup(env, &entry.uri, entry.mtime, size) {
                    Some(raster) if !raster.meta.low_quality => {
                        CacheState::Hit { low_quality: false }
                    }
                    Some(_) => CacheState::LowQuality,
                    None => CacheState::Missing,
                }
            })
            .collect();

        // Report hits in listing order; queue misses ahead of low-quality
        // upgrades so placeholders disappear first.
        let mut missing = Vec::new();
        let mut upgrades = Vec::new();
        for (entry, state) in sources.iter().zip(&states) {
            match state {
                CacheState::Hit { low_quality } => {
                    if !self.emit(ThumbnailEvent::Ready {
                        uri: entry.uri.clone(),
                        low_quality: *low_quality,
                    }) {
                        return;
                    }
                }
                CacheState::Missing => missing.push(entry),
                CacheState::LowQuality => upgrades.push(entry),
                CacheState::Skipped => {}
            }
        }

        for entry in missing.into_iter().chain(upgrades) {
            if self.cancel.load(Ordering::Relaxed) {
                return;
            }
            self.produce_via_child(entry, size);
        }

        self.emit(ThumbnailEvent::Finished);
    }

    /// Spawn the producer child for one source and translate its exit
    /// into an event. Exactly one child is alive at any moment.
    fn produce_via_child(&self, entry: &SourceEntry, size: ThumbnailSize) {
        let spawned = Command::new(&self.child_exe)
            .arg("--thumbnail")
            .arg(size.tag())
            .arg("--")
            .arg(&entry.uri)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let child = match spawned {
            Ok(child) => child,
            Err(err) => {
                warn!(uri = %entry.uri, %err, "cannot spawn producer child");
                self.emit(ThumbnailEvent::Failed { uri: entry.uri.clone() });
                return;
            }
        };
        *self.child.lock() = Some(child);

        let status = self.reap_child();
        if self.cancel.load(Ordering::Relaxed) {
            return;
        }
        match status {
            Some(status) if status.success() => {
                debug!(uri = %entry.uri, "producer child succeeded");
                match lookup(&self.env, &entry.uri, entry.mtime, size) {
                    Some(raster) => {
                        self.emit(ThumbnailEvent::Ready {
                            uri: entry.uri.clone(),
                            low_quality: raster.meta.low_quality,
                        });
                    }
                    None => {
                        warn!(uri = %entry.uri, "child reported success but lookup misses");
                        self.emit(ThumbnailEvent::Failed { uri: entry.uri.clone() });
                    }
                }
            }
            Some(status) => {
                warn!(uri = %entry.uri, ?status, "producer child failed");
                self.emit(ThumbnailEvent::Failed { uri: entry.uri.clone() });
            }
            None => {
                self.emit(ThumbnailEvent::Failed { uri: entry.uri.clone() });
            }
        }
    }

    /// Poll the shared child slot until the child exits. The slot is only
    /// locked briefly per poll so `cancel()` can kill concurrently.
    fn reap_child(&self) -> Option<std::process::ExitStatus> {
        loop {
            {
                let mut slot = self.child.lock();
                let child = slot.as_mut()?;
                match child.try_wait() {
                    Ok(Some(status)) => {
                        *slot = None;
                        return Some(status);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(%err, "cannot wait on producer child");
                        let _ = child.kill();
                        *slot = None;
                        return None;
                    }
                }
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Send an event unless the job was cancelled. Returns false when the
    /// worker should stop (cancelled or receiver gone).
    fn emit(&self, event: ThumbnailEvent) -> bool {
        if self.cancel.load(Ordering::Relaxed) {
            return false;
        }
        self.events.send(event).is_ok()
    }
}
