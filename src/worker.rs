// src/worker.rs
//
// Per-channel worker threads for channel-multithreaded mode.
//
// Each worker runs one channel's frame work when signaled. The scheduler
// drives a four-phase handshake per frame:
//
//   IDLE -> WORK_REQUESTED   scheduler sets dt and wakes the worker
//   WORK_REQUESTED -> WORKING worker picks the request up
//   WORKING -> WORK_DONE      worker finished channel.loop_frame(dt)
//   WORK_DONE -> IDLE         scheduler collects the result
//
// Workers complete in any order; the scheduler collects all of them
// before the mixer runs. Interruption ends the worker loop at its next
// wait.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::channel::ChannelCore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerPhase {
    Idle,
    WorkRequested,
    Working,
    WorkDone,
}

struct WorkerState {
    phase: WorkerPhase,
    delta_ms: f64,
}

struct WorkerSignal {
    state: Mutex<WorkerState>,
    /// Worker waits here for WORK_REQUESTED.
    work_cv: Condvar,
    /// Scheduler waits here for WORK_DONE.
    done_cv: Condvar,
    interrupt: AtomicBool,
}

/// Handle to one channel's worker thread. Started lazily on first use;
/// dropping the handle interrupts and joins the thread.
pub struct ChannelWorker {
    signal: Arc<WorkerSignal>,
    handle: Option<JoinHandle<()>>,
}

impl ChannelWorker {
    pub fn start(label: &str, core: Arc<Mutex<ChannelCore>>) -> Self {
        let signal = Arc::new(WorkerSignal {
            state: Mutex::new(WorkerState {
                phase: WorkerPhase::Idle,
                delta_ms: 0.0,
            }),
            work_cv: Condvar::new(),
            done_cv: Condvar::new(),
            interrupt: AtomicBool::new(false),
        });

        let thread_signal = Arc::clone(&signal);
        let thread_name = format!("channel-{label}");
        debug!("starting channel worker '{thread_name}'");
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker_loop(thread_signal, core))
            .expect("failed to spawn channel worker");

        Self {
            signal,
            handle: Some(handle),
        }
    }

    /// Hand the worker this frame's scaled delta and wake it.
    pub fn request(&self, delta_ms: f64) {
        let mut state = self.signal.state.lock();
        debug_assert_eq!(state.phase, WorkerPhase::Idle, "worker already busy");
        state.phase = WorkerPhase::WorkRequested;
        state.delta_ms = delta_ms;
        self.signal.work_cv.notify_one();
    }

    /// Block until the worker reports WORK_DONE, then return it to IDLE.
    pub fn collect(&self) {
        let mut state = self.signal.state.lock();
        while state.phase != WorkerPhase::WorkDone {
            self.signal.done_cv.wait(&mut state);
        }
        state.phase = WorkerPhase::Idle;
    }
}

impl Drop for ChannelWorker {
    fn drop(&mut self) {
        self.signal.interrupt.store(true, Ordering::Release);
        self.signal.work_cv.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(signal: Arc<WorkerSignal>, core: Arc<Mutex<ChannelCore>>) {
    loop {
        let delta_ms = {
            let mut state = signal.state.lock();
            while state.phase != WorkerPhase::WorkRequested {
                if signal.interrupt.load(Ordering::Acquire) {
                    return;
                }
                signal.work_cv.wait(&mut state);
            }
            if signal.interrupt.load(Ordering::Acquire) {
                return;
            }
            state.phase = WorkerPhase::Working;
            state.delta_ms
        };

        core.lock().loop_frame(delta_ms);

        let mut state = signal.state.lock();
        state.phase = WorkerPhase::WorkDone;
        signal.done_cv.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blend::channel_blends;
    use crate::color::rgb;
    use crate::pattern::{Pattern, SolidPattern};

    #[test]
    fn test_worker_runs_frame_work() {
        let core = Arc::new(Mutex::new(ChannelCore::new(
            0,
            "worker-test",
            16,
            channel_blends(),
            vec![Box::new(SolidPattern::new(rgb(1, 2, 3)))],
        )));

        let worker = ChannelWorker::start("worker-test", Arc::clone(&core));
        for _ in 0..3 {
            worker.request(16.0);
            worker.collect();
        }
        drop(worker);

        let core = core.lock();
        assert!(core.is_animating());
        assert!(core.colors().iter().all(|&c| c == rgb(1, 2, 3)));
    }

    #[test]
    fn test_workers_collect_out_of_order() {
        let cores: Vec<_> = (0..4)
            .map(|i| {
                Arc::new(Mutex::new(ChannelCore::new(
                    i,
                    format!("ch-{i}"),
                    16,
                    channel_blends(),
                    vec![Box::new(SolidPattern::new(rgb(i as u8, 0, 0))) as Box<dyn Pattern>],
                )))
            })
            .collect();
        let workers: Vec<_> = cores
            .iter()
            .enumerate()
            .map(|(i, core)| ChannelWorker::start(&format!("ch-{i}"), Arc::clone(core)))
            .collect();

        for worker in &workers {
            worker.request(16.0);
        }
        // Collect in reverse of request order.
        for worker in workers.iter().rev() {
            worker.collect();
        }

        for core in &cores {
            assert!(core.lock().is_animating());
        }
    }
}
