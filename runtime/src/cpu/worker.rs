//! CPU worker pool
//!
//! Drives a CPU task's executor from a request FIFO. Thread sizing is
//! either static or dynamic: under dynamic mode the pool grows one thread
//! at a time while the sliding average queue depth exceeds the thread
//! count, and retires one thread after a sustained idle interval. A
//! retiring thread is asked to exit through a stop counter that one
//! sleeping thread claims on wake-up.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::{CpuExecutor, CpuIo, CpuIoMut};
use crate::error::{Error, Result};
use crate::request::Request;

/// Lower bound on threads per CPU task
pub const MIN_EACH_CPU_TASK_THREADS: usize = 1;
/// Upper bound on threads per CPU task
pub const MAX_EACH_CPU_TASK_THREADS: usize = 6;

const CONTROL_INTERVAL: Duration = Duration::from_millis(200);
const CONTROL_INTERVAL_TIGHT: Duration = Duration::from_millis(10);
const CONTROL_INTERVAL_RELAXED: Duration = Duration::from_millis(50);
const IDLE_INTERVAL: Duration = Duration::from_millis(500);

/// Called once per request with the executor's outcome
pub type CompletionFn = Arc<dyn Fn(Arc<Request>, Result<()>) + Send + Sync>;

struct DynamicCtrl {
    dynamic_threads: usize,
    load_history: VecDeque<usize>,
    sliding_sum: usize,
    last_control: Instant,
    control_interval: Duration,
    idle_start: Option<Instant>,
    next_thread_id: usize,
}

pub struct CpuWorker {
    name: String,
    executor: Arc<dyn CpuExecutor>,
    completion: CompletionFn,
    queue: Mutex<VecDeque<Arc<Request>>>,
    cv: Condvar,
    stop_flag: AtomicBool,
    dynamic_enabled: bool,
    static_threads: usize,
    /// Sliding window length: `buffer_count * device_num`
    window: usize,
    ctrl: Mutex<DynamicCtrl>,
    dynamic_stop: AtomicUsize,
    live_threads: AtomicUsize,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl CpuWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        name: impl Into<String>,
        executor: Arc<dyn CpuExecutor>,
        completion: CompletionFn,
        static_threads: usize,
        initial_dynamic_threads: usize,
        dynamic_enabled: bool,
        buffer_count: usize,
        device_num: usize,
    ) -> Arc<Self> {
        let static_threads = static_threads.max(MIN_EACH_CPU_TASK_THREADS);
        let worker = Arc::new(Self {
            name: name.into(),
            executor,
            completion,
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            stop_flag: AtomicBool::new(false),
            dynamic_enabled,
            static_threads,
            window: (buffer_count * device_num).max(1),
            ctrl: Mutex::new(DynamicCtrl {
                dynamic_threads: 0,
                load_history: VecDeque::new(),
                sliding_sum: 0,
                last_control: Instant::now(),
                control_interval: CONTROL_INTERVAL,
                idle_start: None,
                next_thread_id: static_threads,
            }),
            dynamic_stop: AtomicUsize::new(0),
            live_threads: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
        });
        for id in 0..static_threads {
            worker.spawn_thread(id, false);
        }
        if dynamic_enabled {
            let mut ctrl = worker.ctrl.lock();
            for _ in 0..initial_dynamic_threads {
                let id = ctrl.next_thread_id;
                ctrl.next_thread_id += 1;
                ctrl.dynamic_threads += 1;
                worker.spawn_thread(id, true);
            }
        }
        worker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Live worker threads right now (static plus dynamic)
    pub fn thread_count(&self) -> usize {
        self.live_threads.load(Ordering::Acquire)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    fn spawn_thread(self: &Arc<Self>, id: usize, dynamic: bool) {
        let worker = Arc::clone(self);
        worker.live_threads.fetch_add(1, Ordering::AcqRel);
        let handle = std::thread::Builder::new()
            .name(format!("{}_t{}", self.name, id))
            .spawn(move || worker.thread_work(id, dynamic))
            .expect("spawn cpu worker thread");
        self.threads.lock().push(handle);
    }

    fn thread_work(self: Arc<Self>, id: usize, dynamic: bool) {
        let tag = format!("{}_t{}", self.name, id);
        debug!(thread = %tag, dynamic, "cpu worker thread entry");
        loop {
            let req = {
                let mut queue = self.queue.lock();
                loop {
                    if dynamic {
                        let claimed = self
                            .dynamic_stop
                            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                                n.checked_sub(1)
                            })
                            .is_ok();
                        if claimed {
                            drop(queue);
                            self.live_threads.fetch_sub(1, Ordering::AcqRel);
                            debug!(thread = %tag, "dynamic thread retiring");
                            return;
                        }
                    }
                    if self.stop_flag.load(Ordering::Acquire) {
                        let drained: Vec<_> = queue.drain(..).collect();
                        drop(queue);
                        for req in drained {
                            (self.completion)(
                                req,
                                Err(Error::InvalidOperation("cpu worker stopped".into())),
                            );
                        }
                        self.live_threads.fetch_sub(1, Ordering::AcqRel);
                        debug!(thread = %tag, "cpu worker thread exit");
                        return;
                    }
                    if let Some(req) = queue.pop_front() {
                        break req;
                    }
                    self.cv.wait(&mut queue);
                }
            };
            req.set_processed_by(&tag);
            let result = self.run_one(&req);
            if let Err(e) = &result {
                warn!(thread = %tag, error = %e, "cpu executor failed");
            }
            (self.completion)(req, result);
        }
    }

    fn run_one(&self, req: &Arc<Request>) -> Result<()> {
        let inputs = req.inputs();
        let outputs = req.outputs();
        let in_views: Vec<CpuIo<'_>> = inputs
            .iter()
            .map(|t| {
                if t.data().is_null() {
                    return Err(Error::InvalidOperation(format!(
                        "input tensor '{}' is unbound",
                        t.name()
                    )));
                }
                Ok(CpuIo {
                    name: t.name(),
                    shape: t.shape(),
                    dtype: t.dtype(),
                    data: unsafe { t.as_slice() },
                })
            })
            .collect::<Result<_>>()?;
        let mut out_views: Vec<CpuIoMut<'_>> = outputs
            .iter()
            .map(|t| {
                if t.data().is_null() {
                    return Err(Error::InvalidOperation(format!(
                        "output tensor '{}' is unbound",
                        t.name()
                    )));
                }
                Ok(CpuIoMut {
                    name: t.name(),
                    shape: t.shape(),
                    dtype: t.dtype(),
                    data: unsafe { t.as_mut_slice() },
                })
            })
            .collect::<Result<_>>()?;
        self.executor.run(&in_views, &mut out_views)
    }

    /// Enqueue a request; under dynamic mode this is also where the thread
    /// controller samples queue load and resizes the pool.
    pub fn request(self: &Arc<Self>, req: Arc<Request>) -> Result<()> {
        if self.stop_flag.load(Ordering::Acquire) {
            return Err(Error::InvalidOperation("cpu worker stopped".into()));
        }
        if !self.dynamic_enabled {
            self.queue.lock().push_back(req);
            self.cv.notify_one();
            return Ok(());
        }

        let load = self.queue.lock().len();
        {
            let mut ctrl = self.ctrl.lock();
            ctrl.load_history.push_back(load);
            ctrl.sliding_sum += load;
            if ctrl.load_history.len() > self.window {
                if let Some(front) = ctrl.load_history.pop_front() {
                    ctrl.sliding_sum -= front;
                }
            }
            let avg_load = ctrl.sliding_sum / ctrl.load_history.len().max(1);
            let due = ctrl.last_control.elapsed() >= ctrl.control_interval;
            if due && ctrl.load_history.len() == self.window {
                let total = self.static_threads + ctrl.dynamic_threads;
                if avg_load > total {
                    if total < MAX_EACH_CPU_TASK_THREADS {
                        let id = ctrl.next_thread_id;
                        ctrl.next_thread_id += 1;
                        ctrl.dynamic_threads += 1;
                        self.spawn_thread(id, true);
                        debug!(
                            worker = %self.name,
                            threads = self.static_threads + ctrl.dynamic_threads,
                            avg_load,
                            "grew cpu worker pool"
                        );
                        ctrl.control_interval = CONTROL_INTERVAL_TIGHT;
                        ctrl.last_control = Instant::now();
                    }
                } else if avg_load == 0 {
                    let idle_since = *ctrl.idle_start.get_or_insert_with(Instant::now);
                    if idle_since.elapsed() > IDLE_INTERVAL
                        && ctrl.dynamic_threads > 0
                        && self.static_threads + ctrl.dynamic_threads > MIN_EACH_CPU_TASK_THREADS
                    {
                        ctrl.dynamic_threads -= 1;
                        self.dynamic_stop.fetch_add(1, Ordering::AcqRel);
                        self.cv.notify_all();
                        debug!(
                            worker = %self.name,
                            threads = self.static_threads + ctrl.dynamic_threads,
                            "retiring one cpu worker thread"
                        );
                        ctrl.idle_start = None;
                        ctrl.control_interval = CONTROL_INTERVAL_TIGHT;
                        ctrl.last_control = Instant::now();
                    }
                } else {
                    ctrl.idle_start = None;
                    ctrl.control_interval = CONTROL_INTERVAL_RELAXED;
                }
            }
        }
        self.queue.lock().push_back(req);
        self.cv.notify_one();
        Ok(())
    }

    /// Stop every thread; queued requests complete with an error.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        self.cv.notify_all();
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuExecutor;

    struct Nop;

    impl CpuExecutor for Nop {
        fn run(&self, _inputs: &[CpuIo<'_>], _outputs: &mut [CpuIoMut<'_>]) -> Result<()> {
            Ok(())
        }
    }

    fn idle_worker(dynamic: bool, initial_dynamic: usize) -> Arc<CpuWorker> {
        CpuWorker::start(
            "test",
            Arc::new(Nop),
            Arc::new(|_req, _result| {}),
            1,
            initial_dynamic,
            dynamic,
            2,
            1,
        )
    }

    #[test]
    fn test_static_thread_count() {
        let worker = idle_worker(false, 0);
        assert_eq!(worker.thread_count(), 1);
        worker.stop();
        assert_eq!(worker.thread_count(), 0);
    }

    #[test]
    fn test_initial_dynamic_threads_spawned() {
        let worker = idle_worker(true, 2);
        assert_eq!(worker.thread_count(), 3);
        worker.stop();
    }

    #[test]
    fn test_request_after_stop_rejected() {
        let worker = idle_worker(false, 0);
        worker.stop();
        let pool = crate::request::RequestPool::new(1);
        let req = pool.pick().unwrap();
        assert!(worker.request(req).is_err());
    }
}
