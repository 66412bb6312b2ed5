//! # Ordered Concurrent Pipeline
//!
//! [`Synchronizer`] runs many independent units of work concurrently while
//! releasing the *ordered* half of each unit strictly in submission order.
//!
//! Every unit submitted through [`Synchronizer::add_link`] receives a [`Task`]
//! handle and is split by the caller into two phases:
//!
//! - **Unordered phase**: everything before [`Task::wait`]. Runs immediately
//!   and concurrently with every other admitted unit, typically a network
//!   fetch.
//! - **Ordered phase**: everything after [`Task::wait`] returns `false`. The
//!   ordered phase of unit *i + 1* never starts before the ordered phase of
//!   unit *i* has returned.
//!
//! ```rust,ignore
//! let sync = Synchronizer::new(25);
//! for height in from..=to {
//!     sync.add_link(move |mut task| async move {
//!         let block = node.get_block_by_height(height).await;
//!         if task.wait().await {
//!             return;
//!         }
//!         commit(block).await;
//!     })
//!     .await;
//! }
//! let aborted = sync.finish().await;
//! ```
//!
//! ## Admission
//!
//! At most `max_concurrent` units may be between submission and the end of
//! their ordered phase. `add_link` suspends the *submitter* until a slot frees
//! up; running units are never throttled.
//!
//! ## Abort contract
//!
//! [`Task::abort`] is cooperative and one-way. It never interrupts a unit that
//! is already past `wait`, and it never cancels in-flight unordered work: that
//! work runs to completion and its result is discarded when `wait` returns
//! `true`. Unordered phases must therefore be free of side effects until their
//! result is consumed in the ordered phase.
//!
//! After an abort:
//! - every unit not yet released, including the aborting unit itself, gets
//!   `true` from `wait` and must skip its ordered phase;
//! - `add_link` admits nothing more and returns `false`;
//! - [`Synchronizer::finish`] still waits for every admitted unit and reports
//!   `true`.
//!
//! Completion is signalled when the `Task` is dropped, so a unit that returns
//! early (or panics) can never stall the pipeline.

use log::{debug, error, trace};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

/// Sequencer-side half of a submitted unit.
struct Link {
    position: u64,
    release: oneshot::Sender<bool>,
    done: oneshot::Receiver<()>,
}

/// Handle owned by one unit of pipelined work.
pub struct Task {
    position: u64,
    release: Option<oneshot::Receiver<bool>>,
    closed: bool,
    aborted_here: AtomicBool,
    abort: Arc<watch::Sender<bool>>,
    // Dropped with the task: completion signal first, then the admission slot.
    _done: oneshot::Sender<()>,
    _permit: OwnedSemaphorePermit,
}

impl Task {
    /// Submission index of this unit within its pipeline.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Block until every earlier unit has finished its ordered phase, or the
    /// pipeline has been aborted.
    ///
    /// Returns `true` when the unit was released because of an abort, or
    /// when this task aborted the pipeline itself; the caller must then return
    /// without running its ordered phase.
    pub async fn wait(&mut self) -> bool {
        if let Some(release) = self.release.take() {
            // A vanished sequencer can only mean the pipeline was torn down.
            self.closed = release.await.unwrap_or(true);
        }
        self.closed || self.aborted_here.load(Ordering::SeqCst)
    }

    /// Stop the whole pipeline from starting any further ordered phase.
    ///
    /// Idempotent; only the first call across all tasks has an effect.
    pub fn abort(&self) {
        self.aborted_here.store(true, Ordering::SeqCst);
        if trigger_abort(&self.abort) {
            debug!("pipeline aborted by task {}", self.position);
        }
    }

    /// Whether this task was released because of an abort.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

fn trigger_abort(abort: &watch::Sender<bool>) -> bool {
    abort.send_if_modified(|aborted| {
        if *aborted {
            false
        } else {
            *aborted = true;
            true
        }
    })
}

/// Ordered concurrent pipeline. See the [module docs](self).
pub struct Synchronizer {
    queue: mpsc::UnboundedSender<Link>,
    admission: Arc<Semaphore>,
    abort: Arc<watch::Sender<bool>>,
    sequencer: JoinHandle<()>,
    submitted: AtomicU64,
    max_concurrent: usize,
}

impl Synchronizer {
    /// Create a pipeline admitting at most `max_concurrent` outstanding units.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let (queue, pending) = mpsc::unbounded_channel();
        let (abort, _) = watch::channel(false);
        let abort = Arc::new(abort);
        let sequencer = tokio::spawn(sequence(pending, abort.clone()));

        Self {
            queue,
            admission: Arc::new(Semaphore::new(max_concurrent)),
            abort,
            sequencer,
            submitted: AtomicU64::new(0),
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Submit one unit of work.
    ///
    /// Suspends while `max_concurrent` units are outstanding. Once admitted
    /// the unit is spawned and this call returns without waiting for it.
    /// Returns `false` if the pipeline was aborted before admission, in which
    /// case `work` is never run.
    pub async fn add_link<F, Fut>(&self, work: F) -> bool
    where
        F: FnOnce(Task) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut aborted = self.abort.subscribe();
        let permit = tokio::select! {
            permit = self.admission.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
            _ = aborted.wait_for(|aborted| *aborted) => return false,
        };

        // Re-check after winning a slot; an abort may have raced the acquire.
        if self.is_aborted() {
            return false;
        }

        let position = self.submitted.fetch_add(1, Ordering::SeqCst);
        let (release_tx, release_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        let task = Task {
            position,
            release: Some(release_rx),
            closed: false,
            aborted_here: AtomicBool::new(false),
            abort: self.abort.clone(),
            _done: done_tx,
            _permit: permit,
        };

        // Enqueue before spawning so queue order is submission order.
        if self
            .queue
            .send(Link {
                position,
                release: release_tx,
                done: done_rx,
            })
            .is_err()
        {
            error!("pipeline sequencer is gone; dropping task {}", position);
            return false;
        }

        tokio::spawn(work(task));
        true
    }

    /// Abort the pipeline from outside any task.
    pub fn abort(&self) {
        if trigger_abort(&self.abort) {
            debug!("pipeline aborted by owner");
        }
    }

    pub fn is_aborted(&self) -> bool {
        *self.abort.borrow()
    }

    /// Number of units admitted so far.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    /// Close the pipeline and wait for every admitted unit to complete.
    ///
    /// Returns whether an abort happened during the run.
    pub async fn finish(self) -> bool {
        let Synchronizer {
            queue,
            abort,
            sequencer,
            ..
        } = self;

        drop(queue);
        if let Err(e) = sequencer.await {
            error!("pipeline sequencer failed: {}", e);
        }

        let aborted = *abort.borrow();
        aborted
    }
}

/// Release units one at a time in submission order.
///
/// A unit released normally is awaited to completion before the next one is
/// looked at; once aborted, remaining units are released closed immediately
/// and only collected at the end.
async fn sequence(mut pending: mpsc::UnboundedReceiver<Link>, abort: Arc<watch::Sender<bool>>) {
    let mut closed = Vec::new();

    while let Some(link) = pending.recv().await {
        if *abort.borrow() {
            if link.release.send(true).is_err() {
                trace!("task {} finished before release", link.position);
            }
            closed.push(link.done);
            continue;
        }

        if link.release.send(false).is_err() {
            trace!("task {} finished before release", link.position);
        }
        // Err means the sender was dropped, which is exactly "task done".
        let _ = link.done.await;
    }

    for done in closed {
        let _ = done.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::sleep;

    fn jitter(max_ms: u64) -> Duration {
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ordered_phases_follow_submission_order() {
        let sync = Synchronizer::new(8);
        let order = Arc::new(Mutex::new(Vec::new()));
        let in_ordered = Arc::new(AtomicBool::new(false));

        for i in 0..64usize {
            let order = order.clone();
            let in_ordered = in_ordered.clone();
            let delay = jitter(15);
            sync.add_link(move |mut task| async move {
                sleep(delay).await;
                if task.wait().await {
                    return;
                }
                assert!(
                    !in_ordered.swap(true, Ordering::SeqCst),
                    "ordered phases overlapped at {}",
                    i
                );
                order.lock().unwrap().push(i);
                sleep(jitter(2)).await;
                in_ordered.store(false, Ordering::SeqCst);
            })
            .await;
        }

        assert!(!sync.finish().await);
        let order = order.lock().unwrap();
        assert_eq!(*order, (0..64).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_admission_is_bounded() {
        let sync = Synchronizer::new(3);
        let k = sync.max_concurrent();
        let outstanding = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..40 {
            let outstanding = outstanding.clone();
            let peak = peak.clone();
            let delay = jitter(5);
            sync.add_link(move |mut task| async move {
                let now = outstanding.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(delay).await;
                if !task.wait().await {
                    sleep(Duration::from_millis(1)).await;
                }
                outstanding.fetch_sub(1, Ordering::SeqCst);
            })
            .await;
        }

        assert!(!sync.finish().await);
        assert!(peak.load(Ordering::SeqCst) <= k);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_abort_in_unordered_phase_closes_self_and_successors() {
        let sync = Synchronizer::new(32);
        let ran = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(Vec::new()));
        let (ninth_done_tx, ninth_done_rx) = oneshot::channel::<()>();
        let mut ninth_done_tx = Some(ninth_done_tx);
        let mut ninth_done_rx = Some(ninth_done_rx);

        for i in 0..20usize {
            let ran = ran.clone();
            let closed = closed.clone();
            let notify_done = if i == 9 { ninth_done_tx.take() } else { None };
            let await_ninth = if i == 10 { ninth_done_rx.take() } else { None };
            sync.add_link(move |mut task| async move {
                if let Some(ninth) = await_ninth {
                    let _ = ninth.await;
                    task.abort();
                }
                if task.wait().await {
                    closed.lock().unwrap().push(i);
                    return;
                }
                ran.lock().unwrap().push(i);
                if let Some(done) = notify_done {
                    let _ = done.send(());
                }
            })
            .await;
        }

        assert!(sync.finish().await);
        assert_eq!(*ran.lock().unwrap(), (0..10).collect::<Vec<_>>());
        let mut closed = closed.lock().unwrap().clone();
        closed.sort();
        assert_eq!(closed, (10..20).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_abort_does_not_interrupt_running_ordered_phase() {
        let sync = Synchronizer::new(4);
        let completed = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10usize {
            let completed = completed.clone();
            sync.add_link(move |mut task| async move {
                if task.wait().await {
                    return;
                }
                if i == 5 {
                    task.abort();
                    sleep(Duration::from_millis(5)).await;
                }
                completed.lock().unwrap().push(i);
            })
            .await;
        }

        assert!(sync.finish().await);
        assert_eq!(*completed.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_finish_waits_for_every_task() {
        let sync = Synchronizer::new(5);
        let finished = Arc::new(AtomicUsize::new(0));

        for i in 0..25u64 {
            let finished = finished.clone();
            sync.add_link(move |mut task| async move {
                sleep(Duration::from_millis(25 - i)).await;
                let _ = task.wait().await;
                finished.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }

        assert!(!sync.finish().await);
        assert_eq!(finished.load(Ordering::SeqCst), 25);
    }

    #[tokio::test]
    async fn test_finish_on_empty_pipeline() {
        let sync = Synchronizer::new(10);
        assert!(!sync.finish().await);
    }

    #[tokio::test]
    async fn test_zero_concurrency_admits_one() {
        let sync = Synchronizer::new(0);
        assert_eq!(sync.max_concurrent(), 1);

        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let ran = ran.clone();
            assert!(
                sync.add_link(move |mut task| async move {
                    if !task.wait().await {
                        ran.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .await
            );
        }
        assert!(!sync.finish().await);
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_add_link_refused_after_abort() {
        let sync = Synchronizer::new(2);
        sync.abort();
        sync.abort();
        let admitted = sync.add_link(|_task| async {}).await;
        assert!(!admitted);
        assert_eq!(sync.submitted(), 0);
        assert!(sync.finish().await);
    }

    #[tokio::test]
    async fn test_blocked_submitter_released_by_abort() {
        let sync = Arc::new(Synchronizer::new(1));
        let (hold_tx, hold_rx) = oneshot::channel::<()>();

        assert!(
            sync.add_link(move |_task| async move {
                let _ = hold_rx.await;
            })
            .await
        );

        let submitter = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.add_link(|_task| async {}).await })
        };

        sleep(Duration::from_millis(10)).await;
        sync.abort();
        assert!(!submitter.await.unwrap());
        let _ = hold_tx.send(());

        let sync = Arc::try_unwrap(sync).ok().expect("single owner");
        assert!(sync.finish().await);
    }

    #[tokio::test]
    async fn test_early_return_does_not_stall_pipeline() {
        let sync = Synchronizer::new(2);
        let ran = Arc::new(AtomicUsize::new(0));

        for i in 0..6usize {
            let ran = ran.clone();
            sync.add_link(move |mut task| async move {
                // Odd units bail out without ever reaching the barrier.
                if i % 2 == 1 {
                    return;
                }
                if !task.wait().await {
                    ran.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
        }

        assert!(!sync.finish().await);
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }
}
