//! Background cache workers.
//!
//! One worker thread per cache owns every write into it; other threads
//! only submit requests (and read through the cache's lock-protected
//! tiers). The worker syncs after every `sync_step` processed items and
//! once more before it finalizes the cache on shutdown. A request being
//! processed runs to completion; stopping drops whatever is still queued.

use crossbeam_channel::{Receiver, Sender, unbounded};
use std::thread::JoinHandle;
use tracing::{debug, info};

/// A cache's side of the worker loop
pub trait CacheJob: Send + 'static {
    type Request: Send + 'static;

    /// Whether the cache already holds a fresh artifact for this request
    fn is_processed(&mut self, request: &Self::Request) -> bool;

    /// Produce and record the artifact; may return a follow-up request
    /// (the video cache re-queues a good-quality pass this way)
    fn process(&mut self, request: Self::Request) -> Option<Self::Request>;

    fn sync(&mut self);

    fn finalize(&mut self);
}

enum Command<R> {
    Process(R),
    SyncNow,
    Stop,
}

/// Owning worker thread for one cache
pub struct CacheWorker<R: Send + 'static> {
    sender: Sender<Command<R>>,
    handle: Option<JoinHandle<()>>,
}

impl<R: Send + 'static> CacheWorker<R> {
    pub fn spawn<J>(mut job: J, sync_step: usize) -> Self
    where
        J: CacheJob<Request = R>,
    {
        let (sender, receiver) = unbounded();
        let loop_sender = sender.clone();
        let handle = std::thread::spawn(move || {
            run(&mut job, &receiver, &loop_sender, sync_step.max(1));
            job.sync();
            job.finalize();
            info!("cache worker stopped");
        });

        Self {
            sender,
            handle: Some(handle),
        }
    }

    /// Queue a request; never blocks
    pub fn submit(&self, request: R) {
        let _ = self.sender.send(Command::Process(request));
    }

    /// Queue an out-of-band sync
    pub fn sync_now(&self) {
        let _ = self.sender.send(Command::SyncNow);
    }

    /// Stop the worker: pending requests are dropped, the cache gets a
    /// final sync and is finalized. Blocks until the thread exits.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.sender.send(Command::Stop);
            let _ = handle.join();
        }
    }
}

impl<R: Send + 'static> Drop for CacheWorker<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<J: CacheJob>(
    job: &mut J,
    receiver: &Receiver<Command<J::Request>>,
    loop_sender: &Sender<Command<J::Request>>,
    sync_step: usize,
) {
    let mut processed = 0usize;
    for command in receiver {
        match command {
            Command::Process(request) => {
                if job.is_processed(&request) {
                    debug!("request already satisfied");
                    continue;
                }
                if let Some(follow_up) = job.process(request) {
                    let _ = loop_sender.send(Command::Process(follow_up));
                }
                processed += 1;
                if processed % sync_step == 0 {
                    job.sync();
                }
            }
            Command::SyncNow => job.sync(),
            Command::Stop => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Log {
        processed: Vec<u32>,
        syncs: usize,
        finalized: bool,
    }

    struct StubJob {
        log: Arc<Mutex<Log>>,
        /// Requests with this value report as already processed
        skip: Option<u32>,
        /// Value whose processing schedules a follow-up
        chains: Option<u32>,
    }

    impl CacheJob for StubJob {
        type Request = u32;

        fn is_processed(&mut self, request: &u32) -> bool {
            self.skip == Some(*request)
        }

        fn process(&mut self, request: u32) -> Option<u32> {
            self.log.lock().processed.push(request);
            if self.chains == Some(request) {
                return Some(request + 1);
            }
            None
        }

        fn sync(&mut self) {
            self.log.lock().syncs += 1;
        }

        fn finalize(&mut self) {
            self.log.lock().finalized = true;
        }
    }

    fn stub(skip: Option<u32>, chains: Option<u32>) -> (Arc<Mutex<Log>>, StubJob) {
        let log = Arc::new(Mutex::new(Log::default()));
        let job = StubJob {
            log: Arc::clone(&log),
            skip,
            chains,
        };
        (log, job)
    }

    #[test]
    fn test_worker_processes_and_finalizes() {
        let (log, job) = stub(None, None);
        let worker = CacheWorker::spawn(job, 100);

        worker.submit(1);
        worker.submit(2);
        worker.stop();

        let log = log.lock();
        assert_eq!(log.processed, vec![1, 2]);
        // The final sync before finalize always runs
        assert_eq!(log.syncs, 1);
        assert!(log.finalized);
    }

    #[test]
    fn test_worker_syncs_every_step() {
        let (log, job) = stub(None, None);
        let worker = CacheWorker::spawn(job, 2);

        for i in 0..6 {
            worker.submit(i);
        }
        worker.stop();

        let log = log.lock();
        // Three step syncs plus the final one
        assert_eq!(log.syncs, 4);
    }

    #[test]
    fn test_worker_skips_satisfied_requests() {
        let (log, job) = stub(Some(7), None);
        let worker = CacheWorker::spawn(job, 100);

        worker.submit(7);
        worker.submit(8);
        worker.stop();

        assert_eq!(log.lock().processed, vec![8]);
    }

    #[test]
    fn test_follow_up_requests_are_processed() {
        let (log, job) = stub(None, Some(5));
        let worker = CacheWorker::spawn(job, 100);

        worker.submit(5);
        // Give the re-queued follow-up a chance to land before Stop
        worker.sync_now();
        std::thread::sleep(std::time::Duration::from_millis(50));
        worker.stop();

        assert_eq!(log.lock().processed, vec![5, 6]);
    }
}
