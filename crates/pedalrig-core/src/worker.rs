//! Background worker for long-running plugin requests.
//!
//! One thread, strict FIFO. Plugins ask for file loads or preset parses
//! through the host, the host posts a job here, and the result re-enters the
//! engine through ordinary control-plane calls. The realtime thread never
//! touches this queue.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run(Job),
    Shutdown,
}

/// Handle to the worker thread. Dropping it shuts the worker down: the job
/// in flight completes, queued jobs are dropped.
pub struct Worker {
    sender: Sender<Command>,
    shutting_down: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn() -> Self {
        let (sender, receiver) = unbounded::<Command>();
        let shutting_down = Arc::new(AtomicBool::new(false));
        let thread_flag = shutting_down.clone();

        let handle = std::thread::Builder::new()
            .name("pedalrigWorker".into())
            .spawn(move || worker_loop(&receiver, &thread_flag))
            .expect("failed to spawn worker thread");

        Self {
            sender,
            shutting_down,
            handle: Some(handle),
        }
    }

    /// Enqueues a job. Non-blocking; jobs run in post order.
    pub fn post<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let _ = self.sender.send(Command::Run(Box::new(job)));
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::Release);
        let _ = self.sender.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(receiver: &Receiver<Command>, shutting_down: &AtomicBool) {
    tracing::debug!("worker thread started");
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Run(job) => {
                if shutting_down.load(Ordering::Acquire) {
                    break;
                }
                job();
            }
            Command::Shutdown => break,
        }
    }
    tracing::debug!("worker thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_in_fifo_order() {
        let worker = Worker::spawn();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let order = order.clone();
            worker.post(move || order.lock().unwrap().push(i));
        }
        // FIFO: once the sentinel job has run, everything before it has too.
        let (tx, rx) = crossbeam_channel::bounded(1);
        worker.post(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        drop(worker);

        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_in_flight_job_completes_on_shutdown() {
        let worker = Worker::spawn();
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        worker.post(move || {
            std::thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::Release);
        });
        std::thread::sleep(Duration::from_millis(10));
        drop(worker);
        assert!(done.load(Ordering::Acquire));
    }

    #[test]
    fn test_post_after_shutdown_is_ignored() {
        let worker = Worker::spawn();
        worker.shutting_down.store(true, Ordering::Release);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        worker.post(move || flag.store(true, Ordering::Release));
        drop(worker);
        assert!(!ran.load(Ordering::Acquire));
    }
}
