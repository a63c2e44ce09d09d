//! Per-thread work queue (C9): hands a closure to the thread that owns a
//! given epoll instance, either blocking for its result (`call`) or firing
//! it and moving on (`submit`).
//!
//! The original linked a `list_head` of `priskv_work` nodes behind a
//! spinlock and wrote to an `eventfd` to wake the owning thread; here the
//! inbox itself is an `mpsc` channel (the idiomatic Rust replacement for a
//! locked intrusive list) and the `eventfd` is kept only so the queue can
//! still be registered as just another fd on the owning thread's epoll.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::EngineError;
use crate::event::EventDispatcher;

type Job = Box<dyn FnOnce() -> i32 + Send>;

enum Item {
    Sync {
        job: Job,
        result: Arc<(Mutex<Option<i32>>, Condvar)>,
    },
    Async {
        job: Job,
    },
}

pub struct WorkQueue {
    sender: Sender<Item>,
    receiver: Mutex<Receiver<Item>>,
    eventfd: RawFd,
}

impl WorkQueue {
    pub fn new() -> Result<Arc<Self>, EngineError> {
        let (sender, receiver) = channel();
        let eventfd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if eventfd < 0 {
            return Err(EngineError::Io(io::Error::last_os_error()));
        }
        Ok(Arc::new(WorkQueue {
            sender,
            receiver: Mutex::new(receiver),
            eventfd,
        }))
    }

    /// Register this queue's wakeup fd on the owning thread's dispatcher so
    /// `process` runs whenever work is queued.
    pub fn attach(self: &Arc<Self>, dispatcher: &EventDispatcher) -> Result<(), EngineError> {
        dispatcher.add_fd(self.eventfd, true, false)?;
        let wq = self.clone();
        dispatcher.set_handler(
            self.eventfd,
            Some(Box::new(move |fd, _events| {
                wq.ack();
                wq.process();
                let _ = fd;
            })),
            None,
        );
        Ok(())
    }

    fn kick(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.eventfd, &one as *const u64 as *const _, 8);
        }
    }

    fn ack(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.eventfd, buf.as_mut_ptr() as *mut _, 8);
        }
    }

    /// Drain and run every queued job. Called from the owning thread, either
    /// directly or via the epoll wakeup registered in `attach`.
    pub fn process(&self) {
        let receiver = self.receiver.lock().unwrap();
        while let Ok(item) = receiver.try_recv() {
            match item {
                Item::Sync { job, result } => {
                    let retval = job();
                    let (lock, cvar) = &*result;
                    let mut done = lock.lock().unwrap();
                    *done = Some(retval);
                    cvar.notify_one();
                }
                Item::Async { job } => {
                    job();
                }
            }
        }
    }

    /// Queue `func` on the owning thread and block until it has run,
    /// returning its result.
    pub fn call(&self, func: impl FnOnce() -> i32 + Send + 'static) -> i32 {
        let result = Arc::new((Mutex::new(None), Condvar::new()));
        self.sender
            .send(Item::Sync {
                job: Box::new(func),
                result: result.clone(),
            })
            .expect("workqueue receiver dropped while owning thread still alive");
        self.kick();

        let (lock, cvar) = &*result;
        let mut done = lock.lock().unwrap();
        while done.is_none() {
            done = cvar.wait(done).unwrap();
        }
        done.unwrap()
    }

    /// Queue `func` on the owning thread and return immediately.
    pub fn submit(&self, func: impl FnOnce() -> i32 + Send + 'static) {
        self.sender
            .send(Item::Async { job: Box::new(func) })
            .expect("workqueue receiver dropped while owning thread still alive");
        self.kick();
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.eventfd);
        }
    }
}
