//! Event dispatcher (C8): one `epoll` instance per owning thread, fed from
//! a fd→handler table shared by the whole process and guarded by an
//! `RwLock` — writers (registering/unregistering a fd) take it exclusively,
//! the hot dispatch path only ever needs a read lock.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::EngineError;

const MAX_EVENTS: usize = 128;

pub type Handler = Box<dyn FnMut(RawFd, u32) + Send>;

#[derive(Default)]
struct FdHandler {
    pollin: Mutex<Option<Handler>>,
    pollout: Mutex<Option<Handler>>,
}

/// Process-wide fd→handler map. Every [`EventDispatcher`] shares one of
/// these so a fd registered on one thread's epoll resolves the same way no
/// matter which thread's `epoll_wait` woke it up.
///
/// The map structure itself is `RwLock`-guarded per §5's shared-resource
/// table: registering/removing a fd takes the write lock, while the hot
/// dispatch path only ever needs the read lock to find the `Arc<FdHandler>`
/// — the handler's own callback is behind a per-fd `Mutex` so invoking it
/// doesn't need to hold the map lock at all.
#[derive(Default)]
pub struct FdHandlerTable {
    handlers: RwLock<HashMap<RawFd, Arc<FdHandler>>>,
}

impl FdHandlerTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, fd: RawFd, pollin: Option<Handler>, pollout: Option<Handler>) {
        let mut handlers = self.handlers.write().unwrap();
        handlers.insert(
            fd,
            Arc::new(FdHandler {
                pollin: Mutex::new(pollin),
                pollout: Mutex::new(pollout),
            }),
        );
    }

    pub fn remove(&self, fd: RawFd) {
        self.handlers.write().unwrap().remove(&fd);
    }

    fn dispatch(&self, fd: RawFd, events: u32) {
        let handler = {
            let handlers = self.handlers.read().unwrap();
            let Some(handler) = handlers.get(&fd) else {
                return;
            };
            handler.clone()
        };
        if events & libc::EPOLLIN as u32 != 0 {
            if let Some(cb) = handler.pollin.lock().unwrap().as_mut() {
                cb(fd, events);
            }
        }
        if events & libc::EPOLLOUT as u32 != 0 {
            if let Some(cb) = handler.pollout.lock().unwrap().as_mut() {
                cb(fd, events);
            }
        }
    }
}

/// One thread's private epoll instance.
pub struct EventDispatcher {
    epollfd: RawFd,
    table: Arc<FdHandlerTable>,
}

impl EventDispatcher {
    pub fn new(table: Arc<FdHandlerTable>) -> Result<Self, EngineError> {
        let epollfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epollfd < 0 {
            return Err(EngineError::Io(io::Error::last_os_error()));
        }
        Ok(EventDispatcher { epollfd, table })
    }

    pub fn epollfd(&self) -> RawFd {
        self.epollfd
    }

    /// Registers `fd` for edge-triggered delivery (§2's "edge-triggered
    /// dispatch"): a handler must drain `fd` fully on each callback, since a
    /// second `epoll_wait` only reports it again once new readiness occurs.
    pub fn add_fd(&self, fd: RawFd, readable: bool, writable: bool) -> Result<(), EngineError> {
        let mut ev = libc::epoll_event {
            events: poll_mask(readable, writable),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epollfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc < 0 {
            return Err(EngineError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn del_fd(&self, fd: RawFd) -> Result<(), EngineError> {
        let rc = unsafe {
            libc::epoll_ctl(self.epollfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if rc < 0 {
            return Err(EngineError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn set_handler(&self, fd: RawFd, pollin: Option<Handler>, pollout: Option<Handler>) {
        self.table.set(fd, pollin, pollout);
    }

    /// One `epoll_wait` round, dispatching every ready fd. `timeout_ms < 0`
    /// blocks indefinitely.
    pub fn process(&self, timeout_ms: i32) {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let n = unsafe {
            libc::epoll_wait(
                self.epollfd,
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout_ms,
            )
        };
        if n <= 0 {
            return;
        }
        for ev in &events[..n as usize] {
            self.table.dispatch(ev.u64 as RawFd, ev.events);
        }
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epollfd);
        }
    }
}

fn poll_mask(readable: bool, writable: bool) -> u32 {
    let mut mask = libc::EPOLLET as u32;
    if readable {
        mask |= libc::EPOLLIN as u32;
    }
    if writable {
        mask |= libc::EPOLLOUT as u32;
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn dispatches_eventfd_readiness() {
        let table = FdHandlerTable::new();
        let dispatcher = EventDispatcher::new(table.clone()).unwrap();

        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
        assert!(fd >= 0);
        dispatcher.add_fd(fd, true, false).unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let fired_cb = fired.clone();
        dispatcher.set_handler(
            fd,
            Some(Box::new(move |efd, _events| {
                let mut buf = [0u8; 8];
                unsafe {
                    libc::read(efd, buf.as_mut_ptr() as *mut _, 8);
                }
                fired_cb.store(true, Ordering::SeqCst);
            })),
            None,
        );

        let one: u64 = 1;
        unsafe {
            libc::write(fd, &one as *const u64 as *const _, 8);
        }

        dispatcher.process(100);
        assert!(fired.load(Ordering::SeqCst));

        table.remove(fd);
        unsafe {
            libc::close(fd);
        }
    }
}
