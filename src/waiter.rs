//! Socket-readable multiplexer.
//!
//! A dedicated thread waits in `poll(2)` over every registered socket and
//! invokes the handler of each readable one. Handlers are expected to drain
//! the socket and post decode work back onto the task runner; nothing in
//! the discovery layers runs on the waiter thread itself.

use crate::errors::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Implemented by socket owners. Called on the waiter thread whenever the
/// registered handle becomes readable.
pub trait ReadableHandler: Send + Sync {
    fn on_readable(&self);
}

struct WaiterState {
    handlers: HashMap<RawFd, Arc<dyn ReadableHandler>>,
    // The fd whose handler is currently executing, if any. Deregistration
    // of that fd blocks until the dispatch completes.
    dispatching: Option<RawFd>,
}

struct WaiterInner {
    state: Mutex<WaiterState>,
    dispatch_done: Condvar,
    stop: AtomicBool,
    wake_write_fd: RawFd,
}

impl WaiterInner {
    fn wake(&self) {
        let buf = [1u8];
        // A full pipe already guarantees a wakeup.
        unsafe {
            libc::write(self.wake_write_fd, buf.as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// Owns the poll thread. Registration and deregistration are thread-safe;
/// deregistration does not return while the handle's handler is running.
pub struct SocketWaiter {
    inner: Arc<WaiterInner>,
    wake_read_fd: RawFd,
    thread: Option<thread::JoinHandle<()>>,
}

impl SocketWaiter {
    pub fn start() -> io::Result<SocketWaiter> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);
        unsafe {
            libc::fcntl(read_fd, libc::F_SETFL, libc::O_NONBLOCK);
            libc::fcntl(write_fd, libc::F_SETFL, libc::O_NONBLOCK);
        }

        let inner = Arc::new(WaiterInner {
            state: Mutex::new(WaiterState {
                handlers: HashMap::new(),
                dispatching: None,
            }),
            dispatch_done: Condvar::new(),
            stop: AtomicBool::new(false),
            wake_write_fd: write_fd,
        });

        let loop_inner = inner.clone();
        let thread = thread::Builder::new()
            .name("socket-waiter".to_string())
            .spawn(move || poll_loop(loop_inner, read_fd))?;

        Ok(SocketWaiter {
            inner,
            wake_read_fd: read_fd,
            thread: Some(thread),
        })
    }

    /// Starts watching `fd`. The handler is invoked on the waiter thread.
    pub fn register(&self, fd: RawFd, handler: Arc<dyn ReadableHandler>) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.handlers.contains_key(&fd) {
            return Err(Error::ItemAlreadyExists(format!("fd {}", fd)));
        }
        state.handlers.insert(fd, handler);
        drop(state);
        self.inner.wake();
        Ok(())
    }

    /// Stops watching `fd`. Blocks until the waiter confirms the handle is
    /// no longer pending, so the caller may close the socket immediately
    /// afterwards.
    pub fn deregister(&self, fd: RawFd) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.handlers.remove(&fd).is_none() {
            return Err(Error::ItemNotFound(format!("fd {}", fd)));
        }
        while state.dispatching == Some(fd) {
            self.inner.dispatch_done.wait(&mut state);
        }
        drop(state);
        self.inner.wake();
        Ok(())
    }

    pub fn request_stop_soon(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        self.inner.wake();
    }
}

impl Drop for SocketWaiter {
    fn drop(&mut self) {
        self.request_stop_soon();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        unsafe {
            libc::close(self.wake_read_fd);
            libc::close(self.inner.wake_write_fd);
        }
    }
}

fn poll_loop(inner: Arc<WaiterInner>, wake_read_fd: RawFd) {
    const POLL_TIMEOUT_MS: libc::c_int = 250;

    while !inner.stop.load(Ordering::SeqCst) {
        let mut pollfds: Vec<libc::pollfd> = {
            let state = inner.state.lock();
            state
                .handlers
                .keys()
                .map(|&fd| libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                })
                .collect()
        };
        pollfds.push(libc::pollfd {
            fd: wake_read_fd,
            events: libc::POLLIN,
            revents: 0,
        });

        let rc = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                POLL_TIMEOUT_MS,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("socket waiter poll failed: {}", err);
            return;
        }
        if rc == 0 {
            continue;
        }

        for pollfd in &pollfds {
            if pollfd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) == 0 {
                continue;
            }

            if pollfd.fd == wake_read_fd {
                let mut buf = [0u8; 16];
                while unsafe {
                    libc::read(wake_read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                } > 0
                {}
                continue;
            }

            let handler = {
                let mut state = inner.state.lock();
                match state.handlers.get(&pollfd.fd).cloned() {
                    Some(handler) => {
                        state.dispatching = Some(pollfd.fd);
                        handler
                    }
                    // Deregistered since the poll set was built.
                    None => continue,
                }
            };

            handler.on_readable();

            let mut state = inner.state.lock();
            state.dispatching = None;
            drop(state);
            inner.dispatch_done.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingHandler {
        socket: UdpSocket,
        reads: AtomicUsize,
    }

    impl ReadableHandler for CountingHandler {
        fn on_readable(&self) {
            let mut buf = [0u8; 64];
            while self.socket.recv_from(&mut buf).is_ok() {}
            self.reads.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn readable_socket_fires_handler() {
        let waiter = SocketWaiter::start().unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        let addr = socket.local_addr().unwrap();
        let fd = socket.as_raw_fd();

        let handler = Arc::new(CountingHandler {
            socket,
            reads: AtomicUsize::new(0),
        });
        waiter.register(fd, handler.clone()).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"ping", addr).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while handler.reads.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "handler never fired");
            thread::sleep(Duration::from_millis(10));
        }

        waiter.deregister(fd).unwrap();
    }

    #[test]
    fn duplicate_registration_rejected() {
        let waiter = SocketWaiter::start().unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = socket.as_raw_fd();
        let handler = Arc::new(CountingHandler {
            socket: UdpSocket::bind("127.0.0.1:0").unwrap(),
            reads: AtomicUsize::new(0),
        });

        waiter.register(fd, handler.clone()).unwrap();
        assert!(waiter.register(fd, handler).is_err());
        waiter.deregister(fd).unwrap();
        assert!(waiter.deregister(fd).is_err());
    }
}
