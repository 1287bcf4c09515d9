//! Edge-event monitor.
//!
//! [`attach`] moves an input pin into a background thread that blocks in
//! `poll(2)` until the pin reports an edge, reads the new state and pushes it
//! onto an [`EdgeStream`]. The stream is the only output of the thread: it
//! ends when the pin fails, when the consumer closes or drops it, or when a
//! [`Canceller`] fires.

use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futures_lite::future;
use log::{debug, warn};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::eventfd::{EfdFlags, EventFd};
use tokio::sync::{Notify, mpsc};
use tokio_stream::Stream;

use crate::config::{Direction, EdgeDetect, MonitorConfig};
use crate::error::GpioError;
use crate::gpio::{EdgeSource, Wake};

/// Stops a monitor, including while it is blocked waiting for an edge or
/// for the consumer to take a value.
#[derive(Clone)]
pub struct Canceller {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    cancelled: AtomicBool,
    wake: EventFd,
    notify: Notify,
}

impl Canceller {
    pub(crate) fn new() -> Result<Self, GpioError> {
        let wake = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(|e| GpioError::io("cancellation eventfd", e.into()))?;
        Ok(Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                wake,
                notify: Notify::new(),
            }),
        })
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.inner.wake.write(1) {
            warn!("failed to signal monitor cancellation: {e}");
        }
        self.inner.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn wake_fd(&self) -> BorrowedFd<'_> {
        self.inner.wake.as_fd()
    }

    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

/// Wait for `events` on `fd` or for `cancel`, whichever comes first.
pub(crate) fn wait_ready(
    fd: BorrowedFd<'_>,
    events: PollFlags,
    cancel: &Canceller,
    timeout: Option<Duration>,
    name: &str,
) -> Result<Wake, GpioError> {
    if cancel.is_cancelled() {
        return Ok(Wake::Cancelled);
    }

    // round up so a sub-millisecond timeout still blocks
    let timeout = timeout
        .map(|t| {
            PollTimeout::try_from(t.as_micros().div_ceil(1000)).unwrap_or(PollTimeout::MAX)
        })
        .unwrap_or(PollTimeout::NONE);
    let mut fds = [
        PollFd::new(fd, events),
        PollFd::new(cancel.wake_fd(), PollFlags::POLLIN),
    ];

    let ready = loop {
        match poll(&mut fds, timeout) {
            Err(Errno::EINTR) => continue,
            other => break other,
        }
    }
    .map_err(|e| GpioError::io(format!("poll {name}"), e.into()))?;

    if ready == 0 {
        return Ok(Wake::Timeout);
    }
    if fds[1].revents().is_some_and(|r| !r.is_empty()) {
        return Ok(Wake::Cancelled);
    }
    if fds[0]
        .revents()
        .is_some_and(|r| r.contains(PollFlags::POLLNVAL))
    {
        return Err(GpioError::io(
            format!("poll {name}"),
            io::Error::from(Errno::EBADF),
        ));
    }
    Ok(Wake::Ready)
}

#[derive(Debug)]
enum MonitorExit {
    Cancelled,
    Abandoned,
    Failed(GpioError),
}

enum Push {
    Delivered,
    Closed,
    Cancelled,
}

/// Stream of states observed by a monitor, in observation order.
///
/// Dropping the stream stops the monitor and waits for its thread.
pub struct EdgeStream {
    name: String,
    rx: Option<mpsc::Receiver<bool>>,
    cancel: Canceller,
    worker: Option<JoinHandle<MonitorExit>>,
}

impl EdgeStream {
    pub fn pin_name(&self) -> &str {
        &self.name
    }

    /// Next observed state, `None` once the monitor has stopped.
    pub async fn recv(&mut self) -> Option<bool> {
        self.rx.as_mut()?.recv().await
    }

    /// Blocking variant of [`EdgeStream::recv`] for use outside a runtime.
    pub fn blocking_recv(&mut self) -> Option<bool> {
        self.rx.as_mut()?.blocking_recv()
    }

    pub fn canceller(&self) -> Canceller {
        self.cancel.clone()
    }

    /// Stop the monitor and report why it ended. A monitor stopped by an I/O
    /// failure returns that failure; a cancelled one returns `Ok`.
    pub fn close(mut self) -> Result<(), GpioError> {
        match self.shutdown() {
            Some(MonitorExit::Failed(e)) => Err(e),
            _ => Ok(()),
        }
    }

    fn shutdown(&mut self) -> Option<MonitorExit> {
        self.cancel.cancel();
        drop(self.rx.take());
        let worker = self.worker.take()?;
        Some(worker.join().unwrap_or_else(|_| {
            MonitorExit::Failed(GpioError::io(
                format!("monitor for {}", self.name),
                io::Error::other("monitor thread panicked"),
            ))
        }))
    }
}

impl Stream for EdgeStream {
    type Item = bool;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<bool>> {
        match self.rx.as_mut() {
            Some(rx) => rx.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

impl Drop for EdgeStream {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Attach a monitor to `pin`. `timeout` bounds each readiness wait; `None`
/// waits indefinitely.
pub fn attach<P: EdgeSource>(pin: P, timeout: Option<Duration>) -> Result<EdgeStream, GpioError> {
    spawn(pin, timeout, 1)
}

pub fn attach_with<P: EdgeSource>(pin: P, config: &MonitorConfig) -> Result<EdgeStream, GpioError> {
    spawn(pin, config.timeout(), config.buffer.max(1))
}

fn spawn<P: EdgeSource>(
    pin: P,
    timeout: Option<Duration>,
    buffer: usize,
) -> Result<EdgeStream, GpioError> {
    let name = pin.name();

    if pin.direction()? != Direction::In {
        return Err(GpioError::Config(format!(
            "{name} must be an input to monitor edges"
        )));
    }
    let edge = pin.edge()?;
    if edge == EdgeDetect::None {
        return Err(GpioError::Config(format!("edge mode of {name} is none")));
    }

    let claim = pin.claim()?;

    // poll reports the value present before monitoring as ready once;
    // reading it here discards that.
    pin.state()?;

    let cancel = Canceller::new()?;
    let (tx, rx) = mpsc::channel(buffer);

    let worker_cancel = cancel.clone();
    let worker = thread::Builder::new()
        .name(format!("gpio-monitor-{name}"))
        .spawn(move || {
            let _claim = claim;
            run(pin, tx, worker_cancel, timeout)
        })
        .map_err(|e| GpioError::io(format!("spawn monitor for {name}"), e))?;

    debug!("monitoring {name} for {edge} edges, timeout {timeout:?}");

    Ok(EdgeStream {
        name,
        rx: Some(rx),
        cancel,
        worker: Some(worker),
    })
}

fn run<P: EdgeSource>(
    pin: P,
    tx: mpsc::Sender<bool>,
    cancel: Canceller,
    timeout: Option<Duration>,
) -> MonitorExit {
    let name = pin.name();

    let exit = loop {
        match pin.wait_edge(&cancel, timeout) {
            Ok(Wake::Ready) => {}
            Ok(Wake::Timeout) => continue,
            Ok(Wake::Cancelled) => break MonitorExit::Cancelled,
            Err(e) => break MonitorExit::Failed(e),
        }

        let value = match pin.state() {
            Ok(v) => v,
            Err(e) => break MonitorExit::Failed(e),
        };

        match push(&tx, &cancel, value) {
            Push::Delivered => {}
            Push::Closed => break MonitorExit::Abandoned,
            Push::Cancelled => break MonitorExit::Cancelled,
        }
    };

    match &exit {
        MonitorExit::Failed(e) => warn!("edge monitor for {name} stopped: {e}"),
        MonitorExit::Cancelled => debug!("edge monitor for {name} cancelled"),
        MonitorExit::Abandoned => debug!("edge monitor for {name} lost its consumer"),
    }
    exit
}

fn push(tx: &mpsc::Sender<bool>, cancel: &Canceller, value: bool) -> Push {
    future::block_on(future::or(
        async {
            match tx.send(value).await {
                Ok(()) => Push::Delivered,
                Err(_) => Push::Closed,
            }
        },
        async {
            cancel.cancelled().await;
            Push::Cancelled
        },
    ))
}
