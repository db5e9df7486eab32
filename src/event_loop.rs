use crate::fd_event::{FdCallback, FdEvent, FdEventRegistry, TriggerEvent};
use crate::timer::{Timer, TimerTask};
use crate::{dbglog, logerr, logmsg, RpcError};
use polling::{Events, PollMode, Poller};
use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

/// Upper bound of one poll wait.
pub const MAX_POLL_TIMEOUT_MS: u64 = 10000;

/// Task posted from any thread.
pub type Task = Box<dyn FnOnce(&EventLoop) + Send>;
type LocalTask = Box<dyn FnOnce(&EventLoop)>;

thread_local! {
    static LOOP_ON_THREAD: Cell<bool> = const { Cell::new(false) };
    // one loop per thread, so its local queue lives here.
    static LOCAL_TASKS: RefCell<VecDeque<LocalTask>> = const { RefCell::new(VecDeque::new()) };
}

struct Shared {
    poller: Poller,
    tasks: Mutex<Vec<Task>>,
    stop: AtomicBool,
    looping: AtomicBool,
    thread_id: ThreadId,
}

/// `LoopHandle` is the thread-safe face of an EventLoop: post tasks, wake it up, stop it.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    /// Queue `task` to run on the loop thread. `wake` interrupts a blocked wait.
    pub fn post_task(&self, task: impl FnOnce(&EventLoop) + Send + 'static, wake: bool) {
        match self.shared.tasks.lock() {
            Ok(mut tasks) => tasks.push(Box::new(task)),
            Err(e) => {
                logerr!("task queue poisoned: {}", e);
                return;
            }
        }
        if wake {
            self.wakeup();
        }
    }

    /// Register interest from a foreign thread. `build` runs on the loop thread.
    pub fn register_interest(&self, build: impl FnOnce() -> FdEvent + Send + 'static) {
        self.post_task(
            move |lp| {
                if let Err(e) = lp.register_interest(build()) {
                    logerr!("failed to register interest: {}", e);
                }
            },
            true,
        );
    }

    pub fn unregister_interest(&self, fd: RawFd) {
        self.post_task(
            move |lp| {
                lp.unregister_interest(fd);
            },
            true,
        );
    }

    pub fn wakeup(&self) {
        if let Err(e) = self.shared.poller.notify() {
            logerr!("failed to wake up event loop: {}", e);
        }
    }

    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.wakeup();
    }

    pub fn is_looping(&self) -> bool {
        self.shared.looping.load(Ordering::Acquire)
    }

    pub fn is_own_thread(&self) -> bool {
        std::thread::current().id() == self.shared.thread_id
    }

    /// Queue a non-Send task, only possible on the loop's own thread while the loop is alive.
    /// Returns false and drops `task` otherwise.
    pub fn post_local(&self, task: impl FnOnce(&EventLoop) + 'static) -> bool {
        if !self.is_own_thread() || !LOOP_ON_THREAD.with(|f| f.get()) {
            return false;
        }
        LOCAL_TASKS.with(|t| t.borrow_mut().push_back(Box::new(task)));
        true
    }
}

/// `EventLoop` is the per-thread reactor: readiness multiplexing, a timer, and a task queue.
///
/// It's `!Send`. Everything registered with it runs on its thread. Other threads talk to it through `LoopHandle`.
/// Readiness callbacks are never invoked from inside the wait; they are queued as tasks and run at the
/// start of the next iteration.
pub struct EventLoop {
    shared: Arc<Shared>,
    fd_events: RefCell<FdEventRegistry>,
    registered: RefCell<HashSet<RawFd>>,
    timer: RefCell<Timer>,
    sock_events: RefCell<Events>,
    poll_timeout: Duration,
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let fds: Vec<RawFd> = self.registered.borrow().iter().copied().collect();
        for fd in fds {
            self.unregister_interest(fd);
        }
        LOOP_ON_THREAD.with(|f| f.set(false));
        // dropped outside the borrow, their captures may release connections.
        let leftover = LOCAL_TASKS.with(|t| std::mem::take(&mut *t.borrow_mut()));
        drop(leftover);
    }
}

impl EventLoop {
    /// Create the loop of the calling thread. Fails with `RpcError::LoopExists` if the thread has one.
    pub fn new() -> crate::Result<Self> {
        if LOOP_ON_THREAD.with(|f| f.get()) {
            logerr!("failed to create event loop, this thread already has one");
            return Err(RpcError::LoopExists);
        }
        let shared = Arc::new(Shared {
            poller: Poller::new()?,
            tasks: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            thread_id: std::thread::current().id(),
        });
        let timer = Timer::new()?;
        let timer_fd = timer.fd();
        let me = Self {
            shared,
            fd_events: RefCell::new(FdEventRegistry::new()),
            registered: RefCell::new(HashSet::new()),
            timer: RefCell::new(timer),
            sock_events: RefCell::new(Events::new()),
            poll_timeout: Duration::from_millis(MAX_POLL_TIMEOUT_MS),
        };
        me.update_interest(timer_fd, |ev| {
            ev.listen(TriggerEvent::Read, |lp| lp.on_timer())
        })?;
        LOOP_ON_THREAD.with(|f| f.set(true));
        logmsg!("created event loop in thread {}", crate::utils::thread_id());
        Ok(me)
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run until stopped. The stop flag is cleared on return so the loop can be run again.
    pub fn run(&self) {
        self.shared.looping.store(true, Ordering::Release);
        while !self.shared.stop.load(Ordering::Acquire) {
            self.run_pending_tasks();
            if self.shared.stop.load(Ordering::Acquire) {
                break;
            }
            let timeout = if self.has_pending_tasks() {
                Duration::ZERO
            } else {
                self.poll_timeout
            };
            let ready = {
                let mut events = self.sock_events.borrow_mut();
                events.clear();
                if let Err(e) = self.shared.poller.wait(&mut events, Some(timeout)) {
                    if e.kind() != std::io::ErrorKind::Interrupted {
                        logerr!("poll wait error: {}", e);
                    }
                    continue;
                }
                events
                    .iter()
                    .map(|ev| {
                        (
                            ev.key as RawFd,
                            ev.readable,
                            ev.writable,
                            ev.is_err().unwrap_or(false),
                        )
                    })
                    .collect::<Vec<_>>()
            };
            for (fd, readable, writable, error) in ready {
                self.post_ready_callbacks(fd, readable, writable, error);
            }
        }
        self.shared.looping.store(false, Ordering::Release);
        self.shared.stop.store(false, Ordering::Release);
        dbglog!("event loop stopped");
    }

    fn post_ready_callbacks(&self, fd: RawFd, readable: bool, writable: bool, error: bool) {
        let callbacks: Vec<FdCallback> = {
            let events = self.fd_events.borrow();
            let Some(ev) = events.get(fd) else {
                dbglog!("no FdEvent for ready fd {}", fd);
                return;
            };
            let mut v = Vec::with_capacity(3);
            if readable {
                v.extend(ev.handler(TriggerEvent::Read));
            }
            if writable {
                v.extend(ev.handler(TriggerEvent::Write));
            }
            if error {
                v.extend(ev.handler(TriggerEvent::Error));
            }
            v
        };
        for cb in callbacks {
            self.post(move |lp| cb(lp));
        }
    }

    fn run_pending_tasks(&self) {
        let remote = match self.shared.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in remote {
            task(self);
        }
        // tasks posted while running go to the next round.
        let local = LOCAL_TASKS.with(|t| std::mem::take(&mut *t.borrow_mut()));
        for task in local {
            task(self);
        }
    }

    fn has_pending_tasks(&self) -> bool {
        !LOCAL_TASKS.with(|t| t.borrow().is_empty())
            || self.shared.tasks.lock().map(|t| !t.is_empty()).unwrap_or(false)
    }

    /// Queue a task for the next iteration. Loop thread only.
    pub fn post(&self, task: impl FnOnce(&EventLoop) + 'static) {
        LOCAL_TASKS.with(|t| t.borrow_mut().push_back(Box::new(task)));
    }

    /// Add `event` or replace the existing event of the same descriptor.
    pub fn register_interest(&self, event: FdEvent) -> std::io::Result<()> {
        let fd = event.fd();
        self.fd_events.borrow_mut().insert(event);
        self.sync_or_forget(fd)
    }

    /// Mutate the event of `fd` (created if missing) and sync it with the poller.
    pub fn update_interest(&self, fd: RawFd, f: impl FnOnce(&mut FdEvent)) -> std::io::Result<()> {
        f(self.fd_events.borrow_mut().get_or_create(fd));
        self.sync_or_forget(fd)
    }

    /// An fd the poller refused to add is not kept in the registry.
    fn sync_or_forget(&self, fd: RawFd) -> std::io::Result<()> {
        let res = self.sync_interest(fd);
        if res.is_err() && !self.is_registered(fd) {
            let event = self.fd_events.borrow_mut().remove(fd);
            drop(event);
        }
        res
    }

    fn sync_interest(&self, fd: RawFd) -> std::io::Result<()> {
        let interest = match self.fd_events.borrow().get(fd) {
            Some(ev) => ev.poll_event(),
            None => return Ok(()),
        };
        let mut registered = self.registered.borrow_mut();
        if registered.contains(&fd) {
            let sock = unsafe { BorrowedFd::borrow_raw(fd) };
            self.shared
                .poller
                .modify_with_mode(sock, interest, PollMode::Level)?;
        } else {
            unsafe {
                self.shared
                    .poller
                    .add_with_mode(fd, interest, PollMode::Level)?;
            }
            registered.insert(fd);
            dbglog!("added fd {} to poller", fd);
        }
        Ok(())
    }

    /// Remove `fd` from the poller. Returns its FdEvent, dropping it releases the callbacks.
    pub fn unregister_interest(&self, fd: RawFd) -> Option<FdEvent> {
        if self.registered.borrow_mut().remove(&fd) {
            let sock = unsafe { BorrowedFd::borrow_raw(fd) };
            if let Err(e) = self.shared.poller.delete(sock) {
                logerr!("failed to delete fd {} from poller: {}", fd, e);
            }
            dbglog!("deleted fd {} from poller", fd);
        }
        self.fd_events.borrow_mut().remove(fd)
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.registered.borrow().contains(&fd)
    }

    pub fn is_listening(&self, fd: RawFd, trigger: TriggerEvent) -> bool {
        self.fd_events
            .borrow()
            .get(fd)
            .map(|ev| ev.is_listening(trigger))
            .unwrap_or(false)
    }

    pub fn schedule_timer(&self, task: Rc<TimerTask>) {
        self.timer.borrow_mut().add(task);
    }

    /// Lazy cancel, the task is dropped when due.
    pub fn cancel_timer(&self, task: &TimerTask) {
        self.timer.borrow_mut().cancel(task);
    }

    pub fn remove_timer(&self, task: &TimerTask) {
        self.timer.borrow_mut().remove(task);
    }

    pub fn pending_timers(&self) -> usize {
        self.timer.borrow().len()
    }

    fn on_timer(&self) {
        let due = self.timer.borrow_mut().take_due();
        for task in due {
            task.run(self);
        }
    }

    pub fn wakeup(&self) {
        self.handle().wakeup();
    }

    pub fn stop(&self) {
        self.handle().stop();
    }

    pub fn is_looping(&self) -> bool {
        self.shared.looping.load(Ordering::Acquire)
    }
}
