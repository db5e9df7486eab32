use crate::event_loop::EventLoop;
use crate::utils;
use crate::{dbglog, logerr};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;

/// Countdown programmed when no task is pending.
pub const DEFAULT_TIMER_INTERVAL_MS: i64 = 1000;

type TimerKey = (i64, u64);

/// A one-shot or repeating deadline with its callback.
///
/// Cancelling only marks the task, the Timer drops it lazily when it comes due.
pub struct TimerTask {
    arrive_time: Cell<i64>,
    interval: i64,
    repeated: bool,
    canceled: Cell<bool>,
    key: Cell<Option<TimerKey>>,
    callback: RefCell<Box<dyn FnMut(&EventLoop)>>,
}

impl TimerTask {
    /// First arrival is `now + interval_ms`.
    pub fn new(
        interval_ms: i64,
        repeated: bool,
        callback: impl FnMut(&EventLoop) + 'static,
    ) -> Rc<Self> {
        Rc::new(Self {
            arrive_time: Cell::new(utils::now_millis() + interval_ms),
            interval: interval_ms,
            repeated,
            canceled: Cell::new(false),
            key: Cell::new(None),
            callback: RefCell::new(Box::new(callback)),
        })
    }

    pub fn arrive_time(&self) -> i64 {
        self.arrive_time.get()
    }
    pub fn interval(&self) -> i64 {
        self.interval
    }
    pub fn is_repeated(&self) -> bool {
        self.repeated
    }
    pub fn is_canceled(&self) -> bool {
        self.canceled.get()
    }
    pub fn set_canceled(&self, canceled: bool) {
        self.canceled.set(canceled);
    }

    fn reset_arrive_time(&self, now: i64) {
        self.arrive_time.set(now + self.interval);
    }

    pub(crate) fn run(&self, lp: &EventLoop) {
        if self.is_canceled() {
            return;
        }
        match self.callback.try_borrow_mut() {
            Ok(mut cb) => (cb)(lp),
            Err(_) => logerr!("timer callback re-entered, skipped"),
        }
    }
}

/// Ordered set of TimerTasks driven by one timerfd.
///
/// Tasks are keyed by (arrive_time, insertion seq) so equal deadlines fire in insertion order.
pub struct Timer {
    fd: OwnedFd,
    pending: BTreeMap<TimerKey, Rc<TimerTask>>,
    seq: u64,
}

impl Timer {
    pub fn new() -> std::io::Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self {
            fd,
            pending: BTreeMap::new(),
            seq: 0,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Insert a task. Returns true when it's now the soonest and the countdown was reprogrammed.
    pub fn add(&mut self, task: Rc<TimerTask>) -> bool {
        let soonest = match self.pending.keys().next() {
            Some((arrive, _)) => task.arrive_time() < *arrive,
            None => true,
        };
        self.insert(task);
        if soonest {
            self.reset_arrive_time();
        }
        soonest
    }

    fn insert(&mut self, task: Rc<TimerTask>) {
        self.seq += 1;
        let key = (task.arrive_time(), self.seq);
        task.key.set(Some(key));
        self.pending.insert(key, task);
    }

    /// Lazy cancel: the task stays queued and is dropped when due.
    pub fn cancel(&mut self, task: &TimerTask) {
        task.set_canceled(true);
    }

    /// Cancel and remove the task right away.
    pub fn remove(&mut self, task: &TimerTask) {
        task.set_canceled(true);
        if let Some(key) = task.key.take() {
            self.pending.remove(&key);
        }
    }

    /// Remove due tasks, re-insert repeating ones and reprogram the countdown.
    /// Returns the due non-cancelled tasks in deadline order; the caller runs them.
    pub fn take_due(&mut self) -> Vec<Rc<TimerTask>> {
        self.drain_fd();
        let now = utils::now_millis();
        let later = self.pending.split_off(&(now + 1, 0));
        let due = std::mem::replace(&mut self.pending, later);

        let mut tasks = Vec::with_capacity(due.len());
        for (_, task) in due {
            task.key.set(None);
            if task.is_canceled() {
                continue;
            }
            tasks.push(task);
        }
        for task in tasks.iter().filter(|t| t.is_repeated()) {
            task.reset_arrive_time(now);
            self.insert(Rc::clone(task));
        }
        self.reset_arrive_time();
        tasks
    }

    /// Program the timerfd to the soonest deadline, or the default interval when empty.
    pub fn reset_arrive_time(&self) {
        let interval = match self.pending.keys().next() {
            Some((arrive, _)) => std::cmp::max(arrive - utils::now_millis(), 1),
            None => DEFAULT_TIMER_INTERVAL_MS,
        };
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: (interval / 1000) as libc::time_t,
                tv_nsec: ((interval % 1000) * 1_000_000) as libc::c_long,
            },
        };
        let rt = unsafe { libc::timerfd_settime(self.fd(), 0, &spec, std::ptr::null_mut()) };
        if rt != 0 {
            logerr!(
                "timerfd_settime error, errno={}",
                std::io::Error::last_os_error()
            );
        }
    }

    fn drain_fd(&self) {
        let mut buf = [0u8; 8];
        loop {
            let n = unsafe { libc::read(self.fd(), buf.as_mut_ptr() as *mut libc::c_void, 8) };
            if n <= 0 {
                break;
            }
        }
        dbglog!("timer fd {} drained", self.fd());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn noop() -> impl FnMut(&EventLoop) + 'static {
        |_: &EventLoop| {}
    }

    #[test]
    pub fn test_add_soonest() {
        let mut timer = Timer::new().unwrap();
        assert!(timer.add(TimerTask::new(500, false, noop())));
        assert!(timer.add(TimerTask::new(100, false, noop())));
        assert!(!timer.add(TimerTask::new(1000, false, noop())));
        assert_eq!(timer.len(), 3);
    }

    #[test]
    pub fn test_take_due() {
        let mut timer = Timer::new().unwrap();
        let a = TimerTask::new(-5, false, noop());
        let b = TimerTask::new(-5, true, noop());
        let c = TimerTask::new(-1, false, noop());
        let later = TimerTask::new(60_000, false, noop());
        timer.add(Rc::clone(&a));
        timer.add(Rc::clone(&b));
        timer.add(Rc::clone(&c));
        timer.add(Rc::clone(&later));
        c.set_canceled(true);

        let due = timer.take_due();
        // insertion order among equal deadlines, cancelled task dropped.
        assert_eq!(due.len(), 2);
        assert!(Rc::ptr_eq(&due[0], &a));
        assert!(Rc::ptr_eq(&due[1], &b));
        // repeating task re-armed.
        assert_eq!(timer.len(), 2);
        assert!(b.arrive_time() >= utils::now_millis() - 10);
    }

    #[test]
    pub fn test_remove() {
        let mut timer = Timer::new().unwrap();
        let a = TimerTask::new(50, false, noop());
        timer.add(Rc::clone(&a));
        timer.remove(&a);
        assert!(timer.is_empty());
        assert!(a.is_canceled());

        let b = TimerTask::new(50, false, noop());
        timer.add(Rc::clone(&b));
        timer.cancel(&b);
        assert_eq!(timer.len(), 1);
    }
}
