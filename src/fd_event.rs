use crate::event_loop::EventLoop;
use std::os::fd::RawFd;
use std::rc::Rc;

/// Callback run by the EventLoop when a descriptor becomes ready.
pub type FdCallback = Rc<dyn Fn(&EventLoop)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
    Read,
    Write,
    Error,
}

/// Readiness interest of one descriptor and the callbacks bound to it.
///
/// Error interest is always implied by the kernel. `listen(TriggerEvent::Error, ..)` only sets its callback.
pub struct FdEvent {
    fd: RawFd,
    readable: bool,
    writable: bool,
    read_callback: Option<FdCallback>,
    write_callback: Option<FdCallback>,
    error_callback: Option<FdCallback>,
}

impl FdEvent {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            readable: false,
            writable: false,
            read_callback: None,
            write_callback: None,
            error_callback: None,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn listen(&mut self, trigger: TriggerEvent, callback: impl Fn(&EventLoop) + 'static) {
        let callback: FdCallback = Rc::new(callback);
        match trigger {
            TriggerEvent::Read => {
                self.readable = true;
                self.read_callback = Some(callback);
            }
            TriggerEvent::Write => {
                self.writable = true;
                self.write_callback = Some(callback);
            }
            TriggerEvent::Error => {
                self.error_callback = Some(callback);
            }
        }
    }

    /// Clear the interest bit. The callback stays bound.
    pub fn cancel(&mut self, trigger: TriggerEvent) {
        match trigger {
            TriggerEvent::Read => self.readable = false,
            TriggerEvent::Write => self.writable = false,
            TriggerEvent::Error => self.error_callback = None,
        }
    }

    pub fn is_listening(&self, trigger: TriggerEvent) -> bool {
        match trigger {
            TriggerEvent::Read => self.readable,
            TriggerEvent::Write => self.writable,
            TriggerEvent::Error => self.error_callback.is_some(),
        }
    }

    /// Callback to run for `trigger`, only while interested.
    pub fn handler(&self, trigger: TriggerEvent) -> Option<FdCallback> {
        match trigger {
            TriggerEvent::Read if self.readable => self.read_callback.clone(),
            TriggerEvent::Write if self.writable => self.write_callback.clone(),
            TriggerEvent::Error => self.error_callback.clone(),
            _ => None,
        }
    }

    pub(crate) fn poll_event(&self) -> polling::Event {
        polling::Event::new(self.fd as usize, self.readable, self.writable)
    }
}

/// FdEvents indexed by descriptor. Grows by 1.5x when a larger descriptor shows up.
pub(crate) struct FdEventRegistry {
    events: Vec<Option<FdEvent>>,
}

impl FdEventRegistry {
    pub fn new() -> Self {
        let mut events = Vec::new();
        events.resize_with(128, || None);
        Self { events }
    }

    pub fn get(&self, fd: RawFd) -> Option<&FdEvent> {
        if fd < 0 {
            return None;
        }
        self.events.get(fd as usize).and_then(|e| e.as_ref())
    }

    /// The event of `fd`, created empty if missing.
    pub fn get_or_create(&mut self, fd: RawFd) -> &mut FdEvent {
        let idx = fd.max(0) as usize;
        if idx >= self.events.len() {
            let new_len = std::cmp::max(idx + 1, self.events.len() * 3 / 2);
            self.events.resize_with(new_len, || None);
        }
        self.events[idx].get_or_insert_with(|| FdEvent::new(fd))
    }

    pub fn insert(&mut self, event: FdEvent) {
        let slot = self.get_or_create(event.fd());
        *slot = event;
    }

    pub fn remove(&mut self, fd: RawFd) -> Option<FdEvent> {
        if fd < 0 {
            return None;
        }
        self.events.get_mut(fd as usize).and_then(|e| e.take())
    }

    pub fn capacity(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn test_listen_cancel() {
        let mut ev = FdEvent::new(7);
        assert!(!ev.is_listening(TriggerEvent::Read));
        ev.listen(TriggerEvent::Read, |_| {});
        ev.listen(TriggerEvent::Write, |_| {});
        let pe = ev.poll_event();
        assert_eq!(pe.key, 7);
        assert!(pe.readable && pe.writable);

        ev.cancel(TriggerEvent::Write);
        assert!(ev.handler(TriggerEvent::Write).is_none());
        assert!(ev.handler(TriggerEvent::Read).is_some());
        let pe = ev.poll_event();
        assert!(pe.readable && !pe.writable);
    }

    #[test]
    pub fn test_registry_grows() {
        let mut reg = FdEventRegistry::new();
        assert_eq!(reg.capacity(), 128);
        reg.get_or_create(130).listen(TriggerEvent::Read, |_| {});
        assert_eq!(reg.capacity(), 192);
        assert!(reg.get(130).map(|e| e.is_listening(TriggerEvent::Read)).unwrap_or(false));
        assert!(reg.get(3).is_none());
        assert!(reg.remove(130).is_some());
        assert!(reg.get(130).is_none());
        assert!(reg.remove(-1).is_none());
    }
}
