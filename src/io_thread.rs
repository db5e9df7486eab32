use crate::event_loop::{EventLoop, LoopHandle};
use crate::{logerr, logmsg, RpcError};
use std::cell::Cell;
use std::sync::mpsc;

/// A worker thread owning one EventLoop.
///
/// The thread creates its loop, reports back its LoopHandle, then waits for `start` before looping.
/// Dropping an IOThread stops and joins it.
pub struct IOThread {
    name: String,
    handle: LoopHandle,
    thread_id: i64,
    start_signal: Cell<Option<mpsc::Sender<()>>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Drop for IOThread {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

impl IOThread {
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        let (init_tx, init_rx) = mpsc::channel::<Result<(LoopHandle, i64), String>>();
        let (start_tx, start_rx) = mpsc::channel::<()>();
        let thread_name = name.clone();
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let lp = match EventLoop::new() {
                    Ok(lp) => lp,
                    Err(e) => {
                        let _ = init_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = init_tx.send(Ok((lp.handle(), crate::utils::thread_id())));
                drop(init_tx);
                if start_rx.recv().is_err() {
                    logmsg!("{} dropped before start", thread_name);
                    return;
                }
                logmsg!("{} start looping", thread_name);
                lp.run();
                logmsg!("exiting {}", thread_name);
            })?;

        match init_rx.recv() {
            Ok(Ok((handle, thread_id))) => {
                logmsg!("IOThread {} created, tid {}", name, thread_id);
                Ok(Self {
                    name,
                    handle,
                    thread_id,
                    start_signal: Cell::new(Some(start_tx)),
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(RpcError::Io(std::io::Error::other(e)))
            }
            Err(_) => {
                let _ = thread.join();
                Err(RpcError::Io(std::io::Error::other(format!(
                    "IOThread {} exited during init",
                    name
                ))))
            }
        }
    }

    /// Let the thread enter its loop. Subsequent calls do nothing.
    pub fn start(&self) {
        if let Some(tx) = self.start_signal.take() {
            if tx.send(()).is_err() {
                logerr!("IOThread {} is gone, cannot start", self.name);
            }
        }
    }

    pub fn stop(&self) {
        // an unstarted thread exits when the start signal is dropped.
        self.start_signal.take();
        self.handle.stop();
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                logerr!("IOThread {} panicked", self.name);
            }
        }
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn thread_id(&self) -> i64 {
        self.thread_id
    }
}

/// Fixed pool of IOThreads handed out round-robin.
pub struct IOThreadGroup {
    threads: Vec<IOThread>,
    index: Cell<usize>,
}

impl IOThreadGroup {
    /// `size` threads named `IOThread-<i>`. At least one thread is created.
    pub fn new(size: usize) -> crate::Result<Self> {
        let threads = (0..size.max(1))
            .map(|i| IOThread::new(format!("IOThread-{}", i)))
            .collect::<crate::Result<Vec<_>>>()?;
        Ok(Self {
            threads,
            index: Cell::new(0),
        })
    }

    pub fn start(&self) {
        for t in self.threads.iter() {
            t.start();
        }
    }

    pub fn stop(&self) {
        for t in self.threads.iter() {
            t.stop();
        }
    }

    pub fn join(&mut self) {
        for t in self.threads.iter_mut() {
            t.join();
        }
    }

    /// Next thread in round-robin order.
    pub fn get_io_thread(&self) -> &IOThread {
        let i = self.index.get();
        self.index.set((i + 1) % self.threads.len());
        &self.threads[i]
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}
