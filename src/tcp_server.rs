use crate::event_loop::{EventLoop, LoopHandle};
use crate::fd_event::TriggerEvent;
use crate::io_thread::IOThreadGroup;
use crate::rpc_dispatcher::RpcDispatcher;
use crate::tcp_accepter::TcpAccepter;
use crate::tcp_connection::TcpConnection;
use crate::{logerr, logmsg, RpcConfig};
use std::cell::Cell;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Initial in/out buffer size of accepted connections.
pub const SERVER_CONNECTION_BUFFER_SIZE: usize = 128;

struct Acceptor {
    accepter: TcpAccepter,
    io_threads: IOThreadGroup,
    dispatcher: Arc<RpcDispatcher>,
    client_count: Arc<AtomicUsize>,
    accepting: Cell<bool>,
}

impl Acceptor {
    fn on_accept(&self) {
        loop {
            let (sock, peer_addr) = match self.accepter.accept() {
                Ok(v) => v,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    logerr!("accept error: {}", e);
                    return;
                }
            };
            let count = self.client_count.fetch_add(1, Ordering::Relaxed) + 1;
            logmsg!("accepted client {}, total clients {}", peer_addr, count);

            let dispatcher = Arc::clone(&self.dispatcher);
            let io_thread = self.io_threads.get_io_thread();
            io_thread.handle().post_task(
                move |lp| {
                    let conn = TcpConnection::new_server(
                        lp,
                        sock,
                        peer_addr,
                        dispatcher,
                        SERVER_CONNECTION_BUFFER_SIZE,
                    );
                    logmsg!("serving {} on fd {}", peer_addr, conn.fd());
                },
                true,
            );
        }
    }
}

/// Accepts on the main EventLoop and hands every connection to an IOThread, round-robin.
///
/// The main loop belongs to the thread that created the server; `start` blocks it until stopped.
pub struct TcpServer {
    main_loop: EventLoop,
    acceptor: Rc<Acceptor>,
}

impl TcpServer {
    pub fn new(
        local_addr: SocketAddr,
        io_threads: usize,
        dispatcher: Arc<RpcDispatcher>,
    ) -> crate::Result<Self> {
        let main_loop = EventLoop::new()?;
        let accepter = TcpAccepter::new(local_addr)?;
        let io_threads = IOThreadGroup::new(io_threads)?;
        logmsg!(
            "rpc TcpServer listen success on [{}] with {} io threads",
            accepter.local_addr(),
            io_threads.len()
        );
        Ok(Self {
            main_loop,
            acceptor: Rc::new(Acceptor {
                accepter,
                io_threads,
                dispatcher,
                client_count: Arc::new(AtomicUsize::new(0)),
                accepting: Cell::new(false),
            }),
        })
    }

    pub fn from_config(config: &RpcConfig, dispatcher: Arc<RpcDispatcher>) -> crate::Result<Self> {
        Self::new(config.listen_addr(), config.io_threads, dispatcher)
    }

    /// Start accepting and run the main loop until `stop`.
    /// IO threads keep serving after the main loop stops, until the server is dropped.
    pub fn start(&self) -> crate::Result<()> {
        if !self.acceptor.accepting.get() {
            let acceptor = Rc::clone(&self.acceptor);
            self.main_loop
                .update_interest(self.acceptor.accepter.fd(), move |ev| {
                    ev.listen(TriggerEvent::Read, move |_| acceptor.on_accept())
                })?;
            self.acceptor.accepting.set(true);
        }
        self.acceptor.io_threads.start();
        self.main_loop.run();
        logmsg!("rpc TcpServer main loop exited");
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.accepter.local_addr()
    }

    /// Thread-safe handle of the main loop, `stop()` it to make `start` return.
    pub fn handle(&self) -> LoopHandle {
        self.main_loop.handle()
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.main_loop
    }

    pub fn client_count(&self) -> usize {
        self.acceptor.client_count.load(Ordering::Relaxed)
    }

    /// Shareable counter of accepted clients.
    pub fn client_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.acceptor.client_count)
    }
}
