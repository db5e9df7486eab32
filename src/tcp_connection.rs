use crate::event_loop::EventLoop;
use crate::fd_event::TriggerEvent;
use crate::protocol::{FrameCoder, RpcFrame};
use crate::rpc_dispatcher::RpcDispatcher;
use crate::tcp_buffer::TcpBuffer;
use crate::{dbglog, logerr, logmsg};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    NotConnected,
    Connected,
    HalfClosing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// accepted by a TcpServer, answers requests through the dispatcher.
    Server,
    /// owned by a TcpClient, matches responses to pending reads.
    Client,
}

/// Runs once the frame has been fully written to the socket.
pub type WriteDone = Box<dyn FnOnce(&EventLoop, &RpcFrame)>;
/// Runs with the response frame carrying the awaited msg id.
pub type ReadDone = Box<dyn FnOnce(&EventLoop, RpcFrame)>;

#[derive(Debug, PartialEq)]
enum IoOutcome {
    /// read: would block; write: everything sent.
    Drained,
    /// write: kernel buffer full, wait for writable.
    WouldBlock,
    PeerClosed,
    Error,
}

struct Inner {
    sock: TcpStream,
    fd: RawFd,
    local_addr: Option<SocketAddr>,
    peer_addr: SocketAddr,
    state: TcpState,
    role: ConnectionRole,
    in_buffer: TcpBuffer,
    out_buffer: TcpBuffer,
    coder: FrameCoder,
    dispatcher: Option<Arc<RpcDispatcher>>,
    /// queued, not yet encoded.
    write_dones: VecDeque<(RpcFrame, WriteDone)>,
    /// encoded into out_buffer, waiting for the flush to finish.
    sent_dones: Vec<(RpcFrame, WriteDone)>,
    read_dones: HashMap<String, ReadDone>,
}

impl Inner {
    fn read_all(&mut self) -> IoOutcome {
        loop {
            if self.in_buffer.writable() == 0 {
                self.in_buffer.grow();
            }
            match self.sock.read(self.in_buffer.writable_slice_mut()) {
                Ok(0) => {
                    dbglog!("peer {} closed fd {}", self.peer_addr, self.fd);
                    return IoOutcome::PeerClosed;
                }
                Ok(n) => {
                    self.in_buffer.advance_write(n);
                }
                Err(err) => match err.kind() {
                    ErrorKind::WouldBlock => return IoOutcome::Drained,
                    ErrorKind::Interrupted => continue,
                    _ => {
                        logerr!("read error on fd {} peer {}: {}", self.fd, self.peer_addr, err);
                        return IoOutcome::Error;
                    }
                },
            }
        }
    }

    fn flush(&mut self) -> IoOutcome {
        while self.out_buffer.readable() > 0 {
            match self.sock.write(self.out_buffer.readable_slice()) {
                Ok(0) => {
                    logerr!("write returned 0 on fd {} peer {}", self.fd, self.peer_addr);
                    return IoOutcome::Error;
                }
                Ok(n) => {
                    // short writes are retried until the kernel says WouldBlock.
                    self.out_buffer.advance_read(n);
                }
                Err(err) => match err.kind() {
                    ErrorKind::WouldBlock => return IoOutcome::WouldBlock,
                    ErrorKind::Interrupted => continue,
                    _ => {
                        logerr!("write error on fd {} peer {}: {}", self.fd, self.peer_addr, err);
                        return IoOutcome::Error;
                    }
                },
            }
        }
        IoOutcome::Drained
    }
}

/// One TCP connection bound to the EventLoop of the thread it was created on.
///
/// Cloning is cheap and shares the connection. The FdEvent callbacks registered with the loop
/// hold clones too, so the connection lives until it is cleared and its owner lets go.
#[derive(Clone)]
pub struct TcpConnection {
    inner: Rc<RefCell<Inner>>,
}

impl TcpConnection {
    fn new(
        sock: TcpStream,
        peer_addr: SocketAddr,
        buffer_size: usize,
        role: ConnectionRole,
        state: TcpState,
        dispatcher: Option<Arc<RpcDispatcher>>,
    ) -> Self {
        let fd = sock.as_raw_fd();
        let local_addr = sock.local_addr().ok();
        Self {
            inner: Rc::new(RefCell::new(Inner {
                sock,
                fd,
                local_addr,
                peer_addr,
                state,
                role,
                in_buffer: TcpBuffer::new(buffer_size),
                out_buffer: TcpBuffer::new(buffer_size),
                coder: FrameCoder::new(),
                dispatcher,
                write_dones: VecDeque::new(),
                sent_dones: Vec::new(),
                read_dones: HashMap::new(),
            })),
        }
    }

    /// Server side of an accepted socket. Starts `Connected` and listening for reads.
    pub fn new_server(
        lp: &EventLoop,
        sock: TcpStream,
        peer_addr: SocketAddr,
        dispatcher: Arc<RpcDispatcher>,
        buffer_size: usize,
    ) -> Self {
        if let Err(e) = sock.set_nonblocking(true) {
            logerr!("failed to set nonblocking for {}: {}", peer_addr, e);
        }
        let conn = Self::new(
            sock,
            peer_addr,
            buffer_size,
            ConnectionRole::Server,
            TcpState::Connected,
            Some(dispatcher),
        );
        conn.listen_read(lp);
        conn
    }

    /// Client side of a socket that is still connecting.
    pub fn new_client(sock: TcpStream, peer_addr: SocketAddr, buffer_size: usize) -> Self {
        Self::new(
            sock,
            peer_addr,
            buffer_size,
            ConnectionRole::Client,
            TcpState::NotConnected,
            None,
        )
    }

    pub fn fd(&self) -> RawFd {
        self.inner.borrow().fd
    }
    pub fn state(&self) -> TcpState {
        self.inner.borrow().state
    }
    pub fn set_state(&self, state: TcpState) {
        self.inner.borrow_mut().state = state;
    }
    pub fn role(&self) -> ConnectionRole {
        self.inner.borrow().role
    }
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.borrow().local_addr
    }
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.borrow().peer_addr
    }

    /// Refresh the local address, known only after connect.
    pub fn update_local_addr(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.local_addr = inner.sock.local_addr().ok();
    }

    /// Run `f` with the socket.
    pub fn with_socket<R>(&self, f: impl FnOnce(&TcpStream) -> R) -> R {
        f(&self.inner.borrow().sock)
    }

    pub fn pending_writes(&self) -> usize {
        let inner = self.inner.borrow();
        inner.write_dones.len() + inner.sent_dones.len()
    }
    pub fn pending_reads(&self) -> usize {
        self.inner.borrow().read_dones.len()
    }

    pub fn listen_read(&self, lp: &EventLoop) {
        if self.state() == TcpState::Closed {
            dbglog!("listen_read on closed fd {} ignored", self.fd());
            return;
        }
        let fd = self.fd();
        let (on_read, on_error) = (self.clone(), self.clone());
        let res = lp.update_interest(fd, move |ev| {
            ev.listen(TriggerEvent::Read, move |lp| on_read.on_read(lp));
            ev.listen(TriggerEvent::Error, move |lp| on_error.on_error(lp));
        });
        if let Err(e) = res {
            logerr!("failed to listen read on fd {}: {}", fd, e);
        }
    }

    pub fn listen_write(&self, lp: &EventLoop) {
        if self.state() == TcpState::Closed {
            dbglog!("listen_write on closed fd {} ignored", self.fd());
            return;
        }
        let fd = self.fd();
        let (on_write, on_error) = (self.clone(), self.clone());
        let res = lp.update_interest(fd, move |ev| {
            ev.listen(TriggerEvent::Write, move |lp| on_write.on_write(lp));
            ev.listen(TriggerEvent::Error, move |lp| on_error.on_error(lp));
        });
        if let Err(e) = res {
            logerr!("failed to listen write on fd {}: {}", fd, e);
        }
    }

    /// Queue a frame to send. `done` runs after it has been written out.
    pub fn push_send_message(&self, frame: RpcFrame, done: WriteDone) {
        self.inner.borrow_mut().write_dones.push_back((frame, done));
    }

    /// Wait for the response carrying `msg_id`.
    pub fn push_read_message(&self, msg_id: impl Into<String>, done: ReadDone) {
        self.inner.borrow_mut().read_dones.insert(msg_id.into(), done);
    }

    pub fn remove_read_message(&self, msg_id: &str) -> bool {
        self.inner.borrow_mut().read_dones.remove(msg_id).is_some()
    }

    pub fn on_read(&self, lp: &EventLoop) {
        let outcome = {
            let mut inner = self.inner.borrow_mut();
            if inner.state != TcpState::Connected && inner.state != TcpState::HalfClosing {
                dbglog!("skip read on fd {} in state {:?}", inner.fd, inner.state);
                return;
            }
            inner.read_all()
        };
        // frames that made it in before the peer's FIN are answered,
        // the responses get one non-blocking flush before the close.
        self.execute(lp);
        if outcome == IoOutcome::PeerClosed && self.role() == ConnectionRole::Server {
            if self.inner.borrow_mut().flush() != IoOutcome::Drained {
                dbglog!("responses on fd {} not fully flushed before close", self.fd());
            }
        }
        if outcome != IoOutcome::Drained {
            logmsg!("peer closed, peer addr {}, fd {}", self.peer_addr(), self.fd());
            self.clear(lp);
        }
    }

    fn execute(&self, lp: &EventLoop) {
        let role = self.role();
        match role {
            ConnectionRole::Server => {
                let staged = {
                    let mut inner = self.inner.borrow_mut();
                    let inner = &mut *inner;
                    let frames = inner.coder.decode(&mut inner.in_buffer);
                    for request in frames.iter() {
                        logmsg!(
                            "{} | recv request {} from {}",
                            request.msg_id,
                            request.method_name,
                            inner.peer_addr
                        );
                        let mut response = match inner.dispatcher.as_ref() {
                            Some(d) => d.dispatch(request, inner.local_addr, Some(inner.peer_addr)),
                            None => {
                                logerr!("no dispatcher on server connection fd {}", inner.fd);
                                continue;
                            }
                        };
                        inner.coder.encode(&mut response, &mut inner.out_buffer);
                    }
                    !frames.is_empty()
                };
                if staged {
                    self.listen_write(lp);
                }
            }
            ConnectionRole::Client => {
                let ready: Vec<(ReadDone, RpcFrame)> = {
                    let mut inner = self.inner.borrow_mut();
                    let inner = &mut *inner;
                    let frames = inner.coder.decode(&mut inner.in_buffer);
                    frames
                        .into_iter()
                        .filter_map(|frame| match inner.read_dones.remove(&frame.msg_id) {
                            Some(done) => Some((done, frame)),
                            None => {
                                dbglog!("{} | no pending read, response dropped", frame.msg_id);
                                None
                            }
                        })
                        .collect()
                };
                for (done, frame) in ready {
                    done(lp, frame);
                }
            }
        }
    }

    pub fn on_write(&self, lp: &EventLoop) {
        let (outcome, dones) = {
            let mut inner = self.inner.borrow_mut();
            if inner.state != TcpState::Connected {
                logerr!(
                    "on_write error, fd {} not connected, state {:?}",
                    inner.fd,
                    inner.state
                );
                return;
            }
            let inner = &mut *inner;
            if inner.role == ConnectionRole::Client {
                while let Some((mut frame, done)) = inner.write_dones.pop_front() {
                    inner.coder.encode(&mut frame, &mut inner.out_buffer);
                    inner.sent_dones.push((frame, done));
                }
            }
            let outcome = inner.flush();
            let dones = if outcome == IoOutcome::Drained {
                std::mem::take(&mut inner.sent_dones)
            } else {
                Vec::new()
            };
            (outcome, dones)
        };
        match outcome {
            IoOutcome::Drained => {
                let fd = self.fd();
                if let Err(e) = lp.update_interest(fd, |ev| ev.cancel(TriggerEvent::Write)) {
                    logerr!("failed to cancel write interest on fd {}: {}", fd, e);
                }
                for (frame, done) in dones {
                    done(lp, &frame);
                }
            }
            IoOutcome::WouldBlock => {
                dbglog!("fd {} send buffer full, wait for writable", self.fd());
            }
            IoOutcome::PeerClosed | IoOutcome::Error => self.clear(lp),
        }
    }

    fn on_error(&self, lp: &EventLoop) {
        let err = self.with_socket(|s| s.take_error());
        logerr!("socket error on fd {} peer {}: {:?}", self.fd(), self.peer_addr(), err);
        self.clear(lp);
    }

    /// Close: drop all interest and leave the loop. Pending callbacks are never run. Idempotent.
    pub fn clear(&self, lp: &EventLoop) {
        let fd = {
            let mut inner = self.inner.borrow_mut();
            if inner.state == TcpState::Closed {
                return;
            }
            inner.state = TcpState::Closed;
            inner.fd
        };
        // the removed FdEvent holds clones of this connection, drop it after the borrow ends.
        let event = lp.unregister_interest(fd);
        logmsg!("connection closed, fd {} peer {}", fd, self.peer_addr());
        drop(event);
    }

    /// Half close, the peer's FIN finishes the job through on_read.
    pub fn shutdown(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.state == TcpState::Closed || inner.state == TcpState::NotConnected {
            return;
        }
        inner.state = TcpState::HalfClosing;
        if let Err(e) = inner.sock.shutdown(Shutdown::Both) {
            logerr!("shutdown fd {} error: {}", inner.fd, e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::Message;
    use crate::service::FnService;
    use crate::RpcController;
    use std::cell::Cell;
    use std::net::TcpListener;
    use std::time::Duration;

    fn pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        (client, server, peer)
    }

    fn echo_dispatcher() -> Arc<RpcDispatcher> {
        let mut d = RpcDispatcher::new();
        d.register_service(Arc::new(
            FnService::new("Echo").method("echo", |_: &mut RpcController, s: String| s),
        ));
        Arc::new(d)
    }

    #[test]
    pub fn test_server_answers_pipelined_requests() {
        let lp = EventLoop::new().unwrap();
        let (client_sock, server_sock, peer) = pair();
        let server = TcpConnection::new_server(&lp, server_sock, peer, echo_dispatcher(), 128);
        assert_eq!(server.state(), TcpState::Connected);
        assert!(lp.is_listening(server.fd(), TriggerEvent::Read));

        client_sock.set_nonblocking(true).unwrap();
        let client = TcpConnection::new_client(client_sock, server.local_addr().unwrap(), 128);
        client.set_state(TcpState::Connected);

        let answers = Rc::new(RefCell::new(Vec::new()));
        let written = Rc::new(Cell::new(0));
        for (id, text) in [("1", "hello"), ("2", "world")] {
            let frame = RpcFrame::new(id, "Echo.echo", text.to_owned().encode_payload().unwrap());
            let w = Rc::clone(&written);
            client.push_send_message(
                frame,
                Box::new(move |_: &EventLoop, _: &RpcFrame| w.set(w.get() + 1)),
            );
            let a = Rc::clone(&answers);
            client.push_read_message(
                id,
                Box::new(move |lp: &EventLoop, rsp: RpcFrame| {
                    a.borrow_mut().push((rsp.msg_id.clone(), String::decode_payload(&rsp.payload).unwrap()));
                    if a.borrow().len() == 2 {
                        lp.stop();
                    }
                }),
            );
        }
        assert_eq!(client.pending_writes(), 2);
        client.listen_write(&lp);
        client.listen_read(&lp);
        lp.schedule_timer(crate::TimerTask::new(5000, false, |lp| lp.stop()));
        lp.run();

        assert_eq!(written.get(), 2);
        assert_eq!(client.pending_writes(), 0);
        assert_eq!(client.pending_reads(), 0);
        let mut got = answers.borrow().clone();
        got.sort();
        assert_eq!(
            got,
            vec![("1".to_owned(), "hello".to_owned()), ("2".to_owned(), "world".to_owned())]
        );
        assert!(!lp.is_listening(client.fd(), TriggerEvent::Write));
    }

    #[test]
    pub fn test_peer_close_clears_connection() {
        let lp = EventLoop::new().unwrap();
        let (client_sock, server_sock, peer) = pair();
        let server = TcpConnection::new_server(&lp, server_sock, peer, echo_dispatcher(), 128);
        let fd = server.fd();
        drop(client_sock);
        let s = server.clone();
        lp.schedule_timer(crate::TimerTask::new(10, true, move |lp| {
            if s.state() == TcpState::Closed {
                lp.stop();
            }
        }));
        lp.schedule_timer(crate::TimerTask::new(5000, false, |lp| lp.stop()));
        lp.run();
        assert_eq!(server.state(), TcpState::Closed);
        assert!(!lp.is_registered(fd));
        server.clear(&lp); // idempotent
        assert_eq!(server.state(), TcpState::Closed);
    }

    #[test]
    pub fn test_answers_before_peer_fin() {
        let lp = EventLoop::new().unwrap();
        let (client_sock, server_sock, peer) = pair();
        let server = TcpConnection::new_server(&lp, server_sock, peer, echo_dispatcher(), 128);
        let request = RpcFrame::new("77", "Echo.echo", "bye".to_owned().encode_payload().unwrap());
        (&client_sock).write_all(&crate::protocol::encode_frame(&request)).unwrap();
        client_sock.shutdown(Shutdown::Write).unwrap();

        let s = server.clone();
        lp.schedule_timer(crate::TimerTask::new(10, true, move |lp| {
            if s.state() == TcpState::Closed {
                lp.stop();
            }
        }));
        lp.schedule_timer(crate::TimerTask::new(5000, false, |lp| lp.stop()));
        lp.run();
        assert_eq!(server.state(), TcpState::Closed);

        client_sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut bytes = Vec::new();
        (&client_sock).read_to_end(&mut bytes).unwrap();
        let mut buf = TcpBuffer::default();
        buf.write(&bytes);
        let frames = FrameCoder.decode(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].msg_id, "77");
        assert_eq!(String::decode_payload(&frames[0].payload).unwrap(), "bye");
    }

    #[test]
    pub fn test_shutdown() {
        let lp = EventLoop::new().unwrap();
        let (client_sock, server_sock, peer) = pair();
        let server = TcpConnection::new_server(&lp, server_sock, peer, echo_dispatcher(), 128);
        server.shutdown();
        assert_eq!(server.state(), TcpState::HalfClosing);
        client_sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!((&client_sock).read(&mut buf).unwrap(), 0);
        drop(client_sock);
        let s = server.clone();
        lp.schedule_timer(crate::TimerTask::new(10, true, move |lp| {
            if s.state() == TcpState::Closed {
                lp.stop();
            }
        }));
        lp.schedule_timer(crate::TimerTask::new(5000, false, |lp| lp.stop()));
        lp.run();
        assert_eq!(server.state(), TcpState::Closed);
    }
}
