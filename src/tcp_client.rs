use crate::error::connect_error_code;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::fd_event::TriggerEvent;
use crate::protocol::RpcFrame;
use crate::tcp_connection::{ReadDone, TcpConnection, TcpState, WriteDone};
use crate::{dbglog, logerr, logmsg, ERROR_FAILED_CONNECT};
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use std::cell::{Cell, RefCell};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::RawFd;
use std::rc::Rc;

pub const CLIENT_CONNECTION_BUFFER_SIZE: usize = 128;

type ConnectDone = Box<dyn FnOnce(&EventLoop)>;

enum ConnectProgress {
    Connected,
    Pending,
    Failed(std::io::Error),
}

fn is_in_progress(e: &std::io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EINPROGRESS) | Some(libc::EALREADY))
}

/// Client end of one connection to `peer_addr`, driven by the caller's EventLoop.
pub struct TcpClient {
    peer_addr: SocketAddr,
    connection: RefCell<Option<TcpConnection>>,
    connect_error_code: Cell<i32>,
    connect_error_info: RefCell<String>,
    loop_handle: RefCell<Option<LoopHandle>>,
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        let Some(conn) = self.connection.get_mut().take() else {
            return;
        };
        if conn.state() == TcpState::Closed {
            return;
        }
        // the loop's FdEvent keeps the socket open until the clear runs there.
        let Some(handle) = self.loop_handle.get_mut().take() else {
            return;
        };
        let peer_addr = self.peer_addr;
        if !handle.post_local(move |lp| conn.clear(lp)) {
            dbglog!("event loop of client to {} is gone", peer_addr);
        }
    }
}

impl TcpClient {
    pub fn new(peer_addr: SocketAddr) -> Rc<Self> {
        Rc::new(Self {
            peer_addr,
            connection: RefCell::new(None),
            connect_error_code: Cell::new(0),
            connect_error_info: RefCell::new(String::new()),
            loop_handle: RefCell::new(None),
        })
    }

    /// Connect without blocking, `done` runs exactly once when it succeeds or fails.
    /// See `connect_error_code` for the outcome.
    ///
    /// If `lp` isn't looping yet, this runs it, so the call returns only after the loop is stopped.
    pub fn connect(self: &Rc<Self>, lp: &EventLoop, done: impl FnOnce(&EventLoop) + 'static) {
        *self.loop_handle.borrow_mut() = Some(lp.handle());
        if self.state() == TcpState::Connected {
            done(lp);
            return;
        }
        self.reset_connect_error();

        let conn = match self.open_socket() {
            Ok(conn) => conn,
            Err(e) => {
                self.set_connect_error(ERROR_FAILED_CONNECT, format!("create socket error: {}", e));
                done(lp);
                return;
            }
        };
        let progress = conn.with_socket(|s| Self::try_connect(s, self.peer_addr));
        *self.connection.borrow_mut() = Some(conn.clone());

        match progress {
            ConnectProgress::Connected => {
                self.on_connected(&conn);
                done(lp);
            }
            ConnectProgress::Failed(e) => {
                self.on_connect_failed(lp, e);
                done(lp);
            }
            ConnectProgress::Pending => {
                if self.wait_writable(lp, conn.fd(), Box::new(done)) && !lp.is_looping() {
                    lp.run();
                }
            }
        }
    }

    /// Finish the connect once `fd` turns writable. Returns false when `done` already ran
    /// because the wait could not be set up.
    fn wait_writable(self: &Rc<Self>, lp: &EventLoop, fd: RawFd, done: ConnectDone) -> bool {
        let done = Rc::new(Cell::new(Some(done)));
        let (me, pending) = (Rc::clone(self), Rc::clone(&done));
        let res = lp.update_interest(fd, move |ev| {
            ev.listen(TriggerEvent::Write, move |lp| {
                if me.on_connect_writable(lp) {
                    if let Some(done) = pending.take() {
                        done(lp);
                    }
                }
            })
        });
        match res {
            Ok(()) => true,
            Err(e) => {
                self.on_connect_failed(lp, e);
                if let Some(done) = done.take() {
                    done(lp);
                }
                false
            }
        }
    }

    fn open_socket(&self) -> std::io::Result<TcpConnection> {
        let socket = Socket::new(
            Domain::for_address(self.peer_addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.set_nonblocking(true)?;
        let sock: TcpStream = socket.into();
        Ok(TcpConnection::new_client(
            sock,
            self.peer_addr,
            CLIENT_CONNECTION_BUFFER_SIZE,
        ))
    }

    fn try_connect(sock: &TcpStream, peer_addr: SocketAddr) -> ConnectProgress {
        match SockRef::from(sock).connect(&SockAddr::from(peer_addr)) {
            Ok(()) => ConnectProgress::Connected,
            Err(e) if e.raw_os_error() == Some(libc::EISCONN) => ConnectProgress::Connected,
            Err(e) if is_in_progress(&e) => ConnectProgress::Pending,
            Err(e) => ConnectProgress::Failed(e),
        }
    }

    /// Returns true once the connect attempt is settled.
    fn on_connect_writable(&self, lp: &EventLoop) -> bool {
        let Some(conn) = self.connection() else {
            return true;
        };
        let progress = conn.with_socket(|s| match SockRef::from(s).take_error() {
            Ok(Some(e)) | Err(e) => ConnectProgress::Failed(e),
            Ok(None) => Self::try_connect(s, self.peer_addr),
        });
        match progress {
            ConnectProgress::Pending => {
                dbglog!("connect to {} still in progress", self.peer_addr);
                false
            }
            ConnectProgress::Connected => {
                lp.unregister_interest(conn.fd());
                self.on_connected(&conn);
                true
            }
            ConnectProgress::Failed(e) => {
                self.on_connect_failed(lp, e);
                true
            }
        }
    }

    fn on_connected(&self, conn: &TcpConnection) {
        conn.set_state(TcpState::Connected);
        conn.update_local_addr();
        logmsg!(
            "connect [{}] success, local addr {:?}",
            self.peer_addr,
            conn.local_addr()
        );
    }

    fn on_connect_failed(&self, lp: &EventLoop, e: std::io::Error) {
        let code = connect_error_code(&e);
        let info = if code == crate::ERROR_PEER_CLOSED {
            format!("connect refused, sys error = {}", e)
        } else {
            format!("connect error, sys error = {}", e)
        };
        logerr!("connect [{}] failed: {}", self.peer_addr, info);
        self.set_connect_error(code, info);
        if let Some(conn) = self.connection.borrow_mut().take() {
            conn.set_state(TcpState::Closed);
            // deregister before the socket closes.
            lp.unregister_interest(conn.fd());
        }
    }

    fn reset_connect_error(&self) {
        self.connect_error_code.set(0);
        self.connect_error_info.borrow_mut().clear();
    }

    fn set_connect_error(&self, code: i32, info: String) {
        self.connect_error_code.set(code);
        *self.connect_error_info.borrow_mut() = info;
    }

    /// Queue `frame` and flush it when writable. `done` runs once it's fully written.
    pub fn write_message(
        &self,
        lp: &EventLoop,
        frame: RpcFrame,
        done: impl FnOnce(&EventLoop, &RpcFrame) + 'static,
    ) {
        let Some(conn) = self.connection() else {
            logerr!("{} | write_message without connection to {}", frame.msg_id, self.peer_addr);
            return;
        };
        let done: WriteDone = Box::new(done);
        conn.push_send_message(frame, done);
        conn.listen_write(lp);
    }

    /// Wait for the response with `msg_id`.
    pub fn read_message(
        &self,
        lp: &EventLoop,
        msg_id: impl Into<String>,
        done: impl FnOnce(&EventLoop, RpcFrame) + 'static,
    ) {
        let msg_id = msg_id.into();
        let Some(conn) = self.connection() else {
            logerr!("{} | read_message without connection to {}", msg_id, self.peer_addr);
            return;
        };
        let done: ReadDone = Box::new(done);
        conn.push_read_message(msg_id, done);
        conn.listen_read(lp);
    }

    /// Forget the pending read of `msg_id`. Returns whether one existed.
    pub fn remove_read_message(&self, msg_id: &str) -> bool {
        self.connection()
            .map(|c| c.remove_read_message(msg_id))
            .unwrap_or(false)
    }

    /// Stop the event loop this client last connected on, if it is looping.
    pub fn stop(&self) {
        if let Some(handle) = self.loop_handle.borrow().as_ref() {
            if handle.is_looping() {
                handle.stop();
            }
        }
    }

    /// Close the connection now.
    pub fn close(&self, lp: &EventLoop) {
        if let Some(conn) = self.connection.borrow_mut().take() {
            conn.clear(lp);
        }
    }

    pub fn connection(&self) -> Option<TcpConnection> {
        self.connection.borrow().clone()
    }

    pub fn state(&self) -> TcpState {
        self.connection()
            .map(|c| c.state())
            .unwrap_or(TcpState::NotConnected)
    }

    /// 0 when the last connect succeeded.
    pub fn connect_error_code(&self) -> i32 {
        self.connect_error_code.get()
    }

    pub fn connect_error_info(&self) -> String {
        self.connect_error_info.borrow().clone()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.connection().and_then(|c| c.local_addr())
    }
}
