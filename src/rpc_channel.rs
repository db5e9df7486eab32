use crate::event_loop::EventLoop;
use crate::message::Message;
use crate::msg_id;
use crate::protocol::RpcFrame;
use crate::rpc_controller::RpcController;
use crate::tcp_client::TcpClient;
use crate::timer::TimerTask;
use crate::{dbglog, logerr, logmsg};
use crate::{
    ERROR_FAILED_DESERIALIZE, ERROR_FAILED_SERIALIZE, ERROR_RPC_CALL_TIMEOUT,
    ERROR_RPC_CHANNEL_INIT,
};
use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;

/// Progress of the single call a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Connecting,
    Sending,
    AwaitingResponse,
    Done,
    Failed,
    TimedOut,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Done | CallState::Failed | CallState::TimedOut)
    }
}

/// Type-erased completion: gets the final controller and the response payload on success.
type Complete = Box<dyn FnOnce(&EventLoop, RpcController, Option<Vec<u8>>)>;

struct PendingCall {
    controller: RpcController,
    request: Option<RpcFrame>,
    complete: Complete,
}

/// Client side of one RPC call: connect, send, await the response or the deadline.
///
/// Whatever happens first among response, connect failure and timeout completes the call;
/// every later event is ignored, so the completion runs exactly once.
pub struct RpcChannel {
    client: Rc<TcpClient>,
    state: Cell<CallState>,
    pending: RefCell<Option<PendingCall>>,
    timer: RefCell<Option<Rc<TimerTask>>>,
}

impl RpcChannel {
    pub fn new(peer_addr: SocketAddr) -> Rc<Self> {
        Rc::new(Self {
            client: TcpClient::new(peer_addr),
            state: Cell::new(CallState::Idle),
            pending: RefCell::new(None),
            timer: RefCell::new(None),
        })
    }

    pub fn state(&self) -> CallState {
        self.state.get()
    }

    pub fn client(&self) -> &Rc<TcpClient> {
        &self.client
    }

    /// Call `method_name` (`Service.method`) with `request`.
    ///
    /// `done` gets the controller and, on success, the decoded response. When `lp` isn't looping yet
    /// the connect step runs it, see `TcpClient::connect`.
    pub fn call<Req, Rsp>(
        self: &Rc<Self>,
        lp: &EventLoop,
        method_name: &str,
        request: &Req,
        mut controller: RpcController,
        done: impl FnOnce(&EventLoop, RpcController, Option<Rsp>) + 'static,
    ) where
        Req: Message,
        Rsp: Message + 'static,
    {
        let complete: Complete = Box::new(
            move |lp: &EventLoop, mut controller: RpcController, payload: Option<Vec<u8>>| {
                let rsp = match payload {
                    Some(bytes) => match Rsp::decode_payload(&bytes) {
                        Ok(rsp) => Some(rsp),
                        Err(e) => {
                            logerr!("{} | {}", controller.msg_id, e);
                            controller.set_error(ERROR_FAILED_DESERIALIZE, e.to_string());
                            None
                        }
                    },
                    None => None,
                };
                done(lp, controller, rsp);
            },
        );

        if self.state() != CallState::Idle {
            logerr!("rpc channel already used, state {:?}", self.state());
            controller.set_error(ERROR_RPC_CHANNEL_INIT, "rpc channel already used");
            complete(lp, controller, None);
            return;
        }
        if controller.msg_id.is_empty() {
            controller.msg_id = msg_id::next_msg_id();
        }
        controller.peer_addr = Some(self.client.peer_addr());

        let payload = match request.encode_payload() {
            Ok(p) => p,
            Err(e) => {
                logerr!("{} | {}", controller.msg_id, e);
                controller.set_error(ERROR_FAILED_SERIALIZE, e.to_string());
                self.state.set(CallState::Failed);
                complete(lp, controller, None);
                return;
            }
        };
        let request = RpcFrame::new(controller.msg_id.clone(), method_name, payload);
        logmsg!(
            "{} | call method {} on {}",
            request.msg_id,
            request.method_name,
            self.client.peer_addr()
        );

        let timeout = controller.timeout;
        *self.pending.borrow_mut() = Some(PendingCall {
            controller,
            request: Some(request),
            complete,
        });

        let me = Rc::clone(self);
        let timer = TimerTask::new(timeout, false, move |lp| me.on_timeout(lp));
        *self.timer.borrow_mut() = Some(Rc::clone(&timer));
        lp.schedule_timer(timer);

        self.state.set(CallState::Connecting);
        let me = Rc::clone(self);
        self.client.connect(lp, move |lp| me.on_connected(lp));
    }

    fn on_connected(self: &Rc<Self>, lp: &EventLoop) {
        if self.state() != CallState::Connecting {
            dbglog!("connect finished in state {:?}, ignored", self.state());
            return;
        }
        let code = self.client.connect_error_code();
        if code != 0 {
            let info = self.client.connect_error_info();
            self.fail(lp, CallState::Failed, code, info);
            return;
        }
        let request = self
            .pending
            .borrow_mut()
            .as_mut()
            .and_then(|p| {
                p.controller.local_addr = self.client.local_addr();
                p.request.take()
            });
        let Some(request) = request else {
            return;
        };
        self.state.set(CallState::Sending);
        let me = Rc::clone(self);
        self.client
            .write_message(lp, request, move |lp, frame| me.on_sent(lp, frame));
    }

    fn on_sent(self: &Rc<Self>, lp: &EventLoop, frame: &RpcFrame) {
        if self.state() != CallState::Sending {
            return;
        }
        dbglog!("{} | request sent", frame.msg_id);
        self.state.set(CallState::AwaitingResponse);
        let me = Rc::clone(self);
        self.client
            .read_message(lp, frame.msg_id.clone(), move |lp, rsp| me.on_response(lp, rsp));
    }

    fn on_response(&self, lp: &EventLoop, response: RpcFrame) {
        if self.state() != CallState::AwaitingResponse {
            dbglog!("{} | late response dropped", response.msg_id);
            return;
        }
        logmsg!(
            "{} | got response of {}, err_code {}",
            response.msg_id,
            response.method_name,
            response.err_code
        );
        if response.err_code != 0 {
            self.fail(lp, CallState::Failed, response.err_code, response.err_info);
            return;
        }
        self.finish(lp, CallState::Done, |_| {}, Some(response.payload));
    }

    fn on_timeout(&self, lp: &EventLoop) {
        if self.state().is_terminal() {
            return;
        }
        let msg_id = self.controller_msg_id();
        self.client.remove_read_message(&msg_id);
        let timeout = self
            .pending
            .borrow()
            .as_ref()
            .map(|p| p.controller.timeout)
            .unwrap_or(0);
        logerr!("{} | rpc call timeout after {}ms", msg_id, timeout);
        self.finish(
            lp,
            CallState::TimedOut,
            |c| {
                c.start_cancel();
                c.set_error(ERROR_RPC_CALL_TIMEOUT, format!("rpc call timeout {}", timeout));
            },
            None,
        );
    }

    fn fail(&self, lp: &EventLoop, state: CallState, code: i32, info: String) {
        self.finish(lp, state, |c| c.set_error(code, info), None);
    }

    /// Enter `state`, drop the timer, close the connection and run the completion once.
    fn finish(
        &self,
        lp: &EventLoop,
        state: CallState,
        update: impl FnOnce(&mut RpcController),
        payload: Option<Vec<u8>>,
    ) {
        let Some(pending) = self.pending.borrow_mut().take() else {
            return;
        };
        self.state.set(state);
        if let Some(timer) = self.timer.borrow_mut().take() {
            lp.remove_timer(&timer);
        }
        self.client.close(lp);
        let PendingCall {
            mut controller,
            complete,
            ..
        } = pending;
        update(&mut controller);
        complete(lp, controller, payload);
    }

    fn controller_msg_id(&self) -> String {
        self.pending
            .borrow()
            .as_ref()
            .map(|p| p.controller.msg_id.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    #[test]
    pub fn test_call_state() {
        assert!(!CallState::Idle.is_terminal());
        assert!(!CallState::AwaitingResponse.is_terminal());
        assert!(CallState::TimedOut.is_terminal());
    }

    #[test]
    pub fn test_serialize_failure_completes_immediately() {
        let lp = EventLoop::new().unwrap();
        let channel = RpcChannel::new("127.0.0.1:1".parse().unwrap());
        // tuple keys can't be JSON object keys.
        let mut request = HashMap::new();
        request.insert((1, 2), 3);
        let got = Rc::new(Cell::new(0));
        let g = Rc::clone(&got);
        channel.call(
            &lp,
            "Calc.add",
            &request,
            RpcController::new(),
            move |_, c, rsp: Option<i32>| {
                assert!(rsp.is_none());
                g.set(c.error_code);
            },
        );
        assert_eq!(got.get(), ERROR_FAILED_SERIALIZE);
        assert_eq!(channel.state(), CallState::Failed);
        assert_eq!(lp.pending_timers(), 0);
    }
}
