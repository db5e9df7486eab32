use reactrpc::{
    CallState, EventLoop, FnService, LoopHandle, Message, RpcChannel, RpcController,
    RpcDispatcher, TcpServer, TimerTask,
};
use reactrpc::{
    ERROR_PEER_CLOSED, ERROR_RPC_CALL_TIMEOUT, ERROR_RPC_CHANNEL_INIT, ERROR_SERVICE_NOT_FOUND,
};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct MakeOrderRequest {
    price: i32,
    goods: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct MakeOrderResponse {
    ret_code: i32,
    res_info: String,
    order_id: String,
}

fn order_dispatcher() -> Arc<RpcDispatcher> {
    let mut d = RpcDispatcher::new();
    d.register_service(Arc::new(
        FnService::new("Order")
            .method(
                "makeOrder",
                |c: &mut RpcController, req: MakeOrderRequest| {
                    assert!(c.peer_addr.is_some());
                    if req.price < 10 {
                        return MakeOrderResponse {
                            ret_code: -1,
                            res_info: "short balance".to_owned(),
                            order_id: String::new(),
                        };
                    }
                    MakeOrderResponse {
                        ret_code: 0,
                        res_info: "OK".to_owned(),
                        order_id: "20230514".to_owned(),
                    }
                },
            )
            .method("slow", |_: &mut RpcController, ms: u64| {
                std::thread::sleep(Duration::from_millis(ms));
                ms
            }),
    ));
    Arc::new(d)
}

struct ServerGuard {
    addr: SocketAddr,
    handle: LoopHandle,
    thread: Option<std::thread::JoinHandle<usize>>,
}

impl ServerGuard {
    fn start(io_threads: usize) -> Self {
        let (tx, rx) = std::sync::mpsc::channel();
        let thread = std::thread::spawn(move || {
            let server =
                TcpServer::new("127.0.0.1:0".parse().unwrap(), io_threads, order_dispatcher())
                    .unwrap();
            tx.send((server.local_addr(), server.handle())).unwrap();
            server.start().unwrap();
            server.client_count()
        });
        let (addr, handle) = rx.recv().unwrap();
        Self {
            addr,
            handle,
            thread: Some(thread),
        }
    }

    /// Stop the server, returning the number of accepted clients.
    fn stop(mut self) -> usize {
        self.handle.stop();
        self.thread.take().unwrap().join().unwrap()
    }
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        if let Some(t) = self.thread.take() {
            self.handle.stop();
            let _ = t.join();
        }
    }
}

/// One call on a fresh loop and channel. Guarded by a 5s stop timer.
fn call<Req, Rsp>(
    addr: SocketAddr,
    method: &'static str,
    req: Req,
    controller: RpcController,
) -> (RpcController, Option<Rsp>)
where
    Req: Message + 'static,
    Rsp: Message + 'static,
{
    let lp = EventLoop::new().unwrap();
    let result = Rc::new(RefCell::new(None));
    let channel = RpcChannel::new(addr);
    let r = Rc::clone(&result);
    lp.post(move |lp| {
        channel.call(lp, method, &req, controller, move |lp, c, rsp: Option<Rsp>| {
            *r.borrow_mut() = Some((c, rsp));
            lp.stop();
        })
    });
    lp.schedule_timer(TimerTask::new(5000, false, |lp| lp.stop()));
    lp.run();
    let out = result.borrow_mut().take();
    out.expect("call did not complete")
}

#[test]
pub fn test_make_order() {
    let server = ServerGuard::start(2);
    let req = MakeOrderRequest {
        price: 100,
        goods: "apple".to_owned(),
    };
    let (c, rsp) = call::<_, MakeOrderResponse>(server.addr, "Order.makeOrder", req, RpcController::new());
    assert_eq!(c.error_code, 0, "{}", c.error_info);
    assert!(!c.failed());
    assert_eq!(c.msg_id.len(), 20);
    assert!(c.local_addr.is_some());
    assert_eq!(c.peer_addr, Some(server.addr));
    assert_eq!(
        rsp,
        Some(MakeOrderResponse {
            ret_code: 0,
            res_info: "OK".to_owned(),
            order_id: "20230514".to_owned(),
        })
    );

    let req = MakeOrderRequest {
        price: 5,
        goods: "pear".to_owned(),
    };
    let (c, rsp) = call::<_, MakeOrderResponse>(
        server.addr,
        "Order.makeOrder",
        req,
        RpcController::new().with_msg_id("12345"),
    );
    assert_eq!(c.msg_id, "12345");
    assert_eq!(rsp.map(|r| r.ret_code), Some(-1));
    assert_eq!(server.stop(), 2);
}

#[test]
pub fn test_unknown_service() {
    let server = ServerGuard::start(1);
    let (c, rsp) = call::<_, MakeOrderResponse>(
        server.addr,
        "Bogus.method",
        MakeOrderRequest {
            price: 1,
            goods: String::new(),
        },
        RpcController::new(),
    );
    assert!(c.failed());
    assert_eq!(c.error_code, ERROR_SERVICE_NOT_FOUND);
    assert!(c.error_info.contains("Bogus"));
    assert!(rsp.is_none());
}

#[test]
pub fn test_call_timeout_completes_once() {
    let server = ServerGuard::start(1);
    let lp = EventLoop::new().unwrap();
    let calls = Rc::new(Cell::new(0));
    let result = Rc::new(RefCell::new(None));
    let channel = RpcChannel::new(server.addr);
    {
        let (calls, result, channel) = (Rc::clone(&calls), Rc::clone(&result), Rc::clone(&channel));
        lp.post(move |lp| {
            channel.call(
                lp,
                "Order.slow",
                &300u64,
                RpcController::new().with_timeout(100),
                move |_, c, rsp: Option<u64>| {
                    calls.set(calls.get() + 1);
                    *result.borrow_mut() = Some((c, rsp));
                },
            )
        });
    }
    // keep looping past the late response.
    lp.schedule_timer(TimerTask::new(700, false, |lp| lp.stop()));
    lp.run();

    assert_eq!(calls.get(), 1);
    assert_eq!(channel.state(), CallState::TimedOut);
    let (c, rsp) = result.borrow_mut().take().unwrap();
    assert_eq!(c.error_code, ERROR_RPC_CALL_TIMEOUT);
    assert!(c.is_canceled());
    assert!(rsp.is_none());
}

#[test]
pub fn test_connect_refused() {
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();
    let (c, rsp) = call::<_, MakeOrderResponse>(
        addr,
        "Order.makeOrder",
        MakeOrderRequest {
            price: 100,
            goods: "apple".to_owned(),
        },
        RpcController::new(),
    );
    assert_eq!(c.error_code, ERROR_PEER_CLOSED);
    assert!(rsp.is_none());
}

#[test]
pub fn test_channel_single_use() {
    let server = ServerGuard::start(1);
    let lp = EventLoop::new().unwrap();
    let codes = Rc::new(RefCell::new(Vec::new()));
    let channel = RpcChannel::new(server.addr);
    {
        let (codes, channel) = (Rc::clone(&codes), Rc::clone(&channel));
        lp.post(move |lp| {
            let req = MakeOrderRequest {
                price: 100,
                goods: "apple".to_owned(),
            };
            let first = Rc::clone(&codes);
            channel.call(lp, "Order.makeOrder", &req, RpcController::new(), move |lp, c, _: Option<MakeOrderResponse>| {
                first.borrow_mut().push(c.error_code);
                lp.stop();
            });
            let second = Rc::clone(&codes);
            channel.call(lp, "Order.makeOrder", &req, RpcController::new(), move |_, c, _: Option<MakeOrderResponse>| {
                second.borrow_mut().push(c.error_code);
            });
        });
    }
    lp.schedule_timer(TimerTask::new(5000, false, |lp| lp.stop()));
    lp.run();
    assert_eq!(*codes.borrow(), vec![ERROR_RPC_CHANNEL_INIT, 0]);
    assert_eq!(channel.state(), CallState::Done);
}

#[test]
pub fn test_many_clients() {
    let server = ServerGuard::start(3);
    let addr = server.addr;
    let clients: Vec<_> = (0..4)
        .map(|i| {
            std::thread::spawn(move || {
                (0..5)
                    .map(|j| {
                        let (c, rsp) = call::<_, MakeOrderResponse>(
                            addr,
                            "Order.makeOrder",
                            MakeOrderRequest {
                                price: 100 + i * 10 + j,
                                goods: format!("goods-{}-{}", i, j),
                            },
                            RpcController::new(),
                        );
                        c.error_code == 0 && rsp.map(|r| r.ret_code) == Some(0)
                    })
                    .filter(|ok| *ok)
                    .count()
            })
        })
        .collect();
    let ok: usize = clients.into_iter().map(|t| t.join().unwrap()).sum();
    assert_eq!(ok, 20);
    assert_eq!(server.stop(), 20);
}

#[test]
pub fn test_finished_channel_releases_socket() {
    let server = ServerGuard::start(1);
    let lp = EventLoop::new().unwrap();
    let channel = RpcChannel::new(server.addr);
    let fd = Rc::new(Cell::new(None));
    let done = Rc::new(Cell::new(false));
    {
        let (channel, fd, done) = (Rc::clone(&channel), Rc::clone(&fd), Rc::clone(&done));
        lp.post(move |lp| {
            let req = MakeOrderRequest {
                price: 100,
                goods: "apple".to_owned(),
            };
            channel.call(lp, "Order.makeOrder", &req, RpcController::new(), move |lp, c, _: Option<MakeOrderResponse>| {
                assert_eq!(c.error_code, 0, "{}", c.error_info);
                done.set(true);
                lp.stop();
            });
            fd.set(channel.client().connection().map(|c| c.fd()));
        });
    }
    lp.schedule_timer(TimerTask::new(5000, false, |lp| lp.stop()));
    lp.run();
    assert!(done.get());
    let fd = fd.get().expect("connection opened");
    assert!(channel.client().connection().is_none());
    drop(channel);

    lp.schedule_timer(TimerTask::new(50, false, |lp| lp.stop()));
    lp.run();
    assert!(!lp.is_registered(fd));
}
