//! # Reactor-based RPC runtime in Rust.
//!
//! Supported platforms: Linux
//!
//! ReactRPC is a small RPC runtime built on the Reactor pattern. Every thread that does I/O owns one `EventLoop`,
//! which multiplexes socket readiness, a timerfd-backed `Timer` and a task queue. There are 2 kinds of threads:
//! - the main thread runs the `TcpServer` accept loop and hands each accepted socket to an `IOThread`, round-robin.
//! - each `IOThread` owns the connections it was handed for their whole life.
//!
//! Frames on the wire are length-prefixed (see `protocol`). Requests name their target as `Service.method`;
//! the `RpcDispatcher` routes them to registered `Service`s. Clients use `RpcChannel` for a call with a deadline.
//!
//! Within a loop nothing needs a mutex. Across threads, only `LoopHandle::post_task` is used.
//!
//! ## Examples
//!
//! ### Server
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use reactrpc::{FnService, RpcController, RpcDispatcher, TcpServer};
//!
//! let mut dispatcher = RpcDispatcher::new();
//! dispatcher.register_service(Arc::new(
//!     FnService::new("Echo").method("echo", |_: &mut RpcController, s: String| s),
//! ));
//! let server = TcpServer::new("127.0.0.1:12345".parse().unwrap(), 2, Arc::new(dispatcher)).unwrap();
//! server.start().unwrap(); // blocks until server.handle().stop()
//! ```
//!
//! ### Client
//!
//! ```rust,no_run
//! use reactrpc::{EventLoop, RpcChannel, RpcController};
//!
//! let lp = EventLoop::new().unwrap();
//! let channel = RpcChannel::new("127.0.0.1:12345".parse().unwrap());
//! lp.post(move |lp| {
//!     channel.call(lp, "Echo.echo", &"hello".to_owned(), RpcController::new(),
//!         |lp, controller, rsp: Option<String>| {
//!             println!("{} {:?}", controller.error_code, rsp);
//!             lp.stop();
//!         });
//! });
//! lp.run();
//! ```

pub mod config;
pub mod error;
pub mod event_loop;
pub mod fd_event;
pub mod io_thread;
pub mod logger;
pub mod message;
pub mod msg_id;
pub mod protocol;
pub mod rpc_channel;
pub mod rpc_controller;
pub mod rpc_dispatcher;
pub mod service;
pub mod tcp_accepter;
pub mod tcp_buffer;
pub mod tcp_client;
pub mod tcp_connection;
pub mod tcp_server;
pub mod timer;
pub mod utils;

pub use config::RpcConfig;
pub use error::*;
pub use event_loop::{EventLoop, LoopHandle};
pub use fd_event::{FdEvent, TriggerEvent};
pub use io_thread::{IOThread, IOThreadGroup};
pub use logger::{LogLevel, Logger};
pub use message::Message;
pub use protocol::{FrameCoder, RpcFrame};
pub use rpc_channel::{CallState, RpcChannel};
pub use rpc_controller::RpcController;
pub use rpc_dispatcher::RpcDispatcher;
pub use service::{FnService, MethodError, Service, ServiceMethod};
pub use tcp_accepter::TcpAccepter;
pub use tcp_buffer::TcpBuffer;
pub use tcp_client::TcpClient;
pub use tcp_connection::{ConnectionRole, TcpConnection, TcpState};
pub use tcp_server::TcpServer;
pub use timer::{Timer, TimerTask};
