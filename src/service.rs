use crate::message::Message;
use crate::rpc_controller::RpcController;
use crate::PayloadError;
use std::collections::HashMap;
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MethodError {
    #[error("bad request: {0}")]
    Request(PayloadError),
    #[error("bad response: {0}")]
    Response(PayloadError),
}

/// One callable method. Decodes the request bytes, runs, and encodes the response.
pub trait ServiceMethod: Send + Sync {
    fn invoke(&self, controller: &mut RpcController, request: &[u8]) -> Result<Vec<u8>, MethodError>;
}

/// A named group of methods registered with the dispatcher. Invoked from any IO thread.
pub trait Service: Send + Sync {
    fn service_name(&self) -> &str;
    fn find_method(&self, name: &str) -> Option<&dyn ServiceMethod>;
}

struct TypedMethod<Req, Rsp, F> {
    handler: F,
    _marker: PhantomData<fn(Req) -> Rsp>,
}

impl<Req, Rsp, F> ServiceMethod for TypedMethod<Req, Rsp, F>
where
    Req: Message,
    Rsp: Message,
    F: Fn(&mut RpcController, Req) -> Rsp + Send + Sync,
{
    fn invoke(&self, controller: &mut RpcController, request: &[u8]) -> Result<Vec<u8>, MethodError> {
        let req = Req::decode_payload(request).map_err(MethodError::Request)?;
        let rsp = (self.handler)(controller, req);
        rsp.encode_payload().map_err(MethodError::Response)
    }
}

/// Service built from typed closures.
///
/// ```
/// # use reactrpc::{FnService, RpcController};
/// let svc = FnService::new("Echo").method("echo", |_: &mut RpcController, s: String| s);
/// ```
pub struct FnService {
    name: String,
    methods: HashMap<String, Box<dyn ServiceMethod>>,
}

impl FnService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Register `handler` as `name`, replacing any method of the same name.
    pub fn method<Req, Rsp, F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        Req: Message + 'static,
        Rsp: Message + 'static,
        F: Fn(&mut RpcController, Req) -> Rsp + Send + Sync + 'static,
    {
        self.methods.insert(
            name.into(),
            Box::new(TypedMethod {
                handler,
                _marker: PhantomData,
            }),
        );
        self
    }

    pub fn method_names(&self) -> Vec<&str> {
        self.methods.keys().map(|k| k.as_str()).collect()
    }
}

impl Service for FnService {
    fn service_name(&self) -> &str {
        &self.name
    }

    fn find_method(&self, name: &str) -> Option<&dyn ServiceMethod> {
        self.methods.get(name).map(|m| m.as_ref())
    }
}
