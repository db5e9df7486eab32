use crate::protocol::RpcFrame;
use crate::rpc_controller::RpcController;
use crate::service::{MethodError, Service};
use crate::{logerr, logmsg};
use crate::{
    ERROR_FAILED_DESERIALIZE, ERROR_FAILED_SERIALIZE, ERROR_METHOD_NOT_FOUND,
    ERROR_PARSE_SERVICE_NAME, ERROR_SERVICE_NOT_FOUND,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// Routes request frames to registered services by `Service.method` name.
///
/// Registration happens before the server starts. After that it's shared read-only by all IO threads.
#[derive(Default)]
pub struct RpcDispatcher {
    services: HashMap<String, Arc<dyn Service>>,
}

impl RpcDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under its own name. A later service with the same name replaces the earlier.
    pub fn register_service(&mut self, service: Arc<dyn Service>) {
        let name = service.service_name().to_owned();
        logmsg!("register service {}", name);
        self.services.insert(name, service);
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Split `Service.method` on the first '.'. Both parts must be non-empty.
    pub fn parse_service_full_name(full_name: &str) -> Option<(&str, &str)> {
        match full_name.split_once('.') {
            Some((service, method)) if !service.is_empty() && !method.is_empty() => {
                Some((service, method))
            }
            _ => None,
        }
    }

    /// Build the response frame for `request`. The response always echoes msg_id and method_name.
    pub fn dispatch(
        &self,
        request: &RpcFrame,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> RpcFrame {
        let mut response = RpcFrame::new(
            request.msg_id.clone(),
            request.method_name.clone(),
            Vec::new(),
        );
        let Some((service_name, method_name)) =
            Self::parse_service_full_name(&request.method_name)
        else {
            return with_error(
                response,
                ERROR_PARSE_SERVICE_NAME,
                format!("parse service name error: {}", request.method_name),
            );
        };
        let Some(service) = self.services.get(service_name) else {
            return with_error(
                response,
                ERROR_SERVICE_NOT_FOUND,
                format!("service not found: {}", service_name),
            );
        };
        let Some(method) = service.find_method(method_name) else {
            return with_error(
                response,
                ERROR_METHOD_NOT_FOUND,
                format!("method not found: {}", method_name),
            );
        };

        let mut controller = RpcController {
            msg_id: request.msg_id.clone(),
            local_addr,
            peer_addr,
            ..Default::default()
        };
        match method.invoke(&mut controller, &request.payload) {
            Ok(payload) => {
                logmsg!(
                    "{} | dispatched {} from {:?}",
                    request.msg_id,
                    request.method_name,
                    peer_addr
                );
                response.payload = payload;
                if controller.error_code != 0 {
                    response.err_code = controller.error_code;
                    response.err_info = controller.error_info;
                }
            }
            Err(MethodError::Request(e)) => {
                response = with_error(
                    response,
                    ERROR_FAILED_DESERIALIZE,
                    format!("deserialize error: {}", e),
                );
            }
            Err(MethodError::Response(e)) => {
                response = with_error(
                    response,
                    ERROR_FAILED_SERIALIZE,
                    format!("serialize error: {}", e),
                );
            }
        }
        response
    }
}

fn with_error(mut response: RpcFrame, code: i32, info: String) -> RpcFrame {
    logerr!("{} | {}", response.msg_id, info);
    response.err_code = code;
    response.err_info = info;
    response
}
