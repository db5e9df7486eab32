use reactrpc::{FnService, RpcController};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MakeOrderRequest {
    pub price: i32,
    pub goods: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MakeOrderResponse {
    pub ret_code: i32,
    pub res_info: String,
    pub order_id: String,
}

#[allow(dead_code)]
pub fn order_service() -> FnService {
    FnService::new("Order").method(
        "makeOrder",
        |controller: &mut RpcController, req: MakeOrderRequest| {
            reactrpc::logmsg!(
                "{} | makeOrder {} x {} from {:?}",
                controller.msg_id,
                req.goods,
                req.price,
                controller.peer_addr
            );
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
}
