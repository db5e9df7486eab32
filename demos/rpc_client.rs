use reactrpc::{logmsg, EventLoop, RpcChannel, RpcController};
mod order;

fn run(addr: &str) -> reactrpc::Result<()> {
    let peer_addr = reactrpc::parse_addr(addr)?;
    let lp = EventLoop::new()?;
    let channel = RpcChannel::new(peer_addr);
    let request = order::MakeOrderRequest {
        price: 100,
        goods: "apple".to_owned(),
    };
    lp.post(move |lp| {
        channel.call(
            lp,
            "Order.makeOrder",
            &request,
            RpcController::new().with_timeout(2000),
            |lp, controller, rsp: Option<order::MakeOrderResponse>| {
                if controller.error_code == 0 {
                    logmsg!("{} | call rpc success, response {:?}", controller.msg_id, rsp);
                } else {
                    logmsg!(
                        "{} | call rpc failed, error code [{}], error info [{}]",
                        controller.msg_id,
                        controller.error_code,
                        controller.error_info
                    );
                }
                lp.stop();
            },
        );
    });
    lp.run();
    Ok(())
}

fn main() {
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:12345".to_owned());
    if let Err(e) = run(&addr) {
        println!("rpc_client error: {}", e);
    }
    println!("End of rpc_client!");
}
