use reactrpc::{logerr, logger, logmsg, RpcConfig, RpcDispatcher, TcpServer};
use std::sync::Arc;
mod order;

fn run(config: &RpcConfig) -> reactrpc::Result<()> {
    let logger = logger::init_global(config)?;

    let mut dispatcher = RpcDispatcher::new();
    dispatcher.register_service(Arc::new(order::order_service()));

    let server = TcpServer::from_config(config, Arc::new(dispatcher))?;
    let _sync_timer = logger.start_sync_timer(server.event_loop());
    logmsg!("rpc_server listening on {}", server.local_addr());
    server.start()?;
    logger.flush();
    Ok(())
}

fn main() {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "conf/reactrpc.toml".to_owned());
    let config = match RpcConfig::from_file(&path) {
        Ok(c) => c,
        Err(e) => {
            logerr!("failed to load {}: {}, using defaults", path, e);
            RpcConfig::default()
        }
    };
    if let Err(e) = run(&config) {
        logerr!("rpc_server exited with error: {}", e);
    }
    println!("End of rpc_server!");
}
