fn main() {
    env_logger::init();

    let _ = ctrlc::set_handler(|| {
        log::info!("shutdown requested");
        gatebridge_service::http::request_shutdown();
    });

    if let Err(err) = gatebridge_service::run() {
        log::error!("service stopped: {err}");
        std::process::exit(1);
    }
}
