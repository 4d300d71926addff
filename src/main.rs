//! lakesync entry point: configuration, store wiring, worker startup, and
//! the HTTP/WebSocket server.

use std::process::ExitCode;
use std::sync::Arc;

use lakesync::config::{Config, Side};
use lakesync::{Core, api};

const EXIT_INVALID_CONFIG: u8 = 2;
const EXIT_DATA_DIR: u8 = 3;
const EXIT_FATAL_FS: u8 = 4;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("invalid configuration: {e}");
            return ExitCode::from(EXIT_INVALID_CONFIG);
        }
    };

    if let Err(e) = std::fs::create_dir_all(&config.app_data_dir) {
        log::error!(
            "app data directory {} is inaccessible: {e}",
            config.app_data_dir.display()
        );
        return ExitCode::from(EXIT_DATA_DIR);
    }

    for side in [Side::Local, Side::Lake] {
        let root = config.root(side);
        if let Err(e) = std::fs::read_dir(root) {
            log::error!("{side} models root {} is unreadable: {e}", root.display());
            return ExitCode::from(EXIT_FATAL_FS);
        }
    }

    let core = match Core::open(config) {
        Ok(core) => core,
        Err(e) => {
            log::error!("failed to open stores: {e}");
            return ExitCode::from(EXIT_FATAL_FS);
        }
    };

    log::info!("local root: {}", core.config.local.root.display());
    log::info!("lake root:  {}", core.config.lake.root.display());
    log::info!("data dir:   {}", core.config.app_data_dir.display());

    let _executor = core.start_executor();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("failed to start async runtime: {e}");
            return ExitCode::from(EXIT_FATAL_FS);
        }
    };

    let result = runtime.block_on(serve(Arc::clone(&core)));
    core.request_stop();
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("server error: {e}");
            ExitCode::from(EXIT_FATAL_FS)
        }
    }
}

async fn serve(core: Arc<Core>) -> std::io::Result<()> {
    let addr = format!("{}:{}", core.config.host, core.config.port);
    let app = api::router(core);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("listening on http://{addr}");
    axum::serve(listener, app).await
}
