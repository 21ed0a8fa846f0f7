use std::net::TcpListener;

use log::{error, info};
use warp::Filter;

use mini_pix::config::Config;
use mini_pix::thumbnail_generator::ThumbnailGenerator;
use mini_pix::warp_helpers::{cors, handle_rejection};
use mini_pix::{handlers_file, handlers_health, handlers_image};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Config::from_env()?;
    let port = config.port;

    info!("Starting MiniPix server on Port {}", port);
    info!("Image root: {}", config.root_path);
    info!("Thumbnails directory: {}", config.thumbnails_dir);
    if let Some(watermark) = &config.watermark_path {
        info!("Watermark: {}", watermark);
    }

    // Check if port is available BEFORE wiring routes
    if !is_port_available(port) {
        error!(
            "Port {} is already in use. Please stop any existing MiniPix instances or use a different port.",
            port
        );
        return Err(format!("Port {} is already in use", port).into());
    }

    let thumbnail_generator = ThumbnailGenerator::new(&config);

    let health_routes = handlers_health::build_health_routes();
    let image_routes = handlers_image::build_image_routes(config.clone(), thumbnail_generator);
    let file_routes = handlers_file::build_file_routes(config);

    let routes = health_routes
        .or(image_routes)
        .or(file_routes)
        .with(cors())
        .with(warp::log("mini_pix"))
        .recover(handle_rejection);

    info!(
        "Server started successfully, listening on http://localhost:{}",
        port
    );

    warp::serve(routes).run(([0, 0, 0, 0], port)).await;

    Ok(())
}

fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}
