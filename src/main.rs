#![cfg(not(target_arch = "wasm32"))]

use log::{error, info, LevelFilter};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .filter_module("wgpu_core", LevelFilter::Warn)
        .filter_module("wgpu_hal", LevelFilter::Warn)
        .init();

    info!("Starting HZB occlusion culling demo...");
    info!("F frustum | H hzb | C cull/visualize | [ ] mip | space freeze | V count");

    match std::panic::catch_unwind(hzb_occlusion::run_native) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("Renderer failed: {e:#}");
            std::process::exit(1);
        }
        Err(e) => {
            error!("Renderer terminated abruptly: {:?}", e);
            std::process::exit(1);
        }
    }
}
