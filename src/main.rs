use powerocean_bridge::prelude::*;

#[tokio::main]
async fn main() {
    let options = Options::new();

    if let Err(e) = powerocean_bridge::run(options).await {
        // logging may not be up yet if the config failed to load
        eprintln!("powerocean-bridge: {:#}", e);
        error!("Application error: {:#}", e);
        std::process::exit(255);
    }
}
