#[tokio::main]
async fn main() {
    keystone::init_logging();
    if let Err(e) = keystone::run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
