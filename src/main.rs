#[tokio::main]
async fn main() {
    if let Err(e) = voxroom_lib::run().await {
        tracing::error!("voxroom exited: {}", e);
        eprintln!("voxroom: {}", e);
        std::process::exit(1);
    }
}
