#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    courier_server::run().await
}
