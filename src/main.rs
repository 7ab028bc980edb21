#[tokio::main]
async fn main() {
    inbox_router::app::run().await;
}
