#[tokio::main]
async fn main() {
    logs_router::main().await
}
