#[tokio::main]
async fn main() {
    beacon::start_server().await;
}
