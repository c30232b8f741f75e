#[tokio::main]
async fn main() -> anyhow::Result<()> {
    messaging_substrate::run().await
}
