#[tokio::main]
async fn main() -> anyhow::Result<()> {
    textbridge::run().await
}
