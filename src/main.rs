#[tokio::main]
async fn main() -> anyhow::Result<()> {
    as2_gateway::server::run().await
}
