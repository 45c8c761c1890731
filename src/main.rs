#[tokio::main]
async fn main() -> anyhow::Result<()> {
    soulbrowser_wait::cli::run().await
}
