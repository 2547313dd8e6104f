use blob_splitter::app;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    app::main().await
}
