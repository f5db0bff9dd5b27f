#[tokio::main]
async fn main() -> anyhow::Result<()> {
    archivist_backup::run().await
}
