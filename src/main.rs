#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = supermarks_rust::run().await {
        eprintln!("supermarks-rust fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
