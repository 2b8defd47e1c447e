use anyhow::Result;
use docker_image_fetcher::api;
use docker_image_fetcher::cli::Args;
use docker_image_fetcher::download::DownloadEngine;
use docker_image_fetcher::Logger;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();
    args.validate().map_err(|e| anyhow::anyhow!(e))?;

    let config = args.to_config();
    let output = if config.quiet {
        Logger::new_quiet()
    } else {
        Logger::new(config.verbose)
    };

    output.section("Docker Image Fetcher");
    output.detail(&format!(
        "downloads root: {}",
        config.downloads_root.display()
    ));

    let engine = DownloadEngine::new(config.clone())?;

    let recovered = engine.recover().await?;
    if recovered > 0 {
        output.info(&format!("Recovered {} interrupted task(s)", recovered));
    }

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    output.success(&format!("Control API listening on http://{}", addr));

    let app = api::router(Arc::clone(&engine));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&engine)))
        .await?;

    output.info("Bye");
    Ok(())
}

async fn shutdown_signal(engine: Arc<DownloadEngine>) {
    let _ = tokio::signal::ctrl_c().await;
    engine.shutdown().await;
}
