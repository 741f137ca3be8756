use std::process::ExitCode;

use anyhow::Context;
use framepipe_pipeline::{ResultPayload, ResultStatus};
use framepipe_worker::{LogFormat, Worker, WorkerConfig};
use tokio::io::AsyncReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Usage: `framepipe-worker [JOB_JSON_PATH | -]`
///
/// Reads one job description (from the file, or stdin when omitted or `-`),
/// runs it and prints the result payload as JSON on stdout.
#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();

    // Warnings about invalid settings go through a plain subscriber until
    // the configured log format is installed.
    let bootstrap = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .finish();
    let config = tracing::subscriber::with_default(bootstrap, WorkerConfig::from_env);

    // stdout carries the result payload only.
    let json_logs = config.log_format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "framepipe_worker=info,framepipe_pipeline=info,framepipe_monitor=info".into()
            }),
        )
        .with(json_logs.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!json_logs).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();

    tracing::info!(
        output_dir = %config.output_dir.display(),
        temp_dir = %config.temp_dir.display(),
        cache_dir = %config.cache_dir.display(),
        "Worker starting"
    );

    let source = std::env::args().nth(1);
    let description = read_description(source.as_deref())
        .await
        .context("Failed to read job description")?;

    let mut worker = Worker::new(config);
    worker.start();

    let payload = tokio::select! {
        payload = worker.run_request(&description) => payload,
        () = shutdown_signal() => ResultPayload::error("interrupted by shutdown signal"),
    };

    worker.shutdown().await.context("Resource monitor did not stop cleanly")?;

    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(match payload.status {
        ResultStatus::Complete => ExitCode::SUCCESS,
        ResultStatus::Error => ExitCode::FAILURE,
    })
}

async fn read_description(source: Option<&str>) -> anyhow::Result<String> {
    match source {
        Some(path) if path != "-" => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Cannot read {path}")),
        _ => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            Ok(buf)
        }
    }
}

/// Resolves on SIGINT or SIGTERM. A stage interrupted this way resumes from
/// its checkpoint on resubmission.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), stopping");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, stopping");
        }
    }
}
