use std::{future::IntoFuture, process, sync::Arc};

use depthcast::{
    application::{
        CommandRenderer, PriorityQueue, RequestGateway, WorkerPool, error::AppError,
        renderer::Renderer,
    },
    cache::StoreConfig,
    config,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        telemetry,
    },
};
use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    match command {
        config::Command::Serve(_) => {
            telemetry::init(&settings.logging).map_err(AppError::from)?;
            run_serve(settings).await
        }
        config::Command::CheckConfig(_) => {
            println!("{settings:#?}");
            Ok(())
        }
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let store = StoreConfig::from(&settings.cache).open()?;
    let queue = Arc::new(PriorityQueue::new(settings.broker.queue_capacity));

    let renderer: Arc<dyn Renderer> = Arc::new(
        CommandRenderer::new(&settings.renderer.program, &settings.renderer.work_dir)
            .map_err(|err| {
                InfraError::configuration(format!(
                    "renderer work directory `{}` is unusable: {err}",
                    settings.renderer.work_dir.display()
                ))
            })?
            .with_timeout(settings.renderer.timeout),
    );

    let pool = WorkerPool::spawn(
        settings.broker.workers,
        Arc::clone(&queue),
        Arc::clone(&store),
        renderer,
    )
    .map_err(InfraError::from)?;

    let gateway = RequestGateway::new(store, queue, settings.broker.gateway_policy());
    let state = HttpState::new(
        gateway,
        pool.size(),
        settings.broker.max_inflight_requests,
    );

    let served = serve_http(&settings, state).await;

    let dropped = tokio::task::spawn_blocking(move || pool.shutdown())
        .await
        .map_err(|err| AppError::unexpected(format!("worker shutdown failed: {err}")))?;
    info!(
        target = "depthcast::serve",
        dropped_jobs = dropped,
        "Render workers stopped"
    );

    served
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "depthcast::serve",
        addr = %settings.server.addr,
        workers = settings.broker.workers.get(),
        queue_capacity = settings.broker.queue_capacity.map_or(0, |c| c.get()),
        renderer = %settings.renderer.program.display(),
        "Listening"
    );

    let (stop_tx, mut stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    let mut drain_rx = stop_rx.clone();
    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown(
        async move {
            let _ = stop_rx.wait_for(|stop| *stop).await;
        },
    );

    let grace = settings.server.graceful_shutdown;
    tokio::select! {
        result = server.into_future() => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        _ = async move {
            let _ = drain_rx.wait_for(|stop| *stop).await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(
                target = "depthcast::serve",
                grace_seconds = grace.as_secs(),
                "Open requests did not finish before the shutdown deadline"
            );
        }
    }

    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(target = "depthcast::serve", error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(target = "depthcast::serve", error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!(target = "depthcast::serve", "Received Ctrl-C, shutting down"),
        () = terminate => info!(target = "depthcast::serve", "Received SIGTERM, shutting down"),
    }
}
