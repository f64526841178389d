//! Bootstrap binary (`SPEC_FULL.md` §6's `[ADDED]` process-bootstrap
//! note, grounded on `original_source/main.c`'s `main`): binds the
//! listening socket once, primes the route table, spawns one worker
//! per configured OS thread, and waits for `SIGINT`/`SIGTERM` to clear
//! a shared stop flag every worker polls.

use bff_edge::config::Config;
use bff_edge::errors::WorkerError;
use bff_edge::metrics::{MetricsSink, TracingMetrics};
use bff_edge::pool::{LockfreePool, MutexPool};
use bff_edge::routes::RouteTable;
use bff_edge::server::worker::{self as worker, Pool, WorkerConfig};
use clap::Parser as _;
use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let std_listener = bind_listener(config.bind)?;
    std_listener.set_nonblocking(true)?;

    let worker_count = config.worker_count();
    tracing::info!(bind = %config.bind, workers = worker_count, pool = ?config.pool, "starting bff-edge");

    let routes = Arc::new(RouteTable::new());
    let metrics: Arc<dyn MetricsSink> = Arc::new(TracingMetrics);
    let pool = Arc::new(build_pool(&config, worker_count));
    let shutdown = Arc::new(AtomicBool::new(false));

    install_signal_handlers(shutdown.clone());

    let mut handles = Vec::with_capacity(worker_count);
    for worker_id in 0..worker_count {
        let std_listener = std_listener.try_clone()?;
        let routes = routes.clone();
        let metrics = metrics.clone();
        let pool = pool.clone();
        let shutdown = shutdown.clone();
        let request_timeout = config.request_timeout();
        let keep_alive_timeout = config.keep_alive_timeout();

        let handle = std::thread::Builder::new()
            .name(format!("bff-edge-worker-{worker_id}"))
            .spawn(move || {
                run_worker(
                    worker_id,
                    std_listener,
                    pool,
                    routes,
                    metrics,
                    request_timeout,
                    keep_alive_timeout,
                    shutdown,
                )
            })?;
        handles.push(handle);
    }

    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(error = %err, "worker exited with a fatal error"),
            Err(_) => tracing::error!("worker thread panicked"),
        }
    }

    tracing::info!("bff-edge stopped");
    Ok(())
}

/// One worker's OS thread body: builds a dedicated current-thread tokio
/// runtime (`SPEC_FULL.md` §6: "a current-thread runtime per OS thread
/// ... preserving 'each worker is single-threaded internally'") and
/// drives [`bff_edge::server::worker::run`]'s accept/connection loop to
/// completion inside it.
fn run_worker(
    worker_id: usize,
    std_listener: StdTcpListener,
    pool: Arc<Pool>,
    routes: Arc<RouteTable>,
    metrics: Arc<dyn MetricsSink>,
    request_timeout: std::time::Duration,
    keep_alive_timeout: std::time::Duration,
    shutdown: Arc<AtomicBool>,
) -> Result<(), WorkerError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(WorkerError::RuntimeInit)?;

    runtime.block_on(async move {
        let listener = TcpListener::from_std(std_listener).map_err(WorkerError::RuntimeInit)?;
        let config = WorkerConfig {
            worker_id,
            cpu_id: worker_id,
            request_timeout,
            keep_alive_timeout,
        };
        worker::run(Arc::new(listener), pool, routes, metrics, config, shutdown).await
    })
}

fn build_pool(config: &Config, worker_count: usize) -> Pool {
    use bff_edge::config::PoolKind;

    match config.pool {
        PoolKind::Mutex => Pool::Mutex(MutexPool::new(bff_edge::pool::mutex_pool::DEFAULT_CAPACITY)),
        PoolKind::PerCpu => Pool::PerCpu(LockfreePool::new(worker_count, bff_edge::pool::lockfree_pool::CONNECTIONS_PER_CORE)),
    }
}

/// Binds the listening socket once via `socket2`, setting
/// `SO_REUSEADDR`/`SO_REUSEPORT` before `bind`+`listen`
/// (`original_source/main.c`'s socket setup, `SPEC_FULL.md` §6).
fn bind_listener(addr: std::net::SocketAddr) -> std::io::Result<StdTcpListener> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

/// Installs `SIGINT`/`SIGTERM` handling on a dedicated tiny tokio
/// runtime, setting `shutdown` once either fires
/// (`original_source/main.c`'s `sig_handler` clearing `g_running`).
/// `SIGPIPE` needs no explicit handling under tokio: write errors
/// surface as `Err(BrokenPipe)` rather than a process signal.
fn install_signal_handlers(shutdown: Arc<AtomicBool>) {
    std::thread::Builder::new()
        .name("bff-edge-signals".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(err) => {
                    tracing::error!(error = %err, "failed to start signal-handling runtime, Ctrl-C will not stop workers gracefully");
                    return;
                }
            };
            runtime.block_on(async move {
                #[cfg(unix)]
                {
                    use tokio::signal::unix::{signal, SignalKind};
                    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
                    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
                    tokio::select! {
                        _ = sigint.recv() => {}
                        _ = sigterm.recv() => {}
                    }
                }
                #[cfg(not(unix))]
                {
                    let _ = tokio::signal::ctrl_c().await;
                }
                tracing::info!("shutdown signal received");
                shutdown.store(true, Ordering::Relaxed);
            });
        })
        .expect("failed to spawn signal-handling thread");
}
