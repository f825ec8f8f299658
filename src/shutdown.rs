use std::sync::Arc;
use std::time::Duration;

use actix_web::dev::ServerHandle;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use crate::worker::Scheduler;

type ServerExit = Result<Result<(), std::io::Error>, JoinError>;

/// Handles graceful shutdown of the application
///
/// This module orchestrates graceful shutdown by:
/// 1. Listening for shutdown signals (SIGTERM, SIGINT/CTRL+C)
/// 2. Stopping the HTTP server (stops accepting new requests)
/// 3. Closing the scheduler so queued jobs are no longer dispatched
/// 4. Waiting, up to a grace period, for running uploads to finish
pub struct ShutdownCoordinator {
    server_handle: ServerHandle,
    server_task: JoinHandle<Result<(), std::io::Error>>,
    scheduler: Arc<Scheduler>,
    grace: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(
        server_handle: ServerHandle,
        server_task: JoinHandle<Result<(), std::io::Error>>,
        scheduler: Arc<Scheduler>,
        grace: Duration,
    ) -> Self {
        Self {
            server_handle,
            server_task,
            scheduler,
            grace,
        }
    }

    /// Wait for shutdown signal and perform graceful shutdown
    ///
    /// This function will block until either:
    /// - CTRL+C is received
    /// - SIGTERM is received (Unix only)
    /// - the HTTP server stops on its own
    pub async fn wait_for_shutdown(mut self) -> Result<(), std::io::Error> {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for CTRL+C: {}", e);
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
                    error!("Failed to install SIGTERM signal handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        // Wait for shutdown signal
        let server_exit = tokio::select! {
            _ = ctrl_c => {
                info!("Received CTRL+C signal, initiating graceful shutdown...");
                None
            }
            _ = terminate => {
                info!("Received SIGTERM signal, initiating graceful shutdown...");
                None
            }
            exit = &mut self.server_task => {
                warn!("HTTP server stopped unexpectedly, shutting down");
                Some(exit)
            }
        };

        self.shutdown(server_exit).await
    }

    /// Perform the actual shutdown sequence
    async fn shutdown(self, server_exit: Option<ServerExit>) -> Result<(), std::io::Error> {
        // 1. Stop HTTP server (stop accepting new requests)
        if server_exit.is_none() {
            info!("Stopping HTTP server (no longer accepting new requests)...");
            self.server_handle.stop(true).await;
            info!("HTTP server stopped accepting new requests");
        }

        // 2. Stop dispatching queued jobs
        let abandoned = self.scheduler.close();
        if abandoned > 0 {
            warn!("{} queued jobs will not run; job state is not persisted", abandoned);
        }

        // 3. Give running uploads a chance to finish
        let running = self.scheduler.stats().running;
        if running > 0 {
            info!(
                "Waiting up to {}s for {} running uploads to finish...",
                self.grace.as_secs(),
                running
            );
        }
        match tokio::time::timeout(self.grace, self.scheduler.wait_idle()).await {
            Ok(()) => info!("All running uploads finished"),
            Err(_) => warn!(
                "{} uploads still running after {}s, abandoning them",
                self.scheduler.stats().running,
                self.grace.as_secs()
            ),
        }

        // 4. Wait for HTTP server task to complete
        let server_exit = match server_exit {
            Some(exit) => exit,
            None => self.server_task.await,
        };
        match server_exit {
            Ok(Ok(())) => info!("HTTP server shut down successfully"),
            Ok(Err(e)) => {
                error!("HTTP server encountered error during shutdown: {:?}", e);
                return Err(e);
            }
            Err(e) => error!("HTTP server task panicked: {:?}", e),
        }

        info!("Graceful shutdown completed successfully");
        Ok(())
    }
}
