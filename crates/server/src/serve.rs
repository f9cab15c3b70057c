use std::{io, net::SocketAddr, time::Duration};

use axum::Router;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle, time::timeout};
use tracing::{debug, warn, Instrument, Span};

/// How long a stopped server may spend draining open connections before its
/// task is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A running axum server that owns its listening socket until shut down.
pub struct ServerHandle {
    name: &'static str,
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<io::Result<()>>,
}

impl ServerHandle {
    pub fn spawn(
        name: &'static str,
        listener: TcpListener,
        router: Router,
        span: Span,
    ) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        let _ = signal.await;
                    })
                    .await
            }
            .instrument(span),
        );
        Ok(Self {
            name,
            local_addr,
            shutdown: Some(shutdown),
            task,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections, then waits a bounded time for in-flight
    /// requests to finish.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match timeout(SHUTDOWN_GRACE, &mut self.task).await {
            Ok(Ok(Ok(()))) => debug!(server = self.name, addr = %self.local_addr, "server stopped"),
            Ok(Ok(Err(error))) => warn!(server = self.name, %error, "server exited with error"),
            Ok(Err(error)) => warn!(server = self.name, %error, "server task failed"),
            Err(_) => {
                warn!(
                    server = self.name,
                    "server did not drain within {SHUTDOWN_GRACE:?}; aborting"
                );
                self.task.abort();
            }
        }
    }
}
