use std::{
    fmt, io,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use shared::{
    domain::ServerAddress,
    error::AddressError,
    protocol::Instruction,
};
use thiserror::Error;
use tokio::{
    net::TcpListener,
    sync::oneshot,
    time::{timeout_at, Instant},
};
use tracing::{info, info_span, warn, Instrument, Span};
use url::Url;

use crate::{
    control::{ControlChannelServer, SessionOutcome, SessionPlan},
    file_server::{RangeFileServer, ServedFile},
    serve::ServerHandle,
    viewer::{viewer_url, ViewerLauncher},
};

/// What the viewer should be told to load.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub query: Option<String>,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub request: SessionRequest,
    pub control_bind: SocketAddr,
    pub data_host: IpAddr,
    /// `None` lets the OS pick a free port.
    pub data_port: Option<u16>,
    pub ack_timeout: Option<Duration>,
    pub viewer_url: Url,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingAck,
    Completed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("nothing to serve: provide a query or a file")]
    NothingToServe,
    #[error("session is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },
    #[error("failed to bind {role} listener on {addr}: {source}")]
    Bind {
        role: &'static str,
        addr: SocketAddr,
        source: io::Error,
    },
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("control channel stopped without reporting an outcome")]
    ControlChannelGone,
}

/// Where a started session can be reached.
#[derive(Debug, Clone)]
pub struct SessionAddresses {
    pub control: SocketAddr,
    pub data: Option<ServerAddress>,
    pub viewer_url: Url,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub data: Option<ServerAddress>,
    /// Servers in the order they finished shutting down.
    pub stopped: Vec<&'static str>,
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.outcome)?;
        if let Some(data) = &self.data {
            write!(f, "; served from {data}")?;
        }
        Ok(())
    }
}

/// Owns both servers for one viewer session: starts the data plane (file
/// mode) before the control channel, and stops them in that same order once
/// the control channel reports the session over.
pub struct SessionCoordinator {
    config: SessionConfig,
    launcher: Arc<dyn ViewerLauncher>,
    state: SessionState,
    span: Span,
    data: Option<ServerHandle>,
    control: Option<ServerHandle>,
    outcome: Option<oneshot::Receiver<SessionOutcome>>,
    data_address: Option<ServerAddress>,
    ack_deadline: Option<Instant>,
}

impl SessionCoordinator {
    pub fn new(
        config: SessionConfig,
        launcher: Arc<dyn ViewerLauncher>,
        span: Span,
    ) -> Result<Self, SessionError> {
        if config.request.query.is_none() && config.request.file.is_none() {
            return Err(SessionError::NothingToServe);
        }
        Ok(Self {
            config,
            launcher,
            state: SessionState::Idle,
            span,
            data: None,
            control: None,
            outcome: None,
            data_address: None,
            ack_deadline: None,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Binds and starts both servers, then opens the viewer.
    pub async fn start(&mut self) -> Result<SessionAddresses, SessionError> {
        self.expect_state(SessionState::Idle)?;
        let span = self.span.clone();
        self.start_servers().instrument(span).await
    }

    async fn start_servers(&mut self) -> Result<SessionAddresses, SessionError> {
        let mut instructions = Vec::new();
        let mut served_file = None;
        let mut viewer_target = None;

        if let Some(path) = &self.config.request.file {
            let file = ServedFile::new(path.clone())?;
            let addr = SocketAddr::new(self.config.data_host, self.config.data_port.unwrap_or(0));
            let span = info_span!("data_plane", file = %file.name());
            let server = RangeFileServer::new(file.clone(), span.clone());
            let handle = start_server("data", addr, server.router(), span).await?;
            let address = ServerAddress::from_socket_addr(handle.local_addr())?;
            info!(%address, file = %file.path().display(), "data plane listening");

            instructions.push(Instruction::parquet_file(
                file.name().clone(),
                address.clone(),
            ));
            served_file = Some(file.path().to_path_buf());
            viewer_target = Some((address.clone(), file.name().clone()));
            self.data_address = Some(address);
            self.data = Some(handle);
        }

        if let Some(query) = &self.config.request.query {
            instructions.push(Instruction::sql(query.clone()));
        }

        let plan = SessionPlan {
            instructions,
            served_file,
            ack_timeout: self.config.ack_timeout,
        };
        let span = info_span!("control_channel");
        let (control, outcome) = ControlChannelServer::new(plan, span.clone());
        let handle =
            match start_server("control", self.config.control_bind, control.router(), span).await {
                Ok(handle) => handle,
                Err(error) => {
                    self.stop_data_plane().await;
                    return Err(error);
                }
            };
        let control_addr = handle.local_addr();
        info!(addr = %control_addr, "control channel listening");
        self.control = Some(handle);
        self.outcome = Some(outcome);
        // Counts from the moment a viewer could first connect.
        self.ack_deadline = self.config.ack_timeout.map(|limit| Instant::now() + limit);

        let url = viewer_url(
            &self.config.viewer_url,
            viewer_target.as_ref().map(|(address, name)| (address, name)),
        );
        if let Err(error) = self.launcher.launch(&url) {
            warn!(%url, %error, "failed to open viewer; open it manually");
        }

        self.state = SessionState::AwaitingAck;
        Ok(SessionAddresses {
            control: control_addr,
            data: self.data_address.clone(),
            viewer_url: url,
        })
    }

    /// Waits for the control channel to report the session over, then
    /// stops the data plane first and the control listener second. With an
    /// ack timeout configured the wait is bounded even if no viewer ever
    /// connects.
    pub async fn wait(&mut self) -> Result<SessionReport, SessionError> {
        self.expect_state(SessionState::AwaitingAck)?;
        let span = self.span.clone();
        async {
            let outcome = match (self.outcome.take(), self.ack_deadline) {
                (Some(outcome), Some(deadline)) => match timeout_at(deadline, outcome).await {
                    Ok(outcome) => outcome.ok(),
                    Err(_) => {
                        warn!("no acknowledgment before timeout");
                        Some(SessionOutcome::TimedOut)
                    }
                },
                (Some(outcome), None) => outcome.await.ok(),
                (None, _) => None,
            };
            info!(?outcome, "session over; shutting down");

            let mut stopped = Vec::new();
            stopped.extend(self.stop_data_plane().await);
            if let Some(control) = self.control.take() {
                let name = control.name();
                control.shutdown().await;
                stopped.push(name);
            }
            self.state = SessionState::Completed;

            outcome
                .map(|outcome| SessionReport {
                    outcome,
                    data: self.data_address.clone(),
                    stopped,
                })
                .ok_or(SessionError::ControlChannelGone)
        }
        .instrument(span)
        .await
    }

    async fn stop_data_plane(&mut self) -> Option<&'static str> {
        let data = self.data.take()?;
        let name = data.name();
        data.shutdown().await;
        Some(name)
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }
}

async fn start_server(
    role: &'static str,
    addr: SocketAddr,
    router: axum::Router,
    span: Span,
) -> Result<ServerHandle, SessionError> {
    let bind_error = |source| SessionError::Bind { role, addr, source };
    let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
    ServerHandle::spawn(role, listener, router, span).map_err(bind_error)
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
