//! Server acceptor.
//!
//! Wraps a transport [`Listener`]: each accepted connection gets a
//! [`Session`] on a freshly spawned worker, with an optional keepalive
//! companion task. Shutdown cancels the accept loop and then waits for
//! every session worker to terminate.

use std::sync::Arc;

use coapd_msg::{Code, ContentFormat};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::dispatch::{BoundedPool, WorkPool};
use crate::error::{default_error_sink, Error, ErrorSink, Result};
use crate::keepalive::KeepAlive;
use crate::session::{Handler, Session};
use crate::transport::Listener;

/// Callback invoked for every accepted session.
pub type OnNewSession = Arc<dyn Fn(&Session) + Send + Sync>;

/// A CoAP server over any [`Listener`].
pub struct Server {
    config: Config,
    handler: Handler,
    work_pool: Arc<dyn WorkPool>,
    errors: ErrorSink,
    on_new_session: Option<OnNewSession>,
    cancel: CancellationToken,
}

impl Server {
    /// Create a server with the default handler (4.04 Not Found), error
    /// sink and work pool.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            handler: Arc::new(|writer, _request| {
                writer.set_response(Code::NOT_FOUND, ContentFormat::TEXT_PLAIN, &[][..]);
            }),
            work_pool: Arc::new(BoundedPool::default()),
            errors: default_error_sink(),
            on_new_session: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the request handler.
    pub fn with_handler(mut self, handler: Handler) -> Self {
        self.handler = handler;
        self
    }

    /// Replace the work pool handlers run on.
    pub fn with_work_pool(mut self, work_pool: Arc<dyn WorkPool>) -> Self {
        self.work_pool = work_pool;
        self
    }

    /// Replace the background error sink.
    pub fn with_error_sink(mut self, errors: ErrorSink) -> Self {
        self.errors = errors;
        self
    }

    /// Install a callback observing every accepted session.
    pub fn with_on_new_session(mut self, on_new_session: OnNewSession) -> Self {
        self.on_new_session = Some(on_new_session);
        self
    }

    /// Token cancelled when [`Server::stop`] is called.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal shutdown; `serve` drains its sessions and returns.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Accept sessions until stopped. Each session runs on its own
    /// worker; the call returns once every worker has terminated.
    pub async fn serve<L: Listener>(&self, mut listener: L) -> Result<()> {
        let keepalive = KeepAlive::from_config(&self.config.keepalive).map(Arc::new);
        let mut workers = JoinSet::new();

        info!("coap server accepting sessions");
        loop {
            let conn = tokio::select! {
                _ = self.cancel.cancelled() => break,
                conn = listener.accept(&self.cancel) => conn,
            };
            let conn = match conn {
                Ok(conn) => conn,
                Err(Error::Cancelled) | Err(Error::Closed) => break,
                Err(err) => {
                    (self.errors)(&err);
                    continue;
                }
            };

            let session = Session::new(
                conn,
                self.config.clone(),
                self.handler.clone(),
                self.work_pool.clone(),
                self.errors.clone(),
            );
            if let Some(on_new_session) = &self.on_new_session {
                on_new_session(&session);
            }

            // Sessions die with the server.
            let server_cancel = self.cancel.clone();
            let session_cancel = session.cancelled();
            let watched = session.clone();
            workers.spawn(async move {
                tokio::select! {
                    _ = server_cancel.cancelled() => watched.close(),
                    _ = session_cancel.cancelled() => {}
                }
            });

            debug!(peer = %session.peer_addr(), "session worker starting");
            let runner = session.clone();
            let errors = self.errors.clone();
            workers.spawn(async move {
                if let Err(err) = runner.run().await {
                    (errors)(&err);
                }
            });

            if let Some(keepalive) = &keepalive {
                let keepalive = Arc::clone(keepalive);
                workers.spawn(async move {
                    keepalive.run(session).await;
                });
            }
        }

        listener.close();
        self.cancel.cancel();
        debug!("waiting for session workers");
        while workers.join_next().await.is_some() {}
        info!("coap server stopped");
        Ok(())
    }
}
