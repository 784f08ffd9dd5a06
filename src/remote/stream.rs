use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::credentials::{AuthToken, CredentialsProvider};
use crate::error::{SyncError, SyncErrorCode, SyncResult};
use crate::remote::backoff::{Backoff, BackoffConfig};
use crate::remote::transport::{Connection, StreamHandle};
use crate::util::runtime;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Listen,
    Write,
}

/// Observable lifecycle of a persistent stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Initial,
    Authenticating,
    Open,
    Backoff,
    Stopped,
}

/// Per-RPC behavior plugged into [`PersistentStream`].
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    fn label(&self) -> &'static str;

    /// Consulted between transitions; returning `false` winds the stream
    /// down without reconnecting.
    fn should_continue(&self) -> bool;

    async fn on_open(
        &self,
        stream: Arc<dyn StreamHandle>,
        token: Option<AuthToken>,
    ) -> SyncResult<()>;

    async fn on_message(&self, payload: Vec<u8>) -> SyncResult<()>;

    async fn on_close(&self);

    async fn on_error(&self, error: SyncError);
}

/// Drives one long-lived stream through the explicit state machine
/// `Initial -> Authenticating -> Open -> Backoff -> Authenticating ...`,
/// reconnecting until stopped. Authentication happens on every attempt; an
/// `Unauthenticated` failure forces a token refresh on the next one.
pub struct PersistentStream {
    connection: Arc<dyn Connection>,
    credentials: Arc<dyn CredentialsProvider>,
    kind: StreamKind,
    backoff_config: BackoffConfig,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<StreamState>>,
}

struct PumpOutcome {
    error: Option<SyncError>,
    stopped: bool,
}

impl PersistentStream {
    pub fn new(
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        kind: StreamKind,
        backoff_config: BackoffConfig,
    ) -> Self {
        Self {
            connection,
            credentials,
            kind,
            backoff_config,
            running: Arc::new(AtomicBool::new(true)),
            state: Arc::new(Mutex::new(StreamState::Initial)),
        }
    }

    pub fn start<H>(self, handler: Arc<H>) -> PersistentStreamHandle
    where
        H: StreamHandler,
    {
        let handle = PersistentStreamHandle {
            running: Arc::clone(&self.running),
            state: Arc::clone(&self.state),
        };
        runtime::spawn_detached(async move {
            self.run(handler).await;
        });
        handle
    }

    fn set_state(&self, state: StreamState) {
        *self.state.lock().unwrap() = state;
    }

    fn is_running<H: StreamHandler>(&self, handler: &H) -> bool {
        self.running.load(Ordering::SeqCst) && handler.should_continue()
    }

    async fn run<H>(self, handler: Arc<H>)
    where
        H: StreamHandler,
    {
        let label = handler.label();
        let mut backoff = Backoff::new(self.backoff_config);
        let mut force_refresh = false;

        while self.is_running(handler.as_ref()) {
            self.set_state(StreamState::Authenticating);
            let token = match self.credentials.get_token(force_refresh).await {
                Ok(token) => {
                    force_refresh = false;
                    token
                }
                Err(err) => {
                    handler.on_error(err.clone()).await;
                    self.backoff_sleep(&mut backoff, Some(&err), label).await;
                    continue;
                }
            };

            let open_result = match self.kind {
                StreamKind::Listen => self.connection.open_listen_stream().await,
                StreamKind::Write => self.connection.open_write_stream().await,
            };
            let stream = match open_result {
                Ok(stream) => stream,
                Err(err) => {
                    handler.on_error(err.clone()).await;
                    self.backoff_sleep(&mut backoff, Some(&err), label).await;
                    continue;
                }
            };

            if !self.is_running(handler.as_ref()) {
                let _ = stream.close().await;
                break;
            }

            self.set_state(StreamState::Open);
            if let Err(err) = handler.on_open(Arc::clone(&stream), token).await {
                if err.code == SyncErrorCode::Unauthenticated {
                    force_refresh = true;
                }
                handler.on_error(err.clone()).await;
                let _ = stream.close().await;
                self.backoff_sleep(&mut backoff, Some(&err), label).await;
                continue;
            }

            let outcome = self.pump(handler.as_ref(), stream, &mut backoff).await;
            if outcome.stopped {
                break;
            }
            if let Some(err) = &outcome.error {
                if err.code == SyncErrorCode::Unauthenticated {
                    force_refresh = true;
                }
            }
            self.backoff_sleep(&mut backoff, outcome.error.as_ref(), label)
                .await;
        }

        self.set_state(StreamState::Stopped);
        handler.on_close().await;
    }

    async fn pump<H>(
        &self,
        handler: &H,
        stream: Arc<dyn StreamHandle>,
        backoff: &mut Backoff,
    ) -> PumpOutcome
    where
        H: StreamHandler,
    {
        let mut round_trip_complete = false;
        loop {
            if !self.is_running(handler) {
                let _ = stream.close().await;
                return PumpOutcome {
                    error: None,
                    stopped: true,
                };
            }

            match stream.next().await {
                Some(Ok(payload)) => {
                    // A stream stopped mid-flight must not deliver further
                    // callbacks.
                    if !self.is_running(handler) {
                        let _ = stream.close().await;
                        return PumpOutcome {
                            error: None,
                            stopped: true,
                        };
                    }
                    match handler.on_message(payload).await {
                        Ok(()) => {
                            if !round_trip_complete {
                                round_trip_complete = true;
                                backoff.reset();
                            }
                        }
                        Err(err) => {
                            handler.on_error(err.clone()).await;
                            let _ = stream.close().await;
                            return PumpOutcome {
                                error: Some(err),
                                stopped: false,
                            };
                        }
                    }
                }
                Some(Err(err)) => {
                    handler.on_error(err.clone()).await;
                    return PumpOutcome {
                        error: Some(err),
                        stopped: false,
                    };
                }
                None => {
                    // Clean close by the peer; reconnect silently.
                    return PumpOutcome {
                        error: None,
                        stopped: false,
                    };
                }
            }
        }
    }

    async fn backoff_sleep(
        &self,
        backoff: &mut Backoff,
        error: Option<&SyncError>,
        label: &'static str,
    ) {
        self.set_state(StreamState::Backoff);
        let delay = backoff.next_delay_for(error);
        if !delay.is_zero() {
            log::debug!("stream {label} backing off for {delay:?}");
        }
        runtime::sleep(delay).await;
    }
}

/// Control handle for a started stream; stopping prevents any further
/// callbacks once the current operation finishes.
pub struct PersistentStreamHandle {
    running: Arc<AtomicBool>,
    state: Arc<Mutex<StreamState>>,
}

impl PersistentStreamHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock().unwrap()
    }
}
