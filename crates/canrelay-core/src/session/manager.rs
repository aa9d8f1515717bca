//! Session manager for UDS request/response exchanges

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{SessionError, SessionState};
use crate::bus::{BusChannel, BusError};
use crate::config::UdsSessionConfig;
use crate::frame::{BusHandle, Frame};
use crate::isotp::{self, FlowStatus, FrameLayout, IsoTpError, Pdu, Reassembler, Segmented};
use crate::log::hex_bytes;
use crate::uds::{service_id, NegativeResponseCode, UdsRequest, UdsResponse, STATUS_TIMEOUT};

/// How often the bus is polled while waiting for the ECU
pub const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Upper bound for a response the ECU keeps deferring with "response pending"
pub const RESPONSE_PENDING_LIMIT: Duration = Duration::from_millis(30000);

/// Flow control WAIT frames accepted before giving up (N_WFTmax)
const MAX_FLOW_CONTROL_WAITS: usize = 10;

/// Flow control sent when receiving a segmented response
const RX_BLOCK_SIZE: u8 = 0;
const RX_ST_MIN: u8 = 0;

struct Inner {
    state: SessionState,
    config: Option<UdsSessionConfig>,
    /// Bumped by every initialize so stale in-flight guards cannot touch a new session
    generation: u64,
}

/// Single UDS session over a bus channel
///
/// `initialize` → any number of `request_response` → `teardown`. Only one
/// session may be active, and only one request may be outstanding; a second
/// concurrent request is rejected rather than queued.
pub struct UdsTransportSession {
    bus: Arc<dyn BusChannel>,
    inner: Mutex<Inner>,
}

impl UdsTransportSession {
    pub fn new(bus: Arc<dyn BusChannel>) -> Self {
        Self {
            bus,
            inner: Mutex::new(Inner {
                state: SessionState::Uninitialized,
                config: None,
                generation: 0,
            }),
        }
    }

    /// Get the current session state
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Get the active session configuration
    pub fn config(&self) -> Option<UdsSessionConfig> {
        self.inner.lock().config.clone()
    }

    /// Start a session with the given protocol parameters
    pub fn initialize(&self, config: UdsSessionConfig) -> Result<(), SessionError> {
        config
            .validate()
            .map_err(|e| SessionError::InvalidConfig(e.to_string()))?;

        let mut inner = self.inner.lock();
        if inner.state != SessionState::Uninitialized {
            return Err(SessionError::AlreadyActive);
        }
        info!(
            timeout_ms = config.response_timeout_ms,
            use_canfd = config.use_canfd,
            version = ?config.transport_version,
            "UDS session initialized"
        );
        inner.generation += 1;
        inner.config = Some(config);
        inner.state = SessionState::Ready;
        Ok(())
    }

    /// Release the session. Calling it without an active session is a no-op.
    pub fn teardown(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Uninitialized {
            debug!("UDS teardown without active session");
            return;
        }
        inner.state = SessionState::Uninitialized;
        inner.config = None;
        info!("UDS session torn down");
    }

    /// Send a request and wait for the matching response
    ///
    /// Session-state violations are returned as errors. Everything that
    /// happens on the bus (timeouts, transmit failures, malformed transfers)
    /// is reported through a failed [`UdsResponse`]. A negative response from
    /// the ECU is a successful exchange.
    pub async fn request_response(
        &self,
        bus: BusHandle,
        request: &UdsRequest,
    ) -> Result<UdsResponse, SessionError> {
        let (config, _guard) = self.begin_request()?;

        let mut exchange = Exchange {
            bus: self.bus.as_ref(),
            handle: bus,
            layout: FrameLayout::from_config(&config),
            timeout: config.response_timeout(),
            request,
            backlog: VecDeque::new(),
        };

        let response = match exchange.run().await {
            Ok(data) => UdsResponse::success(data),
            Err(e) => {
                warn!(
                    %bus,
                    sid = format!("0x{:02X}", request.service_id),
                    error = %e,
                    "UDS request failed"
                );
                UdsResponse::failure(e.to_string())
            }
        };
        Ok(response)
    }

    fn begin_request(&self) -> Result<(UdsSessionConfig, InFlightGuard<'_>), SessionError> {
        let mut inner = self.inner.lock();
        match inner.state {
            SessionState::Uninitialized => Err(SessionError::NotInitialized),
            SessionState::RequestInFlight => Err(SessionError::RequestInFlight),
            SessionState::Ready => {
                let config = inner.config.clone().ok_or(SessionError::NotInitialized)?;
                inner.state = SessionState::RequestInFlight;
                let guard = InFlightGuard {
                    inner: &self.inner,
                    generation: inner.generation,
                };
                Ok((config, guard))
            }
        }
    }
}

/// Returns the session to `Ready` when the request finishes or is dropped
struct InFlightGuard<'a> {
    inner: &'a Mutex<Inner>,
    generation: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if inner.generation == self.generation && inner.state == SessionState::RequestInFlight {
            inner.state = SessionState::Ready;
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ExchangeError {
    #[error("{}", STATUS_TIMEOUT)]
    Timeout,

    #[error("timeout waiting for flow control")]
    FlowControlTimeout,

    #[error("flow control overflow")]
    FlowControlOverflow,

    #[error("too many flow control wait frames")]
    FlowControlWaitExceeded,

    #[error("invalid request: {0}")]
    InvalidRequest(IsoTpError),

    #[error("transport error: {0}")]
    Transport(#[from] IsoTpError),

    #[error("transmit failed: {0}")]
    Transmit(#[from] BusError),
}

/// One request/response exchange on one bus
struct Exchange<'a> {
    bus: &'a dyn BusChannel,
    handle: BusHandle,
    layout: FrameLayout,
    timeout: Duration,
    request: &'a UdsRequest,
    /// Frames from the ECU received but not yet consumed
    backlog: VecDeque<Frame>,
}

impl Exchange<'_> {
    async fn run(&mut self) -> Result<Vec<u8>, ExchangeError> {
        self.drain_stale().await;

        let payload = self.request.payload();
        let segmented =
            isotp::segment(&payload, self.layout).map_err(ExchangeError::InvalidRequest)?;
        debug!(
            bus = %self.handle,
            tx_id = format!("0x{:X}", self.request.source_address),
            rx_id = format!("0x{:X}", self.request.dest_address),
            payload = %hex_bytes(&payload),
            "Sending UDS request"
        );
        self.send(segmented).await?;

        if self.request.suppress_response {
            return Ok(Vec::new());
        }
        self.await_response().await
    }

    fn request_id(&self) -> u32 {
        u32::from(self.request.source_address)
    }

    fn response_id(&self) -> u32 {
        u32::from(self.request.dest_address)
    }

    /// Discard anything queued before the request goes out
    async fn drain_stale(&self) {
        if let Ok(frames) = self.bus.receive(self.handle).await {
            if !frames.is_empty() {
                debug!(count = frames.len(), "Drained stale frames before request");
            }
        }
    }

    async fn transmit(&self, payloads: Vec<Vec<u8>>) -> Result<(), ExchangeError> {
        let frames = payloads
            .into_iter()
            .map(|data| {
                Frame::build(self.request_id(), self.layout.use_canfd, false, data)
                    .map_err(|e| BusError::InvalidFrame(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.bus.transmit(self.handle, &frames).await?;
        Ok(())
    }

    async fn send(&mut self, segmented: Segmented) -> Result<(), ExchangeError> {
        let (first, consecutive) = match segmented {
            Segmented::Single(frame) => return self.transmit(vec![frame]).await,
            Segmented::Multi { first, consecutive } => (first, consecutive),
        };

        self.transmit(vec![first]).await?;

        let mut pending = consecutive.into_iter().peekable();
        while pending.peek().is_some() {
            let (block_size, st_min) = self.await_flow_control().await?;
            let count = if block_size == 0 {
                usize::MAX
            } else {
                usize::from(block_size)
            };
            let block: Vec<Vec<u8>> = pending.by_ref().take(count).collect();
            debug!(frames = block.len(), ?st_min, "Sending consecutive frames");

            if st_min.is_zero() {
                self.transmit(block).await?;
            } else {
                for (i, frame) in block.into_iter().enumerate() {
                    if i > 0 {
                        tokio::time::sleep(st_min).await;
                    }
                    self.transmit(vec![frame]).await?;
                }
            }
        }
        Ok(())
    }

    async fn await_flow_control(&mut self) -> Result<(u8, Duration), ExchangeError> {
        let mut waits = 0;
        let mut deadline = Instant::now() + self.timeout;

        while let Some(frame) = self.next_frame(deadline).await {
            match isotp::decode(frame.payload()) {
                Ok(Pdu::FlowControl {
                    status: FlowStatus::ClearToSend,
                    block_size,
                    st_min,
                }) => return Ok((block_size, isotp::st_min_to_duration(st_min))),
                Ok(Pdu::FlowControl {
                    status: FlowStatus::Wait,
                    ..
                }) => {
                    waits += 1;
                    if waits > MAX_FLOW_CONTROL_WAITS {
                        return Err(ExchangeError::FlowControlWaitExceeded);
                    }
                    deadline = Instant::now() + self.timeout;
                }
                Ok(Pdu::FlowControl {
                    status: FlowStatus::Overflow,
                    ..
                }) => return Err(ExchangeError::FlowControlOverflow),
                Ok(other) => debug!(?other, "Ignoring frame while waiting for flow control"),
                Err(e) => debug!(error = %e, "Ignoring malformed frame"),
            }
        }
        Err(ExchangeError::FlowControlTimeout)
    }

    async fn send_flow_control(&self) -> Result<(), ExchangeError> {
        let fc = isotp::encode_flow_control(
            FlowStatus::ClearToSend,
            RX_BLOCK_SIZE,
            RX_ST_MIN,
            self.layout,
        );
        self.transmit(vec![fc]).await
    }

    async fn await_response(&mut self) -> Result<Vec<u8>, ExchangeError> {
        let started = Instant::now();
        let mut deadline = started + self.timeout;
        let mut partial: Option<Reassembler> = None;

        while let Some(frame) = self.next_frame(deadline).await {
            let message = match isotp::decode(frame.payload()) {
                Ok(Pdu::SingleFrame { data }) => {
                    if partial.take().is_some() {
                        debug!("Single frame interrupted a segmented response");
                    }
                    data.to_vec()
                }
                Ok(Pdu::FirstFrame { len, data }) => {
                    self.layout.accept_first_frame(len)?;
                    partial = Some(Reassembler::start(len, data));
                    self.send_flow_control().await?;
                    deadline = Instant::now() + self.timeout;
                    continue;
                }
                Ok(Pdu::ConsecutiveFrame { sn, data }) => {
                    let Some(rx) = partial.as_mut() else {
                        debug!(sn, "Consecutive frame without first frame");
                        continue;
                    };
                    if !rx.push(sn, data)? {
                        deadline = Instant::now() + self.timeout;
                        continue;
                    }
                    match partial.take() {
                        Some(rx) => rx.into_payload(),
                        None => continue,
                    }
                }
                Ok(Pdu::FlowControl { .. }) => continue,
                Err(e) => {
                    debug!(error = %e, "Ignoring malformed frame");
                    continue;
                }
            };

            if self.is_response_pending(&message) {
                if started.elapsed() >= RESPONSE_PENDING_LIMIT {
                    return Err(ExchangeError::Timeout);
                }
                debug!("ECU reported response pending");
                deadline = Instant::now() + self.timeout;
                continue;
            }

            debug!(bus = %self.handle, response = %hex_bytes(&message), "UDS response received");
            return Ok(message);
        }
        Err(ExchangeError::Timeout)
    }

    fn is_response_pending(&self, message: &[u8]) -> bool {
        matches!(
            message,
            [service_id::NEGATIVE_RESPONSE, sid, nrc, ..]
                if *sid == self.request.service_id
                    && NegativeResponseCode::from(*nrc) == NegativeResponseCode::ResponsePending
        )
    }

    /// Next frame from the ECU, or `None` once `deadline` passes
    async fn next_frame(&mut self, deadline: Instant) -> Option<Frame> {
        loop {
            if let Some(frame) = self.backlog.pop_front() {
                return Some(frame);
            }

            match self.bus.receive(self.handle).await {
                Ok(frames) => {
                    let response_id = self.response_id();
                    self.backlog
                        .extend(frames.into_iter().filter(|f| f.id() == response_id));
                }
                Err(e) => debug!(bus = %self.handle, error = %e, "Receive failed while waiting"),
            }
            if !self.backlog.is_empty() {
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep(RESPONSE_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBus;
    use crate::config::TransportVersion;

    fn session() -> UdsTransportSession {
        UdsTransportSession::new(Arc::new(MockBus::with_bus_ids(&[101])))
    }

    #[test]
    fn test_initialize_twice_fails() {
        let session = session();
        session.initialize(UdsSessionConfig::default()).unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(
            session.initialize(UdsSessionConfig::default()).unwrap_err(),
            SessionError::AlreadyActive
        );
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let session = session();
        session.teardown();
        session.initialize(UdsSessionConfig::default()).unwrap();
        session.teardown();
        session.teardown();
        assert_eq!(session.state(), SessionState::Uninitialized);

        let config = UdsSessionConfig {
            response_timeout_ms: 50,
            use_canfd: true,
            transport_version: TransportVersion::Iso15765_2016,
        };
        session.initialize(config.clone()).unwrap();
        assert_eq!(session.config(), Some(config));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let session = session();
        let config = UdsSessionConfig {
            response_timeout_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            session.initialize(config),
            Err(SessionError::InvalidConfig(_))
        ));
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_request_without_session() {
        let session = session();
        let err = session
            .request_response(BusHandle::new(101), &UdsRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::NotInitialized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_session_to_ready() {
        let session = session();
        session.initialize(UdsSessionConfig::default()).unwrap();

        let response = session
            .request_response(BusHandle::new(101), &UdsRequest::default())
            .await
            .unwrap();
        assert!(!response.succeeded);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_request_too_long_for_2004() {
        let session = session();
        session.initialize(UdsSessionConfig::default()).unwrap();

        let request = UdsRequest::new(0x700, 0x701, 0x36, vec![0u8; 4095]);
        let response = session
            .request_response(BusHandle::new(101), &request)
            .await
            .unwrap();
        assert!(!response.succeeded);
        assert!(response.status_message.starts_with("invalid request"));
    }
}
