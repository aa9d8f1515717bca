//! UDS diagnostic client
//!
//! Thin layer over [`UdsTransportSession`] that writes the host log lines and
//! classifies negative responses. The transport reports `7F <sid> <nrc>` as a
//! completed exchange; naming the NRC is done here.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::cancel::CancellationFlag;
use crate::frame::BusHandle;
use crate::log::{hex_bytes, LogSink};
use crate::session::UdsTransportSession;
use crate::uds::{UdsRequest, UdsResponse};

/// Counters collected by one diagnostic run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticStats {
    pub requests: u64,
    /// Exchanges that did not complete (timeout, transmit failure, ...)
    pub failures: u64,
    pub negative_responses: u64,
}

pub struct UdsDiagnosticClient {
    session: Arc<UdsTransportSession>,
    sink: Arc<dyn LogSink>,
}

impl UdsDiagnosticClient {
    pub fn new(session: Arc<UdsTransportSession>, sink: Arc<dyn LogSink>) -> Self {
        Self { session, sink }
    }

    pub fn session(&self) -> &Arc<UdsTransportSession> {
        &self.session
    }

    /// Send one request and log its outcome
    pub async fn request(&self, bus: BusHandle, request: &UdsRequest) -> UdsResponse {
        self.sink.write_log(&format!(
            "[UDS Tx] {:02X} {}",
            request.service_id,
            hex_bytes(&request.data)
        ));

        let response = match self.session.request_response(bus, request).await {
            Ok(response) => response,
            Err(e) => UdsResponse::failure(e.to_string()),
        };

        if !response.succeeded {
            self.sink
                .write_log(&format!("Request error! {}", response.status_message));
        } else if let Some(nrc) = response.negative_response_code() {
            debug!(%nrc, description = nrc.description(), "Negative response");
            self.sink.write_log(&format!(
                "[UDS Rx] {} ({})",
                hex_bytes(&response.data),
                nrc
            ));
        } else {
            self.sink
                .write_log(&format!("[UDS Rx] {}", hex_bytes(&response.data)));
        }
        response
    }

    /// Repeat `request` every `period` until `cancel` is set
    ///
    /// The flag is checked between requests, so stopping can take up to one
    /// response timeout plus one period.
    pub async fn run(
        &self,
        bus: BusHandle,
        request: &UdsRequest,
        cancel: &CancellationFlag,
        period: Duration,
    ) -> DiagnosticStats {
        info!(
            %bus,
            sid = format!("0x{:02X}", request.service_id),
            ?period,
            "Diagnostic loop started"
        );
        let mut stats = DiagnosticStats::default();

        while !cancel.is_cancelled() {
            let response = self.request(bus, request).await;
            stats.requests += 1;
            if !response.succeeded {
                stats.failures += 1;
            } else if response.is_negative() {
                stats.negative_responses += 1;
            }
            debug!(requests = stats.requests, "Diagnostic request done");
            tokio::time::sleep(period).await;
        }

        info!(
            requests = stats.requests,
            failures = stats.failures,
            "Diagnostic loop stopped"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBus;
    use crate::config::UdsSessionConfig;
    use crate::frame::Frame;
    use crate::log::MemoryLogSink;

    const BUS: BusHandle = BusHandle::new(101);

    struct Fixed(Vec<u8>);

    impl crate::bus::FrameResponder for Fixed {
        fn on_frame(&self, frame: &Frame) -> Vec<Frame> {
            if frame.id() != 0x700 {
                return Vec::new();
            }
            let mut payload = vec![self.0.len() as u8];
            payload.extend_from_slice(&self.0);
            payload.resize(8, 0xCC);
            vec![Frame::new(0x701, payload).unwrap()]
        }
    }

    fn client(reply: Vec<u8>) -> (Arc<MemoryLogSink>, UdsDiagnosticClient) {
        let bus = Arc::new(MockBus::with_bus_ids(&[101]));
        bus.attach(BUS, Arc::new(Fixed(reply)));
        let session = Arc::new(UdsTransportSession::new(bus));
        session.initialize(UdsSessionConfig::default()).unwrap();
        let sink = Arc::new(MemoryLogSink::new());
        (sink.clone(), UdsDiagnosticClient::new(session, sink))
    }

    #[tokio::test]
    async fn test_positive_response_logged() {
        let (sink, client) = client(vec![0x59, 0x02, 0xFF]);
        let response = client.request(BUS, &UdsRequest::default()).await;

        assert!(response.succeeded);
        assert_eq!(
            sink.lines(),
            vec!["[UDS Tx] 19 02 FF".to_string(), "[UDS Rx] 59 02 FF".to_string()]
        );
    }

    #[tokio::test]
    async fn test_negative_response_annotated() {
        let (sink, client) = client(vec![0x7F, 0x19, 0x31]);
        let response = client.request(BUS, &UdsRequest::default()).await;

        assert!(response.succeeded);
        assert_eq!(response.data, vec![0x7F, 0x19, 0x31]);
        assert!(sink.contains("[UDS Rx] 7F 19 31 (RequestOutOfRange)"));
    }

    #[tokio::test]
    async fn test_session_error_becomes_failed_response() {
        let (sink, client) = client(vec![0x59]);
        client.session().teardown();

        let response = client.request(BUS, &UdsRequest::default()).await;
        assert!(!response.succeeded);
        assert!(sink.contains("Request error! No UDS session initialized"));
    }
}
