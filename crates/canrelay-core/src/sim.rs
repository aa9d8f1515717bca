//! Simulated ECU for the mock bus
//!
//! Speaks ISO 15765-2 on a request/response CAN identifier pair and answers
//! UDS requests from a lookup table. Attach it to a [`MockBus`] channel to get
//! a tester/ECU loop without hardware:
//!
//! ```ignore
//! let bus = Arc::new(MockBus::with_bus_ids(&[101]));
//! let ecu = SimulatedEcu::new(0x700, 0x701).with_default_responses();
//! bus.attach(BusHandle::new(101), Arc::new(ecu));
//! ```
//!
//! [`MockBus`]: crate::bus::MockBus

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bus::FrameResponder;
use crate::frame::Frame;
use crate::isotp::{self, FlowStatus, FrameLayout, Pdu, Reassembler, Segmented};
use crate::log::hex_bytes;
use crate::uds::{service_id, NegativeResponseCode, POSITIVE_RESPONSE_OFFSET};

/// Services whose second byte is a sub-function with the suppress bit
const SUB_FUNCTION_SERVICES: [u8; 8] = [
    service_id::DIAGNOSTIC_SESSION_CONTROL,
    service_id::ECU_RESET,
    service_id::READ_DTC_INFO,
    service_id::SECURITY_ACCESS,
    service_id::COMMUNICATION_CONTROL,
    service_id::ROUTINE_CONTROL,
    service_id::TESTER_PRESENT,
    service_id::CONTROL_DTC_SETTING,
];

const SUPPRESS_POSITIVE_RESPONSE: u8 = 0x80;

struct EcuState {
    layout: FrameLayout,
    /// Request prefix → response, first match wins for equal length
    responses: Vec<(Vec<u8>, Vec<u8>)>,
    block_size: u8,
    st_min: u8,
    response_pending: usize,
    silent: bool,
    rx: Option<Reassembler>,
    rx_in_block: u8,
    /// Consecutive frames of a response waiting for the tester's flow control
    tx_pending: VecDeque<Vec<u8>>,
    requests: Vec<Vec<u8>>,
}

/// ECU that answers UDS requests from a table
pub struct SimulatedEcu {
    request_id: u32,
    response_id: u32,
    state: Mutex<EcuState>,
}

impl SimulatedEcu {
    /// ECU listening on `request_id` and answering on `response_id`
    pub fn new(request_id: u32, response_id: u32) -> Self {
        Self {
            request_id,
            response_id,
            state: Mutex::new(EcuState {
                layout: FrameLayout::new(false, Default::default()),
                responses: Vec::new(),
                block_size: 0,
                st_min: 0,
                response_pending: 0,
                silent: false,
                rx: None,
                rx_in_block: 0,
                tx_pending: VecDeque::new(),
                requests: Vec::new(),
            }),
        }
    }

    pub fn with_layout(self, layout: FrameLayout) -> Self {
        self.state.lock().layout = layout;
        self
    }

    /// Flow control parameters the ECU sends for segmented requests
    pub fn with_flow_control(self, block_size: u8, st_min: u8) -> Self {
        {
            let mut state = self.state.lock();
            state.block_size = block_size;
            state.st_min = st_min;
        }
        self
    }

    /// Send `count` "response pending" replies before every real response
    pub fn with_response_pending(self, count: usize) -> Self {
        self.state.lock().response_pending = count;
        self
    }

    pub fn with_response(self, request: impl Into<Vec<u8>>, response: impl Into<Vec<u8>>) -> Self {
        self.add_response(request, response);
        self
    }

    /// A small set of answers for the common services
    pub fn with_default_responses(self) -> Self {
        let mut dtcs = vec![0x59, 0x02, 0xFF];
        dtcs.extend_from_slice(&[0x01, 0x23, 0x45, 0x2F, 0x0A, 0xBC, 0xDE, 0x08]);

        let mut vin = vec![0x62, 0xF1, 0x90];
        vin.extend_from_slice(b"WVWZZZ1KZAW000001");

        let session = service_id::DIAGNOSTIC_SESSION_CONTROL;
        self.with_response([session, 0x01], [0x50, 0x01, 0x00, 0x19, 0x01, 0xF4])
            .with_response([session, 0x03], [0x50, 0x03, 0x00, 0x19, 0x01, 0xF4])
            .with_response([service_id::TESTER_PRESENT, 0x00], [0x7E, 0x00])
            .with_response([service_id::READ_DTC_INFO, 0x02], dtcs)
            .with_response([service_id::READ_DATA_BY_ID, 0xF1, 0x90], vin)
            .with_response(
                [service_id::READ_DATA_BY_ID],
                [
                    service_id::NEGATIVE_RESPONSE,
                    service_id::READ_DATA_BY_ID,
                    NegativeResponseCode::RequestOutOfRange.into(),
                ],
            )
    }

    /// Answer requests starting with `request` with `response`
    pub fn add_response(&self, request: impl Into<Vec<u8>>, response: impl Into<Vec<u8>>) {
        self.state
            .lock()
            .responses
            .push((request.into(), response.into()));
    }

    /// A silent ECU receives but never answers
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Every complete request received so far
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.state.lock().requests.clone()
    }

    fn frame(&self, layout: FrameLayout, payload: Vec<u8>) -> Option<Frame> {
        match Frame::build(self.response_id, layout.use_canfd, false, payload) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(error = %e, "Simulated ECU built an invalid frame");
                None
            }
        }
    }
}

impl FrameResponder for SimulatedEcu {
    fn on_frame(&self, frame: &Frame) -> Vec<Frame> {
        if frame.id() != self.request_id {
            return Vec::new();
        }

        let mut state = self.state.lock();
        if state.silent {
            return Vec::new();
        }

        let payloads = match isotp::decode(frame.payload()) {
            Ok(Pdu::SingleFrame { data }) => {
                state.rx = None;
                state.respond(data.to_vec())
            }
            Ok(Pdu::FirstFrame { len, data }) => match state.layout.accept_first_frame(len) {
                Ok(()) => {
                    state.rx = Some(Reassembler::start(len, data));
                    state.rx_in_block = 0;
                    vec![state.flow_control()]
                }
                Err(e) => {
                    debug!(error = %e, "Simulated ECU refusing first frame");
                    state.rx = None;
                    vec![isotp::encode_flow_control(
                        FlowStatus::Overflow,
                        0,
                        0,
                        state.layout,
                    )]
                }
            },
            Ok(Pdu::ConsecutiveFrame { sn, data }) => state.on_consecutive(sn, data),
            Ok(Pdu::FlowControl {
                status: FlowStatus::ClearToSend,
                block_size,
                ..
            }) => state.release_block(block_size),
            Ok(Pdu::FlowControl { .. }) => Vec::new(),
            Err(e) => {
                debug!(error = %e, "Simulated ECU ignoring frame");
                Vec::new()
            }
        };

        let layout = state.layout;
        drop(state);
        payloads
            .into_iter()
            .filter_map(|payload| self.frame(layout, payload))
            .collect()
    }
}

impl EcuState {
    fn flow_control(&self) -> Vec<u8> {
        isotp::encode_flow_control(
            FlowStatus::ClearToSend,
            self.block_size,
            self.st_min,
            self.layout,
        )
    }

    fn on_consecutive(&mut self, sn: u8, data: &[u8]) -> Vec<Vec<u8>> {
        let Some(rx) = self.rx.as_mut() else {
            debug!(sn, "Simulated ECU: consecutive frame without first frame");
            return Vec::new();
        };

        match rx.push(sn, data) {
            Ok(true) => {
                let request = self
                    .rx
                    .take()
                    .map(Reassembler::into_payload)
                    .unwrap_or_default();
                self.respond(request)
            }
            Ok(false) => {
                self.rx_in_block = self.rx_in_block.wrapping_add(1);
                if self.block_size > 0 && self.rx_in_block >= self.block_size {
                    self.rx_in_block = 0;
                    vec![self.flow_control()]
                } else {
                    Vec::new()
                }
            }
            Err(e) => {
                warn!(error = %e, "Simulated ECU: request transfer aborted");
                self.rx = None;
                Vec::new()
            }
        }
    }

    fn release_block(&mut self, block_size: u8) -> Vec<Vec<u8>> {
        let count = if block_size == 0 {
            self.tx_pending.len()
        } else {
            usize::from(block_size).min(self.tx_pending.len())
        };
        self.tx_pending.drain(..count).collect()
    }

    fn lookup(&self, request: &[u8]) -> Vec<u8> {
        if let Some((_, response)) = self.responses.iter().find(|(req, _)| req == request) {
            return response.clone();
        }
        let prefix = self
            .responses
            .iter()
            .filter(|(req, _)| request.starts_with(req))
            .fold(None::<&(Vec<u8>, Vec<u8>)>, |best, entry| match best {
                Some(b) if b.0.len() >= entry.0.len() => Some(b),
                _ => Some(entry),
            });
        match prefix {
            Some((_, response)) => response.clone(),
            None => vec![request[0].wrapping_add(POSITIVE_RESPONSE_OFFSET)],
        }
    }

    fn respond(&mut self, request: Vec<u8>) -> Vec<Vec<u8>> {
        let Some(&sid) = request.first() else {
            return Vec::new();
        };
        debug!(request = %hex_bytes(&request), "Simulated ECU received request");
        self.requests.push(request.clone());

        let suppress = SUB_FUNCTION_SERVICES.contains(&sid)
            && request
                .get(1)
                .is_some_and(|sub| sub & SUPPRESS_POSITIVE_RESPONSE != 0);
        let lookup_key: Vec<u8> = if suppress {
            let mut key = request.clone();
            key[1] &= !SUPPRESS_POSITIVE_RESPONSE;
            key
        } else {
            request
        };

        let response = self.lookup(&lookup_key);
        if suppress && response.first() != Some(&service_id::NEGATIVE_RESPONSE) {
            debug!("Simulated ECU: positive response suppressed");
            return Vec::new();
        }

        let mut out = Vec::with_capacity(self.response_pending + 1);
        let pending = [
            service_id::NEGATIVE_RESPONSE,
            sid,
            NegativeResponseCode::ResponsePending.into(),
        ];
        for _ in 0..self.response_pending {
            if let Ok(Segmented::Single(frame)) = isotp::segment(&pending, self.layout) {
                out.push(frame);
            }
        }

        match isotp::segment(&response, self.layout) {
            Ok(Segmented::Single(frame)) => out.push(frame),
            Ok(Segmented::Multi { first, consecutive }) => {
                info!(len = response.len(), "Simulated ECU sending segmented response");
                out.push(first);
                self.tx_pending = consecutive.into();
            }
            Err(e) => warn!(error = %e, "Simulated ECU cannot send response"),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportVersion;

    fn single(id: u32, payload: &[u8]) -> Frame {
        let layout = FrameLayout::new(false, TransportVersion::Iso15765_2004);
        let Ok(Segmented::Single(data)) = isotp::segment(payload, layout) else {
            panic!("expected single frame");
        };
        Frame::new(id, data).unwrap()
    }

    #[test]
    fn test_exact_and_prefix_lookup() {
        let ecu = SimulatedEcu::new(0x700, 0x701).with_default_responses();

        let reply = ecu.on_frame(&single(0x700, &[0x22, 0x12, 0x34]));
        assert_eq!(reply.len(), 1);
        assert_eq!(&reply[0].payload()[..4], &[0x03, 0x7F, 0x22, 0x31]);

        let reply = ecu.on_frame(&single(0x700, &[0x3E, 0x00]));
        assert_eq!(&reply[0].payload()[..3], &[0x02, 0x7E, 0x00]);
    }

    #[test]
    fn test_fallback_positive_response() {
        let ecu = SimulatedEcu::new(0x700, 0x701);
        let reply = ecu.on_frame(&single(0x700, &[0x31, 0x01, 0xFF, 0x00]));
        assert_eq!(&reply[0].payload()[..2], &[0x01, 0x71]);
        assert_eq!(reply[0].id(), 0x701);
    }

    #[test]
    fn test_oversized_first_frame_gets_overflow() {
        let ecu = SimulatedEcu::new(0x700, 0x701);
        let ff = Frame::new(0x700, [0x10, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0x59, 0x02]).unwrap();

        let reply = ecu.on_frame(&ff);
        assert_eq!(reply.len(), 1);
        assert_eq!(&reply[0].payload()[..3], &[0x32, 0x00, 0x00]);
        assert!(ecu.requests().is_empty());
    }

    #[test]
    fn test_suppress_bit() {
        let ecu = SimulatedEcu::new(0x700, 0x701).with_default_responses();
        assert!(ecu.on_frame(&single(0x700, &[0x3E, 0x80])).is_empty());
        assert_eq!(ecu.requests(), vec![vec![0x3E, 0x80]]);
    }

    #[test]
    fn test_ignores_other_ids_and_silent_mode() {
        let ecu = SimulatedEcu::new(0x700, 0x701);
        assert!(ecu.on_frame(&single(0x123, &[0x3E, 0x00])).is_empty());

        ecu.set_silent(true);
        assert!(ecu.on_frame(&single(0x700, &[0x3E, 0x00])).is_empty());
        assert!(ecu.requests().is_empty());
    }

    #[test]
    fn test_segmented_response_waits_for_flow_control() {
        let ecu = SimulatedEcu::new(0x700, 0x701).with_default_responses();

        let reply = ecu.on_frame(&single(0x700, &[0x22, 0xF1, 0x90]));
        assert_eq!(reply.len(), 1);
        assert_eq!(&reply[0].payload()[..2], &[0x10, 20]);

        let fc = Frame::new(0x700, vec![0x30, 0, 0, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]).unwrap();
        let cfs = ecu.on_frame(&fc);
        assert_eq!(cfs.len(), 2);
        assert_eq!(cfs[0].payload()[0], 0x21);
        assert_eq!(cfs[1].payload()[0], 0x22);
    }
}
