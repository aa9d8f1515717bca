//! UDS (Unified Diagnostic Services) request/response values
//!
//! These are the fields exchanged with the transport session. The transport
//! never interprets service content: a negative response is still a completed
//! exchange, and classifying it is left to the caller via
//! [`UdsResponse::negative_response_code`].

mod nrc;

pub use nrc::NegativeResponseCode;

use serde::{Deserialize, Serialize};

use crate::config::de_flag;

/// Standard UDS service ID constants
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const READ_DTC_INFO: u8 = 0x19;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const COMMUNICATION_CONTROL: u8 = 0x28;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const CONTROL_DTC_SETTING: u8 = 0x85;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// Offset added to a service ID in its positive response
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// Status message of a completed exchange
pub const STATUS_OK: &str = "ok";

/// Status message when no response arrived in time
pub const STATUS_TIMEOUT: &str = "timeout";

/// A UDS request addressed over the transport
///
/// `source_address` is the CAN identifier the tester transmits on,
/// `dest_address` the identifier the ECU answers on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdsRequest {
    #[serde(alias = "src_addr")]
    pub source_address: u16,
    #[serde(alias = "dst_addr")]
    pub dest_address: u16,
    /// Transmit only, do not wait for a response
    #[serde(default, deserialize_with = "de_flag")]
    pub suppress_response: bool,
    #[serde(alias = "sid")]
    pub service_id: u8,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl Default for UdsRequest {
    /// ReadDTCInformation, reportDTCByStatusMask with all status bits
    fn default() -> Self {
        Self::new(0x700, 0x701, service_id::READ_DTC_INFO, vec![0x02, 0xFF])
    }
}

impl UdsRequest {
    pub fn new(source_address: u16, dest_address: u16, service_id: u8, data: Vec<u8>) -> Self {
        Self {
            source_address,
            dest_address,
            suppress_response: false,
            service_id,
            data,
        }
    }

    pub fn with_suppress_response(mut self, suppress_response: bool) -> Self {
        self.suppress_response = suppress_response;
        self
    }

    /// The service data unit as sent on the wire: service ID then data
    pub fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(1 + self.data.len());
        payload.push(self.service_id);
        payload.extend_from_slice(&self.data);
        payload
    }
}

/// Outcome of one request/response exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdsResponse {
    /// The transport exchange completed (positive or negative response)
    #[serde(alias = "result", deserialize_with = "de_flag")]
    pub succeeded: bool,
    /// "ok", or the failure reason
    #[serde(alias = "result_msg")]
    pub status_message: String,
    /// Raw response bytes; empty unless `succeeded`
    #[serde(default)]
    pub data: Vec<u8>,
}

impl UdsResponse {
    pub fn success(data: Vec<u8>) -> Self {
        Self {
            succeeded: true,
            status_message: STATUS_OK.to_string(),
            data,
        }
    }

    pub fn failure(status_message: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            status_message: status_message.into(),
            data: Vec::new(),
        }
    }

    /// Whether the data is a negative response (`7F <sid> <nrc>`)
    pub fn is_negative(&self) -> bool {
        self.data.first() == Some(&service_id::NEGATIVE_RESPONSE)
    }

    /// Whether the data is the positive response to `service_id`
    pub fn is_positive_for(&self, service_id: u8) -> bool {
        self.data.first() == Some(&service_id.wrapping_add(POSITIVE_RESPONSE_OFFSET))
    }

    /// The NRC of a negative response
    pub fn negative_response_code(&self) -> Option<NegativeResponseCode> {
        if self.is_negative() {
            self.data.get(2).map(|&nrc| NegativeResponseCode::from(nrc))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_payload() {
        let request = UdsRequest::default();
        assert_eq!(request.payload(), vec![0x19, 0x02, 0xFF]);
        assert!(!request.suppress_response);
    }

    #[test]
    fn test_request_host_keys() {
        let request: UdsRequest = serde_json::from_str(
            r#"{"src_addr": 1792, "dst_addr": 1793, "suppress_response": 1, "sid": 62, "data": [128]}"#,
        )
        .unwrap();
        assert_eq!(request.source_address, 0x700);
        assert_eq!(request.dest_address, 0x701);
        assert!(request.suppress_response);
        assert_eq!(request.payload(), vec![0x3E, 0x80]);
    }

    #[test]
    fn test_negative_response_classification() {
        let response = UdsResponse::success(vec![0x7F, 0x19, 0x31]);
        assert!(response.succeeded);
        assert!(response.is_negative());
        assert_eq!(
            response.negative_response_code(),
            Some(NegativeResponseCode::RequestOutOfRange)
        );
    }

    #[test]
    fn test_positive_response_classification() {
        let response = UdsResponse::success(vec![0x59, 0x02, 0xFF]);
        assert!(response.is_positive_for(service_id::READ_DTC_INFO));
        assert!(!response.is_negative());
        assert_eq!(response.negative_response_code(), None);
    }

    #[test]
    fn test_failure_has_no_data() {
        let response = UdsResponse::failure(STATUS_TIMEOUT);
        assert!(!response.succeeded);
        assert_eq!(response.status_message, "timeout");
        assert!(response.data.is_empty());
    }
}
