//! Read/write request routing
//!
//! Every request maps to exactly one [`AttResponse`]. Routing checks the UUID
//! first (unknown → `AttributeNotFound`), then the characteristic's properties.

use super::types::{AttResponse, AttStatus, Property, ReadRequest, Service, WriteRequest};
use chrono::Local;
use tracing::{debug, info};

/// Decoded form of a write payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePayload {
    Text(String),
    Binary(Vec<u8>),
}

impl WritePayload {
    pub fn decode(payload: &[u8]) -> Self {
        match std::str::from_utf8(payload) {
            Ok(text) => WritePayload::Text(text.to_string()),
            Err(_) => WritePayload::Binary(payload.to_vec()),
        }
    }
}

impl std::fmt::Display for WritePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WritePayload::Text(text) => write!(f, "\"{}\"", text),
            WritePayload::Binary(bytes) => write!(f, "0x{}", hex::encode(bytes)),
        }
    }
}

pub struct RequestHandler {
    greeting: String,
    reads: u64,
    writes: u64,
}

impl RequestHandler {
    pub fn new(greeting: impl Into<String>) -> Self {
        Self {
            greeting: greeting.into(),
            reads: 0,
            writes: 0,
        }
    }

    /// Requests answered so far as (reads, writes)
    pub fn counts(&self) -> (u64, u64) {
        (self.reads, self.writes)
    }

    /// Answer a read against the registered table (`None` when nothing is registered)
    pub fn on_read(&mut self, table: Option<&Service>, request: &ReadRequest) -> AttResponse {
        self.reads += 1;

        let Some(characteristic) = table.and_then(|s| s.characteristic(&request.characteristic))
        else {
            debug!(
                "Read {} from {}: unknown characteristic {}",
                request.id, request.peer, request.characteristic
            );
            return AttResponse::failure(request.id, AttStatus::AttributeNotFound);
        };

        if !characteristic.has_property(Property::Read) {
            debug!("Read {} from {}: not readable", request.id, request.peer);
            return AttResponse::failure(request.id, AttStatus::ReadNotPermitted);
        }

        let value = match &characteristic.value {
            Some(value) => value.clone(),
            None => self.greeting_payload(),
        };

        if request.offset > value.len() {
            debug!(
                "Read {} from {}: offset {} beyond {} bytes",
                request.id,
                request.peer,
                request.offset,
                value.len()
            );
            return AttResponse::failure(request.id, AttStatus::InvalidOffset);
        }

        info!("Read {} from {} ({} bytes)", request.id, request.peer, value.len());
        AttResponse::success(request.id, Some(value[request.offset..].to_vec()))
    }

    /// Answer a batch of writes, one response per request in arrival order
    pub fn on_write_batch(
        &mut self,
        table: Option<&Service>,
        requests: &[WriteRequest],
    ) -> Vec<AttResponse> {
        requests
            .iter()
            .map(|request| self.on_write(table, request))
            .collect()
    }

    pub fn on_write(&mut self, table: Option<&Service>, request: &WriteRequest) -> AttResponse {
        self.writes += 1;

        let Some(characteristic) = table.and_then(|s| s.characteristic(&request.characteristic))
        else {
            debug!(
                "Write {} from {}: unknown characteristic {}",
                request.id, request.peer, request.characteristic
            );
            return AttResponse::failure(request.id, AttStatus::AttributeNotFound);
        };

        if !characteristic.has_property(Property::Write) {
            debug!("Write {} from {}: not writable", request.id, request.peer);
            return AttResponse::failure(request.id, AttStatus::WriteNotPermitted);
        }

        info!(
            "Write {} from {}: {}",
            request.id,
            request.peer,
            WritePayload::decode(&request.payload)
        );
        AttResponse::success(request.id, None)
    }

    fn greeting_payload(&self) -> Vec<u8> {
        format!("{} {}", self.greeting, Local::now().format("%Y-%m-%d %H:%M:%S")).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::types::{Characteristic, PeerId, RequestId};
    use uuid::Uuid;

    const CHAR: Uuid = Uuid::from_u128(0x21);

    fn table(properties: &[Property]) -> Service {
        Service::new(Uuid::from_u128(0x20)).with_characteristic(
            Characteristic::new(CHAR).with_properties(properties.iter().copied()),
        )
    }

    fn read(id: u64, characteristic: Uuid, offset: usize) -> ReadRequest {
        ReadRequest {
            id: RequestId(id),
            peer: PeerId::new("peer-a"),
            characteristic,
            offset,
        }
    }

    fn write(id: u64, characteristic: Uuid, payload: &[u8]) -> WriteRequest {
        WriteRequest {
            id: RequestId(id),
            peer: PeerId::new("peer-a"),
            characteristic,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_read_returns_timestamped_greeting() {
        let mut handler = RequestHandler::new("Hello from gattkit");
        let service = table(&[Property::Read]);

        let response = handler.on_read(Some(&service), &read(1, CHAR, 0));

        assert_eq!(response.status, AttStatus::Success);
        let text = String::from_utf8(response.value.expect("payload")).expect("utf8");
        assert!(text.starts_with("Hello from gattkit "));
    }

    #[test]
    fn test_read_unknown_uuid_is_not_found() {
        let mut handler = RequestHandler::new("hi");
        let service = table(&[Property::Read]);

        let response = handler.on_read(Some(&service), &read(2, Uuid::from_u128(0x99), 0));
        assert_eq!(response, AttResponse::failure(RequestId(2), AttStatus::AttributeNotFound));
    }

    #[test]
    fn test_read_before_registration_is_not_found() {
        let mut handler = RequestHandler::new("hi");
        let response = handler.on_read(None, &read(3, CHAR, 0));
        assert_eq!(response.status, AttStatus::AttributeNotFound);
    }

    #[test]
    fn test_read_without_read_property() {
        let mut handler = RequestHandler::new("hi");
        let service = table(&[Property::Write]);
        let response = handler.on_read(Some(&service), &read(4, CHAR, 0));
        assert_eq!(response.status, AttStatus::ReadNotPermitted);
    }

    #[test]
    fn test_read_offset_slices_static_value() {
        let mut handler = RequestHandler::new("hi");
        let service = Service::new(Uuid::from_u128(0x20)).with_characteristic(
            Characteristic::new(CHAR)
                .with_properties([Property::Read])
                .with_value(b"abcdef".to_vec()),
        );

        let response = handler.on_read(Some(&service), &read(5, CHAR, 2));
        assert_eq!(response.value, Some(b"cdef".to_vec()));

        let response = handler.on_read(Some(&service), &read(6, CHAR, 6));
        assert_eq!(response.value, Some(Vec::new()));

        let response = handler.on_read(Some(&service), &read(7, CHAR, 7));
        assert_eq!(response.status, AttStatus::InvalidOffset);
    }

    #[test]
    fn test_write_hello_is_accepted() {
        let mut handler = RequestHandler::new("hi");
        let service = table(&[Property::Write]);
        let response = handler.on_write(Some(&service), &write(8, CHAR, b"hello"));
        assert_eq!(response, AttResponse::success(RequestId(8), None));
    }

    #[test]
    fn test_write_binary_is_accepted() {
        let mut handler = RequestHandler::new("hi");
        let service = table(&[Property::Write]);
        let response = handler.on_write(Some(&service), &write(9, CHAR, &[0xff, 0xfe, 0x00]));
        assert!(response.is_success());
    }

    #[test]
    fn test_write_without_write_property_is_not_permitted() {
        let mut handler = RequestHandler::new("hi");
        let service = table(&[Property::Read, Property::Notify]);
        let response = handler.on_write(Some(&service), &write(10, CHAR, b"x"));
        assert_eq!(response.status, AttStatus::WriteNotPermitted);
    }

    #[test]
    fn test_write_batch_preserves_order_and_isolates_failures() {
        let mut handler = RequestHandler::new("hi");
        let service = table(&[Property::Write]);
        let batch = vec![
            write(11, CHAR, b"one"),
            write(12, Uuid::from_u128(0x77), b"two"),
            write(13, CHAR, b"three"),
        ];

        let responses = handler.on_write_batch(Some(&service), &batch);

        let ids: Vec<u64> = responses.iter().map(|r| r.request.0).collect();
        assert_eq!(ids, vec![11, 12, 13]);
        assert_eq!(responses[0].status, AttStatus::Success);
        assert_eq!(responses[1].status, AttStatus::AttributeNotFound);
        assert_eq!(responses[2].status, AttStatus::Success);
        assert_eq!(handler.counts(), (0, 3));
    }

    #[test]
    fn test_write_payload_decoding() {
        assert_eq!(
            WritePayload::decode(b"hello"),
            WritePayload::Text("hello".to_string())
        );
        let binary = WritePayload::decode(&[0xc3, 0x28]);
        assert_eq!(binary, WritePayload::Binary(vec![0xc3, 0x28]));
        assert_eq!(binary.to_string(), "0xc328");
    }
}
