//! Request handlers.
//!
//! A handler maps `(message type, request payload)` to a response payload. It
//! runs on the scheduling thread between a framed read and a framed write, so
//! it must not block.

use crate::protocol::MsgType;
use std::cell::Cell;

pub trait Handler {
    fn handle(&self, msg_type: MsgType, payload: &[u8]) -> Vec<u8>;
}

impl<F> Handler for F
where
    F: Fn(MsgType, &[u8]) -> Vec<u8>,
{
    fn handle(&self, msg_type: MsgType, payload: &[u8]) -> Vec<u8> {
        self(msg_type, payload)
    }
}

/// Default handler: acknowledges every message and numbers requests.
///
/// The response starts with a one-byte success flag followed by a text
/// confirmation.
#[derive(Debug, Default)]
pub struct ConfirmHandler {
    requests: Cell<u64>,
}

impl ConfirmHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Handler for ConfirmHandler {
    fn handle(&self, msg_type: MsgType, payload: &[u8]) -> Vec<u8> {
        let count = self.requests.get() + 1;
        self.requests.set(count);

        let text = String::from_utf8_lossy(payload);
        let (ok, body) = match msg_type {
            MsgType::Msg => (
                true,
                format!("receive msg, msg: {}, and its confirm response", text),
            ),
            MsgType::Req => (
                true,
                format!("receive request, reqMsg: {}, the request num is: {}", text, count),
            ),
            MsgType::Unknown => (
                false,
                "receive unknown request, failed handle request".to_string(),
            ),
        };

        let mut response = Vec::with_capacity(1 + body.len());
        response.push(ok as u8);
        response.extend_from_slice(body.as_bytes());
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirm_msg() {
        let handler = ConfirmHandler::new();
        let response = handler.handle(MsgType::Msg, b"hello");
        assert_eq!(response[0], 1);
        assert_eq!(
            &response[1..],
            b"receive msg, msg: hello, and its confirm response"
        );
    }

    #[test]
    fn test_confirm_counts_requests() {
        let handler = ConfirmHandler::new();
        handler.handle(MsgType::Msg, b"a");
        let response = handler.handle(MsgType::Req, b"b");
        assert_eq!(response[0], 1);
        assert_eq!(
            &response[1..],
            b"receive request, reqMsg: b, the request num is: 2"
        );
    }

    #[test]
    fn test_confirm_unknown_fails() {
        let handler = ConfirmHandler::new();
        let response = handler.handle(MsgType::Unknown, b"whatever");
        assert_eq!(response[0], 0);
        assert_eq!(&response[1..], b"receive unknown request, failed handle request");
    }

    #[test]
    fn test_closure_handler() {
        let upper = |_: MsgType, payload: &[u8]| payload.to_ascii_uppercase();
        assert_eq!(upper.handle(MsgType::Req, b"abc"), b"ABC".to_vec());
    }
}
