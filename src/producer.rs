//! A lightweight publish-only facade over [`Connection`], for applications
//! that only need to publish and never subscribe. No RDY control or message
//! queue is needed in this mode since the connection never subscribes.

use crate::config::IdentifyOptions;
use crate::connection::Connection;
use crate::error::{NsqError, NsqResult};
use crate::wire::codec::{encode_dpub, encode_mpub, encode_pub, Frame, OK_BODY};
use std::time::Duration;

/// A connection used only to publish. Unlike [`Consumer`](crate::consumer::Consumer),
/// a producer never subscribes, so it drives its own request/response round
/// trips directly through [`Connection::execute_raw`] rather than handing the
/// socket off to a background dispatch task.
pub struct Producer {
    conn: Connection,
}

impl Producer {
    pub async fn connect(addr: &str, identify: &IdentifyOptions) -> NsqResult<Producer> {
        let (conn, _handle) = Connection::open(addr, identify, Duration::from_secs(5)).await?;
        Ok(Producer { conn })
    }

    pub async fn publish(&mut self, topic: &str, body: &[u8]) -> NsqResult<()> {
        self.roundtrip(encode_pub(topic, body)).await
    }

    pub async fn publish_deferred(&mut self, topic: &str, body: &[u8], defer_ms: u64) -> NsqResult<()> {
        self.roundtrip(encode_dpub(topic, defer_ms, body)).await
    }

    pub async fn publish_multi(&mut self, topic: &str, bodies: &[&[u8]]) -> NsqResult<()> {
        self.roundtrip(encode_mpub(topic, bodies)).await
    }

    async fn roundtrip(&mut self, cmd: bytes::Bytes) -> NsqResult<()> {
        let frame = self.conn.execute_raw(cmd).await?;
        classify_reply(frame)
    }
}

/// Turn a reply frame to a publish command into a result: any `Response` is
/// success (nsqd always replies `OK`, but the body is not otherwise
/// inspected), `Error` carries the server's code and message, and a
/// `Message` frame can never legitimately arrive here since a producer never
/// subscribes.
fn classify_reply(frame: Frame) -> NsqResult<()> {
    match frame {
        Frame::Response(body) if body.as_ref() == OK_BODY => Ok(()),
        Frame::Response(_) => Ok(()),
        Frame::Error { code, message } => Err(NsqError::Server {
            code,
            message: String::from_utf8_lossy(&message).into_owned(),
        }),
        Frame::Message(_) => Err(NsqError::UnexpectedFrame),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn ok_response_classifies_as_success() {
        assert!(classify_reply(Frame::Response(Bytes::from_static(OK_BODY))).is_ok());
    }

    #[test]
    fn non_ok_response_body_still_classifies_as_success() {
        assert!(classify_reply(Frame::Response(Bytes::from_static(b"whatever"))).is_ok());
    }

    #[test]
    fn error_frame_classifies_as_server_error() {
        let err = classify_reply(Frame::Error {
            code: "E_BAD_TOPIC".to_string(),
            message: Bytes::from_static(b"bad topic"),
        })
        .unwrap_err();
        assert!(matches!(err, NsqError::Server { code, .. } if code == "E_BAD_TOPIC"));
    }

    #[test]
    fn message_frame_is_unexpected() {
        use crate::wire::codec::Message;
        let msg = Message {
            timestamp: 0,
            attempts: 0,
            id: *b"0000000000000001",
            body: Bytes::from_static(b"x"),
        };
        let err = classify_reply(Frame::Message(msg)).unwrap_err();
        assert!(matches!(err, NsqError::UnexpectedFrame));
    }
}
