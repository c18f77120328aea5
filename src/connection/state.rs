/// Lifecycle state of one connection to an nsqd instance.
///
/// `Closed` and `Closing` are kept as distinct variants: closing is still
/// draining a `CLS` acknowledgement, closed is fully torn down, and the two
/// must not compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Connected,
    Subscribed,
    Closing,
    Closed,
    Reconnecting,
}

impl ConnectionState {
    pub fn is_usable(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Subscribed)
    }
}
