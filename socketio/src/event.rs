use std::fmt::{Display, Formatter, Result as FmtResult};

/// Event names the protocol uses itself. They can be listened to but never
/// emitted.
pub const RESERVED_EVENTS: [&str; 6] = [
    "connect",
    "connect_error",
    "disconnect",
    "disconnecting",
    "newListener",
    "removeListener",
];

/// An `Event` in `socket.io` is either one of the lifecycle events of a socket
/// or custom.
#[derive(Debug, PartialEq, PartialOrd, Clone, Eq, Hash)]
pub enum Event {
    /// The namespace accepted the connection.
    Connect,
    /// The namespace refused the connection or the manager failed to connect.
    ConnectError,
    /// The socket lost its namespace, the payload carries the reason.
    Disconnect,
    /// The event [`crate::Socket::send`] emits.
    Message,
    Custom(String),
}

impl Event {
    pub fn as_str(&self) -> &str {
        match self {
            Event::Connect => "connect",
            Event::ConnectError => "connect_error",
            Event::Disconnect => "disconnect",
            Event::Message => "message",
            Event::Custom(name) => name,
        }
    }

    pub fn is_reserved(&self) -> bool {
        RESERVED_EVENTS.contains(&self.as_str())
    }
}

impl From<String> for Event {
    fn from(string: String) -> Self {
        match &string[..] {
            "connect" => Event::Connect,
            "connect_error" => Event::ConnectError,
            "disconnect" => Event::Disconnect,
            "message" => Event::Message,
            _ => Event::Custom(string),
        }
    }
}

impl From<&str> for Event {
    fn from(string: &str) -> Self {
        Event::from(String::from(string))
    }
}

impl From<Event> for String {
    fn from(event: Event) -> Self {
        match event {
            Event::Custom(string) => string,
            other => other.as_str().to_owned(),
        }
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for name in ["connect", "connect_error", "disconnect", "message", "chat"] {
            assert_eq!(String::from(Event::from(name)), name);
        }
        assert_eq!(Event::from("Message"), Event::Custom("Message".to_owned()));
    }

    #[test]
    fn reserved_names() {
        assert!(Event::Connect.is_reserved());
        assert!(Event::from("disconnecting").is_reserved());
        assert!(Event::from("newListener").is_reserved());
        assert!(!Event::Message.is_reserved());
        assert!(!Event::from("chat").is_reserved());
    }
}
