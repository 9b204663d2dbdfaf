//! Cross-frame messaging, modeled on `window.postMessage`.
//!
//! A sender names the origin it expects the receiving frame to have; a receiver checks the
//! origin of each event against the counterpart it expects. Either mismatch drops the
//! message without a reply.

use psicash_types::{Message, MessageId};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use url::Url;

/// Wildcard target origin, accepted by any receiver.
pub const ANY_ORIGIN: &str = "*";

/// A message as delivered to a frame's listener.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageEvent {
    /// Origin of the sending frame, as stamped by the browser.
    pub origin: String,
    /// JSON-encoded [Message].
    pub data: String,
}

/// The sending side of a frame channel.
pub trait FramePort: Clone + Send + Sync + 'static {
    /// Posts `data` to the frame, if that frame's origin matches `target_origin`.
    fn post_message(&self, data: String, target_origin: &str);
}

/// Serializes and posts a message.
pub fn post<P: FramePort>(port: &P, message: &Message, target_origin: &str) {
    match message.to_json() {
        Ok(data) => port.post_message(data, target_origin),
        Err(err) => error!(id = %message.id, error = %err, "failed to encode message"),
    }
}

/// Decodes an event from `expected_origin`. Anything else yields `None`.
pub fn accept(event: &MessageEvent, expected_origin: &str) -> Option<Message> {
    if event.origin != expected_origin {
        debug!(origin = %event.origin, expected = %expected_origin, "dropping foreign message");
        return None;
    }
    match Message::from_json(&event.data) {
        Ok(message) => Some(message),
        Err(err) => {
            warn!(origin = %event.origin, error = %err, "dropping malformed message");
            None
        }
    }
}

/// A fresh correlation id.
pub fn new_message_id() -> MessageId {
    MessageId::new(uuid::Uuid::new_v4().to_string())
}

/// The serialized origin (`scheme://host[:port]`) of a URL. `None` for opaque origins.
pub fn origin_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let origin = parsed.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

/// [FramePort] delivering into an in-process channel.
#[derive(Clone)]
pub struct ChannelPort {
    sender: mpsc::UnboundedSender<MessageEvent>,
    /// Origin stamped on delivered events.
    source_origin: String,
    /// Origin of the frame owning the receiver.
    receiver_origin: String,
}

impl ChannelPort {
    /// Creates a port from a frame at `source_origin` to a frame at `receiver_origin`,
    /// with the receiving frame's event stream.
    pub fn new(
        source_origin: impl Into<String>,
        receiver_origin: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<MessageEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                source_origin: source_origin.into(),
                receiver_origin: receiver_origin.into(),
            },
            receiver,
        )
    }
}

impl FramePort for ChannelPort {
    fn post_message(&self, data: String, target_origin: &str) {
        if target_origin != ANY_ORIGIN && target_origin != self.receiver_origin {
            debug!(
                target = %target_origin,
                receiver = %self.receiver_origin,
                "target origin mismatch; message not delivered"
            );
            return;
        }
        let event = MessageEvent {
            origin: self.source_origin.clone(),
            data,
        };
        if self.sender.send(event).is_err() {
            debug!(receiver = %self.receiver_origin, "frame is gone; message not delivered");
        }
    }
}

#[cfg(test)]
pub(crate) mod mocks {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// A port that records every post.
    #[derive(Clone, Default)]
    pub struct Recorder {
        pub posted: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl Recorder {
        /// Decoded messages posted so far, with their target origins.
        pub fn messages(&self) -> Vec<(Message, String)> {
            self.posted
                .lock()
                .unwrap()
                .iter()
                .map(|(data, target)| (Message::from_json(data).unwrap(), target.clone()))
                .collect()
        }

        pub fn clear(&self) {
            self.posted.lock().unwrap().clear();
        }
    }

    impl FramePort for Recorder {
        fn post_message(&self, data: String, target_origin: &str) {
            self.posted
                .lock()
                .unwrap()
                .push((data, target_origin.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psicash_types::{Action, ActionOptions, Kind};

    fn init_message() -> Message {
        Message::action(new_message_id(), Action::Init, Some(1000), ActionOptions::default())
    }

    #[test]
    fn origins() {
        assert_eq!(
            origin_of("https://example.com/a/b?c#d").as_deref(),
            Some("https://example.com")
        );
        assert_eq!(
            origin_of("http://localhost:8080/").as_deref(),
            Some("http://localhost:8080")
        );
        assert_eq!(
            origin_of("https://example.com:443/").as_deref(),
            Some("https://example.com")
        );
        assert_eq!(origin_of("data:text/plain,hi"), None);
        assert_eq!(origin_of("nope"), None);
    }

    #[test]
    fn accept_checks_origin_and_shape() {
        let data = init_message().to_json().unwrap();
        let event = MessageEvent {
            origin: "https://widget.psi.cash".to_string(),
            data: data.clone(),
        };
        assert!(accept(&event, "https://widget.psi.cash").is_some());
        assert!(accept(&event, "https://widget.psi.cash.evil.net").is_none());

        let garbage = MessageEvent {
            origin: "https://widget.psi.cash".to_string(),
            data: "{\"type\":\"".to_string(),
        };
        assert!(accept(&garbage, "https://widget.psi.cash").is_none());
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(new_message_id(), new_message_id());
    }

    #[tokio::test]
    async fn channel_port_respects_target_origin() {
        let (port, mut events) = ChannelPort::new("https://example.com", "https://widget.psi.cash");
        let message = init_message();

        post(&port, &message, "https://attacker.net");
        post(&port, &message, "https://widget.psi.cash");
        post(&port, &message, ANY_ORIGIN);
        drop(port);

        let mut delivered = Vec::new();
        while let Some(event) = events.recv().await {
            assert_eq!(event.origin, "https://example.com");
            delivered.push(accept(&event, "https://example.com").unwrap());
        }
        assert_eq!(delivered.len(), 2);
        assert!(delivered
            .iter()
            .all(|m| m.id == message.id && m.kind == Kind::Action(Action::Init)));
    }
}
