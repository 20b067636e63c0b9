use bytes::BytesMut;

use crate::error::ErrorCode;
use crate::event_loop::LoopCtx;

/// What a message carries. Handshake messages originate inside a TLS
/// handler and bypass user-visible accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    ApplicationData,
    Handshake,
}

pub type CompletionFn = Box<dyn FnOnce(&mut LoopCtx<'_>, ErrorCode) + Send>;

/// A buffer flowing along a channel's slot chain.
///
/// Ownership transfers slot to slot; whoever holds a message must either
/// forward it or drop it. Write messages may carry a completion callback
/// fired once the terminal handler has handed every byte to the kernel, or
/// with the shutdown error if the channel goes down first.
pub struct Message {
    pub data: BytesMut,
    pub kind: MessageKind,
    pub(crate) on_completion: Option<CompletionFn>,
}

impl Message {
    pub fn application(data: impl Into<BytesMut>) -> Message {
        Message {
            data: data.into(),
            kind: MessageKind::ApplicationData,
            on_completion: None,
        }
    }

    pub fn handshake(data: impl Into<BytesMut>) -> Message {
        Message {
            data: data.into(),
            kind: MessageKind::Handshake,
            on_completion: None,
        }
    }

    /// Attach a completion callback, replacing any existing one.
    pub fn on_completion(
        mut self,
        f: impl FnOnce(&mut LoopCtx<'_>, ErrorCode) + Send + 'static,
    ) -> Message {
        self.on_completion = Some(Box::new(f));
        self
    }

    pub(crate) fn take_completion(&mut self) -> Option<CompletionFn> {
        self.on_completion.take()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("len", &self.data.len())
            .field("has_completion", &self.on_completion.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_message_defaults() {
        let msg = Message::application(&b"hello"[..]);
        assert_eq!(msg.kind, MessageKind::ApplicationData);
        assert_eq!(msg.len(), 5);
        assert!(!msg.is_empty());
        assert!(msg.on_completion.is_none());
    }

    #[test]
    fn completion_is_taken_once() {
        let mut msg = Message::application(&b"x"[..]).on_completion(|_, _| {});
        assert!(msg.take_completion().is_some());
        assert!(msg.take_completion().is_none());
    }
}
