//! Transport seams of a DBRB process.
//!
//! The connection pool is owned by the embedding node; the engine only
//! borrows writers from it. Outbound traffic flows through the
//! [`sender::MessageSender`] worker, inbound packets are verified off the
//! engine's executor by [`InboundDispatcher`] and then posted onto it.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::utilities::crypto::ProcessId;
use crate::message::{codec, Message};

pub(crate) mod sender;

pub use sender::MessageSender;

#[derive(Error, Debug)]
pub enum ConnectError {
    /// A connection attempt to this recipient is already in flight; the
    /// packet is retried on the next cycle.
    #[error("already connected")]
    AlreadyConnected,
    #[error("connection failed: {0}")]
    Failed(String),
}

/// A writer towards one remote process.
#[async_trait]
pub trait PacketWriter: Send + Sync {
    async fn write(&self, packet: Bytes) -> std::io::Result<()>;
}

/// Externally-owned pool of connections keyed by process identity.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    async fn acquire(&self, id: &ProcessId) -> Result<Arc<dyn PacketWriter>, ConnectError>;
}

/// Where verified inbound messages are posted. Implemented by the engine
/// handles.
pub trait MessageSink: Send + Sync {
    fn post(&self, message: Message);
}

/// Decodes and signature-checks inbound packets on the transport's task,
/// then posts them onto the engine's executor. Malformed or unverifiable
/// packets are dropped silently.
pub struct InboundDispatcher {
    sink: Arc<dyn MessageSink>,
}

impl InboundDispatcher {
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self { sink }
    }

    pub fn on_packet(&self, packet: Bytes) {
        let decoded = match codec::decode(packet.clone()) {
            Ok(decoded) => decoded,
            Err(err) => {
                log::warn!("dropping malformed packet: {err}");
                return;
            }
        };

        if !codec::verify_sender_signature(&packet, &decoded) {
            log::warn!(
                "dropping {} packet with invalid sender signature from {}",
                decoded.message.packet_type(),
                decoded.message.sender()
            );
            return;
        }

        self.sink.post(decoded.message);
    }
}

#[cfg(test)]
mod test {
    use parking_lot::Mutex;

    use crate::utilities::crypto::Keypair;
    use crate::message::{DeliverMessage, PacketType};
    use crate::utilities::hash::HashType;
    use crate::view::test::view_of;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        messages: Mutex<Vec<Message>>,
    }

    impl MessageSink for RecordingSink {
        fn post(&self, message: Message) {
            self.messages.lock().push(message);
        }
    }

    fn deliver_packet(keypair: &Keypair) -> Bytes {
        let message = Message::Deliver(DeliverMessage {
            sender: keypair.process_id(),
            payload_hash: HashType::new([1u8; 32]),
            view: view_of(&[1, 2, 3]),
        });
        codec::encode(&message, keypair)
    }

    #[test]
    fn test_valid_packet_is_posted() {
        let keypair = Keypair::generate(Some(31));
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = InboundDispatcher::new(sink.clone());

        dispatcher.on_packet(deliver_packet(&keypair));

        let messages = sink.messages.lock();
        assert_eq!(1, messages.len());
        assert_eq!(PacketType::Deliver, messages[0].packet_type());
    }

    #[test]
    fn test_tampered_packet_is_dropped() {
        let keypair = Keypair::generate(Some(32));
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = InboundDispatcher::new(sink.clone());

        let mut packet = deliver_packet(&keypair).to_vec();
        let last = packet.len() - 1;
        packet[last] ^= 0xff;
        dispatcher.on_packet(Bytes::from(packet));

        assert!(sink.messages.lock().is_empty());
    }

    #[test]
    fn test_garbage_is_dropped() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = InboundDispatcher::new(sink.clone());

        dispatcher.on_packet(Bytes::from_static(&[0, 1, 2, 3]));

        assert!(sink.messages.lock().is_empty());
    }
}
