//! Routes events to the partition owning their key

use std::sync::Arc;

use tracing::trace;

use crate::codec::SerializerDeserializer;
use crate::emitter::Emitter;
use crate::error::Result;
use crate::event::{Event, EventMessage};
use crate::partition::Hasher;

/// Hashes an event's key to a partition and hands it to the emitter
pub struct Router {
    hasher: Arc<dyn Hasher>,
    emitter: Arc<dyn Emitter>,
    codec: Arc<dyn SerializerDeserializer>,
}

impl Router {
    /// Create a router
    pub fn new(
        hasher: Arc<dyn Hasher>,
        emitter: Arc<dyn Emitter>,
        codec: Arc<dyn SerializerDeserializer>,
    ) -> Self {
        Self {
            hasher,
            emitter,
            codec,
        }
    }

    /// Send `event` on `stream`; returns the partition it went to
    pub fn route(&self, stream: &str, event: &Event) -> Result<u32> {
        let partition = self.hasher.partition_of(event.key());
        let payload = self.codec.encode_event(event)?;
        let message = EventMessage::new(partition, stream, payload);
        trace!(%message, "routing event");
        self.emitter.send(partition, &message)?;
        Ok(partition)
    }

    /// Partition function in use
    pub fn hasher(&self) -> &Arc<dyn Hasher> {
        &self.hasher
    }

    /// Outbound transport in use
    pub fn emitter(&self) -> &Arc<dyn Emitter> {
        &self.emitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodeCodec;
    use crate::error::{Error, TransportError};
    use crate::partition::DefaultHasher;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Capture {
        sent: Mutex<Vec<(u32, EventMessage)>>,
    }

    impl Emitter for Capture {
        fn send(&self, partition: u32, message: &EventMessage) -> std::result::Result<(), TransportError> {
            self.sent.lock().push((partition, message.clone()));
            Ok(())
        }

        fn close(&self) {}
    }

    struct Refusing;

    impl Emitter for Refusing {
        fn send(&self, partition: u32, _message: &EventMessage) -> std::result::Result<(), TransportError> {
            Err(TransportError::NoAssignment { partition })
        }

        fn close(&self) {}
    }

    #[test]
    fn test_route_uses_key_partition() {
        let capture = Arc::new(Capture::default());
        let codec = Arc::new(BincodeCodec);
        let router = Router::new(
            Arc::new(DefaultHasher::new(16).unwrap()),
            Arc::clone(&capture) as Arc<dyn Emitter>,
            codec.clone(),
        );
        let event = Event::builder("doobie").field("word", "doobie").build();

        let partition = router.route("words", &event).unwrap();
        assert_eq!(partition, 12);

        let sent = capture.sent.lock();
        assert_eq!(sent.len(), 1);
        let (to, message) = &sent[0];
        assert_eq!(*to, 12);
        assert_eq!(message.target_partition, 12);
        assert_eq!(message.stream_name, "words");
        assert_eq!(codec.decode_event(&message.payload).unwrap(), event);
    }

    #[test]
    fn test_route_surfaces_transport_errors() {
        let router = Router::new(
            Arc::new(DefaultHasher::new(4).unwrap()),
            Arc::new(Refusing),
            Arc::new(BincodeCodec),
        );
        let err = router.route("s", &Event::builder("k").build()).unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::NoAssignment { .. })));
    }
}
