//! Processing elements
//!
//! A processing element (PE) is the unit of keyed, stateful computation. The
//! runtime keeps one instance per (PE type, key), feeds it events one at a
//! time, and may snapshot its state between events.

use std::fmt;

use crate::event::Event;

/// Error type returned by application PE code
pub type PeError = Box<dyn std::error::Error + Send + Sync>;

/// Identity of a PE instance within one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    /// Wrap a raw identifier
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw identifier
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pe-{}", self.0)
    }
}

/// An event a PE wants delivered downstream
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    /// Target stream
    pub stream: String,
    /// Event to route by its key
    pub event: Event,
}

/// Handed to [`ProcessingElement::process`]; collects downstream emissions.
///
/// Emissions are routed after the processing permit is released, so a PE
/// never performs network I/O while holding its own state.
#[derive(Debug)]
pub struct ProcessContext<'a> {
    pe_type: &'a str,
    key: &'a [u8],
    emissions: Vec<Emission>,
}

impl<'a> ProcessContext<'a> {
    pub(crate) fn new(pe_type: &'a str, key: &'a [u8]) -> Self {
        Self {
            pe_type,
            key,
            emissions: Vec::new(),
        }
    }

    /// Type of the PE being run
    pub fn pe_type(&self) -> &str {
        self.pe_type
    }

    /// Key of the PE being run
    pub fn key(&self) -> &[u8] {
        self.key
    }

    /// Emit `event` on `stream`
    pub fn emit(&mut self, stream: impl Into<String>, event: Event) {
        self.emissions.push(Emission {
            stream: stream.into(),
            event,
        });
    }

    pub(crate) fn into_emissions(self) -> Vec<Emission> {
        self.emissions
    }
}

/// Application logic for one keyed instance
pub trait ProcessingElement: Send + 'static {
    /// Creation hook, run once before the first event
    fn on_create(&mut self) -> Result<(), PeError> {
        Ok(())
    }

    /// Apply one event to the instance state
    fn process(&mut self, event: &Event, ctx: &mut ProcessContext<'_>) -> Result<(), PeError>;

    /// Serialize the current state; `None` means the PE is not checkpointed
    fn snapshot(&self) -> Result<Option<Vec<u8>>, PeError> {
        Ok(None)
    }

    /// Replace the state with a previously taken snapshot
    fn restore(&mut self, _snapshot: &[u8]) -> Result<(), PeError> {
        Ok(())
    }

    /// Removal hook, run once after the last event
    fn on_remove(&mut self) {}
}

/// Builds PE instances of one type
pub trait PeFactory: Send + Sync {
    /// Create the instance for `key`
    fn create(&self, pe_type: &str, key: &[u8]) -> Result<Box<dyn ProcessingElement>, PeError>;
}

/// [`PeFactory`] backed by a closure over the key
pub struct FnFactory<F>(pub F);

impl<F> PeFactory for FnFactory<F>
where
    F: Fn(&[u8]) -> Result<Box<dyn ProcessingElement>, PeError> + Send + Sync,
{
    fn create(&self, _pe_type: &str, key: &[u8]) -> Result<Box<dyn ProcessingElement>, PeError> {
        (self.0)(key)
    }
}

/// Printable form of a key for logs and errors
pub fn display_key(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl ProcessingElement for Echo {
        fn process(&mut self, event: &Event, ctx: &mut ProcessContext<'_>) -> Result<(), PeError> {
            ctx.emit("echo", event.clone());
            Ok(())
        }
    }

    #[test]
    fn test_context_collects_emissions() {
        let event = Event::builder("k").field("v", 1i64).build();
        let mut ctx = ProcessContext::new("echo", b"k");
        Echo.process(&event, &mut ctx).unwrap();

        assert_eq!(ctx.pe_type(), "echo");
        let emissions = ctx.into_emissions();
        assert_eq!(emissions.len(), 1);
        assert_eq!(emissions[0].stream, "echo");
        assert_eq!(emissions[0].event, event);
    }

    #[test]
    fn test_default_snapshot_opts_out() {
        assert!(Echo.snapshot().unwrap().is_none());
    }

    #[test]
    fn test_instance_id_display() {
        assert_eq!(InstanceId::new(42).to_string(), "pe-42");
    }
}
