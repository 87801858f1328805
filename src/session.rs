//! State shared by every protocol variant: identity, lifecycle flags, the
//! rendezvous slot and the event fan-out.

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::preset::Preset;
use crate::property::{Notifier, Property, PropertyChange};
use crate::smartscope::{MonitorProperty, MonitorValue};

pub const CONNECTED: &str = "connected";
pub const PRELUDE_PARSED: &str = "prelude_parsed";
pub const DEVICE_ID: &str = "device_id";
pub const DEVICE_MODEL: &str = "device_model";
pub const DEVICE_VERSION: &str = "device_version";

const EVENT_CAPACITY: usize = 256;

// Everything a backend publishes to its subscribers
#[derive(Debug, Clone)]
pub enum BackendEvent {
    Property(PropertyChange),
    PresetAdded(PresetEvent),
    PresetStored(PresetEvent),
    PresetActive(PresetEvent),
    Monitor(MonitorEvent),
}

// A preset event with the address of the backend that owns the preset
#[derive(Debug, Clone)]
pub struct PresetEvent {
    pub backend: String,
    pub preset: Preset,
}

#[derive(Debug, Clone)]
pub struct MonitorEvent {
    pub backend: String,
    pub monitor: String,
    pub property: MonitorProperty,
    pub value: MonitorValue,
}

/// A command block submitted to the device as one unit.
///
/// The payload is a section header, one line per item and the blank line
/// that terminates the block. `hold` names the state property whose
/// notifications are held while the command is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    hold: Option<&'static str>,
    payload: String,
}

impl Transaction {
    pub fn section<I, S>(header: &str, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut payload = format!("{}:\n", header);
        for line in lines {
            payload.push_str(line.as_ref());
            payload.push('\n');
        }
        payload.push('\n');
        Self {
            hold: None,
            payload,
        }
    }

    pub fn holding(mut self, name: &'static str) -> Self {
        self.hold = Some(name);
        self
    }

    pub fn hold(&self) -> Option<&'static str> {
        self.hold
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn into_payload(self) -> String {
        self.payload
    }
}

#[derive(Debug)]
pub struct Session {
    address: String,
    events: broadcast::Sender<BackendEvent>,
    pub(crate) notifier: Notifier,
    pub(crate) connected: Property<bool>,
    pub(crate) prelude_parsed: Property<bool>,
    pub(crate) device_id: Property<Option<String>>,
    pub(crate) device_model: Property<Option<String>>,
    pub(crate) device_version: Property<Option<String>>,
    // Last ACK/NAK line seen, waiting for a command to claim it
    pub(crate) acknowledgment: Option<String>,
    pub(crate) read_enabled: bool,
    pub(crate) cancel: Option<CancellationToken>,
    // Commands queued by control-list writes, spawned by the backend
    pub(crate) outbox: Vec<Transaction>,
}

impl Session {
    pub fn new(address: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            address: address.into(),
            events,
            notifier: Notifier::new(),
            connected: Property::new(CONNECTED, false),
            prelude_parsed: Property::new(PRELUDE_PARSED, false),
            device_id: Property::new(DEVICE_ID, None),
            device_model: Property::new(DEVICE_MODEL, None),
            device_version: Property::new(DEVICE_VERSION, None),
            acknowledgment: None,
            read_enabled: false,
            cancel: None,
            outbox: Vec::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.get()
    }

    pub fn is_prelude_parsed(&self) -> bool {
        *self.prelude_parsed.get()
    }

    // Connected and done with the handshake
    pub fn is_ready(&self) -> bool {
        self.is_connected() && self.is_prelude_parsed()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.get().as_deref()
    }

    pub fn device_model(&self) -> Option<&str> {
        self.device_model.get().as_deref()
    }

    pub fn device_version(&self) -> Option<&str> {
        self.device_version.get().as_deref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    pub fn publish(&self, event: BackendEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn preset_event(&self, preset: &Preset) -> PresetEvent {
        PresetEvent {
            backend: self.address.clone(),
            preset: preset.clone(),
        }
    }

    pub(crate) fn set_connected(&mut self, connected: bool) {
        self.connected.set(connected, &mut self.notifier);
    }

    pub(crate) fn set_prelude_parsed(&mut self, parsed: bool) {
        self.prelude_parsed.set(parsed, &mut self.notifier);
    }

    pub(crate) fn set_device_id(&mut self, id: String) {
        self.device_id.set(Some(id), &mut self.notifier);
    }

    pub(crate) fn set_device_model(&mut self, model: String) {
        self.device_model.set(Some(model), &mut self.notifier);
    }

    pub(crate) fn set_device_version(&mut self, version: String) {
        self.device_version.set(Some(version), &mut self.notifier);
    }

    pub(crate) fn queue(&mut self, transaction: Transaction) {
        self.outbox.push(transaction);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_payload_ends_with_blank_line() {
        let tx = Transaction::section("VIDEO OUTPUT ROUTING", ["0 3", "1 2"]).holding("crosspoints");
        assert_eq!(tx.payload(), "VIDEO OUTPUT ROUTING:\n0 3\n1 2\n\n");
        assert_eq!(tx.hold(), Some("crosspoints"));
    }

    #[test]
    fn empty_section_is_a_status_query() {
        let tx = Transaction::section("INPUT LABELS", Vec::<String>::new());
        assert_eq!(tx.into_payload(), "INPUT LABELS:\n\n");
    }

    #[test]
    fn publish_without_subscribers_is_harmless() {
        let session = Session::new("10.0.0.5:9990");
        session.publish(BackendEvent::Property(PropertyChange {
            name: CONNECTED,
            value: crate::property::Value::Flag(true),
            kind: crate::property::ChangeKind::Bulk,
        }));
        assert_eq!(session.address(), "10.0.0.5:9990");
        assert!(!session.is_ready());
    }
}
