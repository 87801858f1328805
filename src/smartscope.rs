//! SmartScope / SmartView monitoring units.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::connection::Backend;
use crate::error::{BackendError, Result};
use crate::property::{Property, PropertyChange};
use crate::protocol::Protocol;
use crate::session::{BackendEvent, MonitorEvent, Session, Transaction};

pub const DEFAULT_PORT: u16 = 9992;

pub const DEVICE_NAME: &str = "device_name";
pub const NUM_MONITORS: &str = "num_monitors";
pub const INVERTED: &str = "inverted";

// Monitor sections are lettered, so a unit reports at most this many
const MAX_MONITORS: usize = 26;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeSection {
    Preamble,
    Device,
    Network,
    Monitor(usize),
}

// "MONITOR A", "MONITOR B", ...
pub fn monitor_header(index: usize) -> Option<String> {
    let letter = u8::try_from(index)
        .ok()
        .filter(|&i| usize::from(i) < MAX_MONITORS)?;
    Some(format!("MONITOR {}", char::from(b'A' + letter)))
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum MonitorProperty {
    Brightness,
    Contrast,
    Saturation,
    Identify,
    Border,
    WidescreenSd,
    ScopeMode,
    AudioChannel,
}

impl MonitorProperty {
    const ALL: [MonitorProperty; 8] = [
        MonitorProperty::Brightness,
        MonitorProperty::Contrast,
        MonitorProperty::Saturation,
        MonitorProperty::Identify,
        MonitorProperty::Border,
        MonitorProperty::WidescreenSd,
        MonitorProperty::ScopeMode,
        MonitorProperty::AudioChannel,
    ];

    // Field name on the wire
    pub fn field(self) -> &'static str {
        match self {
            MonitorProperty::Brightness => "Brightness",
            MonitorProperty::Contrast => "Contrast",
            MonitorProperty::Saturation => "Saturation",
            MonitorProperty::Identify => "Identify",
            MonitorProperty::Border => "Border",
            MonitorProperty::WidescreenSd => "WidescreenSD",
            MonitorProperty::ScopeMode => "ScopeMode",
            MonitorProperty::AudioChannel => "AudioChannel",
        }
    }

    // Property for a "Field: value" line, by its prefix
    pub fn from_line(line: &str) -> Option<Self> {
        let (field, _) = line.split_once(':')?;
        Self::ALL.into_iter().find(|property| property.field() == field)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum MonitorValue {
    Int(i64),
    Text(String),
}

impl MonitorValue {
    // All-digit values are numbers, anything else stays text
    pub fn parse(text: &str) -> Self {
        if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(number) = text.parse() {
                return MonitorValue::Int(number);
            }
        }
        MonitorValue::Text(text.to_string())
    }
}

impl fmt::Display for MonitorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorValue::Int(number) => write!(f, "{}", number),
            MonitorValue::Text(text) => f.write_str(text),
        }
    }
}

impl From<i64> for MonitorValue {
    fn from(number: i64) -> Self {
        MonitorValue::Int(number)
    }
}

impl From<&str> for MonitorValue {
    fn from(text: &str) -> Self {
        MonitorValue::Text(text.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Monitor {
    name: String,
    index: usize,
    properties: BTreeMap<MonitorProperty, MonitorValue>,
}

impl Monitor {
    fn new(name: String, index: usize) -> Self {
        Self {
            name,
            index,
            properties: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn get(&self, property: MonitorProperty) -> Option<&MonitorValue> {
        self.properties.get(&property)
    }

    pub fn properties(&self) -> &BTreeMap<MonitorProperty, MonitorValue> {
        &self.properties
    }

    fn set(&mut self, property: MonitorProperty, value: MonitorValue) -> bool {
        if self.properties.get(&property) == Some(&value) {
            return false;
        }
        self.properties.insert(property, value);
        true
    }
}

#[derive(Debug)]
pub struct SmartScope {
    device_name: Property<Option<String>>,
    num_monitors: Property<usize>,
    inverted: Property<bool>,
    monitor_headers: Vec<String>,
    monitors: Vec<Monitor>,
}

impl Default for SmartScope {
    fn default() -> Self {
        Self::new()
    }
}

fn field_value(line: &str) -> Result<&str> {
    line.split_once(':')
        .map(|(_, value)| value.trim())
        .ok_or_else(|| BackendError::violation("expected a \"key: value\" line"))
}

impl SmartScope {
    pub fn new() -> Self {
        Self {
            device_name: Property::new(DEVICE_NAME, None),
            num_monitors: Property::new(NUM_MONITORS, 0),
            inverted: Property::new(INVERTED, false),
            monitor_headers: Vec::new(),
            monitors: Vec::new(),
        }
    }

    /// Start with a user-chosen name.
    ///
    /// The name the device reports only replaces it while it still equals
    /// the device id.
    pub fn with_name(name: impl Into<String>) -> Self {
        let mut scope = Self::new();
        scope.device_name = Property::new(DEVICE_NAME, Some(name.into()));
        scope
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device_name.get().as_deref()
    }

    pub fn num_monitors(&self) -> usize {
        *self.num_monitors.get()
    }

    pub fn inverted(&self) -> bool {
        *self.inverted.get()
    }

    pub fn monitors(&self) -> &[Monitor] {
        &self.monitors
    }

    fn monitor_mut(&mut self, index: usize) -> Option<&mut Monitor> {
        if let Some(position) = self.monitors.iter().position(|m| m.index == index) {
            return self.monitors.get_mut(position);
        }
        let name = self.monitor_headers.get(index)?.clone();
        log::debug!("Adding monitor {}", name);
        self.monitors.push(Monitor::new(name, index));
        self.monitors.last_mut()
    }

    fn parse_device_line(&mut self, session: &mut Session, line: &str) -> Result<()> {
        let value = field_value(line)?;
        if line.starts_with("Model:") {
            session.set_device_model(value.to_string());
        } else if line.starts_with("Hostname:") {
            let (_, id) = value
                .split_once('-')
                .ok_or_else(|| BackendError::violation(format!("hostname without id: {:?}", value)))?;
            session.set_device_id(id.to_uppercase());
        } else if line.starts_with("Name:") {
            let keep = match self.device_name() {
                None => false,
                Some(name) => Some(name) != session.device_id(),
            };
            if !keep {
                self.device_name
                    .set(Some(value.to_string()), &mut session.notifier);
            }
        } else if line.starts_with("Monitors:") {
            let count = value
                .parse()
                .map_err(|_| BackendError::violation(format!("expected a number, got {:?}", value)))?;
            self.num_monitors.set(count, &mut session.notifier);
        } else if line.starts_with("Inverted:") {
            self.inverted.set(value == "true", &mut session.notifier);
        }
        Ok(())
    }

    fn parse_monitor_line(&mut self, session: &Session, index: usize, line: &str) -> Result<()> {
        // Any line in a monitor section creates the monitor
        let monitor = self
            .monitor_mut(index)
            .ok_or(BackendError::UnknownMonitor(index))?;
        let Some(property) = MonitorProperty::from_line(line) else {
            return Ok(());
        };
        let value = MonitorValue::parse(field_value(line)?);
        if monitor.set(property, value.clone()) {
            session.publish(BackendEvent::Monitor(MonitorEvent {
                backend: session.address().to_string(),
                monitor: monitor.name.clone(),
                property,
                value,
            }));
        }
        Ok(())
    }

    pub(crate) fn monitor_command(
        &self,
        monitor: usize,
        property: MonitorProperty,
        value: &MonitorValue,
    ) -> Result<Transaction> {
        let header = self
            .monitor_headers
            .get(monitor)
            .ok_or(BackendError::UnknownMonitor(monitor))?;
        Ok(Transaction::section(
            header,
            [format!("{}: {}", property.field(), value)],
        ))
    }
}

impl Protocol for SmartScope {
    type Section = ScopeSection;

    const NAME: &'static str = "SmartScope";
    const DEFAULT_PORT: u16 = DEFAULT_PORT;

    fn section(&self, name: &str) -> Option<ScopeSection> {
        match name {
            "PROTOCOL PREAMBLE" => Some(ScopeSection::Preamble),
            "SMARTVIEW DEVICE" => Some(ScopeSection::Device),
            "NETWORK" => Some(ScopeSection::Network),
            _ => self
                .monitor_headers
                .iter()
                .position(|header| header == name)
                .map(ScopeSection::Monitor),
        }
    }

    fn parse_line(&mut self, session: &mut Session, section: ScopeSection, line: &str) -> Result<()> {
        match section {
            ScopeSection::Preamble => {
                if line.starts_with("Version:") {
                    session.set_device_version(field_value(line)?.to_string());
                }
                Ok(())
            }
            ScopeSection::Device => self.parse_device_line(session, line),
            ScopeSection::Network => Ok(()),
            ScopeSection::Monitor(index) => self.parse_monitor_line(session, index, line),
        }
    }

    // The prelude has no terminator; it ends with the last monitor's block
    fn blank_ends_prelude(&self, _session: &Session, section: Option<ScopeSection>) -> bool {
        let count = self.num_monitors();
        count > 0
            && section == Some(ScopeSection::Monitor(count - 1))
            && self.monitors.len() == count
    }

    fn react(&mut self, _session: &mut Session, change: &PropertyChange) {
        if change.name != NUM_MONITORS {
            return;
        }
        let count = self.num_monitors();
        if count > MAX_MONITORS {
            log::warn!("Device reports {} monitors, only {} are addressable", count, MAX_MONITORS);
        }
        self.monitor_headers = (0..count).filter_map(monitor_header).collect();
    }
}

pub type SmartScopeBackend = Backend<SmartScope>;

impl Backend<SmartScope> {
    pub fn device_name(&self) -> Option<String> {
        self.read(|scope, _| scope.device_name().map(str::to_string))
    }

    pub fn num_monitors(&self) -> usize {
        self.read(|scope, _| scope.num_monitors())
    }

    pub fn inverted(&self) -> bool {
        self.read(|scope, _| scope.inverted())
    }

    pub fn monitors(&self) -> Vec<Monitor> {
        self.read(|scope, _| scope.monitors().to_vec())
    }

    pub fn monitor(&self, index: usize) -> Option<Monitor> {
        self.read(|scope, _| scope.monitors().iter().find(|m| m.index() == index).cloned())
    }

    /// Change one setting of a monitor.
    ///
    /// Resolves to whether the device acknowledged the command; the stored
    /// value follows once the device reports it back.
    pub async fn set_monitor_property(
        &self,
        monitor: usize,
        property: MonitorProperty,
        value: impl Into<MonitorValue>,
    ) -> Result<bool> {
        let value = value.into();
        let transaction = self.read(|scope, _| scope.monitor_command(monitor, property, &value))?;
        log::info!(
            "Setting {} of monitor {} to {} on {}",
            property.field(),
            monitor,
            value,
            self.address()
        );
        Ok(self.transact(transaction).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Link;

    const PRELUDE: &str = include_str!("../tests/fixtures/smartscope-prelude.txt");

    fn lines(text: &str) -> Vec<String> {
        text.split_terminator('\n').map(str::to_string).collect()
    }

    fn link(scope: SmartScope) -> Link<SmartScope> {
        let mut link = Link::new(Session::new("10.0.0.9:9992"), scope);
        link.session.set_connected(true);
        link
    }

    #[test]
    fn prelude_populates_device_and_monitors() {
        let mut link = link(SmartScope::new());
        link.parse_batch(&lines(PRELUDE));

        assert!(link.session.is_prelude_parsed());
        assert_eq!(link.session.device_id(), Some("0A1B2C3D4E5F"));
        assert_eq!(link.session.device_model(), Some("SmartScope Duo 4K"));
        assert_eq!(link.session.device_version(), Some("1.3"));

        let scope = &link.device;
        assert_eq!(scope.device_name(), Some("SmartScope Duo"));
        assert_eq!(scope.num_monitors(), 2);
        assert!(!scope.inverted());
        assert_eq!(scope.monitors().len(), 2);

        let b = &scope.monitors()[1];
        assert_eq!(b.name(), "MONITOR B");
        assert_eq!(b.get(MonitorProperty::Brightness), Some(&MonitorValue::Int(255)));
        assert_eq!(
            b.get(MonitorProperty::ScopeMode),
            Some(&MonitorValue::Text("WaveformLuma".into()))
        );
        assert_eq!(
            b.get(MonitorProperty::Identify),
            Some(&MonitorValue::Text("false".into()))
        );
        assert_eq!(b.properties().len(), 8);
    }

    #[test]
    fn blank_after_first_monitor_does_not_end_prelude() {
        let mut link = link(SmartScope::new());
        let first_block = PRELUDE
            .split("MONITOR B:")
            .next()
            .unwrap_or_default();
        link.parse_batch(&lines(first_block));
        assert!(!link.session.is_prelude_parsed());
        assert_eq!(link.device.monitors().len(), 1);
        assert!(link.cursor().is_none());

        link.parse_batch(&lines("MONITOR B:\nBrightness: 10\n\n"));
        assert!(link.session.is_prelude_parsed());
    }

    #[test]
    fn monitor_with_only_unknown_fields_still_counts() {
        let mut link = link(SmartScope::new());
        link.parse_batch(&lines(
            "SMARTVIEW DEVICE:\nMonitors: 2\n\nMONITOR A:\nBrightness: 3\n\nMONITOR B:\nLUT: none\n\n",
        ));
        assert!(link.session.is_prelude_parsed());
        assert_eq!(link.device.monitors().len(), 2);
        assert_eq!(link.device.monitors()[1].name(), "MONITOR B");
        assert_eq!(link.device.monitors()[1].get(MonitorProperty::Brightness), None);
    }

    #[test]
    fn reported_name_only_replaces_the_id_placeholder() {
        let mut link = link(SmartScope::with_name("0A1B2C3D4E5F"));
        link.parse_batch(&lines(PRELUDE));
        assert_eq!(link.device.device_name(), Some("SmartScope Duo"));

        let mut link = self::link(SmartScope::with_name("Rack 4"));
        link.parse_batch(&lines(PRELUDE));
        assert_eq!(link.device.device_name(), Some("Rack 4"));
    }

    #[test]
    fn monitor_updates_publish_only_changes() {
        let mut link = link(SmartScope::new());
        link.parse_batch(&lines(PRELUDE));
        let mut events = link.session.subscribe();

        link.parse_batch(&lines(
            "ACK\n\nMONITOR A:\nBrightness: 200\nContrast: 127\nFrobnicate: 3\n\n",
        ));

        let event = match events.try_recv() {
            Ok(BackendEvent::Monitor(event)) => event,
            other => panic!("expected a monitor event, got {:?}", other),
        };
        assert_eq!(event.monitor, "MONITOR A");
        assert_eq!(event.property, MonitorProperty::Brightness);
        assert_eq!(event.value, MonitorValue::Int(200));
        assert_eq!(event.backend, "10.0.0.9:9992");
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn monitor_command_uses_wire_field_names() {
        let mut link = link(SmartScope::new());
        link.parse_batch(&lines(PRELUDE));

        let tx = link
            .device
            .monitor_command(1, MonitorProperty::WidescreenSd, &MonitorValue::from("on"))
            .unwrap();
        assert_eq!(tx.payload(), "MONITOR B:\nWidescreenSD: on\n\n");

        let err = link
            .device
            .monitor_command(2, MonitorProperty::Brightness, &MonitorValue::from(3i64))
            .unwrap_err();
        assert!(matches!(err, BackendError::UnknownMonitor(2)));
    }

    #[test]
    fn monitor_headers_stop_at_z() {
        assert_eq!(monitor_header(0).as_deref(), Some("MONITOR A"));
        assert_eq!(monitor_header(25).as_deref(), Some("MONITOR Z"));
        assert_eq!(monitor_header(26), None);
    }

    #[test]
    fn digits_become_numbers() {
        assert_eq!(MonitorValue::parse("42"), MonitorValue::Int(42));
        assert_eq!(MonitorValue::parse("-1"), MonitorValue::Text("-1".into()));
        assert_eq!(MonitorValue::parse(""), MonitorValue::Text(String::new()));
        assert_eq!(MonitorValue::Int(7).to_string(), "7");
    }

    #[test]
    fn property_names_are_snake_case() {
        let json = serde_json::to_string(&MonitorProperty::WidescreenSd).unwrap();
        assert_eq!(json, "\"widescreen_sd\"");
        let value: MonitorValue = serde_json::from_str("12").unwrap();
        assert_eq!(value, MonitorValue::Int(12));
    }
}
