use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::property::Value;
use crate::session::{BackendEvent, CONNECTED, DEVICE_ID, DEVICE_MODEL, PresetEvent};
use crate::smartscope::{MonitorProperty, MonitorValue};
use crate::vidhub::{CROSSPOINTS, INPUT_LABELS, NUM_INPUTS, NUM_OUTPUTS, OUTPUT_LABELS};

// Emitter data for route changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RouteChangedEmitter {
    // Output port number
    pub output: usize,
    // Input port number
    pub input: usize,
    // Optional output label
    pub output_label: Option<String>,
    // Optional input label
    pub input_label: Option<String>,
}

// Emitter data for device status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceStatusEmitter {
    // Whether the device is connected
    pub connected: bool,
    // Device id (if available)
    pub device_id: Option<String>,
    // Device model name (if available)
    pub model_name: Option<String>,
    // Number of video inputs
    pub video_inputs: Option<usize>,
    // Number of video outputs
    pub video_outputs: Option<usize>,
}

// Emitter data for label changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LabelChangedEmitter {
    // Port type ("input" or "output")
    pub port_type: String,
    // Port number
    pub port: usize,
    // New label
    pub label: String,
}

// Emitter data for preset changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PresetEmitter {
    // "added", "stored" or "active"
    pub event: String,
    pub index: usize,
    pub name: String,
    // Whether every stored route is currently live
    pub active: bool,
    // Number of stored routes
    pub routes: usize,
}

// Emitter data for SmartScope monitor changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MonitorChangedEmitter {
    // Monitor section name, e.g. "MONITOR A"
    pub monitor: String,
    pub property: MonitorProperty,
    pub value: MonitorValue,
}

// One JSON line written to the emission stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "emitter", rename_all = "kebab-case")]
pub enum Emission {
    RouteChanged(RouteChangedEmitter),
    LabelChanged(LabelChangedEmitter),
    DeviceStatus(DeviceStatusEmitter),
    Preset(PresetEmitter),
    MonitorChanged(MonitorChangedEmitter),
}

fn preset_emission(event: &str, preset_event: &PresetEvent) -> Emission {
    let preset = &preset_event.preset;
    Emission::Preset(PresetEmitter {
        event: event.to_string(),
        index: preset.index(),
        name: preset.name().to_string(),
        active: preset.is_active(),
        routes: preset.crosspoints().len(),
    })
}

// Turns backend events into emissions, reporting only what differs from the
// last known state
#[derive(Debug, Default)]
pub struct EmissionTracker {
    status: DeviceStatusEmitter,
    routes: Vec<usize>,
    input_labels: Vec<String>,
    output_labels: Vec<String>,
}

impl EmissionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, event: &BackendEvent) -> Vec<Emission> {
        match event {
            BackendEvent::Property(change) => self.property_changed(change.name, &change.value),
            BackendEvent::PresetAdded(preset) => vec![preset_emission("added", preset)],
            BackendEvent::PresetStored(preset) => vec![preset_emission("stored", preset)],
            BackendEvent::PresetActive(preset) => vec![preset_emission("active", preset)],
            BackendEvent::Monitor(monitor) => vec![Emission::MonitorChanged(MonitorChangedEmitter {
                monitor: monitor.monitor.clone(),
                property: monitor.property,
                value: monitor.value.clone(),
            })],
        }
    }

    fn property_changed(&mut self, name: &str, value: &Value) -> Vec<Emission> {
        match (name, value) {
            (CROSSPOINTS, Value::Routing(routes)) => self.routes_changed(routes),
            (INPUT_LABELS, Value::Labels(labels)) => {
                let emissions = labels_changed("input", &self.input_labels, labels);
                self.input_labels = labels.clone();
                emissions
            }
            (OUTPUT_LABELS, Value::Labels(labels)) => {
                let emissions = labels_changed("output", &self.output_labels, labels);
                self.output_labels = labels.clone();
                emissions
            }
            (CONNECTED, Value::Flag(connected)) => self.status_changed(|status| status.connected = *connected),
            (DEVICE_ID, Value::Text(id)) => self.status_changed(|status| status.device_id = id.clone()),
            (DEVICE_MODEL, Value::Text(model)) => {
                self.status_changed(|status| status.model_name = model.clone())
            }
            (NUM_INPUTS, Value::Count(count)) => {
                self.status_changed(|status| status.video_inputs = Some(*count))
            }
            (NUM_OUTPUTS, Value::Count(count)) => {
                self.status_changed(|status| status.video_outputs = Some(*count))
            }
            _ => Vec::new(),
        }
    }

    fn routes_changed(&mut self, routes: &[usize]) -> Vec<Emission> {
        let emissions = routes
            .iter()
            .enumerate()
            .filter(|(output, input)| self.routes.get(*output) != Some(*input))
            .map(|(output, &input)| {
                Emission::RouteChanged(RouteChangedEmitter {
                    output,
                    input,
                    output_label: self.output_labels.get(output).cloned(),
                    input_label: self.input_labels.get(input).cloned(),
                })
            })
            .collect();
        self.routes = routes.to_vec();
        emissions
    }

    fn status_changed(&mut self, apply: impl FnOnce(&mut DeviceStatusEmitter)) -> Vec<Emission> {
        let mut status = self.status.clone();
        apply(&mut status);
        if status == self.status {
            return Vec::new();
        }
        self.status = status.clone();
        vec![Emission::DeviceStatus(status)]
    }
}

fn labels_changed(port_type: &str, previous: &[String], labels: &[String]) -> Vec<Emission> {
    labels
        .iter()
        .enumerate()
        .filter(|(port, label)| previous.get(*port) != Some(*label))
        .map(|(port, label)| {
            Emission::LabelChanged(LabelChangedEmitter {
                port_type: port_type.to_string(),
                port,
                label: label.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{ChangeKind, PropertyChange};

    fn change(name: &'static str, value: Value) -> BackendEvent {
        BackendEvent::Property(PropertyChange {
            name,
            value,
            kind: ChangeKind::Bulk,
        })
    }

    #[test]
    fn only_changed_routes_are_emitted() {
        let mut tracker = EmissionTracker::new();
        tracker.track(&change(INPUT_LABELS, Value::Labels(vec!["Cam 1".into(), "Cam 2".into()])));
        assert_eq!(tracker.track(&change(CROSSPOINTS, Value::Routing(vec![0, 0]))).len(), 2);

        let emissions = tracker.track(&change(CROSSPOINTS, Value::Routing(vec![0, 1])));
        assert_eq!(
            emissions,
            vec![Emission::RouteChanged(RouteChangedEmitter {
                output: 1,
                input: 1,
                output_label: None,
                input_label: Some("Cam 2".into()),
            })]
        );
    }

    #[test]
    fn status_is_emitted_when_any_field_changes() {
        let mut tracker = EmissionTracker::new();
        let emissions = tracker.track(&change(CONNECTED, Value::Flag(true)));
        assert_eq!(emissions.len(), 1);
        assert!(tracker.track(&change(CONNECTED, Value::Flag(true))).is_empty());

        let emissions = tracker.track(&change(NUM_OUTPUTS, Value::Count(12)));
        let Some(Emission::DeviceStatus(status)) = emissions.first() else {
            panic!("expected a status emission");
        };
        assert!(status.connected);
        assert_eq!(status.video_outputs, Some(12));
    }

    #[test]
    fn emissions_serialize_with_kebab_tags() {
        let emission = Emission::LabelChanged(LabelChangedEmitter {
            port_type: "output".into(),
            port: 3,
            label: "Program".into(),
        });
        let json = serde_json::to_value(&emission).unwrap();
        assert_eq!(json["emitter"], "label-changed");
        assert_eq!(json["port"], 3);
    }
}
