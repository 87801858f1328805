use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::smartscope::{MonitorProperty, MonitorValue};

// Action data for setting a video route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SetRouteAction {
    // Output port number (0-indexed)
    pub output: usize,
    // Input port number (0-indexed)
    pub input: usize,
}

// Action data for setting an input label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SetInputLabelAction {
    // Input port number (0-indexed)
    pub input: usize,
    // New label for the input
    pub label: String,
}

// Action data for setting an output label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SetOutputLabelAction {
    // Output port number (0-indexed)
    pub output: usize,
    // New label for the output
    pub label: String,
}

fn clear_by_default() -> bool {
    true
}

// Action data for storing the current routing as a preset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StorePresetAction {
    // Outputs to record; all outputs when omitted
    #[serde(default)]
    pub outputs: Option<Vec<usize>>,
    // Preset name; keeps the current or default name when omitted
    #[serde(default)]
    pub name: Option<String>,
    // Preset to overwrite; a new preset is appended when omitted
    #[serde(default)]
    pub index: Option<i64>,
    // Drop routes stored earlier instead of merging with them
    #[serde(default = "clear_by_default")]
    pub clear_current: bool,
}

// Action data for recalling a stored preset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RecallPresetAction {
    pub index: i64,
}

// Action data for requesting a status dump
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GetStatusAction {
    // Raw queries such as "OUTPUT LABELS:\n\n"; routing and labels when empty
    #[serde(default)]
    pub sections: Vec<String>,
}

// Action data for changing a SmartScope monitor setting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SetMonitorPropertyAction {
    // Monitor number (0 is "MONITOR A")
    pub monitor: usize,
    pub property: MonitorProperty,
    pub value: MonitorValue,
}

// One JSON line read from the action stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Action {
    SetRoute(SetRouteAction),
    SetInputLabel(SetInputLabelAction),
    SetOutputLabel(SetOutputLabelAction),
    StorePreset(StorePresetAction),
    RecallPreset(RecallPresetAction),
    GetStatus(GetStatusAction),
    SetMonitorProperty(SetMonitorPropertyAction),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::SetRoute(_) => "set-route",
            Action::SetInputLabel(_) => "set-input-label",
            Action::SetOutputLabel(_) => "set-output-label",
            Action::StorePreset(_) => "store-preset",
            Action::RecallPreset(_) => "recall-preset",
            Action::GetStatus(_) => "get-status",
            Action::SetMonitorProperty(_) => "set-monitor-property",
        }
    }
}
