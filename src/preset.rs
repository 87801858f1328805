use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{BackendError, Result};

// Serializable form of a preset, used to hydrate a backend at startup and to
// hand presets to whatever persists them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PresetDescriptor {
    // Defaults to "Preset N"
    #[serde(default)]
    pub name: Option<String>,
    // Position in the backend's preset list; the next free slot if omitted
    #[serde(default)]
    pub index: Option<i64>,
    // Output -> input
    #[serde(default)]
    pub crosspoints: BTreeMap<usize, usize>,
}

// Validate an externally supplied preset index
pub fn preset_index(raw: i64) -> Result<usize> {
    usize::try_from(raw).map_err(|_| BackendError::InvalidPresetIndex(raw))
}

/// A named snapshot of some or all crosspoints of a Videohub.
///
/// `active` tracks whether every stored route is currently live on the
/// device; an empty preset is never active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preset {
    name: String,
    index: usize,
    crosspoints: BTreeMap<usize, usize>,
    active: bool,
}

impl Preset {
    pub fn new(index: usize, name: Option<String>) -> Self {
        Self {
            name: name.unwrap_or_else(|| default_name(index)),
            index,
            crosspoints: BTreeMap::new(),
            active: false,
        }
    }

    pub(crate) fn from_descriptor(index: usize, descriptor: PresetDescriptor) -> Self {
        Self {
            crosspoints: descriptor.crosspoints,
            ..Self::new(index, descriptor.name)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn crosspoints(&self) -> &BTreeMap<usize, usize> {
        &self.crosspoints
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.crosspoints.is_empty()
    }

    pub fn descriptor(&self) -> PresetDescriptor {
        PresetDescriptor {
            name: Some(self.name.clone()),
            index: i64::try_from(self.index).ok(),
            crosspoints: self.crosspoints.clone(),
        }
    }

    // (output, input) pairs to send when recalling
    pub fn routes(&self) -> Vec<(usize, usize)> {
        self.crosspoints.iter().map(|(o, i)| (*o, *i)).collect()
    }

    pub(crate) fn rename(&mut self, name: String) {
        self.name = name;
    }

    /// Record `outputs` from the live routing in `source`.
    ///
    /// Callers validate `outputs` against `source` beforehand.
    pub(crate) fn store(&mut self, source: &[usize], outputs: &[usize], clear_current: bool) {
        if clear_current {
            self.crosspoints.clear();
        }
        for &output in outputs {
            if let Some(&input) = source.get(output) {
                self.crosspoints.insert(output, input);
            }
        }
        self.active = !self.crosspoints.is_empty();
    }

    // Recompute `active` against live routing, returning whether it flipped
    pub(crate) fn check_active(&mut self, live: &[usize]) -> bool {
        let active = !self.crosspoints.is_empty()
            && self
                .crosspoints
                .iter()
                .all(|(output, input)| live.get(*output) == Some(input));
        let changed = active != self.active;
        self.active = active;
        changed
    }
}

fn default_name(index: usize) -> String {
    format!("Preset {}", index + 1)
}
