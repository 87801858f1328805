//! Videohub routing switchers.
//!
//! Routing and labels are kept in two sets of lists: the confirmed state
//! (`crosspoints`, `output_labels`, `input_labels`) as last reported by the
//! device, and the control lists (`*_control`) that callers write to. Every
//! change of a state list is bulk-copied into its control list; only
//! granular writes to a control list produce a device command.

use tokio::task::JoinHandle;

use crate::connection::Backend;
use crate::error::{BackendError, Result};
use crate::preset::{Preset, PresetDescriptor, preset_index};
use crate::property::{ChangeKind, ListProperty, Property, PropertyChange};
use crate::protocol::Protocol;
use crate::session::{BackendEvent, PRELUDE_PARSED, Session, Transaction};

pub const DEFAULT_PORT: u16 = 9990;

pub const NUM_OUTPUTS: &str = "num_outputs";
pub const NUM_INPUTS: &str = "num_inputs";
pub const CROSSPOINTS: &str = "crosspoints";
pub const OUTPUT_LABELS: &str = "output_labels";
pub const INPUT_LABELS: &str = "input_labels";
pub const CROSSPOINT_CONTROL: &str = "crosspoint_control";
pub const OUTPUT_LABEL_CONTROL: &str = "output_label_control";
pub const INPUT_LABEL_CONTROL: &str = "input_label_control";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VidhubSection {
    ProtocolPreamble,
    Device,
    InputLabels,
    OutputLabels,
    OutputLocks,
    OutputRouting,
    Configuration,
}

impl VidhubSection {
    const ALL: [VidhubSection; 7] = [
        VidhubSection::ProtocolPreamble,
        VidhubSection::Device,
        VidhubSection::InputLabels,
        VidhubSection::OutputLabels,
        VidhubSection::OutputLocks,
        VidhubSection::OutputRouting,
        VidhubSection::Configuration,
    ];

    pub fn header(self) -> &'static str {
        match self {
            VidhubSection::ProtocolPreamble => "PROTOCOL PREAMBLE",
            VidhubSection::Device => "VIDEOHUB DEVICE",
            VidhubSection::InputLabels => "INPUT LABELS",
            VidhubSection::OutputLabels => "OUTPUT LABELS",
            VidhubSection::OutputLocks => "VIDEO OUTPUT LOCKS",
            VidhubSection::OutputRouting => "VIDEO OUTPUT ROUTING",
            VidhubSection::Configuration => "CONFIGURATION",
        }
    }

    pub fn from_header(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|section| section.header() == name)
    }

    // Status request for this section: its header and a blank line
    pub fn query(self) -> String {
        format!("{}:\n\n", self.header())
    }
}

// Granular write to a control list; sent to the device once ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlWrite {
    Crosspoint { output: usize, input: usize },
    OutputLabel { output: usize, label: String },
    InputLabel { input: usize, label: String },
}

// Whole-list replacement of a control list; never sent to the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlValues {
    Crosspoints(Vec<usize>),
    OutputLabels(Vec<String>),
    InputLabels(Vec<String>),
}

#[derive(Debug)]
pub struct Vidhub {
    num_outputs: Property<usize>,
    num_inputs: Property<usize>,
    crosspoints: ListProperty<usize>,
    output_labels: ListProperty<String>,
    input_labels: ListProperty<String>,
    crosspoint_control: ListProperty<usize>,
    output_label_control: ListProperty<String>,
    input_label_control: ListProperty<String>,
    presets: Vec<Preset>,
}

impl Default for Vidhub {
    fn default() -> Self {
        Self::new()
    }
}

fn field_value(line: &str) -> Result<&str> {
    line.split_once(':')
        .map(|(_, value)| value.trim())
        .ok_or_else(|| BackendError::violation("expected a \"key: value\" line"))
}

fn parse_number(text: &str) -> Result<usize> {
    text.trim()
        .parse()
        .map_err(|_| BackendError::violation(format!("expected a number, got {:?}", text)))
}

// "<index> <rest>"
fn split_indexed(line: &str) -> Result<(usize, &str)> {
    let (index, rest) = line.split_once(' ').unwrap_or((line, ""));
    Ok((parse_number(index)?, rest))
}

fn clean_label(label: &str) -> String {
    label.replace(['\r', '\n'], " ")
}

pub(crate) fn routing_command(pairs: impl IntoIterator<Item = (usize, usize)>) -> Transaction {
    Transaction::section(
        VidhubSection::OutputRouting.header(),
        pairs
            .into_iter()
            .map(|(output, input)| format!("{} {}", output, input)),
    )
    .holding(CROSSPOINTS)
}

pub(crate) fn label_command(
    section: VidhubSection,
    pairs: impl IntoIterator<Item = (usize, String)>,
) -> Transaction {
    let hold = match section {
        VidhubSection::InputLabels => INPUT_LABELS,
        _ => OUTPUT_LABELS,
    };
    Transaction::section(
        section.header(),
        pairs
            .into_iter()
            .map(|(index, label)| format!("{} {}", index, clean_label(&label))),
    )
    .holding(hold)
}

impl Vidhub {
    pub fn new() -> Self {
        Self {
            num_outputs: Property::new(NUM_OUTPUTS, 0),
            num_inputs: Property::new(NUM_INPUTS, 0),
            crosspoints: ListProperty::new(CROSSPOINTS),
            output_labels: ListProperty::new(OUTPUT_LABELS),
            input_labels: ListProperty::new(INPUT_LABELS),
            crosspoint_control: ListProperty::new(CROSSPOINT_CONTROL),
            output_label_control: ListProperty::new(OUTPUT_LABEL_CONTROL),
            input_label_control: ListProperty::new(INPUT_LABEL_CONTROL),
            presets: Vec::new(),
        }
    }

    /// Start with presets restored from their descriptors.
    ///
    /// Each descriptor lands at its own index, or the next free one when it
    /// has none; gaps are filled with empty presets.
    pub fn with_presets(descriptors: impl IntoIterator<Item = PresetDescriptor>) -> Result<Self> {
        let mut hub = Self::new();
        for descriptor in descriptors {
            let index = match descriptor.index {
                Some(raw) => preset_index(raw)?,
                None => hub.presets.len(),
            };
            while hub.presets.len() <= index {
                let next = hub.presets.len();
                hub.presets.push(Preset::new(next, None));
            }
            hub.presets[index] = Preset::from_descriptor(index, descriptor);
        }
        Ok(hub)
    }

    pub fn num_outputs(&self) -> usize {
        *self.num_outputs.get()
    }

    pub fn num_inputs(&self) -> usize {
        *self.num_inputs.get()
    }

    pub fn crosspoints(&self) -> &[usize] {
        self.crosspoints.as_slice()
    }

    pub fn output_labels(&self) -> &[String] {
        self.output_labels.as_slice()
    }

    pub fn input_labels(&self) -> &[String] {
        self.input_labels.as_slice()
    }

    pub fn crosspoint_control(&self) -> &[usize] {
        self.crosspoint_control.as_slice()
    }

    pub fn output_label_control(&self) -> &[String] {
        self.output_label_control.as_slice()
    }

    pub fn input_label_control(&self) -> &[String] {
        self.input_label_control.as_slice()
    }

    pub fn presets(&self) -> &[Preset] {
        &self.presets
    }

    pub(crate) fn write_control(&mut self, session: &mut Session, write: ControlWrite) -> Result<()> {
        let notifier = &mut session.notifier;
        match write {
            ControlWrite::Crosspoint { output, input } => {
                self.crosspoint_control.set_index(output, input, notifier)?
            }
            ControlWrite::OutputLabel { output, label } => {
                self.output_label_control.set_index(output, label, notifier)?
            }
            ControlWrite::InputLabel { input, label } => {
                self.input_label_control.set_index(input, label, notifier)?
            }
        };
        Ok(())
    }

    pub(crate) fn replace_control(&mut self, session: &mut Session, values: ControlValues) {
        let notifier = &mut session.notifier;
        match values {
            ControlValues::Crosspoints(values) => self.crosspoint_control.replace_all(values, notifier),
            ControlValues::OutputLabels(values) => {
                self.output_label_control.replace_all(values, notifier)
            }
            ControlValues::InputLabels(values) => self.input_label_control.replace_all(values, notifier),
        };
    }

    // A granular control write becomes one batched command for the touched indices
    fn control_changed(&mut self, session: &mut Session, change: &PropertyChange) {
        let ChangeKind::Granular(indices) = &change.kind else {
            return;
        };
        if !session.is_ready() {
            log::debug!("Ignoring {} write before the device is ready", change.name);
            return;
        }
        let transaction = match change.name {
            CROSSPOINT_CONTROL => routing_command(
                indices
                    .iter()
                    .filter_map(|&i| self.crosspoint_control.get(i).map(|input| (i, *input))),
            ),
            OUTPUT_LABEL_CONTROL => label_command(
                VidhubSection::OutputLabels,
                indices
                    .iter()
                    .filter_map(|&i| self.output_label_control.get(i).map(|label| (i, label.clone()))),
            ),
            INPUT_LABEL_CONTROL => label_command(
                VidhubSection::InputLabels,
                indices
                    .iter()
                    .filter_map(|&i| self.input_label_control.get(i).map(|label| (i, label.clone()))),
            ),
            _ => return,
        };
        session.queue(transaction);
    }

    pub(crate) fn add_preset(&mut self, session: &Session, name: Option<String>) -> Preset {
        let preset = Preset::new(self.presets.len(), name);
        self.presets.push(preset.clone());
        session.publish(BackendEvent::PresetAdded(session.preset_event(&preset)));
        preset
    }

    pub(crate) fn store_preset(
        &mut self,
        session: &Session,
        outputs: Option<&[usize]>,
        name: Option<String>,
        index: Option<usize>,
        clear_current: bool,
    ) -> Result<Preset> {
        let outputs: Vec<usize> = match outputs {
            Some(outputs) => outputs.to_vec(),
            None => (0..self.num_outputs()).collect(),
        };
        let len = self.crosspoints.len();
        if let Some(&output) = outputs.iter().find(|&&output| output >= len) {
            return Err(BackendError::IndexOutOfRange {
                property: CROSSPOINTS,
                index: output,
                len,
            });
        }

        let index = index.unwrap_or(self.presets.len());
        while self.presets.len() <= index {
            self.add_preset(session, None);
        }
        let preset = &mut self.presets[index];
        if let Some(name) = name {
            preset.rename(name);
        }
        let was_active = preset.is_active();
        preset.store(self.crosspoints.as_slice(), &outputs, clear_current);
        log::info!("Stored preset {} ({} routes)", preset.name(), preset.crosspoints().len());

        session.publish(BackendEvent::PresetStored(session.preset_event(preset)));
        if preset.is_active() != was_active {
            session.publish(BackendEvent::PresetActive(session.preset_event(preset)));
        }
        Ok(preset.clone())
    }

    fn check_presets(&mut self, session: &Session) {
        for preset in &mut self.presets {
            if preset.check_active(self.crosspoints.as_slice()) {
                log::debug!("Preset {} active: {}", preset.name(), preset.is_active());
                session.publish(BackendEvent::PresetActive(session.preset_event(preset)));
            }
        }
    }
}

impl Protocol for Vidhub {
    type Section = VidhubSection;

    const NAME: &'static str = "Videohub";
    const DEFAULT_PORT: u16 = DEFAULT_PORT;

    fn section(&self, name: &str) -> Option<VidhubSection> {
        VidhubSection::from_header(name)
    }

    fn parse_line(&mut self, session: &mut Session, section: VidhubSection, line: &str) -> Result<()> {
        match section {
            VidhubSection::ProtocolPreamble => {
                if line.starts_with("Version:") {
                    session.set_device_version(field_value(line)?.to_string());
                }
            }
            VidhubSection::Device => {
                if line.starts_with("Model name:") {
                    session.set_device_model(field_value(line)?.to_string());
                } else if line.starts_with("Unique ID:") {
                    session.set_device_id(field_value(line)?.to_uppercase());
                } else if line.starts_with("Video outputs:") {
                    let count = parse_number(field_value(line)?)?;
                    self.num_outputs.set(count, &mut session.notifier);
                } else if line.starts_with("Video inputs:") {
                    let count = parse_number(field_value(line)?)?;
                    self.num_inputs.set(count, &mut session.notifier);
                }
            }
            VidhubSection::OutputLabels => {
                let (index, label) = split_indexed(line)?;
                self.output_labels
                    .set_index(index, label.to_string(), &mut session.notifier)?;
            }
            VidhubSection::InputLabels => {
                let (index, label) = split_indexed(line)?;
                self.input_labels
                    .set_index(index, label.to_string(), &mut session.notifier)?;
            }
            VidhubSection::OutputRouting => {
                let (output, rest) = split_indexed(line)?;
                let input = parse_number(rest)?;
                self.crosspoints.set_index(output, input, &mut session.notifier)?;
            }
            VidhubSection::OutputLocks | VidhubSection::Configuration => {}
        }
        Ok(())
    }

    fn react(&mut self, session: &mut Session, change: &PropertyChange) {
        match change.name {
            NUM_OUTPUTS => {
                let outputs = self.num_outputs();
                self.crosspoints.resize_default(outputs, &mut session.notifier);
                self.output_labels.resize_default(outputs, &mut session.notifier);
            }
            NUM_INPUTS => {
                let inputs = self.num_inputs();
                self.input_labels.resize_default(inputs, &mut session.notifier);
                let outputs = self.num_outputs();
                self.crosspoints.resize_default(outputs, &mut session.notifier);
            }
            CROSSPOINTS => {
                self.crosspoint_control
                    .replace_all(self.crosspoints.to_vec(), &mut session.notifier);
                if session.is_prelude_parsed() {
                    self.check_presets(session);
                }
            }
            OUTPUT_LABELS => {
                self.output_label_control
                    .replace_all(self.output_labels.to_vec(), &mut session.notifier);
            }
            INPUT_LABELS => {
                self.input_label_control
                    .replace_all(self.input_labels.to_vec(), &mut session.notifier);
            }
            CROSSPOINT_CONTROL | OUTPUT_LABEL_CONTROL | INPUT_LABEL_CONTROL => {
                self.control_changed(session, change);
            }
            PRELUDE_PARSED if session.is_prelude_parsed() => self.check_presets(session),
            _ => {}
        }
    }
}

pub type VidhubBackend = Backend<Vidhub>;

impl Backend<Vidhub> {
    pub fn num_outputs(&self) -> usize {
        self.read(|hub, _| hub.num_outputs())
    }

    pub fn num_inputs(&self) -> usize {
        self.read(|hub, _| hub.num_inputs())
    }

    pub fn crosspoints(&self) -> Vec<usize> {
        self.read(|hub, _| hub.crosspoints().to_vec())
    }

    pub fn output_labels(&self) -> Vec<String> {
        self.read(|hub, _| hub.output_labels().to_vec())
    }

    pub fn input_labels(&self) -> Vec<String> {
        self.read(|hub, _| hub.input_labels().to_vec())
    }

    pub fn crosspoint_control(&self) -> Vec<usize> {
        self.read(|hub, _| hub.crosspoint_control().to_vec())
    }

    pub fn output_label_control(&self) -> Vec<String> {
        self.read(|hub, _| hub.output_label_control().to_vec())
    }

    pub fn input_label_control(&self) -> Vec<String> {
        self.read(|hub, _| hub.input_label_control().to_vec())
    }

    pub fn presets(&self) -> Vec<Preset> {
        self.read(|hub, _| hub.presets().to_vec())
    }

    pub fn preset(&self, index: usize) -> Option<Preset> {
        self.read(|hub, _| hub.presets().get(index).cloned())
    }

    pub fn preset_descriptors(&self) -> Vec<PresetDescriptor> {
        self.read(|hub, _| hub.presets().iter().map(Preset::descriptor).collect())
    }

    // Set several crosspoints in one command. Pairs may be unordered.
    pub async fn set_crosspoints(&self, pairs: &[(usize, usize)]) -> bool {
        if pairs.is_empty() {
            return true;
        }
        log::info!("Setting {} route(s) on {}", pairs.len(), self.address());
        self.transact(routing_command(pairs.iter().copied())).await
    }

    pub async fn set_crosspoint(&self, output: usize, input: usize) -> bool {
        self.set_crosspoints(&[(output, input)]).await
    }

    pub async fn set_output_labels(&self, pairs: &[(usize, String)]) -> bool {
        if pairs.is_empty() {
            return true;
        }
        self.transact(label_command(VidhubSection::OutputLabels, pairs.iter().cloned()))
            .await
    }

    pub async fn set_output_label(&self, output: usize, label: impl Into<String>) -> bool {
        self.set_output_labels(&[(output, label.into())]).await
    }

    pub async fn set_input_labels(&self, pairs: &[(usize, String)]) -> bool {
        if pairs.is_empty() {
            return true;
        }
        self.transact(label_command(VidhubSection::InputLabels, pairs.iter().cloned()))
            .await
    }

    pub async fn set_input_label(&self, input: usize, label: impl Into<String>) -> bool {
        self.set_input_labels(&[(input, label.into())]).await
    }

    /// Ask the device to dump sections.
    ///
    /// `sections` are raw query blocks such as `"OUTPUT LABELS:\n\n"`; when
    /// empty, routing and both label sections are requested.
    pub async fn get_status(&self, sections: &[String]) {
        let queries = if sections.is_empty() {
            [
                VidhubSection::OutputRouting,
                VidhubSection::OutputLabels,
                VidhubSection::InputLabels,
            ]
            .map(VidhubSection::query)
            .to_vec()
        } else {
            sections.to_vec()
        };
        self.send_queries(queries).await;
    }

    /// Write one entry of a control list.
    ///
    /// When the value changed and the device is ready, the write is sent as
    /// a command on a spawned task whose handle resolves to the device's
    /// answer.
    pub fn write_control(&self, write: ControlWrite) -> Result<Vec<JoinHandle<bool>>> {
        self.update(|hub, session| hub.write_control(session, write))?;
        Ok(self.flush_outbox())
    }

    // Replace a whole control list without telling the device
    pub fn replace_control(&self, values: ControlValues) {
        self.update(|hub, session| hub.replace_control(session, values));
    }

    pub fn add_preset(&self, name: Option<String>) -> Preset {
        self.update(|hub, session| hub.add_preset(session, name))
    }

    /// Record the current routing into a preset.
    ///
    /// `outputs` defaults to every output. `index` picks the preset to
    /// overwrite, creating it (and any presets before it) when missing; a new
    /// preset is appended when omitted. With `clear_current` false the new
    /// routes are merged over the stored ones.
    pub fn store_preset(
        &self,
        outputs: Option<&[usize]>,
        name: Option<String>,
        index: Option<usize>,
        clear_current: bool,
    ) -> Result<Preset> {
        self.update(|hub, session| hub.store_preset(session, outputs, name, index, clear_current))
    }

    // Apply a stored preset; `None` when the preset holds no routes
    pub async fn recall_preset(&self, index: usize) -> Result<Option<bool>> {
        let routes = self
            .preset(index)
            .map(|preset| preset.routes())
            .ok_or(BackendError::PresetNotFound(index))?;
        if routes.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.set_crosspoints(&routes).await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::Value;
    use crate::protocol::Link;

    const PRELUDE: &str = include_str!("../tests/fixtures/vidhub-prelude.txt");

    fn lines(text: &str) -> Vec<String> {
        text.split_terminator('\n').map(str::to_string).collect()
    }

    fn link() -> Link<Vidhub> {
        Link::new(Session::new("10.0.0.5:9990"), Vidhub::new())
    }

    fn ready_link() -> Link<Vidhub> {
        let mut link = link();
        link.session.set_connected(true);
        link.parse_batch(&lines(PRELUDE));
        link
    }

    #[test]
    fn prelude_populates_identity_and_state() {
        let link = ready_link();
        let hub = &link.device;
        assert!(link.session.is_prelude_parsed());
        assert_eq!(link.session.device_id(), Some("A0B2C3D4E5F6"));
        assert_eq!(link.session.device_model(), Some("Smart Videohub 12x12"));
        assert_eq!(link.session.device_version(), Some("2.7"));
        assert_eq!(hub.num_outputs(), 12);
        assert_eq!(hub.num_inputs(), 12);
        assert_eq!(hub.crosspoints(), (0..12).collect::<Vec<_>>().as_slice());
        assert_eq!(hub.output_labels()[0], "Output 1");
        assert_eq!(hub.input_labels()[11], "Input 12");
        assert_eq!(hub.crosspoint_control(), hub.crosspoints());
        assert_eq!(hub.output_label_control(), hub.output_labels());
        assert_eq!(hub.input_label_control(), hub.input_labels());
        assert!(link.cursor().is_none());
        assert!(link.session.outbox.is_empty());
    }

    #[test]
    fn output_count_resizes_and_zeroes_lists() {
        let mut link = link();
        let mut events = link.session.subscribe();
        link.parse_batch(&lines("VIDEOHUB DEVICE:\nVideo outputs: 4\nVideo inputs: 6\n\n"));

        let hub = &link.device;
        assert_eq!(hub.crosspoints(), &[0, 0, 0, 0]);
        assert_eq!(hub.output_labels(), vec![String::new(); 4].as_slice());
        assert_eq!(hub.input_labels().len(), 6);
        assert_eq!(hub.crosspoint_control(), &[0, 0, 0, 0]);

        // The first crosspoints notification already has the new length
        let mut saw_outputs = false;
        while let Ok(BackendEvent::Property(change)) = events.try_recv() {
            match change.name {
                NUM_OUTPUTS => saw_outputs = true,
                CROSSPOINTS => {
                    assert!(saw_outputs);
                    assert_eq!(change.value, Value::Routing(vec![0; 4]));
                }
                _ => {}
            }
        }
        assert!(saw_outputs);

        link.parse_batch(&lines("VIDEO OUTPUT ROUTING:\n0 3\n\nVIDEOHUB DEVICE:\nVideo outputs: 2\n\n"));
        assert_eq!(link.device.crosspoints(), &[0, 0]);
        assert_eq!(link.device.output_labels().len(), 2);
    }

    #[test]
    fn acknowledged_routing_echo_updates_state() {
        let mut link = ready_link();
        link.parse_batch(&lines("ACK\n\nVIDEO OUTPUT ROUTING:\n0 3\n1 2\n\n"));
        assert_eq!(link.device.crosspoints()[0], 3);
        assert_eq!(link.device.crosspoints()[1], 2);
        assert_eq!(&link.device.crosspoint_control()[..2], &[3, 2]);
        assert_eq!(link.session.acknowledgment.as_deref(), Some("ACK"));
        assert!(link.session.outbox.is_empty());
    }

    #[test]
    fn granular_control_write_queues_one_command() {
        let mut link = ready_link();
        link.update(|hub, session| {
            hub.write_control(session, ControlWrite::Crosspoint { output: 4, input: 9 })
        })
        .unwrap();

        assert_eq!(link.session.outbox.len(), 1);
        let command = &link.session.outbox[0];
        assert_eq!(command.payload(), "VIDEO OUTPUT ROUTING:\n4 9\n\n");
        assert_eq!(command.hold(), Some(CROSSPOINTS));

        // The confirmed echo only mirrors back into the control list
        link.parse_batch(&lines("ACK\n\nVIDEO OUTPUT ROUTING:\n4 9\n\n"));
        assert_eq!(link.device.crosspoints()[4], 9);
        assert_eq!(link.session.outbox.len(), 1);
    }

    #[test]
    fn bulk_control_replace_sends_nothing() {
        let mut link = ready_link();
        let mut routing = link.device.crosspoints().to_vec();
        routing[0] = 7;
        link.update(|hub, session| hub.replace_control(session, ControlValues::Crosspoints(routing)));
        assert_eq!(link.device.crosspoint_control()[0], 7);
        assert!(link.session.outbox.is_empty());
    }

    #[test]
    fn control_writes_before_handshake_are_not_sent() {
        let mut link = link();
        link.parse_batch(&lines("VIDEOHUB DEVICE:\nVideo outputs: 2\nVideo inputs: 2\n\n"));
        link.update(|hub, session| {
            hub.write_control(session, ControlWrite::Crosspoint { output: 1, input: 1 })
        })
        .unwrap();
        assert!(link.session.outbox.is_empty());
    }

    #[test]
    fn out_of_range_control_write_fails() {
        let mut link = ready_link();
        let err = link
            .update(|hub, session| {
                hub.write_control(
                    session,
                    ControlWrite::OutputLabel {
                        output: 12,
                        label: "Program".into(),
                    },
                )
            })
            .unwrap_err();
        assert!(matches!(err, BackendError::IndexOutOfRange { index: 12, .. }));
        assert!(link.session.outbox.is_empty());
    }

    #[test]
    fn label_commands_keep_spaces_and_drop_line_breaks() {
        let mut link = ready_link();
        link.update(|hub, session| {
            hub.write_control(
                session,
                ControlWrite::InputLabel {
                    input: 2,
                    label: "Cam 3\nwide".into(),
                },
            )
        })
        .unwrap();
        assert_eq!(link.session.outbox[0].payload(), "INPUT LABELS:\n2 Cam 3 wide\n\n");
        assert_eq!(link.session.outbox[0].hold(), Some(INPUT_LABELS));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let mut link = ready_link();
        link.parse_batch(&lines(
            "OUTPUT LABELS:\nx Nope\n99 Too Far\n1 Camera Two\n\nVIDEO OUTPUT ROUTING:\n3\n2 5\n\n",
        ));
        assert_eq!(link.device.output_labels()[1], "Camera Two");
        assert_eq!(link.device.output_labels()[0], "Output 1");
        assert_eq!(link.device.crosspoints()[2], 5);
        assert_eq!(link.device.crosspoints()[3], 3);
    }

    #[test]
    fn unknown_sections_are_ignored() {
        let mut link = ready_link();
        link.parse_batch(&lines("VIDEO INPUT STATUS:\n0 BNC\n1 BNC\n\n"));
        assert_eq!(link.device.crosspoints()[0], 0);
        assert_eq!(link.device.output_labels()[0], "Output 1");
    }

    #[test]
    fn hydrated_presets_become_active_after_prelude() {
        let descriptors = vec![
            PresetDescriptor {
                name: Some("Straight".into()),
                index: Some(0),
                crosspoints: [(0, 0), (1, 1)].into(),
            },
            PresetDescriptor {
                name: None,
                index: Some(2),
                crosspoints: [(0, 5)].into(),
            },
        ];
        let mut link = Link::new(
            Session::new("10.0.0.5:9990"),
            Vidhub::with_presets(descriptors).unwrap(),
        );
        let mut events = link.session.subscribe();
        assert_eq!(link.device.presets().len(), 3);
        assert_eq!(link.device.presets()[1].name(), "Preset 2");
        assert!(!link.device.presets()[0].is_active());

        link.session.set_connected(true);
        link.parse_batch(&lines(PRELUDE));
        assert!(link.device.presets()[0].is_active());
        assert!(!link.device.presets()[1].is_active());
        assert!(!link.device.presets()[2].is_active());

        let activated: Vec<usize> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|event| match event {
                BackendEvent::PresetActive(event) => Some(event.preset.index()),
                _ => None,
            })
            .collect();
        assert_eq!(activated, vec![0]);

        link.parse_batch(&lines("VIDEO OUTPUT ROUTING:\n0 5\n\n"));
        assert!(!link.device.presets()[0].is_active());
        assert!(link.device.presets()[2].is_active());
    }

    #[test]
    fn negative_descriptor_index_is_rejected() {
        let err = Vidhub::with_presets([PresetDescriptor {
            index: Some(-2),
            ..Default::default()
        }])
        .unwrap_err();
        assert!(matches!(err, BackendError::InvalidPresetIndex(-2)));
    }

    #[test]
    fn store_preset_fills_gaps_and_snapshots_routing() {
        let mut link = ready_link();
        let mut events = link.session.subscribe();
        let preset = link
            .update(|hub, session| hub.store_preset(session, Some(&[1, 3]), Some("Pair".into()), Some(2), true))
            .unwrap();

        assert_eq!(preset.index(), 2);
        assert_eq!(preset.name(), "Pair");
        assert_eq!(preset.routes(), vec![(1, 1), (3, 3)]);
        assert!(preset.is_active());
        assert_eq!(link.device.presets().len(), 3);

        let kinds: Vec<&str> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|event| match event {
                BackendEvent::PresetAdded(_) => Some("added"),
                BackendEvent::PresetStored(_) => Some("stored"),
                BackendEvent::PresetActive(_) => Some("active"),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec!["added", "added", "added", "stored", "active"]);
    }

    #[test]
    fn store_preset_merges_when_not_clearing() {
        let mut link = ready_link();
        link.update(|hub, session| hub.store_preset(session, Some(&[0]), None, None, true))
            .unwrap();
        link.parse_batch(&lines("VIDEO OUTPUT ROUTING:\n5 8\n\n"));
        let preset = link
            .update(|hub, session| hub.store_preset(session, Some(&[5]), None, Some(0), false))
            .unwrap();
        assert_eq!(preset.name(), "Preset 1");
        assert_eq!(preset.routes(), vec![(0, 0), (5, 8)]);
    }

    #[test]
    fn store_preset_rejects_unknown_outputs_before_mutating() {
        let mut link = ready_link();
        let err = link
            .update(|hub, session| hub.store_preset(session, Some(&[0, 40]), None, Some(3), true))
            .unwrap_err();
        assert!(matches!(err, BackendError::IndexOutOfRange { index: 40, .. }));
        assert!(link.device.presets().is_empty());
    }

    #[test]
    fn status_queries_are_bare_headers() {
        assert_eq!(VidhubSection::OutputRouting.query(), "VIDEO OUTPUT ROUTING:\n\n");
        assert_eq!(
            VidhubSection::from_header("VIDEO OUTPUT LOCKS"),
            Some(VidhubSection::OutputLocks)
        );
        assert_eq!(VidhubSection::from_header("VIDEO OUTPUT LOCKS:"), None);
    }
}
