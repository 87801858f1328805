//! Blackmagic device service - keeps a backend connected, prints its changes as
//! JSON lines and applies JSON actions read from stdin

use anyhow::{Context, Result, bail};
use futures_util::StreamExt;
use std::future::Future;
use std::path::PathBuf;
use tokio::sync::broadcast::{Receiver, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::actions::{
    Action, GetStatusAction, RecallPresetAction, SetInputLabelAction, SetMonitorPropertyAction,
    SetOutputLabelAction, SetRouteAction, StorePresetAction,
};
use crate::config::{self, DeviceKind, ServiceConfig};
use crate::connection::Backend;
use crate::emitters::EmissionTracker;
use crate::preset::preset_index;
use crate::property::Value;
use crate::protocol::Protocol;
use crate::session::{BackendEvent, CONNECTED};
use crate::smartscope::SmartScope;
use crate::vidhub::{ControlWrite, Vidhub};

// A backend that knows how to carry out service actions
pub trait ActionTarget {
    fn apply(&self, action: Action) -> impl Future<Output = Result<()>>;
}

// Wait for the commands spawned by a control write and report rejections
async fn await_commands(handles: Vec<JoinHandle<bool>>, what: &str) -> Result<()> {
    if handles.is_empty() {
        log::debug!("{}: nothing to send", what);
    }
    for handle in handles {
        if !handle.await.context("Command task failed")? {
            log::warn!("{}: device did not accept the change", what);
        }
    }
    Ok(())
}

impl ActionTarget for Backend<Vidhub> {
    async fn apply(&self, action: Action) -> Result<()> {
        match action {
            Action::SetRoute(SetRouteAction { output, input }) => {
                let handles = self.write_control(ControlWrite::Crosspoint { output, input })?;
                await_commands(handles, "set-route").await
            }
            Action::SetInputLabel(SetInputLabelAction { input, label }) => {
                let handles = self.write_control(ControlWrite::InputLabel { input, label })?;
                await_commands(handles, "set-input-label").await
            }
            Action::SetOutputLabel(SetOutputLabelAction { output, label }) => {
                let handles = self.write_control(ControlWrite::OutputLabel { output, label })?;
                await_commands(handles, "set-output-label").await
            }
            Action::StorePreset(StorePresetAction {
                outputs,
                name,
                index,
                clear_current,
            }) => {
                let index = index.map(preset_index).transpose()?;
                let preset = self.store_preset(outputs.as_deref(), name, index, clear_current)?;
                log::info!("Stored preset {} at index {}", preset.name(), preset.index());
                Ok(())
            }
            Action::RecallPreset(RecallPresetAction { index }) => {
                let index = preset_index(index)?;
                match self.recall_preset(index).await? {
                    None => log::warn!("Preset {} has no routes to recall", index),
                    Some(false) => log::warn!("Device did not accept preset {}", index),
                    Some(true) => log::info!("Recalled preset {}", index),
                }
                Ok(())
            }
            Action::GetStatus(GetStatusAction { sections }) => {
                self.get_status(&sections).await;
                Ok(())
            }
            Action::SetMonitorProperty(_) => {
                bail!("set-monitor-property is only supported by SmartScope devices")
            }
        }
    }
}

impl ActionTarget for Backend<SmartScope> {
    async fn apply(&self, action: Action) -> Result<()> {
        match action {
            Action::SetMonitorProperty(SetMonitorPropertyAction {
                monitor,
                property,
                value,
            }) => {
                if !self.set_monitor_property(monitor, property, value).await? {
                    log::warn!("Device did not accept the change to monitor {}", monitor);
                }
                Ok(())
            }
            Action::GetStatus(GetStatusAction { sections }) => {
                let queries = if sections.is_empty() {
                    vec!["SMARTVIEW DEVICE:\n\n".to_string()]
                } else {
                    sections
                };
                self.send_queries(queries).await;
                Ok(())
            }
            other => bail!("{} is only supported by Videohub devices", other.name()),
        }
    }
}

// Main service for one Videohub or SmartScope
pub struct DeviceService {
    config: ServiceConfig,
}

impl DeviceService {
    pub fn new(config: ServiceConfig) -> Self {
        Self { config }
    }

    pub async fn start(&self) -> Result<()> {
        log::info!("Starting service for {:?} at {}", self.config.device, self.config.host);
        match self.config.device {
            DeviceKind::Videohub => {
                let presets = self.config.load_presets()?;
                log::info!("Loaded {} preset(s)", presets.len());
                let backend = Backend::new(self.config.backend(), Vidhub::with_presets(presets)?);
                let cancel = CancellationToken::new();
                let persist = self
                    .config
                    .presets
                    .clone()
                    .map(|path| tokio::spawn(persist_presets(backend.clone(), path, cancel.clone())));
                let result = self.run(backend, cancel).await;
                if let Some(persist) = persist {
                    persist.await.context("Preset task failed")?;
                }
                result
            }
            DeviceKind::Smartscope => {
                let backend = Backend::new(self.config.backend(), SmartScope::new());
                self.run(backend, CancellationToken::new()).await
            }
        }
    }

    async fn run<P: Protocol>(&self, backend: Backend<P>, cancel: CancellationToken) -> Result<()>
    where
        Backend<P>: ActionTarget,
    {
        // Subscribe before anything connects so no change is missed
        let events = backend.subscribe();
        let emitter = tokio::spawn(emit_events(events, cancel.clone()));
        let supervisor = tokio::spawn(supervise(
            backend.clone(),
            self.config.reconnect_delay(),
            cancel.clone(),
        ));

        let actions = async {
            read_actions(&backend).await;
            log::info!("Action input closed, running until interrupted");
            std::future::pending::<()>().await
        };

        let interrupted = tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for interrupt"),
            _ = actions => Ok(()),
        };
        log::info!("Shutting down");

        cancel.cancel();
        backend.disconnect().await;
        supervisor.await.context("Supervisor task failed")?;
        emitter.await.context("Emission task failed")?;
        interrupted
    }
}

// Keep the backend connected, retrying after `delay` whenever it drops
async fn supervise<P: Protocol>(backend: Backend<P>, delay: Duration, cancel: CancellationToken) {
    loop {
        let mut events = backend.subscribe();
        if !backend.is_connected() {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = backend.connect() => result,
            };
            if let Err(e) = result {
                log::error!("Failed to connect to {}: {}", backend.address(), e);
            }
        }
        if backend.is_connected() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = wait_for_disconnect(&backend, &mut events) => {}
            }
            log::warn!("Connection to {} lost", backend.address());
        }
        log::info!("Reconnecting to {} in {}s", backend.address(), delay.as_secs());
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn wait_for_disconnect<P: Protocol>(backend: &Backend<P>, events: &mut Receiver<BackendEvent>) {
    loop {
        match events.recv().await {
            Ok(BackendEvent::Property(change))
                if change.name == CONNECTED && change.value == Value::Flag(false) =>
            {
                return;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("Missed {} events while watching the connection", skipped);
                if !backend.is_connected() {
                    return;
                }
            }
            Err(RecvError::Closed) => return,
        }
    }
}

// Print every change as a JSON line on stdout
async fn emit_events(mut events: Receiver<BackendEvent>, cancel: CancellationToken) {
    log::info!("Event emission task started");
    let mut tracker = EmissionTracker::new();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => {
                for emission in tracker.track(&event) {
                    match serde_json::to_string(&emission) {
                        Ok(line) => println!("{}", line),
                        Err(e) => log::error!("Failed to encode emission: {}", e),
                    }
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("Emission task fell behind, {} events dropped", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
    log::debug!("Event emission task stopped");
}

// Apply JSON actions read line by line from stdin
async fn read_actions<T: ActionTarget>(target: &T) {
    let mut lines = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::error!("Failed to read action: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let action: Action = match serde_json::from_str(&line) {
            Ok(action) => action,
            Err(e) => {
                log::error!("Invalid action {:?}: {}", line, e);
                continue;
            }
        };
        log::debug!("Applying action: {:?}", action);
        let name = action.name();
        if let Err(e) = target.apply(action).await {
            log::error!("Failed to apply {}: {:#}", name, e);
        }
    }
}

// Write presets back to their file whenever one is added or stored
async fn persist_presets(backend: Backend<Vidhub>, path: PathBuf, cancel: CancellationToken) {
    let mut events = backend.subscribe();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(BackendEvent::PresetAdded(_) | BackendEvent::PresetStored(_)) => {
                if let Err(e) = config::save_presets(&path, &backend.preset_descriptors()).await {
                    log::error!("{:#}", e);
                }
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}
