use std::fmt;

use crate::error::Result;
use crate::property::PropertyChange;
use crate::session::{BackendEvent, Session};

// Sentinel line a Videohub sends after its initial status dump
pub const PRELUDE_TERMINATOR: &str = "END PRELUDE";

/// A device flavour of the Blackmagic text protocol.
///
/// The shared framing in [`Link::parse_batch`] handles acknowledgments,
/// section headers and the prelude terminator; implementors only interpret
/// the lines inside their own sections and react to their own property
/// changes.
pub trait Protocol: Send + 'static {
    type Section: Copy + PartialEq + fmt::Debug + Send;

    const NAME: &'static str;
    const DEFAULT_PORT: u16;

    // Section for a header line with its trailing colon removed
    fn section(&self, name: &str) -> Option<Self::Section>;

    fn parse_line(&mut self, session: &mut Session, section: Self::Section, line: &str)
    -> Result<()>;

    // Whether a blank line seen in `section` completes the handshake
    fn blank_ends_prelude(&self, _session: &Session, _section: Option<Self::Section>) -> bool {
        false
    }

    // Runs for every dispatched change before it is published
    fn react(&mut self, _session: &mut Session, _change: &PropertyChange) {}
}

// Everything guarded by a backend's state lock
#[derive(Debug)]
pub(crate) struct Link<P: Protocol> {
    pub(crate) session: Session,
    pub(crate) device: P,
    cursor: Option<P::Section>,
}

impl<P: Protocol> Link<P> {
    pub(crate) fn new(session: Session, device: P) -> Self {
        Self {
            session,
            device,
            cursor: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self) -> Option<P::Section> {
        self.cursor
    }

    pub(crate) fn parse_batch(&mut self, lines: &[String]) {
        for line in lines {
            if !self.session.is_prelude_parsed() && line.contains(PRELUDE_TERMINATOR) {
                self.finish_prelude();
                break;
            }
            if line.is_empty() {
                if !self.session.is_prelude_parsed()
                    && self.device.blank_ends_prelude(&self.session, self.cursor)
                {
                    self.finish_prelude();
                    break;
                }
                self.cursor = None;
                continue;
            }
            if line.starts_with("ACK") || line.starts_with("NAK") {
                self.session.acknowledgment = Some(line.clone());
                continue;
            }
            let name = line.strip_suffix(':').unwrap_or(line);
            if let Some(section) = self.device.section(name) {
                self.cursor = Some(section);
                continue;
            }
            let Some(section) = self.cursor else {
                log::trace!("{}: ignoring line outside a section: {:?}", P::NAME, line);
                continue;
            };
            if let Err(e) = self.device.parse_line(&mut self.session, section, line) {
                log::warn!("{}: skipping line {:?} in {:?}: {}", P::NAME, line, section, e);
            }
            // Later lines may depend on reactions, e.g. lists resized by a count
            self.dispatch();
        }
        self.dispatch();
    }

    fn finish_prelude(&mut self) {
        self.cursor = None;
        self.session.set_prelude_parsed(true);
        log::debug!("{}: prelude parsed", P::NAME);
    }

    // Run reactions for every queued change and publish it
    pub(crate) fn dispatch(&mut self) {
        while let Some(change) = self.session.notifier.next() {
            self.device.react(&mut self.session, &change);
            self.session.publish(BackendEvent::Property(change));
        }
    }

    pub(crate) fn update<R>(&mut self, f: impl FnOnce(&mut P, &mut Session) -> R) -> R {
        let result = f(&mut self.device, &mut self.session);
        self.dispatch();
        result
    }

    // Reset per-connection state at the start of a connection attempt
    pub(crate) fn begin_session(&mut self) {
        self.cursor = None;
        self.session.acknowledgment = None;
        self.session.read_enabled = false;
        self.session.set_prelude_parsed(false);
        self.session.set_connected(true);
        self.dispatch();
    }

    pub(crate) fn end_session(&mut self) {
        self.session.read_enabled = false;
        if let Some(cancel) = self.session.cancel.take() {
            cancel.cancel();
        }
        self.session.set_connected(false);
        self.dispatch();
    }
}
