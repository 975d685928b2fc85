//! Outbound event hooks for the embedding debugger.

/// Receives out-of-band session events: logpoint output, warnings, and
/// the signal that cached views of remote state (call stack, memory
/// panes) are stale after a snapshot or state load.
///
/// The default methods route everything to the `log` facade, so embedders
/// only override what they present themselves.
pub trait EventSink: Send {
    fn warning(&mut self, message: &str) {
        log::warn!("{}", message);
    }

    fn logpoint(&mut self, text: &str) {
        log::info!("{}", text);
    }

    fn state_invalidated(&mut self) {
        log::debug!("remote state invalidated");
    }
}

/// Default sink: everything goes to `log`.
pub struct LogEventSink;

impl EventSink for LogEventSink {}

/// Maps addresses to source labels for watchpoint messages.
pub trait LabelResolver: Send {
    fn labels_for(&self, addr: u16) -> Vec<String>;
}

/// Resolver with no label information.
pub struct NoLabels;

impl LabelResolver for NoLabels {
    fn labels_for(&self, _addr: u16) -> Vec<String> {
        Vec::new()
    }
}
