//! Result routing for the operator surface
//!
//! The GUI proper is an external collaborator; it sees the system only
//! through the result queue. This router drains that queue, resolves
//! entries back to catalog channels, converts analog readings to
//! engineering units, and keeps the bounded error stack. Everything is
//! reported through tracing; a GUI frontend subscribes to the same
//! queue instead.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use loopsim_model::{ChannelCatalog, DataEntry, ErrorEntry, SignalKind};

use crate::sender::{GuiEvent, LINK_STATUS_PIN};

/// Drains the result queue until every sender is dropped.
pub struct ResultRouter {
    catalog: Arc<ChannelCatalog>,
    error_stack: VecDeque<String>,
    error_stack_max_len: usize,
}

impl ResultRouter {
    pub fn new(catalog: Arc<ChannelCatalog>, error_stack_max_len: u32) -> Self {
        Self {
            catalog,
            error_stack: VecDeque::new(),
            error_stack_max_len: error_stack_max_len as usize,
        }
    }

    /// Consume events until the queue closes.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<GuiEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                GuiEvent::Data(entry) => self.on_data(entry),
                GuiEvent::Error(entry) => self.on_error(entry),
            }
        }
        debug!("result queue closed, router exiting");
    }

    fn on_data(&mut self, entry: DataEntry) {
        if entry.pin == LINK_STATUS_PIN {
            info!("node link is online");
            return;
        }
        let Some(channel) = self.catalog.by_pin(&entry.pin) else {
            debug!("reply for unknown pin {} ignored", entry.pin);
            return;
        };

        match channel.kind {
            SignalKind::Ai => match entry.value.as_number() {
                Some(ma) => info!("{}: {}", channel.name, channel.display_eng(ma)),
                None => warn!("{}: ERR", channel.name),
            },
            SignalKind::Di => {
                let on = entry.value.as_number().unwrap_or(0.0) != 0.0;
                info!("{}: {}", channel.name, if on { "on" } else { "off" });
            },
            SignalKind::Do => {
                // Ack echo: the relay command was executed.
                debug!("{}: command acknowledged", channel.name);
            },
            SignalKind::Ao => {
                if entry.value.is_nak() {
                    warn!("{}: ERR", channel.name);
                } else if let Some(ma) = entry.value.as_number() {
                    info!("{}: {:.1} mA", channel.name, ma);
                }
            },
            SignalKind::In => {},
        }
    }

    fn on_error(&mut self, entry: ErrorEntry) {
        let source = entry.source.to_lowercase();
        let description = entry.description.to_lowercase();

        if source.starts_with('a') && description.contains("loop error") {
            // Description is shaped `Loop error detected:<pin>`.
            let pin = entry
                .description
                .split(':')
                .nth(1)
                .unwrap_or_default()
                .trim();
            match self.catalog.by_pin(pin) {
                Some(ch) => error!(
                    "loop error detected for {} at board slot {}",
                    ch.name, ch.slot
                ),
                None => error!("loop error detected on unmapped pin {pin}"),
            }
        } else if source.contains("ethernet") {
            warn!("node link is offline: {}", entry.description);
        } else {
            error!("[{}] {}", entry.source, entry.description);
        }

        self.push_error(entry.description);
    }

    fn push_error(&mut self, message: String) {
        self.error_stack.push_back(message);
        while self.error_stack.len() > self.error_stack_max_len {
            self.error_stack.pop_front();
        }
        let suffix = if self.error_stack.len() >= self.error_stack_max_len {
            "+"
        } else {
            ""
        };
        debug!("errors ({}{})", self.error_stack.len(), suffix);
    }

    /// Most recent error descriptions, oldest first.
    pub fn recent_errors(&self) -> impl Iterator<Item = &str> {
        self.error_stack.iter().map(String::as_str)
    }
}
