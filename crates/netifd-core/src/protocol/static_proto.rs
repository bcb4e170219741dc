//! The `static` protocol handler: no external process, reports UP
//! immediately on SETUP using whatever addresses the interface's
//! config-IP already holds. Useful for interfaces with a fixed address
//! that don't need a setup/teardown script at all.

use super::{LinkUpdate, Notify, ProtoCommand, ProtoEvent, ProtoEventSender, ProtocolFactory, ProtocolHandler};
use crate::error::Result;

/// The registration name for this handler.
pub const NAME: &str = "static";

struct StaticProtocol {
    iface: String,
    events: ProtoEventSender,
}

impl ProtocolHandler for StaticProtocol {
    fn handle(&mut self, cmd: ProtoCommand) {
        match cmd {
            ProtoCommand::Setup => {
                let _ = self.events.send((
                    self.iface.clone(),
                    ProtoEvent::Up(Box::new(LinkUpdate { link_up: true, ..Default::default() })),
                ));
            }
            ProtoCommand::Teardown { .. } => {
                let _ = self.events.send((self.iface.clone(), ProtoEvent::Down));
            }
        }
    }

    fn notify(&mut self, _message: Notify) {
        // The static protocol has no external driver to receive notify
        // messages from; nothing to do.
    }
}

/// Builds the factory the [`super::ProtocolHandlerRegistry`] registers
/// this handler under.
pub fn factory() -> ProtocolFactory {
    Box::new(|iface, _config, events| -> Result<Box<dyn ProtocolHandler>> {
        Ok(Box::new(StaticProtocol { iface: iface.to_string(), events }))
    })
}
