//! Protocol handlers: named plugins that sequence an
//! interface's SETUP/TEARDOWN and supply addresses/routes/DNS once a
//! link comes up. One built-in implementation (`shell`) drives an
//! external script; a second, trivial `static` handler is supplied so
//! tests don't need to fork a shell.

pub mod shell;
pub mod static_proto;

use std::collections::HashMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// A command the interface state machine issues to a protocol handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoCommand {
    /// Start bringing the link up.
    Setup,
    /// Start tearing the link down. `force` skips the graceful phase.
    Teardown {
        /// Skip graceful shutdown and flush immediately.
        force: bool,
    },
}

/// An event a protocol handler reports back to the interface that owns
/// it, asynchronously, after `handle` already returned.
#[derive(Debug, Clone)]
pub enum ProtoEvent {
    /// The link is up; `ip` carries the addresses/routes/DNS to push
    /// into proto-IP.
    Up(Box<LinkUpdate>),
    /// Tear-down completed.
    Down,
    /// The link was lost without a teardown request.
    LinkLost,
}

/// The payload of a notify `action = 0` ("update link") message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkUpdate {
    /// Whether the protocol considers the link up. `false` here is
    /// handled before constructing a [`ProtoEvent::Up`] — it produces
    /// [`ProtoEvent::LinkLost`] instead.
    #[serde(default)]
    pub link_up: bool,
    /// Switches the interface's L3 device, if set.
    #[serde(default)]
    pub ifname: Option<String>,
    /// Addresses/routes below are managed by an entity outside the
    /// daemon; they're recorded with the EXTERNAL flag and never
    /// uninstalled by reconciliation.
    #[serde(default)]
    pub address_external: bool,
    /// IPv4 addresses as `(address, mask)`.
    #[serde(default)]
    pub ipaddr: Vec<(IpAddr, u8)>,
    /// IPv6 addresses as `(address, mask)`.
    #[serde(default)]
    pub ip6addr: Vec<(IpAddr, u8)>,
    /// IPv4 routes as `(destination, mask, nexthop)`.
    #[serde(default)]
    pub routes: Vec<(IpAddr, u8, Option<IpAddr>)>,
    /// IPv6 routes as `(destination, mask, nexthop)`.
    #[serde(default)]
    pub routes6: Vec<(IpAddr, u8, Option<IpAddr>)>,
    /// DNS servers.
    #[serde(default)]
    pub dns: Vec<IpAddr>,
    /// DNS search domains.
    #[serde(default)]
    pub dns_search: Vec<String>,
}

/// The full notify message a protocol handler receives:
/// `action` selects "update link" (0), "run helper command" (1), or
/// "signal helper command" (2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Notify {
    /// Action 0: push a link/address/route update.
    #[serde(rename = "0")]
    UpdateLink(LinkUpdate),
    /// Action 1: run a helper command (opaque to the core). A shell
    /// protocol tracks it as the long-lived proto task when `keep` is
    /// set, deferring the eventual teardown DOWN event to its exit
    /// rather than the teardown script's.
    #[serde(rename = "1")]
    RunCommand {
        /// The command line to run, protocol-defined.
        command: Vec<String>,
        /// Keep this process tracked as the protocol's long-lived task
        /// instead of firing and forgetting it.
        #[serde(default)]
        keep: bool,
    },
    /// Action 2: signal an already-running helper command.
    #[serde(rename = "2")]
    SignalCommand {
        /// The POSIX signal number to send.
        signal: i32,
    },
}

/// The sending half of the channel a protocol handler uses to report
/// [`ProtoEvent`]s back, tagged with the interface name since one
/// channel can be shared across an interface's lifetime.
pub type ProtoEventSender = mpsc::UnboundedSender<(String, ProtoEvent)>;

/// A running protocol instance bound to one interface.
pub trait ProtocolHandler: Send {
    /// Starts processing `cmd`. Must return immediately; progress is
    /// reported through the [`ProtoEventSender`] supplied at creation.
    fn handle(&mut self, cmd: ProtoCommand);

    /// Delivers a notify message from the external driver.
    fn notify(&mut self, message: Notify);
}

/// A factory for one named protocol. Boxed so the registry can hold handlers with different
/// concrete types and construction requirements.
pub type ProtocolFactory =
    Box<dyn Fn(&str, serde_json::Value, ProtoEventSender) -> Result<Box<dyn ProtocolHandler>> + Send + Sync>;

/// The table of registered protocol handlers, keyed by name.
#[derive(Default)]
pub struct ProtocolHandlerRegistry {
    factories: HashMap<String, ProtocolFactory>,
}

impl ProtocolHandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry preloaded with the built-in `shell` and
    /// `static` handlers.
    pub fn with_builtins(script_dir: std::path::PathBuf) -> Self {
        let mut registry = Self::new();
        registry.register("shell", shell::factory(script_dir));
        registry.register(static_proto::NAME, static_proto::factory());
        registry
    }

    /// Registers `factory` under `name`, replacing any existing
    /// registration.
    pub fn register(&mut self, name: impl Into<String>, factory: ProtocolFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Attaches a new handler instance of protocol `name` to `iface`.
    ///
    /// # Errors
    /// Returns [`Error::UnknownProtocol`] if no handler is registered
    /// under `name`.
    pub fn attach(
        &self,
        name: &str,
        iface: &str,
        config: serde_json::Value,
        events: ProtoEventSender,
    ) -> Result<Box<dyn ProtocolHandler>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownProtocol { name: name.to_string() })?;
        factory(iface, config, events)
    }
}
