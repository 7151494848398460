//! Capability handles for port rights.
//!
//! Each wrapper owns exactly one kernel-style reference of its kind and
//! releases it exactly once on drop. The types are deliberately not `Clone`:
//! a second right only ever comes from an explicit transfer through a
//! message.

use std::mem;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::warn;

use crate::error::{status, LookupError, ReceiveError};
use crate::message::Message;
use crate::ports::{self, PortName, RawMessage};

/// The receive side of a port. Exactly one of these exists per live port;
/// dropping it tears the port down and destroys anything still queued.
pub struct ReceiveRight {
    name: PortName,
    rx: Receiver<RawMessage>,
}

impl ReceiveRight {
    /// Allocates a fresh port and returns its receive right.
    pub fn allocate() -> ReceiveRight {
        let (name, rx) = ports::allocate();
        ReceiveRight { name, rx }
    }

    pub fn name(&self) -> PortName {
        self.name
    }

    /// Publishes this port under a well-known service name so peers can
    /// obtain send rights to it via [`SendRight::lookup`].
    pub fn publish(&self, service: &str) -> Result<(), LookupError> {
        ports::register(service, self.name)
    }

    /// Asks the port layer to enqueue a notification message once no send
    /// or send-once rights to this port remain outstanding.
    pub fn request_no_senders_notification(&self) {
        ports::request_no_senders(self.name);
    }

    pub(crate) fn recv(&self) -> Result<RawMessage, ReceiveError> {
        self.rx
            .recv()
            .map_err(|_| ReceiveError::Transport(status::PORT_DEAD))
    }

    pub(crate) fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<RawMessage>, ReceiveError> {
        match self.rx.recv_timeout(timeout) {
            Ok(raw) => Ok(Some(raw)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(ReceiveError::Transport(status::PORT_DEAD))
            }
        }
    }
}

impl Drop for ReceiveRight {
    fn drop(&mut self) {
        ports::remove_receive(self.name);

        // Destroy whatever is still queued so embedded rights and
        // out-of-line blocks are released rather than leaked.
        while let Ok(raw) = self.rx.try_recv() {
            match Message::from_raw(raw) {
                Ok(message) => drop(message),
                Err(error) => warn!(port = self.name, %error, "dropping undecodable queued message"),
            }
        }
    }
}

/// A reusable send right to some port.
pub struct SendRight {
    name: PortName,
}

impl SendRight {
    /// Resolves a well-known service name to a send right.
    pub fn lookup(service: &str) -> Result<SendRight, LookupError> {
        ports::lookup(service).map(|name| SendRight { name })
    }

    pub(crate) fn from_name(name: PortName) -> SendRight {
        SendRight { name }
    }

    pub fn name(&self) -> PortName {
        self.name
    }
}

impl Drop for SendRight {
    fn drop(&mut self) {
        ports::release_send(self.name);
    }
}

/// A send right consumable by exactly one send. Every consuming operation
/// takes the value, so a second use does not compile.
pub struct SendOnceRight {
    name: PortName,
}

impl SendOnceRight {
    pub(crate) fn from_name(name: PortName) -> SendOnceRight {
        SendOnceRight { name }
    }

    pub fn name(&self) -> PortName {
        self.name
    }

    /// Surrenders ownership of the raw name without releasing the right;
    /// the caller becomes responsible for it.
    pub(crate) fn into_name(self) -> PortName {
        let name = self.name;
        mem::forget(self);
        name
    }
}

impl Drop for SendOnceRight {
    fn drop(&mut self) {
        // An unused send-once right still holds a consumable reference;
        // releasing it may fire the port's no-senders notification.
        ports::release_send_once(self.name);
    }
}
