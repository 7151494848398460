//! Process-wide port substrate.
//!
//! Ports are kernel-style message queues addressed by small integer names.
//! Each port tracks outstanding send and send-once reference counts, an
//! optional no-senders notification request, and an unbounded queue of raw
//! message buffers. A separate registry maps well-known service names to
//! port names, and a block space holds out-of-line payloads transferred by
//! reference.
//!
//! Right-transfer bookkeeping lives entirely in [`deliver`]: copy-send and
//! make-send dispositions mint a new reference on delivery, make-send-once
//! mints a send-once reference, and move dispositions carry the sender's
//! reference with the message. Ownership of embedded blocks and rights
//! passes to this layer on a successful delivery and stays with the caller
//! on a failed one.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::error::{status, LookupError, SendError};
use crate::layout::{
    Disposition, LayoutItem, MessageHeader, MessageLayout, PortDescriptor, BITS_COMPLEX,
    HEADER_SIZE,
};
use crate::protocol;

/// Integer name of a port, unique within the process.
pub type PortName = u32;

/// Identity of the sending process, stamped into the receive trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderIdentity {
    pub pid: u32,
    pub uid: u32,
}

/// A message as it sits in a port queue: the delivered buffer plus the
/// trailer identity captured at send time.
pub(crate) struct RawMessage {
    pub bytes: Vec<u8>,
    pub sender: SenderIdentity,
}

struct PortEntry {
    tx: Sender<RawMessage>,
    send_refs: u32,
    send_once_refs: u32,
    notify_no_senders: bool,
}

#[derive(Default)]
struct PortTable {
    ports: HashMap<PortName, PortEntry>,
    services: HashMap<String, PortName>,
    next_name: PortName,
}

fn table() -> MutexGuard<'static, PortTable> {
    static TABLE: OnceLock<Mutex<PortTable>> = OnceLock::new();
    TABLE
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct BlockSpace {
    blocks: HashMap<u64, Vec<u8>>,
    next_id: u64,
}

fn blocks() -> MutexGuard<'static, BlockSpace> {
    static BLOCKS: OnceLock<Mutex<BlockSpace>> = OnceLock::new();
    BLOCKS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Creates a fresh port and hands back its name and queue receiver.
pub(crate) fn allocate() -> (PortName, Receiver<RawMessage>) {
    let (tx, rx) = unbounded();
    let mut table = table();
    table.next_name += 1;
    let name = table.next_name;
    table.ports.insert(
        name,
        PortEntry {
            tx,
            send_refs: 0,
            send_once_refs: 0,
            notify_no_senders: false,
        },
    );
    (name, rx)
}

/// Tears down a port: drops its table entry and any service registrations.
/// Messages still queued are the caller's to drain and destroy.
pub(crate) fn remove_receive(name: PortName) {
    let mut table = table();
    table.services.retain(|_, port| *port != name);
    if table.ports.remove(&name).is_none() {
        warn!(port = name, "released an unknown receive right");
    }
}

pub(crate) fn release_send(name: PortName) {
    release(name, false);
}

pub(crate) fn release_send_once(name: PortName) {
    release(name, true);
}

fn release(name: PortName, once: bool) {
    let notify = {
        let mut table = table();
        let Some(entry) = table.ports.get_mut(&name) else {
            debug!(port = name, "released a right on a dead port");
            return;
        };

        let refs = if once {
            &mut entry.send_once_refs
        } else {
            &mut entry.send_refs
        };
        if *refs == 0 {
            warn!(port = name, once, "port right over-released");
            return;
        }
        *refs -= 1;

        if entry.send_refs == 0 && entry.send_once_refs == 0 && entry.notify_no_senders {
            entry.notify_no_senders = false;
            Some(entry.tx.clone())
        } else {
            None
        }
    };

    if let Some(tx) = notify {
        let _ = tx.send(no_senders_notification());
    }
}

/// Asks for a one-shot notification message once the port has no
/// outstanding send or send-once rights. Fires immediately when that is
/// already the case.
pub(crate) fn request_no_senders(name: PortName) {
    let notify = {
        let mut table = table();
        let Some(entry) = table.ports.get_mut(&name) else {
            return;
        };
        if entry.send_refs == 0 && entry.send_once_refs == 0 {
            Some(entry.tx.clone())
        } else {
            entry.notify_no_senders = true;
            None
        }
    };

    if let Some(tx) = notify {
        let _ = tx.send(no_senders_notification());
    }
}

fn no_senders_notification() -> RawMessage {
    let mut bytes = vec![0u8; HEADER_SIZE];
    MessageHeader {
        bits: 0,
        size: HEADER_SIZE as u32,
        remote_port: 0,
        local_port: 0,
        reserved: 0,
        id: protocol::NOTIFY_NO_SENDERS,
    }
    .write(&mut bytes);
    RawMessage {
        bytes,
        sender: identity(),
    }
}

/// Publishes `port` under a well-known service name.
pub(crate) fn register(service: &str, port: PortName) -> Result<(), LookupError> {
    let mut table = table();
    if let Some(existing) = table.services.get(service) {
        if table.ports.contains_key(existing) {
            return Err(LookupError::AlreadyRegistered(service.to_string()));
        }
    }
    table.services.insert(service.to_string(), port);
    Ok(())
}

/// Resolves a service name to a port, minting a send reference for the
/// caller.
pub(crate) fn lookup(service: &str) -> Result<PortName, LookupError> {
    let mut table = table();
    let Some(&port) = table.services.get(service) else {
        return Err(LookupError::NotRegistered(service.to_string()));
    };
    match table.ports.get_mut(&port) {
        Some(entry) => {
            entry.send_refs += 1;
            Ok(port)
        }
        None => {
            // The registered port died; forget the stale entry.
            table.services.remove(service);
            Err(LookupError::NotRegistered(service.to_string()))
        }
    }
}

/// Copies `data` into a fresh out-of-line block, returning its id.
pub(crate) fn block_allocate(data: &[u8]) -> u64 {
    let mut blocks = blocks();
    blocks.next_id += 1;
    let id = blocks.next_id;
    blocks.blocks.insert(id, data.to_vec());
    id
}

/// Takes ownership of an out-of-line block.
pub(crate) fn block_take(id: u64) -> Option<Vec<u8>> {
    blocks().blocks.remove(&id)
}

/// Releases an out-of-line block that was never extracted. Failures are
/// kernel housekeeping and only logged.
pub(crate) fn block_release(id: u64) {
    if blocks().blocks.remove(&id).is_none() {
        warn!(block = id, "deallocating an unknown out-of-line block");
    }
}

/// Identity stamped into the trailer of every delivered message.
pub(crate) fn identity() -> SenderIdentity {
    SenderIdentity {
        pid: std::process::id(),
        uid: current_uid(),
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    // SAFETY: getuid is always safe to call.
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

/// Delivers an encoded message to the port named in its header.
///
/// The buffer is validated and copied; the copy has its dispositions
/// rewritten to the forms the receiver observes (copy/make-send become
/// move-send, make-send-once becomes move-send-once) and its reply address
/// swapped into the remote field. Nothing is transferred unless the whole
/// message validates, so a failed send leaves every right and block with
/// the caller.
pub(crate) fn deliver(bytes: &[u8]) -> Result<(), SendError> {
    let header = MessageHeader::read(bytes).ok_or(SendError::Transport(status::MALFORMED))?;
    let layout =
        MessageLayout::parse(bytes).map_err(|_| SendError::Transport(status::MALFORMED))?;
    let remote_disposition = header
        .remote_disposition()
        .ok_or(SendError::Transport(status::INVALID_RIGHT))?;
    if !matches!(
        remote_disposition,
        Disposition::CopySend | Disposition::MoveSend | Disposition::MoveSendOnce
    ) {
        return Err(SendError::Transport(status::INVALID_RIGHT));
    }

    let mut delivered = bytes.to_vec();
    let mut table = table();

    if !table.ports.contains_key(&header.remote_port) {
        return Err(SendError::Transport(status::INVALID_DEST));
    }

    // First pass: validate every transferred right before touching counts.
    let mut port_items = Vec::new();
    for (index, item) in layout.items().iter().enumerate() {
        if *item != LayoutItem::Port {
            continue;
        }
        let offset = layout.offset_of_item(index);
        let descriptor = PortDescriptor::read(bytes, offset)
            .ok_or(SendError::Transport(status::MALFORMED))?;
        if descriptor.name == 0 {
            continue;
        }
        let disposition = Disposition::from_u32(descriptor.disposition)
            .ok_or(SendError::Transport(status::INVALID_RIGHT))?;
        if !table.ports.contains_key(&descriptor.name) {
            return Err(SendError::Transport(status::INVALID_RIGHT));
        }
        port_items.push((offset, descriptor.name, disposition));
    }

    let local_disposition = if header.local_port != 0 {
        let disposition = header
            .local_disposition()
            .ok_or(SendError::Transport(status::INVALID_RIGHT))?;
        if !matches!(
            disposition,
            Disposition::MakeSendOnce | Disposition::MoveSendOnce
        ) {
            return Err(SendError::Transport(status::INVALID_RIGHT));
        }
        if !table.ports.contains_key(&header.local_port) {
            return Err(SendError::Transport(status::INVALID_RIGHT));
        }
        Some(disposition)
    } else {
        None
    };

    // Second pass: apply transfers and rewrite descriptors to the delivered
    // dispositions.
    for (offset, name, disposition) in port_items {
        let delivered_disposition = match disposition {
            Disposition::CopySend | Disposition::MakeSend => {
                if let Some(entry) = table.ports.get_mut(&name) {
                    entry.send_refs += 1;
                }
                Disposition::MoveSend
            }
            Disposition::MakeSendOnce => {
                if let Some(entry) = table.ports.get_mut(&name) {
                    entry.send_once_refs += 1;
                }
                Disposition::MoveSendOnce
            }
            Disposition::MoveSend => Disposition::MoveSend,
            Disposition::MoveSendOnce => Disposition::MoveSendOnce,
        };
        PortDescriptor {
            name,
            disposition: delivered_disposition as u32,
        }
        .store(&mut delivered, offset);
    }

    // The receiver observes the reply address in the remote field, carrying
    // a consumable send-once right.
    let mut delivered_header = header;
    delivered_header.local_port = 0;
    delivered_header.bits = header.bits & BITS_COMPLEX;
    if let Some(disposition) = local_disposition {
        if disposition == Disposition::MakeSendOnce {
            if let Some(entry) = table.ports.get_mut(&header.local_port) {
                entry.send_once_refs += 1;
            }
        }
        delivered_header.remote_port = header.local_port;
        delivered_header.bits |= Disposition::MoveSendOnce as u32;
    } else {
        delivered_header.remote_port = 0;
    }
    delivered_header.write(&mut delivered[..HEADER_SIZE]);

    // A moved destination right is consumed by the send itself.
    if let Some(entry) = table.ports.get_mut(&header.remote_port) {
        match remote_disposition {
            Disposition::MoveSend => entry.send_refs = entry.send_refs.saturating_sub(1),
            Disposition::MoveSendOnce => {
                entry.send_once_refs = entry.send_once_refs.saturating_sub(1)
            }
            _ => {}
        }
    }

    let tx = table
        .ports
        .get(&header.remote_port)
        .map(|entry| entry.tx.clone());
    drop(table);

    match tx {
        Some(tx) => tx
            .send(RawMessage {
                bytes: delivered,
                sender: identity(),
            })
            .map_err(|_| SendError::Transport(status::INVALID_DEST)),
        None => Err(SendError::Transport(status::INVALID_DEST)),
    }
}

#[cfg(test)]
pub(crate) fn port_refs(name: PortName) -> Option<(u32, u32)> {
    table()
        .ports
        .get(&name)
        .map(|entry| (entry.send_refs, entry.send_once_refs))
}

#[cfg(test)]
pub(crate) fn port_exists(name: PortName) -> bool {
    table().ports.contains_key(&name)
}

#[cfg(test)]
pub(crate) fn block_exists(id: u64) -> bool {
    blocks().blocks.contains_key(&id)
}
