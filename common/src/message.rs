//! Message envelopes: building outgoing messages and owning received ones.
//!
//! A [`Message`] owns its raw buffer together with the layout derived from
//! (or used to build) it. Embedded descriptor items belong to the message
//! until they are explicitly extracted; extraction zeroes the descriptor in
//! place so the destructor cannot release the same item twice. Dropping a
//! message that was neither delivered nor fully extracted releases every
//! owned item it still embeds.

use tracing::warn;

use crate::codec::{encode_value, Encode};
use crate::error::ReceiveError;
use crate::layout::{
    Disposition, LayoutItem, MessageHeader, MessageLayout, OutOfLineDescriptor, PortDescriptor,
    HEADER_SIZE, TRAILER_SIZE,
};
use crate::ports::{self, PortName, RawMessage, SenderIdentity};
use crate::rights::{ReceiveRight, SendOnceRight, SendRight};

/// How a port right is attached to an outgoing message.
pub enum PortItem<'a> {
    /// Duplicate the caller's send right for the receiver.
    CopySend(&'a SendRight),
    /// Mint a new send right to the caller's receive port.
    MakeSend(&'a ReceiveRight),
    /// Mint a single-use send right to the caller's receive port.
    MakeSendOnce(&'a ReceiveRight),
    /// Hand over a consumable send-once right.
    MoveSendOnce(SendOnceRight),
}

impl PortItem<'_> {
    fn disposition(&self) -> Disposition {
        match self {
            PortItem::CopySend(_) => Disposition::CopySend,
            PortItem::MakeSend(_) => Disposition::MakeSend,
            PortItem::MakeSendOnce(_) => Disposition::MakeSendOnce,
            PortItem::MoveSendOnce(_) => Disposition::MoveSendOnce,
        }
    }
}

/// One body item of an outgoing message.
pub enum Item<'a> {
    /// A payload transferred by reference through the block space.
    OutOfLine(Vec<u8>),
    /// A port right transfer.
    Port(PortItem<'a>),
}

impl Item<'_> {
    /// Encodes `value` through the wire codec into an out-of-line item.
    pub fn encodable<T: Encode + ?Sized>(value: &T) -> Item<'static> {
        Item::OutOfLine(encode_value(value))
    }

    fn layout_item(&self) -> LayoutItem {
        match self {
            Item::OutOfLine(_) => LayoutItem::OutOfLine,
            Item::Port(_) => LayoutItem::Port,
        }
    }
}

/// An owned message buffer plus its validated layout.
#[derive(Debug)]
pub struct Message {
    bytes: Vec<u8>,
    header: MessageHeader,
    layout: MessageLayout,
    delivered: bool,
}

impl Message {
    /// Builds an outgoing message. Out-of-line items are copied into fresh
    /// blocks; moved rights are consumed and now travel with the message.
    pub(crate) fn encode(
        id: i32,
        remote: (PortName, Disposition),
        local: Option<(PortName, Disposition)>,
        items: Vec<Item<'_>>,
        plain_data: &[u8],
    ) -> Message {
        let layout = MessageLayout::new(
            items.iter().map(Item::layout_item).collect(),
            plain_data.len(),
        );

        let header = MessageHeader {
            bits: MessageHeader::compose_bits(
                Some(remote.1),
                local.map(|(_, disposition)| disposition),
                layout.is_complex(),
            ),
            size: layout.size() as u32,
            remote_port: remote.0,
            local_port: local.map(|(name, _)| name).unwrap_or(0),
            reserved: 0,
            id,
        };

        let mut bytes = vec![0u8; HEADER_SIZE];
        header.write(&mut bytes);

        if !items.is_empty() {
            bytes.extend_from_slice(&(items.len() as u32).to_ne_bytes());
            for item in items {
                match item {
                    Item::OutOfLine(data) => {
                        let block = ports::block_allocate(&data);
                        OutOfLineDescriptor {
                            size: data.len() as u32,
                            block,
                        }
                        .append(&mut bytes);
                    }
                    Item::Port(port) => {
                        let disposition = port.disposition();
                        let name = match port {
                            PortItem::CopySend(right) => right.name(),
                            PortItem::MakeSend(right) | PortItem::MakeSendOnce(right) => {
                                right.name()
                            }
                            PortItem::MoveSendOnce(right) => right.into_name(),
                        };
                        PortDescriptor {
                            name,
                            disposition: disposition as u32,
                        }
                        .append(&mut bytes);
                    }
                }
            }
        }

        bytes.extend_from_slice(plain_data);
        debug_assert_eq!(bytes.len(), layout.size());

        Message {
            bytes,
            header,
            layout,
            delivered: false,
        }
    }

    /// Wraps a delivered buffer, deriving and validating its layout and
    /// appending the identity trailer past the nominal size.
    pub(crate) fn from_raw(raw: RawMessage) -> Result<Message, ReceiveError> {
        let header = MessageHeader::read(&raw.bytes).ok_or(ReceiveError::Malformed)?;
        if header.size as usize != raw.bytes.len() {
            return Err(ReceiveError::Malformed);
        }
        let layout = MessageLayout::parse(&raw.bytes)?;

        let mut bytes = raw.bytes;
        bytes.extend_from_slice(&(TRAILER_SIZE as u32).to_ne_bytes());
        bytes.extend_from_slice(&raw.sender.pid.to_ne_bytes());
        bytes.extend_from_slice(&raw.sender.uid.to_ne_bytes());

        Ok(Message {
            bytes,
            header,
            layout,
            delivered: false,
        })
    }

    pub fn id(&self) -> i32 {
        self.header.id
    }

    pub fn layout(&self) -> &MessageLayout {
        &self.layout
    }

    /// The inline payload between the descriptor table and the nominal end.
    pub fn plain_data(&self) -> &[u8] {
        &self.bytes[self.layout.plain_data_offset()..self.layout.size()]
    }

    /// Identity of the sender, when a trailer was attached at receive time.
    pub fn sender_identity(&self) -> Option<SenderIdentity> {
        let trailer = self.bytes.get(self.layout.size()..)?;
        if trailer.len() < TRAILER_SIZE {
            return None;
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(&trailer[..4]);
        if u32::from_ne_bytes(word) as usize != TRAILER_SIZE {
            return None;
        }
        word.copy_from_slice(&trailer[4..8]);
        let pid = u32::from_ne_bytes(word);
        word.copy_from_slice(&trailer[8..12]);
        let uid = u32::from_ne_bytes(word);
        Some(SenderIdentity { pid, uid })
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes[..self.layout.size()]
    }

    /// Marks every embedded item as owned by the port layer after a
    /// successful send; the destructor then releases nothing.
    pub(crate) fn mark_delivered(&mut self) {
        self.delivered = true;
    }

    /// Takes ownership of the out-of-line payload at `index`, zeroing the
    /// descriptor so destruction does not release the block again. Returns
    /// an empty buffer when the item was already extracted.
    pub fn extract_out_of_line(&mut self, index: usize) -> Vec<u8> {
        assert_eq!(self.layout.items().get(index), Some(&LayoutItem::OutOfLine));
        let offset = self.layout.offset_of_item(index);

        let Some(descriptor) = OutOfLineDescriptor::read(&self.bytes, offset) else {
            return Vec::new();
        };
        if descriptor.block == 0 {
            return Vec::new();
        }

        OutOfLineDescriptor { size: 0, block: 0 }.store(&mut self.bytes, offset);

        match ports::block_take(descriptor.block) {
            Some(data) => data,
            None => {
                warn!(block = descriptor.block, "out-of-line block vanished before extraction");
                Vec::new()
            }
        }
    }

    /// Takes ownership of the send right at `index`.
    pub fn extract_send_right(&mut self, index: usize) -> Result<SendRight, ReceiveError> {
        let name = self.extract_port(index, Disposition::MoveSend)?;
        Ok(SendRight::from_name(name))
    }

    /// Takes ownership of the send-once right at `index`.
    pub fn extract_send_once_right(
        &mut self,
        index: usize,
    ) -> Result<SendOnceRight, ReceiveError> {
        let name = self.extract_port(index, Disposition::MoveSendOnce)?;
        Ok(SendOnceRight::from_name(name))
    }

    fn extract_port(
        &mut self,
        index: usize,
        expected: Disposition,
    ) -> Result<PortName, ReceiveError> {
        assert_eq!(self.layout.items().get(index), Some(&LayoutItem::Port));
        let offset = self.layout.offset_of_item(index);

        let descriptor =
            PortDescriptor::read(&self.bytes, offset).ok_or(ReceiveError::Malformed)?;
        if descriptor.name == 0 || descriptor.disposition != expected as u32 {
            return Err(ReceiveError::ProtocolMismatch);
        }

        PortDescriptor {
            name: 0,
            disposition: descriptor.disposition,
        }
        .store(&mut self.bytes, offset);

        Ok(descriptor.name)
    }

    /// Lifts the reply address out of the header into a send-once right,
    /// when the addressing bits say one was attached to the message itself.
    pub fn extract_reply_send_once_right(&mut self) -> Option<SendOnceRight> {
        if self.header.remote_disposition() != Some(Disposition::MoveSendOnce)
            || self.header.remote_port == 0
        {
            return None;
        }

        let name = self.header.remote_port;
        self.header.remote_port = 0;
        self.header.write(&mut self.bytes[..HEADER_SIZE]);

        Some(SendOnceRight::from_name(name))
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if self.delivered {
            return;
        }

        // The header's own right: the reply address of a received message,
        // or the moved destination of an outgoing one that failed to send.
        if self.header.remote_port != 0 {
            match self.header.remote_disposition() {
                Some(Disposition::MoveSend) => ports::release_send(self.header.remote_port),
                Some(Disposition::MoveSendOnce) => {
                    ports::release_send_once(self.header.remote_port)
                }
                _ => {}
            }
        }

        for (index, item) in self.layout.items().iter().enumerate() {
            let offset = self.layout.offset_of_item(index);
            match item {
                LayoutItem::Port => {
                    let Some(descriptor) = PortDescriptor::read(&self.bytes, offset) else {
                        continue;
                    };
                    if descriptor.name == 0 {
                        continue;
                    }
                    match Disposition::from_u32(descriptor.disposition) {
                        Some(Disposition::MoveSend) => ports::release_send(descriptor.name),
                        Some(Disposition::MoveSendOnce) => {
                            ports::release_send_once(descriptor.name)
                        }
                        // Copy and make dispositions borrow the sender's
                        // right; there is nothing of ours to release.
                        _ => {}
                    }
                }
                LayoutItem::OutOfLine => {
                    let Some(descriptor) = OutOfLineDescriptor::read(&self.bytes, offset) else {
                        continue;
                    };
                    if descriptor.block != 0 {
                        ports::block_release(descriptor.block);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SendError;
    use crate::layout::OutOfLineDescriptor;
    use crate::ports;

    fn block_of(message: &Message, index: usize) -> u64 {
        OutOfLineDescriptor::read(message.bytes(), message.layout().offset_of_item(index))
            .map(|descriptor| descriptor.block)
            .unwrap_or(0)
    }

    #[test]
    fn dropping_a_failed_send_releases_its_out_of_line_block() {
        // Port name 0 never exists, so delivery fails.
        let message = Message::encode(
            1,
            (0, Disposition::CopySend),
            None,
            vec![Item::OutOfLine(b"doomed".to_vec())],
            &[],
        );
        let block = block_of(&message, 0);
        assert!(ports::block_exists(block));

        assert!(matches!(
            ports::deliver(message.bytes()),
            Err(SendError::Transport(_))
        ));

        drop(message);
        assert!(!ports::block_exists(block));
    }

    #[test]
    fn a_delivered_message_releases_nothing() {
        let port = ReceiveRight::allocate();
        let mut message = Message::encode(
            2,
            (port.name(), Disposition::CopySend),
            None,
            vec![Item::OutOfLine(b"kept".to_vec())],
            &[],
        );
        let block = block_of(&message, 0);

        ports::deliver(message.bytes()).unwrap();
        message.mark_delivered();
        drop(message);

        // The block now belongs to the port layer, pending extraction by
        // the receiver.
        assert!(ports::block_exists(block));

        // Receiver side: extract, then drop; extraction transferred
        // ownership, so the drop must not release the block again.
        let raw = port.recv().unwrap();
        let mut received = Message::from_raw(raw).unwrap();
        let block = block_of(&received, 0);
        let data = received.extract_out_of_line(0);
        assert_eq!(data, b"kept");
        assert!(!ports::block_exists(block));
        drop(received);
    }

    #[test]
    fn extracted_reply_right_is_not_released_by_the_message_destructor() {
        let service = ReceiveRight::allocate();
        let reply_port = ReceiveRight::allocate();

        let mut request = Message::encode(
            3,
            (service.name(), Disposition::CopySend),
            Some((reply_port.name(), Disposition::MakeSendOnce)),
            Vec::new(),
            &[],
        );
        ports::deliver(request.bytes()).unwrap();
        request.mark_delivered();

        let mut received = Message::from_raw(service.recv().unwrap()).unwrap();
        assert_eq!(ports::port_refs(reply_port.name()), Some((0, 1)));

        let reply = received.extract_reply_send_once_right().unwrap();
        assert!(received.extract_reply_send_once_right().is_none());
        drop(received);
        // Still one outstanding send-once reference: the extracted right.
        assert_eq!(ports::port_refs(reply_port.name()), Some((0, 1)));

        drop(reply);
        assert_eq!(ports::port_refs(reply_port.name()), Some((0, 0)));
    }

    #[test]
    fn an_unextracted_reply_right_is_released_on_drop() {
        let service = ReceiveRight::allocate();
        let reply_port = ReceiveRight::allocate();

        let mut request = Message::encode(
            4,
            (service.name(), Disposition::CopySend),
            Some((reply_port.name(), Disposition::MakeSendOnce)),
            Vec::new(),
            &[],
        );
        ports::deliver(request.bytes()).unwrap();
        request.mark_delivered();

        let received = Message::from_raw(service.recv().unwrap()).unwrap();
        assert_eq!(ports::port_refs(reply_port.name()), Some((0, 1)));
        drop(received);
        assert_eq!(ports::port_refs(reply_port.name()), Some((0, 0)));
    }
}
