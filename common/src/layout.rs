//! Message envelope layout.
//!
//! Every message is a flat byte buffer shaped as:
//!
//! ```text
//! header (24 bytes)
//! [body header (4 bytes) + descriptors]   only when the complex bit is set
//! inline plain data
//! [trailer]                               appended past the nominal size
//! ```
//!
//! Descriptors come in two fixed sizes, distinguished by a leading type tag:
//! a port descriptor (tag, port name, disposition) and an out-of-line data
//! descriptor (tag, byte size, block id). All header and descriptor fields
//! are native-endian `u32`s except the out-of-line block id (`u64`).

use crate::error::ReceiveError;

/// Size of the fixed message header.
pub const HEADER_SIZE: usize = 24;

/// Size of the descriptor-count word preceding the descriptor table.
pub const BODY_HEADER_SIZE: usize = 4;

/// Size of a port descriptor.
pub const PORT_DESCRIPTOR_SIZE: usize = 12;

/// Size of an out-of-line data descriptor.
pub const OUT_OF_LINE_DESCRIPTOR_SIZE: usize = 16;

/// Size of the trailer the receive path appends past the nominal size.
pub const TRAILER_SIZE: usize = 12;

/// Header bit marking a message that carries a descriptor table.
pub const BITS_COMPLEX: u32 = 0x8000_0000;

pub(crate) const BITS_REMOTE_MASK: u32 = 0x0000_00ff;
pub(crate) const BITS_LOCAL_MASK: u32 = 0x0000_ff00;
pub(crate) const BITS_LOCAL_SHIFT: u32 = 8;

const DESCRIPTOR_TAG_PORT: u32 = 1;
const DESCRIPTOR_TAG_OUT_OF_LINE: u32 = 2;

/// How a port right travels inside a message.
///
/// Senders use the copy/make forms; the delivery path rewrites every
/// descriptor to the move form actually handed to the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Disposition {
    MoveSend = 1,
    MoveSendOnce = 2,
    CopySend = 3,
    MakeSend = 4,
    MakeSendOnce = 5,
}

impl Disposition {
    pub fn from_u32(value: u32) -> Option<Disposition> {
        match value {
            1 => Some(Disposition::MoveSend),
            2 => Some(Disposition::MoveSendOnce),
            3 => Some(Disposition::CopySend),
            4 => Some(Disposition::MakeSend),
            5 => Some(Disposition::MakeSendOnce),
            _ => None,
        }
    }
}

fn read_u32(buffer: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buffer[offset..offset + 4]);
    u32::from_ne_bytes(bytes)
}

fn read_u64(buffer: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buffer[offset..offset + 8]);
    u64::from_ne_bytes(bytes)
}

fn write_u32(buffer: &mut [u8], offset: usize, value: u32) {
    buffer[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}

fn write_u64(buffer: &mut [u8], offset: usize, value: u64) {
    buffer[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
}

/// The fixed header at the front of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub bits: u32,
    pub size: u32,
    pub remote_port: u32,
    pub local_port: u32,
    pub reserved: u32,
    pub id: i32,
}

impl MessageHeader {
    pub fn read(buffer: &[u8]) -> Option<MessageHeader> {
        if buffer.len() < HEADER_SIZE {
            return None;
        }
        Some(MessageHeader {
            bits: read_u32(buffer, 0),
            size: read_u32(buffer, 4),
            remote_port: read_u32(buffer, 8),
            local_port: read_u32(buffer, 12),
            reserved: read_u32(buffer, 16),
            id: read_u32(buffer, 20) as i32,
        })
    }

    pub fn write(&self, buffer: &mut [u8]) {
        write_u32(buffer, 0, self.bits);
        write_u32(buffer, 4, self.size);
        write_u32(buffer, 8, self.remote_port);
        write_u32(buffer, 12, self.local_port);
        write_u32(buffer, 16, self.reserved);
        write_u32(buffer, 20, self.id as u32);
    }

    pub fn is_complex(&self) -> bool {
        self.bits & BITS_COMPLEX != 0
    }

    /// Disposition of the right addressed by `remote_port`, when valid.
    pub fn remote_disposition(&self) -> Option<Disposition> {
        Disposition::from_u32(self.bits & BITS_REMOTE_MASK)
    }

    /// Disposition of the right addressed by `local_port`, when valid.
    pub fn local_disposition(&self) -> Option<Disposition> {
        Disposition::from_u32((self.bits & BITS_LOCAL_MASK) >> BITS_LOCAL_SHIFT)
    }

    pub(crate) fn compose_bits(
        remote: Option<Disposition>,
        local: Option<Disposition>,
        complex: bool,
    ) -> u32 {
        let mut bits = 0;
        if let Some(remote) = remote {
            bits |= remote as u32;
        }
        if let Some(local) = local {
            bits |= (local as u32) << BITS_LOCAL_SHIFT;
        }
        if complex {
            bits |= BITS_COMPLEX;
        }
        bits
    }
}

/// A port descriptor inside the body table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PortDescriptor {
    pub name: u32,
    pub disposition: u32,
}

impl PortDescriptor {
    pub(crate) fn read(buffer: &[u8], offset: usize) -> Option<PortDescriptor> {
        if buffer.len() < offset + PORT_DESCRIPTOR_SIZE
            || read_u32(buffer, offset) != DESCRIPTOR_TAG_PORT
        {
            return None;
        }
        Some(PortDescriptor {
            name: read_u32(buffer, offset + 4),
            disposition: read_u32(buffer, offset + 8),
        })
    }

    pub(crate) fn append(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&DESCRIPTOR_TAG_PORT.to_ne_bytes());
        out.extend_from_slice(&self.name.to_ne_bytes());
        out.extend_from_slice(&self.disposition.to_ne_bytes());
    }

    pub(crate) fn store(&self, buffer: &mut [u8], offset: usize) {
        write_u32(buffer, offset, DESCRIPTOR_TAG_PORT);
        write_u32(buffer, offset + 4, self.name);
        write_u32(buffer, offset + 8, self.disposition);
    }
}

/// An out-of-line data descriptor inside the body table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OutOfLineDescriptor {
    pub size: u32,
    pub block: u64,
}

impl OutOfLineDescriptor {
    pub(crate) fn read(buffer: &[u8], offset: usize) -> Option<OutOfLineDescriptor> {
        if buffer.len() < offset + OUT_OF_LINE_DESCRIPTOR_SIZE
            || read_u32(buffer, offset) != DESCRIPTOR_TAG_OUT_OF_LINE
        {
            return None;
        }
        Some(OutOfLineDescriptor {
            size: read_u32(buffer, offset + 4),
            block: read_u64(buffer, offset + 8),
        })
    }

    pub(crate) fn append(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&DESCRIPTOR_TAG_OUT_OF_LINE.to_ne_bytes());
        out.extend_from_slice(&self.size.to_ne_bytes());
        out.extend_from_slice(&self.block.to_ne_bytes());
    }

    pub(crate) fn store(&self, buffer: &mut [u8], offset: usize) {
        write_u32(buffer, offset, DESCRIPTOR_TAG_OUT_OF_LINE);
        write_u32(buffer, offset + 4, self.size);
        write_u64(buffer, offset + 8, self.block);
    }
}

/// One positional item in a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutItem {
    Port,
    OutOfLine,
}

impl LayoutItem {
    pub fn fixed_size(&self) -> usize {
        match self {
            LayoutItem::Port => PORT_DESCRIPTOR_SIZE,
            LayoutItem::OutOfLine => OUT_OF_LINE_DESCRIPTOR_SIZE,
        }
    }
}

/// The structural shape of a message, independent of its content.
///
/// Two layouts are equal only when their item sequences match in order and
/// their plain-data sizes match exactly; items are positionally addressed,
/// so order is significant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLayout {
    items: Vec<LayoutItem>,
    plain_data_size: usize,
}

impl MessageLayout {
    pub fn new(items: Vec<LayoutItem>, plain_data_size: usize) -> MessageLayout {
        MessageLayout {
            items,
            plain_data_size,
        }
    }

    /// A layout with no descriptor items, only inline plain data.
    pub fn plain(plain_data_size: usize) -> MessageLayout {
        MessageLayout::new(Vec::new(), plain_data_size)
    }

    pub fn items(&self) -> &[LayoutItem] {
        &self.items
    }

    pub fn plain_data_size(&self) -> usize {
        self.plain_data_size
    }

    /// A message is complex when it carries at least one descriptor item;
    /// the header's complex bit must mirror this exactly.
    pub fn is_complex(&self) -> bool {
        !self.items.is_empty()
    }

    /// Byte offset of the inline plain data.
    pub fn plain_data_offset(&self) -> usize {
        if self.items.is_empty() {
            return HEADER_SIZE;
        }
        HEADER_SIZE
            + BODY_HEADER_SIZE
            + self
                .items
                .iter()
                .map(LayoutItem::fixed_size)
                .sum::<usize>()
    }

    /// Total nominal message size, excluding any trailer.
    pub fn size(&self) -> usize {
        self.plain_data_offset() + self.plain_data_size
    }

    /// Byte offset of the descriptor at `index`.
    pub fn offset_of_item(&self, index: usize) -> usize {
        HEADER_SIZE
            + BODY_HEADER_SIZE
            + self.items[..index]
                .iter()
                .map(LayoutItem::fixed_size)
                .sum::<usize>()
    }

    /// The reserved reply shape used to signal an application-level failure
    /// for messages expected in this layout.
    ///
    /// The error shape is a plain 4-byte status code, except when the
    /// expected success shape is itself exactly that, in which case the
    /// error shape widens to 8 bytes so the two stay distinguishable.
    pub fn error_layout(&self) -> MessageLayout {
        const INT_SIZE: usize = 4;

        if self.is_complex() || self.plain_data_size != INT_SIZE {
            MessageLayout::plain(INT_SIZE)
        } else {
            MessageLayout::plain(INT_SIZE * 2)
        }
    }

    /// Derives the layout of a received message from its raw bytes.
    ///
    /// Scans the descriptor table left to right, classifying each entry by
    /// its type tag; the bytes between the table and the header-reported
    /// size are the inline plain data.
    pub fn parse(buffer: &[u8]) -> Result<MessageLayout, ReceiveError> {
        let header = MessageHeader::read(buffer).ok_or(ReceiveError::Malformed)?;
        let size = header.size as usize;
        if size < HEADER_SIZE || size > buffer.len() {
            return Err(ReceiveError::Malformed);
        }

        if !header.is_complex() {
            return Ok(MessageLayout::plain(size - HEADER_SIZE));
        }

        if size < HEADER_SIZE + BODY_HEADER_SIZE {
            return Err(ReceiveError::Malformed);
        }
        let count = read_u32(buffer, HEADER_SIZE) as usize;

        let mut items = Vec::with_capacity(count);
        let mut cursor = HEADER_SIZE + BODY_HEADER_SIZE;
        for _ in 0..count {
            if size < cursor + 4 {
                return Err(ReceiveError::Malformed);
            }
            let item = match read_u32(buffer, cursor) {
                DESCRIPTOR_TAG_PORT => LayoutItem::Port,
                DESCRIPTOR_TAG_OUT_OF_LINE => LayoutItem::OutOfLine,
                _ => return Err(ReceiveError::Malformed),
            };
            cursor += item.fixed_size();
            if cursor > size {
                return Err(ReceiveError::Malformed);
            }
            items.push(item);
        }

        Ok(MessageLayout::new(items, size - cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_accounts_for_header_body_and_plain_data() {
        assert_eq!(MessageLayout::plain(0).size(), HEADER_SIZE);
        assert_eq!(MessageLayout::plain(10).size(), HEADER_SIZE + 10);

        let layout = MessageLayout::new(vec![LayoutItem::Port, LayoutItem::OutOfLine], 8);
        assert_eq!(
            layout.size(),
            HEADER_SIZE
                + BODY_HEADER_SIZE
                + PORT_DESCRIPTOR_SIZE
                + OUT_OF_LINE_DESCRIPTOR_SIZE
                + 8
        );
        assert!(layout.is_complex());
        assert!(!MessageLayout::plain(8).is_complex());
    }

    #[test]
    fn equal_inputs_build_equal_layouts() {
        let a = MessageLayout::new(vec![LayoutItem::OutOfLine, LayoutItem::Port], 4);
        let b = MessageLayout::new(vec![LayoutItem::OutOfLine, LayoutItem::Port], 4);
        assert_eq!(a, b);
    }

    #[test]
    fn item_order_is_significant() {
        let a = MessageLayout::new(vec![LayoutItem::OutOfLine, LayoutItem::Port], 4);
        let b = MessageLayout::new(vec![LayoutItem::Port, LayoutItem::OutOfLine], 4);
        assert_ne!(a, b);
    }

    #[test]
    fn item_offsets_are_positional() {
        let layout = MessageLayout::new(
            vec![LayoutItem::Port, LayoutItem::OutOfLine, LayoutItem::Port],
            0,
        );
        let base = HEADER_SIZE + BODY_HEADER_SIZE;
        assert_eq!(layout.offset_of_item(0), base);
        assert_eq!(layout.offset_of_item(1), base + PORT_DESCRIPTOR_SIZE);
        assert_eq!(
            layout.offset_of_item(2),
            base + PORT_DESCRIPTOR_SIZE + OUT_OF_LINE_DESCRIPTOR_SIZE
        );
    }

    #[test]
    fn error_layout_widens_only_for_plain_int_replies() {
        assert_eq!(MessageLayout::plain(0).error_layout(), MessageLayout::plain(4));
        assert_eq!(MessageLayout::plain(4).error_layout(), MessageLayout::plain(8));
        assert_eq!(MessageLayout::plain(16).error_layout(), MessageLayout::plain(4));
        assert_eq!(
            MessageLayout::new(vec![LayoutItem::OutOfLine], 0).error_layout(),
            MessageLayout::plain(4)
        );
        assert_eq!(
            MessageLayout::new(vec![LayoutItem::Port], 4).error_layout(),
            MessageLayout::plain(4)
        );
    }

    #[test]
    fn parse_recovers_the_built_shape() {
        let layout = MessageLayout::new(vec![LayoutItem::OutOfLine, LayoutItem::Port], 6);

        let header = MessageHeader {
            bits: BITS_COMPLEX,
            size: layout.size() as u32,
            remote_port: 0,
            local_port: 0,
            reserved: 0,
            id: 42,
        };
        let mut bytes = vec![0u8; HEADER_SIZE];
        header.write(&mut bytes);
        bytes.extend_from_slice(&2u32.to_ne_bytes());
        OutOfLineDescriptor { size: 16, block: 9 }.append(&mut bytes);
        PortDescriptor {
            name: 5,
            disposition: Disposition::MoveSend as u32,
        }
        .append(&mut bytes);
        bytes.extend_from_slice(&[0u8; 6]);

        assert_eq!(MessageLayout::parse(&bytes).unwrap(), layout);
    }

    #[test]
    fn parse_rejects_truncated_or_mistagged_buffers() {
        assert!(MessageLayout::parse(&[0u8; 8]).is_err());

        let header = MessageHeader {
            bits: BITS_COMPLEX,
            size: (HEADER_SIZE + BODY_HEADER_SIZE + 4) as u32,
            remote_port: 0,
            local_port: 0,
            reserved: 0,
            id: 1,
        };
        let mut bytes = vec![0u8; HEADER_SIZE];
        header.write(&mut bytes);
        bytes.extend_from_slice(&1u32.to_ne_bytes());
        bytes.extend_from_slice(&77u32.to_ne_bytes()); // unknown descriptor tag
        assert!(MessageLayout::parse(&bytes).is_err());
    }
}
