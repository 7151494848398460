//! Synchronous send and receive primitives, plus the request/reply
//! convention layered on them.
//!
//! `send` and `receive` are intentionally blocking; asynchrony is layered on
//! top through [`Promise`], not built into the transport. A request/reply
//! call sends the request carrying a single-use reply right minted from a
//! fresh private port, then parks on that port for a message bearing
//! `request id + REPLY_OFFSET`. A reply in the expected layout decodes into
//! the result; a reply in the reserved error shape surfaces the remote
//! status code; anything else is a protocol violation.

use std::time::Duration;

use crate::codec::{decode_value, Decode, Decoder, Encoder};
use crate::error::{status, IpcError, ReceiveError, SendError};
use crate::layout::{Disposition, LayoutItem, MessageLayout};
use crate::message::{Item, Message};
use crate::ports::{self, PortName};
use crate::promise::Promise;
use crate::protocol::REPLY_OFFSET;
use crate::rights::{ReceiveRight, SendOnceRight, SendRight};

/// Where an outgoing message is addressed.
pub enum Destination<'a> {
    /// A reusable send right; the message carries a duplicate of it.
    Send(&'a SendRight),
    /// A consumable send-once right; the send uses it up.
    MoveSendOnce(SendOnceRight),
}

impl Destination<'_> {
    fn into_parts(self) -> (PortName, Disposition) {
        match self {
            Destination::Send(right) => (right.name(), Disposition::CopySend),
            Destination::MoveSendOnce(right) => (right.into_name(), Disposition::MoveSendOnce),
        }
    }
}

/// Builds and sends one message.
///
/// When `reply` is given, a single-use reply right to it is attached to the
/// envelope itself. On success, ownership of every embedded item has passed
/// to the port layer; on failure it stays with the message, whose destructor
/// releases it.
pub fn send(
    id: i32,
    destination: Destination<'_>,
    reply: Option<&ReceiveRight>,
    items: Vec<Item<'_>>,
    plain_data: &[u8],
) -> Result<(), SendError> {
    let remote = destination.into_parts();
    let local = reply.map(|port| (port.name(), Disposition::MakeSendOnce));

    let mut message = Message::encode(id, remote, local, items, plain_data);
    ports::deliver(message.bytes())?;
    message.mark_delivered();
    Ok(())
}

/// Blocks until a message of at most `max_size` nominal bytes (plus
/// trailer) arrives on `port`. An over-size message is destroyed and
/// reported as a transport failure.
pub fn receive(max_size: usize, port: &ReceiveRight) -> Result<Message, ReceiveError> {
    finish_receive(Message::from_raw(port.recv()?)?, max_size)
}

/// Like [`receive`], but gives up after `timeout` with `Ok(None)`.
pub(crate) fn receive_timeout(
    max_size: usize,
    port: &ReceiveRight,
    timeout: Duration,
) -> Result<Option<Message>, ReceiveError> {
    match port.recv_timeout(timeout)? {
        Some(raw) => finish_receive(Message::from_raw(raw)?, max_size).map(Some),
        None => Ok(None),
    }
}

fn finish_receive(message: Message, max_size: usize) -> Result<Message, ReceiveError> {
    if message.layout().size() > max_size {
        // The destructor releases whatever the oversized message embedded.
        return Err(ReceiveError::Transport(status::TOO_LARGE));
    }
    Ok(message)
}

/// Receives one message and validates it against an expected id and layout.
pub fn receive_matching(
    layout: &MessageLayout,
    id: i32,
    port: &ReceiveRight,
) -> Result<Message, ReceiveError> {
    let message = receive(layout.size().max(layout.error_layout().size()), port)?;

    if message.id() != id {
        return Err(ReceiveError::UnexpectedReply);
    }

    if message.layout() != layout {
        if *message.layout() == layout.error_layout() {
            let code = Decoder::new(message.plain_data()).decode_i32()?;
            return Err(ReceiveError::Remote(code));
        }
        return Err(ReceiveError::ProtocolMismatch);
    }

    Ok(message)
}

/// A reply converted into plain owned data, safe to hand through a promise.
#[derive(Debug, Clone)]
pub struct Reply {
    layout: MessageLayout,
    plain_data: Vec<u8>,
    blocks: Vec<Vec<u8>>,
}

impl Reply {
    fn from_message(mut message: Message) -> Result<Reply, ReceiveError> {
        let layout = message.layout().clone();
        let mut blocks = Vec::new();
        for (index, item) in layout.items().iter().enumerate() {
            match item {
                LayoutItem::OutOfLine => blocks.push(message.extract_out_of_line(index)),
                // The request/reply convention carries payloads inline or
                // out of line, never as port rights.
                LayoutItem::Port => return Err(ReceiveError::ProtocolMismatch),
            }
        }
        Ok(Reply {
            layout,
            plain_data: message.plain_data().to_vec(),
            blocks,
        })
    }

    pub fn layout(&self) -> &MessageLayout {
        &self.layout
    }

    pub fn plain_data(&self) -> &[u8] {
        &self.plain_data
    }

    /// The extracted out-of-line payloads, in descriptor order.
    pub fn block(&self, index: usize) -> &[u8] {
        &self.blocks[index]
    }
}

/// Sends a request and returns a promise for a reply in `reply_layout`.
///
/// A fresh private receive port carries the reply; a no-senders
/// notification is requested on it, so a remote end that drops the reply
/// right without answering wakes the pending receive instead of leaving it
/// parked forever.
pub fn send_with_reply_raw(
    id: i32,
    destination: &SendRight,
    items: Vec<Item<'_>>,
    plain_data: &[u8],
    reply_layout: MessageLayout,
) -> Promise<Reply> {
    let reply_port = ReceiveRight::allocate();

    if let Err(error) = send(
        id,
        Destination::Send(destination),
        Some(&reply_port),
        items,
        plain_data,
    ) {
        return Promise::fulfilled(Err(error.into()));
    }

    reply_port.request_no_senders_notification();

    Promise::spawn(move || {
        let message = receive_matching(&reply_layout, id + REPLY_OFFSET, &reply_port)?;
        Ok(Reply::from_message(message)?)
    })
}

/// Request/reply call whose reply carries one out-of-line payload decoded
/// into `T`.
pub fn send_with_reply<T>(
    id: i32,
    destination: &SendRight,
    items: Vec<Item<'_>>,
    plain_data: &[u8],
) -> Promise<T>
where
    T: Decode + Clone + Send + 'static,
{
    send_with_reply_raw(
        id,
        destination,
        items,
        plain_data,
        MessageLayout::new(vec![LayoutItem::OutOfLine], 0),
    )
    .then(|reply| Ok(decode_value::<T>(reply.block(0))?))
}

/// Request/reply call whose reply is an empty acknowledgement.
pub fn send_with_empty_reply(
    id: i32,
    destination: &SendRight,
    items: Vec<Item<'_>>,
    plain_data: &[u8],
) -> Promise<()> {
    send_with_reply_raw(id, destination, items, plain_data, MessageLayout::plain(0))
        .then(|_| Ok(()))
}

/// Answers a request with the reserved error shape carrying `code`,
/// consuming the reply right.
///
/// `reply_layout` is the success shape the caller expects; the error shape
/// is derived from it so the two stay distinguishable.
pub fn send_error_reply(
    id: i32,
    reply: SendOnceRight,
    code: i32,
    reply_layout: &MessageLayout,
) -> Result<(), SendError> {
    let error_layout = reply_layout.error_layout();
    let mut encoder = Encoder::new();
    encoder.encode_i32(code);
    if error_layout.plain_data_size() == 8 {
        encoder.encode_i32(0);
    }
    send(
        id,
        Destination::MoveSendOnce(reply),
        None,
        Vec::new(),
        encoder.data(),
    )
}
