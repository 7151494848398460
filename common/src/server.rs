//! Message dispatch server.
//!
//! A [`DispatchServer`] owns one receive right and an ordered handler
//! table. Its pump runs on a single named thread: each iteration sizes the
//! receive buffer to the largest handler requirement, receives one message,
//! and walks the table in registration order until a handler claims it.
//! Unclaimed messages are logged and dropped; handling for one server is
//! serialized on its pump thread, so handlers that must not stall the pump
//! hand their work to a worker queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::codec::{decode_value, Decode, Decoder, Plain};
use crate::layout::{LayoutItem, MessageLayout, HEADER_SIZE};
use crate::message::Message;
use crate::protocol::{NOTIFY_NO_SENDERS, REPLY_OFFSET};
use crate::rights::{ReceiveRight, SendOnceRight, SendRight};
use crate::transport::{self, Destination};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

type Handler = Box<dyn FnMut(&mut Message) -> bool + Send>;

/// One entry in a dispatch server's handler table.
///
/// A handler only attempts a message when its optional id filter and
/// optional exact-layout filter both match; the closure then reports
/// whether it claimed the message.
pub struct MessageHandler {
    max_message_size: usize,
    message_id: Option<i32>,
    layout: Option<MessageLayout>,
    handler: Handler,
}

impl MessageHandler {
    pub fn new(
        max_message_size: usize,
        message_id: Option<i32>,
        handler: impl FnMut(&mut Message) -> bool + Send + 'static,
    ) -> MessageHandler {
        MessageHandler {
            max_message_size,
            message_id,
            layout: None,
            handler: Box::new(handler),
        }
    }

    /// A handler that only accepts messages of exactly `layout`; the buffer
    /// requirement is the layout size.
    pub fn with_layout(
        layout: MessageLayout,
        message_id: Option<i32>,
        handler: impl FnMut(&mut Message) -> bool + Send + 'static,
    ) -> MessageHandler {
        MessageHandler {
            max_message_size: layout.size(),
            message_id,
            layout: Some(layout),
            handler: Box::new(handler),
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn try_handle(&mut self, message: &mut Message) -> bool {
        if let Some(id) = self.message_id {
            if message.id() != id {
                return false;
            }
        }
        if let Some(layout) = &self.layout {
            if message.layout() != layout {
                return false;
            }
        }
        (self.handler)(message)
    }
}

struct HandlerTable {
    general: Vec<MessageHandler>,
    no_senders: Option<MessageHandler>,
}

/// Consumable acknowledgement for a pushed message.
///
/// Wraps the reply right of a request that expects an empty reply on
/// `id + REPLY_OFFSET`. The acknowledgement is sent on [`ack`](AckToken::ack)
/// or, if the token is simply dropped, on drop. The reply right is consumed
/// exactly once either way, so the remote call cannot be left hanging.
pub struct AckToken {
    reply: Option<SendOnceRight>,
    reply_id: i32,
}

impl AckToken {
    fn new(reply: SendOnceRight, request_id: i32) -> AckToken {
        AckToken {
            reply: Some(reply),
            reply_id: request_id + REPLY_OFFSET,
        }
    }

    pub fn ack(mut self) {
        self.send_ack();
    }

    fn send_ack(&mut self) {
        if let Some(reply) = self.reply.take() {
            if let Err(error) = transport::send(
                self.reply_id,
                Destination::MoveSendOnce(reply),
                None,
                Vec::new(),
                &[],
            ) {
                warn!(id = self.reply_id, %error, "failed to acknowledge message");
            }
        }
    }
}

impl Drop for AckToken {
    fn drop(&mut self) {
        self.send_ack();
    }
}

/// An event pump bound to one receive right.
pub struct DispatchServer {
    label: String,
    port: Arc<ReceiveRight>,
    handlers: Arc<Mutex<HandlerTable>>,
    shutdown: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

impl DispatchServer {
    /// Creates a server on a freshly allocated port.
    pub fn new(label: &str) -> DispatchServer {
        DispatchServer::with_port(label, ReceiveRight::allocate())
    }

    /// Creates a server on an existing receive right.
    pub fn with_port(label: &str, port: ReceiveRight) -> DispatchServer {
        DispatchServer {
            label: label.to_string(),
            port: Arc::new(port),
            handlers: Arc::new(Mutex::new(HandlerTable {
                general: Vec::new(),
                no_senders: None,
            })),
            shutdown: Arc::new(AtomicBool::new(false)),
            pump: None,
        }
    }

    /// The port this server receives on; used to hand send rights to peers.
    pub fn port(&self) -> &ReceiveRight {
        &self.port
    }

    /// Appends a handler. The table is walked in registration order and the
    /// first handler to claim a message wins.
    pub fn add_handler(&self, handler: MessageHandler) {
        lock(&self.handlers).general.push(handler);
    }

    /// Requests a no-senders notification on the server's port and installs
    /// `handler` for it. The notification is only consulted when no general
    /// handler claimed the message.
    pub fn on_no_senders(&self, mut handler: impl FnMut() + Send + 'static) {
        self.port.request_no_senders_notification();
        lock(&self.handlers).no_senders = Some(MessageHandler::new(
            HEADER_SIZE,
            Some(NOTIFY_NO_SENDERS),
            move |_| {
                handler();
                true
            },
        ));
    }

    /// Starts the pump on a dedicated thread. Starting twice is a no-op.
    pub fn start(&mut self) {
        if self.pump.is_some() {
            return;
        }
        self.shutdown.store(false, Ordering::SeqCst);

        let label = self.label.clone();
        let port = Arc::clone(&self.port);
        let handlers = Arc::clone(&self.handlers);
        let shutdown = Arc::clone(&self.shutdown);

        let pump = thread::Builder::new()
            .name(label.clone())
            .spawn(move || pump_loop(&label, &port, &handlers, &shutdown))
            .expect("failed to spawn dispatch server thread");
        self.pump = Some(pump);
    }

    /// Cancels the pump. A handler already running finishes first.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(pump) = self.pump.take() {
            if let Err(panic) = pump.join() {
                error!(server = %self.label, ?panic, "dispatch pump panicked");
            }
        }
    }

    /// Registers a handler for messages whose payload is a single inline
    /// plain value. The callback runs on the shared background queue.
    pub fn add_plain_handler<T, F>(&self, message_id: i32, handler: F)
    where
        T: Plain + Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let layout = MessageLayout::plain(std::mem::size_of::<T>());
        let handler = Arc::new(handler);
        self.add_handler(MessageHandler::with_layout(
            layout,
            Some(message_id),
            move |message| {
                match Decoder::new(message.plain_data()).decode_plain::<T>() {
                    Ok(value) => {
                        let handler = Arc::clone(&handler);
                        crate::queue::background().submit(move || handler(value));
                    }
                    Err(error) => {
                        debug!(id = message_id, %error, "dropping undecodable plain payload")
                    }
                }
                true
            },
        ));
    }

    /// Registers a handler for messages carrying one out-of-line payload
    /// decoded into `T`. Decode failures are logged and dropped; the
    /// callback runs on the shared background queue.
    pub fn add_codable_handler<T, F>(&self, message_id: i32, handler: F)
    where
        T: Decode + Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let layout = MessageLayout::new(vec![LayoutItem::OutOfLine], 0);
        let handler = Arc::new(handler);
        self.add_handler(MessageHandler::with_layout(
            layout,
            Some(message_id),
            move |message| {
                let data = message.extract_out_of_line(0);
                let handler = Arc::clone(&handler);
                crate::queue::background().submit(move || match decode_value::<T>(&data) {
                    Ok(value) => handler(value),
                    Err(error) => {
                        debug!(id = message_id, %error, "dropping undecodable payload")
                    }
                });
                true
            },
        ));
    }

    /// Registers a request handler: the decoded value plus the reply right
    /// lifted from the request's envelope. The handler owes the remote
    /// caller exactly one send on that right; messages without a reply
    /// right, or with undecodable payloads, are declined.
    pub fn add_codable_handler_with_reply<T, F>(&self, message_id: i32, handler: F)
    where
        T: Decode + Send + 'static,
        F: Fn(T, SendOnceRight) + Send + Sync + 'static,
    {
        let layout = MessageLayout::new(vec![LayoutItem::OutOfLine], 0);
        self.add_handler(MessageHandler::with_layout(
            layout,
            Some(message_id),
            move |message| {
                let Some(reply) = message.extract_reply_send_once_right() else {
                    return false;
                };
                let data = message.extract_out_of_line(0);
                match decode_value::<T>(&data) {
                    Ok(value) => {
                        handler(value, reply);
                        true
                    }
                    Err(_) => false,
                }
            },
        ));
    }

    /// Registers a push handler that acknowledges with an empty reply on
    /// `message_id + REPLY_OFFSET` once the [`AckToken`] is used or dropped.
    pub fn add_codable_handler_with_ack<T, F>(&self, message_id: i32, handler: F)
    where
        T: Decode + Send + 'static,
        F: Fn(T, AckToken) + Send + Sync + 'static,
    {
        self.add_codable_handler_with_reply(message_id, move |value: T, reply| {
            handler(value, AckToken::new(reply, message_id));
        });
    }

    /// Registers a handler for messages carrying a single send right.
    pub fn add_send_right_handler<F>(&self, message_id: i32, handler: F)
    where
        F: Fn(SendRight) + Send + Sync + 'static,
    {
        let layout = MessageLayout::new(vec![LayoutItem::Port], 0);
        self.add_handler(MessageHandler::with_layout(
            layout,
            Some(message_id),
            move |message| match message.extract_send_right(0) {
                Ok(right) => {
                    handler(right);
                    true
                }
                Err(_) => false,
            },
        ));
    }

    /// Registers a handler for messages carrying a single send-once right.
    pub fn add_send_once_handler<F>(&self, message_id: i32, handler: F)
    where
        F: Fn(SendOnceRight) + Send + Sync + 'static,
    {
        let layout = MessageLayout::new(vec![LayoutItem::Port], 0);
        self.add_handler(MessageHandler::with_layout(
            layout,
            Some(message_id),
            move |message| match message.extract_send_once_right(0) {
                Ok(right) => {
                    handler(right);
                    true
                }
                Err(_) => false,
            },
        ));
    }
}

impl Drop for DispatchServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn pump_loop(
    label: &str,
    port: &ReceiveRight,
    handlers: &Mutex<HandlerTable>,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::SeqCst) {
        let max_message_size = lock(handlers)
            .general
            .iter()
            .map(MessageHandler::max_message_size)
            .max();

        let Some(max_message_size) = max_message_size else {
            thread::sleep(POLL_INTERVAL);
            continue;
        };

        match transport::receive_timeout(max_message_size, port, POLL_INTERVAL) {
            Ok(Some(mut message)) => dispatch(label, handlers, &mut message),
            Ok(None) => {}
            Err(error) => {
                error!(server = label, %error, "failed to receive incoming message");
            }
        }
    }
    debug!(server = label, "dispatch pump stopped");
}

fn dispatch(label: &str, handlers: &Mutex<HandlerTable>, message: &mut Message) {
    let mut table = lock(handlers);

    for handler in table.general.iter_mut() {
        if handler.try_handle(message) {
            return;
        }
    }

    if message.id() == NOTIFY_NO_SENDERS {
        if let Some(handler) = table.no_senders.as_mut() {
            if handler.try_handle(message) {
                return;
            }
        }
    }

    warn!(
        server = label,
        id = message.id(),
        "no handler registered for message"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::send;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_until(probe: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !probe() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn first_matching_handler_wins_and_wildcards_catch_the_rest() {
        let mut server = DispatchServer::new("server-test-precedence");
        server.port().publish("server.test.precedence").unwrap();

        let hits_a = Arc::new(AtomicUsize::new(0));
        let hits_b = Arc::new(AtomicUsize::new(0));

        let hits = Arc::clone(&hits_a);
        server.add_handler(MessageHandler::new(1024, Some(5), move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            true
        }));
        let hits = Arc::clone(&hits_b);
        server.add_handler(MessageHandler::new(1024, None, move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            true
        }));
        server.start();

        let right = SendRight::lookup("server.test.precedence").unwrap();
        send(5, Destination::Send(&right), None, Vec::new(), &[]).unwrap();
        wait_until(|| hits_a.load(Ordering::SeqCst) == 1);
        assert_eq!(hits_b.load(Ordering::SeqCst), 0);

        send(9, Destination::Send(&right), None, Vec::new(), &[]).unwrap();
        wait_until(|| hits_b.load(Ordering::SeqCst) == 1);
        assert_eq!(hits_a.load(Ordering::SeqCst), 1);

        server.stop();
    }

    #[test]
    fn unclaimed_messages_do_not_stall_the_pump() {
        let mut server = DispatchServer::new("server-test-unclaimed");
        server.port().publish("server.test.unclaimed").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&hits);
        server.add_handler(MessageHandler::new(1024, Some(7), move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
            true
        }));
        server.start();

        let right = SendRight::lookup("server.test.unclaimed").unwrap();
        // No handler claims id 6; the pump logs, drops, and keeps going.
        send(6, Destination::Send(&right), None, Vec::new(), &[]).unwrap();
        send(7, Destination::Send(&right), None, Vec::new(), &[]).unwrap();

        wait_until(|| hits.load(Ordering::SeqCst) == 1);
        server.stop();
    }

    #[test]
    fn layout_filter_declines_mismatched_shapes() {
        let mut server = DispatchServer::new("server-test-layout");
        server.port().publish("server.test.layout").unwrap();

        let narrow_hits = Arc::new(AtomicUsize::new(0));
        let wide_hits = Arc::new(AtomicUsize::new(0));

        let hits = Arc::clone(&narrow_hits);
        server.add_handler(MessageHandler::with_layout(
            MessageLayout::plain(4),
            Some(1),
            move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                true
            },
        ));
        let hits = Arc::clone(&wide_hits);
        server.add_handler(MessageHandler::new(1024, Some(1), move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            true
        }));
        server.start();

        let right = SendRight::lookup("server.test.layout").unwrap();
        send(1, Destination::Send(&right), None, Vec::new(), &[0u8; 8]).unwrap();

        wait_until(|| wide_hits.load(Ordering::SeqCst) == 1);
        assert_eq!(narrow_hits.load(Ordering::SeqCst), 0);
        server.stop();
    }

    #[test]
    fn plain_handler_decodes_inline_payloads() {
        let mut server = DispatchServer::new("server-test-plain");
        server.port().publish("server.test.plain").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let inner = Arc::clone(&seen);
        server.add_plain_handler::<u64, _>(205, move |value| {
            inner.lock().unwrap().push(value);
        });
        server.start();

        let right = SendRight::lookup("server.test.plain").unwrap();
        send(
            205,
            Destination::Send(&right),
            None,
            Vec::new(),
            &99_u64.to_ne_bytes(),
        )
        .unwrap();

        wait_until(|| *seen.lock().unwrap() == vec![99]);
        server.stop();
    }
}
