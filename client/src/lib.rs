//! Client for the Gatelink filtering service.
//!
//! Connecting looks the service up by name, initializes the filter with a
//! mode and rule set, and registers a private listener port on which the
//! service pushes rule changes, asks for access verdicts, and (optionally)
//! streams packet statistics.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use gatelink_common::codec::Decoder;
use gatelink_common::error::IpcError;
use gatelink_common::filter::{Application, FilterMode, PacketBatch, Permission, Rule, RulesUpdate};
use gatelink_common::layout::MessageLayout;
use gatelink_common::protocol::{
    MSG_ACCESS_CHECK, MSG_ENABLE_STATISTICS, MSG_GET_MODE, MSG_INIT_FILTER, MSG_PACKET_BATCH,
    MSG_PING, MSG_REGISTER_LISTENER, MSG_REMOVE_RULE, MSG_RULES_CHANGED, MSG_SET_MODE,
    MSG_UPDATE_RULE, REPLY_OFFSET,
};
use gatelink_common::transport::{self, Destination};
use gatelink_common::{DispatchServer, Item, PortItem, SendRight};

type AccessChecker = Box<dyn Fn(&Application) -> Permission + Send + Sync>;
type RulesCallback = Box<dyn Fn(&RulesUpdate) + Send + Sync>;

/// A connected client of the filtering service.
pub struct FilterClient {
    port: SendRight,
    listener: DispatchServer,
    statistics: Option<DispatchServer>,
    mode: Arc<AtomicI32>,
    access_checker: Arc<Mutex<Option<AccessChecker>>>,
    rules_callback: Arc<Mutex<Option<RulesCallback>>>,
}

impl FilterClient {
    /// Looks up the service, initializes the filter with `mode` and
    /// `rules`, and registers the listener port for pushes.
    ///
    /// Rule ids are service-assigned; whatever ids the caller passes are
    /// cleared before the rules are submitted.
    pub fn connect(
        service_name: &str,
        mode: FilterMode,
        rules: Vec<Rule>,
    ) -> Result<FilterClient, IpcError> {
        let port = SendRight::lookup(service_name)?;

        let rules: Vec<Rule> = rules
            .into_iter()
            .map(|mut rule| {
                rule.id = 0;
                rule
            })
            .collect();

        transport::send_with_empty_reply(
            MSG_INIT_FILTER,
            &port,
            vec![Item::encodable(&rules)],
            &(mode as i32).to_ne_bytes(),
        )
        .wait()?;
        info!(service = service_name, ?mode, rules = rules.len(), "filter initialized");

        let mode = Arc::new(AtomicI32::new(mode as i32));
        let access_checker: Arc<Mutex<Option<AccessChecker>>> = Arc::new(Mutex::new(None));
        let rules_callback: Arc<Mutex<Option<RulesCallback>>> = Arc::new(Mutex::new(None));

        let mut listener = DispatchServer::new("gatelink-client-listener");

        let checker = Arc::clone(&access_checker);
        let fallback_mode = Arc::clone(&mode);
        listener.add_codable_handler_with_reply::<Application, _>(
            MSG_ACCESS_CHECK,
            move |application, reply| {
                let permission = match lock(&checker).as_ref() {
                    Some(checker) => checker(&application),
                    // Nobody to ask: fall back to what the mode would do for
                    // an unknown application, but never leave the service's
                    // pending wait without an answer.
                    None => FilterMode::from_raw(fallback_mode.load(Ordering::SeqCst))
                        .map(FilterMode::default_permission)
                        .unwrap_or(Permission::Deny),
                };
                debug!(path = %application.path, ?permission, "answering access check");
                if let Err(error) = transport::send(
                    MSG_ACCESS_CHECK + REPLY_OFFSET,
                    Destination::MoveSendOnce(reply),
                    None,
                    Vec::new(),
                    &(permission as i32).to_ne_bytes(),
                ) {
                    warn!(%error, "failed to answer access check");
                }
            },
        );

        let callback = Arc::clone(&rules_callback);
        listener.add_codable_handler_with_ack::<RulesUpdate, _>(
            MSG_RULES_CHANGED,
            move |update, ack| {
                if let Some(callback) = lock(&callback).as_ref() {
                    callback(&update);
                }
                ack.ack();
            },
        );

        listener.start();

        transport::send(
            MSG_REGISTER_LISTENER,
            Destination::Send(&port),
            None,
            vec![Item::Port(PortItem::MakeSend(listener.port()))],
            &[],
        )?;

        Ok(FilterClient {
            port,
            listener,
            statistics: None,
            mode,
            access_checker,
            rules_callback,
        })
    }

    /// Installs the callback answering the service's access checks.
    pub fn on_access_check<F>(&self, checker: F)
    where
        F: Fn(&Application) -> Permission + Send + Sync + 'static,
    {
        *lock(&self.access_checker) = Some(Box::new(checker));
    }

    /// Installs the callback observing pushed rule changes.
    pub fn on_rules_changed<F>(&self, callback: F)
    where
        F: Fn(&RulesUpdate) + Send + Sync + 'static,
    {
        *lock(&self.rules_callback) = Some(Box::new(callback));
    }

    /// Round-trips an empty request to confirm the service is alive.
    pub fn ping(&self) -> Result<(), IpcError> {
        transport::send_with_empty_reply(MSG_PING, &self.port, Vec::new(), &[]).wait()
    }

    /// Fire-and-forget mode change.
    pub fn set_mode(&self, mode: FilterMode) -> Result<(), IpcError> {
        transport::send(
            MSG_SET_MODE,
            Destination::Send(&self.port),
            None,
            Vec::new(),
            &(mode as i32).to_ne_bytes(),
        )?;
        self.mode.store(mode as i32, Ordering::SeqCst);
        Ok(())
    }

    /// Queries the service for its current mode.
    pub fn mode(&self) -> Result<FilterMode, IpcError> {
        let reply = transport::send_with_reply_raw(
            MSG_GET_MODE,
            &self.port,
            Vec::new(),
            &[],
            MessageLayout::plain(4),
        )
        .wait()?;
        let raw = Decoder::new(reply.plain_data()).decode_i32()?;
        let mode = FilterMode::from_raw(raw)
            .ok_or(gatelink_common::DecodeError::InvalidValue("filter mode"))?;
        self.mode.store(mode as i32, Ordering::SeqCst);
        Ok(mode)
    }

    /// Submits a new or changed rule; the service assigns the id and pushes
    /// the resulting change back through the listener.
    pub fn update_rule(&self, rule: &Rule) -> Result<(), IpcError> {
        transport::send(
            MSG_UPDATE_RULE,
            Destination::Send(&self.port),
            None,
            vec![Item::encodable(rule)],
            &[],
        )?;
        Ok(())
    }

    pub fn remove_rule(&self, id: u64) -> Result<(), IpcError> {
        transport::send(
            MSG_REMOVE_RULE,
            Destination::Send(&self.port),
            None,
            Vec::new(),
            &id.to_ne_bytes(),
        )?;
        Ok(())
    }

    /// Adds a rule for `path` with the permission the current mode implies.
    pub fn add_rule_for_application(&self, path: &str) -> Result<(), IpcError> {
        let permission = FilterMode::from_raw(self.mode.load(Ordering::SeqCst))
            .map(FilterMode::default_permission)
            .unwrap_or(Permission::Deny);
        self.update_rule(&Rule {
            id: 0,
            permission,
            application: Application::new(path),
            last_access: None,
            access_count: 0,
        })
    }

    /// Whether a statistics stream is currently attached.
    pub fn statistics_enabled(&self) -> bool {
        self.statistics.is_some()
    }

    /// Opens the statistics stream: a private port on which the service
    /// pushes packet batches, acknowledged one by one.
    pub fn enable_statistics<F>(&mut self, flow_bytes: u32, callback: F) -> Result<(), IpcError>
    where
        F: Fn(&PacketBatch) + Send + Sync + 'static,
    {
        if self.statistics.is_some() {
            return Ok(());
        }

        let mut server = DispatchServer::new("gatelink-client-statistics");
        server.add_codable_handler_with_ack::<PacketBatch, _>(
            MSG_PACKET_BATCH,
            move |batch, ack| {
                callback(&batch);
                ack.ack();
            },
        );
        server.start();

        transport::send(
            MSG_ENABLE_STATISTICS,
            Destination::Send(&self.port),
            None,
            vec![Item::Port(PortItem::MakeSend(server.port()))],
            &flow_bytes.to_ne_bytes(),
        )?;

        self.statistics = Some(server);
        Ok(())
    }

    /// Tears the statistics stream down; the service's send right to it
    /// goes dead and further pushes fail on its side.
    pub fn disable_statistics(&mut self) {
        if let Some(mut server) = self.statistics.take() {
            server.stop();
        }
    }

    /// The listener port the service pushes to; exposed for tests and
    /// diagnostics.
    pub fn listener(&self) -> &DispatchServer {
        &self.listener
    }
}

impl Drop for FilterClient {
    fn drop(&mut self) {
        self.disable_statistics();
        self.listener.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
