//! Gatelink filtering service.
//!
//! The service side of the filtering protocol: it owns the rule store and
//! filter mode, answers every service-bound message id, pushes rule changes
//! and packet batches to the client's registered listener port, and asks the
//! listener for a verdict when an unknown application needs one.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use gatelink_common::codec::{decode_value, Decoder};
use gatelink_common::error::{status, IpcError, LookupError, SendError};
use gatelink_common::filter::{Application, FilterMode, PacketBatch, Permission, Rule, RulesUpdate};
use gatelink_common::layout::{LayoutItem, MessageLayout};
use gatelink_common::protocol::{
    MSG_ACCESS_CHECK, MSG_ENABLE_STATISTICS, MSG_GET_MODE, MSG_INIT_FILTER, MSG_PACKET_BATCH,
    MSG_PING, MSG_REGISTER_LISTENER, MSG_REMOVE_RULE, MSG_RULES_CHANGED, MSG_SET_MODE,
    MSG_UPDATE_RULE, REPLY_OFFSET,
};
use gatelink_common::transport::{self, Destination};
use gatelink_common::{DispatchServer, Item, MessageHandler, Promise, SendRight};

pub mod rules;

use rules::RuleStore;

/// Application-level status code for an undecodable or out-of-range request.
pub const ERR_INVALID_ARGUMENT: i32 = 22;

struct StatisticsStream {
    port: SendRight,
    flow_bytes: u32,
}

struct ServiceState {
    mode: FilterMode,
    rules: RuleStore,
    listener: Option<SendRight>,
    statistics: Option<StatisticsStream>,
}

impl ServiceState {
    fn push_rules_update(&self, update: &RulesUpdate) {
        let Some(listener) = &self.listener else {
            debug!("no listener registered; dropping rules update");
            return;
        };
        transport::send_with_reply_raw(
            MSG_RULES_CHANGED,
            listener,
            vec![Item::encodable(update)],
            &[],
            MessageLayout::plain(0),
        )
        .handle(|result| {
            if let Err(error) = result {
                warn!(%error, "rules update push was not acknowledged");
            }
        });
    }
}

/// The filtering service endpoint.
///
/// Owns a dispatch server registered under a well-known name and the mutable
/// filter state behind it. All handler work is serialized on the server's
/// pump; pushes and access checks run their blocking halves on promise
/// threads.
pub struct FilterService {
    server: DispatchServer,
    state: Arc<Mutex<ServiceState>>,
}

impl FilterService {
    /// Creates the service and publishes it under `service_name`.
    pub fn new(service_name: &str) -> Result<FilterService, LookupError> {
        let server = DispatchServer::new("gatelink-filter-service");
        server.port().publish(service_name)?;

        let state = Arc::new(Mutex::new(ServiceState {
            mode: FilterMode::UnknownAllow,
            rules: RuleStore::new(),
            listener: None,
            statistics: None,
        }));

        let service = FilterService { server, state };
        service.install_handlers();
        info!(service = service_name, "filtering service registered");
        Ok(service)
    }

    /// Starts pumping messages.
    pub fn start(&mut self) {
        self.server.start();
    }

    /// Stops the pump; a handler already running finishes first.
    pub fn stop(&mut self) {
        self.server.stop();
    }

    pub fn mode(&self) -> FilterMode {
        lock(&self.state).mode
    }

    pub fn rules(&self) -> Vec<Rule> {
        lock(&self.state).rules.rules()
    }

    /// Asks the registered listener for a verdict on `application`,
    /// recording the access on the covering rule once it answers.
    pub fn check_access(&self, application: &Application) -> Promise<Permission> {
        let reply = {
            let state = lock(&self.state);
            let Some(listener) = &state.listener else {
                return Promise::fulfilled(Err(IpcError::Send(SendError::Transport(
                    status::INVALID_DEST,
                ))));
            };
            transport::send_with_reply_raw(
                MSG_ACCESS_CHECK,
                listener,
                vec![Item::encodable(application)],
                &[],
                MessageLayout::plain(4),
            )
        };

        let state = Arc::clone(&self.state);
        let application = application.clone();
        reply.then(move |reply| {
            let raw = Decoder::new(reply.plain_data()).decode_i32()?;
            let permission = Permission::from_raw(raw)
                .ok_or(gatelink_common::DecodeError::InvalidValue("permission"))?;
            lock(&state).rules.record_access(&application, unix_now());
            Ok(permission)
        })
    }

    /// Pushes one packet batch over the statistics stream, when enabled.
    pub fn push_packets(&self, batch: &PacketBatch) -> Promise<()> {
        let state = lock(&self.state);
        let Some(stream) = &state.statistics else {
            return Promise::fulfilled(Err(IpcError::Send(SendError::Transport(
                status::INVALID_DEST,
            ))));
        };
        transport::send_with_reply_raw(
            MSG_PACKET_BATCH,
            &stream.port,
            vec![Item::encodable(batch)],
            &[],
            MessageLayout::plain(0),
        )
        .then(|_| Ok(()))
    }

    /// Per-flow byte budget of the statistics stream, when one is attached.
    pub fn statistics_flow_bytes(&self) -> Option<u32> {
        lock(&self.state).statistics.as_ref().map(|s| s.flow_bytes)
    }

    /// Whether a client listener port has been registered.
    pub fn has_listener(&self) -> bool {
        lock(&self.state).listener.is_some()
    }

    fn install_handlers(&self) {
        self.add_ping_handler();
        self.add_init_handler();
        self.add_register_listener_handler();
        self.add_mode_handlers();
        self.add_rule_handlers();
        self.add_statistics_handler();
    }

    fn add_ping_handler(&self) {
        self.server.add_handler(MessageHandler::with_layout(
            MessageLayout::plain(0),
            Some(MSG_PING),
            move |message| {
                let Some(reply) = message.extract_reply_send_once_right() else {
                    return false;
                };
                if let Err(error) = transport::send(
                    MSG_PING + REPLY_OFFSET,
                    Destination::MoveSendOnce(reply),
                    None,
                    Vec::new(),
                    &[],
                ) {
                    warn!(%error, "failed to answer ping");
                }
                true
            },
        ));
    }

    fn add_init_handler(&self) {
        let state = Arc::clone(&self.state);
        self.server.add_handler(MessageHandler::with_layout(
            MessageLayout::new(vec![LayoutItem::OutOfLine], 4),
            Some(MSG_INIT_FILTER),
            move |message| {
                let Some(reply) = message.extract_reply_send_once_right() else {
                    return false;
                };
                let reply_id = MSG_INIT_FILTER + REPLY_OFFSET;

                let mode = Decoder::new(message.plain_data())
                    .decode_i32()
                    .ok()
                    .and_then(FilterMode::from_raw);
                let rules = decode_value::<Vec<Rule>>(&message.extract_out_of_line(0));

                let result = match (mode, rules) {
                    (Some(mode), Ok(rules)) => {
                        let mut state = lock(&state);
                        state.mode = mode;
                        let installed = state.rules.install(rules);
                        info!(rules = installed.len(), ?mode, "filter initialized");
                        transport::send(
                            reply_id,
                            Destination::MoveSendOnce(reply),
                            None,
                            Vec::new(),
                            &[],
                        )
                    }
                    _ => {
                        warn!("rejecting malformed filter initialization");
                        transport::send_error_reply(
                            reply_id,
                            reply,
                            ERR_INVALID_ARGUMENT,
                            &MessageLayout::plain(0),
                        )
                    }
                };
                if let Err(error) = result {
                    warn!(%error, "failed to answer filter initialization");
                }
                true
            },
        ));
    }

    fn add_register_listener_handler(&self) {
        let state = Arc::clone(&self.state);
        self.server
            .add_send_right_handler(MSG_REGISTER_LISTENER, move |right| {
                info!(port = right.name(), "listener registered");
                lock(&state).listener = Some(right);
            });
    }

    fn add_mode_handlers(&self) {
        let state = Arc::clone(&self.state);
        self.server
            .add_plain_handler::<i32, _>(MSG_SET_MODE, move |raw| match FilterMode::from_raw(raw) {
                Some(mode) => {
                    info!(?mode, "filter mode changed");
                    lock(&state).mode = mode;
                }
                None => warn!(raw, "ignoring unknown filter mode"),
            });

        let state = Arc::clone(&self.state);
        self.server.add_handler(MessageHandler::with_layout(
            MessageLayout::plain(0),
            Some(MSG_GET_MODE),
            move |message| {
                let Some(reply) = message.extract_reply_send_once_right() else {
                    return false;
                };
                let mode = lock(&state).mode;
                if let Err(error) = transport::send(
                    MSG_GET_MODE + REPLY_OFFSET,
                    Destination::MoveSendOnce(reply),
                    None,
                    Vec::new(),
                    &(mode as i32).to_ne_bytes(),
                ) {
                    warn!(%error, "failed to answer mode query");
                }
                true
            },
        ));
    }

    fn add_rule_handlers(&self) {
        let state = Arc::clone(&self.state);
        self.server
            .add_codable_handler::<Rule, _>(MSG_UPDATE_RULE, move |rule| {
                let mut state = lock(&state);
                let installed = state.rules.upsert(rule);
                debug!(id = installed.id, path = %installed.application.path, "rule updated");
                state.push_rules_update(&RulesUpdate::Partial {
                    updated: vec![installed],
                    removed: Vec::new(),
                });
            });

        let state = Arc::clone(&self.state);
        self.server
            .add_plain_handler::<u64, _>(MSG_REMOVE_RULE, move |id| {
                let mut state = lock(&state);
                if state.rules.remove(id).is_some() {
                    debug!(id, "rule removed");
                    state.push_rules_update(&RulesUpdate::Partial {
                        updated: Vec::new(),
                        removed: vec![id],
                    });
                } else {
                    warn!(id, "ignoring removal of unknown rule");
                }
            });
    }

    fn add_statistics_handler(&self) {
        let state = Arc::clone(&self.state);
        self.server.add_handler(MessageHandler::with_layout(
            MessageLayout::new(vec![LayoutItem::Port], 4),
            Some(MSG_ENABLE_STATISTICS),
            move |message| {
                let flow_bytes = match Decoder::new(message.plain_data()).decode_plain::<u32>() {
                    Ok(value) => value,
                    Err(_) => return false,
                };
                let Ok(port) = message.extract_send_right(0) else {
                    return false;
                };
                info!(flow_bytes, "statistics stream enabled");
                lock(&state).statistics = Some(StatisticsStream { port, flow_bytes });
                true
            },
        ));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
