//! Message-id space of the filtering protocol.
//!
//! Requests carry small positive ids; the matching reply id is always
//! `request + REPLY_OFFSET`. Both sides of the connection dispatch on these
//! constants, so this module is the single source of truth for them.
//!
//! | id  | direction          | meaning                            |
//! |-----|--------------------|------------------------------------|
//! | 200 | client → service   | register listener port             |
//! | 201 | client → service   | set filter mode (fire-and-forget)  |
//! | 202 | client → service   | get filter mode (reply 302)        |
//! | 202 | service → listener | packet batch (ack 302)             |
//! | 203 | service → listener | access check (reply 303)           |
//! | 204 | client → service   | update rule (fire-and-forget)      |
//! | 204 | service → listener | rules changed push (ack 304)       |
//! | 205 | client → service   | remove rule (fire-and-forget)      |
//! | 250 | client → service   | ping (reply 350)                   |
//! | 251 | client → service   | initialize filter (reply 351)      |
//! | 252 | client → service   | enable statistics stream           |

/// Fixed difference between a request id and its reply id.
pub const REPLY_OFFSET: i32 = 100;

/// Reserved id of the no-senders notification the port layer enqueues when
/// a port's last send right goes away.
pub const NOTIFY_NO_SENDERS: i32 = 70;

pub const MSG_REGISTER_LISTENER: i32 = 200;
pub const MSG_SET_MODE: i32 = 201;
pub const MSG_GET_MODE: i32 = 202;
pub const MSG_PACKET_BATCH: i32 = 202;
pub const MSG_ACCESS_CHECK: i32 = 203;
pub const MSG_UPDATE_RULE: i32 = 204;
pub const MSG_RULES_CHANGED: i32 = 204;
pub const MSG_REMOVE_RULE: i32 = 205;
pub const MSG_PING: i32 = 250;
pub const MSG_INIT_FILTER: i32 = 251;
pub const MSG_ENABLE_STATISTICS: i32 = 252;
