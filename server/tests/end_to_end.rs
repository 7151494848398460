//! Full client/service round trips over the real port substrate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use gatelink_client::FilterClient;
use gatelink_common::error::{IpcError, ReceiveError};
use gatelink_common::filter::{
    Application, FilterMode, PacketBatch, PacketInfo, Permission, Rule, RulesUpdate,
    DIRECTION_OUTGOING,
};
use gatelink_common::protocol::MSG_INIT_FILTER;
use gatelink_common::transport;
use gatelink_common::{Item, SendRight};
use gatelink_server::{FilterService, ERR_INVALID_ARGUMENT};

fn wait_until(probe: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !probe() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

fn rule_for(path: &str, permission: Permission) -> Rule {
    Rule {
        id: 0,
        permission,
        application: Application::new(path),
        last_access: None,
        access_count: 0,
    }
}

#[test]
fn initialization_installs_mode_and_rules() {
    let mut service = FilterService::new("e2e.init").unwrap();
    service.start();

    let client = FilterClient::connect(
        "e2e.init",
        FilterMode::UnknownDeny,
        vec![
            rule_for("/bin/ls", Permission::Allow),
            rule_for("/usr/bin/curl", Permission::Deny),
        ],
    )
    .unwrap();

    client.ping().unwrap();
    assert_eq!(service.mode(), FilterMode::UnknownDeny);

    let rules = service.rules();
    assert_eq!(rules.len(), 2);
    assert!(rules.iter().all(|rule| rule.id != 0));

    assert_eq!(client.mode().unwrap(), FilterMode::UnknownDeny);

    client.set_mode(FilterMode::Wait).unwrap();
    wait_until(|| service.mode() == FilterMode::Wait);

    service.stop();
}

#[test]
fn malformed_initialization_is_answered_with_the_error_shape() {
    let mut service = FilterService::new("e2e.bad-init").unwrap();
    service.start();

    let port = SendRight::lookup("e2e.bad-init").unwrap();
    let result = transport::send_with_empty_reply(
        MSG_INIT_FILTER,
        &port,
        vec![Item::OutOfLine(vec![0xff; 6])],
        &99_i32.to_ne_bytes(),
    )
    .wait();

    assert_eq!(
        result,
        Err(IpcError::Receive(ReceiveError::Remote(ERR_INVALID_ARGUMENT)))
    );

    service.stop();
}

#[test]
fn rule_changes_are_pushed_to_the_listener() {
    let mut service = FilterService::new("e2e.pushes").unwrap();
    service.start();

    let client = FilterClient::connect("e2e.pushes", FilterMode::UnknownAllow, Vec::new()).unwrap();

    let updates: Arc<Mutex<Vec<RulesUpdate>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&updates);
    client.on_rules_changed(move |update| {
        seen.lock().unwrap().push(update.clone());
    });
    wait_until(|| service.has_listener());

    client
        .update_rule(&rule_for("/opt/tool", Permission::Deny))
        .unwrap();
    wait_until(|| !updates.lock().unwrap().is_empty());

    let pushed = updates.lock().unwrap().remove(0);
    let RulesUpdate::Partial { updated, removed } = pushed else {
        panic!("expected a partial update");
    };
    assert_eq!(removed, Vec::<u64>::new());
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].application.path, "/opt/tool");
    let id = updated[0].id;
    assert_ne!(id, 0);

    client.remove_rule(id).unwrap();
    wait_until(|| !updates.lock().unwrap().is_empty());
    let pushed = updates.lock().unwrap().remove(0);
    assert_eq!(
        pushed,
        RulesUpdate::Partial {
            updated: Vec::new(),
            removed: vec![id],
        }
    );
    assert!(service.rules().is_empty());

    service.stop();
}

#[test]
fn access_checks_round_trip_and_record_the_access() {
    let mut service = FilterService::new("e2e.access").unwrap();
    service.start();

    let client = FilterClient::connect(
        "e2e.access",
        FilterMode::Wait,
        vec![rule_for("/bin/ls", Permission::Allow)],
    )
    .unwrap();
    wait_until(|| service.has_listener());

    let asked = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&asked);
    client.on_access_check(move |application| {
        inner.fetch_add(1, Ordering::SeqCst);
        if application.path.contains("malware") {
            Permission::Deny
        } else {
            Permission::Allow
        }
    });

    assert_eq!(
        service
            .check_access(&Application::new("/bin/ls"))
            .wait()
            .unwrap(),
        Permission::Allow
    );
    assert_eq!(
        service
            .check_access(&Application::new("/tmp/malware"))
            .wait()
            .unwrap(),
        Permission::Deny
    );
    assert_eq!(asked.load(Ordering::SeqCst), 2);

    // The rule covering /bin/ls saw one access.
    let rules = service.rules();
    let rule = rules
        .iter()
        .find(|rule| rule.application.path == "/bin/ls")
        .unwrap();
    assert_eq!(rule.access_count, 1);
    assert!(rule.last_access.is_some());

    service.stop();
}

#[test]
fn unanswered_checks_fall_back_to_the_mode_default() {
    let mut service = FilterService::new("e2e.access-default").unwrap();
    service.start();

    let _client =
        FilterClient::connect("e2e.access-default", FilterMode::UnknownDeny, Vec::new()).unwrap();
    wait_until(|| service.has_listener());

    // No checker installed: the client answers with the mode default.
    assert_eq!(
        service
            .check_access(&Application::new("/bin/true"))
            .wait()
            .unwrap(),
        Permission::Deny
    );

    service.stop();
}

#[test]
fn statistics_batches_flow_to_the_client() {
    let mut service = FilterService::new("e2e.stats").unwrap();
    service.start();

    let mut client =
        FilterClient::connect("e2e.stats", FilterMode::UnknownAllow, Vec::new()).unwrap();

    let batches: Arc<Mutex<Vec<PacketBatch>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&batches);
    client
        .enable_statistics(0x1000, move |batch| {
            seen.lock().unwrap().push(batch.clone());
        })
        .unwrap();
    wait_until(|| service.statistics_flow_bytes() == Some(0x1000));

    let batch = PacketBatch {
        entries: vec![(
            Application::new("/usr/bin/ssh"),
            vec![PacketInfo {
                size: 512,
                direction: DIRECTION_OUTGOING,
                timestamp: 1_700_000_000,
            }],
        )],
    };
    service.push_packets(&batch).wait().unwrap();

    wait_until(|| !batches.lock().unwrap().is_empty());
    assert_eq!(batches.lock().unwrap()[0], batch);

    client.disable_statistics();
    service.stop();
}
