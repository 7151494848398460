//! In-memory rule store.

use std::collections::BTreeMap;

use gatelink_common::filter::{Application, Rule};

/// Rules keyed by their service-assigned id.
///
/// Incoming rules with id zero are matched to an existing rule for the same
/// application or assigned a fresh id.
#[derive(Default)]
pub struct RuleStore {
    rules: BTreeMap<u64, Rule>,
    next_id: u64,
}

impl RuleStore {
    pub fn new() -> RuleStore {
        RuleStore::default()
    }

    /// Replaces the whole rule set, assigning fresh ids throughout.
    pub fn install(&mut self, rules: Vec<Rule>) -> Vec<Rule> {
        self.rules.clear();
        self.next_id = 0;
        rules.into_iter().map(|rule| self.upsert(rule)).collect()
    }

    /// Inserts or updates one rule, returning it with its final id.
    pub fn upsert(&mut self, mut rule: Rule) -> Rule {
        if rule.id == 0 {
            rule.id = match self.find_by_application(&rule.application) {
                Some(existing) => existing,
                None => {
                    self.next_id += 1;
                    self.next_id
                }
            };
        } else {
            self.next_id = self.next_id.max(rule.id);
        }
        self.rules.insert(rule.id, rule.clone());
        rule
    }

    pub fn remove(&mut self, id: u64) -> Option<Rule> {
        self.rules.remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<&Rule> {
        self.rules.get(&id)
    }

    /// Stamps an access on the rule covering `application`, when one exists.
    pub fn record_access(&mut self, application: &Application, timestamp: i64) -> Option<Rule> {
        let id = self.find_by_application(application)?;
        let rule = self.rules.get_mut(&id)?;
        rule.access_count += 1;
        rule.last_access = Some(timestamp);
        Some(rule.clone())
    }

    /// All rules, ordered by id.
    pub fn rules(&self) -> Vec<Rule> {
        self.rules.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn find_by_application(&self, application: &Application) -> Option<u64> {
        self.rules
            .values()
            .find(|rule| rule.application == *application)
            .map(|rule| rule.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatelink_common::filter::Permission;

    fn rule(id: u64, path: &str) -> Rule {
        Rule {
            id,
            permission: Permission::Allow,
            application: Application::new(path),
            last_access: None,
            access_count: 0,
        }
    }

    #[test]
    fn zero_id_rules_get_fresh_ids() {
        let mut store = RuleStore::new();
        let a = store.upsert(rule(0, "/bin/a"));
        let b = store.upsert(rule(0, "/bin/b"));
        assert_ne!(a.id, 0);
        assert_ne!(b.id, 0);
        assert_ne!(a.id, b.id);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn zero_id_rule_for_a_known_application_updates_in_place() {
        let mut store = RuleStore::new();
        let first = store.upsert(rule(0, "/bin/a"));

        let mut replacement = rule(0, "/bin/a");
        replacement.permission = Permission::Deny;
        let second = store.upsert(replacement);

        assert_eq!(first.id, second.id);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(first.id).unwrap().permission, Permission::Deny);
    }

    #[test]
    fn install_resets_and_renumbers() {
        let mut store = RuleStore::new();
        store.upsert(rule(0, "/bin/old"));

        let installed = store.install(vec![rule(0, "/bin/a"), rule(0, "/bin/b")]);
        assert_eq!(installed.len(), 2);
        assert_eq!(store.len(), 2);
        assert!(store
            .rules()
            .iter()
            .all(|rule| rule.application.path != "/bin/old"));
    }

    #[test]
    fn record_access_bumps_count_and_timestamp() {
        let mut store = RuleStore::new();
        let installed = store.upsert(rule(0, "/bin/a"));

        let stamped = store
            .record_access(&Application::new("/bin/a"), 1_700_000_000)
            .unwrap();
        assert_eq!(stamped.id, installed.id);
        assert_eq!(stamped.access_count, 1);
        assert_eq!(stamped.last_access, Some(1_700_000_000));

        assert!(store
            .record_access(&Application::new("/bin/unknown"), 0)
            .is_none());
    }
}
