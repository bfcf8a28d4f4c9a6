//! Unsolicited notification handlers keyed by line prefix.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::command::{GroupId, Release, ReleaseFn};
use crate::error::{ChatError, ChatResult};
use crate::result::AtResult;
use crate::tombstone::TombstoneList;

/// Identifies a notification registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotifyId(pub u32);

impl fmt::Display for NotifyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "notify#{}", self.0)
    }
}

pub type NotifyFn = Box<dyn FnMut(&AtResult)>;

/// Shared handle to a notification callback. Dispatch clones these out of
/// the registry so callbacks run with no registry borrow held.
pub(crate) type SharedNotifyFn = Rc<RefCell<NotifyFn>>;

pub(crate) struct NotifyNode {
    pub id: NotifyId,
    pub group: GroupId,
    pub callback: SharedNotifyFn,
    on_release: Option<ReleaseFn>,
}

impl NotifyNode {
    pub fn new(id: NotifyId, group: GroupId, callback: NotifyFn, on_release: Option<ReleaseFn>) -> Self {
        NotifyNode {
            id,
            group,
            callback: Rc::new(RefCell::new(callback)),
            on_release,
        }
    }
}

impl Drop for NotifyNode {
    fn drop(&mut self) {
        if let Some(on_release) = self.on_release.take() {
            on_release(Release::Canceled);
        }
    }
}

struct NotifyEntry {
    pdu: bool,
    nodes: TombstoneList<NotifyNode>,
}

/// What an incoming line means to the registry.
pub(crate) enum NotifyMatch {
    /// No live handler is interested.
    None,
    /// A PDU-flagged prefix matched: the line is a header and the next line
    /// carries the payload.
    PduHeader,
    /// Handlers to call with the line, in dispatch order.
    Handlers(Vec<(NotifyId, SharedNotifyFn)>),
}

/// Prefix-keyed notification table.
#[derive(Default)]
pub(crate) struct NotificationRegistry {
    entries: BTreeMap<String, NotifyEntry>,
}

impl NotificationRegistry {
    /// Fail if `prefix` has live handlers registered with the other PDU flag.
    /// Tombstoned handlers awaiting a sweep do not count.
    pub fn check(&self, prefix: &str, pdu: bool) -> ChatResult<()> {
        match self.entries.get(prefix) {
            Some(entry) if entry.pdu != pdu && !entry.nodes.is_empty() => {
                Err(ChatError::PduFlagMismatch {
                    prefix: prefix.to_string(),
                    registered: entry.pdu,
                })
            }
            _ => Ok(()),
        }
    }

    /// Add a handler. Callers run [`check`](Self::check) first.
    pub fn insert(&mut self, prefix: &str, pdu: bool, node: NotifyNode) {
        let entry = self
            .entries
            .entry(prefix.to_string())
            .or_insert_with(|| NotifyEntry {
                pdu,
                nodes: TombstoneList::new(),
            });
        if entry.nodes.is_empty() {
            entry.pdu = pdu;
        }
        entry.nodes.push(node);
    }

    pub fn is_live(&self, id: NotifyId) -> bool {
        self.entries
            .values()
            .any(|e| e.nodes.any_live(|n| n.id == id))
    }

    /// Number of prefixes with at least one live handler.
    pub fn prefix_count(&self) -> usize {
        self.entries.values().filter(|e| !e.nodes.is_empty()).count()
    }

    /// Classify a completed line.
    pub fn matching(&self, line: &str) -> NotifyMatch {
        let mut handlers = Vec::new();

        for (prefix, entry) in &self.entries {
            if !line.starts_with(prefix.as_str()) || entry.nodes.is_empty() {
                continue;
            }

            if entry.pdu {
                return NotifyMatch::PduHeader;
            }

            handlers.extend(entry.nodes.iter().map(|n| (n.id, n.callback.clone())));
        }

        if handlers.is_empty() {
            NotifyMatch::None
        } else {
            NotifyMatch::Handlers(handlers)
        }
    }

    /// PDU handlers interested in a header line.
    pub fn pdu_handlers(&self, header: &str) -> Vec<(NotifyId, SharedNotifyFn)> {
        self.entries
            .iter()
            .filter(|(prefix, entry)| entry.pdu && header.starts_with(prefix.as_str()))
            .flat_map(|(_, entry)| entry.nodes.iter().map(|n| (n.id, n.callback.clone())))
            .collect()
    }

    /// Unregister one handler of `group`.
    ///
    /// With `mark_only` the node is only tombstoned and stays in place until
    /// [`sweep`](Self::sweep). Returns `None` if no live handler with that id
    /// belongs to the group; otherwise the nodes to drop.
    pub fn unregister(&mut self, group: GroupId, id: NotifyId, mark_only: bool) -> Option<Vec<NotifyNode>> {
        let entry = self
            .entries
            .values_mut()
            .find(|e| e.nodes.any_live(|n| n.id == id))?;

        if !entry.nodes.any_live(|n| n.id == id && n.group == group) {
            return None;
        }

        if mark_only {
            entry.nodes.mark_where(|n| n.id == id);
            return Some(Vec::new());
        }

        let removed = entry.nodes.remove_where(|n| n.id == id);
        self.prune();
        Some(removed)
    }

    /// Unregister every handler of `group`.
    pub fn unregister_group(&mut self, group: GroupId, mark_only: bool) -> Vec<NotifyNode> {
        if mark_only {
            for entry in self.entries.values_mut() {
                entry.nodes.mark_where(|n| n.group == group);
            }
            return Vec::new();
        }

        let mut removed = Vec::new();
        for entry in self.entries.values_mut() {
            removed.extend(entry.nodes.remove_where(|n| n.group == group));
        }
        self.prune();
        removed
    }

    /// Drop tombstoned handlers and entries left without handlers.
    pub fn sweep(&mut self) -> Vec<NotifyNode> {
        let mut swept = Vec::new();
        for entry in self.entries.values_mut() {
            swept.extend(entry.nodes.sweep());
        }
        self.prune();
        swept
    }

    pub fn take_all(&mut self) -> Vec<NotifyNode> {
        std::mem::take(&mut self.entries)
            .into_values()
            .flat_map(|mut e| e.nodes.take_all())
            .collect()
    }

    /// Entries keep their dead nodes until the next sweep.
    fn prune(&mut self) {
        self.entries.retain(|_, e| e.nodes.slot_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u32, group: u32, log: &Rc<RefCell<Vec<u32>>>) -> NotifyNode {
        let log = log.clone();
        NotifyNode::new(
            NotifyId(id),
            GroupId(group),
            Box::new(move |_| log.borrow_mut().push(id)),
            None,
        )
    }

    fn call_all(handlers: Vec<(NotifyId, SharedNotifyFn)>, line: &str) {
        let result = AtResult::single(line);
        for (_, cb) in handlers {
            (*cb.borrow_mut())(&result);
        }
    }

    #[test]
    fn test_handlers_in_registration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut reg = NotificationRegistry::default();
        reg.insert("+CREG:", false, node(1, 0, &log));
        reg.insert("+CREG:", false, node(2, 1, &log));

        match reg.matching("+CREG: 0,4") {
            NotifyMatch::Handlers(h) => call_all(h, "+CREG: 0,4"),
            _ => panic!("expected handlers"),
        }
        assert_eq!(*log.borrow(), vec![1, 2]);
        assert!(matches!(reg.matching("+CGREG: 1"), NotifyMatch::None));
    }

    #[test]
    fn test_pdu_mismatch_rejected() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut reg = NotificationRegistry::default();
        reg.insert("+CMT:", true, node(1, 0, &log));

        assert_eq!(
            reg.check("+CMT:", false),
            Err(ChatError::PduFlagMismatch {
                prefix: "+CMT:".into(),
                registered: true
            })
        );
        assert!(reg.check("+CMT:", true).is_ok());
        assert!(matches!(reg.matching("+CMT: ,23"), NotifyMatch::PduHeader));
        assert_eq!(reg.pdu_handlers("+CMT: ,23").len(), 1);
    }

    #[test]
    fn test_tombstoned_prefix_takes_new_pdu_flag() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut reg = NotificationRegistry::default();
        reg.insert("RING", false, node(1, 0, &log));

        reg.unregister(GroupId(0), NotifyId(1), true);
        assert!(reg.check("RING", true).is_ok());

        reg.insert("RING", true, node(2, 0, &log));
        assert!(matches!(reg.matching("RING"), NotifyMatch::PduHeader));
        assert_eq!(reg.pdu_handlers("RING").len(), 1);
        assert!(reg.check("RING", false).is_err());
    }

    #[test]
    fn test_mark_only_defers_removal() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut reg = NotificationRegistry::default();
        reg.insert("+CLIP:", false, node(1, 0, &log));
        reg.insert("+CLIP:", false, node(2, 0, &log));

        let removed = reg.unregister(GroupId(0), NotifyId(1), true);
        assert_eq!(removed.map(|r| r.len()), Some(0));
        assert!(!reg.is_live(NotifyId(1)));
        assert!(reg.unregister(GroupId(0), NotifyId(1), true).is_none());

        assert_eq!(reg.sweep().len(), 1);
        assert_eq!(reg.prefix_count(), 1);
    }

    #[test]
    fn test_unregister_checks_group() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut reg = NotificationRegistry::default();
        reg.insert("RING", false, node(1, 3, &log));

        assert!(reg.unregister(GroupId(4), NotifyId(1), false).is_none());
        assert_eq!(reg.unregister(GroupId(3), NotifyId(1), false).map(|r| r.len()), Some(1));
        assert_eq!(reg.prefix_count(), 0);
        assert!(reg.check("RING", true).is_ok());
    }

    #[test]
    fn test_unregister_group() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut reg = NotificationRegistry::default();
        reg.insert("+CREG:", false, node(1, 1, &log));
        reg.insert("+CREG:", false, node(2, 2, &log));
        reg.insert("RING", false, node(3, 1, &log));

        assert_eq!(reg.unregister_group(GroupId(1), false).len(), 2);
        assert!(reg.is_live(NotifyId(2)));
        assert_eq!(reg.prefix_count(), 1);
    }

    #[test]
    fn test_release_hook_fires_on_drop() {
        let released = Rc::new(RefCell::new(Vec::new()));
        let r = released.clone();
        let mut reg = NotificationRegistry::default();
        reg.insert(
            "RING",
            false,
            NotifyNode::new(
                NotifyId(9),
                GroupId(0),
                Box::new(|_| {}),
                Some(Box::new(move |why| r.borrow_mut().push(why))),
            ),
        );

        let nodes = reg.take_all();
        assert!(released.borrow().is_empty());
        drop(nodes);
        assert_eq!(*released.borrow(), vec![Release::Canceled]);
    }
}
