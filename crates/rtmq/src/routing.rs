use std::collections::{HashMap, HashSet};

/// Where a node's live connection is homed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct NodeRoute {
    pub tidx: usize,
    pub cid: u64,
}

/// node-id → owning receive server. Written by rsvrs on AUTH/disconnect,
/// read by the distributor on the hot path; the RwLock makes each update
/// visible atomically, a reader never observes a half-written route.
#[derive(Default)]
pub(crate) struct NodeMap {
    inner: spin::RwLock<HashMap<u32, NodeRoute>>,
}

impl NodeMap {
    /// Binds `node` to `route`, returning the displaced route if the node
    /// was already connected elsewhere (the caller kicks the stale conn).
    pub fn bind(&self, node: u32, route: NodeRoute) -> Option<NodeRoute> {
        self.inner.write().insert(node, route)
    }

    /// Removes the binding only if it still points at `route`; a stale
    /// connection closing must not unbind its replacement.
    pub fn unbind_if(&self, node: u32, route: NodeRoute) -> bool {
        let mut map = self.inner.write();
        if map.get(&node) == Some(&route) {
            map.remove(&node);
            true
        } else {
            false
        }
    }

    pub fn resolve(&self, node: u32) -> Option<NodeRoute> {
        self.inner.read().get(&node).copied()
    }
}

/// message-type → subscribed node-ids, maintained by SUB/UNSUB control
/// frames and consulted for `dest == 0` fanout.
#[derive(Default)]
pub(crate) struct SubTable {
    inner: spin::RwLock<HashMap<u16, HashSet<u32>>>,
}

impl SubTable {
    pub fn subscribe(&self, msg_type: u16, node: u32) {
        self.inner.write().entry(msg_type).or_default().insert(node);
    }

    pub fn unsubscribe(&self, msg_type: u16, node: u32) {
        let mut map = self.inner.write();
        if let Some(set) = map.get_mut(&msg_type) {
            set.remove(&node);
            if set.is_empty() {
                map.remove(&msg_type);
            }
        }
    }

    /// Copies the subscriber set out so the fanout loop runs unlocked.
    pub fn subscribers(&self, msg_type: u16) -> Vec<u32> {
        self.inner
            .read()
            .get(&msg_type)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bind_replaces_and_reports_stale() {
        let map = NodeMap::default();
        let first = NodeRoute { tidx: 0, cid: 1 };
        let second = NodeRoute { tidx: 1, cid: 9 };

        assert_eq!(map.bind(17, first), None);
        // One live route per node: rebinding surfaces the old one.
        assert_eq!(map.bind(17, second), Some(first));
        assert_eq!(map.resolve(17), Some(second));
    }

    #[test]
    fn stale_unbind_is_ignored() {
        let map = NodeMap::default();
        let first = NodeRoute { tidx: 0, cid: 1 };
        let second = NodeRoute { tidx: 1, cid: 9 };
        map.bind(17, first);
        map.bind(17, second);

        assert!(!map.unbind_if(17, first));
        assert_eq!(map.resolve(17), Some(second));
        assert!(map.unbind_if(17, second));
        assert_eq!(map.resolve(17), None);
    }

    #[test]
    fn subscribe_is_idempotent() {
        let subs = SubTable::default();
        subs.subscribe(42, 17);
        subs.subscribe(42, 17);
        assert_eq!(subs.subscribers(42), vec![17]);

        // Unsubscribing a non-subscriber is a no-op.
        subs.unsubscribe(42, 99);
        assert_eq!(subs.subscribers(42), vec![17]);

        subs.unsubscribe(42, 17);
        assert!(subs.subscribers(42).is_empty());
    }

    #[test]
    fn fanout_set_per_type() {
        let subs = SubTable::default();
        subs.subscribe(42, 17);
        subs.subscribe(42, 18);
        subs.subscribe(43, 19);
        let mut got = subs.subscribers(42);
        got.sort_unstable();
        assert_eq!(got, vec![17, 18]);
    }
}
