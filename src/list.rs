//! Index-linked circular lists
//!
//! Ready buckets, wait lists and the timer list all thread their links
//! through the thread arena instead of through pointers. A list is just an
//! `Option<Idx>` head; the nodes carry one `Link` per chain they can be on.
//!
//! Author: Moroya Sakamoto

use crate::config::MAX_THREADS;

/// Arena index of a thread control block
pub(crate) type Idx = u8;

/// Which of a node's link pairs a list uses
///
/// A thread is on at most one run-or-wait list and, independently,
/// on the timer list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Chain {
    /// Priority bucket or wait list
    Run = 0,
    /// Timer list
    Timer = 1,
}

/// Forward and backward neighbours on one chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Link {
    pub next: Idx,
    pub prev: Idx,
}

/// Anything that can sit on the index lists
pub(crate) trait Node {
    fn link(&self, chain: Chain) -> Option<Link>;
    fn set_link(&mut self, chain: Chain, link: Option<Link>);
}

fn link_of<T: Node>(nodes: &[T], idx: Idx, chain: Chain) -> Link {
    match nodes[idx as usize].link(chain) {
        Some(link) => link,
        None => panic!("node {} is not on a {:?} list", idx, chain),
    }
}

fn splice_after<T: Node>(nodes: &mut [T], at: Idx, idx: Idx, chain: Chain) {
    let next = link_of(nodes, at, chain).next;
    nodes[idx as usize].set_link(chain, Some(Link { next, prev: at }));

    let mut before = link_of(nodes, at, chain);
    before.next = idx;
    nodes[at as usize].set_link(chain, Some(before));

    let mut after = link_of(nodes, next, chain);
    after.prev = idx;
    nodes[next as usize].set_link(chain, Some(after));
}

/// Insert `idx` keeping the list ordered
///
/// `ahead(a, b)` says whether `a` must run before `b`. The walk starts at
/// the tail, so entries that compare equal stay in FIFO order.
pub(crate) fn insert<T, F>(nodes: &mut [T], head: &mut Option<Idx>, idx: Idx, chain: Chain, ahead: F)
where
    T: Node,
    F: Fn(&T, &T) -> bool,
{
    assert!(
        nodes[idx as usize].link(chain).is_none(),
        "node {} is already on a {:?} list",
        idx,
        chain
    );

    let h = match *head {
        Some(h) => h,
        None => {
            nodes[idx as usize].set_link(chain, Some(Link { next: idx, prev: idx }));
            *head = Some(idx);
            return;
        }
    };

    let tail = link_of(nodes, h, chain).prev;
    let mut at = tail;
    loop {
        if !ahead(&nodes[idx as usize], &nodes[at as usize]) {
            break;
        }
        if at == h {
            // Outranks everything: new head
            splice_after(nodes, tail, idx, chain);
            *head = Some(idx);
            return;
        }
        at = link_of(nodes, at, chain).prev;
    }
    splice_after(nodes, at, idx, chain);
}

/// Unlink `idx`, moving the head along if it pointed at `idx`
pub(crate) fn remove<T: Node>(nodes: &mut [T], head: &mut Option<Idx>, idx: Idx, chain: Chain) {
    let link = link_of(nodes, idx, chain);
    if link.next == idx {
        assert_eq!(*head, Some(idx), "singleton node {} is not the list head", idx);
        *head = None;
    } else {
        let mut before = link_of(nodes, link.prev, chain);
        before.next = link.next;
        nodes[link.prev as usize].set_link(chain, Some(before));

        let mut after = link_of(nodes, link.next, chain);
        after.prev = link.prev;
        nodes[link.next as usize].set_link(chain, Some(after));

        if *head == Some(idx) {
            *head = Some(link.next);
        }
    }
    nodes[idx as usize].set_link(chain, None);
}

/// Successor of `idx` on `chain`
pub(crate) fn next<T: Node>(nodes: &[T], idx: Idx, chain: Chain) -> Idx {
    link_of(nodes, idx, chain).next
}

/// Copy of a list's members, in order
///
/// Wake paths ready threads while walking a wait list, which unlinks them.
/// Walking a snapshot keeps that safe.
#[derive(Clone)]
pub(crate) struct Snapshot {
    items: [Idx; MAX_THREADS],
    len: usize,
}

impl Snapshot {
    pub(crate) fn of<T: Node>(nodes: &[T], head: Option<Idx>, chain: Chain) -> Self {
        let mut snap = Snapshot {
            items: [0; MAX_THREADS],
            len: 0,
        };
        if let Some(h) = head {
            let mut cursor = h;
            loop {
                assert!(snap.len < MAX_THREADS, "{:?} list does not terminate", chain);
                snap.items[snap.len] = cursor;
                snap.len += 1;
                cursor = next(nodes, cursor, chain);
                if cursor == h {
                    break;
                }
            }
        }
        snap
    }

    pub(crate) fn as_slice(&self) -> &[Idx] {
        &self.items[..self.len]
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Item {
        key: u32,
        links: [Option<Link>; 2],
    }

    impl Node for Item {
        fn link(&self, chain: Chain) -> Option<Link> {
            self.links[chain as usize]
        }
        fn set_link(&mut self, chain: Chain, link: Option<Link>) {
            self.links[chain as usize] = link;
        }
    }

    fn items(keys: &[u32]) -> [Item; 8] {
        let mut out: [Item; 8] = Default::default();
        for (i, k) in keys.iter().enumerate() {
            out[i].key = *k;
        }
        out
    }

    fn higher_first(a: &Item, b: &Item) -> bool {
        a.key > b.key
    }

    fn order(nodes: &[Item], head: Option<Idx>, chain: Chain) -> [Idx; 8] {
        let snap = Snapshot::of(nodes, head, chain);
        let mut out = [u8::MAX; 8];
        out[..snap.len()].copy_from_slice(snap.as_slice());
        out
    }

    #[test]
    fn test_insert_sorted_descending() {
        let mut nodes = items(&[3, 7, 5, 1]);
        let mut head = None;
        for i in 0..4 {
            insert(&mut nodes, &mut head, i, Chain::Run, higher_first);
        }
        assert_eq!(head, Some(1));
        assert_eq!(&order(&nodes, head, Chain::Run)[..4], &[1, 2, 0, 3]);
    }

    #[test]
    fn test_equal_keys_stay_fifo() {
        let mut nodes = items(&[4, 4, 4, 9]);
        let mut head = None;
        for i in 0..4 {
            insert(&mut nodes, &mut head, i, Chain::Run, higher_first);
        }
        assert_eq!(&order(&nodes, head, Chain::Run)[..4], &[3, 0, 1, 2]);
    }

    #[test]
    fn test_remove_head_middle_and_last() {
        let mut nodes = items(&[1, 2, 3]);
        let mut head = None;
        for i in 0..3 {
            insert(&mut nodes, &mut head, i, Chain::Run, |_, _| false);
        }
        remove(&mut nodes, &mut head, 0, Chain::Run);
        assert_eq!(head, Some(1));
        assert_eq!(&order(&nodes, head, Chain::Run)[..2], &[1, 2]);

        remove(&mut nodes, &mut head, 2, Chain::Run);
        assert_eq!(&order(&nodes, head, Chain::Run)[..1], &[1]);

        remove(&mut nodes, &mut head, 1, Chain::Run);
        assert_eq!(head, None);
        assert!(Snapshot::of(&nodes, head, Chain::Run).is_empty());
        assert!(nodes.iter().all(|n| n.links[0].is_none()));
    }

    #[test]
    fn test_chains_are_independent() {
        let mut nodes = items(&[10, 20]);
        let mut run = None;
        let mut timer = None;
        insert(&mut nodes, &mut run, 0, Chain::Run, higher_first);
        insert(&mut nodes, &mut run, 1, Chain::Run, higher_first);
        insert(&mut nodes, &mut timer, 0, Chain::Timer, |a, b| a.key < b.key);
        insert(&mut nodes, &mut timer, 1, Chain::Timer, |a, b| a.key < b.key);
        assert_eq!(run, Some(1));
        assert_eq!(timer, Some(0));

        remove(&mut nodes, &mut run, 1, Chain::Run);
        assert_eq!(Snapshot::of(&nodes, timer, Chain::Timer).len(), 2);
    }

    #[test]
    #[should_panic(expected = "already on")]
    fn test_double_insert_panics() {
        let mut nodes = items(&[1]);
        let mut head = None;
        insert(&mut nodes, &mut head, 0, Chain::Run, higher_first);
        insert(&mut nodes, &mut head, 0, Chain::Run, higher_first);
    }
}
