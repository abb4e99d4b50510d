//! Insertion-ordered membership list with O(1) removal by handle.
//!
//! Entries live in a slot arena linked front to back. Each slot carries a
//! generation that is bumped on removal, so a handle that outlived its entry
//! is recognised as stale and removing it again is a no-op.

/// Opaque handle returned by [`MemberList::push`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MembershipHandle {
    slot: usize,
    generation: u64,
}

/// Result of a successful removal.
#[derive(Debug)]
pub struct Removed<T> {
    pub value: T,
    /// True if this removal left the list empty.
    pub became_empty: bool,
}

#[derive(Debug)]
struct Node<T> {
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u64,
    node: Option<Node<T>>,
}

/// Doubly linked list of members.
#[derive(Debug)]
pub struct MemberList<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<T> MemberList<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Append a member at the back.
    pub fn push(&mut self, value: T) -> MembershipHandle {
        let node = Node {
            value,
            prev: self.tail,
            next: None,
        };

        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot].node = Some(node);
                slot
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                self.slots.len() - 1
            }
        };

        match self.tail {
            Some(tail) => {
                if let Some(node) = self.slots[tail].node.as_mut() {
                    node.next = Some(slot);
                }
            }
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.len += 1;

        MembershipHandle {
            slot,
            generation: self.slots[slot].generation,
        }
    }

    /// Unlink a member. Returns `None` for a stale handle.
    pub fn remove(&mut self, handle: MembershipHandle) -> Option<Removed<T>> {
        let slot = self.slots.get_mut(handle.slot)?;
        if slot.generation != handle.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation += 1;
        self.free.push(handle.slot);

        match node.prev {
            Some(prev) => {
                if let Some(p) = self.slots[prev].node.as_mut() {
                    p.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => {
                if let Some(n) = self.slots[next].node.as_mut() {
                    n.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }

        self.len -= 1;
        Some(Removed {
            value: node.value,
            became_empty: self.len == 0,
        })
    }

    pub fn get(&self, handle: MembershipHandle) -> Option<&T> {
        let slot = self.slots.get(handle.slot)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.node.as_ref().map(|n| &n.value)
    }

    pub fn contains(&self, handle: MembershipHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate front to back.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }
}

impl<T> Default for MemberList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Front-to-back iterator over a [`MemberList`].
pub struct Iter<'a, T> {
    list: &'a MemberList<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.list.slots.get(self.cursor?)?.node.as_ref()?;
        self.cursor = node.next;
        Some(&node.value)
    }
}

impl<'a, T> IntoIterator for &'a MemberList<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
