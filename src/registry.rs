// Copyright (c) 2026 The Aioli developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Connection bookkeeping for one worker.
//!
//! Connections live in an arena of slots addressed by stable indices; list
//! membership is expressed with per-role `Links { prev, next }` fields on the
//! slot rather than separately allocated nodes. Every connection sits in
//! exactly one of the `all`/`to_clean` lists, optionally in one timeout list
//! (the shared-default one, FIFO in last-activity order, or the
//! custom-deadline one, scanned in full), and optionally in the per-cycle
//! ready list.

use crate::connection::Connection;

const NIL: usize = usize::MAX;

/// Stable identifier of a connection within one worker, generation-tagged so
/// a recycled slot cannot be confused with its previous tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ConnId {
    pub(crate) fn as_u64(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub(crate) fn from_u64(raw: u64) -> ConnId {
        ConnId {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Links {
    prev: usize,
    next: usize,
}

impl Links {
    const DETACHED: Links = Links {
        prev: NIL,
        next: NIL,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeoutList {
    None,
    Default,
    Custom,
}

struct Slot {
    conn: Connection,
    generation: u32,
    main: Links,
    timeout: Links,
    ready: Links,
    in_to_clean: bool,
    in_ready: bool,
    timeout_list: TimeoutList,
}

#[derive(Debug, Clone, Copy, Default)]
struct ListHead {
    head: Option<usize>,
    tail: Option<usize>,
}

/// The four intrusive lists plus the slot arena.
pub(crate) struct Registry {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    /// Next generation for each slot index, surviving slot vacancy.
    generations: Vec<u32>,
    len: usize,
    all: ListHead,
    to_clean: ListHead,
    default_timeout: ListHead,
    custom_timeout: ListHead,
    ready: ListHead,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            slots: Vec::new(),
            free: Vec::new(),
            generations: Vec::new(),
            len: 0,
            all: ListHead::default(),
            to_clean: ListHead::default(),
            default_timeout: ListHead::default(),
            custom_timeout: ListHead::default(),
            ready: ListHead::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts a connection: tail of `all`, tail of its timeout list.
    pub fn insert(&mut self, conn: Connection) -> ConnId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        if self.generations.len() <= index {
            self.generations.resize(index + 1, 0);
        }
        let generation = self.generations[index];

        let custom = conn.custom_timeout_ms.is_some();
        self.slots[index] = Some(Slot {
            conn,
            generation,
            main: Links::DETACHED,
            timeout: Links::DETACHED,
            ready: Links::DETACHED,
            in_to_clean: false,
            in_ready: false,
            timeout_list: TimeoutList::None,
        });
        self.len += 1;

        self.push_tail_main(index, false);
        self.push_timeout(index, custom);

        ConnId {
            index: index as u32,
            generation: self.slots[index].as_ref().unwrap().generation,
        }
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        let slot = self.slots.get_mut(id.index as usize)?.as_mut()?;
        if slot.generation != id.generation {
            return None;
        }
        Some(&mut slot.conn)
    }

    /// Resolves a slot index (as recovered from a poll token) to the id of
    /// its current tenant.
    pub fn id_at(&self, index: u32) -> Option<ConnId> {
        let slot = self.slots.get(index as usize)?.as_ref()?;
        Some(ConnId {
            index,
            generation: slot.generation,
        })
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.slots
            .get(id.index as usize)
            .and_then(|s| s.as_ref())
            .map(|s| s.generation == id.generation)
            .unwrap_or(false)
    }

    fn index_of(&self, id: ConnId) -> Option<usize> {
        let index = id.index as usize;
        let slot = self.slots.get(index)?.as_ref()?;
        if slot.generation != id.generation {
            return None;
        }
        Some(index)
    }

    // ---- main (all / to-clean) list ---------------------------------------

    fn push_tail_main(&mut self, index: usize, to_clean: bool) {
        let head = if to_clean {
            &mut self.to_clean
        } else {
            &mut self.all
        };
        let old_tail = head.tail;
        head.tail = Some(index);
        if head.head.is_none() {
            head.head = Some(index);
        }
        if let Some(tail) = old_tail {
            self.slots[tail].as_mut().unwrap().main.next = index;
        }
        let slot = self.slots[index].as_mut().unwrap();
        slot.main = Links {
            prev: old_tail.unwrap_or(NIL),
            next: NIL,
        };
        slot.in_to_clean = to_clean;
    }

    fn unlink_main(&mut self, index: usize) {
        let (links, to_clean) = {
            let slot = self.slots[index].as_ref().unwrap();
            (slot.main, slot.in_to_clean)
        };
        let head = if to_clean {
            &mut self.to_clean
        } else {
            &mut self.all
        };
        if links.prev == NIL {
            head.head = (links.next != NIL).then_some(links.next);
        }
        if links.next == NIL {
            head.tail = (links.prev != NIL).then_some(links.prev);
        }
        if links.prev != NIL {
            self.slots[links.prev].as_mut().unwrap().main.next = links.next;
        }
        if links.next != NIL {
            self.slots[links.next].as_mut().unwrap().main.prev = links.prev;
        }
        self.slots[index].as_mut().unwrap().main = Links::DETACHED;
    }

    /// Moves a connection from `all` to the to-clean list.
    pub fn mark_to_clean(&mut self, id: ConnId) {
        let index = match self.index_of(id) {
            Some(index) => index,
            None => return,
        };
        if self.slots[index].as_ref().unwrap().in_to_clean {
            return;
        }
        self.unlink_main(index);
        self.remove_timeout(index);
        self.remove_ready(index);
        self.push_tail_main(index, true);
    }

    /// Removes a connection outright, without the to-clean detour. Used for
    /// protocol-upgrade handoffs, where the connection leaves the registry
    /// alive.
    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        let index = self.index_of(id)?;
        self.remove_timeout(index);
        self.remove_ready(index);
        self.unlink_main(index);
        let slot = self.slots[index].take().unwrap();
        self.generations[index] = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.len -= 1;
        Some(slot.conn)
    }

    /// Pops one connection pending destruction.
    pub fn pop_to_clean(&mut self) -> Option<Connection> {
        let index = self.to_clean.head?;
        self.unlink_main(index);
        let slot = self.slots[index].take().unwrap();
        // Bump the generation so stale ConnIds die with the tenant.
        self.generations[index] = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.len -= 1;
        Some(slot.conn)
    }

    // ---- timeout lists ----------------------------------------------------

    fn push_timeout(&mut self, index: usize, custom: bool) {
        let head = if custom {
            &mut self.custom_timeout
        } else {
            &mut self.default_timeout
        };
        let old_tail = head.tail;
        head.tail = Some(index);
        if head.head.is_none() {
            head.head = Some(index);
        }
        if let Some(tail) = old_tail {
            self.slots[tail].as_mut().unwrap().timeout.next = index;
        }
        let slot = self.slots[index].as_mut().unwrap();
        slot.timeout = Links {
            prev: old_tail.unwrap_or(NIL),
            next: NIL,
        };
        slot.timeout_list = if custom {
            TimeoutList::Custom
        } else {
            TimeoutList::Default
        };
    }

    fn remove_timeout(&mut self, index: usize) {
        let (links, list) = {
            let slot = self.slots[index].as_ref().unwrap();
            (slot.timeout, slot.timeout_list)
        };
        let head = match list {
            TimeoutList::None => return,
            TimeoutList::Default => &mut self.default_timeout,
            TimeoutList::Custom => &mut self.custom_timeout,
        };
        if links.prev == NIL {
            head.head = (links.next != NIL).then_some(links.next);
        }
        if links.next == NIL {
            head.tail = (links.prev != NIL).then_some(links.prev);
        }
        if links.prev != NIL {
            self.slots[links.prev].as_mut().unwrap().timeout.next = links.next;
        }
        if links.next != NIL {
            self.slots[links.next].as_mut().unwrap().timeout.prev = links.prev;
        }
        let slot = self.slots[index].as_mut().unwrap();
        slot.timeout = Links::DETACHED;
        slot.timeout_list = TimeoutList::None;
    }

    /// Refreshes a connection's position after activity: tail of the default
    /// list (which therefore stays sorted by last activity), or a plain
    /// re-insert for custom-deadline connections.
    pub fn touch(&mut self, id: ConnId) {
        let index = match self.index_of(id) {
            Some(index) => index,
            None => return,
        };
        if self.slots[index].as_ref().unwrap().in_to_clean {
            return;
        }
        let custom = self.slots[index]
            .as_ref()
            .unwrap()
            .conn
            .custom_timeout_ms
            .is_some();
        self.remove_timeout(index);
        self.push_timeout(index, custom);
    }

    /// Takes a connection out of both timeout lists (suspension).
    pub fn detach_timeout(&mut self, id: ConnId) {
        if let Some(index) = self.index_of(id) {
            self.remove_timeout(index);
        }
    }

    // ---- ready list -------------------------------------------------------

    pub fn push_ready(&mut self, id: ConnId) {
        let index = match self.index_of(id) {
            Some(index) => index,
            None => return,
        };
        let slot = self.slots[index].as_ref().unwrap();
        if slot.in_ready || slot.in_to_clean {
            return;
        }
        let old_tail = self.ready.tail;
        self.ready.tail = Some(index);
        if self.ready.head.is_none() {
            self.ready.head = Some(index);
        }
        if let Some(tail) = old_tail {
            self.slots[tail].as_mut().unwrap().ready.next = index;
        }
        let slot = self.slots[index].as_mut().unwrap();
        slot.ready = Links {
            prev: old_tail.unwrap_or(NIL),
            next: NIL,
        };
        slot.in_ready = true;
    }

    pub fn pop_ready(&mut self) -> Option<ConnId> {
        let index = self.ready.head?;
        self.remove_ready(index);
        let slot = self.slots[index].as_ref().unwrap();
        Some(ConnId {
            index: index as u32,
            generation: slot.generation,
        })
    }

    pub fn has_ready(&self) -> bool {
        self.ready.head.is_some()
    }

    fn remove_ready(&mut self, index: usize) {
        let links = {
            let slot = self.slots[index].as_ref().unwrap();
            if !slot.in_ready {
                return;
            }
            slot.ready
        };
        if links.prev == NIL {
            self.ready.head = (links.next != NIL).then_some(links.next);
        }
        if links.next == NIL {
            self.ready.tail = (links.prev != NIL).then_some(links.prev);
        }
        if links.prev != NIL {
            self.slots[links.prev].as_mut().unwrap().ready.next = links.next;
        }
        if links.next != NIL {
            self.slots[links.next].as_mut().unwrap().ready.prev = links.prev;
        }
        let slot = self.slots[index].as_mut().unwrap();
        slot.ready = Links::DETACHED;
        slot.in_ready = false;
    }

    // ---- timeout sweep ----------------------------------------------------

    /// Collects expired connections and computes how long the next poll may
    /// sleep. The default list is inspected from the head only until the
    /// first non-expired entry; the custom list is walked in full.
    pub fn sweep(&mut self, now_ms: u64, default_timeout_ms: u64) -> Sweep {
        let mut expired = Vec::new();
        let mut next_deadline: Option<u64> = None;

        if default_timeout_ms > 0 {
            while let Some(index) = self.default_timeout.head {
                let slot = self.slots[index].as_ref().unwrap();
                let deadline = slot.conn.last_activity_ms + default_timeout_ms;
                if deadline <= now_ms {
                    expired.push(ConnId {
                        index: index as u32,
                        generation: slot.generation,
                    });
                    self.remove_timeout(index);
                } else {
                    next_deadline = Some(deadline);
                    break;
                }
            }
        }

        let mut cursor = self.custom_timeout.head;
        while let Some(index) = cursor {
            let slot = self.slots[index].as_ref().unwrap();
            cursor = (slot.timeout.next != NIL).then_some(slot.timeout.next);
            let timeout = slot.conn.custom_timeout_ms.unwrap_or(0);
            if timeout == 0 {
                continue;
            }
            let deadline = slot.conn.last_activity_ms + timeout;
            if deadline <= now_ms {
                expired.push(ConnId {
                    index: index as u32,
                    generation: slot.generation,
                });
                self.remove_timeout(index);
            } else {
                next_deadline = Some(match next_deadline {
                    Some(d) => d.min(deadline),
                    None => deadline,
                });
            }
        }

        Sweep {
            expired,
            next_timeout_ms: next_deadline.map(|d| d.saturating_sub(now_ms)),
        }
    }

    /// Drains every live connection id, for shutdown.
    pub fn all_ids(&self) -> Vec<ConnId> {
        let mut ids = Vec::with_capacity(self.len);
        let mut cursor = self.all.head;
        while let Some(index) = cursor {
            let slot = self.slots[index].as_ref().unwrap();
            ids.push(ConnId {
                index: index as u32,
                generation: slot.generation,
            });
            cursor = (slot.main.next != NIL).then_some(slot.main.next);
        }
        ids
    }

    pub fn has_to_clean(&self) -> bool {
        self.to_clean.head.is_some()
    }
}

pub(crate) struct Sweep {
    pub expired: Vec<ConnId>,
    /// Milliseconds until the earliest live deadline, if any.
    pub next_timeout_ms: Option<u64>,
}
