// Bounded-latency reorder buffer
//
// Passings from the measurement points can reach the host out of tod
// order; a binary heap keyed by corrected tod holds each event for the
// reorder window before release, so two sensors read within tens of
// milliseconds still emit in track order. Events already older than
// the window on arrival bypass the queue with the out_of_order flag.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::intake::CorrectedPassing;
use crate::tod::Tod;

/// Default hold-back window in seconds.
pub const DEFAULT_WINDOW_SECS: f64 = 3.0;

/// Maximum pending events before oldest arrivals are shed.
pub const CAPACITY: usize = 1024;

#[derive(Debug)]
struct Pending {
    pass: CorrectedPassing,
    /// Arrival order, also the overflow-shedding key.
    seq: u64,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        // min-heap via reversal: earliest tod first, ties by mpid then
        // arrival order
        (other.pass.tod, other.pass.mpid, other.seq).cmp(&(
            self.pass.tod,
            self.pass.mpid,
            self.seq,
        ))
    }
}

/// Outcome of offering an event to the buffer.
#[derive(Debug)]
pub enum Enqueue {
    /// Held for ordered release.
    Queued,
    /// Arrived beyond the window; release immediately, flagged.
    Late(CorrectedPassing),
}

#[derive(Debug)]
pub struct ReorderBuffer {
    heap: BinaryHeap<Pending>,
    window: Tod,
    seq: u64,
    /// Set when capacity forced an event to be dropped; callers clear
    /// it once the backlog drains below half.
    pub overflowed: bool,
}

impl ReorderBuffer {
    pub fn new(window_secs: f64) -> Self {
        ReorderBuffer {
            heap: BinaryHeap::with_capacity(CAPACITY),
            window: Tod::from_secs(window_secs),
            seq: 0,
            overflowed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn below_half(&self) -> bool {
        self.heap.len() < CAPACITY / 2
    }

    /// Offer a corrected passing. `now` is host wall time. Returns the
    /// enqueue outcome and whether capacity forced a drop.
    pub fn push(&mut self, mut pass: CorrectedPassing, now: Tod) -> (Enqueue, bool) {
        if pass.tod <= now - self.window {
            pass.out_of_order = true;
            return (Enqueue::Late(pass), false);
        }
        let mut dropped = false;
        if self.heap.len() >= CAPACITY {
            self.shed_oldest_arrival();
            self.overflowed = true;
            dropped = true;
        }
        self.seq += 1;
        self.heap.push(Pending {
            pass,
            seq: self.seq,
        });
        (Enqueue::Queued, dropped)
    }

    /// Release every event whose key has aged past the window, in
    /// nondecreasing tod order.
    pub fn release(&mut self, now: Tod) -> Vec<CorrectedPassing> {
        let horizon = now - self.window;
        let mut out = Vec::new();
        while let Some(head) = self.heap.peek() {
            if head.pass.tod > horizon {
                break;
            }
            out.push(self.heap.pop().unwrap().pass);
        }
        out
    }

    /// Discard all pending events.
    pub fn drain(&mut self) {
        self.heap.clear();
        self.overflowed = false;
    }

    /// Discard pending events from one measurement point (unit reset).
    pub fn drop_channel(&mut self, mpid: u8) {
        let kept: Vec<Pending> = self
            .heap
            .drain()
            .filter(|p| p.pass.mpid != mpid)
            .collect();
        self.heap.extend(kept);
    }

    fn shed_oldest_arrival(&mut self) {
        let mut all: Vec<Pending> = self.heap.drain().collect();
        if let Some(idx) = all
            .iter()
            .enumerate()
            .min_by_key(|(_, p)| p.seq)
            .map(|(i, _)| i)
        {
            all.swap_remove(idx);
        }
        self.heap.extend(all);
    }
}
