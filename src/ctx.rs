//! Per-operation contexts and the user-data encoding.
//!
//! Every SQE the engine submits carries a [`CqeTag`] in its 64-bit user
//! data. In-flight operations live in a generation-checked arena rather
//! than on the suspended fiber's stack, so a completion that races a
//! cancellation can never resolve to a dead frame: a stale key simply
//! fails the generation check and the CQE is dropped.

use slab::Slab;

use crate::fiber::FiberId;
use crate::interest::Event;

const TAG_SHIFT: u32 = 62;
const TAG_SPECIAL: u64 = 0;
const TAG_IO: u64 = 1;
const TAG_EVENT: u64 = 2;

const GEN_SHIFT: u32 = 32;
const GEN_MASK: u32 = (1 << (TAG_SHIFT - GEN_SHIFT)) - 1;

/// Arena handle: slot index plus the generation it was allocated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OpKey {
    index: u32,
    gen: u32,
}

/// Decoded user data of a CQE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CqeTag {
    /// The engine's own timeout SQE (submit-wait-by-timer path) and other
    /// completions nobody waits for, e.g. `poll_remove`.
    OwnTimer,
    /// The master engine's multishot self-poll on its eventfd fired.
    CancelWake,
    /// One-shot I/O: primary SQE, linked timeout, or async cancel.
    Io(OpKey),
    /// Persistent interest registered with `add_interest`.
    Event(OpKey),
}

impl CqeTag {
    pub(crate) fn encode(self) -> u64 {
        match self {
            CqeTag::OwnTimer => 0,
            CqeTag::CancelWake => 1,
            CqeTag::Io(key) => (TAG_IO << TAG_SHIFT) | key.pack(),
            CqeTag::Event(key) => (TAG_EVENT << TAG_SHIFT) | key.pack(),
        }
    }

    pub(crate) fn decode(data: u64) -> CqeTag {
        match data >> TAG_SHIFT {
            TAG_IO => CqeTag::Io(OpKey::unpack(data)),
            TAG_EVENT => CqeTag::Event(OpKey::unpack(data)),
            TAG_SPECIAL if data == 1 => CqeTag::CancelWake,
            // 0 and anything unrecognized: nothing to resume.
            _ => CqeTag::OwnTimer,
        }
    }
}

impl OpKey {
    fn pack(self) -> u64 {
        (u64::from(self.gen) << GEN_SHIFT) | u64::from(self.index)
    }

    fn unpack(data: u64) -> OpKey {
        OpKey {
            index: data as u32,
            gen: (data >> GEN_SHIFT) as u32 & GEN_MASK,
        }
    }
}

/// Context of a one-shot I/O SQE.
#[derive(Debug)]
pub(crate) struct IoCtx {
    pub(crate) fiber: FiberId,
    /// Written from `cqe.res` by the reaper.
    pub(crate) res: i32,
    /// The result is final and the owning fiber may consume it.
    pub(crate) completed: bool,
    /// Timeout and cancel SQEs, whose completion is absorbed rather than
    /// delivered as an I/O result.
    pub(crate) canceller: bool,
    /// For a canceller: the primary operation it guards.
    pub(crate) pair: Option<OpKey>,
}

impl IoCtx {
    pub(crate) fn new(fiber: FiberId, canceller: bool, pair: Option<OpKey>) -> IoCtx {
        IoCtx {
            fiber,
            res: -1,
            completed: false,
            canceller,
            pair,
        }
    }
}

/// Context of a persistent interest; owned by the arena until eviction.
#[derive(Debug)]
pub(crate) struct EventCtx {
    pub(crate) event: Event,
    pub(crate) one_shot: bool,
}

#[derive(Debug)]
enum Slot {
    Io(IoCtx),
    Event(EventCtx),
}

struct Cell {
    gen: u32,
    slot: Slot,
}

/// Generation-checked store of every in-flight context.
#[derive(Default)]
pub(crate) struct OpArena {
    cells: Slab<Cell>,
    next_gen: u32,
}

impl OpArena {
    fn insert(&mut self, slot: Slot) -> OpKey {
        self.next_gen = self.next_gen.wrapping_add(1) & GEN_MASK;
        let gen = self.next_gen;
        let index = self.cells.insert(Cell { gen, slot }) as u32;
        OpKey { index, gen }
    }

    pub(crate) fn insert_io(&mut self, ctx: IoCtx) -> OpKey {
        self.insert(Slot::Io(ctx))
    }

    pub(crate) fn insert_event(&mut self, ctx: EventCtx) -> OpKey {
        self.insert(Slot::Event(ctx))
    }

    fn cell(&self, key: OpKey) -> Option<&Cell> {
        self.cells
            .get(key.index as usize)
            .filter(|cell| cell.gen == key.gen)
    }

    pub(crate) fn contains(&self, key: OpKey) -> bool {
        self.cell(key).is_some()
    }

    pub(crate) fn get_io_mut(&mut self, key: OpKey) -> Option<&mut IoCtx> {
        match self.cells.get_mut(key.index as usize) {
            Some(cell) if cell.gen == key.gen => match &mut cell.slot {
                Slot::Io(ctx) => Some(ctx),
                Slot::Event(_) => None,
            },
            _ => None,
        }
    }

    pub(crate) fn get_event(&self, key: OpKey) -> Option<&EventCtx> {
        match self.cell(key) {
            Some(Cell {
                slot: Slot::Event(ctx),
                ..
            }) => Some(ctx),
            _ => None,
        }
    }

    pub(crate) fn io_completed(&self, key: OpKey) -> bool {
        matches!(
            self.cell(key),
            Some(Cell {
                slot: Slot::Io(IoCtx {
                    completed: true,
                    ..
                }),
                ..
            })
        )
    }

    pub(crate) fn remove(&mut self, key: OpKey) {
        if self.contains(key) {
            self.cells.remove(key.index as usize);
        }
    }

    /// Consume the final result of a completed I/O context.
    pub(crate) fn take_io_result(&mut self, key: OpKey) -> i32 {
        debug_assert!(self.io_completed(key));
        let res = match self.get_io_mut(key) {
            Some(ctx) => ctx.res,
            None => -libc::ECANCELED,
        };
        self.remove(key);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trip() {
        let mut arena = OpArena::default();
        let io = arena.insert_io(IoCtx::new(7, false, None));
        let ev = arena.insert_event(EventCtx {
            event: Event {
                fd: 3,
                interests: crate::Interests::READ,
                data: 0xAB,
            },
            one_shot: false,
        });

        assert_eq!(CqeTag::decode(CqeTag::Io(io).encode()), CqeTag::Io(io));
        assert_eq!(CqeTag::decode(CqeTag::Event(ev).encode()), CqeTag::Event(ev));
        assert_eq!(CqeTag::decode(0), CqeTag::OwnTimer);
        assert_eq!(CqeTag::decode(1), CqeTag::CancelWake);
    }

    #[test]
    fn stale_key_is_ignored() {
        let mut arena = OpArena::default();
        let key = arena.insert_io(IoCtx::new(1, false, None));
        arena.remove(key);
        assert!(!arena.contains(key));
        assert!(arena.get_io_mut(key).is_none());

        // The slot may be reused; the old key must still not resolve.
        let fresh = arena.insert_io(IoCtx::new(2, false, None));
        assert!(arena.contains(fresh));
        assert!(!arena.contains(key));
    }

    #[test]
    fn io_result_life_cycle() {
        let mut arena = OpArena::default();
        let key = arena.insert_io(IoCtx::new(1, false, None));
        assert!(!arena.io_completed(key));

        let ctx = arena.get_io_mut(key).unwrap();
        ctx.res = 42;
        ctx.completed = true;
        assert!(arena.io_completed(key));
        assert_eq!(arena.take_io_result(key), 42);
        assert!(!arena.contains(key));
    }
}
