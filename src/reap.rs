//! The completion reaper: walks the CQ in ring order, decodes flags, and
//! resumes or evicts the owning context.

use io_uring::cqueue;
use tracing::{error, warn};

use crate::ctx::{CqeTag, OpKey};
use crate::engine::{EngineState, RingEngine};
use crate::fiber::EOK;
use crate::interest::FdInterest;
use crate::util;

impl RingEngine {
    /// Drain all available CQEs. Interest deliveries fill `out` first and
    /// spill into the backlog, which is drained ahead of the queue on the
    /// next call. Returns the number of tokens written to `out`.
    pub(crate) fn reap(&self, state: &mut EngineState, out: &mut [u64]) -> usize {
        let mut delivered = 0;
        while delivered < out.len() {
            match state.backlog.pop_front() {
                Some(data) => {
                    out[delivered] = data;
                    delivered += 1;
                }
                None => break,
            }
        }

        let mut cq = unsafe { self.ring().completion_shared() };
        for cqe in &mut cq {
            match CqeTag::decode(cqe.user_data()) {
                // Own timeout of the submit-wait-by-timer path, or a
                // poll_remove nobody waits for.
                CqeTag::OwnTimer => {}
                CqeTag::CancelWake => util::eventfd_drain(self.eventfd_raw()),
                CqeTag::Io(key) => self.reap_io(state, key, &cqe),
                CqeTag::Event(key) => self.reap_event(state, key, &cqe, out, &mut delivered),
            }
        }

        delivered
    }

    fn reap_io(&self, state: &mut EngineState, key: OpKey, cqe: &cqueue::Entry) {
        // A stale key lost a cancellation race; its completion is moot.
        let Some(ctx) = state.ops.get_io_mut(key) else {
            return;
        };

        if cqueue::notif(cqe.flags()) {
            // Tail notification of a zero-copy send.
            if cqe.result() != 0 {
                warn!("zero-copy send fell back to copying");
            }
            ctx.completed = true;
            let fiber = ctx.fiber;
            self.runtime().interrupt(fiber, EOK);
            return;
        }

        if cqueue::more(cqe.flags()) {
            // First CQE of a zero-copy send; the fiber resumes on the
            // notification.
            ctx.res = cqe.result();
            return;
        }

        let res = cqe.result();
        if res == -libc::ECANCELED {
            if ctx.canceller {
                // The linked timer lost to the I/O, or a cancel was itself
                // cancelled. Absorb.
                state.ops.remove(key);
            } else {
                // The I/O arm of a link timeout, poll_remove, or
                // async_cancel. The paired canceller delivers the resume.
                ctx.res = -libc::ETIMEDOUT;
                ctx.completed = true;
            }
            return;
        }

        if ctx.canceller {
            // The timer fired, or an async_cancel finished. Make sure the
            // primary reads as timed out even if its own CQE is still in
            // flight, then resume.
            let fiber = ctx.fiber;
            let pair = ctx.pair;
            state.ops.remove(key);
            if let Some(primary) = pair.and_then(|k| state.ops.get_io_mut(k)) {
                if !primary.completed {
                    primary.res = -libc::ETIMEDOUT;
                    primary.completed = true;
                }
            }
            self.runtime().interrupt(fiber, EOK);
            return;
        }

        ctx.res = res;
        ctx.completed = true;
        let fiber = ctx.fiber;
        self.runtime().interrupt(fiber, EOK);
    }

    fn reap_event(
        &self,
        state: &mut EngineState,
        key: OpKey,
        cqe: &cqueue::Entry,
        out: &mut [u64],
        delivered: &mut usize,
    ) {
        let Some(ctx) = state.ops.get_event(key) else {
            return;
        };
        let event = ctx.event;
        let one_shot = ctx.one_shot;
        let res = cqe.result();

        if cqueue::more(cqe.flags()) {
            if res & libc::POLLERR as i32 != 0 {
                // Terminal failure of the multishot poll; the interest is
                // dead from here on.
                error!(fd = event.fd, "multishot poll got POLLERR, dropping interest");
                Self::evict(state, &event, key);
                return;
            }
            // Still armed; deliver without evicting.
            Self::deliver(state, out, delivered, event.data);
            return;
        }

        if res == -libc::ECANCELED {
            // rm_interest or async cancellation.
            Self::evict(state, &event, key);
            return;
        }

        Self::deliver(state, out, delivered, event.data);
        if one_shot {
            Self::evict(state, &event, key);
        }
    }

    fn deliver(state: &mut EngineState, out: &mut [u64], delivered: &mut usize, data: u64) {
        if *delivered < out.len() {
            out[*delivered] = data;
            *delivered += 1;
        } else {
            state.backlog.push_back(data);
        }
    }

    fn evict(state: &mut EngineState, event: &crate::Event, key: OpKey) {
        state.interests.remove(&FdInterest::of(event));
        state.ops.remove(key);
    }
}
