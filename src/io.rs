//! The coordinator turning one prepared SQE into a parked fiber and a
//! final result.

use std::io;
use std::time::Duration;

use io_uring::{opcode, squeue};

use crate::ctx::{CqeTag, IoCtx, OpKey};
use crate::engine::RingEngine;
use crate::fiber::{FiberId, StealPause, EOK};
use crate::util;

impl RingEngine {
    /// Queue `entry`, park the calling fiber, and return the operation's
    /// result once its completion has been reaped.
    ///
    /// The low 8 bits of `ring_flags` are OR'd into the SQE flags. With a
    /// timeout the SQE is linked to a `LINK_TIMEOUT`; the pair completes as
    /// one logical operation and a fired timer surfaces as `ETIMEDOUT`.
    /// `None` means no timer at all, the cheapest path. A zero timeout is an
    /// immediate cancellation.
    ///
    /// An external [`interrupt`](crate::FiberRuntime::interrupt) with a
    /// non-zero code makes the fiber issue a best-effort `ASYNC_CANCEL`,
    /// wait for it to land, and fail with the interrupt's errno.
    pub(crate) fn async_io(
        &self,
        entry: squeue::Entry,
        ring_flags: u32,
        timeout: Option<Duration>,
    ) -> io::Result<i32> {
        let fiber = self.runtime().current();
        let sqe_flags = squeue::Flags::from_bits_truncate(
            (ring_flags & 0xff) as u8 & !squeue::Flags::FIXED_FILE.bits(),
        );
        let entry = entry.flags(sqe_flags);

        // The timespec is read by the kernel at submission; the fiber stays
        // in this frame, parked, until well after that.
        let ts;

        let mut state = self.state().lock();
        let key = state.ops.insert_io(IoCtx::new(fiber, false, None));
        let entry = entry.user_data(CqeTag::Io(key).encode());

        let pushed = if let Some(timeout) = timeout {
            let timer_key = state.ops.insert_io(IoCtx::new(fiber, true, Some(key)));
            ts = util::timespec(Some(timeout));
            let timer = opcode::LinkTimeout::new(&ts)
                .build()
                .user_data(CqeTag::Io(timer_key).encode());
            let entry = entry.flags(squeue::Flags::IO_LINK);
            let res = self.push(&mut state, &[entry, timer]);
            if res.is_err() {
                state.ops.remove(timer_key);
            }
            res
        } else {
            self.push(&mut state, &[entry])
        };
        if let Err(err) = pushed {
            state.ops.remove(key);
            return Err(err);
        }
        drop(state);

        self.try_submit()?;

        let _steal_pause = StealPause::new(self.runtime());
        let code = loop {
            let code = self.runtime().park();
            if code != EOK {
                break code;
            }
            // Wake-ups are edge signals; only a completed context ends the
            // wait.
            if self.state().lock().ops.io_completed(key) {
                break EOK;
            }
        };

        if code == EOK {
            let res = self.state().lock().ops.take_io_result(key);
            if res < 0 {
                return Err(io::Error::from_raw_os_error(-res));
            }
            return Ok(res);
        }

        // Interrupted by another fiber: try to pull the operation back
        // before failing with the interrupt's code.
        self.cancel_in_flight(fiber, key);
        Err(io::Error::from_raw_os_error(code))
    }

    /// Best-effort cancellation of `key` after an external interrupt. Keeps
    /// the fiber parked until the kernel is done with the operation, so no
    /// submitted SQE can outlive the frames it borrows.
    fn cancel_in_flight(&self, fiber: FiberId, key: OpKey) {
        let mut state = self.state().lock();
        let cancel_key = state.ops.insert_io(IoCtx::new(fiber, true, Some(key)));
        let cancel = opcode::AsyncCancel::new(CqeTag::Io(key).encode())
            .build()
            .user_data(CqeTag::Io(cancel_key).encode());
        let pushed = self.push(&mut state, &[cancel]).is_ok();
        if !pushed {
            state.ops.remove(cancel_key);
        }
        drop(state);
        if pushed {
            let _ = self.try_submit();
        }

        loop {
            let code = self.runtime().park();
            let state = self.state().lock();
            if pushed {
                // Wait for the cancel to land; a further interrupt ends the
                // attempt (the stale completion is dropped by the arena).
                if !state.ops.contains(cancel_key) || code != EOK {
                    break;
                }
            } else if state.ops.io_completed(key) {
                // No room for a cancel SQE: sit out the operation itself.
                break;
            }
        }
        self.state().lock().ops.remove(key);
    }
}
