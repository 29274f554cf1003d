//! Engine construction, submission plumbing, and the wait entry points.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use io_uring::{opcode, squeue, types, IoUring, Probe};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::ctx::{CqeTag, OpArena, OpKey};
use crate::fiber::FiberRuntime;
use crate::interest::{poll_mask, FdInterest, Interests};
use crate::probe::{self, SubmitWait};
use crate::util;

/// Submission ring depth.
pub const QUEUE_DEPTH: u32 = 16384;

/// Size of the fixed-file table; fds are registered at the slot matching
/// their own value.
pub const REGISTER_FILES_MAX_NUM: usize = 10000;

const REGISTER_FILES_SPARSE_FD: RawFd = -1;

bitflags! {
    /// Setup flags the EINVAL retry ladder is allowed to strip.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct SetupFlags: u32 {
        const COOP_TASKRUN = 1;
        const DEFER_TASKRUN = 1 << 1;
        const SINGLE_ISSUER = 1 << 2;
        const CQSIZE = 1 << 3;
        const SQPOLL = 1 << 4;
        const SQ_AFF = 1 << 5;
        const IOPOLL = 1 << 6;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Master,
    Cascading,
}

/// Ring configuration. Role selection is by constructor:
/// [`RingEngine::master`] or [`RingEngine::cascading`].
#[derive(Debug, Clone, Default)]
pub struct RingConfig {
    sqpoll: bool,
    sq_aff: bool,
    sq_thread_cpu: u32,
    sq_thread_idle_ms: u32,
    iopoll: bool,
    eager_submit: bool,
}

impl RingConfig {
    pub fn new() -> RingConfig {
        RingConfig::default()
    }

    /// Kernel-side submission queue polling; `idle_ms` is the poller
    /// thread's idle threshold.
    pub fn setup_sqpoll(&mut self, idle_ms: u32) -> &mut Self {
        self.sqpoll = true;
        self.sq_thread_idle_ms = idle_ms;
        self
    }

    /// Pin the SQ poller thread to `cpu`. Only meaningful with
    /// [`setup_sqpoll`](Self::setup_sqpoll).
    pub fn setup_sq_aff(&mut self, cpu: u32) -> &mut Self {
        self.sq_aff = true;
        self.sq_thread_cpu = cpu;
        self
    }

    /// Busy-poll for I/O completion instead of interrupt notification.
    pub fn setup_iopoll(&mut self) -> &mut Self {
        self.iopoll = true;
        self
    }

    /// Submit on every call instead of batching SQEs until the next
    /// master wait.
    pub fn eager_submit(&mut self) -> &mut Self {
        self.eager_submit = true;
        self
    }
}

pub(crate) struct EngineState {
    pub(crate) ops: OpArena,
    pub(crate) interests: HashMap<FdInterest, OpKey>,
    /// Interest deliveries that did not fit the caller's batch; drained
    /// first by the next `wait_for_events`.
    pub(crate) backlog: VecDeque<u64>,
}

/// The io_uring event engine. One instance per ring; master and cascading
/// engines are the same type wired differently at construction.
pub struct RingEngine {
    ring: IoUring,
    eventfd: OwnedFd,
    runtime: Arc<dyn FiberRuntime>,
    /// Cascading engines delegate their readability wait here.
    master: Option<Arc<RingEngine>>,
    role: Role,
    eager_submit: bool,
    sqpoll: bool,
    /// Guards the arena, the interest registry, and all SQ/CQ access.
    /// Never held across a park or a blocking `enter`.
    state: Mutex<EngineState>,
}

impl RingEngine {
    /// Build the per-vCPU master engine: the scheduler's central wait loop
    /// runs on it through [`wait_and_fire_events`](Self::wait_and_fire_events).
    pub fn master(
        config: RingConfig,
        runtime: Arc<dyn FiberRuntime>,
    ) -> io::Result<Arc<RingEngine>> {
        Self::build_engine(config, runtime, Role::Master, None)
    }

    /// Build a cascading engine whose completions are signaled to `master`
    /// through this engine's eventfd.
    pub fn cascading(
        config: RingConfig,
        runtime: Arc<dyn FiberRuntime>,
        master: Arc<RingEngine>,
    ) -> io::Result<Arc<RingEngine>> {
        Self::build_engine(config, runtime, Role::Cascading, Some(master))
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    fn build_engine(
        config: RingConfig,
        runtime: Arc<dyn FiberRuntime>,
        role: Role,
        master: Option<Arc<RingEngine>>,
    ) -> io::Result<Arc<RingEngine>> {
        probe::raise_memlock_limit();

        let ring = Self::build_ring(&config)?;
        Self::check_features(ring.params())?;
        Self::check_opcodes(&ring)?;

        if probe::register_files_enabled() {
            let sparse = vec![REGISTER_FILES_SPARSE_FD; REGISTER_FILES_MAX_NUM];
            ring.submitter().register_files(&sparse)?;
        }

        let eventfd = util::eventfd()?;
        let sqpoll = ring.params().is_setup_sqpoll();

        let engine = RingEngine {
            ring,
            eventfd,
            runtime,
            master,
            role,
            eager_submit: config.eager_submit,
            sqpoll,
            state: Mutex::new(EngineState {
                ops: OpArena::default(),
                interests: HashMap::new(),
                backlog: VecDeque::new(),
            }),
        };

        match role {
            Role::Master => {
                // Watch our own eventfd so that cancel_wait can break the
                // central wait at any time.
                let poll = opcode::PollAdd::new(
                    types::Fd(engine.eventfd.as_raw_fd()),
                    poll_mask(Interests::READ),
                )
                .multi(true)
                .build()
                .user_data(CqeTag::CancelWake.encode());
                {
                    let mut state = engine.state.lock();
                    engine.push(&mut state, &[poll])?;
                }
                if engine.ring.submitter().submit()? == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        "failed to submit the cancel-wait poll",
                    ));
                }
            }
            Role::Cascading => {
                engine
                    .ring
                    .submitter()
                    .register_eventfd(engine.eventfd.as_raw_fd())?;
            }
        }

        info!(
            is_master = engine.is_master(),
            sqpoll = config.sqpoll,
            iopoll = config.iopoll,
            eager_submit = config.eager_submit,
            "init event engine: io_uring"
        );
        Ok(Arc::new(engine))
    }

    fn build_ring(config: &RingConfig) -> io::Result<IoUring> {
        let mut flags = SetupFlags::empty();
        if probe::coop_taskrun_enabled() {
            flags |= SetupFlags::COOP_TASKRUN;
        }
        if config.iopoll {
            flags |= SetupFlags::IOPOLL;
        }
        if config.sqpoll {
            flags |= SetupFlags::SQPOLL;
            if config.sq_aff {
                flags |= SetupFlags::SQ_AFF;
            }
        }

        loop {
            match Self::try_build(flags, config) {
                Ok(ring) => return Ok(ring),
                Err(err) if err.raw_os_error() == Some(libc::EINVAL) => {
                    if flags.contains(SetupFlags::DEFER_TASKRUN) {
                        flags.remove(SetupFlags::DEFER_TASKRUN | SetupFlags::SINGLE_ISSUER);
                        info!("io_uring setup failed, removing DEFER_TASKRUN, SINGLE_ISSUER");
                    } else if flags.contains(SetupFlags::COOP_TASKRUN) {
                        // Known to conflict with SQPOLL on some kernels.
                        flags.remove(SetupFlags::COOP_TASKRUN);
                        info!("io_uring setup failed, removing COOP_TASKRUN");
                    } else if flags.contains(SetupFlags::CQSIZE) {
                        flags.remove(SetupFlags::CQSIZE);
                        info!("io_uring setup failed, removing CQSIZE");
                    } else {
                        error!("io_uring setup failed: {err}");
                        return Err(err);
                    }
                }
                Err(err) => {
                    error!("io_uring setup failed: {err}");
                    return Err(err);
                }
            }
        }
    }

    fn try_build(flags: SetupFlags, config: &RingConfig) -> io::Result<IoUring> {
        let mut builder = IoUring::builder();
        if flags.contains(SetupFlags::COOP_TASKRUN) {
            builder.setup_coop_taskrun();
        }
        if flags.contains(SetupFlags::DEFER_TASKRUN) {
            builder.setup_defer_taskrun();
        }
        if flags.contains(SetupFlags::SINGLE_ISSUER) {
            builder.setup_single_issuer();
        }
        if flags.contains(SetupFlags::IOPOLL) {
            builder.setup_iopoll();
        }
        if flags.contains(SetupFlags::SQPOLL) {
            builder.setup_sqpoll(config.sq_thread_idle_ms);
            if flags.contains(SetupFlags::SQ_AFF) {
                builder.setup_sqpoll_cpu(config.sq_thread_cpu);
            }
        }
        builder.build(QUEUE_DEPTH)
    }

    fn check_features(params: &io_uring::Parameters) -> io::Result<()> {
        let ok = params.is_feature_cur_personality()
            && params.is_feature_nodrop()
            && params.is_feature_fast_poll()
            && params.is_feature_ext_arg()
            && params.is_feature_rw_cur_pos();
        if ok {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "required io_uring feature not supported",
            ))
        }
    }

    fn check_opcodes(ring: &IoUring) -> io::Result<()> {
        let mut probe = Probe::new();
        ring.submitter().register_probe(&mut probe)?;
        if probe.is_supported(opcode::ProvideBuffers::CODE)
            && probe.is_supported(opcode::AsyncCancel::CODE)
        {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "required io_uring opcode not supported",
            ))
        }
    }

    pub(crate) fn runtime(&self) -> &dyn FiberRuntime {
        &*self.runtime
    }

    pub(crate) fn state(&self) -> &Mutex<EngineState> {
        &self.state
    }

    /// Copy prepared SQEs into the submission queue. Fails with `EBUSY`
    /// when the queue cannot take all of them; linked pairs are therefore
    /// never half-queued. Callers hold the state lock, which serializes
    /// all queue access.
    pub(crate) fn push(
        &self,
        _state: &mut EngineState,
        entries: &[squeue::Entry],
    ) -> io::Result<()> {
        let mut sq = unsafe { self.ring.submission_shared() };
        let res = unsafe { sq.push_multiple(entries) };
        sq.sync();
        res.map_err(|_| io::Error::from_raw_os_error(libc::EBUSY))
    }

    /// Eagerly submit if so configured; the default leaves batching to the
    /// next master wait.
    pub(crate) fn try_submit(&self) -> io::Result<()> {
        if self.eager_submit {
            self.ring.submitter().submit()?;
        }
        Ok(())
    }

    /// Master wait: batch-submit pending SQEs, block for at most `timeout`
    /// or until one CQE arrives, then reap and resume fibers.
    pub fn wait_and_fire_events(&self, timeout: Option<Duration>) -> io::Result<()> {
        let ts = util::timespec(timeout);
        match probe::submit_wait_strategy() {
            SubmitWait::ExtArg => {
                let args = types::SubmitArgs::new().timespec(&ts);
                match self.ring.submitter().submit_with_args(1, &args) {
                    Ok(_) => {}
                    Err(err) if err.raw_os_error() == Some(libc::ETIME) => {}
                    Err(err) => return Err(err),
                }
            }
            SubmitWait::TimerSqe => {
                {
                    let timer = opcode::Timeout::new(&ts)
                        .count(1)
                        .build()
                        .user_data(CqeTag::OwnTimer.encode());
                    let mut state = self.state.lock();
                    self.push(&mut state, &[timer])?;
                }
                self.ring.submitter().submit_and_wait(1)?;
            }
        }

        let mut state = self.state.lock();
        self.reap(&mut state, &mut []);
        Ok(())
    }

    /// Cascading wait: let the master watch this engine's eventfd, then
    /// drain completions into `out`, one `Event::data` token per entry.
    /// Returns the number of tokens written; 0 on timeout.
    pub fn wait_for_events(
        &self,
        out: &mut [u64],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        {
            let mut state = self.state.lock();
            // Deliveries that overflowed the previous batch don't bump the
            // eventfd again; hand them out without waiting.
            if !state.backlog.is_empty() {
                return Ok(self.reap(&mut state, out));
            }
            let pending = !unsafe { self.ring.submission_shared() }.is_empty();
            if pending && !self.sqpoll {
                self.ring.submitter().submit()?;
            }
        }

        let master = self.master.as_deref().unwrap_or(self);
        match master.wait_for_fd_readable(self.eventfd.as_raw_fd(), timeout) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::ETIMEDOUT) => return Ok(0),
            Err(err) => return Err(err),
        }
        util::eventfd_drain(self.eventfd.as_raw_fd());

        let mut state = self.state.lock();
        Ok(self.reap(&mut state, out))
    }

    /// Break the engine's current (or next) wait from another fiber.
    pub fn cancel_wait(&self) -> io::Result<()> {
        util::eventfd_write(self.eventfd.as_raw_fd(), 1)
    }

    /// Park the calling fiber until `fd` reports one of `interests`.
    pub fn wait_for_fd(
        &self,
        fd: RawFd,
        interests: Interests,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        if interests.is_empty() {
            return Ok(());
        }
        // poll_add resolves with the revents mask, like poll(2).
        let entry = opcode::PollAdd::new(types::Fd(fd), poll_mask(interests)).build();
        let revents = self.async_io(entry, 0, timeout)?;
        if revents & libc::POLLNVAL as i32 != 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(())
    }

    pub fn wait_for_fd_readable(&self, fd: RawFd, timeout: Option<Duration>) -> io::Result<()> {
        self.wait_for_fd(fd, Interests::READ, timeout)
    }

    pub fn wait_for_fd_writable(&self, fd: RawFd, timeout: Option<Duration>) -> io::Result<()> {
        self.wait_for_fd(fd, Interests::WRITE, timeout)
    }

    /// Install `fd` into the fixed-file table at the slot matching its
    /// value, making it addressable through [`FIXED_FILE`](crate::FIXED_FILE).
    pub fn register_files(&self, fd: RawFd) -> io::Result<()> {
        self.update_registered_files(fd, true)
    }

    /// Return the slot to the sparse state.
    pub fn unregister_files(&self, fd: RawFd) -> io::Result<()> {
        self.update_registered_files(fd, false)
    }

    fn update_registered_files(&self, fd: RawFd, install: bool) -> io::Result<()> {
        if !probe::register_files_enabled() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if fd as usize >= REGISTER_FILES_MAX_NUM {
            warn!(fd, "fd to register exceeds the fixed-file table, ignoring");
            return Ok(());
        }
        let value = if install { fd } else { REGISTER_FILES_SPARSE_FD };
        self.ring
            .submitter()
            .register_files_update(fd as u32, &[value])
            .map(drop)
    }

    pub(crate) fn ring(&self) -> &IoUring {
        &self.ring
    }

    pub(crate) fn eventfd_raw(&self) -> RawFd {
        self.eventfd.as_raw_fd()
    }
}

impl Drop for RingEngine {
    fn drop(&mut self) {
        if self.role == Role::Cascading {
            if let Err(err) = self.ring.submitter().unregister_eventfd() {
                error!("failed to unregister cascading eventfd: {err}");
            }
        }
        info!(is_master = self.is_master(), "finish event engine: io_uring");
    }
}
