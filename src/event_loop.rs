//! Per-thread reactor: multiplexes OS readiness, timers, and cross-thread
//! task submission.
//!
//! Every loop owns exactly one OS thread. Channels, handlers, and
//! subscription callbacks only ever run on that thread; other threads talk
//! to a loop through its cloneable [`EventLoop`] handle, which marshals
//! work as [`Task`]s over an inbox and wakes the poller.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::channel::{Channel, ChannelEntry, ChannelId, ChannelInner};
use crate::clock::{Clock, MonotonicClock};
use crate::error::{Error, ErrorCode};
use crate::handler::ChannelHandler;
use crate::statistics::StatisticsHandler;
use crate::task::{LocalTaskFn, Scheduler, Task, TaskId, TaskStatus};

const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPING: u8 = 2;
const STATE_STOPPED: u8 = 3;

/// Readiness bits delivered to subscribers, normalized across platforms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSet {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

impl EventSet {
    pub(crate) const READABLE: EventSet = EventSet {
        readable: true,
        writable: false,
        hangup: false,
        error: false,
    };

    fn from_mio(event: &mio::event::Event) -> EventSet {
        EventSet {
            readable: event.is_readable(),
            writable: event.is_writable(),
            hangup: event.is_read_closed() || event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

/// Loop-local owner of a registered I/O source (listeners, in-flight
/// connects). Channels route through their terminal handler instead.
pub(crate) trait EventSubscriber {
    fn on_io_event(&mut self, ctx: &mut LoopCtx<'_>, events: EventSet);

    /// The subscriber was removed from the loop via
    /// [`LoopCtx::take_subscriber`]; deregister owned sources here.
    fn on_removed(&mut self, _ctx: &mut LoopCtx<'_>) {}
}

/// Where readiness for a token is delivered.
pub(crate) enum IoTarget {
    Channel(ChannelId),
    Subscriber(Rc<RefCell<dyn EventSubscriber>>),
}

struct InboxMsg {
    task: Task,
    run_at_ns: u64,
}

struct LoopShared {
    tx: Sender<InboxMsg>,
    waker: Waker,
    state: AtomicU8,
    thread_id: parking_lot::RwLock<Option<ThreadId>>,
    join: parking_lot::Mutex<Option<JoinHandle<()>>>,
    clock: Arc<dyn Clock>,
}

/// Thread-safe handle to an event loop.
///
/// Cheap to clone; all methods may be called from any thread.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<LoopShared>,
}

impl EventLoop {
    pub(crate) fn new(clock: Arc<dyn Clock>) -> Result<(EventLoop, CoreSeed), Error> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let registry = poll.registry().try_clone()?;
        let (tx, rx) = crossbeam_channel::unbounded();

        let shared = Arc::new(LoopShared {
            tx,
            waker,
            state: AtomicU8::new(STATE_CREATED),
            thread_id: parking_lot::RwLock::new(None),
            join: parking_lot::Mutex::new(None),
            clock: clock.clone(),
        });

        let handle = EventLoop {
            shared: shared.clone(),
        };

        let seed = CoreSeed {
            poll,
            registry,
            inbox: rx,
            clock,
            handle: handle.clone(),
            shared,
        };

        Ok((handle, seed))
    }

    /// Submit a task to run on the next loop turn.
    ///
    /// Fails with `EVENT_LOOP_SHUTDOWN` once the loop is stopping; the
    /// rejected task is dropped, releasing whatever it owns.
    pub fn schedule_task_now(&self, task: Task) -> Result<(), Error> {
        self.submit(task, 0)
    }

    /// Submit a task to run at `run_at_ns` on this loop's clock. Times in
    /// the past run on the next turn.
    pub fn schedule_task_future(&self, task: Task, run_at_ns: u64) -> Result<(), Error> {
        self.submit(task, run_at_ns)
    }

    fn submit(&self, task: Task, run_at_ns: u64) -> Result<(), Error> {
        if self.shared.state.load(Ordering::Acquire) >= STATE_STOPPING {
            return Err(Error::new(ErrorCode::EVENT_LOOP_SHUTDOWN));
        }
        self.shared
            .tx
            .send(InboxMsg { task, run_at_ns })
            .map_err(|_| Error::new(ErrorCode::EVENT_LOOP_SHUTDOWN))?;
        if let Err(e) = self.shared.waker.wake() {
            warn!("event loop wake failed: {e}");
        }
        Ok(())
    }

    /// Request cooperative termination. Channels still bound to the loop
    /// are shut down abortively; the owned thread exits once they drain.
    pub fn stop(&self) {
        let state = &self.shared.state;
        loop {
            let cur = state.load(Ordering::Acquire);
            if cur >= STATE_STOPPING {
                return;
            }
            if state
                .compare_exchange(cur, STATE_STOPPING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        let _ = self.shared.waker.wake();
    }

    /// Block until the owned thread has exited. Idempotent. A call from
    /// the loop's own thread is refused rather than deadlocking.
    pub fn join(&self) {
        if self.on_loop_thread() {
            warn!("refusing to join the event loop from its own thread");
            return;
        }
        let handle = self.shared.join.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Whether the caller is on this loop's thread.
    pub fn on_loop_thread(&self) -> bool {
        *self.shared.thread_id.read() == Some(thread::current().id())
    }

    /// Current time on this loop's clock.
    pub fn now_ns(&self) -> u64 {
        self.shared.clock.now_ns()
    }

    pub(crate) fn spawn(&self, seed: CoreSeed, name: String) -> Result<(), Error> {
        let handle = thread::Builder::new()
            .name(name)
            // The core holds loop-local (non-Send) state, so it is built on
            // its own thread from the Send seed.
            .spawn(move || seed.into_core().run())
            .map_err(Error::from)?;
        *self.shared.join.lock() = Some(handle);
        Ok(())
    }
}

/// The Send subset of loop state; everything loop-local is created on the
/// owning thread in [`CoreSeed::into_core`].
pub(crate) struct CoreSeed {
    poll: Poll,
    registry: Registry,
    inbox: Receiver<InboxMsg>,
    clock: Arc<dyn Clock>,
    handle: EventLoop,
    shared: Arc<LoopShared>,
}

impl CoreSeed {
    pub(crate) fn into_core(self) -> LoopCore {
        LoopCore {
            poll: self.poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            registry: self.registry,
            scheduler: Scheduler::new(),
            inbox: self.inbox,
            subscribers: Slab::new(),
            channels: Slab::new(),
            channel_generation: 0,
            clock: self.clock,
            handle: self.handle,
            shared: self.shared,
            stop_initiated: false,
        }
    }
}

/// The reactor state owned by the loop thread.
pub(crate) struct LoopCore {
    poll: Poll,
    events: Events,
    registry: Registry,
    scheduler: Scheduler,
    inbox: Receiver<InboxMsg>,
    subscribers: Slab<IoTarget>,
    channels: Slab<ChannelEntry>,
    channel_generation: u32,
    clock: Arc<dyn Clock>,
    handle: EventLoop,
    shared: Arc<LoopShared>,
    stop_initiated: bool,
}

impl LoopCore {
    pub(crate) fn run(mut self) {
        *self.shared.thread_id.write() = Some(thread::current().id());
        let _ = self.shared.state.compare_exchange(
            STATE_CREATED,
            STATE_RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        debug!("event loop started");

        loop {
            self.drain_inbox();

            let stopping = self.shared.state.load(Ordering::Acquire) >= STATE_STOPPING;
            if stopping && !self.stop_initiated {
                self.stop_initiated = true;
                self.shut_down_remaining_channels();
            }
            if stopping && self.channels.is_empty() {
                break;
            }

            let timeout = self.poll_timeout(stopping);
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("poll failed, stopping loop: {e}");
                    break;
                }
            }

            let ready: Vec<(Token, EventSet)> = self
                .events
                .iter()
                .filter(|e| e.token() != WAKER_TOKEN)
                .map(|e| (e.token(), EventSet::from_mio(e)))
                .collect();

            for (token, events) in ready {
                self.dispatch_io(token, events);
            }

            self.run_due_tasks();
        }

        self.teardown();
        self.shared.state.store(STATE_STOPPED, Ordering::Release);
        debug!("event loop stopped");
    }

    /// Run a single turn with a zero poll timeout. Test-only driver so
    /// channel and handler semantics can be exercised deterministically
    /// without spawning the owned thread.
    #[cfg(test)]
    pub(crate) fn turn(&mut self) {
        *self.shared.thread_id.write() = Some(thread::current().id());
        self.drain_inbox();
        if self
            .poll
            .poll(&mut self.events, Some(Duration::ZERO))
            .is_ok()
        {
            let ready: Vec<(Token, EventSet)> = self
                .events
                .iter()
                .filter(|e| e.token() != WAKER_TOKEN)
                .map(|e| (e.token(), EventSet::from_mio(e)))
                .collect();
            for (token, events) in ready {
                self.dispatch_io(token, events);
            }
        }
        self.run_due_tasks();
    }

    #[cfg(test)]
    pub(crate) fn with_ctx<R>(&mut self, f: impl FnOnce(&mut LoopCtx<'_>) -> R) -> R {
        let mut ctx = loop_ctx(self);
        f(&mut ctx)
    }

    #[cfg(test)]
    pub(crate) fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn drain_inbox(&mut self) {
        while let Ok(InboxMsg { task, run_at_ns }) = self.inbox.try_recv() {
            let callback: LocalTaskFn = task.callback;
            self.scheduler.schedule_at(task.label, callback, run_at_ns);
        }
    }

    fn poll_timeout(&mut self, stopping: bool) -> Option<Duration> {
        // Bounded waits while draining so shutdown can't stall on a missed
        // wakeup.
        let drain_cap = Duration::from_millis(10);
        match self.scheduler.next_due_ns() {
            Some(due) => {
                let now = self.clock.now_ns();
                let until_due = Duration::from_nanos(due.saturating_sub(now));
                Some(if stopping { until_due.min(drain_cap) } else { until_due })
            }
            None if stopping => Some(drain_cap),
            None => None,
        }
    }

    fn shut_down_remaining_channels(&mut self) {
        let remaining: Vec<_> = self
            .channels
            .iter()
            .map(|(_, entry)| entry.inner.clone())
            .collect();
        if !remaining.is_empty() {
            debug!(
                channels = remaining.len(),
                "loop stopping with active channels, shutting them down"
            );
        }
        let mut ctx = loop_ctx(self);
        for inner in remaining {
            crate::channel::request_shutdown(&inner, &mut ctx, ErrorCode::EVENT_LOOP_SHUTDOWN, true);
        }
    }

    fn dispatch_io(&mut self, token: Token, events: EventSet) {
        enum Routed {
            Channel(ChannelId),
            Subscriber(Rc<RefCell<dyn EventSubscriber>>),
            Stale,
        }
        let routed = match self.subscribers.get(token.0) {
            Some(IoTarget::Channel(id)) => Routed::Channel(*id),
            Some(IoTarget::Subscriber(rc)) => Routed::Subscriber(rc.clone()),
            None => Routed::Stale,
        };
        match routed {
            Routed::Channel(id) => match lookup_channel(&self.channels, id) {
                Some(inner) => {
                    let mut ctx = loop_ctx(self);
                    crate::channel::dispatch_io(&inner, &mut ctx, events);
                }
                None => trace!(?token, "io event for released channel"),
            },
            Routed::Subscriber(target) => {
                let mut ctx = loop_ctx(self);
                target.borrow_mut().on_io_event(&mut ctx, events);
            }
            Routed::Stale => trace!(?token, "io event for unsubscribed token"),
        }
    }

    fn run_due_tasks(&mut self) {
        let now = self.clock.now_ns();
        let due = self.scheduler.take_due(now);
        for (_, task) in due {
            trace!(label = task.label, "running task");
            let mut ctx = loop_ctx(self);
            (task.callback)(&mut ctx, TaskStatus::RunReady);
        }
    }

    fn teardown(&mut self) {
        // Reject anything still in flight in the inbox, then cancel what
        // the scheduler holds. Cancel callbacks may schedule follow-ups;
        // drain until quiet.
        self.drain_inbox();
        loop {
            let rest = self.scheduler.drain_all();
            if rest.is_empty() {
                break;
            }
            for (_, task) in rest {
                trace!(label = task.label, "canceling task at loop teardown");
                let mut ctx = loop_ctx(self);
                (task.callback)(&mut ctx, TaskStatus::Canceled);
            }
        }
        self.subscribers.clear();
    }
}

fn lookup_channel(channels: &Slab<ChannelEntry>, id: ChannelId) -> Option<Rc<RefCell<ChannelInner>>> {
    channels
        .get(id.index())
        .filter(|entry| entry.generation == id.generation())
        .map(|entry| entry.inner.clone())
}

fn loop_ctx(core: &mut LoopCore) -> LoopCtx<'_> {
    LoopCtx {
        registry: &core.registry,
        scheduler: &mut core.scheduler,
        subscribers: &mut core.subscribers,
        channels: &mut core.channels,
        channel_generation: &mut core.channel_generation,
        clock: &core.clock,
        handle: &core.handle,
    }
}

/// Short-lived view of the loop internals handed to tasks, subscribers, and
/// channel handlers. Everything here is loop-thread only.
pub struct LoopCtx<'a> {
    pub(crate) registry: &'a Registry,
    pub(crate) scheduler: &'a mut Scheduler,
    pub(crate) subscribers: &'a mut Slab<IoTarget>,
    pub(crate) channels: &'a mut Slab<ChannelEntry>,
    pub(crate) channel_generation: &'a mut u32,
    pub(crate) clock: &'a Arc<dyn Clock>,
    pub(crate) handle: &'a EventLoop,
}

impl LoopCtx<'_> {
    pub fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    /// Handle to the loop this context belongs to.
    pub fn event_loop(&self) -> EventLoop {
        self.handle.clone()
    }

    /// Schedule work for the next turn. On-thread fast path: no inbox, no
    /// `Send` bound.
    pub fn schedule_now(
        &mut self,
        label: &'static str,
        callback: impl FnOnce(&mut LoopCtx<'_>, TaskStatus) + 'static,
    ) -> TaskId {
        self.scheduler.schedule_now(label, Box::new(callback))
    }

    /// Schedule work at an absolute time on this loop's clock.
    pub fn schedule_at(
        &mut self,
        label: &'static str,
        run_at_ns: u64,
        callback: impl FnOnce(&mut LoopCtx<'_>, TaskStatus) + 'static,
    ) -> TaskId {
        self.scheduler
            .schedule_at(label, Box::new(callback), run_at_ns)
    }

    /// Schedule work after a delay.
    pub fn schedule_in(
        &mut self,
        label: &'static str,
        delay: Duration,
        callback: impl FnOnce(&mut LoopCtx<'_>, TaskStatus) + 'static,
    ) -> TaskId {
        let run_at = self.now_ns().saturating_add(delay.as_nanos() as u64);
        self.schedule_at(label, run_at, callback)
    }

    /// Cancel a pending task. The callback still runs, with
    /// [`TaskStatus::Canceled`]. Idempotent.
    pub fn cancel_task(&mut self, id: TaskId) {
        if let Some(task) = self.scheduler.cancel(id) {
            trace!(label = task.label, "canceling task");
            (task.callback)(self, TaskStatus::Canceled);
        }
    }

    pub(crate) fn register_io(
        &mut self,
        source: &mut impl Source,
        interests: Interest,
        target: IoTarget,
    ) -> Result<Token, Error> {
        let entry = self.subscribers.vacant_entry();
        let token = Token(entry.key());
        self.registry.register(source, token, interests)?;
        entry.insert(target);
        Ok(token)
    }

    pub(crate) fn reregister_io(
        &mut self,
        source: &mut impl Source,
        token: Token,
        interests: Interest,
    ) -> Result<(), Error> {
        self.registry.reregister(source, token, interests)?;
        Ok(())
    }

    /// Remove a subscriber from the token table without touching its
    /// source registration; the caller invokes
    /// [`EventSubscriber::on_removed`] on the returned target.
    pub(crate) fn take_subscriber(&mut self, token: Token) -> Option<IoTarget> {
        self.subscribers.try_remove(token.0)
    }

    /// Idempotent removal; late readiness events for the token are dropped.
    pub(crate) fn deregister_io(&mut self, source: &mut impl Source, token: Token) {
        if self.subscribers.try_remove(token.0).is_some() {
            if let Err(e) = self.registry.deregister(source) {
                trace!("deregister failed: {e}");
            }
        }
    }

    pub(crate) fn insert_channel(&mut self, inner: Rc<RefCell<ChannelInner>>) -> ChannelId {
        *self.channel_generation = self.channel_generation.wrapping_add(1);
        let generation = *self.channel_generation;
        let index = self.channels.insert(ChannelEntry { generation, inner });
        ChannelId::new(index, generation)
    }

    pub(crate) fn remove_channel(&mut self, id: ChannelId) {
        if let Some(entry) = self.channels.get(id.index()) {
            if entry.generation == id.generation() {
                self.channels.remove(id.index());
            }
        }
    }

    pub(crate) fn channel_inner(&self, id: ChannelId) -> Option<Rc<RefCell<ChannelInner>>> {
        lookup_channel(self.channels, id)
    }

    /// Append a handler to a channel's slot chain. Only legal on the
    /// channel's loop, during or after setup, before shutdown begins.
    pub fn channel_append_handler(
        &mut self,
        channel: &Channel,
        handler: Box<dyn ChannelHandler>,
    ) -> Result<(), Error> {
        let inner = self
            .channel_inner(channel.id())
            .ok_or_else(|| Error::new(ErrorCode::CHANNEL_SHUT_DOWN))?;
        crate::channel::append_handler(&inner, self, handler)
    }

    /// Attach a statistics observer. Must run on the channel's loop before
    /// first I/O.
    pub fn channel_set_statistics_handler(
        &mut self,
        channel: &Channel,
        handler: Box<dyn StatisticsHandler>,
    ) -> Result<(), Error> {
        let inner = self
            .channel_inner(channel.id())
            .ok_or_else(|| Error::new(ErrorCode::CHANNEL_SHUT_DOWN))?;
        crate::channel::set_statistics_handler(&inner, self, handler)
    }

    /// Send a write message into a channel's pipeline from task context,
    /// entering at `slot` and flowing toward the socket.
    pub fn channel_send_write(
        &mut self,
        channel: &Channel,
        slot: usize,
        message: crate::message::Message,
    ) -> Result<(), Error> {
        let inner = self
            .channel_inner(channel.id())
            .ok_or_else(|| Error::new(ErrorCode::CHANNEL_SHUT_DOWN))?;
        crate::channel::send_write(&inner, self, slot, message)
    }

    /// Number of slots currently in the channel's pipeline.
    pub fn channel_slot_count(&self, channel: &Channel) -> Option<usize> {
        self.channel_inner(channel.id())
            .map(|inner| inner.borrow().slot_count())
    }

    /// Begin channel shutdown from on-thread.
    pub fn channel_shutdown(&mut self, channel: &Channel, error: ErrorCode) {
        if let Some(inner) = self.channel_inner(channel.id()) {
            crate::channel::request_shutdown(&inner, self, error, false);
        }
    }

    /// Grow a slot's read window from on-thread.
    pub fn channel_increment_read_window(&mut self, channel: &Channel, slot: usize, delta: usize) {
        if let Some(inner) = self.channel_inner(channel.id()) {
            crate::channel::increment_read_window(&inner, self, slot, delta);
        }
    }
}

/// Options for [`EventLoopGroup::new`].
pub struct EventLoopGroupOptions {
    /// Number of loops (and threads). `0` means one per available core.
    pub loop_count: usize,
    /// Override the monotonic clock, e.g. for tests.
    pub clock: Option<Arc<dyn Clock>>,
}

impl Default for EventLoopGroupOptions {
    fn default() -> Self {
        EventLoopGroupOptions {
            loop_count: 0,
            clock: None,
        }
    }
}

/// A fixed set of event loops, each on its own thread, with round-robin
/// assignment of new channels.
pub struct EventLoopGroup {
    loops: Vec<EventLoop>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    pub fn new(options: EventLoopGroupOptions) -> Result<EventLoopGroup, Error> {
        let count = if options.loop_count == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            options.loop_count
        };
        let clock: Arc<dyn Clock> = options
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));

        let mut loops = Vec::with_capacity(count);
        for i in 0..count {
            let (handle, seed) = EventLoop::new(clock.clone())?;
            handle.spawn(seed, format!("loomio-loop-{i}"))?;
            loops.push(handle);
        }
        debug!(count, "event loop group started");

        Ok(EventLoopGroup {
            loops,
            next: AtomicUsize::new(0),
        })
    }

    /// Pick the next loop, round-robin.
    pub fn next_loop(&self) -> &EventLoop {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        &self.loops[i]
    }

    pub fn loops(&self) -> &[EventLoop] {
        &self.loops
    }

    /// Stop every loop and join its thread. Channels still alive are shut
    /// down with `EVENT_LOOP_SHUTDOWN` before their loop exits.
    pub fn shutdown(&self) {
        for l in &self.loops {
            l.stop();
        }
        for l in &self.loops {
            l.join();
        }
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub(crate) fn test_loop() -> (EventLoop, LoopCore) {
    let clock: Arc<dyn Clock> = Arc::new(crate::clock::ManualClock::new());
    let (handle, seed) = EventLoop::new(clock).unwrap();
    (handle, seed.into_core())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn local_tasks_run_in_order() {
        let (_handle, mut core) = test_loop();
        let log = Rc::new(RefCell::new(Vec::new()));

        let (a, b) = (log.clone(), log.clone());
        core.with_ctx(|ctx| {
            ctx.schedule_now("first", move |_, _| a.borrow_mut().push(1));
            ctx.schedule_now("second", move |_, _| b.borrow_mut().push(2));
        });
        core.turn();

        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn canceled_task_sees_canceled_status() {
        let (_handle, mut core) = test_loop();
        let seen = Rc::new(RefCell::new(None));

        let s = seen.clone();
        core.with_ctx(|ctx| {
            let id = ctx.schedule_at("victim", 1_000_000, move |_, status| {
                *s.borrow_mut() = Some(status);
            });
            ctx.cancel_task(id);
        });

        assert_eq!(*seen.borrow(), Some(TaskStatus::Canceled));
    }

    #[test]
    fn cross_thread_submission_is_rejected_after_stop() {
        let (handle, _core) = test_loop();
        handle.stop();
        let err = handle
            .schedule_task_now(Task::new("late", |_, _| {}))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::EVENT_LOOP_SHUTDOWN);
    }

    #[test]
    fn handle_submission_lands_in_scheduler() {
        let (handle, mut core) = test_loop();
        let hits = Arc::new(Mutex::new(0));

        let h = hits.clone();
        handle
            .schedule_task_now(Task::new("poke", move |_, _| {
                *h.lock().unwrap() += 1;
            }))
            .unwrap();

        core.turn();
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn timer_fires_only_when_clock_reaches_it() {
        let clock = Arc::new(crate::clock::ManualClock::new());
        let (_handle, seed) = EventLoop::new(clock.clone() as Arc<dyn Clock>).unwrap();
        let mut core = seed.into_core();
        let hits = Rc::new(RefCell::new(0));

        let h = hits.clone();
        core.with_ctx(|ctx| {
            ctx.schedule_at("timer", 500, move |_, _| *h.borrow_mut() += 1);
        });

        core.turn();
        assert_eq!(*hits.borrow(), 0);

        clock.advance(500);
        core.turn();
        assert_eq!(*hits.borrow(), 1);
    }
}
