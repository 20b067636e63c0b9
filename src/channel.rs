//! Bidirectional pipeline of handler slots bound to one event loop.
//!
//! Slots are appended during setup; read messages flow from the first
//! (terminal, usually socket) slot toward the last (user) slot, writes flow
//! the other way. Each slot carries the emit budget its upstream consumer
//! has granted. The channel also owns the two-direction shutdown state
//! machine and the per-channel statistics record.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tracing::{trace, warn};

use crate::error::{Error, ErrorCode};
use crate::event_loop::{EventLoop, EventSet, LoopCtx};
use crate::handler::{ChannelHandler, SlotCtx};
use crate::message::Message;
use crate::statistics::{ChannelStatistics, StatisticsHandler};
use crate::task::{Task, TaskId, TaskStatus};

/// Identifies a channel on its loop. Index plus generation so stale handles
/// held across a slot reuse resolve to nothing instead of someone else's
/// channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelId {
    index: u32,
    generation: u32,
}

impl ChannelId {
    pub(crate) fn new(index: usize, generation: u32) -> ChannelId {
        ChannelId {
            index: index as u32,
            generation,
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index as usize
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }
}

pub(crate) struct ChannelEntry {
    pub(crate) generation: u32,
    pub(crate) inner: Rc<RefCell<ChannelInner>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Active,
    ShuttingDownRead,
    ShuttingDownWrite,
    ShutdownComplete,
}

/// Direction of message flow. `Read` moves toward the user, `Write` toward
/// the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Thread-safe handle to a channel.
///
/// The only legal cross-thread operations are the ones here; each marshals
/// to a task on the channel's loop.
#[derive(Clone)]
pub struct Channel {
    id: ChannelId,
    event_loop: EventLoop,
}

impl Channel {
    pub(crate) fn new(id: ChannelId, event_loop: EventLoop) -> Channel {
        Channel { id, event_loop }
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Request shutdown with `error`. Idempotent; a later non-success error
    /// upgrades the recorded error only if the stored one is success.
    pub fn shutdown(&self, error: ErrorCode) -> Result<(), Error> {
        let id = self.id;
        self.event_loop
            .schedule_task_now(Task::new("channel_shutdown", move |ctx, _| {
                if let Some(inner) = ctx.channel_inner(id) {
                    request_shutdown(&inner, ctx, error, false);
                }
            }))
    }

    /// Like [`shutdown`](Channel::shutdown) but drops buffered work instead
    /// of flushing it.
    pub fn shutdown_immediately(&self, error: ErrorCode) -> Result<(), Error> {
        let id = self.id;
        self.event_loop
            .schedule_task_now(Task::new("channel_shutdown", move |ctx, _| {
                if let Some(inner) = ctx.channel_inner(id) {
                    request_shutdown(&inner, ctx, error, true);
                }
            }))
    }

    /// Handle to one slot of this channel.
    pub fn slot(&self, index: usize) -> ChannelSlot {
        ChannelSlot {
            channel: self.clone(),
            index,
        }
    }
}

/// Cross-thread handle to a single slot.
#[derive(Clone)]
pub struct ChannelSlot {
    channel: Channel,
    index: usize,
}

impl ChannelSlot {
    /// Grow this slot's read window by `delta` from any thread. The credit
    /// is marshalled to the channel's loop and applied even when a shutdown
    /// has already been posted, so data cached under a closed window still
    /// drains before the shutdown completes.
    pub fn increment_read_window(&self, delta: usize) -> Result<(), Error> {
        let id = self.channel.id;
        let slot = self.index;
        self.channel
            .event_loop
            .schedule_task_now(Task::new("window_increment", move |ctx, status| {
                if status == TaskStatus::Canceled {
                    return;
                }
                if let Some(inner) = ctx.channel_inner(id) {
                    increment_read_window(&inner, ctx, slot, delta);
                }
            }))
    }
}

pub(crate) type SetupFn = Box<dyn FnOnce(&mut LoopCtx<'_>, Channel, ErrorCode)>;
pub(crate) type ShutdownFn = Box<dyn FnOnce(&mut LoopCtx<'_>, ErrorCode)>;

pub(crate) struct ChannelOptions {
    pub(crate) enable_read_back_pressure: bool,
    pub(crate) on_setup_completed: SetupFn,
    pub(crate) on_shutdown_completed: Option<ShutdownFn>,
}

struct Slot {
    handler: Option<Box<dyn ChannelHandler>>,
    /// Bytes this slot may still emit upstream.
    window: usize,
}

pub(crate) struct ChannelInner {
    id: ChannelId,
    event_loop: EventLoop,
    slots: Vec<Slot>,
    state: ChannelState,
    shutdown_error: ErrorCode,
    free_scarce: bool,
    shutdown_posted: bool,
    read_back_pressure: bool,
    on_setup: Option<SetupFn>,
    on_shutdown: Option<ShutdownFn>,
    stats: ChannelStatistics,
    stats_handler: Option<Box<dyn StatisticsHandler>>,
    stats_task: Option<TaskId>,
    first_io_seen: bool,
}

/// Create a channel bound to the current loop. The setup callback fires
/// from an immediate task, after the channel is registered but before any
/// handler exists, so the caller can append handlers synchronously from
/// on-thread.
pub(crate) fn create(ctx: &mut LoopCtx<'_>, options: ChannelOptions) -> Rc<RefCell<ChannelInner>> {
    let inner = Rc::new(RefCell::new(ChannelInner {
        id: ChannelId::new(0, 0),
        event_loop: ctx.event_loop(),
        slots: Vec::new(),
        state: ChannelState::Active,
        shutdown_error: ErrorCode::SUCCESS,
        free_scarce: false,
        shutdown_posted: false,
        read_back_pressure: options.enable_read_back_pressure,
        on_setup: Some(options.on_setup_completed),
        on_shutdown: options.on_shutdown_completed,
        stats: ChannelStatistics::default(),
        stats_handler: None,
        stats_task: None,
        first_io_seen: false,
    }));

    let id = ctx.insert_channel(inner.clone());
    inner.borrow_mut().id = id;

    let setup_rc = inner.clone();
    ctx.schedule_now("channel_setup", move |ctx, status| {
        let (callback, handle) = {
            let mut ch = setup_rc.borrow_mut();
            let handle = ch.handle();
            let callback = ch.on_setup.take();
            if status == TaskStatus::Canceled {
                // Setup failed: the shutdown callback must never follow.
                ch.on_shutdown = None;
            }
            (callback, handle)
        };
        if let Some(callback) = callback {
            let code = match status {
                TaskStatus::RunReady => ErrorCode::SUCCESS,
                TaskStatus::Canceled => ErrorCode::EVENT_LOOP_SHUTDOWN,
            };
            callback(ctx, handle, code);
        }
    });

    inner
}

/// Route OS readiness (or a scheduled resume) to the terminal handler.
pub(crate) fn dispatch_io(inner: &Rc<RefCell<ChannelInner>>, ctx: &mut LoopCtx<'_>, events: EventSet) {
    let mut ch = inner.borrow_mut();
    ch.first_io_seen = true;
    if ch.state == ChannelState::ShutdownComplete {
        return;
    }
    ch.with_handler(ctx, 0, |handler, sctx| handler.on_io_event(sctx, events));
}

pub(crate) fn dispatch_slot_timeout(
    inner: &Rc<RefCell<ChannelInner>>,
    ctx: &mut LoopCtx<'_>,
    slot: usize,
) {
    let mut ch = inner.borrow_mut();
    if ch.state == ChannelState::ShutdownComplete {
        return;
    }
    ch.with_handler(ctx, slot, |handler, sctx| handler.on_timeout(sctx));
}

pub(crate) fn append_handler(
    inner: &Rc<RefCell<ChannelInner>>,
    ctx: &mut LoopCtx<'_>,
    handler: Box<dyn ChannelHandler>,
) -> Result<(), Error> {
    let mut ch = inner.borrow_mut();
    if ch.state != ChannelState::Active {
        return Err(Error::new(ErrorCode::CHANNEL_SHUT_DOWN));
    }
    let index = ch.slots.len();
    let granted = handler.initial_window_size();
    if index > 0 {
        ch.slots[index - 1].window = if ch.read_back_pressure {
            granted
        } else {
            usize::MAX
        };
    }
    trace!(slot = index, handler = handler.name(), "appending handler");
    ch.slots.push(Slot {
        handler: Some(handler),
        window: 0,
    });
    ch.with_handler(ctx, index, |handler, sctx| handler.on_attached(sctx));
    if index > 0 {
        // The slot below just gained an upstream consumer; its handler may
        // have data waiting for exactly this credit.
        ch.with_handler(ctx, index - 1, |handler, sctx| {
            handler.increment_read_window(sctx, granted)
        });
    }
    Ok(())
}

pub(crate) fn request_shutdown(
    inner: &Rc<RefCell<ChannelInner>>,
    ctx: &mut LoopCtx<'_>,
    error: ErrorCode,
    free_scarce: bool,
) {
    inner.borrow_mut().post_shutdown(ctx, error, free_scarce);
}

pub(crate) fn increment_read_window(
    inner: &Rc<RefCell<ChannelInner>>,
    ctx: &mut LoopCtx<'_>,
    slot: usize,
    delta: usize,
) {
    let mut ch = inner.borrow_mut();
    if ch.state == ChannelState::ShutdownComplete {
        return;
    }
    ch.increment_read_window_from(ctx, slot, delta);
}

pub(crate) fn send_write(
    inner: &Rc<RefCell<ChannelInner>>,
    ctx: &mut LoopCtx<'_>,
    slot: usize,
    message: Message,
) -> Result<(), Error> {
    inner.borrow_mut().send_write(ctx, slot, message)
}

pub(crate) fn set_statistics_handler(
    inner: &Rc<RefCell<ChannelInner>>,
    ctx: &mut LoopCtx<'_>,
    handler: Box<dyn StatisticsHandler>,
) -> Result<(), Error> {
    let interval = {
        let mut ch = inner.borrow_mut();
        if ch.first_io_seen || ch.state != ChannelState::Active {
            return Err(Error::new(ErrorCode::INVALID_STATE));
        }
        let interval = handler.report_interval();
        ch.stats_handler = Some(handler);
        interval
    };
    arm_stats_flush(ctx, inner, interval);
    Ok(())
}

fn arm_stats_flush(ctx: &mut LoopCtx<'_>, inner: &Rc<RefCell<ChannelInner>>, interval: Duration) {
    let id = inner.borrow().id;
    let task = ctx.schedule_in("stats_flush", interval, move |ctx, status| {
        if status == TaskStatus::Canceled {
            return;
        }
        let Some(inner) = ctx.channel_inner(id) else {
            return;
        };
        let next = {
            let mut ch = inner.borrow_mut();
            if ch.state == ChannelState::ShutdownComplete {
                None
            } else {
                let ChannelInner {
                    stats,
                    stats_handler,
                    ..
                } = &mut *ch;
                stats_handler.as_mut().map(|h| {
                    h.report(stats);
                    h.report_interval()
                })
            }
        };
        if let Some(interval) = next {
            arm_stats_flush(ctx, &inner, interval);
        }
    });
    inner.borrow_mut().stats_task = Some(task);
}

impl ChannelInner {
    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn handle(&self) -> Channel {
        Channel::new(self.id, self.event_loop.clone())
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state
    }

    pub(crate) fn stats_mut(&mut self) -> &mut ChannelStatistics {
        &mut self.stats
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown_posted || self.state != ChannelState::Active
    }

    /// Remaining emit budget of `slot` toward the user. The last slot has
    /// no upstream consumer and therefore no budget; without backpressure
    /// every other slot is unbounded.
    pub(crate) fn slot_window(&self, slot: usize) -> usize {
        if slot + 1 >= self.slots.len() {
            return 0;
        }
        if !self.read_back_pressure {
            return usize::MAX;
        }
        self.slots.get(slot).map(|s| s.window).unwrap_or(0)
    }

    /// Run a handler callback with the handler temporarily taken out of its
    /// slot, so the callback can re-enter the channel through [`SlotCtx`].
    fn with_handler<R>(
        &mut self,
        ctx: &mut LoopCtx<'_>,
        slot: usize,
        f: impl FnOnce(&mut dyn ChannelHandler, &mut SlotCtx<'_, '_>) -> R,
    ) -> Option<R> {
        let mut handler = self.slots.get_mut(slot)?.handler.take()?;
        let result = {
            let mut sctx = SlotCtx {
                channel: self,
                slot,
                loop_ctx: ctx,
            };
            f(handler.as_mut(), &mut sctx)
        };
        self.slots[slot].handler = Some(handler);
        Some(result)
    }

    pub(crate) fn send_read(
        &mut self,
        ctx: &mut LoopCtx<'_>,
        from: usize,
        message: Message,
    ) -> Result<(), Error> {
        if self.state == ChannelState::ShutdownComplete {
            return Err(Error::new(ErrorCode::CHANNEL_SHUT_DOWN));
        }
        let next = from + 1;
        if next >= self.slots.len() {
            return Err(Error::new(ErrorCode::INVALID_STATE));
        }
        let len = message.len();
        if self.read_back_pressure {
            let window = &mut self.slots[from].window;
            if len > *window {
                return Err(Error::new(ErrorCode::READ_WINDOW_EXCEEDED));
            }
            *window -= len;
        }
        let outcome = self.with_handler(ctx, next, move |handler, sctx| {
            handler.process_read(sctx, message)
        });
        self.handle_dispatch_result(ctx, next, outcome);
        Ok(())
    }

    pub(crate) fn send_write(
        &mut self,
        ctx: &mut LoopCtx<'_>,
        from: usize,
        message: Message,
    ) -> Result<(), Error> {
        if self.state == ChannelState::ShutdownComplete {
            return Err(Error::new(ErrorCode::CHANNEL_SHUT_DOWN));
        }
        if from == 0 {
            return Err(Error::new(ErrorCode::INVALID_STATE));
        }
        let next = from - 1;
        let outcome = self.with_handler(ctx, next, move |handler, sctx| {
            handler.process_write(sctx, message)
        });
        self.handle_dispatch_result(ctx, next, outcome);
        Ok(())
    }

    fn handle_dispatch_result(
        &mut self,
        ctx: &mut LoopCtx<'_>,
        slot: usize,
        outcome: Option<Result<(), Error>>,
    ) {
        match outcome {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                warn!(slot, "handler failed: {e}");
                self.post_shutdown(ctx, e.code(), false);
            }
            None => trace!(slot, "message dropped: no handler in slot"),
        }
    }

    pub(crate) fn increment_read_window_from(
        &mut self,
        ctx: &mut LoopCtx<'_>,
        from: usize,
        delta: usize,
    ) {
        if !self.read_back_pressure || from == 0 || from > self.slots.len() {
            return;
        }
        let below = from - 1;
        let window = &mut self.slots[below].window;
        *window = window.saturating_add(delta);
        self.with_handler(ctx, below, |handler, sctx| {
            handler.increment_read_window(sctx, delta)
        });
    }

    /// Record a shutdown error and post the shutdown task if one is not
    /// already on its way. Safe from inside handler dispatch.
    pub(crate) fn post_shutdown(&mut self, ctx: &mut LoopCtx<'_>, error: ErrorCode, free_scarce: bool) {
        self.record_error(error);
        if free_scarce {
            self.free_scarce = true;
        }
        if self.shutdown_posted || self.state != ChannelState::Active {
            return;
        }
        self.shutdown_posted = true;
        trace!(error = %error, "posting channel shutdown");
        let id = self.id;
        ctx.schedule_now("channel_shutdown_begin", move |ctx, _| {
            if let Some(inner) = ctx.channel_inner(id) {
                begin_shutdown(&inner, ctx);
            }
        });
    }

    fn record_error(&mut self, error: ErrorCode) {
        if self.shutdown_error.is_ok() && !error.is_ok() {
            self.shutdown_error = error;
        }
    }

    /// A handler finished its shutdown in `direction`; advance the cascade.
    ///
    /// The advance always hops through an immediate task: the completing
    /// handler is usually still mid-callback (taken out of its slot), and
    /// the next step may target that very slot (the last slot turns around
    /// from read- to write-shutdown).
    pub(crate) fn handler_shutdown_complete(
        &mut self,
        ctx: &mut LoopCtx<'_>,
        slot: usize,
        direction: Direction,
        error: ErrorCode,
    ) {
        self.record_error(error);
        let id = self.id;
        ctx.schedule_now("channel_shutdown_advance", move |ctx, _| {
            if let Some(inner) = ctx.channel_inner(id) {
                advance_shutdown(&inner, ctx, slot, direction);
            }
        });
    }

    fn finish(&mut self, ctx: &mut LoopCtx<'_>) {
        self.state = ChannelState::ShutdownComplete;
        let id = self.id;
        // Finalize from a task so callbacks never run inside a nested
        // channel borrow.
        ctx.schedule_now("channel_shutdown_complete", move |ctx, _| {
            if let Some(inner) = ctx.channel_inner(id) {
                finish_shutdown(&inner, ctx);
            }
        });
    }
}

fn advance_shutdown(
    inner: &Rc<RefCell<ChannelInner>>,
    ctx: &mut LoopCtx<'_>,
    completed_slot: usize,
    direction: Direction,
) {
    let mut ch = inner.borrow_mut();
    if ch.state == ChannelState::ShutdownComplete {
        return;
    }
    let error = ch.shutdown_error;
    let free_scarce = ch.free_scarce;
    match direction {
        Direction::Read => {
            let next = completed_slot + 1;
            if next < ch.slots.len() {
                ch.with_handler(ctx, next, |handler, sctx| {
                    handler.shutdown(sctx, Direction::Read, error, free_scarce)
                });
            } else {
                ch.state = ChannelState::ShuttingDownWrite;
                let last = ch.slots.len() - 1;
                ch.with_handler(ctx, last, |handler, sctx| {
                    handler.shutdown(sctx, Direction::Write, error, free_scarce)
                });
            }
        }
        Direction::Write => {
            if completed_slot > 0 {
                ch.with_handler(ctx, completed_slot - 1, |handler, sctx| {
                    handler.shutdown(sctx, Direction::Write, error, free_scarce)
                });
            } else {
                ch.finish(ctx);
            }
        }
    }
}

fn begin_shutdown(inner: &Rc<RefCell<ChannelInner>>, ctx: &mut LoopCtx<'_>) {
    let mut ch = inner.borrow_mut();
    if ch.state != ChannelState::Active {
        return;
    }
    ch.state = ChannelState::ShuttingDownRead;
    let error = ch.shutdown_error;
    let free_scarce = ch.free_scarce;
    trace!(error = %error, "channel shutdown begins");
    if ch.slots.is_empty() {
        ch.finish(ctx);
        return;
    }
    ch.with_handler(ctx, 0, |handler, sctx| {
        handler.shutdown(sctx, Direction::Read, error, free_scarce)
    });
}

fn finish_shutdown(inner: &Rc<RefCell<ChannelInner>>, ctx: &mut LoopCtx<'_>) {
    let (id, error, callback, stats_task) = {
        let mut ch = inner.borrow_mut();
        (
            ch.id,
            ch.shutdown_error,
            ch.on_shutdown.take(),
            ch.stats_task.take(),
        )
    };
    if let Some(task) = stats_task {
        ctx.cancel_task(task);
    }
    ctx.remove_channel(id);
    trace!(error = %error, "channel shutdown complete");
    if let Some(callback) = callback {
        callback(ctx, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::test_loop;

    struct RecordingHandler {
        tag: &'static str,
        log: Rc<RefCell<Vec<String>>>,
        window: usize,
    }

    impl RecordingHandler {
        fn boxed(
            tag: &'static str,
            log: &Rc<RefCell<Vec<String>>>,
            window: usize,
        ) -> Box<dyn ChannelHandler> {
            Box::new(RecordingHandler {
                tag,
                log: log.clone(),
                window,
            })
        }

        fn note(&self, entry: String) {
            self.log.borrow_mut().push(format!("{}:{}", self.tag, entry));
        }
    }

    impl ChannelHandler for RecordingHandler {
        fn process_read(&mut self, _ctx: &mut SlotCtx<'_, '_>, message: Message) -> Result<(), Error> {
            self.note(format!("read {}", message.len()));
            Ok(())
        }

        fn process_write(&mut self, _ctx: &mut SlotCtx<'_, '_>, message: Message) -> Result<(), Error> {
            self.note(format!("write {}", message.len()));
            Ok(())
        }

        fn increment_read_window(&mut self, _ctx: &mut SlotCtx<'_, '_>, delta: usize) {
            self.note(format!("window {delta}"));
        }

        fn shutdown(
            &mut self,
            ctx: &mut SlotCtx<'_, '_>,
            direction: Direction,
            error: ErrorCode,
            _free_scarce_resources: bool,
        ) {
            self.note(format!("shutdown {direction:?}"));
            ctx.complete_shutdown(direction, error);
        }

        fn initial_window_size(&self) -> usize {
            self.window
        }

        fn name(&self) -> &'static str {
            self.tag
        }
    }

    fn make_channel(
        core: &mut crate::event_loop::LoopCore,
        back_pressure: bool,
        log: &Rc<RefCell<Vec<String>>>,
    ) -> Rc<RefCell<ChannelInner>> {
        let setup_log = log.clone();
        let inner = core.with_ctx(|ctx| {
            create(
                ctx,
                ChannelOptions {
                    enable_read_back_pressure: back_pressure,
                    on_setup_completed: Box::new(move |_, _, code| {
                        setup_log.borrow_mut().push(format!("setup:{}", code.0));
                    }),
                    on_shutdown_completed: {
                        let log = log.clone();
                        Some(Box::new(move |_, code| {
                            log.borrow_mut().push(format!("shutdown_cb:{}", code.0));
                        }))
                    },
                },
            )
        });
        core.turn();
        inner
    }

    #[test]
    fn setup_callback_fires_exactly_once_with_success() {
        let (_handle, mut core) = test_loop();
        let log = Rc::new(RefCell::new(Vec::new()));
        let inner = make_channel(&mut core, false, &log);

        assert_eq!(*log.borrow(), vec!["setup:0"]);
        assert_eq!(inner.borrow().state(), ChannelState::Active);

        core.turn();
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn send_read_respects_slot_window() {
        let (_handle, mut core) = test_loop();
        let log = Rc::new(RefCell::new(Vec::new()));
        let inner = make_channel(&mut core, true, &log);

        core.with_ctx(|ctx| {
            append_handler(&inner, ctx, RecordingHandler::boxed("sock", &log, 0)).unwrap();
            append_handler(&inner, ctx, RecordingHandler::boxed("user", &log, 8)).unwrap();

            let mut ch = inner.borrow_mut();
            assert_eq!(ch.slot_window(0), 8);

            ch.send_read(ctx, 0, Message::application(&b"12345"[..]))
                .unwrap();
            assert_eq!(ch.slot_window(0), 3);

            let err = ch
                .send_read(ctx, 0, Message::application(&b"12345"[..]))
                .unwrap_err();
            assert_eq!(err.code(), ErrorCode::READ_WINDOW_EXCEEDED);

            ch.increment_read_window_from(ctx, 1, 10);
            assert_eq!(ch.slot_window(0), 13);
            ch.send_read(ctx, 0, Message::application(&b"12345"[..]))
                .unwrap();
        });

        let log = log.borrow();
        assert!(log.contains(&"user:read 5".to_string()));
        assert!(log.contains(&"sock:window 10".to_string()));
    }

    #[test]
    fn windows_are_unbounded_without_back_pressure() {
        let (_handle, mut core) = test_loop();
        let log = Rc::new(RefCell::new(Vec::new()));
        let inner = make_channel(&mut core, false, &log);

        core.with_ctx(|ctx| {
            append_handler(&inner, ctx, RecordingHandler::boxed("sock", &log, 0)).unwrap();
            append_handler(&inner, ctx, RecordingHandler::boxed("user", &log, 8)).unwrap();

            let mut ch = inner.borrow_mut();
            assert_eq!(ch.slot_window(0), usize::MAX);
            let big = vec![0u8; 1 << 20];
            ch.send_read(ctx, 0, Message::application(&big[..])).unwrap();
        });
    }

    #[test]
    fn shutdown_cascades_read_then_write_and_fires_callback() {
        let (_handle, mut core) = test_loop();
        let log = Rc::new(RefCell::new(Vec::new()));
        let inner = make_channel(&mut core, false, &log);

        core.with_ctx(|ctx| {
            append_handler(&inner, ctx, RecordingHandler::boxed("sock", &log, 0)).unwrap();
            append_handler(&inner, ctx, RecordingHandler::boxed("user", &log, 8)).unwrap();
            request_shutdown(&inner, ctx, ErrorCode::SUCCESS, false);
        });
        // Begin task, one advance hop per cascade step, completion task.
        for _ in 0..8 {
            core.turn();
        }

        let log = log.borrow();
        let cascade: Vec<_> = log.iter().filter(|e| e.contains("shutdown")).cloned().collect();
        assert_eq!(
            cascade,
            vec![
                "sock:shutdown Read",
                "user:shutdown Read",
                "user:shutdown Write",
                "sock:shutdown Write",
                "shutdown_cb:0",
            ]
        );
        assert_eq!(core.channel_count(), 0);
    }

    #[test]
    fn first_error_is_sticky() {
        let (_handle, mut core) = test_loop();
        let log = Rc::new(RefCell::new(Vec::new()));
        let inner = make_channel(&mut core, false, &log);

        core.with_ctx(|ctx| {
            append_handler(&inner, ctx, RecordingHandler::boxed("sock", &log, 0)).unwrap();
            request_shutdown(&inner, ctx, ErrorCode::SOCKET_CLOSED, false);
            request_shutdown(&inner, ctx, ErrorCode::TLS_NEGOTIATION_FAILURE, false);
        });
        for _ in 0..8 {
            core.turn();
        }

        assert!(
            log.borrow()
                .contains(&format!("shutdown_cb:{}", ErrorCode::SOCKET_CLOSED.0))
        );
    }

    #[test]
    fn success_upgrades_to_later_error_before_cascade_finishes() {
        let (_handle, mut core) = test_loop();
        let log = Rc::new(RefCell::new(Vec::new()));
        let inner = make_channel(&mut core, false, &log);

        core.with_ctx(|ctx| {
            append_handler(&inner, ctx, RecordingHandler::boxed("sock", &log, 0)).unwrap();
            request_shutdown(&inner, ctx, ErrorCode::SUCCESS, false);
            request_shutdown(&inner, ctx, ErrorCode::SOCKET_CLOSED, false);
        });
        for _ in 0..8 {
            core.turn();
        }

        assert!(
            log.borrow()
                .contains(&format!("shutdown_cb:{}", ErrorCode::SOCKET_CLOSED.0))
        );
    }

    #[test]
    fn append_fails_once_shutdown_started() {
        let (_handle, mut core) = test_loop();
        let log = Rc::new(RefCell::new(Vec::new()));
        let inner = make_channel(&mut core, false, &log);

        core.with_ctx(|ctx| {
            append_handler(&inner, ctx, RecordingHandler::boxed("sock", &log, 0)).unwrap();
            request_shutdown(&inner, ctx, ErrorCode::SUCCESS, false);
        });
        core.turn();

        core.with_ctx(|ctx| {
            let err = append_handler(&inner, ctx, RecordingHandler::boxed("late", &log, 0))
                .unwrap_err();
            assert_eq!(err.code(), ErrorCode::CHANNEL_SHUT_DOWN);
        });
    }

    #[test]
    fn empty_channel_shutdown_completes() {
        let (_handle, mut core) = test_loop();
        let log = Rc::new(RefCell::new(Vec::new()));
        let inner = make_channel(&mut core, false, &log);

        core.with_ctx(|ctx| {
            request_shutdown(&inner, ctx, ErrorCode::SUCCESS, false);
        });
        core.turn();
        core.turn();

        assert!(log.borrow().contains(&"shutdown_cb:0".to_string()));
        assert_eq!(core.channel_count(), 0);
    }
}
