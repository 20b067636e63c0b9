//! The channel handler capability set and the per-slot dispatch context.

use std::time::Duration;

use mio::{Interest, Token};

use crate::channel::{Channel, ChannelId, ChannelInner, Direction};
use crate::error::{Error, ErrorCode};
use crate::event_loop::{EventSet, IoTarget, LoopCtx};
use crate::message::{CompletionFn, Message};
use crate::statistics::TlsNegotiationStatus;
use crate::task::{TaskId, TaskStatus};

/// A node in a channel pipeline.
///
/// Handlers run only on their channel's event loop and are strictly
/// serialized per channel. Every callback receives a [`SlotCtx`] scoped to
/// the handler's slot; handlers must go through it for anything touching
/// their own channel, since the channel is already borrowed for the
/// duration of the callback and reaching back in through
/// [`LoopCtx`](crate::event_loop::LoopCtx) would panic.
pub trait ChannelHandler {
    /// A message is moving toward the user. Terminal handlers never see
    /// this. Ownership of `message` transfers in; forward it or drop it.
    fn process_read(&mut self, ctx: &mut SlotCtx<'_, '_>, message: Message) -> Result<(), Error>;

    /// A message is moving toward the socket.
    fn process_write(&mut self, ctx: &mut SlotCtx<'_, '_>, message: Message) -> Result<(), Error>;

    /// The slot's emit budget grew by `delta`: the upstream neighbor is
    /// ready for more read data. Resume emission, then forward the credit
    /// further downstream if this handler is not terminal.
    fn increment_read_window(&mut self, ctx: &mut SlotCtx<'_, '_>, delta: usize);

    /// Begin shutting down this handler in `direction`. The handler must
    /// eventually call [`SlotCtx::complete_shutdown`] with the same
    /// direction, either synchronously or from a later callback once
    /// pending work drains. With `free_scarce_resources` set, drop
    /// buffered work and complete immediately.
    fn shutdown(
        &mut self,
        ctx: &mut SlotCtx<'_, '_>,
        direction: Direction,
        error: ErrorCode,
        free_scarce_resources: bool,
    );

    /// Bytes this handler is initially willing to accept on the read path.
    /// Becomes the emit budget of the slot below when this handler is
    /// appended (only meaningful with read backpressure enabled).
    fn initial_window_size(&self) -> usize;

    /// Per-message framing overhead this handler adds on the write path.
    fn message_overhead(&self) -> usize {
        0
    }

    /// The handler was appended to a slot. Terminal handlers register
    /// their I/O source here.
    fn on_attached(&mut self, _ctx: &mut SlotCtx<'_, '_>) {}

    /// OS readiness for the channel's I/O source. Only the terminal
    /// handler receives this.
    fn on_io_event(&mut self, _ctx: &mut SlotCtx<'_, '_>, _events: EventSet) {}

    /// A timer armed via [`SlotCtx::schedule_slot_timeout`] fired.
    fn on_timeout(&mut self, _ctx: &mut SlotCtx<'_, '_>) {}

    fn name(&self) -> &'static str {
        "handler"
    }
}

/// Dispatch context scoped to one slot of one channel.
///
/// Lives only for the duration of a single handler callback.
pub struct SlotCtx<'a, 'b> {
    pub(crate) channel: &'a mut ChannelInner,
    pub(crate) slot: usize,
    pub(crate) loop_ctx: &'a mut LoopCtx<'b>,
}

impl SlotCtx<'_, '_> {
    pub fn slot_index(&self) -> usize {
        self.slot
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel.id()
    }

    /// Cross-thread handle to this channel.
    pub fn channel(&self) -> Channel {
        self.channel.handle()
    }

    pub fn now_ns(&self) -> u64 {
        self.loop_ctx.now_ns()
    }

    /// Remaining bytes this slot may emit upstream before the consumer
    /// grants more window.
    pub fn read_window(&self) -> usize {
        self.channel.slot_window(self.slot)
    }

    /// Whether a shutdown has been requested or begun on this channel.
    /// Terminal handlers stop pulling new input once this turns true.
    pub fn channel_is_shutting_down(&self) -> bool {
        self.channel.is_shutting_down()
    }

    /// Emit a read message to the next slot toward the user. Debits this
    /// slot's window; fails with `READ_WINDOW_EXCEEDED` if the message
    /// does not fit (the handler must buffer the residual instead).
    pub fn send_read(&mut self, message: Message) -> Result<(), Error> {
        self.channel.send_read(self.loop_ctx, self.slot, message)
    }

    /// Emit a write message to the next slot toward the socket.
    pub fn send_write(&mut self, message: Message) -> Result<(), Error> {
        self.channel.send_write(self.loop_ctx, self.slot, message)
    }

    /// Declare this slot ready for `delta` more read bytes. Credits the
    /// slot below and invokes its handler's window hook; from there the
    /// credit usually cascades to the terminal handler.
    pub fn increment_read_window(&mut self, delta: usize) {
        self.channel
            .increment_read_window_from(self.loop_ctx, self.slot, delta);
    }

    /// Report this handler's shutdown in `direction` as finished, letting
    /// the cascade advance to the next slot.
    pub fn complete_shutdown(&mut self, direction: Direction, error: ErrorCode) {
        self.channel
            .handler_shutdown_complete(self.loop_ctx, self.slot, direction, error);
    }

    /// Request shutdown of the whole channel with `error`. Posted as a
    /// task; safe to call from any handler callback.
    pub fn shutdown_channel(&mut self, error: ErrorCode) {
        self.channel.post_shutdown(self.loop_ctx, error, false);
    }

    /// Fire a write-completion callback. Runs as an immediate task, i.e.
    /// later in the same loop turn.
    pub fn complete_message(&mut self, completion: CompletionFn, error: ErrorCode) {
        self.loop_ctx
            .schedule_now("write_completion", move |ctx, _| completion(ctx, error));
    }

    /// Arm a timer that invokes this handler's
    /// [`on_timeout`](ChannelHandler::on_timeout). A canceled timer never
    /// fires the hook.
    pub fn schedule_slot_timeout(&mut self, delay: Duration) -> TaskId {
        let id = self.channel.id();
        let slot = self.slot;
        self.loop_ctx
            .schedule_in("slot_timeout", delay, move |ctx, status| {
                if status == TaskStatus::Canceled {
                    return;
                }
                if let Some(inner) = ctx.channel_inner(id) {
                    crate::channel::dispatch_slot_timeout(&inner, ctx, slot);
                }
            })
    }

    pub fn cancel_task(&mut self, id: TaskId) {
        self.loop_ctx.cancel_task(id);
    }

    /// Schedule work on this channel's loop. The closure must re-resolve
    /// the channel by id; holding handler state across turns is the
    /// handler's own job.
    pub fn schedule_now(
        &mut self,
        label: &'static str,
        callback: impl FnOnce(&mut LoopCtx<'_>, TaskStatus) + 'static,
    ) -> TaskId {
        self.loop_ctx.schedule_now(label, callback)
    }

    /// Register the channel's I/O source; readiness is routed to the
    /// terminal handler's [`on_io_event`](ChannelHandler::on_io_event).
    pub fn register_io(
        &mut self,
        source: &mut impl mio::event::Source,
        interests: Interest,
    ) -> Result<Token, Error> {
        let id = self.channel.id();
        self.loop_ctx
            .register_io(source, interests, IoTarget::Channel(id))
    }

    pub fn reregister_io(
        &mut self,
        source: &mut impl mio::event::Source,
        token: Token,
        interests: Interest,
    ) -> Result<(), Error> {
        self.loop_ctx.reregister_io(source, token, interests)
    }

    pub fn deregister_io(&mut self, source: &mut impl mio::event::Source, token: Token) {
        self.loop_ctx.deregister_io(source, token);
    }

    /// Schedule a re-dispatch of a readable event to the terminal handler.
    /// Used to resume reading after window credit arrives, since no new OS
    /// readiness will be delivered for bytes already waiting.
    pub fn schedule_read_resume(&mut self) {
        let id = self.channel.id();
        self.loop_ctx.schedule_now("read_resume", move |ctx, status| {
            if status == TaskStatus::Canceled {
                return;
            }
            if let Some(inner) = ctx.channel_inner(id) {
                crate::channel::dispatch_io(&inner, ctx, EventSet::READABLE);
            }
        });
    }

    pub fn record_bytes_read(&mut self, n: u64) {
        self.channel.stats_mut().bytes_read += n;
    }

    pub fn record_bytes_written(&mut self, n: u64) {
        self.channel.stats_mut().bytes_written += n;
    }

    pub fn set_tls_status(&mut self, status: TlsNegotiationStatus) {
        self.channel.stats_mut().tls_status = status;
    }
}
