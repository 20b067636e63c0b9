//! Terminal channel handler adapting a TCP socket to pipeline messages.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::Shutdown;

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Token};
use tracing::{trace, warn};

use crate::channel::Direction;
use crate::error::{Error, ErrorCode};
use crate::event_loop::EventSet;
use crate::handler::{ChannelHandler, SlotCtx};
use crate::message::{CompletionFn, Message};

/// Largest single read, and the handler's own initial window.
const READ_CHUNK: usize = 16 * 1024;

/// Options applied to a socket at connect/accept time.
#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    /// Connect timeout in milliseconds. `0` disables the timeout task.
    pub connect_timeout_ms: u32,
    pub keep_alive: bool,
    pub no_delay: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            connect_timeout_ms: 3_000,
            keep_alive: false,
            no_delay: true,
        }
    }
}

pub(crate) fn apply_stream_options(stream: &TcpStream, options: &SocketOptions) -> io::Result<()> {
    let sock = socket2::SockRef::from(stream);
    sock.set_nodelay(options.no_delay)?;
    sock.set_keepalive(options.keep_alive)?;
    Ok(())
}

struct PendingWrite {
    data: BytesMut,
    completion: Option<CompletionFn>,
}

/// The terminal handler: drains the socket into read messages under the
/// slot window, buffers writes the kernel won't take yet, and maps socket
/// errors onto channel shutdown.
pub struct SocketHandler {
    stream: TcpStream,
    token: Option<Token>,
    interests: Option<Interest>,
    pending_writes: VecDeque<PendingWrite>,
    read_shutdown: bool,
    write_shutdown: bool,
    /// Budget ran out while the socket may still hold unread bytes; a
    /// window credit schedules the resume.
    read_paused: bool,
    /// Graceful write shutdown waiting on the pending queue to drain.
    write_shutdown_pending: Option<ErrorCode>,
}

impl SocketHandler {
    pub fn new(stream: TcpStream) -> SocketHandler {
        SocketHandler {
            stream,
            token: None,
            interests: None,
            pending_writes: VecDeque::new(),
            read_shutdown: false,
            write_shutdown: false,
            read_paused: false,
            write_shutdown_pending: None,
        }
    }

    fn desired_interests(&self) -> Option<Interest> {
        let want_read = !self.read_shutdown;
        let want_write =
            !self.pending_writes.is_empty() || self.write_shutdown_pending.is_some();
        match (want_read, want_write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn update_interests(&mut self, ctx: &mut SlotCtx<'_, '_>) {
        let desired = self.desired_interests();
        if desired == self.interests {
            return;
        }
        match (self.token, desired) {
            (Some(token), Some(interests)) => {
                if let Err(e) = ctx.reregister_io(&mut self.stream, token, interests) {
                    warn!("socket reregister failed: {e}");
                }
                self.interests = Some(interests);
            }
            (Some(token), None) => {
                ctx.deregister_io(&mut self.stream, token);
                self.token = None;
                self.interests = None;
            }
            (None, _) => {}
        }
    }

    fn do_read(&mut self, ctx: &mut SlotCtx<'_, '_>) {
        if self.read_shutdown {
            return;
        }
        let mut buf = [0u8; READ_CHUNK];
        loop {
            if ctx.channel_is_shutting_down() {
                // An EOF or stray bytes behind e.g. a close_notify must not
                // disturb the shutdown already in flight.
                return;
            }
            let budget = ctx.read_window();
            if budget == 0 {
                // Must stop here; resumed by a window increment.
                self.read_paused = true;
                return;
            }
            let chunk = budget.min(READ_CHUNK);
            match self.stream.read(&mut buf[..chunk]) {
                Ok(0) => {
                    trace!("peer closed socket");
                    ctx.shutdown_channel(ErrorCode::SOCKET_CLOSED);
                    return;
                }
                Ok(n) => {
                    ctx.record_bytes_read(n as u64);
                    let message = Message::application(&buf[..n]);
                    if let Err(e) = ctx.send_read(message) {
                        warn!("emitting read message failed: {e}");
                        ctx.shutdown_channel(e.code());
                        return;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.read_paused = false;
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    ctx.shutdown_channel(ErrorCode::from_io(&e));
                    return;
                }
            }
        }
    }

    fn flush(&mut self, ctx: &mut SlotCtx<'_, '_>) {
        while let Some(front) = self.pending_writes.front_mut() {
            if front.data.is_empty() {
                let mut done = self.pending_writes.pop_front().unwrap();
                if let Some(completion) = done.completion.take() {
                    ctx.complete_message(completion, ErrorCode::SUCCESS);
                }
                continue;
            }
            match self.stream.write(&front.data) {
                Ok(n) => {
                    ctx.record_bytes_written(n as u64);
                    front.data.advance(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.update_interests(ctx);
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    let code = ErrorCode::from_io(&e);
                    self.fail_pending(ctx, code);
                    if let Some(error) = self.write_shutdown_pending.take() {
                        // Mid-shutdown write failures finish the shutdown
                        // with its original disposition.
                        self.finish_write_shutdown(ctx, error);
                    } else if !ctx.channel_is_shutting_down() {
                        ctx.shutdown_channel(code);
                    }
                    return;
                }
            }
        }
        if let Some(error) = self.write_shutdown_pending.take() {
            self.finish_write_shutdown(ctx, error);
        } else {
            self.update_interests(ctx);
        }
    }

    fn fail_pending(&mut self, ctx: &mut SlotCtx<'_, '_>, code: ErrorCode) {
        while let Some(mut write) = self.pending_writes.pop_front() {
            if let Some(completion) = write.completion.take() {
                ctx.complete_message(completion, code);
            }
        }
    }

    fn finish_write_shutdown(&mut self, ctx: &mut SlotCtx<'_, '_>, error: ErrorCode) {
        if let Err(e) = self.stream.shutdown(Shutdown::Write) {
            trace!("socket write shutdown: {e}");
        }
        if let Some(token) = self.token.take() {
            ctx.deregister_io(&mut self.stream, token);
            self.interests = None;
        }
        ctx.complete_shutdown(Direction::Write, error);
    }
}

impl ChannelHandler for SocketHandler {
    fn process_read(&mut self, _ctx: &mut SlotCtx<'_, '_>, _message: Message) -> Result<(), Error> {
        // Terminal slot: nothing downstream emits toward us.
        Err(Error::new(ErrorCode::INVALID_STATE))
    }

    fn process_write(&mut self, ctx: &mut SlotCtx<'_, '_>, mut message: Message) -> Result<(), Error> {
        if self.write_shutdown {
            if let Some(completion) = message.take_completion() {
                ctx.complete_message(completion, ErrorCode::CHANNEL_SHUT_DOWN);
            }
            return Ok(());
        }
        let completion = message.take_completion();
        self.pending_writes.push_back(PendingWrite {
            data: message.data,
            completion,
        });
        self.flush(ctx);
        Ok(())
    }

    fn increment_read_window(&mut self, ctx: &mut SlotCtx<'_, '_>, _delta: usize) {
        if self.read_paused && !self.read_shutdown {
            self.read_paused = false;
            ctx.schedule_read_resume();
        }
    }

    fn shutdown(
        &mut self,
        ctx: &mut SlotCtx<'_, '_>,
        direction: Direction,
        error: ErrorCode,
        free_scarce_resources: bool,
    ) {
        match direction {
            Direction::Read => {
                self.read_shutdown = true;
                self.update_interests(ctx);
                ctx.complete_shutdown(Direction::Read, error);
            }
            Direction::Write => {
                self.write_shutdown = true;
                if free_scarce_resources || !error.is_ok() {
                    let code = if error.is_ok() {
                        ErrorCode::CHANNEL_SHUT_DOWN
                    } else {
                        error
                    };
                    self.fail_pending(ctx, code);
                    self.finish_write_shutdown(ctx, error);
                } else if self.pending_writes.is_empty() {
                    self.finish_write_shutdown(ctx, error);
                } else {
                    self.write_shutdown_pending = Some(error);
                    self.flush(ctx);
                }
            }
        }
    }

    fn initial_window_size(&self) -> usize {
        READ_CHUNK
    }

    fn on_attached(&mut self, ctx: &mut SlotCtx<'_, '_>) {
        match ctx.register_io(&mut self.stream, Interest::READABLE) {
            Ok(token) => {
                self.token = Some(token);
                self.interests = Some(Interest::READABLE);
            }
            Err(e) => {
                warn!("socket registration failed: {e}");
                ctx.shutdown_channel(e.code());
            }
        }
    }

    fn on_io_event(&mut self, ctx: &mut SlotCtx<'_, '_>, events: EventSet) {
        if events.error {
            let code = match self.stream.take_error() {
                Ok(Some(e)) => ErrorCode::from_io(&e),
                _ => ErrorCode::SOCKET_ERROR,
            };
            ctx.shutdown_channel(code);
            return;
        }
        if events.readable || events.hangup {
            self.do_read(ctx);
        }
        if events.writable {
            self.flush(ctx);
        }
    }

    fn name(&self) -> &'static str {
        "socket"
    }
}
