//! Client and server bootstrap: compose sockets, channels, and TLS into a
//! ready pipeline.

use std::cell::RefCell;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::sync::{Arc, Weak};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use tracing::{debug, trace, warn};

use crate::channel::{self, Channel, ChannelOptions};
use crate::error::{Error, ErrorCode};
use crate::event_loop::{EventLoop, EventLoopGroup, EventSet, EventSubscriber, IoTarget, LoopCtx};
use crate::resolver::HostResolver;
use crate::socket::{SocketHandler, SocketOptions, apply_stream_options};
use crate::task::{Task, TaskId, TaskStatus};
use crate::tls::{NegotiationHook, TlsConnectionOptions, TlsHandler};

const LISTEN_BACKLOG: u32 = 128;

/// Fires after the channel exists but before any handler is installed;
/// the place to attach a statistics handler.
pub type CreationFn = Box<dyn FnOnce(&mut LoopCtx<'_>, &Channel) + Send>;
/// Fires exactly once: with the ready channel after (optional) TLS
/// negotiation, or with the error that prevented setup. When it fires with
/// an error, no shutdown callback follows.
pub type SetupFn = Box<dyn FnOnce(&mut LoopCtx<'_>, Result<Channel, ErrorCode>) + Send>;
/// Fires at most once, only after a successful setup, when the channel
/// reaches shutdown-complete.
pub type ShutdownFn = Box<dyn FnOnce(&mut LoopCtx<'_>, ErrorCode) + Send>;
/// Server-side: fires once per accepted connection, like [`SetupFn`].
pub type IncomingFn = Box<dyn FnMut(&mut LoopCtx<'_>, Result<Channel, ErrorCode>) + Send>;
/// Server-side: fires when an accepted connection's channel shuts down.
pub type ChannelShutdownFn = Box<dyn FnMut(&mut LoopCtx<'_>, ErrorCode) + Send>;
/// Fires once the listener's accept loop has drained after destroy.
pub type ListenerDestroyFn = Box<dyn FnOnce() + Send>;

/// Options for [`ClientBootstrap::new_socket_channel`].
pub struct ClientChannelOptions {
    pub host: String,
    pub port: u16,
    pub socket_options: SocketOptions,
    pub tls_options: Option<TlsConnectionOptions>,
    pub enable_read_back_pressure: bool,
    pub on_creation: Option<CreationFn>,
    pub on_setup: SetupFn,
    pub on_shutdown: Option<ShutdownFn>,
}

/// Orchestrates client connections: resolve, pick a loop, connect, build
/// the channel, install socket and TLS handlers.
pub struct ClientBootstrap {
    group: Arc<EventLoopGroup>,
    resolver: Arc<dyn HostResolver>,
}

impl ClientBootstrap {
    pub fn new(group: Arc<EventLoopGroup>, resolver: Arc<dyn HostResolver>) -> ClientBootstrap {
        ClientBootstrap { group, resolver }
    }

    /// Begin asynchronous connection setup. Outcomes are delivered through
    /// `options.on_setup`; a successful setup hands over a ready
    /// [`Channel`].
    pub fn new_socket_channel(&self, options: ClientChannelOptions) -> Result<(), Error> {
        let event_loop = self.group.next_loop().clone();
        let host = options.host.clone();
        let port = options.port;

        self.resolver.resolve(
            &host,
            Box::new(move |result| {
                let addrs = match result {
                    Ok(addrs) => addrs,
                    Err(code) => {
                        fail_setup_via_loop(&event_loop, options.on_setup, code);
                        return;
                    }
                };
                let Some(ip) = pick_address(&addrs) else {
                    fail_setup_via_loop(
                        &event_loop,
                        options.on_setup,
                        ErrorCode::DNS_RESOLVE_FAILURE,
                    );
                    return;
                };
                let target = SocketAddr::new(ip, port);
                let submitted =
                    event_loop.schedule_task_now(Task::new("client_connect", move |ctx, status| {
                        if status == TaskStatus::Canceled {
                            (options.on_setup)(ctx, Err(ErrorCode::EVENT_LOOP_SHUTDOWN));
                            return;
                        }
                        start_connect(ctx, target, options);
                    }));
                if submitted.is_err() {
                    warn!("client connect dropped: event loop is shutting down");
                }
            }),
        );
        Ok(())
    }
}

fn pick_address(addrs: &[IpAddr]) -> Option<IpAddr> {
    // Prefer IPv4 for parity with the resolver ordering most systems give.
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}

fn fail_setup_via_loop(event_loop: &EventLoop, on_setup: SetupFn, code: ErrorCode) {
    let submitted = event_loop.schedule_task_now(Task::new("client_setup_failed", move |ctx, _| {
        on_setup(ctx, Err(code));
    }));
    if submitted.is_err() {
        warn!("setup failure callback dropped: event loop is shutting down");
    }
}

fn start_connect(ctx: &mut LoopCtx<'_>, target: SocketAddr, options: ClientChannelOptions) {
    trace!(%target, "starting client connect");
    let stream = match TcpStream::connect(target) {
        Ok(stream) => stream,
        Err(e) => {
            (options.on_setup)(ctx, Err(ErrorCode::from_io(&e)));
            return;
        }
    };
    if let Err(e) = apply_stream_options(&stream, &options.socket_options) {
        trace!("applying socket options failed: {e}");
    }

    let timeout_ms = options.socket_options.connect_timeout_ms;
    let attempt = Rc::new(RefCell::new(ConnectAttempt {
        stream: Some(stream),
        token: None,
        timeout_task: None,
        options: Some(options),
        done: false,
    }));

    let token = {
        let mut a = attempt.borrow_mut();
        let stream = a.stream.as_mut().expect("stream present");
        match ctx.register_io(
            stream,
            Interest::WRITABLE,
            IoTarget::Subscriber(attempt.clone()),
        ) {
            Ok(token) => token,
            Err(e) => {
                let options = a.options.take().expect("options present");
                drop(a);
                (options.on_setup)(ctx, Err(e.code()));
                return;
            }
        }
    };
    attempt.borrow_mut().token = Some(token);

    if timeout_ms > 0 {
        let weak = Rc::downgrade(&attempt);
        let task = ctx.schedule_in(
            "connect_timeout",
            Duration::from_millis(timeout_ms as u64),
            move |ctx, status| {
                if status == TaskStatus::Canceled {
                    return;
                }
                if let Some(attempt) = weak.upgrade() {
                    ConnectAttempt::timed_out(&attempt, ctx);
                }
            },
        );
        attempt.borrow_mut().timeout_task = Some(task);
    }
}

/// In-flight nonblocking connect: owns the socket until the TCP handshake
/// resolves, then hands it to a fresh channel.
struct ConnectAttempt {
    stream: Option<TcpStream>,
    token: Option<Token>,
    timeout_task: Option<TaskId>,
    options: Option<ClientChannelOptions>,
    done: bool,
}

impl ConnectAttempt {
    fn timed_out(attempt: &Rc<RefCell<ConnectAttempt>>, ctx: &mut LoopCtx<'_>) {
        let Some((stream, options)) = ({
            let mut a = attempt.borrow_mut();
            if a.done {
                None
            } else {
                a.done = true;
                a.timeout_task = None;
                let mut stream = a.stream.take().expect("stream present");
                if let Some(token) = a.token.take() {
                    ctx.deregister_io(&mut stream, token);
                }
                Some((stream, a.options.take().expect("options present")))
            }
        }) else {
            return;
        };
        drop(stream);
        debug!("client connect timed out");
        (options.on_setup)(ctx, Err(ErrorCode::SOCKET_TIMEOUT));
    }

    fn resolve_outcome(&mut self, events: EventSet) -> Option<Result<(), ErrorCode>> {
        let stream = self.stream.as_ref().expect("stream present");
        if let Ok(Some(e)) = stream.take_error() {
            return Some(Err(ErrorCode::from_io(&e)));
        }
        match stream.peer_addr() {
            Ok(_) => Some(Ok(())),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotConnected => {
                if events.error || events.hangup {
                    Some(Err(ErrorCode::SOCKET_CONNECTION_REFUSED))
                } else {
                    None
                }
            }
            Err(e) => Some(Err(ErrorCode::from_io(&e))),
        }
    }
}

impl EventSubscriber for ConnectAttempt {
    fn on_io_event(&mut self, ctx: &mut LoopCtx<'_>, events: EventSet) {
        if self.done {
            return;
        }
        let Some(outcome) = self.resolve_outcome(events) else {
            return;
        };
        self.done = true;
        if let Some(task) = self.timeout_task.take() {
            ctx.cancel_task(task);
        }
        let mut stream = self.stream.take().expect("stream present");
        if let Some(token) = self.token.take() {
            ctx.deregister_io(&mut stream, token);
        }
        let options = self.options.take().expect("options present");
        match outcome {
            Err(code) => {
                debug!(error = %code, "client connect failed");
                (options.on_setup)(ctx, Err(code));
            }
            Ok(()) => {
                trace!("client connect established");
                build_channel(
                    ctx,
                    ChannelBuildParams {
                        stream,
                        tls_options: options.tls_options,
                        tls_server_role: false,
                        default_server_name: options.host,
                        enable_read_back_pressure: options.enable_read_back_pressure,
                        on_creation: options.on_creation,
                        on_setup: options.on_setup,
                        on_shutdown: options.on_shutdown,
                    },
                );
            }
        }
    }
}

/// Everything needed to assemble a channel over a connected socket; shared
/// by the client path and the server accept path.
struct ChannelBuildParams {
    stream: TcpStream,
    tls_options: Option<TlsConnectionOptions>,
    tls_server_role: bool,
    default_server_name: String,
    enable_read_back_pressure: bool,
    on_creation: Option<CreationFn>,
    on_setup: SetupFn,
    on_shutdown: Option<ShutdownFn>,
}

struct PendingState {
    setup: Option<SetupFn>,
    shutdown: Option<ShutdownFn>,
    setup_succeeded: bool,
}

fn fire_setup(
    state: &Rc<RefCell<PendingState>>,
    ctx: &mut LoopCtx<'_>,
    result: Result<Channel, ErrorCode>,
) {
    let callback = {
        let mut st = state.borrow_mut();
        if result.is_ok() {
            st.setup_succeeded = true;
        }
        st.setup.take()
    };
    if let Some(callback) = callback {
        callback(ctx, result);
    }
}

fn build_channel(ctx: &mut LoopCtx<'_>, params: ChannelBuildParams) {
    let ChannelBuildParams {
        stream,
        tls_options,
        tls_server_role,
        default_server_name,
        enable_read_back_pressure,
        on_creation,
        on_setup,
        on_shutdown,
    } = params;

    let state = Rc::new(RefCell::new(PendingState {
        setup: Some(on_setup),
        shutdown: on_shutdown,
        setup_succeeded: false,
    }));

    let setup_state = state.clone();
    let shutdown_state = state.clone();

    channel::create(
        ctx,
        ChannelOptions {
            enable_read_back_pressure,
            on_setup_completed: Box::new(move |ctx, chan, code| {
                if !code.is_ok() {
                    fire_setup(&setup_state, ctx, Err(code));
                    return;
                }
                if let Some(creation) = on_creation {
                    creation(ctx, &chan);
                }
                let socket = Box::new(SocketHandler::new(stream));
                if let Err(e) = ctx.channel_append_handler(&chan, socket) {
                    fire_setup(&setup_state, ctx, Err(e.code()));
                    ctx.channel_shutdown(&chan, e.code());
                    return;
                }
                let Some(tls) = tls_options else {
                    fire_setup(&setup_state, ctx, Ok(chan.clone()));
                    return;
                };

                let hook_state = setup_state.clone();
                let hook_channel = chan.clone();
                let hook: NegotiationHook = Box::new(move |sctx, result| {
                    // Defer to a task so the user callback never runs
                    // inside channel dispatch.
                    let outcome = result.map(|_| ());
                    sctx.schedule_now("tls_setup_notify", move |ctx, _| {
                        let result = outcome.map(|_| hook_channel.clone());
                        fire_setup(&hook_state, ctx, result);
                    });
                });
                let handler = if tls_server_role {
                    TlsHandler::server(&tls, Some(hook))
                } else {
                    TlsHandler::client(&tls, &default_server_name, Some(hook))
                };
                match handler {
                    Ok(h) => {
                        if let Err(e) = ctx.channel_append_handler(&chan, Box::new(h)) {
                            fire_setup(&setup_state, ctx, Err(e.code()));
                            ctx.channel_shutdown(&chan, e.code());
                        }
                    }
                    Err(e) => {
                        fire_setup(&setup_state, ctx, Err(e.code()));
                        ctx.channel_shutdown(&chan, e.code());
                    }
                }
            }),
            on_shutdown_completed: Some(Box::new(move |ctx, code| {
                let (setup, shutdown) = {
                    let mut st = shutdown_state.borrow_mut();
                    if st.setup_succeeded {
                        (None, st.shutdown.take())
                    } else {
                        (st.setup.take(), None)
                    }
                };
                if let Some(setup) = setup {
                    let code = if code.is_ok() {
                        ErrorCode::CHANNEL_SHUT_DOWN
                    } else {
                        code
                    };
                    setup(ctx, Err(code));
                }
                if let Some(shutdown) = shutdown {
                    shutdown(ctx, code);
                }
            })),
        },
    );
}

/// Options for [`ServerBootstrap::new_socket_listener`].
pub struct ServerListenerOptions {
    pub host: String,
    pub port: u16,
    pub socket_options: SocketOptions,
    pub tls_options: Option<TlsConnectionOptions>,
    pub enable_read_back_pressure: bool,
    pub on_incoming: IncomingFn,
    pub on_channel_shutdown: Option<ChannelShutdownFn>,
    pub on_destroy: Option<ListenerDestroyFn>,
}

/// Orchestrates listeners: bind/listen, accept, and per-connection channel
/// construction distributed round-robin over the group.
pub struct ServerBootstrap {
    group: Arc<EventLoopGroup>,
}

impl ServerBootstrap {
    pub fn new(group: Arc<EventLoopGroup>) -> ServerBootstrap {
        ServerBootstrap { group }
    }

    /// Bind and listen synchronously, then start accepting on a loop from
    /// the group. Binding errors surface here; per-connection outcomes go
    /// through `on_incoming`.
    pub fn new_socket_listener(
        &self,
        options: ServerListenerOptions,
    ) -> Result<ServerListener, Error> {
        let ip: IpAddr = options
            .host
            .parse()
            .map_err(|_| Error::new(ErrorCode::SOCKET_INVALID_ADDRESS))?;
        let addr = SocketAddr::new(ip, options.port);
        let listener = bind_listener(addr, LISTEN_BACKLOG)?;
        let local_addr = listener.local_addr()?;
        debug!(%local_addr, "listener bound");

        let event_loop = self.group.next_loop().clone();
        let token_cell = Arc::new(parking_lot::Mutex::new(None));

        // Weak: the listener living on a loop must not keep the group (and
        // thus its own loop thread) alive.
        let group = Arc::downgrade(&self.group);
        let task_token_cell = token_cell.clone();
        let ServerListenerOptions {
            socket_options,
            tls_options,
            enable_read_back_pressure,
            on_incoming,
            on_channel_shutdown,
            on_destroy,
            ..
        } = options;
        let incoming = Arc::new(parking_lot::Mutex::new(on_incoming));
        let channel_shutdown = on_channel_shutdown.map(|cb| Arc::new(parking_lot::Mutex::new(cb)));

        event_loop
            .schedule_task_now(Task::new("listener_register", move |ctx, status| {
                let inner = Rc::new(RefCell::new(ListenerInner {
                    listener,
                    group,
                    socket_options,
                    tls_options,
                    enable_read_back_pressure,
                    incoming,
                    channel_shutdown,
                    on_destroy,
                }));
                if status == TaskStatus::Canceled {
                    // Dropping `inner` fires the destroy callback.
                    return;
                }
                let token = {
                    let mut l = inner.borrow_mut();
                    let ListenerInner { listener, .. } = &mut *l;
                    ctx.register_io(listener, Interest::READABLE, IoTarget::Subscriber(inner.clone()))
                };
                match token {
                    Ok(token) => *task_token_cell.lock() = Some(token),
                    Err(e) => warn!("listener registration failed: {e}"),
                }
            }))
            .map_err(|e| {
                warn!("listener registration rejected: event loop is shutting down");
                e
            })?;

        Ok(ServerListener {
            event_loop,
            token: token_cell,
            local_addr,
        })
    }
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener, Error> {
    let domain = match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };
    let socket = socket2::Socket::new(
        domain,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener))
}

/// Handle to a bound listener. Destruction is asynchronous: the accept
/// loop drains on its loop, then the destroy callback fires.
pub struct ServerListener {
    event_loop: EventLoop,
    token: Arc<parking_lot::Mutex<Option<Token>>>,
    local_addr: SocketAddr,
}

impl ServerListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Connections already handed to channels are
    /// unaffected. Fires the destroy callback once the listener has left
    /// its loop.
    pub fn destroy(&self) {
        let token_cell = self.token.clone();
        let submitted = self
            .event_loop
            .schedule_task_now(Task::new("listener_destroy", move |ctx, status| {
                if status == TaskStatus::Canceled {
                    return;
                }
                let token = token_cell.lock().take();
                if let Some(token) = token {
                    if let Some(IoTarget::Subscriber(rc)) = ctx.take_subscriber(token) {
                        rc.borrow_mut().on_removed(ctx);
                    }
                }
            }));
        if submitted.is_err() {
            trace!("listener destroy rides loop teardown");
        }
    }
}

struct ListenerInner {
    listener: TcpListener,
    group: Weak<EventLoopGroup>,
    socket_options: SocketOptions,
    tls_options: Option<TlsConnectionOptions>,
    enable_read_back_pressure: bool,
    incoming: Arc<parking_lot::Mutex<IncomingFn>>,
    channel_shutdown: Option<Arc<parking_lot::Mutex<ChannelShutdownFn>>>,
    on_destroy: Option<ListenerDestroyFn>,
}

impl ListenerInner {
    fn accept_pending(&mut self, ctx: &mut LoopCtx<'_>) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    trace!(%peer, "accepted connection");
                    if let Err(e) = apply_stream_options(&stream, &self.socket_options) {
                        trace!("applying socket options failed: {e}");
                    }

                    let incoming = self.incoming.clone();
                    let setup: SetupFn = Box::new(move |ctx, result| {
                        (*incoming.lock())(ctx, result);
                    });
                    let shutdown: Option<ShutdownFn> = self.channel_shutdown.clone().map(
                        |shared| -> ShutdownFn {
                            Box::new(move |ctx, code| {
                                (*shared.lock())(ctx, code);
                            })
                        },
                    );

                    let params = ChannelBuildParams {
                        stream,
                        tls_options: self.tls_options.clone(),
                        tls_server_role: true,
                        default_server_name: String::new(),
                        enable_read_back_pressure: self.enable_read_back_pressure,
                        on_creation: None,
                        on_setup: setup,
                        on_shutdown: shutdown,
                    };

                    // Channels are distributed round-robin over the group;
                    // the build always runs on the target loop.
                    let Some(group) = self.group.upgrade() else {
                        trace!("accepted connection dropped: group is gone");
                        break;
                    };
                    let target = group.next_loop().clone();
                    let submitted = target.schedule_task_now(Task::new(
                        "server_channel_build",
                        move |ctx, status| {
                            if status == TaskStatus::Canceled {
                                return;
                            }
                            build_channel(ctx, params);
                        },
                    ));
                    if submitted.is_err() {
                        trace!("accepted connection dropped: target loop is shutting down");
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("accept failed: {e}");
                    let code = ErrorCode::from_io(&e);
                    (*self.incoming.lock())(ctx, Err(code));
                    break;
                }
            }
        }
    }

    fn fire_destroy(&mut self) {
        if let Some(callback) = self.on_destroy.take() {
            callback();
        }
    }
}

impl EventSubscriber for ListenerInner {
    fn on_io_event(&mut self, ctx: &mut LoopCtx<'_>, events: EventSet) {
        if events.readable || events.hangup {
            self.accept_pending(ctx);
        }
    }

    fn on_removed(&mut self, ctx: &mut LoopCtx<'_>) {
        if let Err(e) = ctx.registry.deregister(&mut self.listener) {
            trace!("listener deregister failed: {e}");
        }
        debug!("listener destroyed");
        self.fire_destroy();
    }
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        self.fire_destroy();
    }
}
