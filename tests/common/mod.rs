//! Shared helpers for integration tests: a recording user handler, shared
//! peer state polled with deadlines, and self-signed certificates.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use std::sync::atomic::AtomicBool;

use loomio::{
    Channel, ChannelHandler, ClientBootstrap, ClientChannelOptions, Direction, Error, ErrorCode,
    EventLoopGroup, LoopCtx, Message, ServerBootstrap, ServerListener, ServerListenerOptions,
    SlotCtx, SocketOptions, Task, TaskStatus, TlsConnectionOptions, TlsContext, TlsContextOptions,
};

static INIT: Once = Once::new();

pub fn init_test() {
    INIT.call_once(|| {
        loomio::init();
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Observed state of one side of a connection.
#[derive(Default)]
pub struct PeerInner {
    pub channel: Option<Channel>,
    pub user_slot: Option<usize>,
    pub received: Vec<u8>,
    pub read_invocations: usize,
    pub setup_code: Option<ErrorCode>,
    pub shutdown_code: Option<ErrorCode>,
}

#[derive(Default)]
pub struct Peer {
    pub inner: Mutex<PeerInner>,
}

impl Peer {
    pub fn new() -> Arc<Peer> {
        Arc::new(Peer::default())
    }

    /// Poll until `pred` holds or the deadline passes.
    pub fn wait_for(&self, timeout: Duration, pred: impl Fn(&PeerInner) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if pred(&self.inner.lock().unwrap()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn channel(&self) -> Channel {
        self.inner
            .lock()
            .unwrap()
            .channel
            .clone()
            .expect("channel not set")
    }

    pub fn user_slot(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .user_slot
            .expect("user slot not set")
    }

    pub fn received(&self) -> Vec<u8> {
        self.inner.lock().unwrap().received.clone()
    }

    pub fn setup_code(&self) -> Option<ErrorCode> {
        self.inner.lock().unwrap().setup_code
    }

    pub fn shutdown_code(&self) -> Option<ErrorCode> {
        self.inner.lock().unwrap().shutdown_code
    }
}

pub type OnReadFn = Box<dyn FnMut(&[u8]) + Send>;

/// Last-slot handler recording everything it reads, with an optional hook
/// invoked after each read.
pub struct RecordingHandler {
    peer: Arc<Peer>,
    window: usize,
    on_read: Option<OnReadFn>,
}

impl RecordingHandler {
    pub fn new(peer: &Arc<Peer>, window: usize, on_read: Option<OnReadFn>) -> RecordingHandler {
        RecordingHandler {
            peer: peer.clone(),
            window,
            on_read,
        }
    }
}

impl ChannelHandler for RecordingHandler {
    fn process_read(&mut self, _ctx: &mut SlotCtx<'_, '_>, message: Message) -> Result<(), Error> {
        {
            let mut st = self.peer.inner.lock().unwrap();
            st.read_invocations += 1;
            st.received.extend_from_slice(&message.data);
        }
        if let Some(hook) = &mut self.on_read {
            hook(&message.data);
        }
        Ok(())
    }

    fn process_write(&mut self, _ctx: &mut SlotCtx<'_, '_>, _message: Message) -> Result<(), Error> {
        Ok(())
    }

    fn increment_read_window(&mut self, _ctx: &mut SlotCtx<'_, '_>, _delta: usize) {}

    fn shutdown(
        &mut self,
        ctx: &mut SlotCtx<'_, '_>,
        direction: Direction,
        error: ErrorCode,
        _free_scarce_resources: bool,
    ) {
        ctx.complete_shutdown(direction, error);
    }

    fn initial_window_size(&self) -> usize {
        self.window
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Append a recording handler as the user slot and publish the channel into
/// the peer state.
pub fn attach_recording_handler(
    ctx: &mut LoopCtx<'_>,
    channel: &Channel,
    peer: &Arc<Peer>,
    window: usize,
    on_read: Option<OnReadFn>,
) {
    let handler = RecordingHandler::new(peer, window, on_read);
    ctx.channel_append_handler(channel, Box::new(handler))
        .expect("append user handler");
    let slot = ctx.channel_slot_count(channel).expect("live channel") - 1;
    let mut st = peer.inner.lock().unwrap();
    st.channel = Some(channel.clone());
    st.user_slot = Some(slot);
}

/// Write application data into a channel from off-thread, entering at the
/// user slot.
pub fn channel_write(peer: &Arc<Peer>, data: &[u8]) {
    let channel = peer.channel();
    let slot = peer.user_slot();
    let payload = data.to_vec();
    let target = channel.clone();
    channel
        .event_loop()
        .schedule_task_now(Task::new("test_write", move |ctx, status| {
            if status != TaskStatus::RunReady {
                return;
            }
            let _ = ctx.channel_send_write(&target, slot, Message::application(&payload[..]));
        }))
        .expect("schedule write");
}

pub struct TestCert {
    pub cert_pem: String,
    pub key_pem: String,
}

pub fn generate_cert(names: &[&str]) -> TestCert {
    let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
    let cert = rcgen::generate_simple_self_signed(names).expect("generate certificate");
    TestCert {
        cert_pem: cert.cert.pem(),
        key_pem: cert.key_pair.serialize_pem(),
    }
}

pub fn server_tls_options(cert: &TestCert) -> TlsConnectionOptions {
    let options =
        TlsContextOptions::new_server_from_pem(cert.cert_pem.as_bytes(), cert.key_pem.as_bytes());
    let ctx = TlsContext::new_server(&options).expect("server tls context");
    TlsConnectionOptions::new(&ctx)
}

pub fn client_tls_options(cert: &TestCert, server_name: &str, timeout_ms: u32) -> TlsConnectionOptions {
    let mut options = TlsContextOptions::new_client();
    options.override_default_trust_store(cert.cert_pem.as_bytes());
    options.set_negotiation_timeout_ms(timeout_ms);
    let ctx = TlsContext::new_client(&options).expect("client tls context");
    let mut conn = TlsConnectionOptions::new(&ctx);
    conn.set_server_name(server_name);
    conn
}

pub type OnReadFactory = Box<dyn Fn(&Arc<Peer>) -> OnReadFn + Send>;

/// Echo hook: writes every read back into the same channel.
pub fn echo_factory() -> OnReadFactory {
    Box::new(|peer| {
        let peer = peer.clone();
        Box::new(move |data| channel_write(&peer, data))
    })
}

pub struct ServerHarness {
    pub listener: ServerListener,
    pub peer: Arc<Peer>,
    pub destroyed: Arc<AtomicBool>,
}

/// Bind a listener on 127.0.0.1:0 that attaches a recording handler to
/// every accepted channel.
pub fn start_server(
    group: &Arc<EventLoopGroup>,
    tls_options: Option<TlsConnectionOptions>,
    window: usize,
    backpressure: bool,
    on_read_factory: Option<OnReadFactory>,
) -> ServerHarness {
    let bootstrap = ServerBootstrap::new(group.clone());
    let peer = Peer::new();
    let destroyed = Arc::new(AtomicBool::new(false));

    let incoming_peer = peer.clone();
    let shutdown_peer = peer.clone();
    let destroy_flag = destroyed.clone();

    let listener = bootstrap
        .new_socket_listener(ServerListenerOptions {
            host: "127.0.0.1".to_string(),
            port: 0,
            socket_options: SocketOptions::default(),
            tls_options,
            enable_read_back_pressure: backpressure,
            on_incoming: Box::new(move |ctx, result| match result {
                Ok(channel) => {
                    let on_read = on_read_factory.as_ref().map(|f| f(&incoming_peer));
                    attach_recording_handler(ctx, &channel, &incoming_peer, window, on_read);
                    incoming_peer.inner.lock().unwrap().setup_code = Some(ErrorCode::SUCCESS);
                }
                Err(code) => {
                    incoming_peer.inner.lock().unwrap().setup_code = Some(code);
                }
            }),
            on_channel_shutdown: Some(Box::new(move |_, code| {
                shutdown_peer.inner.lock().unwrap().shutdown_code = Some(code);
            })),
            on_destroy: Some(Box::new(move || {
                destroy_flag.store(true, std::sync::atomic::Ordering::SeqCst);
            })),
        })
        .expect("bind listener");

    ServerHarness {
        listener,
        peer,
        destroyed,
    }
}

/// Connect a client channel with a recording handler as the user slot.
pub fn connect_client(
    bootstrap: &ClientBootstrap,
    host: &str,
    port: u16,
    tls_options: Option<TlsConnectionOptions>,
    window: usize,
    backpressure: bool,
    on_read_factory: Option<OnReadFactory>,
) -> Arc<Peer> {
    let peer = Peer::new();
    let setup_peer = peer.clone();
    let shutdown_peer = peer.clone();

    bootstrap
        .new_socket_channel(ClientChannelOptions {
            host: host.to_string(),
            port,
            socket_options: SocketOptions::default(),
            tls_options,
            enable_read_back_pressure: backpressure,
            on_creation: None,
            on_setup: Box::new(move |ctx, result| match result {
                Ok(channel) => {
                    let on_read = on_read_factory.as_ref().map(|f| f(&setup_peer));
                    attach_recording_handler(ctx, &channel, &setup_peer, window, on_read);
                    setup_peer.inner.lock().unwrap().setup_code = Some(ErrorCode::SUCCESS);
                }
                Err(code) => {
                    setup_peer.inner.lock().unwrap().setup_code = Some(code);
                }
            }),
            on_shutdown: Some(Box::new(move |_, code| {
                shutdown_peer.inner.lock().unwrap().shutdown_code = Some(code);
            })),
        })
        .expect("start client connect");

    peer
}
