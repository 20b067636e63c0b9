//! loomio - event-loop driven channel runtime for networked systems.
//!
//! The core is three tightly coupled subsystems: per-thread event loops
//! multiplexing OS readiness, timers, and cross-thread tasks; channels,
//! the bidirectional handler pipelines with read backpressure and a
//! two-direction shutdown protocol; and bootstrap orchestration that
//! composes sockets and TLS handlers onto fresh channels.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use loomio::{
//!     ClientBootstrap, ClientChannelOptions, EventLoopGroup,
//!     EventLoopGroupOptions, SocketOptions, ThreadedHostResolver,
//! };
//!
//! loomio::init();
//! let group = Arc::new(EventLoopGroup::new(EventLoopGroupOptions::default())?);
//! let client = ClientBootstrap::new(group, Arc::new(ThreadedHostResolver::new()));
//! client.new_socket_channel(ClientChannelOptions {
//!     host: "example.com".to_string(),
//!     port: 443,
//!     socket_options: SocketOptions::default(),
//!     tls_options: Some(tls_options),
//!     enable_read_back_pressure: false,
//!     on_creation: None,
//!     on_setup: Box::new(|_, result| match result {
//!         Ok(channel) => { /* append your handler */ }
//!         Err(code) => eprintln!("setup failed: {code}"),
//!     }),
//!     on_shutdown: None,
//! })?;
//! ```

pub mod bootstrap;
pub mod channel;
pub mod clock;
pub mod error;
pub mod event_loop;
pub mod handler;
pub mod message;
pub mod resolver;
pub mod socket;
pub mod statistics;
pub mod task;
pub mod tls;

pub use bootstrap::{
    ChannelShutdownFn, ClientBootstrap, ClientChannelOptions, CreationFn, IncomingFn,
    ListenerDestroyFn, ServerBootstrap, ServerListener, ServerListenerOptions, SetupFn,
    ShutdownFn,
};
pub use channel::{Channel, ChannelId, ChannelSlot, ChannelState, Direction};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{Error, ErrorCode};
pub use event_loop::{EventLoop, EventLoopGroup, EventLoopGroupOptions, EventSet, LoopCtx};
pub use handler::{ChannelHandler, SlotCtx};
pub use message::{Message, MessageKind};
pub use resolver::{HostResolver, ResolveCallback, ResolveResult, ThreadedHostResolver};
pub use socket::{SocketHandler, SocketOptions};
pub use statistics::{ChannelStatistics, StatisticsHandler, TlsNegotiationStatus};
pub use task::{Task, TaskId, TaskStatus};
pub use tls::{
    RustlsSession, TlsConnectionOptions, TlsContext, TlsContextOptions, TlsSession,
    TlsSessionState, TlsSessionSummary, TlsVersion, alpn_is_available,
};

use std::sync::Once;

static INIT: Once = Once::new();

/// Process-wide library initialization. Installs the TLS provider's crypto
/// backend as the process default. Idempotent; losing the installation race
/// to another library is fine.
pub fn init() {
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
