//! TLS contexts, the opaque provider abstraction, and the TLS channel
//! handler.
//!
//! The provider is rustls behind the [`TlsSession`] trait; the handler
//! layers the negotiation state machine over channel message flow and owns
//! the negotiation timeout and the cached-plaintext/shutdown interaction.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tracing::{debug, trace, warn};

use crate::channel::Direction;
use crate::error::{Error, ErrorCode};
use crate::handler::{ChannelHandler, SlotCtx};
use crate::message::{Message, MessageKind};
use crate::statistics::TlsNegotiationStatus;
use crate::task::TaskId;

/// Estimated per-record framing cost (header plus AEAD tag and padding).
const RECORD_OVERHEAD: usize = 53;

/// Whether the provider surfaces the negotiated ALPN protocol. rustls
/// always does; callers should query instead of assuming.
pub fn alpn_is_available() -> bool {
    true
}

/// Minimum TLS protocol version accepted for a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls1_0,
    Tls1_1,
    Tls1_2,
    Tls1_3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsSessionState {
    Negotiating,
    Succeeded,
    Failed(ErrorCode),
}

/// Output of feeding peer records into a session.
#[derive(Debug, Default)]
pub struct TlsProgress {
    /// Decrypted application bytes now available.
    pub plaintext: BytesMut,
    /// Records to forward to the peer.
    pub ciphertext: BytesMut,
    /// Peer sent close_notify.
    pub peer_closed: bool,
    pub state: Option<TlsSessionState>,
}

/// Opaque provider session: the handler drives it entirely through byte
/// buffers and never sees provider types.
pub trait TlsSession {
    /// Feed records received from the peer. The session buffers partial
    /// records internally.
    fn push_ciphertext(&mut self, data: &[u8]) -> TlsProgress;

    /// Encrypt application data; returns records for the peer.
    fn push_plaintext(&mut self, data: &[u8]) -> Result<BytesMut, Error>;

    /// Drain records the session wants to send unprompted (initial hello,
    /// post-handshake tickets).
    fn pending_output(&mut self) -> BytesMut;

    fn state(&self) -> TlsSessionState;

    fn alpn_selected(&self) -> Option<Vec<u8>>;

    /// Client: the requested SNI name. Server: the name the peer asked for.
    fn server_name(&self) -> Option<String>;

    /// Begin graceful closure; returns the close_notify records.
    fn shutdown(&mut self) -> BytesMut;
}

/// rustls-backed [`TlsSession`].
pub struct RustlsSession {
    conn: rustls::Connection,
    incoming: BytesMut,
    state: TlsSessionState,
    sni: Option<String>,
}

impl RustlsSession {
    pub fn client(config: Arc<rustls::ClientConfig>, server_name: &str) -> Result<RustlsSession, Error> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::new(ErrorCode::TLS_CTX_ERROR))?;
        let conn = rustls::ClientConnection::new(config, name)
            .map_err(|_| Error::new(ErrorCode::TLS_CTX_ERROR))?;
        Ok(RustlsSession {
            conn: rustls::Connection::from(conn),
            incoming: BytesMut::new(),
            state: TlsSessionState::Negotiating,
            sni: Some(server_name.to_string()),
        })
    }

    pub fn server(config: Arc<rustls::ServerConfig>) -> Result<RustlsSession, Error> {
        let conn = rustls::ServerConnection::new(config)
            .map_err(|_| Error::new(ErrorCode::TLS_CTX_ERROR))?;
        Ok(RustlsSession {
            conn: rustls::Connection::from(conn),
            incoming: BytesMut::new(),
            state: TlsSessionState::Negotiating,
            sni: None,
        })
    }

    fn drain_output(&mut self) -> BytesMut {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            if self.conn.write_tls(&mut out).is_err() {
                break;
            }
        }
        BytesMut::from(&out[..])
    }

    fn fail(&mut self, err: &rustls::Error) -> TlsSessionState {
        let code = match err {
            rustls::Error::AlertReceived(_) => ErrorCode::TLS_ALERT_RECEIVED,
            _ => ErrorCode::TLS_NEGOTIATION_FAILURE,
        };
        debug!("tls session error: {err}");
        self.state = TlsSessionState::Failed(code);
        self.state
    }
}

impl TlsSession for RustlsSession {
    fn push_ciphertext(&mut self, data: &[u8]) -> TlsProgress {
        let mut progress = TlsProgress::default();
        if let TlsSessionState::Failed(_) = self.state {
            progress.state = Some(self.state);
            return progress;
        }
        self.incoming.extend_from_slice(data);

        while !self.incoming.is_empty() {
            let mut cursor = io::Cursor::new(&self.incoming[..]);
            match self.conn.read_tls(&mut cursor) {
                Ok(0) => break,
                Ok(n) => self.incoming.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("tls read failed: {e}");
                    self.state = TlsSessionState::Failed(ErrorCode::TLS_NEGOTIATION_FAILURE);
                    break;
                }
            }

            match self.conn.process_new_packets() {
                Ok(io_state) => {
                    let n = io_state.plaintext_bytes_to_read();
                    if n > 0 {
                        let mut buf = vec![0u8; n];
                        if let Ok(read) = self.conn.reader().read(&mut buf) {
                            progress.plaintext.extend_from_slice(&buf[..read]);
                        }
                    }
                    if io_state.peer_has_closed() {
                        progress.peer_closed = true;
                    }
                }
                Err(e) => {
                    self.fail(&e);
                    break;
                }
            }
        }

        if self.state == TlsSessionState::Negotiating && !self.conn.is_handshaking() {
            self.state = TlsSessionState::Succeeded;
            if let rustls::Connection::Server(server) = &self.conn {
                self.sni = server.server_name().map(str::to_string);
            }
        }

        progress.ciphertext = self.drain_output();
        progress.state = Some(self.state);
        progress
    }

    fn push_plaintext(&mut self, data: &[u8]) -> Result<BytesMut, Error> {
        let mut out = BytesMut::new();
        let mut offset = 0;
        while offset < data.len() {
            match self.conn.writer().write(&data[offset..]) {
                Ok(0) => {
                    // Internal buffer full: drain records and retry.
                    let drained = self.drain_output();
                    if drained.is_empty() {
                        return Err(Error::new(ErrorCode::TLS_WRITE_FAILURE));
                    }
                    out.extend_from_slice(&drained);
                }
                Ok(n) => offset += n,
                Err(e) => return Err(Error::with_source(ErrorCode::TLS_WRITE_FAILURE, e)),
            }
        }
        out.extend_from_slice(&self.drain_output());
        Ok(out)
    }

    fn pending_output(&mut self) -> BytesMut {
        self.drain_output()
    }

    fn state(&self) -> TlsSessionState {
        self.state
    }

    fn alpn_selected(&self) -> Option<Vec<u8>> {
        self.conn.alpn_protocol().map(|p| p.to_vec())
    }

    fn server_name(&self) -> Option<String> {
        self.sni.clone()
    }

    fn shutdown(&mut self) -> BytesMut {
        self.conn.send_close_notify();
        self.drain_output()
    }
}

enum ContextRole {
    Client,
    Server,
}

/// Options for building a [`TlsContext`].
pub struct TlsContextOptions {
    role: ContextRole,
    alpn_list: Vec<Vec<u8>>,
    verify_peer: bool,
    minimum_version: TlsVersion,
    trust_store_pem: Option<Vec<u8>>,
    cert_chain_pem: Option<Vec<u8>>,
    private_key_pem: Option<Vec<u8>>,
    timeout_ms: u32,
}

impl TlsContextOptions {
    /// Client options verifying peers against the default trust store.
    pub fn new_client() -> TlsContextOptions {
        TlsContextOptions {
            role: ContextRole::Client,
            alpn_list: Vec::new(),
            verify_peer: true,
            minimum_version: TlsVersion::Tls1_2,
            trust_store_pem: None,
            cert_chain_pem: None,
            private_key_pem: None,
            timeout_ms: 10_000,
        }
    }

    /// Server options from a PEM certificate chain and private key.
    pub fn new_server_from_pem(cert_chain_pem: &[u8], private_key_pem: &[u8]) -> TlsContextOptions {
        TlsContextOptions {
            role: ContextRole::Server,
            alpn_list: Vec::new(),
            verify_peer: false,
            minimum_version: TlsVersion::Tls1_2,
            trust_store_pem: None,
            cert_chain_pem: Some(cert_chain_pem.to_vec()),
            private_key_pem: Some(private_key_pem.to_vec()),
            timeout_ms: 10_000,
        }
    }

    /// Server options from PEM files on disk.
    pub fn new_server_from_path(
        cert_chain_path: impl AsRef<std::path::Path>,
        private_key_path: impl AsRef<std::path::Path>,
    ) -> Result<TlsContextOptions, Error> {
        let cert = std::fs::read(cert_chain_path)
            .map_err(|e| Error::with_source(ErrorCode::TLS_CTX_ERROR, e))?;
        let key = std::fs::read(private_key_path)
            .map_err(|e| Error::with_source(ErrorCode::TLS_CTX_ERROR, e))?;
        Ok(Self::new_server_from_pem(&cert, &key))
    }

    /// Semicolon-separated protocol list, e.g. `"h2;http/1.1"`.
    pub fn set_alpn_list(&mut self, list: &str) {
        self.alpn_list = list
            .split(';')
            .filter(|p| !p.is_empty())
            .map(|p| p.as_bytes().to_vec())
            .collect();
    }

    pub fn set_verify_peer(&mut self, verify: bool) {
        self.verify_peer = verify;
    }

    pub fn set_minimum_tls_version(&mut self, version: TlsVersion) {
        self.minimum_version = version;
    }

    /// Replace the default trust store with certificates from PEM.
    pub fn override_default_trust_store(&mut self, pem: &[u8]) {
        self.trust_store_pem = Some(pem.to_vec());
    }

    /// Replace the default trust store with a PEM file on disk.
    pub fn override_default_trust_store_from_path(
        &mut self,
        path: impl AsRef<std::path::Path>,
    ) -> Result<(), Error> {
        let pem =
            std::fs::read(path).map_err(|e| Error::with_source(ErrorCode::TLS_CTX_ERROR, e))?;
        self.trust_store_pem = Some(pem);
        Ok(())
    }

    /// Present a client certificate during the handshake.
    pub fn set_client_mtls_from_pem(&mut self, cert_chain_pem: &[u8], private_key_pem: &[u8]) {
        self.cert_chain_pem = Some(cert_chain_pem.to_vec());
        self.private_key_pem = Some(private_key_pem.to_vec());
    }

    /// Default negotiation timeout for connections using this context.
    /// `0` disables the timeout.
    pub fn set_negotiation_timeout_ms(&mut self, timeout_ms: u32) {
        self.timeout_ms = timeout_ms;
    }
}

enum TlsConfigKind {
    Client(Arc<rustls::ClientConfig>),
    Server(Arc<rustls::ServerConfig>),
}

struct TlsContextInner {
    config: TlsConfigKind,
    timeout_ms: u32,
}

/// An immutable, shareable TLS configuration. Cheap to clone; safe to build
/// concurrently from multiple threads.
#[derive(Clone)]
pub struct TlsContext {
    inner: Arc<TlsContextInner>,
}

impl TlsContext {
    pub fn new_client(options: &TlsContextOptions) -> Result<TlsContext, Error> {
        if !matches!(options.role, ContextRole::Client) {
            return Err(Error::new(ErrorCode::TLS_CTX_ERROR));
        }
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let versions = protocol_versions(options.minimum_version);
        let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(versions)
            .map_err(|_| Error::new(ErrorCode::TLS_CTX_ERROR))?;

        let builder = if options.verify_peer {
            let roots = match &options.trust_store_pem {
                Some(pem) => {
                    let mut store = rustls::RootCertStore::empty();
                    for cert in certs_from_pem(pem)? {
                        store
                            .add(cert)
                            .map_err(|_| Error::new(ErrorCode::TLS_CTX_ERROR))?;
                    }
                    store
                }
                None => rustls::RootCertStore::from_iter(
                    webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
                ),
            };
            builder.with_root_certificates(roots)
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerify((*provider).clone())))
        };

        let mut config = match (&options.cert_chain_pem, &options.private_key_pem) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(certs_from_pem(cert)?, key_from_pem(key)?)
                .map_err(|_| Error::new(ErrorCode::TLS_CTX_ERROR))?,
            _ => builder.with_no_client_auth(),
        };
        config.alpn_protocols = options.alpn_list.clone();

        Ok(TlsContext {
            inner: Arc::new(TlsContextInner {
                config: TlsConfigKind::Client(Arc::new(config)),
                timeout_ms: options.timeout_ms,
            }),
        })
    }

    pub fn new_server(options: &TlsContextOptions) -> Result<TlsContext, Error> {
        if !matches!(options.role, ContextRole::Server) {
            return Err(Error::new(ErrorCode::TLS_CTX_ERROR));
        }
        let (cert, key) = match (&options.cert_chain_pem, &options.private_key_pem) {
            (Some(c), Some(k)) => (c, k),
            _ => return Err(Error::new(ErrorCode::TLS_CTX_ERROR)),
        };
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let versions = protocol_versions(options.minimum_version);
        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(versions)
            .map_err(|_| Error::new(ErrorCode::TLS_CTX_ERROR))?
            .with_no_client_auth()
            .with_single_cert(certs_from_pem(cert)?, key_from_pem(key)?)
            .map_err(|_| Error::new(ErrorCode::TLS_CTX_ERROR))?;
        config.alpn_protocols = options.alpn_list.clone();

        Ok(TlsContext {
            inner: Arc::new(TlsContextInner {
                config: TlsConfigKind::Server(Arc::new(config)),
                timeout_ms: options.timeout_ms,
            }),
        })
    }

}

fn protocol_versions(minimum: TlsVersion) -> &'static [&'static rustls::SupportedProtocolVersion] {
    match minimum {
        TlsVersion::Tls1_0 | TlsVersion::Tls1_1 => {
            // Provider floor is 1.2.
            warn!("TLS versions below 1.2 are unsupported, clamping minimum to 1.2");
            rustls::ALL_VERSIONS
        }
        TlsVersion::Tls1_2 => rustls::ALL_VERSIONS,
        TlsVersion::Tls1_3 => {
            static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];
            TLS13_ONLY
        }
    }
}

fn certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, Error> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut &*pem)
        .collect::<Result<_, _>>()
        .map_err(|e| Error::with_source(ErrorCode::TLS_CTX_ERROR, e))?;
    if certs.is_empty() {
        return Err(Error::new(ErrorCode::TLS_CTX_ERROR));
    }
    Ok(certs)
}

fn key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>, Error> {
    rustls_pemfile::private_key(&mut &*pem)
        .map_err(|e| Error::with_source(ErrorCode::TLS_CTX_ERROR, e))?
        .ok_or_else(|| Error::new(ErrorCode::TLS_CTX_ERROR))
}

/// Certificate verifier that accepts anything; installed when
/// `verify_peer` is disabled.
#[derive(Debug)]
struct NoVerify(rustls::crypto::CryptoProvider);

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// What negotiation produced, surfaced to callbacks and tests.
#[derive(Debug, Clone, Default)]
pub struct TlsSessionSummary {
    pub alpn_protocol: Option<Vec<u8>>,
    pub server_name: Option<String>,
}

pub type NegotiationResultFn = Arc<dyn Fn(&Result<TlsSessionSummary, ErrorCode>) + Send + Sync>;

/// Per-connection TLS options layered over a context.
#[derive(Clone)]
pub struct TlsConnectionOptions {
    ctx: TlsContext,
    server_name: Option<String>,
    alpn_override: Option<Vec<Vec<u8>>>,
    timeout_ms: Option<u32>,
    on_negotiation_result: Option<NegotiationResultFn>,
}

impl TlsConnectionOptions {
    pub fn new(ctx: &TlsContext) -> TlsConnectionOptions {
        TlsConnectionOptions {
            ctx: ctx.clone(),
            server_name: None,
            alpn_override: None,
            timeout_ms: None,
            on_negotiation_result: None,
        }
    }

    /// SNI name to request (client) and verify against. Defaults to the
    /// bootstrap target host.
    pub fn set_server_name(&mut self, name: &str) {
        self.server_name = Some(name.to_string());
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// Override the context's ALPN list for this connection only.
    pub fn set_alpn_list(&mut self, list: &str) {
        self.alpn_override = Some(
            list.split(';')
                .filter(|p| !p.is_empty())
                .map(|p| p.as_bytes().to_vec())
                .collect(),
        );
    }

    /// Override the context's negotiation timeout. `0` disables it.
    pub fn set_negotiation_timeout_ms(&mut self, timeout_ms: u32) {
        self.timeout_ms = Some(timeout_ms);
    }

    /// Observer invoked once with the negotiation outcome. Data only; runs
    /// on the channel's loop.
    pub fn set_negotiation_result_callback(
        &mut self,
        callback: impl Fn(&Result<TlsSessionSummary, ErrorCode>) + Send + Sync + 'static,
    ) {
        self.on_negotiation_result = Some(Arc::new(callback));
    }

    pub(crate) fn effective_timeout_ms(&self) -> u32 {
        self.timeout_ms.unwrap_or(self.ctx.inner.timeout_ms)
    }

    fn client_config(&self) -> Result<Arc<rustls::ClientConfig>, Error> {
        let base = match &self.ctx.inner.config {
            TlsConfigKind::Client(c) => c.clone(),
            TlsConfigKind::Server(_) => return Err(Error::new(ErrorCode::TLS_CTX_ERROR)),
        };
        Ok(match &self.alpn_override {
            Some(alpn) => {
                let mut config = (*base).clone();
                config.alpn_protocols = alpn.clone();
                Arc::new(config)
            }
            None => base,
        })
    }

    fn server_config(&self) -> Result<Arc<rustls::ServerConfig>, Error> {
        let base = match &self.ctx.inner.config {
            TlsConfigKind::Server(c) => c.clone(),
            TlsConfigKind::Client(_) => return Err(Error::new(ErrorCode::TLS_CTX_ERROR)),
        };
        Ok(match &self.alpn_override {
            Some(alpn) => {
                let mut config = (*base).clone();
                config.alpn_protocols = alpn.clone();
                Arc::new(config)
            }
            None => base,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlsPhase {
    NotStarted,
    Negotiating,
    Succeeded,
    Failed,
    ShuttingDown,
}

/// Internal wiring: the bootstrap learns about negotiation completion
/// through this, with loop context available for follow-up scheduling.
pub(crate) type NegotiationHook =
    Box<dyn FnOnce(&mut SlotCtx<'_, '_>, Result<TlsSessionSummary, ErrorCode>)>;

/// Middle channel handler performing the TLS handshake, then transparent
/// encrypt/decrypt of the payload stream.
pub struct TlsHandler {
    session: Box<dyn TlsSession>,
    phase: TlsPhase,
    /// Decrypted data awaiting upstream window.
    buffered_plaintext: BytesMut,
    /// User writes buffered until negotiation completes.
    pending_user_writes: VecDeque<Message>,
    timeout_ms: u32,
    timeout_task: Option<TaskId>,
    on_result: Option<NegotiationResultFn>,
    hook: Option<NegotiationHook>,
    /// Read-direction shutdown parked until cached plaintext drains.
    parked_read_shutdown: Option<ErrorCode>,
}

impl TlsHandler {
    pub(crate) fn client(
        options: &TlsConnectionOptions,
        default_server_name: &str,
        hook: Option<NegotiationHook>,
    ) -> Result<TlsHandler, Error> {
        let name = options.server_name.as_deref().unwrap_or(default_server_name);
        let session = RustlsSession::client(options.client_config()?, name)?;
        Ok(Self::from_session(Box::new(session), options, hook))
    }

    pub(crate) fn server(
        options: &TlsConnectionOptions,
        hook: Option<NegotiationHook>,
    ) -> Result<TlsHandler, Error> {
        let session = RustlsSession::server(options.server_config()?)?;
        Ok(Self::from_session(Box::new(session), options, hook))
    }

    /// Compose a handler over an arbitrary provider session.
    pub fn from_session(
        session: Box<dyn TlsSession>,
        options: &TlsConnectionOptions,
        hook: Option<NegotiationHook>,
    ) -> TlsHandler {
        TlsHandler {
            session,
            phase: TlsPhase::NotStarted,
            buffered_plaintext: BytesMut::new(),
            pending_user_writes: VecDeque::new(),
            timeout_ms: options.effective_timeout_ms(),
            timeout_task: None,
            on_result: options.on_negotiation_result.clone(),
            hook,
            parked_read_shutdown: None,
        }
    }

    fn send_downstream(&mut self, ctx: &mut SlotCtx<'_, '_>, data: BytesMut, kind: MessageKind) {
        if data.is_empty() {
            return;
        }
        let message = match kind {
            MessageKind::Handshake => Message::handshake(data),
            MessageKind::ApplicationData => Message::application(data),
        };
        if let Err(e) = ctx.send_write(message) {
            warn!("forwarding tls records failed: {e}");
            self.fail(ctx, e.code());
        }
    }

    fn flush_plaintext(&mut self, ctx: &mut SlotCtx<'_, '_>) {
        if self.buffered_plaintext.is_empty() {
            return;
        }
        let budget = ctx.read_window();
        if budget == 0 {
            return;
        }
        let n = budget.min(self.buffered_plaintext.len());
        let chunk = self.buffered_plaintext.split_to(n);
        if let Err(e) = ctx.send_read(Message::application(chunk)) {
            warn!("delivering plaintext failed: {e}");
            ctx.shutdown_channel(e.code());
        }
    }

    fn negotiation_succeeded(&mut self, ctx: &mut SlotCtx<'_, '_>) {
        self.phase = TlsPhase::Succeeded;
        if let Some(task) = self.timeout_task.take() {
            ctx.cancel_task(task);
        }
        ctx.set_tls_status(TlsNegotiationStatus::Success);

        let summary = TlsSessionSummary {
            alpn_protocol: self.session.alpn_selected(),
            server_name: self.session.server_name(),
        };
        debug!(
            alpn = ?summary.alpn_protocol.as_deref().map(String::from_utf8_lossy),
            server_name = ?summary.server_name,
            "tls negotiation succeeded"
        );
        let result = Ok(summary);
        if let Some(cb) = self.on_result.take() {
            cb(&result);
        }
        if let Some(hook) = self.hook.take() {
            hook(ctx, result);
        }

        // Drain writes buffered during the handshake, oldest first.
        while let Some(mut message) = self.pending_user_writes.pop_front() {
            let completion = message.take_completion();
            match self.session.push_plaintext(&message.data) {
                Ok(ciphertext) => {
                    let mut out = Message::application(ciphertext);
                    out.on_completion = completion;
                    if let Err(e) = ctx.send_write(out) {
                        self.fail(ctx, e.code());
                        return;
                    }
                }
                Err(e) => {
                    if let Some(completion) = completion {
                        ctx.complete_message(completion, e.code());
                    }
                    self.fail(ctx, e.code());
                    return;
                }
            }
        }
    }

    fn fail(&mut self, ctx: &mut SlotCtx<'_, '_>, code: ErrorCode) {
        if matches!(self.phase, TlsPhase::Failed) {
            return;
        }
        let was_negotiating = matches!(self.phase, TlsPhase::NotStarted | TlsPhase::Negotiating);
        self.phase = TlsPhase::Failed;
        if let Some(task) = self.timeout_task.take() {
            ctx.cancel_task(task);
        }
        if was_negotiating {
            ctx.set_tls_status(TlsNegotiationStatus::Failure);
            debug!(error = %code, "tls negotiation failed");
            let result = Err(code);
            if let Some(cb) = self.on_result.take() {
                cb(&result);
            }
            if let Some(hook) = self.hook.take() {
                hook(ctx, result);
            }
        }
        ctx.shutdown_channel(code);
    }

    fn fail_pending_writes(&mut self, ctx: &mut SlotCtx<'_, '_>, code: ErrorCode) {
        while let Some(mut message) = self.pending_user_writes.pop_front() {
            if let Some(completion) = message.take_completion() {
                ctx.complete_message(completion, code);
            }
        }
    }
}

impl ChannelHandler for TlsHandler {
    fn process_read(&mut self, ctx: &mut SlotCtx<'_, '_>, message: Message) -> Result<(), Error> {
        if matches!(self.phase, TlsPhase::Failed | TlsPhase::ShuttingDown) {
            return Ok(());
        }
        let progress = self.session.push_ciphertext(&message.data);

        self.send_downstream(ctx, progress.ciphertext, MessageKind::Handshake);
        if !progress.plaintext.is_empty() {
            self.buffered_plaintext.extend_from_slice(&progress.plaintext);
        }

        match progress.state {
            Some(TlsSessionState::Failed(code)) => {
                self.fail(ctx, code);
                return Ok(());
            }
            Some(TlsSessionState::Succeeded)
                if matches!(self.phase, TlsPhase::NotStarted | TlsPhase::Negotiating) =>
            {
                self.negotiation_succeeded(ctx);
            }
            _ => {}
        }

        self.flush_plaintext(ctx);

        if progress.peer_closed && !matches!(self.phase, TlsPhase::ShuttingDown) {
            trace!("peer closed tls session");
            ctx.shutdown_channel(ErrorCode::SUCCESS);
        }
        Ok(())
    }

    fn process_write(&mut self, ctx: &mut SlotCtx<'_, '_>, mut message: Message) -> Result<(), Error> {
        match self.phase {
            TlsPhase::NotStarted | TlsPhase::Negotiating => {
                self.pending_user_writes.push_back(message);
                Ok(())
            }
            TlsPhase::Succeeded => {
                let completion = message.take_completion();
                match self.session.push_plaintext(&message.data) {
                    Ok(ciphertext) => {
                        let mut out = Message::application(ciphertext);
                        out.on_completion = completion;
                        ctx.send_write(out)
                    }
                    Err(e) => {
                        let code = e.code();
                        if let Some(completion) = completion {
                            ctx.complete_message(completion, code);
                        }
                        ctx.shutdown_channel(code);
                        Ok(())
                    }
                }
            }
            TlsPhase::Failed | TlsPhase::ShuttingDown => {
                if let Some(completion) = message.take_completion() {
                    ctx.complete_message(completion, ErrorCode::CHANNEL_SHUT_DOWN);
                }
                Ok(())
            }
        }
    }

    fn increment_read_window(&mut self, ctx: &mut SlotCtx<'_, '_>, delta: usize) {
        self.flush_plaintext(ctx);
        if self.buffered_plaintext.is_empty() {
            if let Some(error) = self.parked_read_shutdown.take() {
                ctx.complete_shutdown(Direction::Read, error);
            }
        }
        // Pass the credit along so the terminal handler can resume.
        ctx.increment_read_window(delta);
    }

    fn shutdown(
        &mut self,
        ctx: &mut SlotCtx<'_, '_>,
        direction: Direction,
        error: ErrorCode,
        free_scarce_resources: bool,
    ) {
        // A shutdown racing an unfinished handshake is a negotiation
        // failure as far as callbacks are concerned.
        if matches!(self.phase, TlsPhase::NotStarted | TlsPhase::Negotiating) {
            let code = if error.is_ok() {
                ErrorCode::CHANNEL_SHUT_DOWN
            } else {
                error
            };
            if let Some(task) = self.timeout_task.take() {
                ctx.cancel_task(task);
            }
            self.phase = TlsPhase::ShuttingDown;
            ctx.set_tls_status(TlsNegotiationStatus::Failure);
            let result = Err(code);
            if let Some(cb) = self.on_result.take() {
                cb(&result);
            }
            if let Some(hook) = self.hook.take() {
                hook(ctx, result);
            }
        }

        match direction {
            Direction::Read => {
                self.flush_plaintext(ctx);
                if !free_scarce_resources && error.is_ok() && !self.buffered_plaintext.is_empty() {
                    // Cached plaintext must reach the user before the read
                    // side drains; a window increment completes this.
                    trace!(
                        buffered = self.buffered_plaintext.len(),
                        "parking read shutdown until plaintext drains"
                    );
                    self.parked_read_shutdown = Some(error);
                    return;
                }
                self.buffered_plaintext.clear();
                ctx.complete_shutdown(Direction::Read, error);
            }
            Direction::Write => {
                let was_succeeded = matches!(self.phase, TlsPhase::Succeeded);
                self.phase = TlsPhase::ShuttingDown;
                if let Some(task) = self.timeout_task.take() {
                    ctx.cancel_task(task);
                }
                let code = if error.is_ok() {
                    ErrorCode::CHANNEL_SHUT_DOWN
                } else {
                    error
                };
                self.fail_pending_writes(ctx, code);
                if was_succeeded && !free_scarce_resources {
                    let close_notify = self.session.shutdown();
                    self.send_downstream(ctx, close_notify, MessageKind::Handshake);
                }
                ctx.complete_shutdown(Direction::Write, error);
            }
        }
    }

    fn initial_window_size(&self) -> usize {
        // Ciphertext inflow is never throttled; backpressure is applied to
        // the decrypted stream via buffered plaintext.
        usize::MAX
    }

    fn message_overhead(&self) -> usize {
        RECORD_OVERHEAD
    }

    fn on_attached(&mut self, ctx: &mut SlotCtx<'_, '_>) {
        self.phase = TlsPhase::Negotiating;
        ctx.set_tls_status(TlsNegotiationStatus::Ongoing);
        let hello = self.session.pending_output();
        self.send_downstream(ctx, hello, MessageKind::Handshake);
        if self.timeout_ms > 0 {
            let delay = Duration::from_millis(self.timeout_ms as u64);
            self.timeout_task = Some(ctx.schedule_slot_timeout(delay));
        }
    }

    fn on_timeout(&mut self, ctx: &mut SlotCtx<'_, '_>) {
        self.timeout_task = None;
        if matches!(self.phase, TlsPhase::NotStarted | TlsPhase::Negotiating) {
            debug!("tls negotiation timed out");
            self.fail(ctx, ErrorCode::TLS_NEGOTIATION_TIMEOUT);
        }
    }

    fn name(&self) -> &'static str {
        "tls"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_session() -> RustlsSession {
        let mut options = TlsContextOptions::new_client();
        options.set_verify_peer(false);
        options.set_alpn_list("h2;http/1.1");
        let ctx = TlsContext::new_client(&options).unwrap();
        let conn = TlsConnectionOptions::new(&ctx);
        RustlsSession::client(conn.client_config().unwrap(), "example.com").unwrap()
    }

    #[test]
    fn client_emits_hello_before_any_input() {
        let mut session = client_session();
        assert_eq!(session.state(), TlsSessionState::Negotiating);
        let hello = session.pending_output();
        assert!(!hello.is_empty());
        // Drained; nothing more until the peer answers.
        assert!(session.pending_output().is_empty());
    }

    #[test]
    fn garbage_ciphertext_fails_the_session() {
        let mut session = client_session();
        let _ = session.pending_output();
        let progress = session.push_ciphertext(b"this is not a tls record at all");
        assert!(matches!(progress.state, Some(TlsSessionState::Failed(_))));
        assert!(matches!(session.state(), TlsSessionState::Failed(_)));
    }

    #[test]
    fn alpn_list_parses_semicolon_format() {
        let mut options = TlsContextOptions::new_client();
        options.set_alpn_list("h2;http/1.1");
        assert_eq!(
            options.alpn_list,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn server_context_requires_cert_and_key() {
        let mut options = TlsContextOptions::new_client();
        options.role = ContextRole::Server;
        assert!(TlsContext::new_server(&options).is_err());
    }

    #[test]
    fn role_mismatch_is_rejected() {
        let options = TlsContextOptions::new_client();
        assert!(TlsContext::new_server(&options).is_err());
    }

    #[test]
    fn invalid_server_name_is_rejected() {
        let mut options = TlsContextOptions::new_client();
        options.set_verify_peer(false);
        let ctx = TlsContext::new_client(&options).unwrap();
        let conn = TlsConnectionOptions::new(&ctx);
        assert!(RustlsSession::client(conn.client_config().unwrap(), "").is_err());
    }

    #[test]
    fn connection_alpn_override_replaces_context_list() {
        let mut options = TlsContextOptions::new_client();
        options.set_verify_peer(false);
        options.set_alpn_list("h2");
        let ctx = TlsContext::new_client(&options).unwrap();

        let mut conn = TlsConnectionOptions::new(&ctx);
        conn.set_alpn_list("http/1.1");
        let config = conn.client_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn minimum_version_below_floor_clamps() {
        let mut options = TlsContextOptions::new_client();
        options.set_verify_peer(false);
        options.set_minimum_tls_version(TlsVersion::Tls1_0);
        assert!(TlsContext::new_client(&options).is_ok());
    }

    #[test]
    fn handshake_completes_between_paired_sessions() {
        let subject_alt_names = vec!["localhost".to_string()];
        let cert = rcgen::generate_simple_self_signed(subject_alt_names).unwrap();
        let cert_pem = cert.cert.pem();
        let key_pem = cert.key_pair.serialize_pem();

        let server_options =
            TlsContextOptions::new_server_from_pem(cert_pem.as_bytes(), key_pem.as_bytes());
        let server_ctx = TlsContext::new_server(&server_options).unwrap();
        let server_conn = TlsConnectionOptions::new(&server_ctx);
        let mut server = RustlsSession::server(server_conn.server_config().unwrap()).unwrap();

        let mut client_options = TlsContextOptions::new_client();
        client_options.override_default_trust_store(cert_pem.as_bytes());
        let client_ctx = TlsContext::new_client(&client_options).unwrap();
        let client_conn = TlsConnectionOptions::new(&client_ctx);
        let mut client =
            RustlsSession::client(client_conn.client_config().unwrap(), "localhost").unwrap();

        let mut to_server = client.pending_output();
        let mut to_client = BytesMut::new();
        for _ in 0..10 {
            if !to_server.is_empty() {
                let progress = server.push_ciphertext(&to_server);
                to_client = progress.ciphertext;
                to_server = BytesMut::new();
            }
            if !to_client.is_empty() {
                let progress = client.push_ciphertext(&to_client);
                to_server = progress.ciphertext;
                to_client = BytesMut::new();
            }
            if client.state() == TlsSessionState::Succeeded
                && server.state() == TlsSessionState::Succeeded
            {
                break;
            }
        }

        assert_eq!(client.state(), TlsSessionState::Succeeded);
        assert_eq!(server.state(), TlsSessionState::Succeeded);

        // Application data round-trips through both directions.
        let records = client.push_plaintext(b"ping").unwrap();
        let progress = server.push_ciphertext(&records);
        assert_eq!(&progress.plaintext[..], b"ping");

        let records = server.push_plaintext(b"pong").unwrap();
        let progress = client.push_ciphertext(&records);
        assert_eq!(&progress.plaintext[..], b"pong");
    }
}
