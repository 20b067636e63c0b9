use std::net::{IpAddr, ToSocketAddrs};
use std::thread;

use tracing::{trace, warn};

use crate::error::ErrorCode;

pub type ResolveResult = Result<Vec<IpAddr>, ErrorCode>;
pub type ResolveCallback = Box<dyn FnOnce(ResolveResult) + Send>;

/// Asynchronous host resolution, consumed by the client bootstrap.
///
/// Resolution itself is a collaborator; the core only needs a name to turn
/// into addresses via a callback, which may be invoked from any thread.
pub trait HostResolver: Send + Sync + 'static {
    fn resolve(&self, host: &str, on_resolved: ResolveCallback);
}

/// Default resolver: system lookup on a short-lived helper thread, so the
/// caller never blocks on getaddrinfo.
pub struct ThreadedHostResolver;

impl ThreadedHostResolver {
    pub fn new() -> ThreadedHostResolver {
        ThreadedHostResolver
    }
}

impl Default for ThreadedHostResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl HostResolver for ThreadedHostResolver {
    fn resolve(&self, host: &str, on_resolved: ResolveCallback) {
        // Literal addresses skip the lookup entirely.
        if let Ok(ip) = host.parse::<IpAddr>() {
            on_resolved(Ok(vec![ip]));
            return;
        }

        let host = host.to_string();
        let spawned = thread::Builder::new()
            .name("loomio-resolver".to_string())
            .spawn(move || {
                trace!(host, "resolving");
                match (host.as_str(), 0u16).to_socket_addrs() {
                    Ok(addrs) => {
                        let mut ips: Vec<IpAddr> = Vec::new();
                        for addr in addrs {
                            if !ips.contains(&addr.ip()) {
                                ips.push(addr.ip());
                            }
                        }
                        if ips.is_empty() {
                            on_resolved(Err(ErrorCode::DNS_RESOLVE_FAILURE));
                        } else {
                            on_resolved(Ok(ips));
                        }
                    }
                    Err(e) => {
                        warn!(host, "resolution failed: {e}");
                        on_resolved(Err(ErrorCode::DNS_RESOLVE_FAILURE));
                    }
                }
            });
        if spawned.is_err() {
            warn!("failed to spawn resolver thread");
        }
    }
}
