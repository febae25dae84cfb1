//! # Network Context
//!
//! A [`NetworkContext`] turns dial/listen calls into dispatcher registrations
//! for one local scope. It validates the caller's addresses, registers with the
//! dispatcher, fixes up the assigned port and hands back a [`Connection`].
//!
//! ## Validation Order
//!
//! [`validate_local`] reports the first violated invariant:
//!
//! | Step | Check | Error |
//! |------|-------|-------|
//! | 1 | family is `udp4` | `UnsupportedFamily` |
//! | 2 | local address, host and L3 are present | `MissingLocalAddress` |
//! | 3 | L3 type matches the family | `FamilyMismatch` |
//! | 4 | L3 is not the wildcard address | `UnspecifiedAddress` |
//! | 5 | L4 defaults to port 0, else matches the family | `L4Mismatch` |
//! | 6 | unset IA is filled in, set IA must be local | `NonLocalIa` ("local") |
//! | 7 | bind address passes the same IA check | `NonLocalIa` ("bind") |
//!
//! Nothing touches the dispatcher until validation passes.
//!
//! ## Process-Wide Default
//!
//! Applications that only ever use one scope may install a context in the
//! [`Registry`] at their composition root. Installation happens at most once.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::debug;

use crate::addr::{Addr, HostAddr, Ia, NetFamily, ServiceAddr};
use crate::conn::Connection;
use crate::dispatcher::Dispatcher;
use crate::error::{AlreadyInitialized, NetError, ValidationError};
use crate::resolver::PathResolver;

/// The only family sockets can currently be bound for.
pub const SUPPORTED_FAMILY: NetFamily = NetFamily::Udp4;

/// Validate and normalize the local address of a dial/listen call.
///
/// Returns the parsed family and the local address with its L4 defaulted and
/// its IA filled in.
pub fn validate_local(
    family: &str,
    local: Option<&Addr>,
    local_ia: Ia,
) -> Result<(NetFamily, Addr), ValidationError> {
    let family = match family.parse::<NetFamily>() {
        Ok(f) if f == SUPPORTED_FAMILY => f,
        _ => return Err(ValidationError::UnsupportedFamily(family.to_string())),
    };

    let mut local = local
        .cloned()
        .ok_or(ValidationError::MissingLocalAddress("address"))?;
    let host = local
        .host
        .as_mut()
        .ok_or(ValidationError::MissingLocalAddress("host"))?;
    let l3 = host.l3.ok_or(ValidationError::MissingLocalAddress("L3"))?;

    if l3.ty() != family.l3_type() {
        return Err(ValidationError::FamilyMismatch {
            family,
            actual: l3.ty(),
        });
    }
    if l3.is_unspecified() {
        return Err(ValidationError::UnspecifiedAddress(l3.to_string()));
    }

    match host.l4 {
        None => host.l4 = Some(family.default_l4()),
        Some(l4) if l4.ty() != family.l4_type() => {
            return Err(ValidationError::L4Mismatch {
                family,
                expected: family.l4_type(),
                actual: l4.ty(),
            });
        }
        Some(_) => {}
    }

    local.ia = check_local_ia(local.ia, local_ia, "local")?;
    Ok((family, local))
}

fn check_local_ia(ia: Ia, local_ia: Ia, label: &'static str) -> Result<Ia, ValidationError> {
    if ia.is_zero() {
        return Ok(local_ia);
    }
    if ia != local_ia {
        return Err(ValidationError::NonLocalIa {
            label,
            expected: local_ia,
            actual: ia,
        });
    }
    Ok(ia)
}

fn validate_bind(bind: Option<&Addr>, local_ia: Ia) -> Result<Option<(Addr, SocketAddr)>, ValidationError> {
    let Some(bind) = bind else {
        return Ok(None);
    };
    let mut bind = bind.clone();
    bind.ia = check_local_ia(bind.ia, local_ia, "bind")?;
    let overlay = bind
        .host
        .and_then(|h| h.socket_addr())
        .ok_or(ValidationError::MissingLocalAddress("bind L3"))?;
    Ok(Some((bind, overlay)))
}

// ============================================================================
// NetworkContext
// ============================================================================

/// Dial/listen entry point for one local scope.
pub struct NetworkContext {
    ia: Ia,
    dispatcher: Arc<dyn Dispatcher>,
    resolver: Option<PathResolver>,
}

impl std::fmt::Debug for NetworkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkContext")
            .field("ia", &self.ia)
            .field("daemon_backed", &self.resolver.is_some())
            .finish()
    }
}

impl NetworkContext {
    /// `resolver = None` selects daemon-less mode: callers attach paths themselves.
    pub fn new(ia: Ia, dispatcher: Arc<dyn Dispatcher>, resolver: Option<PathResolver>) -> Self {
        Self {
            ia,
            dispatcher,
            resolver,
        }
    }

    pub fn ia(&self) -> Ia {
        self.ia
    }

    pub fn path_resolver(&self) -> Option<&PathResolver> {
        self.resolver.as_ref()
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    /// Connect to `remote`. `timeout` bounds the dispatcher registration (0 = unbounded).
    pub async fn dial(
        &self,
        family: &str,
        local: Option<&Addr>,
        remote: Option<&Addr>,
        timeout: Duration,
    ) -> Result<Connection, NetError> {
        self.dial_with_bind_svc(family, local, remote, None, ServiceAddr::None, timeout)
            .await
    }

    pub async fn dial_with_bind_svc(
        &self,
        family: &str,
        local: Option<&Addr>,
        remote: Option<&Addr>,
        bind: Option<&Addr>,
        svc: ServiceAddr,
        timeout: Duration,
    ) -> Result<Connection, NetError> {
        let remote = remote.ok_or(ValidationError::NilRemote)?.clone();
        self.register(family, local, Some(remote), bind, svc, timeout)
            .await
    }

    /// Open an unconnected socket.
    pub async fn listen(
        &self,
        family: &str,
        local: Option<&Addr>,
        timeout: Duration,
    ) -> Result<Connection, NetError> {
        self.listen_with_bind_svc(family, local, None, ServiceAddr::None, timeout)
            .await
    }

    pub async fn listen_with_bind_svc(
        &self,
        family: &str,
        local: Option<&Addr>,
        bind: Option<&Addr>,
        svc: ServiceAddr,
        timeout: Duration,
    ) -> Result<Connection, NetError> {
        self.register(family, local, None, bind, svc, timeout).await
    }

    async fn register(
        &self,
        family: &str,
        local: Option<&Addr>,
        remote: Option<Addr>,
        bind: Option<&Addr>,
        svc: ServiceAddr,
        timeout: Duration,
    ) -> Result<Connection, NetError> {
        let (family, mut local) = validate_local(family, local, self.ia)?;
        let bind = validate_bind(bind, self.ia)?;
        let host: HostAddr = local.host.unwrap_or_default();
        let requested = host.port().unwrap_or(0);

        let (socket, port) = self
            .dispatcher
            .register(local.ia, host, bind.as_ref().map(|(_, o)| *o), svc, timeout)
            .await?;

        if port != requested
            && let Some(h) = local.host.as_mut()
            && let Some(l4) = h.l4
        {
            h.l4 = Some(l4.with_port(port));
        }
        debug!(
            local = %local,
            remote = ?remote.as_ref().map(|r| r.to_string()),
            svc = %svc,
            "registered connection"
        );

        Ok(Connection::new(
            family,
            local,
            remote,
            bind.map(|(addr, _)| addr),
            svc,
            socket,
            self.resolver.clone(),
        ))
    }
}

// ============================================================================
// Process-Wide Default
// ============================================================================

/// Holder for the process-wide default network context.
pub struct Registry {
    default: OnceLock<Arc<NetworkContext>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub const fn new() -> Self {
        Self {
            default: OnceLock::new(),
        }
    }

    /// Install the default context. A second call fails and leaves the first in place.
    pub fn initialize(&self, ctx: NetworkContext) -> Result<Arc<NetworkContext>, AlreadyInitialized> {
        let ctx = Arc::new(ctx);
        self.default.set(ctx.clone()).map_err(|_| AlreadyInitialized)?;
        Ok(ctx)
    }

    pub fn get(&self) -> Option<Arc<NetworkContext>> {
        self.default.get().cloned()
    }
}

static DEFAULT_REGISTRY: Registry = Registry::new();

/// The process-wide registry.
pub fn default_registry() -> &'static Registry {
    &DEFAULT_REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{L3Addr, L4Info};
    use crate::dispatcher::LocalDispatcher;
    use std::net::Ipv4Addr;

    fn ia(s: &str) -> Ia {
        s.parse().unwrap()
    }

    fn local_ia() -> Ia {
        ia("1-ff00:0:110")
    }

    fn addr(s: &str) -> Addr {
        s.parse().unwrap()
    }

    #[test]
    fn rejects_unsupported_family() {
        let a = addr("1-ff00:0:110,[192.0.2.1]:0");
        assert_eq!(
            validate_local("udp6", Some(&a), local_ia()),
            Err(ValidationError::UnsupportedFamily("udp6".into()))
        );
        assert_eq!(
            validate_local("tcp", Some(&a), local_ia()),
            Err(ValidationError::UnsupportedFamily("tcp".into()))
        );
    }

    #[test]
    fn reports_missing_parts_in_order() {
        assert_eq!(
            validate_local("udp4", None, local_ia()),
            Err(ValidationError::MissingLocalAddress("address"))
        );
        let no_host = Addr {
            ia: local_ia(),
            ..Default::default()
        };
        assert_eq!(
            validate_local("udp4", Some(&no_host), local_ia()),
            Err(ValidationError::MissingLocalAddress("host"))
        );
        let no_l3 = Addr::new(
            local_ia(),
            HostAddr {
                l3: None,
                l4: Some(L4Info::Udp(1)),
            },
        );
        assert_eq!(
            validate_local("udp4", Some(&no_l3), local_ia()),
            Err(ValidationError::MissingLocalAddress("L3"))
        );
    }

    #[test]
    fn rejects_family_mismatch_and_wildcard() {
        let v6 = addr("1-ff00:0:110,[2001:db8::1]:0");
        assert!(matches!(
            validate_local("udp4", Some(&v6), local_ia()),
            Err(ValidationError::FamilyMismatch { .. })
        ));
        let wildcard = addr("1-ff00:0:110,[0.0.0.0]:0");
        assert_eq!(
            validate_local("udp4", Some(&wildcard), local_ia()),
            Err(ValidationError::UnspecifiedAddress("0.0.0.0".into()))
        );
    }

    #[test]
    fn defaults_l4_and_rejects_tcp() {
        let bare = addr("1-ff00:0:110,[192.0.2.1]");
        let (_, filled) = validate_local("udp4", Some(&bare), local_ia()).unwrap();
        assert_eq!(filled.host.unwrap().l4, Some(L4Info::Udp(0)));

        let tcp = Addr::new(
            local_ia(),
            HostAddr::new(L3Addr::Ipv4(Ipv4Addr::new(192, 0, 2, 1)), Some(L4Info::Tcp(80))),
        );
        assert!(matches!(
            validate_local("udp4", Some(&tcp), local_ia()),
            Err(ValidationError::L4Mismatch { .. })
        ));
    }

    #[test]
    fn fills_and_checks_ia() {
        let unset = addr("0-0,[192.0.2.1]:5000");
        let (_, filled) = validate_local("udp4", Some(&unset), local_ia()).unwrap();
        assert_eq!(filled.ia, local_ia());

        let foreign = addr("1-ff00:0:111,[192.0.2.1]:5000");
        assert_eq!(
            validate_local("udp4", Some(&foreign), local_ia()),
            Err(ValidationError::NonLocalIa {
                label: "local",
                expected: local_ia(),
                actual: ia("1-ff00:0:111"),
            })
        );
    }

    #[tokio::test]
    async fn bind_address_checked_under_bind_label() {
        let ctx = NetworkContext::new(local_ia(), Arc::new(LocalDispatcher::new()), None);
        let local = addr("1-ff00:0:110,[192.0.2.1]:0");
        let bind = addr("1-ff00:0:111,[10.0.0.1]:0");
        let err = ctx
            .listen_with_bind_svc("udp4", Some(&local), Some(&bind), ServiceAddr::None, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NetError::Validation(ValidationError::NonLocalIa { label: "bind", .. })
        ));
    }

    #[tokio::test]
    async fn listen_rewrites_assigned_port() {
        let ctx = NetworkContext::new(local_ia(), Arc::new(LocalDispatcher::new()), None);
        let local = addr("1-ff00:0:110,[192.0.2.1]:0");
        let conn = ctx.listen("udp4", Some(&local), Duration::from_secs(1)).await.unwrap();
        assert_eq!(conn.local_addr().port(), Some(crate::dispatcher::FIRST_DYNAMIC_PORT));
        assert!(!conn.is_dialed());
    }

    #[test]
    fn registry_initializes_once() {
        let registry = Registry::new();
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(LocalDispatcher::new());
        assert!(registry.get().is_none());
        registry
            .initialize(NetworkContext::new(local_ia(), dispatcher.clone(), None))
            .unwrap();
        assert_eq!(
            registry
                .initialize(NetworkContext::new(ia("1-ff00:0:111"), dispatcher, None))
                .unwrap_err(),
            AlreadyInitialized
        );
        assert_eq!(registry.get().unwrap().ia(), local_ia());
    }
}
