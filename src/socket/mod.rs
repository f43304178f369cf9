//! Socket primitives (§4.2): typed wrappers over one transport socket each,
//! enforcing their pattern's state machine and reporting security-enriched
//! details.
//!
//! Grounded in `examples/jwilger-caxton`'s layering of a narrow
//! per-subsystem error enum plumbed into the crate-wide [`crate::Error`],
//! and in the garage `zmq` wrapper (`crate::transport`) for the actual I/O.

pub mod pubsub;
pub mod reqrep;
pub mod routerdealer;
pub mod xpubsub;

use thiserror::Error;

use crate::credentials::Privilege;
use crate::transport::{Context, TransportError};
use crate::zap::{Role, SecurityLevel, ZapError, ZapOptions};

/// Socket-layer errors.
#[derive(Error, Debug)]
pub enum SocketError {
    /// `initialize` was called twice.
    #[error("socket already initialized")]
    AlreadyInitialized,

    /// An operation requiring initialization was attempted first.
    #[error("socket not initialized")]
    NotInitialized,

    /// `SocketOptions` failed self-validation.
    #[error("invalid socket options: {0}")]
    InvalidOptions(String),

    /// A `bind`/`connect`/`setsockopt` call into libzmq failed.
    #[error(transparent)]
    Zmq(#[from] zmq::Error),

    /// An async send/recv on the wrapped socket failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// `ZapOptions` construction failed.
    #[error(transparent)]
    Zap(#[from] ZapError),

    /// A receive exceeded its deadline (only surfaced from `request`; plain
    /// `receive(timeout)` represents this as `Ok(None)` instead, per §7).
    #[error("receive timed out")]
    Timeout,

    /// A send could not complete before `send_timeout` elapsed.
    #[error("send would block")]
    SendWouldBlock,

    /// A frame could not be decoded into a known message type.
    #[error(transparent)]
    Message(#[from] crate::message::MessageError),
}

/// Which kind of pattern a socket implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// PUB.
    Publisher,
    /// SUB.
    Subscriber,
    /// XPUB.
    XPublisher,
    /// XSUB.
    XSubscriber,
    /// REQ.
    Request,
    /// REP.
    Reply,
    /// ROUTER.
    Router,
    /// DEALER.
    Dealer,
}

impl SocketKind {
    fn zmq_type(self) -> zmq::SocketType {
        match self {
            Self::Publisher => zmq::PUB,
            Self::Subscriber => zmq::SUB,
            Self::XPublisher => zmq::XPUB,
            Self::XSubscriber => zmq::XSUB,
            Self::Request => zmq::REQ,
            Self::Reply => zmq::REP,
            Self::Router => zmq::ROUTER,
            Self::Dealer => zmq::DEALER,
        }
    }
}

/// Whether a socket binds (listens) or connects (dials out).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOrBind {
    /// The socket calls `bind(address)`.
    Bind,
    /// The socket calls `connect(address)`.
    Connect,
}

/// Options shared by every socket primitive's `initialize`.
#[derive(Clone)]
pub struct SocketOptions {
    /// The endpoint address, e.g. `tcp://*:0` or `ipc:///tmp/mod.ipc`.
    pub address: String,
    /// Whether this socket binds or connects.
    pub connect_or_bind: ConnectOrBind,
    /// The security tier and credentials to apply.
    pub zap: ZapOptions,
    /// `Server` if this socket is the binding side of the ZAP handshake.
    pub role: Role,
    /// Outbound high-water mark; 0 means unbounded. Negative is rejected.
    pub send_hwm: i32,
    /// Inbound high-water mark; 0 means unbounded. Negative is rejected.
    pub recv_hwm: i32,
    /// Milliseconds to block a full send before dropping; < 0 waits
    /// indefinitely.
    pub send_timeout_ms: i32,
    /// Milliseconds to block a receive; < 0 waits indefinitely, 0 polls.
    pub recv_timeout_ms: i32,
    /// Minimum privilege a caller must hold to use this socket.
    pub user_privileges: Privilege,
}

impl SocketOptions {
    /// Construct options with sane testing defaults: unbounded HWM, no
    /// timeout, grasslands security, read-only privilege.
    pub fn new(address: impl Into<String>, connect_or_bind: ConnectOrBind, role: Role) -> Self {
        Self {
            address: address.into(),
            connect_or_bind,
            zap: ZapOptions::grasslands(),
            role,
            send_hwm: 0,
            recv_hwm: 0,
            send_timeout_ms: -1,
            recv_timeout_ms: -1,
            user_privileges: Privilege::ReadOnly,
        }
    }

    /// Override the ZAP options.
    #[must_use]
    pub fn with_zap(mut self, zap: ZapOptions) -> Self {
        self.zap = zap;
        self
    }

    /// Override high-water marks.
    #[must_use]
    pub fn with_hwm(mut self, send_hwm: i32, recv_hwm: i32) -> Self {
        self.send_hwm = send_hwm;
        self.recv_hwm = recv_hwm;
        self
    }

    /// Override send/recv timeouts in milliseconds.
    #[must_use]
    pub fn with_timeouts(mut self, send_timeout_ms: i32, recv_timeout_ms: i32) -> Self {
        self.send_timeout_ms = send_timeout_ms;
        self.recv_timeout_ms = recv_timeout_ms;
        self
    }

    /// Override the required privilege level.
    #[must_use]
    pub fn with_privilege(mut self, privilege: Privilege) -> Self {
        self.user_privileges = privilege;
        self
    }

    fn validate(&self) -> Result<(), SocketError> {
        if self.address.trim().is_empty() {
            return Err(SocketError::InvalidOptions(
                "address must not be blank".to_string(),
            ));
        }
        if self.send_hwm < 0 || self.recv_hwm < 0 {
            return Err(SocketError::InvalidOptions(
                "high-water marks must be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reports the actually-bound address, socket type, and effective security
/// parameters of one socket (§3).
#[derive(Debug, Clone)]
pub struct SocketDetails {
    /// The actually-bound or connected address, after wildcard expansion.
    pub address: String,
    /// Which pattern this socket implements.
    pub socket_type: SocketKind,
    /// Whether this side bound or connected.
    pub connect_or_bind: ConnectOrBind,
    /// The security tier in effect.
    pub security_level: SecurityLevel,
    /// Minimum privilege required to use this socket.
    pub user_privileges: Privilege,
}

/// Open a raw socket of `kind`, apply ZAP options, high-water marks and
/// timeouts, then bind or connect per `options.connect_or_bind`. Shared by
/// every primitive's `initialize`.
///
/// # Errors
///
/// Returns [`SocketError::InvalidOptions`] if options fail validation, or
/// any [`zmq::Error`] from opening/configuring/binding the socket.
pub(crate) fn open_and_configure(
    context: &Context,
    kind: SocketKind,
    options: &SocketOptions,
) -> Result<(zmq::Socket, String), SocketError> {
    options.validate()?;
    let socket = context.socket(kind.zmq_type())?;
    options.zap.apply(options.role, &socket)?;
    socket.set_sndhwm(options.send_hwm)?;
    socket.set_rcvhwm(options.recv_hwm)?;
    socket.set_sndtimeo(options.send_timeout_ms)?;
    socket.set_rcvtimeo(options.recv_timeout_ms)?;

    let bound_address = match options.connect_or_bind {
        ConnectOrBind::Bind => {
            socket.bind(&options.address)?;
            socket
                .get_last_endpoint()
                .ok()
                .flatten()
                .unwrap_or_else(|| options.address.clone())
        }
        ConnectOrBind::Connect => {
            socket.connect(&options.address)?;
            options.address.clone()
        }
    };
    Ok((socket, bound_address))
}

/// Await a multipart send, bounded by `timeout_ms` (`< 0` waits forever).
/// An expired deadline becomes [`SocketError::SendWouldBlock`] rather than
/// silently succeeding or hanging, per §4.2's "blocks up to send_timeout
/// then drops" contract.
pub(crate) async fn send_with_timeout(
    socket: &mut crate::transport::AsyncSocket,
    parts: &[Vec<u8>],
    timeout_ms: i32,
) -> Result<(), SocketError> {
    if timeout_ms < 0 {
        socket.send_multipart(parts).await?;
        return Ok(());
    }
    match tokio::time::timeout(
        std::time::Duration::from_millis(timeout_ms as u64),
        socket.send_multipart(parts),
    )
    .await
    {
        Ok(result) => {
            result?;
            Ok(())
        }
        Err(_elapsed) => Err(SocketError::SendWouldBlock),
    }
}

/// Await a multipart receive, honouring the "`timeout < 0` waits forever,
/// `timeout >= 0` bounds the wait" contract of §4.2/§7: expired deadlines
/// become `Ok(None)` rather than an error.
pub(crate) async fn recv_with_timeout(
    socket: &mut crate::transport::AsyncSocket,
    timeout_ms: i32,
) -> Result<Option<Vec<Vec<u8>>>, SocketError> {
    if timeout_ms < 0 {
        return Ok(Some(socket.recv_multipart().await?));
    }
    match tokio::time::timeout(
        std::time::Duration::from_millis(timeout_ms as u64),
        socket.recv_multipart(),
    )
    .await
    {
        Ok(result) => Ok(Some(result?)),
        Err(_elapsed) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_address() {
        let options = SocketOptions::new("  ", ConnectOrBind::Bind, Role::Server);
        assert!(matches!(
            options.validate(),
            Err(SocketError::InvalidOptions(_))
        ));
    }

    #[test]
    fn rejects_negative_hwm() {
        let options = SocketOptions::new("tcp://*:0", ConnectOrBind::Bind, Role::Server)
            .with_hwm(-1, 0);
        assert!(matches!(
            options.validate(),
            Err(SocketError::InvalidOptions(_))
        ));
    }
}
