//! XPublisher/XSubscriber primitives (§4.2): identical framing to pub/sub,
//! but both subscription and data frames flow in both directions. Used
//! exclusively as the frontend/backend pair inside a broadcast [`crate::proxy::Proxy`];
//! application code never instantiates these directly.

use tracing::debug;

use crate::transport::AsyncSocket;
use crate::transport::Context;

use super::{open_and_configure, SocketDetails, SocketError, SocketKind, SocketOptions};

/// The proxy-facing frontend of a broadcast: subscribers connect here.
pub struct XPublisher {
    context: Context,
    socket: Option<AsyncSocket>,
    details: Option<SocketDetails>,
}

impl XPublisher {
    /// A not-yet-initialized xpublisher on the given context.
    pub fn new(context: Context) -> Self {
        Self {
            context,
            socket: None,
            details: None,
        }
    }

    /// Bind or connect per `options`.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::AlreadyInitialized`] if called twice, or any
    /// error from socket construction.
    pub fn initialize(&mut self, options: SocketOptions) -> Result<(), SocketError> {
        if self.is_initialized() {
            return Err(SocketError::AlreadyInitialized);
        }
        let (socket, address) =
            open_and_configure(&self.context, SocketKind::XPublisher, &options)?;
        self.details = Some(SocketDetails {
            address,
            socket_type: SocketKind::XPublisher,
            connect_or_bind: options.connect_or_bind,
            security_level: options.zap.security_level(),
            user_privileges: options.user_privileges,
        });
        self.socket = Some(AsyncSocket::new(socket)?);
        debug!("xpublisher initialized");
        Ok(())
    }

    /// Whether `initialize` has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.socket.is_some()
    }

    /// The bound/connected address and effective security parameters.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotInitialized`] if not yet initialized.
    pub fn socket_details(&self) -> Result<&SocketDetails, SocketError> {
        self.details.as_ref().ok_or(SocketError::NotInitialized)
    }

    /// Raw transport access for the proxy engine's shoveling loop.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotInitialized`] if not yet initialized.
    pub(crate) fn raw_socket(&mut self) -> Result<&mut AsyncSocket, SocketError> {
        self.socket.as_mut().ok_or(SocketError::NotInitialized)
    }

    /// Release the transport endpoint.
    pub fn disconnect(&mut self) {
        self.socket = None;
        self.details = None;
    }
}

/// The proxy-facing backend of a broadcast: publishers connect here.
pub struct XSubscriber {
    context: Context,
    socket: Option<AsyncSocket>,
    details: Option<SocketDetails>,
}

impl XSubscriber {
    /// A not-yet-initialized xsubscriber on the given context.
    pub fn new(context: Context) -> Self {
        Self {
            context,
            socket: None,
            details: None,
        }
    }

    /// Bind or connect per `options`.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::AlreadyInitialized`] if called twice, or any
    /// error from socket construction.
    pub fn initialize(&mut self, options: SocketOptions) -> Result<(), SocketError> {
        if self.is_initialized() {
            return Err(SocketError::AlreadyInitialized);
        }
        let (socket, address) =
            open_and_configure(&self.context, SocketKind::XSubscriber, &options)?;
        self.details = Some(SocketDetails {
            address,
            socket_type: SocketKind::XSubscriber,
            connect_or_bind: options.connect_or_bind,
            security_level: options.zap.security_level(),
            user_privileges: options.user_privileges,
        });
        self.socket = Some(AsyncSocket::new(socket)?);
        debug!("xsubscriber initialized");
        Ok(())
    }

    /// Whether `initialize` has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.socket.is_some()
    }

    /// The bound/connected address and effective security parameters.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotInitialized`] if not yet initialized.
    pub fn socket_details(&self) -> Result<&SocketDetails, SocketError> {
        self.details.as_ref().ok_or(SocketError::NotInitialized)
    }

    /// Raw transport access for the proxy engine's shoveling loop.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotInitialized`] if not yet initialized.
    pub(crate) fn raw_socket(&mut self) -> Result<&mut AsyncSocket, SocketError> {
        self.socket.as_mut().ok_or(SocketError::NotInitialized)
    }

    /// Release the transport endpoint.
    pub fn disconnect(&mut self) {
        self.socket = None;
        self.details = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::ConnectOrBind;
    use crate::zap::Role;

    #[test]
    fn xpublisher_reports_not_initialized_before_initialize() {
        let xpub = XPublisher::new(Context::new());
        assert!(!xpub.is_initialized());
        assert!(matches!(
            xpub.socket_details(),
            Err(SocketError::NotInitialized)
        ));
    }

    #[test]
    fn xsubscriber_initializes_and_reports_details() {
        let mut xsub = XSubscriber::new(Context::new());
        xsub.initialize(SocketOptions::new(
            "inproc://xsub-details-test",
            ConnectOrBind::Bind,
            Role::Server,
        ))
        .unwrap();
        assert!(xsub.is_initialized());
        assert_eq!(xsub.socket_details().unwrap().socket_type, SocketKind::XSubscriber);
    }
}
