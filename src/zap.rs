//! ZAP options: the tagged union of four security levels, parameterised by
//! role, plus the wire shapes of a ZAP request/reply.
//!
//! Grounded in `original_source/src/messaging/authentication/zapOptions.cpp`:
//! each security level has its own server/client socket-option recipe, and
//! woodhouse/stonehouse require a non-blank ZAP domain at construction.

use thiserror::Error;

use crate::credentials::Credential;
use crate::keys::{KeyPair, PublicKey};

/// The four authentication tiers, in ascending strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SecurityLevel {
    /// No authentication at all.
    Grasslands,
    /// ZAP `NULL` mechanism, IP allow/deny list only.
    Strawhouse,
    /// ZAP `PLAIN` mechanism, username/password.
    Woodhouse,
    /// ZAP `CURVE` mechanism, public-key pinning.
    Stonehouse,
}

impl SecurityLevel {
    /// Decode the integer encoding used by ini configuration (§6):
    /// `0=Grasslands, 1=Strawhouse, 2=Woodhouse, 3=Stonehouse`.
    pub fn from_ini_value(value: i64) -> Result<Self, ZapError> {
        match value {
            0 => Ok(Self::Grasslands),
            1 => Ok(Self::Strawhouse),
            2 => Ok(Self::Woodhouse),
            3 => Ok(Self::Stonehouse),
            other => Err(ZapError::InvalidSecurityLevel(other)),
        }
    }
}

/// Which side of a socket pair these options apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The binding/listening side.
    Server,
    /// The connecting side.
    Client,
}

/// Errors raised while constructing ZAP options.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ZapError {
    /// The ini `securityLevel` integer was out of the `[0,3]` range (`4` is
    /// reserved and also rejected).
    #[error("security level must be in range [0,3], got {0}")]
    InvalidSecurityLevel(i64),

    /// Woodhouse/stonehouse require a non-blank ZAP domain.
    #[error("zap domain must not be blank for this security level")]
    BlankDomain,

    /// Woodhouse credentials had an empty username or password.
    #[error("woodhouse credentials require a non-empty username and password")]
    EmptyCredentials,

    /// An accessor was called for a role/variant combination it does not
    /// carry (e.g. asking grasslands for a server keypair).
    #[error("{0} does not apply to this security level/role combination")]
    WrongVariant(&'static str),
}

/// The tagged union of §3: what credentials a socket on a given role needs
/// to present for each security level.
#[derive(Clone)]
pub enum ZapOptions {
    /// No credentials of any kind.
    Grasslands,
    /// IP-allowlist only; domain is carried for ZAP metadata even though no
    /// credential is checked against it.
    Strawhouse {
        /// Non-blank ZAP domain.
        domain: String,
    },
    /// `PLAIN` mechanism.
    Woodhouse {
        /// Non-blank ZAP domain.
        domain: String,
        /// Present only on the client side.
        credentials: Option<Credential>,
    },
    /// `CURVE` mechanism.
    Stonehouse {
        /// Non-blank ZAP domain.
        domain: String,
        /// This side's own keypair (server: server keys; client: client keys).
        own_keys: KeyPair,
        /// The counterpart's public key the client must pin to, or `None`
        /// on the server side (the server accepts any key present in its
        /// authenticator's allowlist instead of pinning one peer).
        peer_public_key: Option<PublicKey>,
    },
}

fn require_non_blank(domain: &str) -> Result<(), ZapError> {
    if domain.trim().is_empty() {
        Err(ZapError::BlankDomain)
    } else {
        Ok(())
    }
}

impl ZapOptions {
    /// `setGrasslandsServer`/`setGrasslandsClient`: unconditionally valid.
    pub fn grasslands() -> Self {
        Self::Grasslands
    }

    /// `setStrawhouseServer`/`setStrawhouseClient`.
    ///
    /// # Errors
    ///
    /// Returns [`ZapError::BlankDomain`] if `domain` is empty or whitespace.
    pub fn strawhouse(domain: impl Into<String>) -> Result<Self, ZapError> {
        let domain = domain.into();
        require_non_blank(&domain)?;
        Ok(Self::Strawhouse { domain })
    }

    /// `setWoodhouseServer`: server side carries only the domain, since the
    /// user store (not the socket) holds credentials.
    ///
    /// # Errors
    ///
    /// Returns [`ZapError::BlankDomain`] if `domain` is empty or whitespace.
    pub fn woodhouse_server(domain: impl Into<String>) -> Result<Self, ZapError> {
        let domain = domain.into();
        require_non_blank(&domain)?;
        Ok(Self::Woodhouse {
            domain,
            credentials: None,
        })
    }

    /// `setWoodhouseClient`: validates non-empty username and password at
    /// construction, matching `UserNameAndPassword`'s constructor contract.
    ///
    /// # Errors
    ///
    /// Returns [`ZapError::BlankDomain`] or [`ZapError::EmptyCredentials`].
    pub fn woodhouse_client(
        domain: impl Into<String>,
        credentials: Credential,
    ) -> Result<Self, ZapError> {
        let domain = domain.into();
        require_non_blank(&domain)?;
        if credentials.username.is_empty() || credentials.password.is_empty() {
            return Err(ZapError::EmptyCredentials);
        }
        Ok(Self::Woodhouse {
            domain,
            credentials: Some(credentials),
        })
    }

    /// `setStonehouseServer`.
    ///
    /// # Errors
    ///
    /// Returns [`ZapError::BlankDomain`] if `domain` is empty or whitespace.
    pub fn stonehouse_server(
        domain: impl Into<String>,
        server_keys: KeyPair,
    ) -> Result<Self, ZapError> {
        let domain = domain.into();
        require_non_blank(&domain)?;
        Ok(Self::Stonehouse {
            domain,
            own_keys: server_keys,
            peer_public_key: None,
        })
    }

    /// `setStonehouseClient`.
    ///
    /// # Errors
    ///
    /// Returns [`ZapError::BlankDomain`] if `domain` is empty or whitespace.
    pub fn stonehouse_client(
        domain: impl Into<String>,
        server_public_key: PublicKey,
        client_keys: KeyPair,
    ) -> Result<Self, ZapError> {
        let domain = domain.into();
        require_non_blank(&domain)?;
        Ok(Self::Stonehouse {
            domain,
            own_keys: client_keys,
            peer_public_key: Some(server_public_key),
        })
    }

    /// The security level this variant belongs to.
    pub fn security_level(&self) -> SecurityLevel {
        match self {
            Self::Grasslands => SecurityLevel::Grasslands,
            Self::Strawhouse { .. } => SecurityLevel::Strawhouse,
            Self::Woodhouse { .. } => SecurityLevel::Woodhouse,
            Self::Stonehouse { .. } => SecurityLevel::Stonehouse,
        }
    }

    /// `getClientCredentials`: client-side woodhouse credentials.
    ///
    /// # Errors
    ///
    /// Returns [`ZapError::WrongVariant`] for any other variant.
    pub fn client_credentials(&self) -> Result<&Credential, ZapError> {
        match self {
            Self::Woodhouse {
                credentials: Some(c),
                ..
            } => Ok(c),
            _ => Err(ZapError::WrongVariant("client_credentials")),
        }
    }

    /// `getServerKeys`/`getClientKeys`: the stonehouse keypair this side owns.
    ///
    /// # Errors
    ///
    /// Returns [`ZapError::WrongVariant`] for any other variant.
    pub fn own_keys(&self) -> Result<&KeyPair, ZapError> {
        match self {
            Self::Stonehouse { own_keys, .. } => Ok(own_keys),
            _ => Err(ZapError::WrongVariant("own_keys")),
        }
    }

    /// Apply this variant's socket options to a raw transport socket,
    /// dispatching per security level exactly as
    /// `ZAPOptions::setSocketOptions` does.
    ///
    /// # Errors
    ///
    /// Returns a [`zmq::Error`] if the underlying `setsockopt` call fails.
    pub fn apply(&self, role: Role, socket: &zmq::Socket) -> Result<(), zmq::Error> {
        match (self, role) {
            (Self::Grasslands, _) => Ok(()),
            (Self::Strawhouse { domain }, Role::Server) => socket.set_zap_domain(domain),
            (Self::Strawhouse { .. }, Role::Client) => Ok(()),
            (Self::Woodhouse { domain, .. }, Role::Server) => {
                socket.set_zap_domain(domain)?;
                socket.set_plain_server(true)
            }
            (
                Self::Woodhouse {
                    domain,
                    credentials: Some(credentials),
                },
                Role::Client,
            ) => {
                socket.set_zap_domain(domain)?;
                socket.set_plain_username(&credentials.username)?;
                socket.set_plain_password(&credentials.password)
            }
            (Self::Woodhouse { .. }, Role::Client) => Ok(()),
            (
                Self::Stonehouse {
                    domain, own_keys, ..
                },
                Role::Server,
            ) => {
                socket.set_zap_domain(domain)?;
                socket.set_curve_server(true)?;
                socket.set_curve_publickey(own_keys.public.as_bytes())?;
                socket.set_curve_secretkey(own_keys.secret.as_bytes())
            }
            (
                Self::Stonehouse {
                    domain,
                    own_keys,
                    peer_public_key: Some(server_key),
                },
                Role::Client,
            ) => {
                socket.set_zap_domain(domain)?;
                socket.set_curve_serverkey(server_key.as_bytes())?;
                socket.set_curve_publickey(own_keys.public.as_bytes())?;
                socket.set_curve_secretkey(own_keys.secret.as_bytes())
            }
            (Self::Stonehouse { .. }, Role::Client) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn woodhouse_rejects_blank_domain() {
        assert_eq!(
            ZapOptions::woodhouse_server("").unwrap_err(),
            ZapError::BlankDomain
        );
    }

    #[test]
    fn woodhouse_client_rejects_empty_credentials() {
        let err = ZapOptions::woodhouse_client(
            "global",
            Credential {
                username: String::new(),
                password: "secret".to_string(),
            },
        )
        .unwrap_err();
        assert_eq!(err, ZapError::EmptyCredentials);
    }

    #[test]
    fn stonehouse_rejects_blank_domain() {
        let keys = KeyPair::generate().unwrap();
        assert_eq!(
            ZapOptions::stonehouse_server("  ", keys).unwrap_err(),
            ZapError::BlankDomain
        );
    }

    #[test]
    fn security_level_round_trips_through_ini_values() {
        for (value, level) in [
            (0, SecurityLevel::Grasslands),
            (1, SecurityLevel::Strawhouse),
            (2, SecurityLevel::Woodhouse),
            (3, SecurityLevel::Stonehouse),
        ] {
            assert_eq!(SecurityLevel::from_ini_value(value).unwrap(), level);
        }
        assert!(SecurityLevel::from_ini_value(4).is_err());
        assert!(SecurityLevel::from_ini_value(-1).is_err());
    }

    #[test]
    fn client_credentials_accessor_fails_on_wrong_variant() {
        assert!(matches!(
            ZapOptions::Grasslands.client_credentials(),
            Err(ZapError::WrongVariant(_))
        ));
    }
}
