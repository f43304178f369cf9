//! Curve25519 key material: 32-byte binary keys, their 40-character
//! Z85 text encoding, and the one-shot keygen primitive.
//!
//! Grounded in `zmq::z85_encode`/`z85_decode` (the transport ships its own
//! Z85 codec) and `zmq::CurveKeyPair::new()` for entropy draws, matching
//! `original_source/src/messaging/authentication/generateKeyPair.cpp`.

use thiserror::Error;

/// Raw key length in bytes.
pub const KEY_BYTES: usize = 32;
/// Z85-encoded key length in characters.
pub const KEY_TEXT_LEN: usize = 40;

/// Errors raised while constructing or decoding key material.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Raw key was not exactly 32 bytes.
    #[error("key must be exactly {KEY_BYTES} bytes, got {0}")]
    WrongLength(usize),

    /// Z85 text was not exactly 40 characters or contained invalid symbols.
    #[error("invalid Z85 key text: {0}")]
    InvalidZ85(String),

    /// The transport's entropy draw failed.
    #[error("key generation failed: {0}")]
    GenerationFailed(String),

    /// A key file could not be read, written, or parsed.
    #[error("key file error: {0}")]
    File(String),

    /// Refused to overwrite an existing secret-key file.
    #[error("refusing to overwrite existing private key file: {0}")]
    RefusingOverwrite(String),
}

impl From<std::io::Error> for KeyError {
    fn from(e: std::io::Error) -> Self {
        Self::File(e.to_string())
    }
}

/// A public key: 32 raw bytes, known to both ends of a stonehouse handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey([u8; KEY_BYTES]);

impl PublicKey {
    /// Build a public key from exactly 32 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let array: [u8; KEY_BYTES] = bytes
            .try_into()
            .map_err(|_| KeyError::WrongLength(bytes.len()))?;
        Ok(Self(array))
    }

    /// Decode a public key from its 40-character Z85 text form.
    pub fn from_z85(text: &str) -> Result<Self, KeyError> {
        if text.len() != KEY_TEXT_LEN {
            return Err(KeyError::InvalidZ85(format!(
                "expected {KEY_TEXT_LEN} characters, got {}",
                text.len()
            )));
        }
        let bytes = zmq::z85_decode(text)
            .ok_or_else(|| KeyError::InvalidZ85("not valid Z85".to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Raw 32-byte form.
    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0
    }

    /// 40-character Z85 text form.
    pub fn to_z85(&self) -> String {
        zmq::z85_encode(&self.0).expect("32-byte input always encodes")
    }

    /// Differs from `other` by exactly one byte. Used by the stonehouse
    /// allowlist rejection test (single-byte-flip invariant, §8).
    pub fn differs_by_one_byte(&self, other: &Self) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .filter(|(a, b)| a != b)
            .count()
            == 1
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.to_z85())
    }
}

/// A secret key: never logged, never serialized by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; KEY_BYTES]);

impl SecretKey {
    /// Build a secret key from exactly 32 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let array: [u8; KEY_BYTES] = bytes
            .try_into()
            .map_err(|_| KeyError::WrongLength(bytes.len()))?;
        Ok(Self(array))
    }

    /// Decode a secret key from its 40-character Z85 text form.
    pub fn from_z85(text: &str) -> Result<Self, KeyError> {
        if text.len() != KEY_TEXT_LEN {
            return Err(KeyError::InvalidZ85(format!(
                "expected {KEY_TEXT_LEN} characters, got {}",
                text.len()
            )));
        }
        let bytes = zmq::z85_decode(text)
            .ok_or_else(|| KeyError::InvalidZ85("not valid Z85".to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Raw 32-byte form.
    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0
    }

    /// 40-character Z85 text form. Callers must treat the result as
    /// sensitive; it is never written anywhere but a key file.
    pub fn to_z85(&self) -> String {
        zmq::z85_encode(&self.0).expect("32-byte input always encodes")
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// A matched public/secret pair, drawn once from the transport's keygen
/// primitive. Peers that only need to verify a counterpart's identity hold
/// a bare [`PublicKey`] instead.
#[derive(Clone, Debug)]
pub struct KeyPair {
    /// The public half, shared with peers.
    pub public: PublicKey,
    /// The secret half, kept local.
    pub secret: SecretKey,
}

impl KeyPair {
    /// Draw a fresh keypair from the transport's CURVE keygen primitive.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying entropy draw fails.
    pub fn generate() -> Result<Self, KeyError> {
        let pair = zmq::CurveKeyPair::new()
            .map_err(|e| KeyError::GenerationFailed(e.to_string()))?;
        Ok(Self {
            public: PublicKey::from_z85(&pair.public_key)?,
            secret: SecretKey::from_z85(&pair.secret_key)?,
        })
    }
}

const PUBLIC_PREAMBLE: &str = "#   ZeroMQ CURVE Public Certificate\n\
#   Exchange securely, or use a secure mechanism to verify the contents\n\
#   of this file after exchange. It is recommended to store public\n\
#   certificates in your ${HOME}/.curve home directory.\n";

const SECRET_PREAMBLE: &str = "#   ZeroMQ CURVE **Secret** Certificate\n\
#   DO NOT PROVIDE THIS FILE TO OTHER USERS nor change its permissions.\n";

fn quoted_line(key: &str, value: &str) -> String {
    format!("    {key} = \"{value}\"\n")
}

/// Write a public key to the line-oriented certificate format read by
/// [`read_public_key_file`] (`original_source`'s `certificate.cpp`):
/// a commented preamble, an optional `metadata` block, then a `curve`
/// block carrying `public-key = "<z85>"`.
///
/// # Errors
///
/// Returns an error if the file cannot be created or written.
pub fn write_public_key_file(
    path: &std::path::Path,
    public_key: &PublicKey,
    metadata: Option<&str>,
) -> Result<(), KeyError> {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = std::fs::File::create(path)?;
    write!(file, "{PUBLIC_PREAMBLE}")?;
    if let Some(metadata) = metadata {
        writeln!(file, "metadata")?;
        write!(file, "{}", quoted_line("name", metadata))?;
    }
    writeln!(file, "curve")?;
    write!(file, "{}", quoted_line("public-key", &public_key.to_z85()))?;
    Ok(())
}

/// Write a secret key to the same line-oriented format, carrying
/// `secret-key = "<z85>"` instead. Refuses to overwrite an existing file
/// (`uKeyPair`'s contract, §6): secret material is never silently replaced.
///
/// # Errors
///
/// Returns [`KeyError::RefusingOverwrite`] if `path` already exists, or an
/// I/O error if the file cannot be created or written.
pub fn write_secret_key_file(
    path: &std::path::Path,
    secret_key: &SecretKey,
    metadata: Option<&str>,
) -> Result<(), KeyError> {
    use std::io::Write;
    if path.exists() {
        return Err(KeyError::RefusingOverwrite(path.display().to_string()));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = std::fs::File::create(path)?;
    write!(file, "{SECRET_PREAMBLE}")?;
    if let Some(metadata) = metadata {
        writeln!(file, "metadata")?;
        write!(file, "{}", quoted_line("name", metadata))?;
    }
    writeln!(file, "curve")?;
    write!(file, "{}", quoted_line("secret-key", &secret_key.to_z85()))?;
    Ok(())
}

/// Parse `key = "value"` lines out of a certificate file, skipping blank
/// lines and `#` comments, exactly as `certificate.cpp::loadFromTextFile`
/// does.
fn parse_quoted_fields(contents: &str) -> std::collections::HashMap<String, String> {
    let mut fields = std::collections::HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(eq) = line.find('=') else { continue };
        let Some(first_quote) = line.find('"') else { continue };
        if first_quote <= eq {
            continue;
        }
        let Some(last_quote) = line.rfind('"') else { continue };
        if last_quote <= first_quote + 1 {
            continue;
        }
        let key = line[..eq].trim().to_string();
        let value = line[first_quote + 1..last_quote].to_string();
        fields.insert(key, value);
    }
    fields
}

/// Read a public key written by [`write_public_key_file`].
///
/// # Errors
///
/// Returns an error if the file cannot be read, or does not contain a
/// `public-key` field with valid Z85 text.
pub fn read_public_key_file(path: &std::path::Path) -> Result<PublicKey, KeyError> {
    let contents = std::fs::read_to_string(path)?;
    let fields = parse_quoted_fields(&contents);
    let text = fields
        .get("public-key")
        .ok_or_else(|| KeyError::File(format!("{}: missing public-key field", path.display())))?;
    PublicKey::from_z85(text)
}

/// Read a secret key written by [`write_secret_key_file`].
///
/// # Errors
///
/// Returns an error if the file cannot be read, or does not contain a
/// `secret-key` field with valid Z85 text.
pub fn read_secret_key_file(path: &std::path::Path) -> Result<SecretKey, KeyError> {
    let contents = std::fs::read_to_string(path)?;
    let fields = parse_quoted_fields(&contents);
    let text = fields
        .get("secret-key")
        .ok_or_else(|| KeyError::File(format!("{}: missing secret-key field", path.display())))?;
    SecretKey::from_z85(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keypair_round_trips_through_z85() {
        let pair = KeyPair::generate().expect("keygen should succeed");
        let text = pair.public.to_z85();
        assert_eq!(text.len(), KEY_TEXT_LEN);
        let decoded = PublicKey::from_z85(&text).expect("valid Z85");
        assert_eq!(decoded, pair.public);
    }

    #[test]
    fn rejects_wrong_length_raw_bytes() {
        let err = PublicKey::from_bytes(&[0u8; 10]).unwrap_err();
        assert_eq!(err, KeyError::WrongLength(10));
    }

    #[test]
    fn rejects_z85_text_of_wrong_length() {
        let err = PublicKey::from_z85("short").unwrap_err();
        assert!(matches!(err, KeyError::InvalidZ85(_)));
    }

    #[test]
    fn single_byte_flip_is_detected() {
        let a = PublicKey::from_bytes(&[1u8; KEY_BYTES]).unwrap();
        let mut bytes = [1u8; KEY_BYTES];
        bytes[3] = 2;
        let b = PublicKey::from_bytes(&bytes).unwrap();
        assert!(a.differs_by_one_byte(&b));

        let mut bytes_two_off = [1u8; KEY_BYTES];
        bytes_two_off[3] = 2;
        bytes_two_off[7] = 3;
        let c = PublicKey::from_bytes(&bytes_two_off).unwrap();
        assert!(!a.differs_by_one_byte(&c));
    }

    #[test]
    fn public_and_secret_key_files_round_trip() {
        let dir = std::env::temp_dir().join(format!("umps-keys-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let pair = KeyPair::generate().unwrap();
        let public_path = dir.join("id.pub");
        let secret_path = dir.join("id.key");

        write_public_key_file(&public_path, &pair.public, Some("test-node")).unwrap();
        write_secret_key_file(&secret_path, &pair.secret, Some("test-node")).unwrap();

        assert_eq!(read_public_key_file(&public_path).unwrap(), pair.public);
        assert_eq!(read_secret_key_file(&secret_path).unwrap(), pair.secret);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn writing_secret_key_file_refuses_to_overwrite() {
        let dir = std::env::temp_dir().join(format!("umps-keys-test-overwrite-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let pair = KeyPair::generate().unwrap();
        let secret_path = dir.join("id.key");
        write_secret_key_file(&secret_path, &pair.secret, None).unwrap();

        let err = write_secret_key_file(&secret_path, &pair.secret, None).unwrap_err();
        assert!(matches!(err, KeyError::RefusingOverwrite(_)));

        std::fs::remove_dir_all(&dir).ok();
    }
}
