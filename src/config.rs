//! Ini-file configuration loading (§6): recognised keys per `[section]`,
//! environment-variable credential overrides, and the ZAP client/server
//! option pair every component derives from the same file and section.
//!
//! Grounded in `original_source/src/modules/operator/readZAPOptions.cpp`:
//! `securityLevel` picks the tier, `UMPS_USER`/`UMPS_PASSWORD` override
//! woodhouse credentials when set and non-empty, and stonehouse reads three
//! key-file paths via `crate::keys`'s certificate reader.

use std::path::{Path, PathBuf};

use ini::Ini;
use thiserror::Error;

use crate::credentials::Credential;
use crate::keys::{read_public_key_file, read_secret_key_file, KeyError, KeyPair};
use crate::zap::{SecurityLevel, ZapError, ZapOptions};

/// Configuration-loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The ini file did not exist or could not be parsed.
    #[error("failed to read configuration file {path}: {source}")]
    IniParse {
        /// The file that could not be read.
        path: PathBuf,
        /// Underlying parse error text.
        source: String,
    },

    /// A required key was absent from the given section.
    #[error("section [{section}] is missing required key '{key}'")]
    MissingKey {
        /// The ini section searched.
        section: String,
        /// The key that was not found.
        key: String,
    },

    /// A recognised key held a value of the wrong shape (e.g. non-integer
    /// `securityLevel`).
    #[error("section [{section}] key '{key}' has an invalid value: {reason}")]
    InvalidValue {
        /// The ini section searched.
        section: String,
        /// The key whose value was invalid.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The section name was empty.
    #[error("section name must not be empty")]
    EmptySection,

    /// Building the `ZapOptions` for the resolved security level failed.
    #[error(transparent)]
    Zap(#[from] ZapError),

    /// Reading or parsing a stonehouse key file failed.
    #[error(transparent)]
    Key(#[from] KeyError),
}

fn section<'a>(ini: &'a Ini, section: &str) -> Result<&'a ini::Properties, ConfigError> {
    if section.is_empty() {
        return Err(ConfigError::EmptySection);
    }
    ini.section(Some(section))
        .ok_or_else(|| ConfigError::MissingKey {
            section: section.to_string(),
            key: "<section>".to_string(),
        })
}

fn required<'a>(props: &'a ini::Properties, section_name: &str, key: &str) -> Result<&'a str, ConfigError> {
    props.get(key).ok_or_else(|| ConfigError::MissingKey {
        section: section_name.to_string(),
        key: key.to_string(),
    })
}

fn security_level(
    props: &ini::Properties,
    section_name: &str,
    default: SecurityLevel,
) -> Result<SecurityLevel, ConfigError> {
    match props.get("securityLevel") {
        None => Ok(default),
        Some(text) => {
            let value: i64 = text.parse().map_err(|_| ConfigError::InvalidValue {
                section: section_name.to_string(),
                key: "securityLevel".to_string(),
                reason: format!("'{text}' is not an integer"),
            })?;
            Ok(SecurityLevel::from_ini_value(value)?)
        }
    }
}

fn env_or_ini(props: &ini::Properties, env_var: &str, ini_key: &str) -> Option<String> {
    let from_env = std::env::var(env_var).ok().filter(|v| !v.is_empty());
    from_env.or_else(|| props.get(ini_key).map(str::to_string))
}

fn load_ini(path: &Path) -> Result<Ini, ConfigError> {
    Ini::load_from_file(path).map_err(|e| ConfigError::IniParse {
        path: path.to_path_buf(),
        source: e.to_string(),
    })
}

/// Load client-side `ZAPOptions` from `section` of `path`, matching
/// `readZAPClientOptions`'s two-entry-point shape.
///
/// # Errors
///
/// Returns [`ConfigError`] if the file cannot be read, the section is
/// missing/empty, `securityLevel` is out of range, or a stonehouse key file
/// cannot be read.
pub fn read_zap_client_options(path: &Path, section_name: &str) -> Result<ZapOptions, ConfigError> {
    let ini = load_ini(path)?;
    let props = section(&ini, section_name)?;
    let level = security_level(props, section_name, SecurityLevel::Grasslands)?;
    match level {
        SecurityLevel::Grasslands => Ok(ZapOptions::grasslands()),
        SecurityLevel::Strawhouse => {
            let domain = required(props, section_name, "zapDomain")?;
            Ok(ZapOptions::strawhouse(domain)?)
        }
        SecurityLevel::Woodhouse => {
            let domain = required(props, section_name, "zapDomain")?;
            let username = env_or_ini(props, "UMPS_USER", "clientUserName").unwrap_or_default();
            let password = env_or_ini(props, "UMPS_PASSWORD", "clientPassword").unwrap_or_default();
            Ok(ZapOptions::woodhouse_client(
                domain,
                Credential { username, password },
            )?)
        }
        SecurityLevel::Stonehouse => {
            let domain = required(props, section_name, "zapDomain")?;
            let server_public_key_file = required(props, section_name, "serverPublicKeyFile")?;
            let client_public_key_file = required(props, section_name, "clientPublicKeyFile")?;
            let client_private_key_file = required(props, section_name, "clientPrivateKeyFile")?;
            let server_public_key = read_public_key_file(Path::new(server_public_key_file))?;
            let client_public = read_public_key_file(Path::new(client_public_key_file))?;
            let client_secret = read_secret_key_file(Path::new(client_private_key_file))?;
            Ok(ZapOptions::stonehouse_client(
                domain,
                server_public_key,
                KeyPair {
                    public: client_public,
                    secret: client_secret,
                },
            )?)
        }
    }
}

/// Load server-side `ZAPOptions` from `section` of `path`, matching
/// `readZAPServerOptions`.
///
/// # Errors
///
/// Returns [`ConfigError`] under the same conditions as
/// [`read_zap_client_options`].
pub fn read_zap_server_options(path: &Path, section_name: &str) -> Result<ZapOptions, ConfigError> {
    let ini = load_ini(path)?;
    let props = section(&ini, section_name)?;
    let level = security_level(props, section_name, SecurityLevel::Grasslands)?;
    match level {
        SecurityLevel::Grasslands => Ok(ZapOptions::grasslands()),
        SecurityLevel::Strawhouse => {
            let domain = required(props, section_name, "zapDomain")?;
            Ok(ZapOptions::strawhouse(domain)?)
        }
        SecurityLevel::Woodhouse => {
            let domain = required(props, section_name, "zapDomain")?;
            Ok(ZapOptions::woodhouse_server(domain)?)
        }
        SecurityLevel::Stonehouse => {
            let domain = required(props, section_name, "zapDomain")?;
            let public_key_file = required(props, section_name, "serverPublicKeyFile")?;
            let private_key_file = required(props, section_name, "serverPrivateKeyFile")?;
            let public = read_public_key_file(Path::new(public_key_file))?;
            let secret = read_secret_key_file(Path::new(private_key_file))?;
            Ok(ZapOptions::stonehouse_server(
                domain,
                KeyPair { public, secret },
            )?)
        }
    }
}

/// Non-ZAP settings shared by broadcast/service components, read from the
/// same section (§6's recognised-keys list).
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// The client-facing (frontend) bind/connect address.
    pub frontend_address: String,
    /// The worker-facing (backend) bind/connect address.
    pub backend_address: String,
    /// Frontend-side high water mark, if configured.
    pub frontend_high_water_mark: Option<i32>,
    /// Backend-side high water mark, if configured.
    pub backend_high_water_mark: Option<i32>,
}

fn optional_i32(
    props: &ini::Properties,
    section_name: &str,
    key: &str,
) -> Result<Option<i32>, ConfigError> {
    match props.get(key) {
        None => Ok(None),
        Some(text) => text
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                section: section_name.to_string(),
                key: key.to_string(),
                reason: format!("'{text}' is not an integer"),
            }),
    }
}

/// Load a `[section]`'s frontend/backend addressing and high-water-mark
/// settings.
///
/// # Errors
///
/// Returns [`ConfigError`] if the file cannot be read, the section is
/// missing, or `frontendAddress`/`backendAddress` are absent.
pub fn read_endpoint_config(path: &Path, section_name: &str) -> Result<EndpointConfig, ConfigError> {
    let ini = load_ini(path)?;
    let props = section(&ini, section_name)?;
    Ok(EndpointConfig {
        frontend_address: required(props, section_name, "frontendAddress")?.to_string(),
        backend_address: required(props, section_name, "backendAddress")?.to_string(),
        frontend_high_water_mark: optional_i32(props, section_name, "frontendHighWaterMark")?,
        backend_high_water_mark: optional_i32(props, section_name, "backendHighWaterMark")?,
    })
}

/// Module-command settings: the module's advertised name and the
/// directory holding its IPC socket file.
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    /// This module's unique advertising name.
    pub module_name: String,
    /// Directory under which `<module_name>.ipc` is created.
    pub ipc_directory: PathBuf,
}

/// Load a `[section]`'s `moduleName`/`ipcDirectory` pair.
///
/// # Errors
///
/// Returns [`ConfigError`] if the file cannot be read, the section is
/// missing, or either key is absent.
pub fn read_module_config(path: &Path, section_name: &str) -> Result<ModuleConfig, ConfigError> {
    let ini = load_ini(path)?;
    let props = section(&ini, section_name)?;
    Ok(ModuleConfig {
        module_name: required(props, section_name, "moduleName")?.to_string(),
        ipc_directory: PathBuf::from(required(props, section_name, "ipcDirectory")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_ini(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_security_level_defaults_to_grasslands() {
        let file = write_ini("[uOperator]\naddress = tcp://*:5555\n");
        let options = read_zap_client_options(file.path(), "uOperator").unwrap();
        assert_eq!(options.security_level(), SecurityLevel::Grasslands);
    }

    #[test]
    fn out_of_range_security_level_is_rejected() {
        let file = write_ini("[uOperator]\nsecurityLevel = 4\n");
        let err = read_zap_client_options(file.path(), "uOperator").unwrap_err();
        assert!(matches!(err, ConfigError::Zap(ZapError::InvalidSecurityLevel(4))));
    }

    #[test]
    fn woodhouse_client_prefers_environment_credentials_over_ini() {
        std::env::set_var("UMPS_USER", "env-alice");
        std::env::set_var("UMPS_PASSWORD", "env-secret");
        let file = write_ini(
            "[uOperator]\nsecurityLevel = 2\nzapDomain = global\nclientUserName = ini-bob\nclientPassword = ini-secret\n",
        );
        let options = read_zap_client_options(file.path(), "uOperator").unwrap();
        let credentials = options.client_credentials().unwrap();
        assert_eq!(credentials.username, "env-alice");
        assert_eq!(credentials.password, "env-secret");
        std::env::remove_var("UMPS_USER");
        std::env::remove_var("UMPS_PASSWORD");
    }

    #[test]
    fn endpoint_config_requires_both_addresses() {
        let file = write_ini("[broadcast]\nfrontendAddress = tcp://*:5555\n");
        let err = read_endpoint_config(file.path(), "broadcast").unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { .. }));
    }

    #[test]
    fn module_config_reads_name_and_ipc_directory() {
        let file = write_ini("[echoModule]\nmoduleName = echo\nipcDirectory = /tmp/umps\n");
        let config = read_module_config(file.path(), "echoModule").unwrap();
        assert_eq!(config.module_name, "echo");
        assert_eq!(config.ipc_directory, PathBuf::from("/tmp/umps"));
    }
}
