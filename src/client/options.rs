//! Connection options.
//!
//! Options can be set one by one through the [`Connection`](super::Connection)
//! setters or in bulk from a JSON object:
//!
//! ```json
//! {
//!   "ProductId": "pr-12345678",
//!   "DeviceId": "de-abcdefgh",
//!   "ServerUrl": "https://pr-12345678.clients.example.net",
//!   "ServerKey": "sk-5f3ab4bea7cc2585091539fb950084ce",
//!   "PrivateKey": "<64 hex characters>",
//!   "Local": true,
//!   "Remote": false,
//!   "KeepAliveInterval": 30000,
//!   "KeepAliveRetryInterval": 2000,
//!   "KeepAliveMaxRetries": 15
//! }
//! ```
//!
//! Unknown keys are rejected. The private key is never written back out.
//! Keep-alive intervals are in milliseconds; an interval of zero disables
//! keep-alive probing.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::Error;
use crate::core::constants::{
    DEFAULT_CHANNEL_TIMEOUT, DEFAULT_CONNECT_TIMEOUT, DEFAULT_KEEP_ALIVE_INTERVAL,
    DEFAULT_KEEP_ALIVE_MAX_RETRIES, DEFAULT_KEEP_ALIVE_RETRY_INTERVAL, DEFAULT_REQUEST_TIMEOUT,
};
use crate::crypto::{KeyError, PrivateKey};

/// Errors applying options.
#[derive(Debug, Error)]
pub enum OptionsError {
    /// Not a JSON object with known keys and correctly typed values.
    #[error("invalid options: {0}")]
    Json(#[from] serde_json::Error),

    /// The private key did not parse.
    #[error("invalid private key: {0}")]
    Key(#[from] KeyError),
}

impl From<OptionsError> for Error {
    fn from(_: OptionsError) -> Self {
        Error::InvalidArgument
    }
}

/// Wire form of the options object. Every key is optional.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
struct OptionsBlob {
    #[serde(skip_serializing_if = "Option::is_none")]
    product_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_jwt_token: Option<String>,
    #[serde(skip_serializing)]
    private_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    app_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    app_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    local: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remote: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rendezvous: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    direct_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive_interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive_retry_interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive_max_retries: Option<u32>,
}

/// Liveness probing of an idle connection.
///
/// After `interval` without any inbound datagram a keep-alive is sent, then
/// resent every `retry_interval`. The connection is torn down with
/// [`Error::Timeout`] once `max_retries` keep-alives went unanswered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveSettings {
    /// Silence before the first keep-alive. Zero disables keep-alive.
    pub interval: Duration,
    /// Time between unanswered keep-alives.
    pub retry_interval: Duration,
    /// Unanswered keep-alives before the connection is declared dead.
    pub max_retries: u32,
}

impl KeepAliveSettings {
    /// Whether probing is switched on.
    pub fn enabled(&self) -> bool {
        !self.interval.is_zero() && self.max_retries > 0
    }
}

impl Default for KeepAliveSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            retry_interval: DEFAULT_KEEP_ALIVE_RETRY_INTERVAL,
            max_retries: DEFAULT_KEEP_ALIVE_MAX_RETRIES,
        }
    }
}

/// Everything a connection is configured with.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Target product id.
    pub product_id: Option<String>,
    /// Target device id.
    pub device_id: Option<String>,
    /// Relay/rendezvous server url.
    pub server_url: Option<String>,
    /// Key identifying the application at the server.
    pub server_key: Option<String>,
    /// Bearer token for the server.
    pub server_jwt_token: Option<String>,
    /// Client identity.
    pub private_key: Option<PrivateKey>,
    /// Application name presented to the device.
    pub app_name: Option<String>,
    /// Application version presented to the device.
    pub app_version: Option<String>,
    /// Attempt local discovery.
    pub local: bool,
    /// Attempt the relay.
    pub remote: bool,
    /// Upgrade relayed connections to peer-to-peer.
    pub rendezvous: bool,
    /// Only use direct candidates.
    pub direct_only: bool,
    /// Upper bound on the whole connect operation.
    pub connect_timeout: Duration,
    /// Upper bound on a single channel attempt.
    pub channel_timeout: Duration,
    /// How long a request waits for its response.
    pub request_timeout: Duration,
    /// Liveness probing once connected.
    pub keep_alive: KeepAliveSettings,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            product_id: None,
            device_id: None,
            server_url: None,
            server_key: None,
            server_jwt_token: None,
            private_key: None,
            app_name: None,
            app_version: None,
            local: true,
            remote: true,
            rendezvous: true,
            direct_only: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            channel_timeout: DEFAULT_CHANNEL_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            keep_alive: KeepAliveSettings::default(),
        }
    }
}

impl ConnectionOptions {
    /// Apply the keys present in a JSON object.
    ///
    /// Nothing is applied when any key is unknown or malformed.
    pub fn apply_json(&mut self, json: &str) -> Result<(), OptionsError> {
        let blob: OptionsBlob = serde_json::from_str(json)?;
        let private_key = blob
            .private_key
            .as_deref()
            .map(PrivateKey::from_hex)
            .transpose()?;

        macro_rules! merge {
            ($($field:ident),*) => {
                $(if let Some(value) = blob.$field {
                    self.$field = Some(value);
                })*
            };
        }
        merge!(product_id, device_id, server_url, server_key, server_jwt_token, app_name, app_version);

        if private_key.is_some() {
            self.private_key = private_key;
        }
        self.local = blob.local.unwrap_or(self.local);
        self.remote = blob.remote.unwrap_or(self.remote);
        self.rendezvous = blob.rendezvous.unwrap_or(self.rendezvous);
        self.direct_only = blob.direct_only.unwrap_or(self.direct_only);
        if let Some(ms) = blob.keep_alive_interval {
            self.keep_alive.interval = Duration::from_millis(ms);
        }
        if let Some(ms) = blob.keep_alive_retry_interval {
            self.keep_alive.retry_interval = Duration::from_millis(ms);
        }
        if let Some(retries) = blob.keep_alive_max_retries {
            self.keep_alive.max_retries = retries;
        }
        Ok(())
    }

    /// The options as a JSON object, without the private key.
    pub fn to_json(&self) -> String {
        let blob = OptionsBlob {
            product_id: self.product_id.clone(),
            device_id: self.device_id.clone(),
            server_url: self.server_url.clone(),
            server_key: self.server_key.clone(),
            server_jwt_token: self.server_jwt_token.clone(),
            private_key: None,
            app_name: self.app_name.clone(),
            app_version: self.app_version.clone(),
            local: Some(self.local),
            remote: Some(self.remote),
            rendezvous: Some(self.rendezvous),
            direct_only: Some(self.direct_only),
            keep_alive_interval: Some(self.keep_alive.interval.as_millis() as u64),
            keep_alive_retry_interval: Some(self.keep_alive.retry_interval.as_millis() as u64),
            keep_alive_max_retries: Some(self.keep_alive.max_retries),
        };
        serde_json::to_string(&blob).unwrap_or_else(|_| String::from("{}"))
    }

    /// Whether local discovery should be attempted.
    pub fn local_enabled(&self) -> bool {
        self.local && !self.direct_only
    }

    /// Whether the relay should be attempted.
    pub fn remote_enabled(&self) -> bool {
        self.remote && !self.direct_only && self.server_url.is_some() && self.server_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ConnectionOptions::default();
        assert!(options.local && options.remote && options.rendezvous);
        assert!(!options.direct_only);
        assert_eq!(options.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert!(options.keep_alive.enabled());
    }

    #[test]
    fn test_keep_alive_json() {
        let mut options = ConnectionOptions::default();
        options
            .apply_json(r#"{"KeepAliveInterval":250,"KeepAliveRetryInterval":100,"KeepAliveMaxRetries":3}"#)
            .unwrap();
        assert_eq!(
            options.keep_alive,
            KeepAliveSettings {
                interval: Duration::from_millis(250),
                retry_interval: Duration::from_millis(100),
                max_retries: 3,
            }
        );

        let value: serde_json::Value = serde_json::from_str(&options.to_json()).unwrap();
        assert_eq!(value["KeepAliveInterval"], 250);
        assert_eq!(value["KeepAliveMaxRetries"], 3);

        options.apply_json(r#"{"KeepAliveInterval":0}"#).unwrap();
        assert!(!options.keep_alive.enabled());
        assert!(options.apply_json(r#"{"KeepAliveInterval":-1}"#).is_err());
    }

    #[test]
    fn test_apply_json() {
        let key = PrivateKey::generate();
        let mut options = ConnectionOptions::default();
        options
            .apply_json(&format!(
                r#"{{"ProductId":"pr-1","DeviceId":"de-1","PrivateKey":"{}","Local":false}}"#,
                key.to_hex()
            ))
            .unwrap();

        assert_eq!(options.product_id.as_deref(), Some("pr-1"));
        assert_eq!(options.device_id.as_deref(), Some("de-1"));
        assert!(!options.local);
        assert!(options.remote);
        assert_eq!(
            options.private_key.map(|k| k.fingerprint()),
            Some(key.fingerprint())
        );
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut options = ConnectionOptions::default();
        let err = options
            .apply_json(r#"{"ProductId":"pr-1","Colour":"blue"}"#)
            .unwrap_err();
        assert!(matches!(err, OptionsError::Json(_)));
        assert_eq!(Error::from(err), Error::InvalidArgument);
        assert_eq!(options.product_id, None);
    }

    #[test]
    fn test_bad_private_key() {
        let mut options = ConnectionOptions::default();
        let err = options.apply_json(r#"{"PrivateKey":"zz"}"#).unwrap_err();
        assert!(matches!(err, OptionsError::Key(KeyError::InvalidHex)));
    }

    #[test]
    fn test_json_omits_private_key() {
        let mut options = ConnectionOptions::default();
        options.product_id = Some("pr-1".into());
        options.private_key = Some(PrivateKey::generate());

        let json = options.to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["ProductId"], "pr-1");
        assert_eq!(value["Local"], true);
        assert!(value.get("PrivateKey").is_none());
        assert!(value.get("DeviceId").is_none());
    }

    #[test]
    fn test_direct_only_disables_others() {
        let mut options = ConnectionOptions::default();
        options.server_url = Some("https://relay".into());
        options.server_key = Some("sk".into());
        assert!(options.local_enabled() && options.remote_enabled());

        options.direct_only = true;
        assert!(!options.local_enabled());
        assert!(!options.remote_enabled());
    }
}
