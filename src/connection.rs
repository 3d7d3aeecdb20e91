use std::collections::HashMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{ProbeError, Result};

pub const DEFAULT_KEY_NAME: &str = "RootManageSharedAccessKey";

/// `Endpoint=...;SharedAccessKeyName=...;SharedAccessKey=...[;EntityPath=...]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub endpoint: String,
    pub shared_access_key_name: Option<String>,
    pub shared_access_key: Option<String>,
    pub entity_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// In-process broker, `local://<name>`.
    Local(String),
    /// Broker gateway reachable over HTTP(S).
    Http(String),
}

impl FromStr for ConnectionString {
    type Err = ProbeError;

    fn from_str(value: &str) -> Result<Self> {
        let mut fields: HashMap<String, String> = HashMap::new();
        for part in value.split(';').map(str::trim).filter(|part| !part.is_empty()) {
            let Some((key, val)) = part.split_once('=') else {
                return Err(ProbeError::Config(format!(
                    "connection string segment '{part}' is not a key=value pair"
                )));
            };
            fields.insert(key.trim().to_ascii_lowercase(), val.trim().to_string());
        }

        let endpoint = fields
            .remove("endpoint")
            .filter(|endpoint| !endpoint.is_empty())
            .ok_or_else(|| ProbeError::Config("connection string has no Endpoint".to_string()))?;
        let connection = Self {
            endpoint,
            shared_access_key_name: fields.remove("sharedaccesskeyname"),
            shared_access_key: fields.remove("sharedaccesskey"),
            entity_path: fields.remove("entitypath"),
        };
        connection.endpoint()?;
        Ok(connection)
    }
}

impl ConnectionString {
    pub fn endpoint(&self) -> Result<Endpoint> {
        let endpoint = self.endpoint.trim();
        if let Some(name) = endpoint.strip_prefix("local://") {
            let name = name.trim_end_matches('/');
            return Ok(Endpoint::Local(if name.is_empty() {
                "local".to_string()
            } else {
                name.to_string()
            }));
        }
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return Ok(Endpoint::Http(endpoint.trim_end_matches('/').to_string()));
        }
        if endpoint.starts_with("sb://") {
            return Err(ProbeError::Config(format!(
                "endpoint '{endpoint}' needs the AMQP transport, which is not supported; \
                 use an http(s):// broker gateway or local://"
            )));
        }
        Err(ProbeError::Config(format!(
            "endpoint '{endpoint}' has an unsupported scheme (expected local://, http:// or https://)"
        )))
    }

    /// Signer for the shared access key; required for HTTP endpoints.
    pub fn signer(&self) -> Result<SasSigner> {
        let key = self
            .shared_access_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ProbeError::Config("connection string has no SharedAccessKey".to_string()))?;
        let key_name = self
            .shared_access_key_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_KEY_NAME);
        Ok(SasSigner::new(key_name, key))
    }
}

#[derive(Clone)]
pub struct SasSigner {
    key_name: String,
    key: String,
}

impl std::fmt::Debug for SasSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SasSigner")
            .field("key_name", &self.key_name)
            .finish_non_exhaustive()
    }
}

impl SasSigner {
    pub fn new(key_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key_name: key_name.into(),
            key: key.into(),
        }
    }

    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    /// `SharedAccessSignature sr=..&sig=..&se=..&skn=..` valid until `expiry` (unix seconds).
    pub fn token(&self, resource: &str, expiry: i64) -> String {
        let encoded_resource = urlencoding::encode(&resource.to_ascii_lowercase()).into_owned();
        let signature = sign(&self.key, &encoded_resource, expiry);
        format!(
            "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
            encoded_resource,
            urlencoding::encode(&signature),
            expiry,
            urlencoding::encode(&self.key_name)
        )
    }

    /// Check a token produced by [`SasSigner::token`] against this key.
    pub fn verify(&self, token: &str, now: i64) -> Result<()> {
        let fields = token
            .strip_prefix("SharedAccessSignature ")
            .ok_or_else(|| unauthorized("not a shared access signature"))?;
        let mut parts: HashMap<&str, String> = HashMap::new();
        for pair in fields.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(unauthorized("malformed signature field"));
            };
            let value = urlencoding::decode(value)
                .map_err(|_| unauthorized("signature field is not valid utf-8"))?;
            parts.insert(key, value.into_owned());
        }
        let field = |name: &str| {
            parts
                .get(name)
                .cloned()
                .ok_or_else(|| unauthorized(&format!("signature is missing '{name}'")))
        };
        let resource = field("sr")?;
        let signature = field("sig")?;
        let expiry: i64 = field("se")?
            .parse()
            .map_err(|_| unauthorized("signature expiry is not a number"))?;
        if field("skn")? != self.key_name {
            return Err(unauthorized("unknown key name"));
        }
        if expiry <= now {
            return Err(unauthorized("signature expired"));
        }
        let expected = STANDARD
            .decode(signature.as_bytes())
            .map_err(|_| unauthorized("signature is not base64"))?;
        let encoded_resource = urlencoding::encode(&resource).into_owned();
        let mut mac = Hmac::<Sha256>::new_from_slice(self.key.as_bytes())
            .map_err(|e| ProbeError::Runtime(e.to_string()))?;
        mac.update(string_to_sign(&encoded_resource, expiry).as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| unauthorized("signature mismatch"))
    }
}

fn string_to_sign(encoded_resource: &str, expiry: i64) -> String {
    format!("{encoded_resource}\n{expiry}")
}

fn sign(key: &str, encoded_resource: &str, expiry: i64) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key.as_bytes()).expect("HMAC can take key of any size");
    mac.update(string_to_sign(encoded_resource, expiry).as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

fn unauthorized(reason: &str) -> ProbeError {
    ProbeError::Http(format!("unauthorized: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gateway_connection_string() {
        let connection: ConnectionString =
            "Endpoint=http://127.0.0.1:7979/;SharedAccessKeyName=probe;SharedAccessKey=c2VjcmV0;EntityPath=q"
                .parse()
                .unwrap();
        assert_eq!(
            connection.endpoint().unwrap(),
            Endpoint::Http("http://127.0.0.1:7979".to_string())
        );
        assert_eq!(connection.shared_access_key_name.as_deref(), Some("probe"));
        assert_eq!(connection.shared_access_key.as_deref(), Some("c2VjcmV0"));
        assert_eq!(connection.entity_path.as_deref(), Some("q"));
        assert_eq!(connection.signer().unwrap().key_name(), "probe");
    }

    #[test]
    fn local_endpoint_needs_no_key() {
        let connection: ConnectionString = "Endpoint=local://lab".parse().unwrap();
        assert_eq!(connection.endpoint().unwrap(), Endpoint::Local("lab".to_string()));
        assert!(connection.signer().is_err());
    }

    #[test]
    fn rejects_bad_connection_strings() {
        for bad in [
            "",
            "SharedAccessKey=abc",
            "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKey=abc",
            "Endpoint=ftp://host",
            "Endpoint=http://host;garbage",
        ] {
            let parsed = bad.parse::<ConnectionString>();
            assert!(
                matches!(parsed, Err(ProbeError::Config(_))),
                "expected config error for {bad:?}"
            );
        }
    }

    #[test]
    fn token_round_trips_and_detects_tampering() {
        let signer = SasSigner::new("probe", "secret");
        let token = signer.token("http://127.0.0.1:7979", 2_000);
        assert!(token.starts_with("SharedAccessSignature sr="));
        signer.verify(&token, 1_000).unwrap();

        assert!(signer.verify(&token, 2_000).is_err());
        assert!(SasSigner::new("probe", "other").verify(&token, 1_000).is_err());
        assert!(SasSigner::new("admin", "secret").verify(&token, 1_000).is_err());
        let tampered = token.replace("se=2000", "se=3000");
        assert!(signer.verify(&tampered, 1_000).is_err());
        assert!(signer.verify("Bearer secret", 1_000).is_err());
    }
}
