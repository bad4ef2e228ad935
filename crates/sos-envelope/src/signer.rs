//! Signing backends.
//!
//! Two implementations: an HMAC signer for tests and an ed25519 signer that
//! shells out to `ssh-keygen -Y sign` / `-Y verify` so private key material
//! never enters the process. Resolved signer configurations are cached
//! per-process; [`reset_key_cache`] clears the cache for tests.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::sync::OnceLock;

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use sos_config::Env;

use crate::{EnvelopeError, Stream};

/// Envelope algorithm tag for the HMAC test signer.
pub const ALGO_HMAC_TEST: &str = "hmac-sha256-test";
/// Envelope algorithm tag for ssh-keygen ed25519 signatures.
pub const ALGO_ED25519: &str = "ed25519";

type HmacSha256 = Hmac<Sha256>;

/// A signing capability bound to one stream.
pub trait Signer {
    fn algorithm(&self) -> &'static str;
    fn public_key_id(&self) -> &str;
    fn sign(&self, payload_sha256: &str) -> Result<String, EnvelopeError>;
    fn verify(&self, payload_sha256: &str, signature_b64: &str) -> bool;
    /// Probe the backend once at startup; enforce-mode configurations fail
    /// fast when the backend binary is unavailable.
    fn verify_available(&self) -> Result<(), EnvelopeError>;
}

/// Test-only signer: `base64(HMAC_SHA256(secret, payload_sha))`.
pub struct HmacTestSigner {
    secret: Vec<u8>,
    public_key_id: String,
}

impl HmacTestSigner {
    pub fn new(secret: &str, public_key_id: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            public_key_id: public_key_id.to_string(),
        }
    }
}

impl Signer for HmacTestSigner {
    fn algorithm(&self) -> &'static str {
        ALGO_HMAC_TEST
    }

    fn public_key_id(&self) -> &str {
        &self.public_key_id
    }

    fn sign(&self, payload_sha256: &str) -> Result<String, EnvelopeError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| EnvelopeError::SigningConfigMissing("empty hmac secret".into()))?;
        mac.update(payload_sha256.as_bytes());
        Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    fn verify(&self, payload_sha256: &str, signature_b64: &str) -> bool {
        let Ok(expected) = self.sign(payload_sha256) else {
            return false;
        };
        // Constant-time compare over the decoded MACs.
        let engine = &base64::engine::general_purpose::STANDARD;
        match (engine.decode(expected), engine.decode(signature_b64)) {
            (Ok(a), Ok(b)) if a.len() == b.len() => {
                a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
            }
            _ => false,
        }
    }

    fn verify_available(&self) -> Result<(), EnvelopeError> {
        Ok(())
    }
}

/// ed25519 signer delegating to `ssh-keygen` with a per-stream namespace.
pub struct SshKeygenSigner {
    key_path: PathBuf,
    allowed_signers: PathBuf,
    public_key_id: String,
    namespace: String,
}

impl SshKeygenSigner {
    pub fn new(
        key_path: PathBuf,
        allowed_signers: PathBuf,
        public_key_id: &str,
        namespace: &str,
    ) -> Self {
        Self {
            key_path,
            allowed_signers,
            public_key_id: public_key_id.to_string(),
            namespace: namespace.to_string(),
        }
    }
}

impl Signer for SshKeygenSigner {
    fn algorithm(&self) -> &'static str {
        ALGO_ED25519
    }

    fn public_key_id(&self) -> &str {
        &self.public_key_id
    }

    fn sign(&self, payload_sha256: &str) -> Result<String, EnvelopeError> {
        let workdir = tempfile::Builder::new()
            .prefix("sentientos-sign-")
            .tempdir()
            .map_err(|err| EnvelopeError::SshSignFailed(err.to_string()))?;
        let msg_path = workdir.path().join("payload.txt");
        std::fs::write(&msg_path, format!("{payload_sha256}\n"))
            .map_err(|err| EnvelopeError::SshSignFailed(err.to_string()))?;
        let output = Command::new("ssh-keygen")
            .args(["-Y", "sign", "-n", &self.namespace, "-f"])
            .arg(&self.key_path)
            .arg(&msg_path)
            .output()
            .map_err(|err| EnvelopeError::SshSignFailed(err.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(EnvelopeError::SshSignFailed(stderr));
        }
        let sig_bytes = std::fs::read(workdir.path().join("payload.txt.sig"))
            .map_err(|err| EnvelopeError::SshSignFailed(err.to_string()))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(sig_bytes))
    }

    fn verify(&self, payload_sha256: &str, signature_b64: &str) -> bool {
        let Ok(raw_sig) = base64::engine::general_purpose::STANDARD.decode(signature_b64) else {
            return false;
        };
        let Ok(workdir) = tempfile::Builder::new()
            .prefix("sentientos-verify-")
            .tempdir()
        else {
            return false;
        };
        let sig_path = workdir.path().join("payload.sig");
        if std::fs::write(&sig_path, raw_sig).is_err() {
            return false;
        }
        let child = Command::new("ssh-keygen")
            .args(["-Y", "verify", "-f"])
            .arg(&self.allowed_signers)
            .args(["-I", &self.public_key_id, "-n", &self.namespace, "-s"])
            .arg(&sig_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let Ok(mut child) = child else {
            return false;
        };
        if let Some(stdin) = child.stdin.as_mut() {
            if stdin
                .write_all(format!("{payload_sha256}\n").as_bytes())
                .is_err()
            {
                return false;
            }
        }
        child.wait().map(|status| status.success()).unwrap_or(false)
    }

    fn verify_available(&self) -> Result<(), EnvelopeError> {
        let probe = Command::new("ssh-keygen")
            .arg("-?")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match probe {
            Ok(_) => Ok(()),
            Err(err) => Err(EnvelopeError::SshSignFailed(format!(
                "ssh-keygen unavailable: {err}"
            ))),
        }
    }
}

/// Resolved signer configuration for one stream. Cloneable so it can live in
/// the process-wide cache; the trait object is constructed on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerConfig {
    Off,
    HmacTest {
        secret: String,
        public_key_id: String,
    },
    Ssh {
        key_path: PathBuf,
        allowed_signers: PathBuf,
        public_key_id: String,
    },
}

impl SignerConfig {
    /// Resolve a stream's signer from the environment snapshot.
    pub fn resolve(env: &Env, stream: Stream) -> Result<Self, EnvelopeError> {
        let prefix = stream.env_prefix();
        let mode = env.str_or(&format!("{prefix}_SIGNING"), "off");
        match mode {
            "off" | "disabled" | "none" => Ok(SignerConfig::Off),
            "hmac-test" => {
                let secret = env
                    .str_or(&format!("{prefix}_HMAC_SECRET"), "")
                    .to_string();
                if secret.is_empty() {
                    return Err(EnvelopeError::SigningConfigMissing(format!(
                        "{prefix}_HMAC_SECRET signing_key_missing"
                    )));
                }
                let public_key_id = env
                    .str_or(&format!("{prefix}_PUBLIC_KEY_ID"), stream.default_key_id())
                    .to_string();
                Ok(SignerConfig::HmacTest {
                    secret,
                    public_key_id,
                })
            }
            "ssh" => {
                let key = env.str_or(&format!("{prefix}_SSH_KEY"), "");
                let allowed = env.str_or(&format!("{prefix}_ALLOWED_SIGNERS"), "");
                if key.is_empty() || allowed.is_empty() {
                    return Err(EnvelopeError::SigningConfigMissing(format!(
                        "{prefix} ssh signing_key_missing"
                    )));
                }
                let public_key_id = env
                    .str_or(&format!("{prefix}_PUBLIC_KEY_ID"), stream.default_key_id())
                    .to_string();
                Ok(SignerConfig::Ssh {
                    key_path: PathBuf::from(key),
                    allowed_signers: PathBuf::from(allowed),
                    public_key_id,
                })
            }
            other => Err(EnvelopeError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    /// Instantiate the signer, or `None` when signing is off.
    pub fn build(&self, stream: Stream) -> Option<Box<dyn Signer>> {
        match self {
            SignerConfig::Off => None,
            SignerConfig::HmacTest {
                secret,
                public_key_id,
            } => Some(Box::new(HmacTestSigner::new(secret, public_key_id))),
            SignerConfig::Ssh {
                key_path,
                allowed_signers,
                public_key_id,
            } => Some(Box::new(SshKeygenSigner::new(
                key_path.clone(),
                allowed_signers.clone(),
                public_key_id,
                stream.namespace(),
            ))),
        }
    }
}

fn key_cache() -> &'static Mutex<HashMap<String, SignerConfig>> {
    static CACHE: OnceLock<Mutex<HashMap<String, SignerConfig>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Resolve a stream's signer through the process-wide cache.
///
/// The cache key covers every environment input the resolution reads, so a
/// stale entry can never shadow a changed configuration; `reset_key_cache`
/// still drops loaded key material for tests.
pub fn cached_signer_config(env: &Env, stream: Stream) -> Result<SignerConfig, EnvelopeError> {
    let prefix = stream.env_prefix();
    let cache_key = format!(
        "{prefix}|{}|{}|{}|{}|{}",
        env.str_or(&format!("{prefix}_SIGNING"), "off"),
        env.str_or(&format!("{prefix}_HMAC_SECRET"), ""),
        env.str_or(&format!("{prefix}_SSH_KEY"), ""),
        env.str_or(&format!("{prefix}_ALLOWED_SIGNERS"), ""),
        env.str_or(&format!("{prefix}_PUBLIC_KEY_ID"), ""),
    );
    if let Some(found) = key_cache().lock().expect("key cache poisoned").get(&cache_key) {
        return Ok(found.clone());
    }
    let resolved = SignerConfig::resolve(env, stream)?;
    key_cache()
        .lock()
        .expect("key cache poisoned")
        .insert(cache_key, resolved.clone());
    Ok(resolved)
}

/// Drop all cached signer configurations. Test seam.
pub fn reset_key_cache() {
    key_cache().lock().expect("key cache poisoned").clear();
}
