//! Strategic decision signature stream.

use std::path::{Path, PathBuf};

use serde_json::Value;

use sos_config::Env;
use sos_envelope::{maybe_sign, verify_stream, ObjectRef, Stream, StreamPaths, VerifyResult};

use crate::CoreError;

pub fn strategic_stream_paths() -> StreamPaths {
    StreamPaths::new(PathBuf::from("glow/forge/attestation/signatures/strategic"))
}

/// Sign a strategic decision artifact when signing is configured.
pub fn maybe_sign_strategic(
    root: &Path,
    env: &Env,
    object_id: &str,
    created_at: &str,
    rel_path: &str,
    payload: &Value,
) -> Result<Option<Value>, CoreError> {
    Ok(maybe_sign(
        root,
        env,
        Stream::Strategic,
        &strategic_stream_paths(),
        &ObjectRef {
            object_id,
            created_at,
            rel_path,
            payload,
        },
    )?)
}

/// Verify the newest strategic envelopes.
pub fn verify_recent_strategic(
    root: &Path,
    env: &Env,
    last: usize,
) -> Result<VerifyResult, CoreError> {
    let enforce = env.flag("SENTIENTOS_STRATEGIC_SIG_ENFORCE");
    Ok(verify_stream(
        root,
        env,
        Stream::Strategic,
        &strategic_stream_paths(),
        last.max(1),
        enforce,
    )?)
}
