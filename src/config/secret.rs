// ABOUTME: Where the gateway's shared secret comes from: inline, an environment variable, or a file.
// ABOUTME: Resolved once at startup; an empty secret is rejected rather than accepting every credential.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Config form of a secret.
///
/// ```yaml
/// secret: s3cret                          # inline
/// secret: {env: IMAGEGW_SECRET}           # environment variable
/// secret: {file: /etc/imagegw/secret}     # file, trailing newline stripped
/// ```
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SecretSource {
    Inline(String),
    Env { env: String },
    File { file: PathBuf },
}

impl std::fmt::Debug for SecretSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretSource::Inline(_) => f.write_str("Inline(<redacted>)"),
            SecretSource::Env { env } => f.debug_struct("Env").field("env", env).finish(),
            SecretSource::File { file } => f.debug_struct("File").field("file", file).finish(),
        }
    }
}

impl SecretSource {
    pub fn resolve(&self) -> Result<String> {
        let (secret, origin) = match self {
            SecretSource::Inline(secret) => (secret.clone(), "inline secret".to_string()),
            SecretSource::Env { env } => {
                let secret = std::env::var(env).map_err(|_| Error::MissingEnvVar(env.clone()))?;
                (secret, format!("environment variable {}", env))
            }
            SecretSource::File { file } => {
                let contents = std::fs::read_to_string(file).map_err(|source| Error::SecretFile {
                    path: file.clone(),
                    source,
                })?;
                (
                    contents.trim_end_matches(['\r', '\n']).to_string(),
                    format!("secret file {}", file.display()),
                )
            }
        };

        if secret.is_empty() {
            return Err(Error::InvalidConfig(format!("{} is empty", origin)));
        }
        Ok(secret)
    }
}
