use anyhow::Context as _;
use jsonwebtoken::Algorithm;
use serde::Deserialize;
use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::auth::{AuthClaims, KeyRegistry, ParserOptions, StaticApiKeys, TokenCodec};
use crate::multipart::{DEFAULT_MAX_FIELD_SIZE, DEFAULT_MAX_FILE_SIZE, MultipartDecoder};
use crate::transport::DEFAULT_API_KEY_HEADER;

pub const CONFIG_ENV: &str = "GATEKIT_CONFIG";

/// Settings for the key registry, token codec, API keys and decoder limits.
///
/// Key material and API keys may reference the environment as `${VAR}`.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct GatekitConfig {
    /// Signing secrets, addressed by position.
    pub keys: Vec<String>,
    /// Indices that still verify but are never used for new tokens.
    pub retired_keys: Vec<usize>,
    pub algorithm: String,
    pub audience: Option<String>,
    pub issuer: Option<String>,
    pub leeway_seconds: u64,
    pub token_ttl_seconds: u64,
    pub api_key_header: String,
    pub api_keys: Vec<ApiKeyConfig>,
    pub max_field_size: u64,
    pub max_file_size: u64,
}

/// A plain API key and the identity it authenticates as.
#[derive(Clone, Deserialize)]
pub struct ApiKeyConfig {
    pub key: String,
    pub subject: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub admin: bool,
}

impl Default for GatekitConfig {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            retired_keys: Vec::new(),
            algorithm: "HS256".to_string(),
            audience: None,
            issuer: None,
            leeway_seconds: 0,
            token_ttl_seconds: 3600,
            api_key_header: DEFAULT_API_KEY_HEADER.to_string(),
            api_keys: Vec::new(),
            max_field_size: DEFAULT_MAX_FIELD_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl fmt::Debug for GatekitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatekitConfig")
            .field("keys", &format_args!("[{} redacted]", self.keys.len()))
            .field("retired_keys", &self.retired_keys)
            .field("algorithm", &self.algorithm)
            .field("audience", &self.audience)
            .field("issuer", &self.issuer)
            .field("leeway_seconds", &self.leeway_seconds)
            .field("token_ttl_seconds", &self.token_ttl_seconds)
            .field("api_key_header", &self.api_key_header)
            .field("api_keys", &format_args!("[{} redacted]", self.api_keys.len()))
            .field("max_field_size", &self.max_field_size)
            .field("max_file_size", &self.max_file_size)
            .finish()
    }
}

impl fmt::Debug for ApiKeyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyConfig")
            .field("subject", &self.subject)
            .field("username", &self.username)
            .field("admin", &self.admin)
            .finish_non_exhaustive()
    }
}

impl GatekitConfig {
    /// Load from the resolved config path.
    pub fn load() -> anyhow::Result<Self> {
        let path = resolve_config_path()?;
        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Parse JSON and expand `${VAR}` references.
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let cfg: Self = serde_json::from_str(raw)?;
        Ok(cfg.expanded())
    }

    fn expanded(mut self) -> Self {
        for key in self.keys.iter_mut() {
            *key = expand_env_vars(key);
        }
        for entry in self.api_keys.iter_mut() {
            entry.key = expand_env_vars(&entry.key);
        }
        if let Some(audience) = self.audience.as_mut() {
            *audience = expand_env_vars(audience);
        }
        if let Some(issuer) = self.issuer.as_mut() {
            *issuer = expand_env_vars(issuer);
        }
        self
    }

    /// Registry with every configured key, the retired ones already retired.
    pub fn key_registry(&self) -> anyhow::Result<KeyRegistry> {
        let mut registry = KeyRegistry::new(self.keys.iter().map(String::as_str));
        for &index in &self.retired_keys {
            registry = registry
                .retire(index)
                .with_context(|| format!("cannot retire key {index}"))?;
        }
        Ok(registry)
    }

    pub fn algorithm(&self) -> anyhow::Result<Algorithm> {
        Algorithm::from_str(&self.algorithm)
            .map_err(|_| anyhow::anyhow!("unknown algorithm `{}`", self.algorithm))
    }

    pub fn parser_options(&self) -> ParserOptions {
        let mut options = ParserOptions::default().with_leeway(self.leeway_seconds);
        if let Some(audience) = &self.audience {
            options = options.with_audience(audience.clone());
        }
        if let Some(issuer) = &self.issuer {
            options = options.with_issuer(issuer.clone());
        }
        options
    }

    pub fn token_codec(&self) -> anyhow::Result<TokenCodec> {
        let codec = TokenCodec::new()
            .with_algorithm(self.algorithm()?)?
            .with_options(self.parser_options());
        Ok(codec)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_seconds)
    }

    /// Claims for a freshly issued token, with the configured audience,
    /// issuer and lifetime applied.
    pub fn issue_claims(&self, subject: &str) -> AuthClaims {
        let mut claims = AuthClaims::new(subject).with_expiry(self.token_ttl());
        if let Some(audience) = &self.audience {
            claims = claims.with_audience(audience.clone());
        }
        if let Some(issuer) = &self.issuer {
            claims = claims.with_issuer(issuer.clone());
        }
        claims
    }

    /// Validator over the configured API keys. Only the key hashes are kept.
    pub fn api_key_validator(&self) -> StaticApiKeys<AuthClaims> {
        self.api_keys
            .iter()
            .fold(StaticApiKeys::new(), |keys, entry| {
                let claims = AuthClaims::new(entry.subject.clone())
                    .with_username(entry.username.clone())
                    .with_admin(entry.admin);
                keys.with_key(&entry.key, claims)
            })
    }

    pub fn multipart_decoder(&self) -> MultipartDecoder {
        MultipartDecoder::new()
            .with_max_field_size(self.max_field_size)
            .with_max_file_size(self.max_file_size)
    }
}

/// `$GATEKIT_CONFIG`, then `$XDG_CONFIG_HOME/gatekit/config.json`, then
/// `./gatekit.json`.
pub fn resolve_config_path() -> anyhow::Result<PathBuf> {
    resolve_from(
        env::var(CONFIG_ENV).ok(),
        env::var("XDG_CONFIG_HOME").ok(),
        Path::new("."),
    )
}

fn resolve_from(
    explicit: Option<String>,
    xdg: Option<String>,
    cwd: &Path,
) -> anyhow::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(PathBuf::from(p));
    }

    if let Some(xdg) = xdg {
        let candidate = PathBuf::from(xdg).join("gatekit").join("config.json");
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let candidate = cwd.join("gatekit.json");
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(anyhow::anyhow!(
        "Could not find gatekit config (set {CONFIG_ENV} or create ./gatekit.json)"
    ))
}

/// Replace `${VAR}` with the variable's value. Unset variables are left as
/// written.
pub fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' || chars.peek() != Some(&'{') {
            out.push(ch);
            continue;
        }
        chars.next();

        let name: String = chars.by_ref().take_while(|&c| c != '}').collect();
        match env::var(&name) {
            Ok(val) => out.push_str(&val),
            Err(_) => {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        }
    }

    out
}
