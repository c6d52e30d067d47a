//! Credential capability discovery: the "analyzer" external collaborator
//! (spec §6). Standalone — the Source Manager never calls into this module;
//! it exists for sources that want to probe a credential's scopes before
//! enrolling.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use sourcescan_core::ScanError;

/// The four token shapes a credential can present as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Classic,
    FineGrained,
    UserToServer,
    Other,
}

/// Raw introspection result for an opaque token, before scope expansion.
#[derive(Debug, Clone)]
pub struct TokenIntrospection {
    pub token_type: TokenType,
    pub fine_grained: bool,
    pub user: String,
    pub expiration: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
}

/// The fully expanded capability report for a credential.
#[derive(Debug, Clone)]
pub struct CapabilityReport {
    pub token_type: TokenType,
    pub fine_grained: bool,
    pub user: String,
    pub expiration: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
}

/// Per-scope access classification from a read/write probe pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    NoAccess,
    ReadOnly,
    ReadWrite,
}

/// Client surface an analyzer run is driven through: one call to introspect
/// the token, and one call per probe. A probe that mutates must be given a
/// payload crafted to fail validation, so the classification never performs
/// a real mutation.
#[async_trait]
pub trait CredentialClient: Send + Sync {
    async fn introspect(&self, token: &str) -> Result<TokenIntrospection, ScanError>;

    /// Issues a request that would mutate `scope` if it succeeded, using a
    /// payload the caller has deliberately made invalid. Returns the raw
    /// HTTP status code.
    async fn probe_write(&self, token: &str, scope: &str) -> Result<u16, ScanError>;

    /// Issues a harmless read against `scope`. Returns the raw HTTP status
    /// code.
    async fn probe_read(&self, token: &str, scope: &str) -> Result<u16, ScanError>;
}

/// Parent→children scope hierarchy, e.g. an umbrella grant implying its
/// read/write children.
#[derive(Debug, Clone, Default)]
pub struct ScopeHierarchy {
    children: HashMap<String, Vec<String>>,
}

impl ScopeHierarchy {
    pub fn new() -> Self {
        Self { children: HashMap::new() }
    }

    pub fn with_children(mut self, parent: impl Into<String>, children: impl IntoIterator<Item = String>) -> Self {
        self.children.insert(parent.into(), children.into_iter().collect());
        self
    }

    /// Expands `granted` into its full transitive closure under this
    /// hierarchy. The input scopes are always included in the result.
    pub fn expand(&self, granted: &[String]) -> Vec<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut stack: Vec<String> = granted.to_vec();
        while let Some(scope) = stack.pop() {
            if seen.insert(scope.clone()) {
                if let Some(children) = self.children.get(&scope) {
                    stack.extend(children.iter().cloned());
                }
            }
        }
        let mut expanded: Vec<String> = seen.into_iter().collect();
        expanded.sort();
        expanded
    }
}

/// Classifies access to one scope from a write-probe and read-probe status
/// code pair, per the rules in spec §6:
///
/// - `403` on the write probe alone → no access, unless the read probe
///   succeeds, in which case it's read-only.
/// - `422` or `404` on the write probe (with its deliberately invalid
///   payload) → read-write: the request reached write handling and was
///   rejected only for its payload, not for authorization.
/// - `403` on write with `200` on read → read-only.
pub fn classify_access(write_status: u16, read_status: u16) -> AccessLevel {
    match write_status {
        422 | 404 => AccessLevel::ReadWrite,
        403 if read_status == 200 => AccessLevel::ReadOnly,
        403 => AccessLevel::NoAccess,
        _ => AccessLevel::NoAccess,
    }
}

/// A `CredentialClient` for GitHub-shaped APIs: introspection reads the
/// `X-OAuth-Scopes`/`X-GitHub-Media-Type` style headers off a cheap
/// authenticated call, and probes issue a real request against `base_url`
/// with the given scope as the path.
pub struct GithubCredentialClient {
    http: reqwest::Client,
    base_url: String,
}

impl GithubCredentialClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), base_url: base_url.into() }
    }
}

#[async_trait]
impl CredentialClient for GithubCredentialClient {
    async fn introspect(&self, token: &str) -> Result<TokenIntrospection, ScanError> {
        let response = self
            .http
            .get(format!("{}/user", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ScanError::fatal(format!("credential introspection request failed: {e}")))?;

        let user = response
            .headers()
            .get("x-oauth-client-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();
        let scopes: Vec<String> = response
            .headers()
            .get("x-oauth-scopes")
            .and_then(|v| v.to_str().ok())
            .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        let fine_grained = response.headers().contains_key("x-github-media-type") && scopes.is_empty();
        let token_type = if token.starts_with("github_pat_") {
            TokenType::FineGrained
        } else if token.starts_with("ghu_") {
            TokenType::UserToServer
        } else if token.starts_with("ghp_") {
            TokenType::Classic
        } else {
            TokenType::Other
        };

        Ok(TokenIntrospection { token_type, fine_grained, user, expiration: None, scopes })
    }

    async fn probe_write(&self, token: &str, scope: &str) -> Result<u16, ScanError> {
        let response = self
            .http
            .patch(format!("{}/{}", self.base_url, scope))
            .bearer_auth(token)
            .json(&serde_json::json!({ "__capability_probe__": serde_json::Value::Null }))
            .send()
            .await
            .map_err(|e| ScanError::fatal(format!("write probe request failed: {e}")))?;
        Ok(response.status().as_u16())
    }

    async fn probe_read(&self, token: &str, scope: &str) -> Result<u16, ScanError> {
        let response = self
            .http
            .get(format!("{}/{}", self.base_url, scope))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ScanError::fatal(format!("read probe request failed: {e}")))?;
        Ok(response.status().as_u16())
    }
}

/// Runs the full capability discovery: introspects the token, expands its
/// granted scopes against `hierarchy`, and returns the combined report.
/// Per-scope access classification is a separate call (`classify_access`)
/// since it requires issuing probes the caller must scope and pay for.
pub async fn discover_capability(
    client: &dyn CredentialClient,
    hierarchy: &ScopeHierarchy,
    token: &str,
) -> Result<CapabilityReport, ScanError> {
    let introspection = client.introspect(token).await?;
    let scopes = hierarchy.expand(&introspection.scopes);
    Ok(CapabilityReport {
        token_type: introspection.token_type,
        fine_grained: introspection.fine_grained,
        user: introspection.user,
        expiration: introspection.expiration,
        scopes,
    })
}
