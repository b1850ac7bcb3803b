//! Connect-time authentication: signed JWTs carrying an [`RpcContext`],
//! per-session auth tokens, and the one-shot swap-token table used by shell
//! startup.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::frame::RpcContext;

/// Swap-token entries live this long before the table forgets them.
const SWAP_TOKEN_TTL: Duration = Duration::from_secs(60);

const JWT_EXPIRY_SECS: i64 = 60 * 60 * 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    exp: i64,
    iat: i64,
    #[serde(flatten)]
    ctx: RpcContext,
}

/// Signs and verifies the connect tokens handed to launched processes.
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenSigner {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    pub fn make_token(&self, ctx: &RpcContext) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            exp: now + JWT_EXPIRY_SECS,
            iat: now,
            ctx: ctx.clone(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .context("signing rpc token")
    }

    pub fn verify_token(&self, token: &str) -> Result<RpcContext> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        let data = decode::<Claims>(token, &self.decoding, &validation)
            .context("invalid rpc token")?;
        Ok(data.claims.ctx)
    }
}

/// Random per-session auth token attached to every frame after authenticate.
pub fn make_auth_token() -> String {
    let bytes: [u8; 16] = rand::thread_rng().r#gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// What a shell receives when it redeems its swap token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenSwapEntry {
    #[serde(skip)]
    pub token: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(rename = "initscripttext", default)]
    pub script_text: String,
    #[serde(rename = "rpccontext", default)]
    pub rpc_context: RpcContext,
    #[serde(skip)]
    pub expires: Option<Instant>,
}

/// Short-TTL table of one-shot swap tokens. Each entry is removed on first
/// use; expired entries are swept on every insert.
#[derive(Default)]
pub struct SwapTokenTable {
    entries: DashMap<String, TokenSwapEntry>,
}

impl SwapTokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a fresh one-shot token for the given context.
    pub fn issue(&self, rpc_context: RpcContext, env: HashMap<String, String>, script_text: String) -> String {
        self.sweep();
        let token = make_auth_token();
        let entry = TokenSwapEntry {
            token: token.clone(),
            env,
            script_text,
            rpc_context,
            expires: Some(Instant::now() + SWAP_TOKEN_TTL),
        };
        self.entries.insert(token.clone(), entry);
        token
    }

    /// Redeem a token, removing it from the table.
    pub fn take(&self, token: &str) -> Result<TokenSwapEntry> {
        self.sweep();
        match self.entries.remove(token) {
            Some((_, entry)) => Ok(entry),
            None => bail!("invalid token"),
        }
    }

    fn sweep(&self) {
        let now = Instant::now();
        self.entries
            .retain(|_, entry| entry.expires.map_or(true, |exp| exp > now));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jwt_roundtrip() {
        let signer = TokenSigner::new(b"test-secret");
        let ctx = RpcContext {
            conn: "user@host".into(),
            block_id: "b1".into(),
        };
        let token = signer.make_token(&ctx).unwrap();
        let back = signer.verify_token(&token).unwrap();
        assert_eq!(back, ctx);
    }

    #[test]
    fn test_jwt_rejects_wrong_secret() {
        let signer = TokenSigner::new(b"secret-a");
        let other = TokenSigner::new(b"secret-b");
        let token = signer.make_token(&RpcContext::default()).unwrap();
        assert!(other.verify_token(&token).is_err());
    }

    #[test]
    fn test_swap_token_is_one_shot() {
        let table = SwapTokenTable::new();
        let token = table.issue(
            RpcContext {
                block_id: "b1".into(),
                ..Default::default()
            },
            HashMap::from([("TERM".to_string(), "xterm-256color".to_string())]),
            "echo hi".into(),
        );
        let entry = table.take(&token).unwrap();
        assert_eq!(entry.rpc_context.block_id, "b1");
        assert_eq!(entry.script_text, "echo hi");
        assert!(table.take(&token).is_err());
    }

    #[test]
    fn test_auth_token_is_unique() {
        assert_ne!(make_auth_token(), make_auth_token());
        assert_eq!(make_auth_token().len(), 32);
    }
}
