//! Legacy tokens: issuance and atomic redemption.
//!
//! A token secret is 32 random bytes rendered as `hlt_<64 hex>`. Only
//! `HMAC-SHA256(salt, secret)` is stored, keyed by a deployment-wide salt, so
//! a leaked database alone cannot be used to forge or recognise tokens while
//! lookups stay a single indexed equality match.
//!
//! Redemption is a compare-and-increment on `redemption_count` inside an
//! immediate transaction: two redeemers racing for the last slot are
//! serialised and the loser observes the token as exhausted.

use crate::error::retry_on_conflict;
use crate::vaults::owned;
use crate::{EngineConfig, EngineError, EngineResult, SharedClock};
use heirloom_core::{
    new_id, AccessGrant, ItemScope, LegacyToken, ReleaseCause, Timestamp, TokenSummary,
};
use heirloom_store::{capsules, tokens, vaults, Store};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

const PREFIX: &str = "hlt_";
const SECRET_LEN: usize = 32;

/// Optional limits chosen by the owner at issue time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenTerms {
    pub max_redemptions: Option<u32>,
    pub expires_at: Option<Timestamp>,
    pub holder: Option<String>,
}

/// A freshly issued token. The plaintext is shown exactly once.
#[derive(Debug)]
pub struct IssuedToken {
    pub token: Zeroizing<String>,
    pub summary: TokenSummary,
}

pub struct LegacyTokenService {
    store: Store,
    clock: SharedClock,
    mac: HmacSha256,
    grant_ttl_secs: i64,
}

impl LegacyTokenService {
    pub fn new(store: Store, clock: SharedClock, config: &EngineConfig) -> EngineResult<Self> {
        if config.token_salt.is_empty() {
            return Err(EngineError::InvalidRequest("token salt is empty".into()));
        }
        let mac = HmacSha256::new_from_slice(config.token_salt.as_bytes())
            .map_err(|e| EngineError::InvalidRequest(format!("token salt: {}", e)))?;
        Ok(Self {
            store,
            clock,
            mac,
            grant_ttl_secs: config.grant_ttl_secs,
        })
    }

    fn hash(&self, secret: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(secret.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Issue a token for `vault_id`. Only the owner may issue.
    pub fn issue(
        &mut self,
        vault_id: &str,
        owner_user_id: &str,
        terms: TokenTerms,
    ) -> EngineResult<IssuedToken> {
        if terms.max_redemptions == Some(0) {
            return Err(EngineError::InvalidRequest(
                "max redemptions must be at least 1".into(),
            ));
        }
        let now = self.clock.now();
        owned(self.store.conn(), vault_id, owner_user_id)?;

        let mut bytes = Zeroizing::new([0u8; SECRET_LEN]);
        rand::rngs::OsRng.fill_bytes(&mut bytes[..]);
        let token = Zeroizing::new(format!("{}{}", PREFIX, hex::encode(&bytes[..])));

        let record = LegacyToken {
            id: new_id(),
            secret_hash: self.hash(&token),
            owner_user_id: owner_user_id.to_string(),
            vault_id: vault_id.to_string(),
            holder: terms.holder,
            max_redemptions: terms.max_redemptions,
            redemption_count: 0,
            expires_at: terms.expires_at,
            created_at: now,
        };
        tokens::insert(self.store.conn(), &record)?;
        log::info!("Legacy token {} issued for vault {}", record.id, vault_id);

        Ok(IssuedToken {
            token,
            summary: TokenSummary::from(&record),
        })
    }

    /// Redeem a presented token, consuming one use.
    pub fn redeem(&mut self, presented: &str) -> EngineResult<AccessGrant> {
        if !looks_like_token(presented) {
            return Err(EngineError::TokenNotFound);
        }
        let now = self.clock.now();
        let hash = self.hash(presented);
        let ttl = self.grant_ttl_secs;
        let store = &mut self.store;

        retry_on_conflict("redeem", || {
            let tx = store.immediate()?;
            let token = tokens::get_by_hash(&tx, &hash)?.ok_or(EngineError::TokenNotFound)?;
            if token.is_expired(now) {
                return Err(EngineError::TokenExpired.into());
            }
            if token.is_exhausted() {
                return Err(EngineError::TokenExhausted.into());
            }
            let vault = vaults::get(&tx, &token.vault_id)?
                .ok_or_else(|| EngineError::VaultNotFound(token.vault_id.clone()))?;
            if !vault.is_released() {
                return Err(EngineError::VaultNotReleased(vault.id).into());
            }

            tokens::increment_if_count(&tx, &token.id, token.redemption_count)?;
            let item_scope = match vault.release_cause {
                Some(ReleaseCause::TimeCapsule) => {
                    capsules::triggered_scope(&tx, &vault.id)?.unwrap_or(ItemScope::All)
                }
                _ => ItemScope::All,
            };
            tx.commit()?;

            log::info!(
                "Legacy token {} redeemed ({} of {})",
                token.id,
                token.redemption_count + 1,
                token
                    .max_redemptions
                    .map_or_else(|| "unlimited".to_string(), |m| m.to_string())
            );
            Ok(AccessGrant {
                grant_id: new_id(),
                token_id: token.id,
                vault_id: vault.id,
                item_scope,
                issued_at: now,
                expires_at: now.saturating_add(ttl),
            })
        })
    }

    /// Metadata of every token on a vault, for its owner.
    pub fn list(&self, vault_id: &str, owner_user_id: &str) -> EngineResult<Vec<TokenSummary>> {
        owned(self.store.conn(), vault_id, owner_user_id)?;
        Ok(tokens::list_for_vault(self.store.conn(), vault_id)?
            .iter()
            .map(TokenSummary::from)
            .collect())
    }
}

fn looks_like_token(s: &str) -> bool {
    s.strip_prefix(PREFIX).is_some_and(|hex| {
        hex.len() == SECRET_LEN * 2 && hex.bytes().all(|b| b.is_ascii_hexdigit())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{open, setup, DAY, T0};
    use crate::{ReleaseSweeper, TimeCapsuleIndex, VaultRegistry};
    use heirloom_core::ManualClock;
    use std::sync::Arc;

    struct Fixture {
        file: tempfile::NamedTempFile,
        clock: ManualClock,
        tokens: LegacyTokenService,
        vault_id: String,
    }

    fn fixture() -> Fixture {
        let (file, clock) = setup();
        let mut registry = VaultRegistry::new(open(&file), Arc::new(clock.clone()));
        let vault = registry.create("alice", DAY, DAY).unwrap();
        let tokens =
            LegacyTokenService::new(open(&file), Arc::new(clock.clone()), &EngineConfig::default())
                .unwrap();
        Fixture {
            file,
            clock,
            tokens,
            vault_id: vault.id,
        }
    }

    fn release(f: &Fixture) {
        f.clock.set(T0 + DAY);
        let mut sweeper =
            ReleaseSweeper::new(open(&f.file), Arc::new(f.clock.clone()), &EngineConfig::default());
        sweeper.run_once().unwrap();
        f.clock.set(T0 + 2 * DAY);
        sweeper.run_once().unwrap();
    }

    #[test]
    fn test_issue_stores_only_hash() {
        let mut f = fixture();
        let issued = f
            .tokens
            .issue(&f.vault_id, "alice", TokenTerms::default())
            .unwrap();
        assert!(looks_like_token(&issued.token));

        let listed = f.tokens.list(&f.vault_id, "alice").unwrap();
        assert_eq!(listed, vec![issued.summary.clone()]);

        let stored = tokens::list_for_vault(f.tokens.store.conn(), &f.vault_id).unwrap();
        assert_ne!(stored[0].secret_hash, *issued.token);
        assert_eq!(stored[0].secret_hash.len(), 64);
    }

    #[test]
    fn test_issue_validation() {
        let mut f = fixture();
        let zero = TokenTerms {
            max_redemptions: Some(0),
            ..TokenTerms::default()
        };
        assert!(matches!(
            f.tokens.issue(&f.vault_id, "alice", zero),
            Err(EngineError::InvalidRequest(_))
        ));
        assert!(matches!(
            f.tokens.issue(&f.vault_id, "bob", TokenTerms::default()),
            Err(EngineError::NotOwner(_))
        ));
        assert!(matches!(
            f.tokens.issue("ghost", "alice", TokenTerms::default()),
            Err(EngineError::VaultNotFound(_))
        ));
    }

    #[test]
    fn test_redeem_before_release_is_refused() {
        let mut f = fixture();
        let issued = f
            .tokens
            .issue(&f.vault_id, "alice", TokenTerms::default())
            .unwrap();
        assert!(matches!(
            f.tokens.redeem(&issued.token),
            Err(EngineError::VaultNotReleased(_))
        ));
    }

    #[test]
    fn test_redeem_lifecycle() {
        let mut f = fixture();
        let issued = f
            .tokens
            .issue(
                &f.vault_id,
                "alice",
                TokenTerms {
                    max_redemptions: Some(1),
                    ..TokenTerms::default()
                },
            )
            .unwrap();
        release(&f);

        let grant = f.tokens.redeem(&issued.token).unwrap();
        assert_eq!(grant.vault_id, f.vault_id);
        assert_eq!(grant.item_scope, ItemScope::All);
        assert_eq!(grant.expires_at, grant.issued_at + 3600);

        assert!(matches!(
            f.tokens.redeem(&issued.token),
            Err(EngineError::TokenExhausted)
        ));
        assert!(matches!(
            f.tokens.redeem("hlt_nothex"),
            Err(EngineError::TokenNotFound)
        ));
        let unknown = format!("hlt_{}", "ab".repeat(32));
        assert!(matches!(
            f.tokens.redeem(&unknown),
            Err(EngineError::TokenNotFound)
        ));
    }

    #[test]
    fn test_expired_token() {
        let mut f = fixture();
        let issued = f
            .tokens
            .issue(
                &f.vault_id,
                "alice",
                TokenTerms {
                    expires_at: Some(T0 + DAY),
                    ..TokenTerms::default()
                },
            )
            .unwrap();
        release(&f);
        assert!(matches!(
            f.tokens.redeem(&issued.token),
            Err(EngineError::TokenExpired)
        ));
    }

    #[test]
    fn test_capsule_release_scopes_grant() {
        let mut f = fixture();
        let mut index = TimeCapsuleIndex::new(open(&f.file), Arc::new(f.clock.clone()));
        index
            .schedule(
                &f.vault_id,
                "alice",
                T0 + 60,
                ItemScope::Items(vec!["letter".into()]),
            )
            .unwrap();
        let issued = f
            .tokens
            .issue(&f.vault_id, "alice", TokenTerms::default())
            .unwrap();

        f.clock.set(T0 + 60);
        ReleaseSweeper::new(open(&f.file), Arc::new(f.clock.clone()), &EngineConfig::default())
            .run_once()
            .unwrap();

        let grant = f.tokens.redeem(&issued.token).unwrap();
        assert_eq!(grant.item_scope, ItemScope::Items(vec!["letter".into()]));
    }

    #[test]
    fn test_salt_changes_hash() {
        let (file, clock) = setup();
        let a = LegacyTokenService::new(open(&file), Arc::new(clock.clone()), &EngineConfig::default())
            .unwrap();
        let b = LegacyTokenService::new(
            open(&file),
            Arc::new(clock),
            &EngineConfig {
                token_salt: "other".into(),
                ..EngineConfig::default()
            },
        )
        .unwrap();
        assert_ne!(a.hash("hlt_x"), b.hash("hlt_x"));
        assert_eq!(a.hash("hlt_x"), a.hash("hlt_x"));
    }
}
