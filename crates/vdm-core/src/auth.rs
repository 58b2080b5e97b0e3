use crate::error::GatewayError;

/// OAuth access material for one upstream call.
#[derive(Debug, Clone)]
pub struct OAuthAccess {
    pub access_token: String,
    pub account_id: String,
}

/// Source of OAuth access tokens for providers configured with `!OAUTH`.
/// The interactive login flow lives outside the gateway; the engine only
/// needs fresh material before each attempt.
pub trait OAuthTokenSource: Send + Sync {
    fn access(&self, provider: &str) -> Result<OAuthAccess, GatewayError>;
}

/// Environment-backed token source: `<PROVIDER>_OAUTH_TOKEN` and
/// `<PROVIDER>_OAUTH_ACCOUNT_ID`.
pub struct EnvOAuthTokens;

impl OAuthTokenSource for EnvOAuthTokens {
    fn access(&self, provider: &str) -> Result<OAuthAccess, GatewayError> {
        let prefix = provider.to_uppercase();
        let access_token = std::env::var(format!("{prefix}_OAUTH_TOKEN")).map_err(|_| {
            GatewayError::Validation(format!(
                "provider '{provider}' uses OAuth but {prefix}_OAUTH_TOKEN is not set"
            ))
        })?;
        let account_id = std::env::var(format!("{prefix}_OAUTH_ACCOUNT_ID")).map_err(|_| {
            GatewayError::Validation(format!(
                "provider '{provider}' uses OAuth but {prefix}_OAUTH_ACCOUNT_ID is not set"
            ))
        })?;
        Ok(OAuthAccess {
            access_token,
            account_id,
        })
    }
}
