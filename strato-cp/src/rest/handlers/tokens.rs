//! Registration token endpoints.
//!
//! The secret is returned exactly once, in the create response. Reads and
//! lists redact it; a revoked token leaves a tombstone for audit.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;
use serde::Deserialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::admission::token;
use crate::model::{RegistrationTokenData, RegistrationTokenStatus, now_rfc3339};

use super::{ApiError, AppState, require_writer};

#[derive(Deserialize, ToSchema)]
pub struct CreateTokenRequest {
    pub name: String,
    #[serde(default)]
    pub expires_at: Option<String>,
    /// 0 = unlimited uses.
    #[serde(default)]
    pub max_uses: u32,
}

/// Token as returned by reads: secret redacted.
#[derive(Serialize, ToSchema)]
pub struct TokenView {
    pub id: String,
    pub name: String,
    pub expires_at: Option<String>,
    pub max_uses: u32,
    pub status: RegistrationTokenStatus,
    pub created_at: String,
    pub revision: u64,
}

impl From<RegistrationTokenData> for TokenView {
    fn from(t: RegistrationTokenData) -> Self {
        Self {
            id: t.meta.id,
            name: t.meta.name,
            expires_at: t.spec.expires_at,
            max_uses: t.spec.max_uses,
            status: t.status,
            created_at: t.meta.created_at,
            revision: t.meta.revision,
        }
    }
}

/// Create response: the only place the secret ever appears.
#[derive(Serialize, ToSchema)]
pub struct CreatedToken {
    pub token: String,
    #[serde(flatten)]
    pub view: TokenView,
}

/// Mint a registration token.
#[utoipa::path(
    post,
    path = "/v1/tokens",
    request_body = CreateTokenRequest,
    responses((status = 200, description = "Token minted; secret shown once", body = CreatedToken)),
    tag = "tokens"
)]
pub async fn create_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateTokenRequest>,
) -> Result<Json<CreatedToken>, ApiError> {
    require_writer(&headers)?;
    let secret = token::generate();

    let mut t = RegistrationTokenData::default();
    t.meta.name = req.name;
    t.spec.secret = secret.clone();
    t.spec.expires_at = req.expires_at;
    t.spec.max_uses = req.max_uses;

    let created = state.regs.tokens.create(t).await?;
    state
        .audit
        .created("token", &created.meta.id, &created.meta.name, "");
    Ok(Json(CreatedToken {
        token: secret,
        view: created.into(),
    }))
}

/// List tokens (secrets redacted).
#[utoipa::path(
    get,
    path = "/v1/tokens",
    responses((status = 200, description = "Token list", body = Vec<TokenView>)),
    tag = "tokens"
)]
pub async fn list_tokens(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<TokenView>>, ApiError> {
    let tokens = state.regs.tokens.list(None, None).await?;
    Ok(Json(tokens.into_iter().map(TokenView::from).collect()))
}

/// Read one token (secret redacted).
#[utoipa::path(
    get,
    path = "/v1/tokens/{id}",
    params(("id" = String, Path, description = "Token ID")),
    responses(
        (status = 200, description = "Token", body = TokenView),
        (status = 404, description = "Token not found", body = ApiError)
    ),
    tag = "tokens"
)]
pub async fn get_token(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TokenView>, ApiError> {
    let token = state.regs.tokens.get("", &id).await?;
    Ok(Json(token.into()))
}

/// Revoke a token. The record stays as an audit tombstone.
#[utoipa::path(
    post,
    path = "/v1/tokens/{id}/revoke",
    params(("id" = String, Path, description = "Token ID")),
    responses((status = 200, description = "Token revoked", body = TokenView)),
    tag = "tokens"
)]
pub async fn revoke_token(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TokenView>, ApiError> {
    require_writer(&headers)?;
    let revoked = state
        .regs
        .tokens
        .patch_status("", &id, |t| {
            if t.status.revoked_at.is_none() {
                t.status.revoked_at = Some(now_rfc3339());
            }
            Ok(())
        })
        .await?;
    state.audit.token_revoked(&id);
    Ok(Json(revoked.into()))
}
