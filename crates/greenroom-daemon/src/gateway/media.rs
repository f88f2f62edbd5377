//! Media upload endpoint.
//!
//! One upload per UPT: the token id is marked consumed before the blob is
//! written, so a replayed token fails with `token_already_used` even if the
//! first upload is still in flight. Only the opaque reference (and a
//! SHA-256 checksum) leave this module; blob contents are never logged.

use axum::Json;
use axum::extract::{Multipart, Query, State};
use axum::http::HeaderMap;
use greenroom_core::token::{Audience, TokenError};
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::AppState;
use super::auth::{bearer_token, check_generation};
use super::error::ApiError;

#[derive(Debug, Deserialize)]
pub(super) struct UploadQuery {
    token: Option<String>,
}

/// `POST /media/upload` (UPT, one-shot). The token rides the bearer header
/// or, for browser `FormData` uploads that cannot set headers, `?token=`.
pub(super) async fn upload(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let token = match bearer_token(&headers) {
        Ok(token) => token.to_string(),
        Err(_) => query.token.ok_or(ApiError::Token(TokenError::Missing))?,
    };
    let claims = state.authority.verify(&token, Audience::Upt, None)?;
    let session_id = claims
        .session_id
        .clone()
        .ok_or(ApiError::Token(TokenError::Invalid))?;
    let session = state.service.get_session(&session_id)?;
    check_generation(&claims, &session)?;

    // Consume before writing: a second use of the same token must fail even
    // while the first upload is in progress.
    state.authority.consume_once(&claims.jti)?;

    let mut data: Option<(String, Vec<u8>)> = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or("blob").to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|_| ApiError::Validation("unreadable multipart field".into()))?;
            data = Some((filename, bytes.to_vec()));
            break;
        }
    }
    let Some((filename, bytes)) = data else {
        return Err(ApiError::Validation("multipart field `file` is required".into()));
    };
    if bytes.is_empty() {
        return Err(ApiError::Validation("empty upload".into()));
    }

    let checksum = hex::encode(Sha256::digest(&bytes));
    let blob_ref = format!("{session_id}/{}", uuid::Uuid::new_v4());

    let dir = std::path::Path::new(&state.config.upload_dir).join(&session_id);
    let path = dir.join(blob_ref.rsplit('/').next().unwrap_or("blob"));
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| internal(&e))?;
    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|e| internal(&e))?;
    file.write_all(&bytes).await.map_err(|e| internal(&e))?;

    info!(
        session_id = %session_id,
        token_id = %claims.jti,
        size = bytes.len(),
        filename = %filename,
        "media stored"
    );
    Ok(Json(json!({"ref": blob_ref, "checksum": checksum})))
}

fn internal(err: &std::io::Error) -> ApiError {
    ApiError::Internal(format!("blob write failed: {}", err.kind()))
}
