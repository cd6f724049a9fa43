//! # Recognition Endpoints
//!
//! - `GET /`: reports which execution context served the request
//! - `POST /`: multipart audio upload in, one transcript line out
//!
//! ## POST / Flow:
//! 1. Read the audio bytes from the multipart body (`Receiving`)
//! 2. Wait for an admission slot if a concurrency limit is configured
//! 3. Hand the bytes to the recognition pipeline (`Stored` → `Transcoded` → `Exchanged`)
//! 4. Reply `200` with the backend's line plus `\n` (`Responded`)
//!
//! Any failure ends only this request; `AppError` renders it as plain text.

use crate::error::{AppError, AppResult};
use crate::middleware::RequestId;
use crate::pipeline::RequestLifecycle;
use crate::state::AppState;
use actix_multipart::Multipart;
use actix_web::http::header::ContentType;
use actix_web::{web, HttpMessage, HttpRequest, HttpResponse};
use futures_util::stream::StreamExt;
use uuid::Uuid;

/// Register `GET /` and `POST /`. Other methods on `/` get 405 from actix.
pub fn configure_recognition_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/")
            .route(web::get().to(serving_context))
            .route(web::post().to(recognize)),
    );
}

/// `GET /`: identify the execution context that handled this request.
///
/// The counter makes every id distinct; the thread name shows which server worker ran it.
pub async fn serving_context(state: web::Data<AppState>) -> HttpResponse {
    let context_id = state.next_context_id();
    let thread = std::thread::current();
    let body = format!(
        "Request-{} ({})\n",
        context_id,
        thread.name().unwrap_or("unnamed")
    );

    HttpResponse::Ok()
        .content_type(ContentType::plaintext())
        .body(body)
}

/// `POST /`: recognize one uploaded audio file.
pub async fn recognize(
    req: HttpRequest,
    state: web::Data<AppState>,
    payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0)
        .unwrap_or_else(Uuid::new_v4);
    let mut lifecycle = RequestLifecycle::begin(request_id);

    let config = state.get_config();
    let received = read_audio_field(
        payload,
        &config.storage.upload_field,
        config.performance.max_upload_bytes,
    )
    .await;
    let audio = match received {
        Ok(audio) => audio,
        Err(e) => {
            lifecycle.fail(&e);
            return Err(e);
        }
    };

    let _permit = match state.admit().await {
        Ok(permit) => permit,
        Err(e) => {
            lifecycle.fail(&e);
            return Err(e);
        }
    };

    let outcome = state.pipeline.process(&mut lifecycle, &audio).await?;
    tracing::debug!(
        request_id = %request_id,
        upload = %outcome.stored.path.display(),
        size_bytes = outcome.stored.size_bytes,
        converted = %outcome.transcoded.path.display(),
        "Recognition finished"
    );
    lifecycle.respond();

    Ok(HttpResponse::Ok()
        .content_type(ContentType::plaintext())
        .body(format!("{}\n", outcome.transcript)))
}

/// Pull the audio bytes out of a multipart body.
///
/// The field named `preferred` wins. Without it, the first non-empty field is used, so
/// clients that name the field differently still work. `max_bytes` caps the total
/// amount read across all fields.
///
/// ## Errors:
/// - `BadRequest` for a body that is not multipart, is malformed, or carries no audio
/// - `PayloadTooLarge` once more than `max_bytes` have been read
async fn read_audio_field(
    mut payload: Multipart,
    preferred: &str,
    max_bytes: usize,
) -> AppResult<Vec<u8>> {
    let mut fallback: Option<Vec<u8>> = None;
    let mut total_read = 0usize;

    while let Some(item) = payload.next().await {
        let mut field =
            item.map_err(|e| AppError::BadRequest(format!("invalid multipart body: {}", e)))?;

        let is_preferred = field
            .content_disposition()
            .and_then(|cd| cd.get_name())
            .map(|name| name == preferred)
            .unwrap_or(false);

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk =
                chunk.map_err(|e| AppError::BadRequest(format!("error reading upload: {}", e)))?;
            total_read += chunk.len();
            if total_read > max_bytes {
                return Err(AppError::PayloadTooLarge {
                    received: total_read,
                    limit: max_bytes,
                });
            }
            bytes.extend_from_slice(&chunk);
        }

        if is_preferred {
            if bytes.is_empty() {
                return Err(AppError::BadRequest(format!(
                    "multipart field `{}` is empty",
                    preferred
                )));
            }
            return Ok(bytes);
        }
        if fallback.is_none() && !bytes.is_empty() {
            fallback = Some(bytes);
        }
    }

    fallback.ok_or_else(|| {
        AppError::BadRequest(format!(
            "no audio in multipart body (expected field `{}`)",
            preferred
        ))
    })
}
