use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Serialize;
use tracing::{debug, info};

use super::{public_base_url, AppError, AppState};
use crate::metadata::MetadataTagSet;
use crate::pipeline::UploadStage;
use crate::storage::{Storage, UploadedAsset};

const FILE_FIELD: &str = "file";
const SESSION_FIELD: &str = "socketId";

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub filename: String,
    pub path: String,
    pub url: String,
    pub metadata: MetadataTagSet,
}

#[derive(Default)]
struct UploadForm {
    asset: Option<UploadedAsset>,
    session_id: Option<String>,
}

fn multipart_error(err: MultipartError) -> AppError {
    let message = format!("invalid upload body: {}", err.body_text());
    match err.status() {
        StatusCode::PAYLOAD_TOO_LARGE => AppError::PayloadTooLarge(message),
        _ => AppError::BadRequest(message),
    }
}

pub(super) async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let storage = state.storage();

    let mut form = UploadForm::default();
    if let Err(error) = read_form(storage, &mut multipart, &mut form).await {
        // A rejected request leaves nothing behind, even a fully written file.
        if let Some(asset) = form.asset.take() {
            storage.discard(&asset).await;
        }
        return Err(error);
    }

    let Some(asset) = form.asset else {
        return Err(AppError::BadRequest("No file uploaded.".to_string()));
    };
    let session_id = form.session_id;
    if let Some(id) = session_id.as_deref() {
        if !state.notifications().is_registered(id) {
            debug!(session_id = %id, filename = %asset.generated_name, "No live session; worker output will not be relayed");
        }
    }

    let cancel = state.shutdown_token().child_token();
    let processed = state.pipeline().process(asset, session_id, &cancel).await?;

    let base = public_base_url(&state.config().server, &headers);
    let filename = processed.asset.generated_name;
    Ok(Json(UploadResponse {
        url: format!("{base}/detected/{filename}"),
        path: processed.asset.storage_path.display().to_string(),
        filename,
        metadata: processed.metadata,
    }))
}

async fn read_form(
    storage: &Storage,
    multipart: &mut Multipart,
    form: &mut UploadForm,
) -> Result<(), AppError> {
    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        match field.name() {
            Some(FILE_FIELD) if form.asset.is_none() => {
                let Some(original_name) = field.file_name().map(str::to_string) else {
                    debug!("Ignoring file field without a filename");
                    continue;
                };

                let mut writer = storage.begin(&original_name).await?;
                info!(
                    filename = %writer.asset().generated_name,
                    original_name = %original_name,
                    stage = UploadStage::Received.as_str(),
                    "Receiving upload"
                );
                while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                    writer.write_chunk(&chunk).await?;
                }
                let bytes = writer.bytes_written();
                let stored = writer.commit().await?;
                info!(
                    filename = %stored.generated_name,
                    bytes,
                    stage = UploadStage::Stored.as_str(),
                    "Upload stored"
                );
                form.asset = Some(stored);
            }
            Some(SESSION_FIELD) => {
                let value = field.text().await.map_err(multipart_error)?;
                let value = value.trim();
                form.session_id = (!value.is_empty()).then(|| value.to_string());
            }
            _ => {}
        }
    }
    Ok(())
}
