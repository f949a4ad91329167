//! HTTP handlers for the upload endpoint and its progress stream (§4.9, §6).

use std::time::Duration;

use axum::extract::{Multipart, Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::StreamExt;
use uuid::Uuid;

use crate::api::models::UploadAcceptedResponse;
use crate::error::{EngineError, Result};
use crate::events::PipelineEventKind;
use crate::model::{UploadJob, UploadJobStatus};
use crate::state::AppState;

const ACCEPTED_EXTENSIONS: &[&str] = &[".xlsx", ".xls"];

/// `POST /upload/pos` — multipart upload of a spreadsheet. Parsing and
/// classification happen synchronously (fast); everything past that is a
/// background job tracked by the Upload Job Coordinator (§4.9).
pub async fn upload_pos(State(state): State<AppState>, mut multipart: Multipart) -> Result<Json<UploadAcceptedResponse>> {
    let mut file_bytes: Option<Vec<u8>> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| EngineError::ValidationError(e.to_string()))? {
        let file_name = field.file_name().unwrap_or("").to_string();
        if !ACCEPTED_EXTENSIONS.iter().any(|ext| file_name.to_lowercase().ends_with(ext)) {
            continue;
        }
        let bytes = field.bytes().await.map_err(|e| EngineError::ValidationError(e.to_string()))?;
        file_bytes = Some(bytes.to_vec());
        break;
    }

    let Some(bytes) = file_bytes else {
        return Err(EngineError::ValidationError(
            "no .xlsx/.xls file part found in multipart body".to_string(),
        ));
    };

    let job_id = state.uploads.submit(bytes).await?;
    Ok(Json(UploadAcceptedResponse { job_id }))
}

/// `GET /upload/progress/{jobId}` — SSE stream of `progress`/`complete`/
/// `error` frames. Emits the job's current snapshot immediately (covering
/// the race where processing finishes before the client subscribes), then
/// tails the pipeline channel for further updates scoped to this job.
pub async fn upload_progress(State(state): State<AppState>, Path(job_id): Path<Uuid>) -> Result<impl IntoResponse> {
    let initial = state.uploads.get(job_id).ok_or_else(|| EngineError::not_found("upload job", job_id))?;

    let initial_event = job_to_event(&initial).map_err(|e| EngineError::Internal(e.into()))?;
    let already_done = matches!(initial.status, UploadJobStatus::Complete | UploadJobStatus::Error);

    let tail = state
        .events
        .subscribe_pipeline()
        .filter(move |event| futures::future::ready(event.kind == PipelineEventKind::UploadProgress && event.batch_id == job_id))
        .map(|event| -> std::result::Result<Event, std::convert::Infallible> {
            let job: UploadJob = serde_json::from_value(event.payload).unwrap_or_else(|_| UploadJob::new(chrono::Duration::hours(1)));
            Ok(job_to_event(&job).unwrap_or_else(|_| Event::default().event("error").data("{}")))
        });

    type BoxedEventStream = std::pin::Pin<Box<dyn futures::Stream<Item = std::result::Result<Event, std::convert::Infallible>> + Send>>;
    let stream: BoxedEventStream = if already_done {
        Box::pin(futures::stream::once(async move { Ok(initial_event) }))
    } else {
        Box::pin(futures::stream::once(async move { Ok(initial_event) }).chain(tail))
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)).text("heartbeat")))
}

fn job_to_event(job: &UploadJob) -> std::result::Result<Event, axum::Error> {
    match job.status {
        UploadJobStatus::Complete => Event::default().event("complete").json_data(job),
        UploadJobStatus::Error => Event::default().event("error").json_data(job),
        UploadJobStatus::Pending | UploadJobStatus::Processing => Event::default().event("progress").json_data(job),
    }
}
