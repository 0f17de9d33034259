//! Job monitoring handlers.

use actix_web::{HttpResponse, web};
use verdant_core::domain::{JobStatus, JobType};
use verdant_shared::ApiResponse;
use verdant_shared::dto::{CancelJobResponse, JobStatusResponse, QueueCounts, QueueStatsResponse};

use crate::middleware::error::{AppError, AppResult};
use crate::state::AppState;

/// GET /api/jobs/stats
pub async fn queue_stats(state: web::Data<AppState>) -> HttpResponse {
    let queues = state
        .jobs
        .get_queue_stats()
        .await
        .into_iter()
        .map(|(job_type, stats)| {
            let counts = QueueCounts {
                waiting: stats.waiting,
                active: stats.active,
                completed: stats.completed,
                failed: stats.failed,
                delayed: stats.delayed,
            };
            (job_type.to_string(), counts)
        })
        .collect();

    HttpResponse::Ok().json(ApiResponse::ok(QueueStatsResponse {
        mode: state.jobs.mode().to_string(),
        queues,
    }))
}

/// GET /api/jobs/{type}/{id}
pub async fn job_status(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> AppResult<HttpResponse> {
    let (job_type, job_id) = path.into_inner();
    let job_type: JobType = job_type.parse()?;

    let report = state.jobs.get_job_status(job_type, &job_id).await;
    match report.status {
        JobStatus::NotFound => {
            return Err(AppError::NotFound(format!("Job {} not found", job_id)));
        }
        JobStatus::Error => {
            return Err(AppError::Unavailable(report.error.unwrap_or_default()));
        }
        _ => {}
    }

    let result = report.result.map(serde_json::to_value).transpose()?;

    Ok(HttpResponse::Ok().json(ApiResponse::ok(JobStatusResponse {
        job_id,
        job_type: job_type.to_string(),
        status: report.status.to_string(),
        progress: report.progress,
        attempts_made: report.attempts_made,
        result,
        error: report.error,
    })))
}

/// DELETE /api/jobs/{type}/{id}
pub async fn cancel_job(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> AppResult<HttpResponse> {
    let (job_type, job_id) = path.into_inner();
    let job_type: JobType = job_type.parse()?;

    let cancelled = state.jobs.cancel_job(job_type, &job_id).await;
    let message = if cancelled {
        "Job cancelled"
    } else {
        "Job not found, already running or finished"
    };

    Ok(HttpResponse::Ok().json(ApiResponse::ok_with_message(
        CancelJobResponse { job_id, cancelled },
        message,
    )))
}
