//! HTTP handlers and route configuration.

mod health;
mod jobs;

use actix_web::web;

/// Configure all application routes.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/health", web::get().to(health::health_check))
            .service(
                web::scope("/jobs")
                    .route("/stats", web::get().to(jobs::queue_stats))
                    .route("/{job_type}/{job_id}", web::get().to(jobs::job_status))
                    .route("/{job_type}/{job_id}", web::delete().to(jobs::cancel_job)),
            ),
    );
}
