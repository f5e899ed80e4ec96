use actix_web::web;

use super::handlers;

/// Registers every route on the app.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(handlers::health))
        .route("/discovery", web::get().to(handlers::discovery))
        .route("/hook/{id}", web::post().to(handlers::hook))
        .service(
            web::scope("/jobs")
                .route("", web::get().to(handlers::list_jobs))
                .route("/reset", web::post().to(handlers::reset_stream))
                .route("/{id}", web::get().to(handlers::get_job)),
        )
        .route("/alerts/resolve", web::post().to(handlers::resolve_alert));
}
