mod app_state;
mod config;
mod db;
mod error;
mod query;
mod tour;
mod user;

use std::env;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{http, middleware::Logger, web, App, HttpRequest, HttpResponse, HttpServer};
use env_logger::Env;
use log::{error, info};

use crate::app_state::AppState;
use crate::error::AppError;
use crate::tour::{
    create_tour, delete_tour, get_all_tours, get_tour, monthly_plan, top_tours, tour_stats,
    update_tour,
};
use crate::user::{create_user, get_all_users, update_user};

async fn not_found(req: HttpRequest) -> Result<HttpResponse, AppError> {
    Err(AppError::new(
        format!("Can't find {} on this server!", req.path()),
        404,
    ))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();

    let config = config::Config::from_env();
    let default_filter = if config.is_development() { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter)).init();
    let mongodb = Arc::new(db::MongoDB::init(&config.mongo_uri, &config.database_name).await);
    if let Err(e) = mongodb.ensure_indexes().await {
        error!("Failed to create indexes: {}", e);
        std::process::exit(1);
    }
    info!("DB connection successful");

    let frontend_origin =
        env::var("FRONTEND_ORIGIN").unwrap_or_else(|_| "http://localhost:8080".to_string());

    let port = config.port;
    info!("App running on port {}", port);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allowed_origin(&frontend_origin)
            .allowed_methods(vec!["GET", "POST", "PATCH", "DELETE", "OPTIONS"])
            .allowed_headers(vec![http::header::CONTENT_TYPE, http::header::ACCEPT])
            .max_age(3600);

        App::new()
            .wrap(Logger::default())
            .wrap(cors)
            .app_data(web::Data::new(AppState {
                mongodb: mongodb.clone(),
                config: config.clone(),
            }))
            // TOURS
            .service(
                web::scope("/api/v1/tours")
                    .route("/top-5-cheap", web::get().to(top_tours))
                    .route("/tour-stats", web::get().to(tour_stats))
                    .route("/monthly-plan/{year}", web::get().to(monthly_plan))
                    .route("", web::get().to(get_all_tours))
                    .route("", web::post().to(create_tour))
                    .route("/{id}", web::get().to(get_tour))
                    .route("/{id}", web::patch().to(update_tour))
                    .route("/{id}", web::delete().to(delete_tour)),
            )
            // USERS
            .service(
                web::scope("/api/v1/users")
                    .route("", web::get().to(get_all_users))
                    .route("", web::post().to(create_user))
                    .route("/{id}", web::patch().to(update_user)),
            )
            .default_service(web::route().to(not_found))
    })
    .bind(("0.0.0.0", port))?
    .run();

    if let Err(e) = server.await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
