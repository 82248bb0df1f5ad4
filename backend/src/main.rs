use std::io;
use std::sync::Arc;

use actix_cors::Cors;
use actix_files::Files;
use actix_web::{App, HttpServer, middleware::Logger, web};
use xray_enhancer::checkpoint::CheckpointLoader;
use xray_enhancer::config::AppConfig;
use xray_enhancer::enhancer::Enhancer;
use xray_enhancer::lifecycle::ModelManager;
use xray_enhancer::routes::configure_routes;
use xray_enhancer::storage::FileStore;

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = AppConfig::load().map_err(|e| {
        log::error!("Invalid configuration: {e}");
        io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
    })?;

    let store = FileStore::open(&config.storage.root).map_err(|e| {
        log::error!("Failed to open image store at {}: {e}", config.storage.root.display());
        io::Error::other(e.to_string())
    })?;

    let loader = CheckpointLoader::new(&config.model.path, config.model.descriptor())
        .with_checksum(config.model.checksum.clone())
        .allow_untrained(config.model.allow_untrained);
    let models = Arc::new(ModelManager::new(loader));
    if config.model.preload {
        let state = models.warmup();
        log::info!("Model state after startup load: {state}");
    }

    let enhancer = web::Data::new(Enhancer::new(Arc::new(store), models, config.upload.clone()));
    let static_dir = config.server.static_dir.clone();
    let bind_address = (config.server.host.clone(), config.server.port);

    log::info!("Starting server on {}:{}", bind_address.0, bind_address.1);

    HttpServer::new(move || {
        let app = App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .wrap(Logger::default())
            .app_data(enhancer.clone())
            .configure(configure_routes);
        match &static_dir {
            Some(dir) => app.service(Files::new("/", dir.clone()).index_file("index.html")),
            None => app,
        }
    })
    .bind(bind_address)?
    .run()
    .await
}
