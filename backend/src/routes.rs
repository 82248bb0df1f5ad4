use actix_files::NamedFile;
use actix_multipart::Multipart;
use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse, error, web};
use futures::{StreamExt, TryStreamExt};
use log::{error, info, warn};
use shared::{EnhanceRequest, EnhanceResponse, ErrorResponse, ModelStatusResponse, UploadResponse};

use crate::enhancer::{EnhanceError, Enhancer};
use crate::storage::{Namespace, StorageError, UploadError};

/// Multipart field carrying the uploaded image.
pub const UPLOAD_FIELD: &str = "image";

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _req| {
        let response = HttpResponse::BadRequest().json(ErrorResponse::new(err.to_string()));
        error::InternalError::from_response(err, response).into()
    }))
    .service(
        web::scope("/api")
            .route("/upload", web::post().to(upload_image))
            .route("/improve", web::post().to(improve_image))
            .route("/images/{name}", web::get().to(get_image))
            .route("/model/status", web::get().to(model_status)),
    );
}

fn error_response(status: StatusCode, message: impl Into<String>) -> HttpResponse {
    HttpResponse::build(status).json(ErrorResponse::new(message))
}

fn upload_error_response(err: UploadError) -> HttpResponse {
    let status = match &err {
        UploadError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        UploadError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        UploadError::EmptyFilename | UploadError::InvalidFormat(_) | UploadError::EmptyPayload => {
            StatusCode::BAD_REQUEST
        }
    };
    if status.is_server_error() {
        error!("Failed to store upload: {err}");
    }
    error_response(status, err.to_string())
}

fn enhance_error_response(err: EnhanceError) -> HttpResponse {
    let status = match &err {
        EnhanceError::SourceNotFound(_) | EnhanceError::Storage(StorageError::NotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        EnhanceError::Storage(StorageError::InvalidName(_)) => StatusCode::BAD_REQUEST,
        e if e.is_decode_failure() => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Enhancement failed: {err}");
    } else {
        warn!("Enhancement rejected: {err}");
    }
    error_response(status, err.to_string())
}

async fn upload_image(enhancer: web::Data<Enhancer>, mut payload: Multipart) -> HttpResponse {
    let limit = enhancer.upload_policy().max_bytes;
    let mut upload = None;

    loop {
        let mut field = match payload.try_next().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
        };
        if field.name() != Some(UPLOAD_FIELD) {
            while let Ok(Some(_)) = field.try_next().await {}
            continue;
        }
        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .unwrap_or_default()
            .to_string();

        let mut image_data = Vec::new();
        while let Some(chunk) = field.next().await {
            let data = match chunk {
                Ok(data) => data,
                Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
            };
            if image_data.len() + data.len() > limit {
                return upload_error_response(UploadError::FileTooLarge {
                    size: image_data.len() + data.len(),
                    limit,
                });
            }
            image_data.extend_from_slice(&data);
        }
        upload = Some((filename, image_data));
        break;
    }

    let Some((filename, image_data)) = upload else {
        return error_response(StatusCode::BAD_REQUEST, "no image part in request");
    };

    let store = enhancer.clone();
    match web::block(move || store.accept_upload(&filename, &image_data)).await {
        Ok(Ok(stored)) => HttpResponse::Ok().json(UploadResponse {
            success: true,
            original_image: stored,
        }),
        Ok(Err(e)) => upload_error_response(e),
        Err(e) => {
            error!("Upload worker failed: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "upload failed")
        }
    }
}

async fn improve_image(
    enhancer: web::Data<Enhancer>,
    request: web::Json<EnhanceRequest>,
) -> HttpResponse {
    let name = request.into_inner().filename;
    if name.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "no filename provided");
    }

    let worker = enhancer.clone();
    match web::block(move || worker.enhance(&name)).await {
        Ok(Ok(result)) => {
            info!(
                "Served {} (fallback: {})",
                result.improved_name, result.fallback
            );
            HttpResponse::Ok().json(EnhanceResponse {
                success: result.success,
                improved_image: result.improved_name,
                fallback: result.fallback,
                width: result.width,
                height: result.height,
            })
        }
        Ok(Err(e)) => enhance_error_response(e),
        Err(e) => {
            error!("Enhancement worker failed: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "enhancement failed")
        }
    }
}

async fn get_image(
    req: HttpRequest,
    enhancer: web::Data<Enhancer>,
    path: web::Path<String>,
) -> HttpResponse {
    let name = path.into_inner();
    let store = enhancer.store();
    let found = [Namespace::Improved, Namespace::Original]
        .into_iter()
        .find(|namespace| store.exists(*namespace, &name));

    let Some(namespace) = found else {
        return error_response(StatusCode::NOT_FOUND, format!("image {name:?} not found"));
    };
    let file = match store.path_of(namespace, &name) {
        Ok(path) => NamedFile::open_async(path).await,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    match file {
        Ok(file) => file.into_response(&req),
        Err(e) => {
            error!("Failed to open {name}: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "could not read image")
        }
    }
}

async fn model_status(enhancer: web::Data<Enhancer>) -> HttpResponse {
    let models = enhancer.models();
    let descriptor = models.descriptor();
    HttpResponse::Ok().json(ModelStatusResponse {
        success: true,
        ready: models.is_ready(),
        state: models.state().to_string(),
        architecture: descriptor.map(|d| d.kind),
        scale_factor: descriptor.map(|d| d.scale_factor),
        reason: models.unavailable_reason(),
    })
}
