//! Symbol-server and source-server downloads used by debuggers.

use actix_web::{web, HttpRequest, HttpResponse};
use log::debug;

use super::RequestContext;
use crate::app_state::AppState;
use crate::error::{Error, Result};
use crate::model::{SourceName, SymbolName};

const POINTER_FILE: &str = "file.ptr";
const COMPRESSED_SYMBOL_EXTENSION: &str = "pd_";

/// `GET /{image}.pdb/{hash}/{image}.pd_`
pub async fn get_symbol(
    req: HttpRequest,
    path: web::Path<(String, String, String)>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let ctx = RequestContext::from_request(&req);
    let (image, hash, file) = path.into_inner();

    if file.eq_ignore_ascii_case(POINTER_FILE) {
        return Ok(HttpResponse::NotFound().finish());
    }

    let (stem, extension) = file.rsplit_once('.').unwrap_or((file.as_str(), ""));
    if !stem.eq_ignore_ascii_case(&image) {
        return Err(Error::invalid_operation(format!(
            "file {} does not belong to image {}",
            file, image
        )));
    }
    if !extension.eq_ignore_ascii_case(COMPRESSED_SYMBOL_EXTENSION) {
        return Ok(HttpResponse::NotFound().finish());
    }

    let symbol_name = SymbolName::new(image, hash);
    debug!("Serving symbol {}", symbol_name);
    let feed = app_state.storage.get_feed(ctx.feed_name.as_deref());

    match feed.get_symbol(None, &symbol_name).get().await? {
        Some(content) => Ok(HttpResponse::Ok()
            .content_type("application/octet-stream")
            .body(content)),
        None => Ok(HttpResponse::NotFound().finish()),
    }
}

/// `GET /src/{file}/{hash}/{file}`
pub async fn get_source(
    req: HttpRequest,
    path: web::Path<(String, String, String)>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let ctx = RequestContext::from_request(&req);
    let (file, hash, name) = path.into_inner();

    if file != name {
        return Err(Error::invalid_operation(format!(
            "file {} does not match source {}",
            name, file
        )));
    }

    let source_name = SourceName::new(file, hash);
    debug!("Serving source {}", source_name);
    let feed = app_state.storage.get_feed(ctx.feed_name.as_deref());

    match feed.get_source(None, &source_name).get().await? {
        Some(content) => Ok(HttpResponse::Ok()
            .content_type("text/plain; charset=utf-8")
            .body(content)),
        None => Ok(HttpResponse::NotFound().finish()),
    }
}
