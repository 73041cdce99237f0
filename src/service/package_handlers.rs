//! Package push, listing, download, deletion and retry.

use actix_web::{web, HttpRequest, HttpResponse};
use bytes::BytesMut;
use futures::StreamExt;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::{RequestContext, StateQuery};
use crate::app_state::AppState;
use crate::error::{Error, Result};
use crate::model::{PackageMessage, PackageName, PackageState, UserInfo};
use crate::processor::package::Package;
use crate::storage::{PackageStorageItem, StorageFeed};

/// Version given to pushed packages until the queue task reads their real name
const UNKNOWN_VERSION: &str = "1.0-unknown";

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub state: Option<String>,
    pub prefix: Option<String>,
    pub skip: Option<usize>,
    pub take: Option<usize>,
}

pub async fn push_package(
    req: HttpRequest,
    mut payload: web::Payload,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let ctx = RequestContext::from_request(&req);
    let user_name = ctx.require_user()?;

    let mut bytes = BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|e| Error::invalid_operation(format!("upload failed: {}", e)))?;
        bytes.extend_from_slice(&chunk);
    }
    if bytes.is_empty() {
        return Ok(HttpResponse::BadRequest().body("No package was uploaded"));
    }
    let content = bytes.freeze();
    info!("Received package of {} bytes from {}", content.len(), user_name);

    let feed = app_state.storage.get_feed(ctx.feed_name.as_deref());
    let temporary_name = PackageName::new(Uuid::new_v4().to_string(), UNKNOWN_VERSION);
    let item = feed.get_package(Some(user_name), PackageState::New, &temporary_name);
    item.put(content.clone()).await?;

    if let Err(e) = Package::read(&content) {
        warn!("Rejecting package {}: {}", temporary_name, e);
        item.delete().await?;
        return Err(e);
    }

    app_state
        .support
        .track_event(&ctx.user_info, "PackagePushed", json!({ "feed": ctx.feed_name }));
    app_state
        .scheduler
        .signal(PackageMessage::new(
            ctx.user_info.clone(),
            ctx.feed_name.clone(),
            PackageState::New,
            temporary_name,
        ))
        .await?;

    Ok(HttpResponse::Ok().finish())
}

pub async fn list_packages(
    req: HttpRequest,
    query: web::Query<ListQuery>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let ctx = RequestContext::from_request(&req);
    let state = StateQuery {
        state: query.state.clone(),
    }
    .state_or(PackageState::Succeeded)?;
    let user_name = ctx.user_info.user_name.as_deref();
    let prefix = query.prefix.as_deref().filter(|p| !p.is_empty());

    let feed = app_state.storage.get_feed(ctx.feed_name.as_deref());
    let names = match (query.skip, query.take) {
        (None, None) => {
            let mut names = feed.query_packages(user_name, state).await?;
            if let Some(prefix) = prefix {
                names.retain(|name| name.id.starts_with(prefix));
            }
            names
        }
        (skip, take) => {
            feed.query_packages_page(
                user_name,
                state,
                prefix,
                skip.unwrap_or(0),
                take.unwrap_or(usize::MAX),
            )
            .await?
        }
    };

    debug!("Listing {} packages in state {}", names.len(), state);
    Ok(HttpResponse::Ok().json(names))
}

pub async fn download_package(
    req: HttpRequest,
    path: web::Path<(String, String)>,
    query: web::Query<StateQuery>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let ctx = RequestContext::from_request(&req);
    let state = query.state_or(PackageState::Succeeded)?;
    if state == PackageState::New {
        return Err(Error::invalid_operation(
            "packages waiting to be queued cannot be downloaded",
        ));
    }

    let (id, version) = path.into_inner();
    let package_name = PackageName::new(id, version);
    let feed = app_state.storage.get_feed(ctx.feed_name.as_deref());

    match feed.get_package(None, state, &package_name).get().await? {
        Some(content) => Ok(HttpResponse::Ok()
            .content_type("application/octet-stream")
            .insert_header((
                "Content-Disposition",
                format!(
                    "attachment; filename=\"{}.{}.nupkg\"",
                    package_name.id, package_name.version
                ),
            ))
            .body(content)),
        None => Ok(HttpResponse::NotFound().finish()),
    }
}

pub async fn delete_package(
    req: HttpRequest,
    path: web::Path<(String, String)>,
    query: web::Query<StateQuery>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let ctx = RequestContext::from_request(&req);
    let user_name = ctx.require_user()?;
    let state = query.state_or(PackageState::Succeeded)?;

    let (id, version) = path.into_inner();
    let package_name = PackageName::new(id, version);
    let feed = app_state.storage.get_feed(ctx.feed_name.as_deref());
    let item = feed.get_package(Some(user_name), state, &package_name);

    if !item.exists().await? {
        return Ok(HttpResponse::NotFound().finish());
    }

    match state {
        PackageState::Succeeded | PackageState::Partial => {
            if item
                .move_to(PackageState::DeletingQueued, &package_name)
                .await?
                .is_none()
            {
                return Ok(HttpResponse::NotFound().finish());
            }
            app_state
                .scheduler
                .signal(PackageMessage::new(
                    ctx.user_info.clone(),
                    ctx.feed_name.clone(),
                    PackageState::DeletingQueued,
                    package_name.clone(),
                ))
                .await?;
            info!("Queued package {} for deletion", package_name);
        }
        _ => {
            item.delete().await?;
            info!("Deleted package {} in state {}", package_name, state);
        }
    }

    Ok(HttpResponse::Ok().finish())
}

/// Puts one package back on its way through the pipeline. Returns whether it was
/// re-queued.
async fn requeue(
    app_state: &AppState,
    feed: &dyn StorageFeed,
    feed_name: Option<String>,
    state: PackageState,
    package_name: &PackageName,
) -> Result<bool> {
    let item = feed.get_package(None, state, package_name);
    if !item.exists().await? {
        return Ok(false);
    }
    let user_info = UserInfo {
        user_name: item.user_name().await?,
        user_handle: None,
    };

    let signalled_state = match state {
        PackageState::New
        | PackageState::IndexingQueued
        | PackageState::DeletingQueued
        | PackageState::Partial => state,
        PackageState::DamagedNew => transfer(item.as_ref(), PackageState::New, false).await?,
        PackageState::Original => {
            transfer(item.as_ref(), PackageState::IndexingQueued, true).await?
        }
        PackageState::Indexing | PackageState::DamagedIndexing => {
            transfer(item.as_ref(), PackageState::IndexingQueued, false).await?
        }
        PackageState::Deleting | PackageState::DamagedDeleting => {
            transfer(item.as_ref(), PackageState::DeletingQueued, false).await?
        }
        PackageState::Succeeded | PackageState::Deleted | PackageState::None => {
            return Err(Error::invalid_operation(format!(
                "packages in state {} cannot be retried",
                state
            )))
        }
    };

    app_state
        .scheduler
        .signal(PackageMessage::new(
            user_info,
            feed_name,
            signalled_state,
            package_name.clone(),
        ))
        .await?;
    info!("Retrying package {} from {} as {}", package_name, state, signalled_state);
    Ok(true)
}

async fn transfer(
    item: &dyn PackageStorageItem,
    new_state: PackageState,
    keep_source: bool,
) -> Result<PackageState> {
    let moved = if keep_source {
        item.copy_to(new_state, item.name()).await?
    } else {
        item.move_to(new_state, item.name()).await?
    };
    moved
        .map(|_| new_state)
        .ok_or_else(|| Error::MissingPackage(item.to_string()))
}

fn retried(count: usize) -> HttpResponse {
    if count == 0 {
        HttpResponse::NotFound().finish()
    } else {
        HttpResponse::Ok().json(count)
    }
}

pub async fn retry_package(
    req: HttpRequest,
    path: web::Path<(String, String)>,
    query: web::Query<StateQuery>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let ctx = RequestContext::from_request(&req);
    let state = query.state_or(PackageState::Partial)?;
    let (id, version) = path.into_inner();
    let package_name = PackageName::new(id, version);

    let feed = app_state.storage.get_feed(ctx.feed_name.as_deref());
    let requeued = requeue(&app_state, feed.as_ref(), ctx.feed_name.clone(), state, &package_name).await?;
    Ok(retried(usize::from(requeued)))
}

pub async fn retry_all(
    req: HttpRequest,
    query: web::Query<StateQuery>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let ctx = RequestContext::from_request(&req);
    let state = query.state_or(PackageState::Partial)?;
    let feed = app_state.storage.get_feed(ctx.feed_name.as_deref());

    let mut count = 0;
    for package_name in feed.query_packages(None, state).await? {
        if requeue(&app_state, feed.as_ref(), ctx.feed_name.clone(), state, &package_name).await? {
            count += 1;
        }
    }

    info!("Retried {} packages in state {}", count, state);
    Ok(retried(count))
}
