//! HTTP surface
//!
//! Every route exists for the default feed and again under `/{feed}`. The caller is
//! identified by the `User` header.

pub mod package_handlers;
pub mod symbol_handlers;

use actix_web::{web, HttpRequest};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::{normalize_feed_name, PackageState, UserInfo};

/// Caller of a request: the `User` header plus the feed taken from the path.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user_info: UserInfo,
    pub feed_name: Option<String>,
}

impl RequestContext {
    pub fn from_request(req: &HttpRequest) -> Self {
        let user_name = req
            .headers()
            .get("User")
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        let user_handle = req
            .headers()
            .get("User-Handle")
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);
        let feed_name = normalize_feed_name(req.match_info().get("feed"));

        log_mdc::insert("user", user_name.as_deref().unwrap_or("-"));
        log_mdc::insert("feed", feed_name.as_deref().unwrap_or("-"));

        Self {
            user_info: UserInfo {
                user_name,
                user_handle,
            },
            feed_name,
        }
    }

    /// The caller's name, required for operations that change ownership records
    pub fn require_user(&self) -> Result<&str> {
        self.user_info
            .user_name
            .as_deref()
            .ok_or_else(|| Error::invalid_operation("missing User header"))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StateQuery {
    pub state: Option<String>,
}

impl StateQuery {
    pub fn state_or(&self, default: PackageState) -> Result<PackageState> {
        match self.state.as_deref() {
            None | Some("") => Ok(default),
            Some(state) => state.parse().map_err(Error::InvalidOperation),
        }
    }
}

fn register(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/v2/package", web::put().to(package_handlers::push_package))
        .route("/api/v2/package", web::get().to(package_handlers::list_packages))
        .route(
            "/api/v2/package/retry/all",
            web::post().to(package_handlers::retry_all),
        )
        .route(
            "/api/v2/package/retry/{id}/{version}",
            web::post().to(package_handlers::retry_package),
        )
        .route(
            "/api/v2/package/{id}/{version}",
            web::get().to(package_handlers::download_package),
        )
        .route(
            "/api/v2/package/{id}/{version}",
            web::delete().to(package_handlers::delete_package),
        )
        .route(
            "/src/{file}/{hash}/{name}",
            web::get().to(symbol_handlers::get_source),
        )
        .route(
            "/{image}.pdb/{hash}/{file}",
            web::get().to(symbol_handlers::get_symbol),
        );
}

/// Registers the default-feed routes, then the same routes under `/{feed}`
pub fn configure(cfg: &mut web::ServiceConfig) {
    register(cfg);
    cfg.service(web::scope("/{feed}").configure(register));
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_request_context_reads_headers() {
        let req = TestRequest::default()
            .insert_header(("User", " alice "))
            .to_http_request();
        let ctx = RequestContext::from_request(&req);
        assert_eq!(ctx.require_user().unwrap(), "alice");
        assert_eq!(ctx.feed_name, None);

        let req = TestRequest::default().to_http_request();
        let ctx = RequestContext::from_request(&req);
        assert!(matches!(ctx.require_user(), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn test_state_query() {
        let query = StateQuery::default();
        assert_eq!(query.state_or(PackageState::Succeeded).unwrap(), PackageState::Succeeded);

        let query = StateQuery {
            state: Some("partial".to_string()),
        };
        assert_eq!(query.state_or(PackageState::Succeeded).unwrap(), PackageState::Partial);

        let query = StateQuery {
            state: Some("nope".to_string()),
        };
        assert!(query.state_or(PackageState::Succeeded).is_err());
    }
}
