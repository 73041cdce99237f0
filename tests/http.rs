use actix_web::http::StatusCode;
use actix_web::{test, web, App};
use std::sync::Arc;
use tempfile::TempDir;

use symbol_source::app_state::AppState;
use symbol_source::config::AppConfig;
use symbol_source::model::{PackageName, PackageState};
use symbol_source::processor::notifier::LogNotifier;
use symbol_source::processor::package::{Package, PackageBuilder};
use symbol_source::processor::status::ImageStatus;
use symbol_source::scheduler::MemoryScheduler;
use symbol_source::service;
use symbol_source::storage::config::{StorageBackend, StorageConfig};
use symbol_source::support::LogSupportService;

const USER: &str = "alice";

struct TestServer {
    _dir: TempDir,
    state: AppState,
    scheduler: Arc<MemoryScheduler>,
}

impl TestServer {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.server.public_url = "http://symbols.test".to_string();
        config.storage = StorageConfig {
            backend: StorageBackend::Local,
            root_path: dir.path().to_string_lossy().to_string(),
            ..Default::default()
        };

        let storage = config.storage.create_storage(None).unwrap();
        let scheduler = Arc::new(MemoryScheduler::new());
        let state = AppState::with_services(
            config,
            storage,
            scheduler.clone(),
            Arc::new(LogNotifier),
            Arc::new(LogSupportService::new()),
        );

        Self {
            _dir: dir,
            state,
            scheduler,
        }
    }

    async fn process(&self) -> usize {
        self.scheduler
            .process_pending(self.state.processor.as_ref())
            .await
            .unwrap()
    }
}

fn library_package() -> Vec<u8> {
    let mut builder = PackageBuilder::new(&PackageName::new("Lib", "2.1.0"));
    builder.add_file("lib/net45/Lib.dll", b"image bytes".to_vec());
    builder.add_file("lib/net45/Lib.pdb", b"\x00d:\\src\\Lib\\Widget.cs\x00".to_vec());
    builder.add_file("src/Lib/Widget.cs", b"class Widget {}".to_vec());
    builder.build().unwrap().to_vec()
}

macro_rules! app {
    ($server:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($server.state.clone()))
                .configure(service::configure),
        )
        .await
    };
}

#[actix_web::test]
async fn test_push_requires_user() {
    let server = TestServer::new();
    let app = app!(server);

    let req = test::TestRequest::put()
        .uri("/api/v2/package")
        .set_payload(library_package())
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(server.process().await, 0);
}

#[actix_web::test]
async fn test_push_rejects_unreadable_package() {
    let server = TestServer::new();
    let app = app!(server);

    let req = test::TestRequest::put()
        .uri("/api/v2/package")
        .insert_header(("User", USER))
        .set_payload(b"not a package".to_vec())
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let feed = server.state.storage.get_feed(None);
    assert!(feed
        .query_packages(None, PackageState::New)
        .await
        .unwrap()
        .is_empty());
}

#[actix_web::test]
async fn test_push_rejects_entry_with_huge_declared_size() {
    let server = TestServer::new();
    let app = app!(server);

    let mut content = library_package();
    let mut offset = 0;
    while let Some(found) = content[offset..].windows(4).position(|w| w == b"PK\x01\x02") {
        let record = offset + found;
        content[record + 24..record + 28].copy_from_slice(&0xFFFF_FFF0u32.to_le_bytes());
        offset = record + 4;
    }

    let req = test::TestRequest::put()
        .uri("/api/v2/package")
        .insert_header(("User", USER))
        .set_payload(content)
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(server.process().await, 0);
}

#[actix_web::test]
async fn test_push_index_serve_and_delete() {
    let server = TestServer::new();
    let app = app!(server);

    let req = test::TestRequest::put()
        .uri("/api/v2/package")
        .insert_header(("User", USER))
        .set_payload(library_package())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(server.process().await, 2);
    let feed_dir = server._dir.path().join("_");
    assert!(!feed_dir.join(".new").exists());
    assert!(!feed_dir.join(".indexingqueued").exists());
    assert!(!feed_dir.join(".indexing").exists());

    let req = test::TestRequest::get().uri("/api/v2/package").to_request();
    let names: Vec<PackageName> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(names.len(), 1);
    let package_name = names[0].clone();
    assert_eq!(package_name.id, "Lib");

    let req = test::TestRequest::get()
        .uri("/api/v2/package?prefix=Other")
        .to_request();
    let names: Vec<PackageName> = test::call_and_read_body_json(&app, req).await;
    assert!(names.is_empty());

    let req = test::TestRequest::get()
        .uri(&format!(
            "/api/v2/package/{}/{}",
            package_name.id, package_name.version
        ))
        .to_request();
    let body = test::call_and_read_body(&app, req).await;
    let status_package = Package::read(&body).unwrap();
    let status: ImageStatus = serde_json::from_slice(
        &status_package
            .entry("lib/net45/Lib.dll.status")
            .unwrap()
            .content,
    )
    .unwrap();
    let symbol = status.symbol_status.unwrap();
    let source = symbol.source_statuses.unwrap()[0].source_name.clone();

    let req = test::TestRequest::get()
        .uri(&format!("/Lib.pdb/{}/Lib.pd_", symbol.symbol_name.symbol_hash))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let req = test::TestRequest::get()
        .uri(&format!("/Lib.pdb/{}/file.ptr", symbol.symbol_name.symbol_hash))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let req = test::TestRequest::get()
        .uri(&format!("/Lib.pdb/{}/Other.pd_", symbol.symbol_name.symbol_hash))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::get()
        .uri(&format!("/src/Widget.cs/{}/Widget.cs", source.hash))
        .to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(&body[..], b"class Widget {}");

    let req = test::TestRequest::delete()
        .uri(&format!(
            "/api/v2/package/{}/{}",
            package_name.id, package_name.version
        ))
        .insert_header(("User", USER))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(server.process().await, 1);

    let req = test::TestRequest::get()
        .uri("/api/v2/package?state=Deleted")
        .to_request();
    let names: Vec<PackageName> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(names, vec![package_name]);

    let req = test::TestRequest::get()
        .uri(&format!("/src/Widget.cs/{}/Widget.cs", source.hash))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn test_feeds_are_isolated_and_case_insensitive() {
    let server = TestServer::new();
    let app = app!(server);

    let req = test::TestRequest::put()
        .uri("/Team/api/v2/package")
        .insert_header(("User", USER))
        .set_payload(library_package())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    server.process().await;

    let req = test::TestRequest::get().uri("/team/api/v2/package").to_request();
    let names: Vec<PackageName> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(names.len(), 1);

    let req = test::TestRequest::get().uri("/api/v2/package").to_request();
    let names: Vec<PackageName> = test::call_and_read_body_json(&app, req).await;
    assert!(names.is_empty());
}

#[actix_web::test]
async fn test_download_and_retry_edge_cases() {
    let server = TestServer::new();
    let app = app!(server);

    let req = test::TestRequest::get()
        .uri("/api/v2/package/Lib/1.0?state=New")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::get()
        .uri("/api/v2/package/Lib/1.0")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let req = test::TestRequest::get()
        .uri("/api/v2/package?state=Bogus")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::post()
        .uri("/api/v2/package/retry/all")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let req = test::TestRequest::post()
        .uri("/api/v2/package/retry/Lib/1.0?state=Succeeded")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let req = test::TestRequest::delete()
        .uri("/api/v2/package/Lib/1.0")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn test_retry_requeues_damaged_upload() {
    let server = TestServer::new();
    let app = app!(server);
    let feed = server.state.storage.get_feed(None);
    let name = PackageName::new("Lib", "3.0");
    feed.get_package(Some(USER), PackageState::DamagedIndexing, &name)
        .put(library_package().into())
        .await
        .unwrap();

    let req = test::TestRequest::post()
        .uri("/api/v2/package/retry/Lib/3.0?state=DamagedIndexing")
        .to_request();
    let count: usize = test::call_and_read_body_json(&app, req).await;
    assert_eq!(count, 1);
    assert_eq!(server.process().await, 1);

    assert!(feed
        .query_packages(None, PackageState::DamagedIndexing)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        feed.query_packages(Some(USER), PackageState::Succeeded)
            .await
            .unwrap(),
        vec![name]
    );
}
