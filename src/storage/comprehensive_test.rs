//! Contract tests run against every storage backend

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::error::Error;
use crate::model::{PackageName, PackageState, SourceName, SymbolName};
use crate::storage::local_store::LocalStorageService;
use crate::storage::remote::object_store::{DirectoryObjectStore, MemoryObjectStore};
use crate::storage::remote::table_store::{MemoryTableStore, SqliteTableStore};
use crate::storage::remote::{RemoteOptions, RemoteStorageService};
use crate::storage::{StorageFeed, StorageService};

fn options() -> RemoteOptions {
    RemoteOptions {
        copy_poll_interval: Duration::from_millis(5),
        copy_timeout: Duration::from_secs(5),
        query_cache_timeout: Duration::from_secs(60),
    }
}

/// Every backend combination, each on its own temp directory.
fn backends() -> Vec<(&'static str, Arc<dyn StorageService>, TempDir)> {
    let mut backends: Vec<(&'static str, Arc<dyn StorageService>, TempDir)> = Vec::new();

    let root = TempDir::new().unwrap();
    let local = LocalStorageService::new(root.path()).unwrap();
    backends.push(("local", Arc::new(local), root));

    let root = TempDir::new().unwrap();
    let remote = RemoteStorageService::new(
        Arc::new(MemoryObjectStore::with_copy_delay(1)),
        Arc::new(SqliteTableStore::open(&root.path().join("tables.sqlite")).unwrap()),
        options(),
        None,
    );
    backends.push(("remote-sqlite", Arc::new(remote), root));

    let root = TempDir::new().unwrap();
    let remote = RemoteStorageService::new(
        Arc::new(DirectoryObjectStore::new(root.path().join("objects")).unwrap()),
        Arc::new(MemoryTableStore::new()),
        options(),
        None,
    );
    backends.push(("remote-directory", Arc::new(remote), root));

    backends
}

#[tokio::test]
async fn test_package_round_trip() {
    for (backend, storage, _root) in backends() {
        let feed = storage.get_feed(Some("roundtrip"));
        let name = PackageName::new("test", "1.0");
        let package = feed.get_package(Some("alice"), PackageState::New, &name);

        assert!(!package.exists().await.unwrap(), "{}", backend);
        assert_eq!(package.get().await.unwrap(), None, "{}", backend);
        assert!(!package.delete().await.unwrap(), "{}", backend);

        let content = Bytes::from(format!("package for {}", backend));
        package.put(content.clone()).await.unwrap();
        assert!(package.exists().await.unwrap(), "{}", backend);
        assert_eq!(package.get().await.unwrap(), Some(content), "{}", backend);
        assert_eq!(
            package.user_name().await.unwrap(),
            Some("alice".to_string()),
            "{}",
            backend
        );

        assert!(package.delete().await.unwrap(), "{}", backend);
        assert!(!package.exists().await.unwrap(), "{}", backend);
        assert_eq!(package.get().await.unwrap(), None, "{}", backend);
    }
}

#[tokio::test]
async fn test_read_only_handle_resolves_owner() {
    for (backend, storage, _root) in backends() {
        let feed = storage.get_feed(None);
        let name = PackageName::new("test", "1.0");
        feed.get_package(Some("alice"), PackageState::Succeeded, &name)
            .put(Bytes::from_static(b"content"))
            .await
            .unwrap();

        for anonymous in [None, Some(""), Some("  ")] {
            let handle = feed.get_package(anonymous, PackageState::Succeeded, &name);
            assert!(handle.exists().await.unwrap(), "{}", backend);
            assert_eq!(
                handle.user_name().await.unwrap(),
                Some("alice".to_string()),
                "{}",
                backend
            );
            assert!(matches!(
                handle.put(Bytes::from_static(b"x")).await,
                Err(Error::InvalidOperation(_))
            ));
            assert!(matches!(handle.delete().await, Err(Error::InvalidOperation(_))));
        }

        let stranger = feed.get_package(Some("mallory"), PackageState::Succeeded, &name);
        assert!(!stranger.exists().await.unwrap(), "{}", backend);
        assert_eq!(stranger.get().await.unwrap(), None, "{}", backend);
        assert!(!stranger.delete().await.unwrap(), "{}", backend);
        assert!(
            feed.get_package(None, PackageState::Succeeded, &name)
                .exists()
                .await
                .unwrap(),
            "{}",
            backend
        );
    }
}

#[tokio::test]
async fn test_ownership_overwrite() {
    for (backend, storage, _root) in backends() {
        let feed = storage.get_feed(None);
        let name = PackageName::new("shared", "1.0");

        feed.get_package(Some("u1"), PackageState::New, &name)
            .put(Bytes::from_static(b"first"))
            .await
            .unwrap();
        feed.get_package(Some("u2"), PackageState::New, &name)
            .put(Bytes::from_static(b"second"))
            .await
            .unwrap();

        assert!(feed
            .query_packages(Some("u1"), PackageState::New)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            feed.query_packages(Some("u2"), PackageState::New).await.unwrap(),
            vec![name.clone()],
            "{}",
            backend
        );
        assert!(!feed
            .get_package(Some("u1"), PackageState::New, &name)
            .exists()
            .await
            .unwrap());
        assert_eq!(
            feed.get_package(None, PackageState::New, &name)
                .get()
                .await
                .unwrap(),
            Some(Bytes::from_static(b"second")),
            "{}",
            backend
        );
    }
}

#[tokio::test]
async fn test_move_and_copy() {
    for (backend, storage, _root) in backends() {
        let feed = storage.get_feed(Some("moves"));
        let name = PackageName::new("pkg", "1.0");
        let renamed = PackageName::new("pkg", "1.0-at-000001");
        let content = Bytes::from_static(b"payload");

        let missing = feed.get_package(Some("alice"), PackageState::New, &name);
        assert!(missing
            .move_to(PackageState::IndexingQueued, &renamed)
            .await
            .unwrap()
            .is_none());
        assert!(feed
            .query_packages(None, PackageState::IndexingQueued)
            .await
            .unwrap()
            .is_empty());

        let package = feed.get_package(Some("alice"), PackageState::New, &name);
        package.put(content.clone()).await.unwrap();

        let original = package
            .copy_to(PackageState::Original, &renamed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(original.get().await.unwrap(), Some(content.clone()), "{}", backend);
        assert!(package.exists().await.unwrap(), "{}", backend);

        let queued = package
            .move_to(PackageState::IndexingQueued, &renamed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queued.state(), PackageState::IndexingQueued);
        assert_eq!(queued.name(), &renamed);
        assert_eq!(queued.user_name().await.unwrap(), Some("alice".to_string()));
        assert_eq!(queued.get().await.unwrap(), Some(content.clone()), "{}", backend);

        assert!(!package.exists().await.unwrap(), "{}", backend);
        assert!(feed
            .query_packages(None, PackageState::New)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            feed.query_packages(None, PackageState::IndexingQueued)
                .await
                .unwrap(),
            vec![renamed.clone()],
            "{}",
            backend
        );
        assert_eq!(
            feed.query_packages(Some("alice"), PackageState::Original)
                .await
                .unwrap(),
            vec![renamed.clone()],
            "{}",
            backend
        );
    }
}

#[tokio::test]
async fn test_move_replaces_other_owner_at_destination() {
    for (backend, storage, _root) in backends() {
        let feed = storage.get_feed(None);
        let name = PackageName::new("pkg", "1.0");

        feed.get_package(Some("bob"), PackageState::IndexingQueued, &name)
            .put(Bytes::from_static(b"bob"))
            .await
            .unwrap();
        feed.get_package(Some("alice"), PackageState::New, &name)
            .put(Bytes::from_static(b"alice"))
            .await
            .unwrap();

        feed.get_package(None, PackageState::New, &name)
            .move_to(PackageState::IndexingQueued, &name)
            .await
            .unwrap()
            .unwrap();

        assert!(feed
            .query_packages(Some("bob"), PackageState::IndexingQueued)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            feed.get_package(None, PackageState::IndexingQueued, &name)
                .get()
                .await
                .unwrap(),
            Some(Bytes::from_static(b"alice")),
            "{}",
            backend
        );
    }
}

#[tokio::test]
async fn test_dedup_reference_counting() {
    for (backend, storage, _root) in backends() {
        let feed = storage.get_feed(None);
        let p1 = PackageName::new("p1", "1.0");
        let p2 = PackageName::new("p2", "1.0");
        let symbol = SymbolName::new("Lib", "ABCDEF1");
        let content = Bytes::from_static(b"symbol content");

        feed.get_symbol(Some(&p1), &symbol)
            .put(content.clone())
            .await
            .unwrap();
        feed.get_symbol(Some(&p2), &symbol)
            .put(content.clone())
            .await
            .unwrap();

        let reader = feed.get_symbol(None, &symbol);
        let mut referencers = reader.package_names().list().await.unwrap();
        referencers.sort();
        assert_eq!(referencers, vec![p1.clone(), p2.clone()], "{}", backend);

        assert!(!feed.get_symbol(Some(&p1), &symbol).delete().await.unwrap());
        assert_eq!(reader.get().await.unwrap(), Some(content.clone()), "{}", backend);
        assert_eq!(
            feed.get_symbol(Some(&p2), &symbol).get().await.unwrap(),
            Some(content.clone())
        );
        assert_eq!(
            reader.package_names().list().await.unwrap(),
            vec![p2.clone()],
            "{}",
            backend
        );

        assert!(feed.get_symbol(Some(&p2), &symbol).delete().await.unwrap());
        assert!(!reader.exists().await.unwrap(), "{}", backend);
        assert!(reader.package_names().list().await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_related_item_requires_package_name() {
    for (backend, storage, _root) in backends() {
        let feed = storage.get_feed(Some("gate"));
        let source = SourceName::new("Program.cs", "hash1");
        let anonymous = feed.get_source(None, &source);

        assert!(matches!(
            anonymous.put(Bytes::from_static(b"x")).await,
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(anonymous.delete().await, Err(Error::InvalidOperation(_))));

        let owner = PackageName::new("pkg", "1.0");
        feed.get_source(Some(&owner), &source)
            .put(Bytes::from_static(b"class Program {}"))
            .await
            .unwrap();
        assert_eq!(
            anonymous.get().await.unwrap(),
            Some(Bytes::from_static(b"class Program {}")),
            "{}",
            backend
        );
    }
}

#[tokio::test]
async fn test_pagination_matches_unpaged_query() {
    for (backend, storage, _root) in backends() {
        let feed = storage.get_feed(None);
        for i in 0..230 {
            let name = PackageName::new(format!("pkg{:03}", i), "1.0");
            feed.get_package(Some("alice"), PackageState::Succeeded, &name)
                .put(Bytes::from_static(b"x"))
                .await
                .unwrap();
        }

        for user in [None, Some("alice")] {
            let all = feed
                .query_packages(user, PackageState::Succeeded)
                .await
                .unwrap();
            assert_eq!(all.len(), 230, "{}", backend);

            let mut paged = Vec::new();
            let mut skip = 0;
            loop {
                let page = feed
                    .query_packages_page(user, PackageState::Succeeded, None, skip, 17)
                    .await
                    .unwrap();
                if page.is_empty() {
                    break;
                }
                skip += page.len();
                paged.extend(page);
            }
            assert_eq!(paged, all, "{}", backend);
        }

        let prefixed = feed
            .query_packages_page(None, PackageState::Succeeded, Some("pkg1"), 0, 1000)
            .await
            .unwrap();
        assert_eq!(prefixed.len(), 100, "{}", backend);
        assert!(prefixed.iter().all(|name| name.id.starts_with("pkg1")));
    }
}

/// Pages through `state` with a fixed page size, starting over from skip 0 once
/// `restart_after` names have been read.
async fn page_through(
    feed: &dyn StorageFeed,
    state: PackageState,
    take: usize,
    restart_after: Option<usize>,
) -> Vec<PackageName> {
    let mut restart_after = restart_after;
    let mut paged = Vec::new();
    loop {
        if restart_after.is_some_and(|limit| paged.len() >= limit) {
            restart_after = None;
            paged.clear();
        }
        let page = feed
            .query_packages_page(None, state, None, paged.len(), take)
            .await
            .unwrap();
        if page.is_empty() {
            break;
        }
        paged.extend(page);
        tokio::task::yield_now().await;
    }
    paged
}

#[tokio::test]
async fn test_concurrent_pagers_match_unpaged_query() {
    for (backend, storage, _root) in backends() {
        let feed = storage.get_feed(Some("paging"));
        for i in 0..150 {
            let name = PackageName::new(format!("lib{:03}", i), "2.0");
            feed.get_package(Some("alice"), PackageState::Succeeded, &name)
                .put(Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        let all = feed
            .query_packages(None, PackageState::Succeeded)
            .await
            .unwrap();
        assert_eq!(all.len(), 150, "{}", backend);

        let (first, second, restarted, late_restart) = futures::join!(
            page_through(feed.as_ref(), PackageState::Succeeded, 13, None),
            page_through(feed.as_ref(), PackageState::Succeeded, 29, None),
            page_through(feed.as_ref(), PackageState::Succeeded, 7, Some(21)),
            page_through(feed.as_ref(), PackageState::Succeeded, 40, Some(120)),
        );
        for paged in [first, second, restarted, late_restart] {
            assert_eq!(paged, all, "{}", backend);
        }

        // pagers on their own tasks, one resetting while the others fetch tails
        let mut handles = Vec::new();
        for (take, restart_after) in [(11, None), (11, Some(132)), (50, None), (3, Some(60))] {
            let feed = feed.clone();
            handles.push(tokio::spawn(async move {
                page_through(feed.as_ref(), PackageState::Succeeded, take, restart_after).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), all, "{}", backend);
        }
    }
}

#[tokio::test]
async fn test_feeds_are_isolated_and_deletable() {
    for (backend, storage, _root) in backends() {
        let name = PackageName::new("pkg", "1.0");
        let first = storage.get_feed(Some("First"));
        let second = storage.get_feed(Some("second"));
        first
            .get_package(Some("alice"), PackageState::New, &name)
            .put(Bytes::from_static(b"x"))
            .await
            .unwrap();

        assert_eq!(first.name(), Some("first"));
        assert!(second
            .query_packages(None, PackageState::New)
            .await
            .unwrap()
            .is_empty());
        assert!(storage
            .query_feeds()
            .await
            .unwrap()
            .contains(&Some("first".to_string())));

        assert!(first.delete().await.unwrap(), "{}", backend);
        assert!(first
            .query_packages(None, PackageState::New)
            .await
            .unwrap()
            .is_empty());
        assert!(!storage
            .query_feeds()
            .await
            .unwrap()
            .contains(&Some("first".to_string())));
    }
}
