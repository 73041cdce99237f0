//! Index task: stores the symbols and sources of a package and records what was stored.

use futures::FutureExt;
use log::{debug, error, info, warn};
use serde_json::json;

use super::introspection::{file_name, BinaryInfo, SourceInfo, SrcSrvSection, SymbolInfo};
use super::package::{Package, PackageBuilder};
use super::status::{ExceptionStatus, ImageStatus, SourceStatus, SymbolStatus};
use super::task::{process_throttled, RequestMap, IMAGE_CONCURRENCY, SOURCE_CONCURRENCY};
use super::{TaskContext, EMPTY_FILE, ERROR_FILE, STATUS_SUFFIX};
use crate::error::{Error, Result};
use crate::model::{ImageName, PackageName, PackageState, SourceName, SymbolName};
use crate::storage::PackageStorageItem;

struct IndexRun<'a> {
    ctx: &'a TaskContext,
    package_name: &'a PackageName,
    requests: RequestMap,
}

pub async fn run(
    ctx: &TaskContext,
    item: &dyn PackageStorageItem,
    package: &Package,
) -> Result<PackageState> {
    let package_name = item.name();
    let mut builder = PackageBuilder::new(package_name);
    let mut state = PackageState::Partial;

    let run = IndexRun {
        ctx,
        package_name,
        requests: RequestMap::new(),
    };

    match run.index_package(&mut builder, package).await {
        Ok(true) => state = PackageState::Succeeded,
        Ok(false) => {}
        Err(e) => {
            ctx.support
                .track_exception(&e, json!({ "package_name": package_name.to_string() }));
            error!("Error while indexing package {}: {}", package_name, e);
            builder.add_file(ERROR_FILE, format!("{:?}", e));
        }
    }
    info!("Marking package {} as {}", package_name, state);

    if builder.is_empty() {
        builder.add_file(EMPTY_FILE, Vec::new());
    }

    debug!("Saving package processing status {}", package_name);
    let user_name = item.user_name().await?;
    ctx.feed
        .get_package(user_name.as_deref(), state, package_name)
        .put(builder.build()?)
        .await?;

    let notified = match state {
        PackageState::Succeeded => ctx.notifier.indexed(&ctx.user_info, package_name).await,
        _ => {
            ctx.notifier
                .partially_indexed(&ctx.user_info, package_name)
                .await
        }
    };
    if let Err(e) = notified {
        warn!("Failed to notify indexing of {}: {}", package_name, e);
    }

    Ok(state)
}

impl<'a> IndexRun<'a> {
    /// Returns whether every image was stored in full
    async fn index_package(&self, builder: &mut PackageBuilder, package: &Package) -> Result<bool> {
        let binaries = self.ctx.introspection.add_info_builder().build(package)?;
        let statuses = process_throttled(IMAGE_CONCURRENCY, &binaries, |binary| {
            self.index_image(binary)
        })
        .boxed()
        .await;

        for (binary, status) in binaries.iter().zip(&statuses) {
            builder.add_json(format!("{}{}", binary.file.path, STATUS_SUFFIX), status)?;
        }

        Ok(statuses.iter().all(|status| status.check(true)))
    }

    async fn index_image(&self, binary: &BinaryInfo) -> ImageStatus {
        let mut status = ImageStatus::new(ImageName::new(&binary.name, &binary.hash));
        if let Some(symbol) = &binary.symbol_info {
            status.symbol_status = Some(self.index_symbol(binary, symbol).await);
        }
        status
    }

    fn track(&self, error: &Error) -> ExceptionStatus {
        self.ctx.support.track_exception(
            error,
            json!({ "package_name": self.package_name.to_string() }),
        );
        ExceptionStatus::from(error)
    }

    async fn index_symbol(&self, binary: &BinaryInfo, symbol: &SymbolInfo) -> SymbolStatus {
        let symbol_name = SymbolName::new(&binary.name, &symbol.hash);
        let mut status = SymbolStatus::new(symbol_name.clone());

        debug!("Indexing symbol {}", symbol_name);
        let item = self.ctx.feed.get_symbol(Some(self.package_name), &symbol_name);
        let pdb_store = self.ctx.introspection.pdb_store.clone();
        let compressor = self.ctx.introspection.compressor.clone();
        let section = self.source_index(symbol);
        let symbol_file_name = file_name(&symbol.file.path).to_string();
        let content = symbol.file.content.clone();

        let stored = self
            .requests
            .request_or_skip(&format!("pdb/{}", symbol_name), move || async move {
                debug!("Storing symbol {}", item);
                let indexed = pdb_store.write_srcsrv(&content, &section)?;
                let compressed = compressor.compress(&symbol_file_name, &indexed)?;
                item.put(compressed).await
            })
            .await;

        match stored {
            Ok(_) => {
                status.stored = true;
                debug!("Stored symbol {}", symbol_name);
            }
            Err(e) => status.exception = Some(self.track(&e)),
        }

        status.source_statuses = Some(
            process_throttled(SOURCE_CONCURRENCY, &symbol.source_infos, |source| {
                self.index_source(source)
            })
            .boxed()
            .await,
        );

        status
    }

    fn source_index(&self, symbol: &SymbolInfo) -> SrcSrvSection {
        let mut section = SrcSrvSection::for_server(&self.ctx.public_url);
        for source in &symbol.source_infos {
            section.add_source(&source.original_path, &source.hash);
        }
        section
    }

    async fn index_source(&self, source: &SourceInfo) -> SourceStatus {
        let source_name = SourceName::new(file_name(&source.original_path), &source.hash);
        let mut status = SourceStatus::new(source_name.clone());

        debug!("Indexing source {}", source_name);
        let item = self.ctx.feed.get_source(Some(self.package_name), &source_name);
        let content = source.file.content.clone();

        let stored = self
            .requests
            .request_or_skip(&format!("src/{}", source_name), move || async move {
                item.put(content).await
            })
            .await;

        match stored {
            Ok(_) => {
                status.stored = true;
                debug!("Stored source {}", source_name);
            }
            Err(e) => status.exception = Some(self.track(&e)),
        }

        status
    }
}
