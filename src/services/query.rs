use serde::Serialize;

use crate::error::Result;
use crate::ledger::entity::{EntityQuery, summary_from_entity};
use crate::models::file::FileSummary;
use crate::state::AppState;

/// Listing of an owner's files, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct OwnerListing {
    pub owner: String,
    pub count: usize,
    pub files: Vec<FileSummary>,
}

/// Listing of files sharing an extension.
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionListing {
    pub extension: String,
    pub count: usize,
    pub files: Vec<FileSummary>,
}

/// Listing of files sharing a content type.
#[derive(Debug, Clone, Serialize)]
pub struct ContentTypeListing {
    pub content_type: String,
    pub count: usize,
    pub files: Vec<FileSummary>,
}

async fn list_metadata(
    state: &AppState,
    what: &str,
    key: &str,
    value: &str,
) -> Result<Vec<FileSummary>> {
    let query = EntityQuery::new()
        .with_str("type", "metadata")
        .with_str(key, value);

    let entities = state.pools.query_all(what, &query).await?;

    // Rows that fail to decode are logged and skipped rather than failing
    // the whole listing.
    let mut files = Vec::with_capacity(entities.len());
    for entity in &entities {
        match summary_from_entity(entity) {
            Ok(summary) => files.push(summary),
            Err(e) => tracing::warn!("Skipping undecodable metadata entity: {}", e),
        }
    }
    Ok(files)
}

/// Lists an owner's files, sorted by creation time descending.
pub async fn list_by_owner(state: &AppState, owner: &str) -> Result<OwnerListing> {
    let mut files = list_metadata(state, "owner listing", "owner", owner).await?;
    files.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    Ok(OwnerListing {
        owner: owner.to_string(),
        count: files.len(),
        files,
    })
}

/// Lists files by normalized extension.
///
/// In ledger mode the result may legitimately be empty while the ledger's
/// attribute index catches up with recent writes.
pub async fn list_by_extension(state: &AppState, extension: &str) -> Result<ExtensionListing> {
    let normalized = extension.trim_start_matches('.').to_lowercase();
    let files = list_metadata(state, "extension listing", "file_extension", &normalized).await?;

    Ok(ExtensionListing {
        extension: normalized,
        count: files.len(),
        files,
    })
}

/// Lists files by content type.
pub async fn list_by_content_type(
    state: &AppState,
    content_type: &str,
) -> Result<ContentTypeListing> {
    let normalized = content_type.trim().to_lowercase();
    let files = list_metadata(state, "content-type listing", "content_type", &normalized).await?;

    Ok(ContentTypeListing {
        content_type: normalized,
        count: files.len(),
        files,
    })
}
