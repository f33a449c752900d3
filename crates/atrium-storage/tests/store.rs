use std::path::{Path, PathBuf};
use std::sync::Arc;

use atrium_storage::{mangle_key, StorageError, StorageService, TokioFs};

fn service(config_dir: &Path) -> StorageService {
    StorageService::new(Arc::new(TokioFs), config_dir)
}

async fn open_workspace(service: &StorageService, root: &Path) {
    service
        .set_workspace_root(Some(root.to_path_buf()))
        .await
        .unwrap();
}

/// The `{uuid}` segment of a store location, i.e. the directory directly
/// under `workspace-metadata/`.
fn uuid_segment(location: &Path) -> String {
    location
        .parent()
        .and_then(Path::file_name)
        .unwrap()
        .to_string_lossy()
        .into_owned()
}

#[tokio::test]
async fn same_key_returns_the_same_store_instance() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path());
    open_workspace(&service, &dir.path().join("project")).await;

    let first = service.get_or_create_store("scm/git").await.unwrap();
    let second = service.get_or_create_store("scm/git").await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.location(), second.location());
}

#[tokio::test]
async fn distinct_keys_share_the_uuid_segment_but_not_the_leaf() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path());
    open_workspace(&service, &dir.path().join("project")).await;

    let a = service.get_or_create_store("scm/git").await.unwrap();
    let b = service.get_or_create_store("search.history").await.unwrap();

    assert_ne!(a.location(), b.location());
    assert_eq!(uuid_segment(&a.location()), uuid_segment(&b.location()));
    assert!(a.location().ends_with("scm-git"));
    assert!(b.location().ends_with("search-history"));
}

#[tokio::test]
async fn workspace_uuid_survives_a_service_restart() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let workspace = dir.path().join("project");

    let first = {
        let service = service(dir.path());
        open_workspace(&service, &workspace).await;
        let store = service.get_or_create_store("scm/git").await?;
        uuid_segment(&store.location())
    };

    let service = service(dir.path());
    open_workspace(&service, &workspace).await;
    let store = service.get_or_create_store("scm/git").await?;
    assert_eq!(uuid_segment(&store.location()), first);
    Ok(())
}

#[tokio::test]
async fn corrupt_index_degrades_to_empty_and_creation_still_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let metadata_root = dir.path().join("workspace-metadata");
    std::fs::create_dir_all(&metadata_root).unwrap();
    std::fs::write(metadata_root.join("index.json"), b"{not json!").unwrap();

    let service = service(dir.path());
    open_workspace(&service, &dir.path().join("project")).await;

    let store = service.get_or_create_store("scm/git").await.unwrap();
    let segment = uuid_segment(&store.location());
    assert!(!segment.is_empty());

    // The rewritten index is valid again and the fresh uuid persisted.
    let text = std::fs::read_to_string(metadata_root.join("index.json")).unwrap();
    let index: std::collections::HashMap<String, String> =
        serde_json::from_str(&text).unwrap();
    assert!(index.values().any(|uuid| *uuid == segment));
}

#[tokio::test]
async fn no_workspace_is_a_typed_error() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path());
    let err = service.get_or_create_store("scm/git").await.unwrap_err();
    assert!(matches!(err, StorageError::NoWorkspace));
}

#[tokio::test]
async fn ensure_exists_then_delete_round_trips_the_directory() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path());
    open_workspace(&service, &dir.path().join("project")).await;

    let store = service.get_or_create_store("scm/git").await.unwrap();
    assert!(!store.location().exists());

    store.ensure_exists().await.unwrap();
    assert!(store.location().is_dir());

    std::fs::write(store.location().join("state.bin"), b"x").unwrap();
    store.delete().await.unwrap();
    assert!(!store.location().exists());

    // Deleting a store that was never materialized is fine too.
    store.delete().await.unwrap();
}

#[tokio::test]
async fn dispose_detaches_the_instance_but_keeps_the_index() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path());
    open_workspace(&service, &dir.path().join("project")).await;

    let first = service.get_or_create_store("scm/git").await.unwrap();
    let segment = uuid_segment(&first.location());
    first.dispose().await;
    assert!(first.is_disposed());

    let second = service.get_or_create_store("scm/git").await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    // Same workspace, so the fresh instance resolves to the same location.
    assert_eq!(uuid_segment(&second.location()), segment);
}

#[tokio::test]
async fn stale_dispose_does_not_evict_the_replacement_instance() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path());
    open_workspace(&service, &dir.path().join("project")).await;

    let stale = service.get_or_create_store("scm/git").await.unwrap();
    stale.dispose().await;
    let replacement = service.get_or_create_store("scm/git").await.unwrap();

    // Disposing the old handle again only affects the old handle.
    stale.dispose().await;
    let third = service.get_or_create_store("scm/git").await.unwrap();
    assert!(Arc::ptr_eq(&replacement, &third));
    assert!(!replacement.is_disposed());
}

#[tokio::test]
async fn workspace_root_change_relocates_live_stores_and_notifies() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path());
    let root_a = dir.path().join("project-a");
    let root_b = dir.path().join("project-b");
    open_workspace(&service, &root_a).await;

    let store = service.get_or_create_store("scm/git").await.unwrap();
    let location_a = store.location();
    let mut changes = store.location_changed();
    changes.mark_unchanged();

    open_workspace(&service, &root_b).await;
    changes.changed().await.unwrap();
    let location_b = store.location();
    assert_ne!(location_a, location_b);
    assert_ne!(uuid_segment(&location_a), uuid_segment(&location_b));

    // Returning to a previously seen root reuses its uuid.
    open_workspace(&service, &root_a).await;
    assert_eq!(store.location(), location_a);
}

#[tokio::test]
async fn setting_the_same_root_again_does_not_emit() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path());
    let root: PathBuf = dir.path().join("project");
    open_workspace(&service, &root).await;

    let store = service.get_or_create_store("scm/git").await.unwrap();
    let mut changes = store.location_changed();
    changes.mark_unchanged();

    open_workspace(&service, &root).await;
    assert!(!changes.has_changed().unwrap());
}

#[tokio::test]
async fn store_key_is_the_mangled_key() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path());
    open_workspace(&service, &dir.path().join("project")).await;

    let store = service.get_or_create_store("my/feature.name").await.unwrap();
    assert_eq!(store.key(), mangle_key("my/feature.name"));
    assert_eq!(store.key(), "my-feature-name");
}
