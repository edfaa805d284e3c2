//! Backend contract tests: both storage implementations must expose the same
//! observable semantics, including empty-listing-as-error and parent-directory
//! pruning. Exercised against the filesystem backend; the S3 scratch-dir
//! single-flight gate is covered directly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use docker_registry::config::LocalConfig;
use docker_registry::storage::s3::BufferDir;
use docker_registry::storage::{BlobReader, LocalStorage, Storage, StorageError};

async fn temp_storage() -> (tempfile::TempDir, LocalStorage) {
    let dir = tempfile::tempdir().unwrap();
    let storage = LocalStorage::new(LocalConfig {
        root: dir.path().to_path_buf(),
    })
    .await
    .unwrap();
    (dir, storage)
}

fn reader(content: &[u8]) -> BlobReader {
    Box::new(std::io::Cursor::new(content.to_vec()))
}

#[tokio::test]
async fn get_put_exists_remove() {
    let (_dir, storage) = temp_storage().await;

    assert!(!storage.exists("/1").await.unwrap());
    assert!(storage.get("/1").await.is_err());
    assert!(storage.remove("/1").await.is_err());

    storage.put("/1", b"lolwtf").await.unwrap();
    assert!(storage.exists("/1").await.unwrap());
    assert_eq!(storage.get("/1").await.unwrap(), b"lolwtf");
    assert_eq!(storage.size("/1").await.unwrap(), 6);

    storage.remove("/1").await.unwrap();
    assert!(
        storage.list("/").await.is_err(),
        "listing an empty root must report not-found"
    );
}

#[tokio::test]
async fn readers_round_trip_and_prune() {
    let (_dir, storage) = temp_storage().await;

    assert!(storage.get_reader("/dir/1").await.is_err());

    storage
        .put_reader("/dir/1", reader(b"lolwtfdir"), None)
        .await
        .unwrap();
    assert!(storage.exists("/dir/1").await.unwrap());

    let mut stream = storage.get_reader("/dir/1").await.unwrap();
    let mut content = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut content)
        .await
        .unwrap();
    assert_eq!(content, b"lolwtfdir");

    storage.remove("/dir/1").await.unwrap();
    assert!(
        storage.list("/dir").await.is_err(),
        "an emptied directory must report not-found"
    );
    assert!(
        storage.list("/").await.is_err(),
        "empty parents must be pruned after remove"
    );
}

#[tokio::test]
async fn after_write_hook_sees_stored_bytes_once() {
    let (_dir, storage) = temp_storage().await;

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let hook_calls = calls.clone();
    let hook_seen = seen.clone();
    storage
        .put_reader(
            "/hooked",
            reader(b"payload bytes"),
            Some(Box::new(move |file| {
                hook_calls.fetch_add(1, Ordering::SeqCst);
                let mut content = Vec::new();
                file.read_to_end(&mut content).unwrap();
                *hook_seen.lock().unwrap() = content;
            })),
        )
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*seen.lock().unwrap(), b"payload bytes");
    assert_eq!(storage.get("/hooked").await.unwrap(), b"payload bytes");
}

#[tokio::test]
async fn list_and_remove_all() {
    let (_dir, storage) = temp_storage().await;

    storage.put("/dir/1", b"lolwtfdir1").await.unwrap();
    storage.put("/dir/2", b"lolwtfdir2").await.unwrap();
    storage.put("/dir/3", b"lolwtfdir3").await.unwrap();
    storage.put("/anotherdir/1", b"lolwtfanotherdir1").await.unwrap();

    assert_eq!(storage.list("/").await.unwrap().len(), 2);
    let mut dir_names = storage.list("/dir").await.unwrap();
    dir_names.sort();
    assert_eq!(dir_names, vec!["/dir/1", "/dir/2", "/dir/3"]);
    assert_eq!(storage.list("/anotherdir/").await.unwrap().len(), 1);

    storage.remove_all("/dir").await.unwrap();
    assert_eq!(storage.list("/").await.unwrap().len(), 1);
    assert!(storage.list("/dir").await.is_err());

    storage.remove_all("/anotherdir").await.unwrap();
    assert!(storage.list("/").await.is_err());
    assert!(storage.list("/anotherdir").await.is_err());
}

#[tokio::test]
async fn listed_names_resolve_back_to_blobs() {
    let (_dir, storage) = temp_storage().await;
    storage
        .put("repositories/library/busybox/tag_latest", b"abc")
        .await
        .unwrap();
    let names = storage.list("repositories/library/busybox").await.unwrap();
    assert_eq!(names, vec!["/repositories/library/busybox/tag_latest"]);
    assert_eq!(storage.get(&names[0]).await.unwrap(), b"abc");
}

#[tokio::test]
async fn remove_all_of_missing_prefix_is_an_error() {
    let (_dir, storage) = temp_storage().await;
    assert!(storage.remove_all("/nope").await.is_err());
}

#[tokio::test]
async fn buffer_dir_single_flight() {
    let dir = tempfile::tempdir().unwrap();
    let buffers = BufferDir::new(dir.path().to_path_buf());

    let first = buffers.reserve("images/abc/layer").await.unwrap();
    let second = buffers.reserve("images/abc/layer").await;
    assert!(
        matches!(second, Err(StorageError::UploadInProgress(_))),
        "a concurrent claim on the same key must fail fast"
    );

    // a different key is unaffected
    let other = buffers.reserve("images/def/layer").await.unwrap();
    buffers.release(&other).await;

    buffers.release(&first).await;
    assert!(!first.exists(), "release must delete the scratch file");
    // and the key becomes claimable again
    let reclaimed = buffers.reserve("images/abc/layer").await.unwrap();
    buffers.release(&reclaimed).await;
}
