//! S3 backend behavior against a real object store
//!
//! Directory markers, prefix listing, copy-and-delete rename, batched
//! tree removal and whole-object writes.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use futures::{stream, StreamExt, TryStreamExt};

use fs_mount::backend::{Backend, DirEntry, FileType};
use fs_mount::error::Error;
use fs_mount::translator::Translator;
use fs_mount_e2e::S3Harness;

async fn list(backend: &dyn Backend, path: &str) -> fs_mount::Result<Vec<(String, FileType)>> {
    let entries: Vec<DirEntry> = backend.list(Path::new(path)).try_collect().await?;
    let mut entries: Vec<_> = entries
        .into_iter()
        .map(|e| (e.name.to_string_lossy().into_owned(), e.file_type))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

#[tokio::test]
async fn test_create_dir_writes_marker_object() -> Result<()> {
    let harness = S3Harness::new().await?;
    let backend = harness.backend();

    backend.create_dir(Path::new("/photos")).await?;

    assert!(harness.bucket().object_exists("photos/").await?);
    assert!(backend.stat(Path::new("/photos")).await?.is_dir());
    assert_eq!(
        list(&backend, "/").await?,
        vec![("photos".to_string(), FileType::Directory)]
    );

    // The marker alone makes an empty, listable directory
    assert!(list(&backend, "/photos").await?.is_empty());

    harness.cleanup().await
}

#[tokio::test]
async fn test_prefixes_without_markers_are_directories() -> Result<()> {
    let harness = S3Harness::new().await?;
    let backend = harness.backend();
    harness.bucket().put_object("a/b/c.txt", b"deep").await?;
    harness.bucket().put_object("a/top.txt", b"top").await?;

    assert!(backend.stat(Path::new("/a")).await?.is_dir());
    assert!(backend.stat(Path::new("/a/b")).await?.is_dir());
    assert_eq!(backend.stat(Path::new("/a/top.txt")).await?.size, 3);
    assert_eq!(
        list(&backend, "/a").await?,
        vec![
            ("b".to_string(), FileType::Directory),
            ("top.txt".to_string(), FileType::File),
        ]
    );

    harness.cleanup().await
}

#[tokio::test]
async fn test_missing_paths_are_not_found() -> Result<()> {
    let harness = S3Harness::new().await?;
    let backend = harness.backend();
    harness.bucket().put_object("present", b"x").await?;

    // A prefix with no objects at all is not an empty directory
    let err = list(&backend, "/missing").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "{}", err);

    // The bucket root lists even when empty of directories
    assert_eq!(
        list(&backend, "/").await?,
        vec![("present".to_string(), FileType::File)]
    );

    assert!(matches!(
        backend.stat(Path::new("/missing")).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        backend.remove(Path::new("/missing")).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        backend.remove_tree(Path::new("/missing")).await,
        Err(Error::NotFound(_))
    ));

    harness.cleanup().await
}

#[tokio::test]
async fn test_rename_directory_copies_then_deletes_prefix() -> Result<()> {
    let harness = S3Harness::new().await?;
    let backend = harness.backend();
    let bucket = harness.bucket();

    backend.create_dir(Path::new("/src")).await?;
    bucket.put_object("src/x", b"x").await?;
    bucket.put_object("src/sub/y", b"y").await?;
    bucket.put_object("srcfile", b"not under the prefix").await?;

    backend.rename(Path::new("/src"), Path::new("/dst")).await?;

    assert_eq!(bucket.list_objects("src/").await?, Vec::<String>::new());
    assert_eq!(
        bucket.list_objects("dst").await?,
        vec!["dst/", "dst/sub/y", "dst/x"]
    );
    assert_eq!(bucket.get_object("dst/sub/y").await?, b"y");
    assert!(bucket.object_exists("srcfile").await?);

    harness.cleanup().await
}

#[tokio::test]
async fn test_rename_never_replaces_destination() -> Result<()> {
    let harness = S3Harness::new().await?;
    let backend = harness.backend();
    let bucket = harness.bucket();
    bucket.put_object("a", b"from a").await?;
    bucket.put_object("b", b"keep").await?;
    bucket.put_object("dir/inner", b"i").await?;

    let err = backend.rename(Path::new("/a"), Path::new("/b")).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)), "{}", err);

    // An implicit directory is an existing destination too
    let err = backend.rename(Path::new("/a"), Path::new("/dir")).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)), "{}", err);

    assert_eq!(bucket.get_object("a").await?, b"from a");
    assert_eq!(bucket.get_object("b").await?, b"keep");

    harness.cleanup().await
}

#[tokio::test]
async fn test_rename_keys_needing_url_encoding() -> Result<()> {
    let harness = S3Harness::new().await?;
    let backend = harness.backend();
    let bucket = harness.bucket();
    bucket.put_object("my dir/a+b c?\u{e9}.txt", b"odd name").await?;

    backend
        .rename(Path::new("/my dir/a+b c?\u{e9}.txt"), Path::new("/plain.txt"))
        .await?;

    assert_eq!(bucket.get_object("plain.txt").await?, b"odd name");
    assert!(!bucket.object_exists("my dir/a+b c?\u{e9}.txt").await?);

    harness.cleanup().await
}

#[tokio::test]
async fn test_remove_tree_spans_delete_batches() -> Result<()> {
    let harness = S3Harness::new().await?;
    let backend = harness.backend();
    let bucket = harness.bucket();

    // More keys than one DeleteObjects request accepts
    let keys: Vec<String> = (0..1010).map(|i| format!("bulk/{:04}", i)).collect();
    stream::iter(&keys)
        .map(|key| bucket.put_object(key, b""))
        .buffer_unordered(32)
        .try_collect::<Vec<_>>()
        .await?;
    bucket.put_object("bulky", b"sibling").await?;

    backend.remove_tree(Path::new("/bulk")).await?;

    assert!(bucket.list_objects("bulk/").await?.is_empty());
    assert!(bucket.object_exists("bulky").await?);

    harness.cleanup().await
}

#[tokio::test]
async fn test_remove_deletes_single_object() -> Result<()> {
    let harness = S3Harness::new().await?;
    let backend = harness.backend();
    harness.bucket().put_object("f", b"x").await?;

    backend.remove(Path::new("/f")).await?;
    assert!(!harness.bucket().object_exists("f").await?);

    harness.cleanup().await
}

#[tokio::test]
async fn test_write_streams_upload_whole_objects() -> Result<()> {
    let harness = S3Harness::new().await?;
    let backend = harness.backend();

    let mut stream = backend.open_write(Path::new("/f")).await?;
    assert!(!stream.seekable());
    assert!(matches!(stream.seek(3).await, Err(Error::NotSeekable(_))));

    stream.write(b"hello ").await?;
    stream.write(b"world").await?;
    // Nothing is visible until the stream closes
    assert!(!harness.bucket().object_exists("f").await?);
    stream.close().await?;

    assert_eq!(harness.bucket().get_object("f").await?, b"hello world");

    harness.cleanup().await
}

#[tokio::test]
async fn test_read_streams_seek_with_ranged_gets() -> Result<()> {
    let harness = S3Harness::new().await?;
    let backend = harness.backend();
    harness.bucket().put_object("f", b"0123456789").await?;

    let mut stream = backend.open_read(Path::new("/f")).await?;
    assert!(stream.seekable());
    stream.seek(4).await?;
    assert_eq!(&stream.read(3).await?[..], b"456");
    assert_eq!(&stream.read(100).await?[..], b"789");
    assert!(stream.read(100).await?.is_empty());

    harness.cleanup().await
}

#[tokio::test]
async fn test_translator_over_s3() -> Result<()> {
    let harness = S3Harness::new().await?;
    harness.bucket().put_object("data/f", b"hello").await?;
    let t = Translator::new(Arc::new(harness.backend()), "/data");

    // Offset writes need a seekable stream, which S3 never gives
    let err = t.write(Path::new("/f"), b"xyz", 3).await.unwrap_err();
    assert_eq!(err.to_errno(), libc::EROFS);

    // Offset reads go through ranged GETs
    assert_eq!(&t.read(Path::new("/f"), 3, 1).await?[..], b"ell");

    assert!(t.mkdir(Path::new("/sub")).await?.is_dir());
    assert!(harness.bucket().object_exists("data/sub/").await?);

    let names: Vec<_> = t
        .list(Path::new("/"))
        .await?
        .into_iter()
        .map(|e| e.name.to_string_lossy().into_owned())
        .collect();
    assert_eq!(&names[..2], &[".", ".."]);
    assert!(names.contains(&"sub".to_string()));

    harness.cleanup().await
}
