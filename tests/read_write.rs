#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use common::{Harness, rdonly, read_file, wronly_creat, write_file};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn uncached_read_returns_object_bytes() {
    let store = tempfile::tempdir().unwrap();
    std::fs::write(store.path().join("read.file"), b"test\n").unwrap();

    let harness = Harness::single(store.path(), false, false);
    assert_eq!(read_file(&harness, "read.file").await, b"test\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn uncached_read_handles_random_offsets() {
    let store = tempfile::tempdir().unwrap();
    let data: Vec<u8> = (0..=255u8).cycle().take(100_000).collect();
    std::fs::write(store.path().join("blob"), &data).unwrap();

    let harness = Harness::single(store.path(), false, false);
    let fs = harness.mount.fs();
    let fh = fs.open("blob", rdonly()).await.unwrap();

    // Forward jump.
    let chunk = fs.read(fh, 50_000, 16).await.unwrap();
    assert_eq!(&chunk[..], &data[50_000..50_016]);

    // Backward jump forces a reopen but must still return the right bytes.
    let chunk = fs.read(fh, 10, 16).await.unwrap();
    assert_eq!(&chunk[..], &data[10..26]);

    // Sequential continuation.
    let chunk = fs.read(fh, 26, 16).await.unwrap();
    assert_eq!(&chunk[..], &data[26..42]);

    fs.release(fh).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_then_read_back_is_identical() {
    let store = tempfile::tempdir().unwrap();
    let harness = Harness::single(store.path(), true, true);

    write_file(&harness, "write.test", b"write test\n").await;
    assert_eq!(read_file(&harness, "write.test").await, b"write test\n");

    // Nothing on the remote until unmount.
    assert!(!store.path().join("write.test").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_survives_unmount_and_remount() {
    let store = tempfile::tempdir().unwrap();
    {
        let harness = Harness::single(store.path(), true, true);
        write_file(&harness, "write.test", b"write test\n").await;
        harness.mount.unmount(false).await.unwrap();
    }
    assert_eq!(
        std::fs::read(store.path().join("write.test")).unwrap(),
        b"write test\n"
    );

    // A fresh mount has no cache for the file until a read repopulates it.
    let harness = Harness::single(store.path(), true, true);
    let cache_root = harness.mount.cache_root().unwrap();
    assert!(
        !cache_root.join("local").join("write.test").exists(),
        "cache file must be absent before the first read"
    );
    assert_eq!(read_file(&harness, "write.test").await, b"write test\n");
    assert!(
        cache_root.join("local").join("write.test").exists(),
        "the read must have repopulated the cache"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn append_then_truncate() {
    let store = tempfile::tempdir().unwrap();
    let harness = Harness::single(store.path(), true, true);
    let fs = harness.mount.fs();

    let (_, fh) = fs.create("write.test", wronly_creat()).await.unwrap();
    fs.write(fh, 0, b"write test\n").await.unwrap();
    fs.write(fh, 11, b"line2\n").await.unwrap();
    fs.release(fh).await.unwrap();

    assert_eq!(read_file(&harness, "write.test").await, b"write test\nline2\n");

    let attr = fs
        .setattr(
            "write.test",
            muxfs::fs::SetAttrs {
                size: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(attr.size, 3);
    assert_eq!(fs.getattr("write.test").await.unwrap().size, 3);
    assert_eq!(read_file(&harness, "write.test").await, b"wri");

    // Reads at or past the new size return nothing.
    let fh = fs.open("write.test", rdonly()).await.unwrap();
    assert!(fs.read(fh, 3, 100).await.unwrap().is_empty());
    assert!(fs.read(fh, 50, 100).await.unwrap().is_empty());
    fs.release(fh).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streaming_write_uploads_on_close() {
    let store = tempfile::tempdir().unwrap();
    // Write-enabled but uncached: creates stream straight to the store.
    let harness = Harness::single(store.path(), true, false);
    let fs = harness.mount.fs();

    let (_, fh) = fs.create("stream.file", wronly_creat()).await.unwrap();
    fs.write(fh, 0, b"test\n").await.unwrap();
    fs.write(fh, 5, b"test2\n").await.unwrap();

    // The entry's size tracks the stream while the handle is still open.
    assert_eq!(fs.getattr("stream.file").await.unwrap().size, 11);

    fs.release(fh).await.unwrap();
    assert_eq!(
        std::fs::read(store.path().join("stream.file")).unwrap(),
        b"test\ntest2\n"
    );

    harness.mount.unmount(false).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streaming_write_rejects_backward_seeks() {
    let store = tempfile::tempdir().unwrap();
    let harness = Harness::single(store.path(), true, false);
    let fs = harness.mount.fs();

    let (_, fh) = fs.create("stream.file", wronly_creat()).await.unwrap();
    fs.write(fh, 0, b"hello").await.unwrap();
    let err = fs.write(fh, 0, b"again").await.err().unwrap();
    assert_eq!(err.errno(), libc::EINVAL);
    fs.release(fh).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writes_to_read_only_mount_are_refused() {
    let store = tempfile::tempdir().unwrap();
    std::fs::write(store.path().join("existing"), b"data").unwrap();
    let harness = Harness::single(store.path(), false, true);
    let fs = harness.mount.fs();

    let err = fs.create("new.file", wronly_creat()).await.err().unwrap();
    assert_eq!(err.errno(), libc::EPERM);

    let err = fs
        .open("existing", common::rdwr())
        .await
        .err()
        .unwrap();
    assert_eq!(err.errno(), libc::EPERM);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_writer_on_same_path_is_excluded() {
    let store = tempfile::tempdir().unwrap();
    let harness = Harness::single(store.path(), true, true);
    let fs = harness.mount.fs();

    let (_, fh) = fs.create("solo.txt", wronly_creat()).await.unwrap();
    let err = fs.open("solo.txt", wronly_creat()).await.err().unwrap();
    assert_eq!(err.errno(), libc::EBUSY, "write handles are exclusive");
    // Readers are shut out while the writer is open, too.
    let err = fs.open("solo.txt", rdonly()).await.err().unwrap();
    assert_eq!(err.errno(), libc::EBUSY);

    fs.release(fh).await.unwrap();
    // Once the writer is gone, readers may share.
    let fh1 = fs.open("solo.txt", rdonly()).await.unwrap();
    let fh2 = fs.open("solo.txt", rdonly()).await.unwrap();
    fs.release(fh1).await.unwrap();
    fs.release(fh2).await.unwrap();
}
