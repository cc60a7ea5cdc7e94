//! Blob lifecycle: create, write, seal, read, enumerate, unlink.

mod common;

use common::{format_and_mount, fresh_device, random_bytes, read_blob, write_blob};
use sealfs::{DirCursor, MountOptions, SealFs};
use sealfs_error::SealError;
use sealfs_merkle::{empty_root, merkle_root, tree_blocks};
use sealfs_types::{bytes_to_blocks, BLOCK_SIZE};
use std::sync::Arc;

fn readdir_all(fs: &Arc<SealFs>) -> Vec<String> {
    let mut cursor = DirCursor::default();
    let mut names = Vec::new();
    loop {
        let batch = fs.readdir(&mut cursor, 4096).expect("readdir");
        if batch.is_empty() {
            return names;
        }
        names.extend(batch);
    }
}

#[test]
fn fresh_image_enumerates_nothing() {
    common::init_tracing();
    let device = fresh_device(16);
    let fs = format_and_mount(&device, MountOptions::default());
    assert_eq!(readdir_all(&fs), Vec::<String>::new());
    assert_eq!(fs.allocated_blocks(), 0);
    assert_eq!(fs.allocated_nodes(), 0);
    fs.shutdown().expect("shutdown");
}

#[test]
fn small_blob_round_trips() {
    let device = fresh_device(16);
    let fs = format_and_mount(&device, MountOptions::default());

    let data = random_bytes(7, 4096);
    let digest = write_blob(&fs, &data);

    // A second open for write must fail: the content already exists.
    assert!(matches!(
        fs.create_blob(digest),
        Err(SealError::AlreadyExists)
    ));

    assert_eq!(read_blob(&fs, &digest), data);
    assert_eq!(readdir_all(&fs), vec![digest.to_hex()]);

    // Accounting: the bitmap agrees with the superblock.
    let info = fs.info();
    assert_eq!(fs.allocated_blocks(), info.alloc_block_count);
    assert_eq!(fs.allocated_nodes(), info.alloc_inode_count);
    assert_eq!(info.alloc_inode_count, 1);
    fs.shutdown().expect("shutdown");
}

#[test]
fn read_past_the_end_returns_nothing() {
    let device = fresh_device(16);
    let fs = format_and_mount(&device, MountOptions::default());
    let data = random_bytes(11, 4096);
    let digest = write_blob(&fs, &data);

    let blob = fs.open_blob(&digest).expect("open");
    let mut buf = [0_u8; 16];
    assert_eq!(blob.read_at(&mut buf, 4096).expect("read"), 0);
    assert_eq!(blob.read_at(&mut buf, 1 << 40).expect("read"), 0);
    // A short tail read is clamped.
    assert_eq!(blob.read_at(&mut buf, 4090).expect("read"), 6);
    fs.close_blob(&blob).expect("close");
    fs.shutdown().expect("shutdown");
}

#[test]
fn null_blob_is_readable_immediately() {
    let device = fresh_device(16);
    let fs = format_and_mount(&device, MountOptions::default());

    let digest = write_blob(&fs, &[]);
    assert_eq!(digest, empty_root());
    assert_eq!(readdir_all(&fs), vec![digest.to_hex()]);

    let blob = fs.open_blob(&digest).expect("open");
    assert_eq!(blob.size(), 0);
    let mut buf = [0_u8; 8];
    assert_eq!(blob.read_at(&mut buf, 0).expect("read"), 0);
    fs.close_blob(&blob).expect("close");

    let info = fs.info();
    assert_eq!(info.alloc_block_count, 0);
    assert_eq!(info.alloc_inode_count, 1);
    fs.shutdown().expect("shutdown");
}

#[test]
fn compressible_blob_is_stored_compressed() {
    let device = fresh_device(32);
    let fs = format_and_mount(&device, MountOptions::default());

    let data = vec![0x5A_u8; 1024 * 1024];
    let digest = write_blob(&fs, &data);

    let reserved_blocks =
        tree_blocks(data.len() as u64) + bytes_to_blocks(data.len() as u64);
    let blob = fs.open_blob(&digest).expect("open");
    assert!(blob.is_compressed());
    assert!(u64::from(blob.block_count()) < reserved_blocks);
    fs.close_blob(&blob).expect("close");

    // Reading back exercises the decompression path (the buffers were
    // evicted at close).
    assert_eq!(read_blob(&fs, &digest), data);
    fs.shutdown().expect("shutdown");
}

#[test]
fn incompressible_blob_is_stored_raw() {
    let device = fresh_device(32);
    let fs = format_and_mount(&device, MountOptions::default());

    let data = random_bytes(23, 512 * 1024);
    let digest = write_blob(&fs, &data);
    let blob = fs.open_blob(&digest).expect("open");
    assert!(!blob.is_compressed());
    fs.close_blob(&blob).expect("close");
    assert_eq!(read_blob(&fs, &digest), data);
    fs.shutdown().expect("shutdown");
}

#[test]
fn wrong_name_is_an_integrity_error() {
    let device = fresh_device(16);
    let fs = format_and_mount(&device, MountOptions::default());

    // Open under a name the content will not hash to.
    let wrong_digest = merkle_root(b"something else entirely");
    let blob = fs.create_blob(wrong_digest).expect("create");
    blob.space_allocate(4096).expect("allocate");
    let payload = random_bytes(3, 4096);
    assert!(matches!(
        blob.write_bytes(&payload),
        Err(SealError::IntegrityError)
    ));
    assert!(matches!(
        blob.write_bytes(&payload),
        Err(SealError::BadState)
    ));
    fs.close_blob(&blob).expect("close");
    drop(blob);

    // The failed blob's reservations were released and it is gone.
    assert!(matches!(
        fs.open_blob(&wrong_digest),
        Err(SealError::NotFound)
    ));
    assert_eq!(fs.allocated_blocks(), 0);
    assert_eq!(fs.allocated_nodes(), 0);

    // The released space is immediately reusable.
    let probe = write_blob(&fs, &random_bytes(4, 4096));
    assert_eq!(read_blob(&fs, &probe).len(), 4096);
    fs.shutdown().expect("shutdown");
}

#[test]
fn concurrent_lookups_share_one_vnode() {
    let device = fresh_device(16);
    let fs = format_and_mount(&device, MountOptions::default());
    let digest = write_blob(&fs, &random_bytes(5, 8192));

    let first = fs.open_blob(&digest).expect("open");
    let second = fs.open_blob(&digest).expect("open");
    assert!(Arc::ptr_eq(&first, &second));
    fs.close_blob(&first).expect("close");
    fs.close_blob(&second).expect("close");
    fs.shutdown().expect("shutdown");
}

#[test]
fn unlink_frees_all_space() {
    let device = fresh_device(16);
    let fs = format_and_mount(&device, MountOptions::default());

    let data = random_bytes(9, 100_000);
    let digest = write_blob(&fs, &data);
    assert!(fs.info().alloc_block_count > 0);

    fs.unlink(&digest).expect("unlink");
    fs.sync_blocking().expect("sync");

    assert!(matches!(fs.open_blob(&digest), Err(SealError::NotFound)));
    assert_eq!(readdir_all(&fs), Vec::<String>::new());
    let info = fs.info();
    assert_eq!(info.alloc_block_count, 0);
    assert_eq!(info.alloc_inode_count, 0);
    assert_eq!(fs.allocated_blocks(), 0);
    assert_eq!(fs.allocated_nodes(), 0);

    assert!(matches!(fs.unlink(&digest), Err(SealError::NotFound)));
    fs.shutdown().expect("shutdown");
}

#[test]
fn unlink_defers_until_last_close() {
    let device = fresh_device(16);
    let fs = format_and_mount(&device, MountOptions::default());
    let data = random_bytes(13, 16_384);
    let digest = write_blob(&fs, &data);

    let blob = fs.open_blob(&digest).expect("open");
    fs.unlink(&digest).expect("unlink");

    // Still readable through the surviving handle.
    let mut buf = vec![0_u8; data.len()];
    assert_eq!(blob.read_at(&mut buf, 0).expect("read"), data.len());
    assert_eq!(buf, data);

    fs.close_blob(&blob).expect("close");
    fs.sync_blocking().expect("sync");
    assert!(matches!(fs.open_blob(&digest), Err(SealError::NotFound)));
    assert_eq!(fs.info().alloc_block_count, 0);
    fs.shutdown().expect("shutdown");
}

#[test]
fn readable_event_signals_on_seal() {
    let device = fresh_device(16);
    let fs = format_and_mount(&device, MountOptions::default());

    let data = random_bytes(17, 32_768);
    let digest = merkle_root(&data);
    let blob = fs.create_blob(digest).expect("create");
    blob.space_allocate(data.len() as u64).expect("allocate");

    let event = blob.readable_event();
    assert!(!event.is_signalled());
    // The first request wins; later requests get the same event.
    assert!(Arc::ptr_eq(&event, &blob.readable_event()));

    blob.write_bytes(&data).expect("write");
    assert!(event.is_signalled());
    event.wait();
    fs.close_blob(&blob).expect("close");
    fs.shutdown().expect("shutdown");
}

#[test]
fn repeated_space_allocate_is_rejected() {
    let device = fresh_device(16);
    let fs = format_and_mount(&device, MountOptions::default());
    let blob = fs.create_blob(merkle_root(b"once")).expect("create");
    blob.space_allocate(128).expect("allocate");
    assert!(matches!(
        blob.space_allocate(128),
        Err(SealError::BadState)
    ));
    fs.close_blob(&blob).expect("close");
    fs.shutdown().expect("shutdown");
}

#[test]
fn open_during_write_returns_the_writer_vnode() {
    let device = fresh_device(16);
    let fs = format_and_mount(&device, MountOptions::default());
    let data = random_bytes(19, 8192);
    let digest = merkle_root(&data);

    let writer = fs.create_blob(digest).expect("create");
    writer.space_allocate(data.len() as u64).expect("allocate");

    let reader = fs.open_blob(&digest).expect("open in-flight");
    assert!(Arc::ptr_eq(&writer, &reader));
    let mut buf = [0_u8; 8];
    assert!(matches!(
        reader.read_at(&mut buf, 0),
        Err(SealError::BadState)
    ));

    writer.write_bytes(&data).expect("write");
    assert_eq!(reader.read_at(&mut buf, 0).expect("read"), 8);
    fs.close_blob(&writer).expect("close");
    fs.close_blob(&reader).expect("close");
    fs.shutdown().expect("shutdown");
}

#[test]
fn clones_read_the_verified_data() {
    let device = fresh_device(16);
    let fs = format_and_mount(&device, MountOptions::default());
    let data = random_bytes(29, 50_000);
    let digest = write_blob(&fs, &data);

    let blob = fs.open_blob(&digest).expect("open");
    let clone = blob.clone_data().expect("clone");
    assert_eq!(clone.len(), data.len());
    assert_eq!(clone.to_vec().expect("to_vec"), data);

    let mut tail = vec![0_u8; 100];
    let read = clone.read_at(&mut tail, data.len() - 50).expect("read");
    assert_eq!(read, 50);
    assert_eq!(&tail[..50], &data[data.len() - 50..]);

    let second = blob.clone_data().expect("second clone");
    drop(clone);
    assert_eq!(second.to_vec().expect("to_vec"), data);
    drop(second);

    fs.close_blob(&blob).expect("close");
    fs.shutdown().expect("shutdown");
}

#[test]
fn verify_blob_checks_every_allocated_node() {
    let device = fresh_device(16);
    let fs = format_and_mount(&device, MountOptions::default());
    write_blob(&fs, &random_bytes(31, 40_000));
    write_blob(&fs, &random_bytes(37, 9_000));

    let mut verified = 0;
    for index in 0..fs.info().inode_count {
        match fs.verify_blob(index as u32) {
            Ok(()) => verified += 1,
            Err(SealError::InvalidArgs) => {}
            Err(err) => panic!("unexpected verify error: {err}"),
        }
    }
    assert_eq!(verified, 2);
    fs.shutdown().expect("shutdown");
}

#[test]
fn metrics_count_operations() {
    let device = fresh_device(16);
    let options = MountOptions {
        metrics: true,
        ..MountOptions::default()
    };
    let fs = format_and_mount(&device, options);

    let data = random_bytes(41, 30_000);
    let digest = write_blob(&fs, &data);
    read_blob(&fs, &digest);

    let snapshot = fs.metrics_snapshot();
    assert_eq!(snapshot.blobs_created, 1);
    assert_eq!(snapshot.blobs_created_total_size, 30_000);
    assert!(snapshot.blobs_opened >= 1);
    assert_eq!(snapshot.data_bytes_written, 30_000);
    assert!(snapshot.bytes_read_from_disk > 0);
    assert!(snapshot.blobs_verified >= 1);
    fs.shutdown().expect("shutdown");
}

#[test]
fn tiny_writeback_queue_forces_pagination() {
    let device = fresh_device(32);
    let options = MountOptions {
        writeback_buffer_size: 16 * u64::from(BLOCK_SIZE),
        ..MountOptions::default()
    };
    let fs = format_and_mount(&device, options);

    let data = random_bytes(43, 1024 * 1024);
    let digest = write_blob(&fs, &data);
    assert_eq!(read_blob(&fs, &digest), data);
    fs.shutdown().expect("shutdown");
}

#[test]
fn many_blobs_enumerate_in_node_order() {
    let device = fresh_device(32);
    let fs = format_and_mount(&device, MountOptions::default());

    let mut digests = Vec::new();
    for seed in 0..20_u64 {
        digests.push(write_blob(&fs, &random_bytes(seed + 100, 3000 + seed as usize)));
    }
    // A small capacity forces several cursor round trips.
    let mut cursor = DirCursor::default();
    let mut names = Vec::new();
    loop {
        let batch = fs.readdir(&mut cursor, 256).expect("readdir");
        if batch.is_empty() {
            break;
        }
        assert!(batch.len() <= 3);
        names.extend(batch);
    }
    let expected: Vec<String> = digests.iter().map(|d| d.to_hex()).collect();
    assert_eq!(names, expected);
    fs.shutdown().expect("shutdown");
}
