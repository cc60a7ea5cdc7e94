#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use sealfs::{format, FormatOptions, MountOptions, SealFs};
use sealfs_block::MemoryByteDevice;
use sealfs_merkle::{merkle_root, Digest};
use std::sync::Arc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A fresh in-memory device of `mib` mebibytes.
pub fn fresh_device(mib: usize) -> MemoryByteDevice {
    MemoryByteDevice::new(mib * 1024 * 1024)
}

pub fn mount(device: &MemoryByteDevice, options: MountOptions) -> Arc<SealFs> {
    SealFs::mount(Arc::new(device.clone()), None, options).expect("mount")
}

pub fn format_and_mount(device: &MemoryByteDevice, options: MountOptions) -> Arc<SealFs> {
    format(device, &FormatOptions::default()).expect("format");
    mount(device, options)
}

pub fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = vec![0_u8; len];
    rng.fill_bytes(&mut out);
    out
}

/// Write a blob under its content digest, close it, and wait for
/// durability.
pub fn write_blob(fs: &Arc<SealFs>, data: &[u8]) -> Digest {
    let digest = merkle_root(data);
    let blob = fs.create_blob(digest).expect("create blob");
    blob.space_allocate(data.len() as u64).expect("allocate");
    for chunk in data.chunks(128 * 1024) {
        blob.write_bytes(chunk).expect("write");
    }
    fs.close_blob(&blob).expect("close");
    fs.sync_blocking().expect("sync");
    digest
}

pub fn read_blob(fs: &Arc<SealFs>, digest: &Digest) -> Vec<u8> {
    let blob = fs.open_blob(digest).expect("open blob");
    let mut out = vec![0_u8; blob.size() as usize];
    let read = blob.read_at(&mut out, 0).expect("read");
    assert_eq!(read, out.len());
    fs.close_blob(&blob).expect("close");
    out
}
