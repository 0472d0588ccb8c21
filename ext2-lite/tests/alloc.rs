//! Tests for block and inode allocation invariants.
//!
//! These verify:
//! - bitmap population counts always match the descriptor free counts
//! - allocating then freeing restores bitmaps and counters bit-identically
//! - multi-block requests return contiguous runs
//! - exhaustion surfaces as out-of-space, and space comes back on free
//! - double frees and frees of metadata blocks are reported as corruption

mod common;

use common::*;
use ext2_lite::FsError;

/// Bitmap and descriptor agreement over every group of a synced image.
fn assert_counts_consistent(image: &[u8], p: &MkfsParams) {
    let groups = (p.blocks_count - 1).div_ceil(p.blocks_per_group);
    for g in 0..groups {
        let desc = desc_from_image(image, g as usize);
        let first = 1 + g * p.blocks_per_group;
        let blocks_in_group = p.blocks_per_group.min(p.blocks_count - first) as usize;

        let used_blocks = popcount(image, desc.block_bitmap.get(), blocks_in_group);
        assert_eq!(
            used_blocks,
            blocks_in_group - desc.free_blocks_count.get() as usize,
            "group {g} block bitmap vs descriptor"
        );

        let used_inodes = popcount(image, desc.inode_bitmap.get(), p.inodes_per_group as usize);
        assert_eq!(
            used_inodes,
            (p.inodes_per_group - desc.free_inodes_count.get() as u32) as usize,
            "group {g} inode bitmap vs descriptor"
        );
    }
}

fn sb_free_blocks(image: &[u8]) -> u32 {
    u32::from_le_bytes(image[1024 + 12..1024 + 16].try_into().unwrap())
}

#[test]
fn test_fresh_image_counts_consistent() {
    let p = MkfsParams::default();
    let disk = mkfs(&p);
    assert_counts_consistent(&disk.snapshot(), &p);
}

#[test]
fn test_counts_consistent_after_activity() {
    let p = MkfsParams::default();
    let (fs, disk, _clock) = mount_params(&p);
    let root = block_on(fs.root()).unwrap();

    block_on(async {
        let dir = fs.mkdir(&root, "d", 0o755, creds()).await.unwrap();
        for i in 0..30 {
            let name = format!("file{i}");
            let f = fs.create(&dir, &name, 0o644, creds()).await.unwrap();
            fs.write_at(&f, 0, b"payload").await.unwrap();
            fs.iput(f).await.unwrap();
        }
        for i in 0..10 {
            let name = format!("file{i}");
            fs.unlink(&dir, &name).await.unwrap();
        }
        fs.iput(dir).await.unwrap();
        fs.sync_fs().await.unwrap();
    });

    let image = disk.snapshot();
    assert_counts_consistent(&image, &p);

    // After a clean sync the superblock hint equals the descriptor sum.
    let sum: u32 = (0..2)
        .map(|g| desc_from_image(&image, g).free_blocks_count.get() as u32)
        .sum();
    assert_eq!(sb_free_blocks(&image), sum);
}

#[test]
fn test_alloc_free_cycle_restores_image() {
    let (fs, disk, _clock) = mount_default();
    let root = block_on(fs.root()).unwrap();

    block_on(fs.sync_fs()).unwrap();
    let before = disk.snapshot();

    block_on(async {
        let (first, count) = fs.new_blocks(&root, 4).await.unwrap();
        assert!(count >= 1 && count <= 4);
        fs.free_blocks(None, first, count).await.unwrap();
        fs.sync_fs().await.unwrap();
    });

    assert_eq!(disk.snapshot(), before);
}

#[test]
fn test_new_blocks_returns_contiguous_run() {
    let (fs, _disk, _clock) = mount_default();
    let root = block_on(fs.root()).unwrap();

    block_on(async {
        // On a fresh image the data area is unfragmented, so the greedy
        // extension takes the full request.
        let (first, count) = fs.new_blocks(&root, 8).await.unwrap();
        assert_eq!(count, 8);

        // The run is contiguous by construction: a second request starts
        // right after it.
        let (next, _) = fs.new_blocks(&root, 1).await.unwrap();
        assert_eq!(next, first + 8);

        fs.free_blocks(None, first, 8).await.unwrap();
        fs.free_blocks(None, next, 1).await.unwrap();
    });
}

#[test]
fn test_allocation_is_clamped_to_request_and_group() {
    let p = MkfsParams {
        blocks_count: 257,
        blocks_per_group: 256,
        inodes_per_group: 8,
        inode_size: 128,
    };
    let (fs, _disk, _clock) = mount_params(&p);
    let root = block_on(fs.root()).unwrap();

    block_on(async {
        let free = fs.statfs().unwrap().free_blocks;
        let mut total = 0u64;
        loop {
            match fs.new_blocks(&root, 64).await {
                Ok((_first, count)) => {
                    assert!(count >= 1 && count <= 64);
                    total += count as u64;
                }
                Err(FsError::NoSpace) => break,
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert_eq!(total, free);
        assert_eq!(fs.statfs().unwrap().free_blocks, 0);
    });
}

#[test]
fn test_statfs_tracks_allocation() {
    let (fs, _disk, _clock) = mount_default();
    let root = block_on(fs.root()).unwrap();

    let before = fs.statfs().unwrap().free_blocks;
    let (first, count) = block_on(fs.new_blocks(&root, 3)).unwrap();
    assert_eq!(fs.statfs().unwrap().free_blocks, before - count as u64);
    block_on(fs.free_blocks(None, first, count)).unwrap();
    assert_eq!(fs.statfs().unwrap().free_blocks, before);
}

#[test]
fn test_double_free_reports_corruption() {
    let (fs, _disk, _clock) = mount_default();
    let root = block_on(fs.root()).unwrap();

    let (block, _) = block_on(fs.new_blocks(&root, 1)).unwrap();
    block_on(fs.free_blocks(None, block, 1)).unwrap();
    let err = block_on(fs.free_blocks(None, block, 1)).unwrap_err();
    assert_eq!(err, FsError::Corrupted);
}

#[test]
fn test_freeing_metadata_blocks_is_refused() {
    let (fs, _disk, _clock) = mount_default();

    // Group 0's block bitmap block.
    assert_eq!(
        block_on(fs.free_blocks(None, 3, 1)).unwrap_err(),
        FsError::Corrupted
    );
    // The superblock itself.
    assert_eq!(
        block_on(fs.free_blocks(None, 1, 1)).unwrap_err(),
        FsError::Corrupted
    );
    // Out of range entirely.
    assert_eq!(
        block_on(fs.free_blocks(None, 20000, 1)).unwrap_err(),
        FsError::Corrupted
    );
}

#[test]
fn test_corrupt_block_bitmap_detected_on_load() {
    let p = MkfsParams::default();
    let disk = mkfs(&p);
    // Clear the bit covering group 0's inode table start (relative bit 4:
    // superblock, descriptor block, two bitmaps precede it).
    let bb = 3 * 1024;
    let mut byte = disk.snapshot()[bb];
    byte &= !(1 << 4);
    disk.patch(bb, &[byte]);

    let fs = block_on(ext2_lite::Ext2Fs::mount(
        std::sync::Arc::new(disk),
        "",
        test_clock(),
        false,
    ))
    .unwrap();
    let root = block_on(fs.root()).unwrap();
    let err = block_on(fs.new_blocks(&root, 1)).unwrap_err();
    assert_eq!(err, FsError::Corrupted);
}

#[test]
fn test_second_group_used_when_first_fills() {
    let p = MkfsParams {
        blocks_count: 513,
        blocks_per_group: 256,
        inodes_per_group: 8,
        inode_size: 128,
    };
    let (fs, _disk, _clock) = mount_params(&p);
    let root = block_on(fs.root()).unwrap();

    block_on(async {
        // Group 0 holds 250 free blocks, group 1 holds 251. Drain the
        // first group.
        loop {
            let free_before = fs.statfs().unwrap().free_blocks;
            let (_first, count) = fs.new_blocks(&root, 64).await.unwrap();
            if free_before - count as u64 == 251 {
                // Only group 1's blocks remain.
                break;
            }
        }
        // The next allocation must come from group 1's data area.
        let (first, _count) = fs.new_blocks(&root, 1).await.unwrap();
        assert!(first >= 257, "allocation {first} not in group 1");
    });
}
