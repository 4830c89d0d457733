//! Literal end-to-end scenarios from the on-media format specification,
//! run against the in-memory mock device.

use nandfs::fs::Filesystem;
use nandfs::geometry::Geometry;
use nandfs::media::ram::RamFlash;

fn small_geometry() -> Geometry {
    Geometry {
        sector_size: 64,
        sectors_per_page: 2,
        pages_per_block: 4,
        num_blocks: 32,
        max_fname_len: 16,
        prealloc_size: 3,
    }
}

fn mounted() -> Filesystem<RamFlash> {
    let geometry = small_geometry();
    let mut fs = Filesystem::new(RamFlash::new(geometry));
    fs.format().unwrap();
    fs.mount().unwrap();
    fs
}

#[test]
fn write_then_read_round_trips_a_thousand_bytes() {
    let mut fs = mounted();
    let data: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();

    let w = fs.open_write(b"a").unwrap();
    assert_eq!(fs.write(w, &data).unwrap(), data.len());
    fs.close_write(w).unwrap();

    let r = fs.open_read(b"a").unwrap();
    let mut buf = vec![0u8; data.len()];
    let mut total = 0;
    while total < buf.len() {
        let n = fs.read(r, &mut buf[total..]).unwrap();
        assert!(n > 0, "read returned 0 before buffer was filled");
        total += n;
    }
    fs.close_read(r).unwrap();
    assert_eq!(buf, data);
}

#[test]
fn successive_writes_concatenate() {
    let mut fs = mounted();
    let w = fs.open_write(b"greeting").unwrap();
    assert_eq!(fs.write(w, b"hello").unwrap(), 5);
    assert_eq!(fs.write(w, b" world").unwrap(), 6);
    fs.close_write(w).unwrap();

    let r = fs.open_read(b"greeting").unwrap();
    let mut buf = [0u8; 11];
    let mut total = 0;
    while total < buf.len() {
        total += fs.read(r, &mut buf[total..]).unwrap();
    }
    assert_eq!(&buf, b"hello world");
    assert_eq!(fs.read(r, &mut [0u8; 1]).unwrap(), 0);
}

#[test]
fn ls_preserves_insertion_order_and_skips_removed() {
    let mut fs = mounted();
    for name in ["one", "two", "three", "four", "five"] {
        let w = fs.open_write(name.as_bytes()).unwrap();
        fs.write(w, name.as_bytes()).unwrap();
        fs.close_write(w).unwrap();
    }
    fs.rm(b"three").unwrap();

    let names: Vec<String> = fs.start_ls().unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(names, vec!["one", "two", "four", "five"]);

    assert!(fs.open_read(b"three").is_err());
}

#[test]
fn rm_is_idempotent_and_missing_name_succeeds() {
    let mut fs = mounted();
    let w = fs.open_write(b"gone").unwrap();
    fs.write(w, b"x").unwrap();
    fs.close_write(w).unwrap();

    fs.rm(b"gone").unwrap();
    fs.rm(b"gone").unwrap();
    fs.rm(b"never-existed").unwrap();
}

#[test]
fn format_mount_ls_is_empty() {
    let mut fs = mounted();
    let names: Vec<String> = fs.start_ls().unwrap().map(|r| r.unwrap()).collect();
    assert!(names.is_empty());
}

#[test]
fn filename_at_the_limit_is_rejected_one_under_succeeds() {
    let mut fs = mounted();
    let max = fs.geometry().max_fname_len as usize;

    let too_long = vec![b'x'; max];
    assert!(fs.open_write(&too_long).is_err());

    let fits = vec![b'y'; max - 1];
    let w = fs.open_write(&fits).unwrap();
    fs.close_write(w).unwrap();
}

#[test]
fn file_spanning_several_blocks_reads_back_in_mixed_chunk_sizes() {
    let mut fs = mounted();
    // Five data sectors/block at 64 bytes each; this spans at least three
    // blocks without relying on the allocator's exact placement order.
    let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();

    let w = fs.open_write(b"big").unwrap();
    let mut written = 0;
    while written < data.len() {
        written += fs.write(w, &data[written..]).unwrap();
    }
    fs.close_write(w).unwrap();

    let r = fs.open_read(b"big").unwrap();
    let mut buf = Vec::with_capacity(data.len());
    let mut scratch = [0u8; 17]; // deliberately not a multiple of sector size
    loop {
        let n = fs.read(r, &mut scratch).unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&scratch[..n]);
    }
    assert_eq!(buf, data);
}

#[test]
fn remount_after_clean_close_preserves_directory_and_contents() {
    let geometry = small_geometry();
    let device = RamFlash::new(geometry);
    let mut fs = Filesystem::new(device);
    fs.format().unwrap();
    fs.mount().unwrap();
    let w = fs.open_write(b"persisted").unwrap();
    fs.write(w, b"still here").unwrap();
    fs.close_write(w).unwrap();
    let device = fs.into_device();

    let mut fs = Filesystem::new(device);
    fs.mount().unwrap();
    let r = fs.open_read(b"persisted").unwrap();
    let mut buf = [0u8; 10];
    let mut total = 0;
    while total < buf.len() {
        total += fs.read(r, &mut buf[total..]).unwrap();
    }
    assert_eq!(&buf, b"still here");
}
