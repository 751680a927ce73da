use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use deltapatch::binary_diff::{encode_file, EncodeOptions};
use deltapatch::binary_patch::{decode_file, info, DecodeOptions};
use deltapatch::checksum::{md5_file, Checksum};
use deltapatch::patch_format::{DeltaFlags, Instruction, Revision, MAGIC_LEN, MAGIC_PREVIOUS};
use deltapatch::Error;
use tempfile::TempDir;

struct Scratch {
    dir: TempDir,
}

impl Scratch {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    fn file(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

fn encode(from: &Path, to: &Path, out: &Path, level: i32) {
    let opts = EncodeOptions {
        level,
        ..Default::default()
    };
    encode_file(from, to, out, &opts).unwrap();
}

fn decode(archive: &Path, from: &Path, out: &Path) -> deltapatch::Result<Vec<u8>> {
    decode_file(archive, from, out, &DecodeOptions::default())?;
    Ok(fs::read(out).unwrap())
}

/// Two megabytes of deterministic, poorly compressible bytes.
fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

#[test]
fn test_scenario_copy_then_insert() {
    let s = Scratch::new();
    let from = s.file("from", b"AAAAABBBBB");
    let to = s.file("to", b"AAAAACCCCC");
    let archive = s.path("delta");
    encode(&from, &to, &archive, 3);

    let meta = info(&archive).unwrap();
    assert_eq!(
        meta.control.instructions,
        vec![
            Instruction::Copy {
                source: 1,
                offset: 0,
                length: 5
            },
            Instruction::Insert { length: 5 },
        ]
    );
    assert_eq!(meta.control.to_checksum, Checksum::of(b"AAAAACCCCC"));

    let out = s.path("out");
    assert_eq!(decode(&archive, &from, &out).unwrap(), b"AAAAACCCCC");
    assert_eq!(md5_file(&out).unwrap(), Checksum::of(b"AAAAACCCCC"));
}

#[test]
fn test_previous_revision_without_trailing_magic() {
    let s = Scratch::new();
    let from = s.file("from", b"the previous revision of the archive format");
    let to = s.file("to", b"the previous revision of the delta format");
    let archive = s.path("delta");
    encode(&from, &to, &archive, 3);

    let mut bytes = fs::read(&archive).unwrap();
    bytes[..MAGIC_LEN].copy_from_slice(MAGIC_PREVIOUS);
    bytes.truncate(bytes.len() - MAGIC_LEN);
    let old = s.file("old-delta", &bytes);

    assert_eq!(info(&old).unwrap().revision, Revision::Previous);
    assert_eq!(
        decode(&old, &from, &s.path("out")).unwrap(),
        b"the previous revision of the delta format"
    );
}

#[test]
fn test_retired_and_unknown_magic() {
    let s = Scratch::new();
    let from = s.file("from", b"0123456789");
    let to = s.file("to", b"01234567890123456789");
    let archive = s.path("delta");
    encode(&from, &to, &archive, 3);
    let bytes = fs::read(&archive).unwrap();

    for retired in [b"%DPZ001%", b"%DPZ000%"] {
        let mut old = bytes.clone();
        old[..MAGIC_LEN].copy_from_slice(retired);
        let path = s.file("retired", &old);
        assert!(matches!(info(&path), Err(Error::UnsupportedVersion(_))));
    }

    let mut junk = bytes.clone();
    junk[..MAGIC_LEN].copy_from_slice(b"%XDZ004%");
    let path = s.file("junk", &junk);
    assert!(matches!(info(&path), Err(Error::BadMagic(_))));

    let out = s.path("out");
    assert!(matches!(decode(&path, &from, &out), Err(Error::BadMagic(_))));
    assert!(!out.exists());
}

#[test]
fn test_every_control_byte_is_tamper_evident() {
    let s = Scratch::new();
    let from = s.file("from", b"version one of a small config file\nkey=value\n");
    let to = s.file("to", b"version two of a small config file\nkey=other\n");
    let archive = s.path("delta");
    encode(&from, &to, &archive, 0);

    let bytes = fs::read(&archive).unwrap();
    let trailer = 4 + MAGIC_LEN;
    let offset_at = bytes.len() - trailer;
    let control_offset = u32::from_be_bytes(bytes[offset_at..offset_at + 4].try_into().unwrap()) as usize;
    assert!(control_offset < offset_at);

    let out = s.path("out");
    for i in control_offset..offset_at {
        let mut tampered = bytes.clone();
        tampered[i] ^= 0x01;
        let path = s.file("tampered", &tampered);
        match decode(&path, &from, &out) {
            Err(Error::CorruptDelta { .. } | Error::ChecksumMismatch { .. }) => {}
            other => panic!("flipping byte {i} gave {other:?}"),
        }
        assert!(!out.exists());
    }
}

#[test]
fn test_header_flag_bits_are_tamper_evident() {
    let s = Scratch::new();
    let from = s.file("from", b"AAAAABBBBB");
    let to = s.file("to", b"AAAAACCCCC");
    let archive = s.path("delta");
    encode(&from, &to, &archive, 3);

    let bytes = fs::read(&archive).unwrap();
    let flags_low_byte = MAGIC_LEN + 3;
    let out = s.path("out");
    for bit in 0..8 {
        let mut tampered = bytes.clone();
        tampered[flags_low_byte] ^= 1 << bit;
        let path = s.file("tampered", &tampered);
        match decode(&path, &from, &out) {
            Err(Error::CorruptDelta { .. }) => {}
            other => panic!("flipping flag bit {bit} gave {other:?}"),
        }
        assert!(!out.exists());
    }
}

#[test]
fn test_from_differing_outside_copied_bytes_still_decodes() {
    let s = Scratch::new();
    let from = s.file("from", b"AAAAABBBBB");
    let to = s.file("to", b"AAAAACCCCC");
    let archive = s.path("delta");
    encode(&from, &to, &archive, 3);

    fs::write(&from, b"AAAAABBBBX").unwrap();
    let out = s.path("out");
    let report = decode_file(&archive, &from, &out, &DecodeOptions::default()).unwrap();
    assert!(report.from_mismatch);
    assert_eq!(report.to_len, 10);
    assert_eq!(fs::read(&out).unwrap(), b"AAAAACCCCC");
}

#[test]
fn test_truncated_archive_is_corrupt() {
    let s = Scratch::new();
    let from = s.file("from", &noise(10_000, 1));
    let to = s.file("to", &noise(12_000, 1));
    let archive = s.path("delta");
    encode(&from, &to, &archive, 3);

    let bytes = fs::read(&archive).unwrap();
    let short = s.file("short", &bytes[..bytes.len() / 2]);
    assert!(decode(&short, &from, &s.path("out")).is_err());
}

#[test]
fn test_wrong_from_file_fails_without_output() {
    let s = Scratch::new();
    let base = noise(50_000, 7);
    let mut edited = base.clone();
    edited[25_000..25_100].fill(0);
    let from = s.file("from", &base);
    let to = s.file("to", &edited);
    let archive = s.path("delta");
    encode(&from, &to, &archive, 3);

    let stranger = s.file("stranger", &noise(50_000, 8));
    let out = s.path("out");
    assert!(decode(&archive, &stranger, &out).is_err());
    assert!(!out.exists());
}

#[test]
fn test_existing_output_survives_failed_decode() {
    let s = Scratch::new();
    let from = s.file("from", b"abc");
    let archive = s.file("not-a-delta", b"definitely not an archive at all");
    let out = s.file("out", b"keep me");
    assert!(decode(&archive, &from, &out).is_err());
    assert_eq!(fs::read(&out).unwrap(), b"keep me");
}

#[test]
fn test_block_moves_across_pages_under_memory_ceiling() {
    let s = Scratch::new();
    let a = noise(1 << 20, 11);
    let b = noise(1 << 20, 12);
    let c = noise(1 << 20, 13);
    let from = s.file("from", &[a.clone(), b.clone(), c.clone()].concat());
    let target = [c, b"inserted in the middle".to_vec(), a, b].concat();
    let to = s.file("to", &target);

    let archive = s.path("delta");
    let opts = EncodeOptions {
        max_pages: 1,
        ..Default::default()
    };
    let report = encode_file(&from, &to, &archive, &opts).unwrap();
    assert!(report.literal_length < 4096);
    assert!(report.archive_len < 64 * 1024);

    let meta = info(&archive).unwrap();
    let from_info = &meta.control.sources[meta.control.from_source().unwrap()];
    assert!(!from_info.sequential);

    let out = s.path("out");
    let decode_opts = DecodeOptions {
        max_pages: 1,
        pristine: false,
    };
    decode_file(&archive, &from, &out, &decode_opts).unwrap();
    assert_eq!(fs::read(&out).unwrap(), target);
}

#[test]
fn test_compressed_inputs_are_diffed_by_content() {
    let s = Scratch::new();
    let text: Vec<u8> = (0..4000).flat_map(|i| format!("line {i}\n").into_bytes()).collect();
    let mut edited = text.clone();
    edited.extend_from_slice(b"one more line\n");

    let compress = |name: &str, data: &[u8]| {
        let path = s.path(name);
        let mut encoder = zstd::stream::write::Encoder::new(fs::File::create(&path).unwrap(), 19).unwrap();
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap();
        path
    };
    let from = compress("from.zst", &text);
    let to = compress("to.zst", &edited);

    let archive = s.path("delta");
    let report = encode_file(&from, &to, &archive, &EncodeOptions::default()).unwrap();
    assert!(report.copy_length >= text.len() as u64 - 64);

    let meta = info(&archive).unwrap();
    assert!(meta.flags.contains(DeltaFlags::FROM_COMPRESSED));
    assert!(meta.flags.contains(DeltaFlags::TO_COMPRESSED));

    let out = s.path("out.zst");
    decode_file(&archive, &from, &out, &DecodeOptions::default()).unwrap();
    let rebuilt = zstd::stream::decode_all(fs::File::open(&out).unwrap()).unwrap();
    assert_eq!(rebuilt, edited);
}

#[test]
fn test_no_verify_flag_is_recorded() {
    let s = Scratch::new();
    let from = s.file("from", b"some bytes to start from");
    let to = s.file("to", b"some other bytes to end with");
    let archive = s.path("delta");
    let opts = EncodeOptions {
        no_verify: true,
        ..Default::default()
    };
    encode_file(&from, &to, &archive, &opts).unwrap();
    assert!(info(&archive).unwrap().flags.contains(DeltaFlags::NO_VERIFY));
    assert_eq!(decode(&archive, &from, &s.path("out")).unwrap(), b"some other bytes to end with");
}
