//! Path parsing and compression

use pagefs::fs::path::{display_path, parse_compressed};
use pagefs::fs::{compress, parse_path, PathEntry};
use pagefs::storage::page_constants::{EXT_MAX_FILE, EXT_UNKNOWN};
use pagefs::Error;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn name(text: &str, ext: u8) -> PathEntry {
    let mut padded = [b' '; 4];
    padded[..text.len()].copy_from_slice(text.as_bytes());
    PathEntry::named(padded, ext)
}

#[test]
fn test_legal_paths() {
    assert_eq!(
        parse_path("A/BB/CCC.5").unwrap(),
        vec![name("A", EXT_UNKNOWN), name("BB", EXT_UNKNOWN), name("CCC", 5)]
    );
    assert_eq!(parse_path("/ZZZZ.102/").unwrap(), vec![name("ZZZZ", 102)]);
    assert!(parse_path("").unwrap().is_empty());
    assert!(parse_path("/").unwrap().is_empty());
}

#[test]
fn test_illegal_paths() {
    for bad in ["ABCDE", "A..B", "X.200", "A//B", "A.", ".5", "A.1x", "SP C", "A/\u{7f}"] {
        assert!(
            matches!(parse_path(bad), Err(Error::InvalidPath(_))),
            "{bad:?} should be rejected"
        );
    }
}

#[test]
fn test_compress() {
    let compressed = parse_compressed("/A/./B/../C.1").unwrap();
    assert_eq!(compressed, vec![name("A", EXT_UNKNOWN), name("C", 1)]);
    assert_eq!(display_path(&compressed), "/A/C.1");

    assert_eq!(compress(&parse_path("A/..").unwrap()).unwrap(), vec![]);
    assert!(matches!(
        compress(&parse_path("..").unwrap()),
        Err(Error::InvalidPath(_))
    ));
    assert_eq!(display_path(&[]), "/");
}

fn segment() -> impl Strategy<Value = String> {
    ("[A-Z0-9_]{1,4}", proptest::option::of(0..=EXT_MAX_FILE)).prop_map(|(n, ext)| match ext {
        Some(ext) => format!("{n}.{ext}"),
        None => n,
    })
}

proptest! {
    #[test]
    fn prop_valid_paths_parse(segments in proptest::collection::vec(segment(), 1..6)) {
        let text = format!("/{}", segments.join("/"));
        let parsed = parse_path(&text).unwrap();
        prop_assert_eq!(parsed.len(), segments.len());
        prop_assert_eq!(display_path(&parsed), text);
    }

    #[test]
    fn prop_long_names_rejected(n in "[A-Z]{5,12}", ext in proptest::option::of(0u8..=EXT_MAX_FILE)) {
        let text = match ext {
            Some(ext) => format!("/{n}.{ext}"),
            None => format!("/{n}"),
        };
        prop_assert!(matches!(parse_path(&text), Err(Error::InvalidPath(_))));
    }

    #[test]
    fn prop_large_extensions_rejected(ext in 103u32..100_000) {
        let text = format!("/A.{ext}");
        prop_assert!(matches!(parse_path(&text), Err(Error::InvalidPath(_))));
    }
}
