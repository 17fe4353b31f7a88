//! End-to-end encoder scenarios checked at the byte level.

use fleece::encoder::Encoder;
use fleece::writer::Writer;

fn encode(build: impl FnOnce(&mut Encoder<'_>)) -> Vec<u8> {
    let mut out = Writer::new();
    let mut enc = Encoder::new(&mut out);
    build(&mut enc);
    enc.end().unwrap();
    drop(enc);
    out.into_inner()
}

/// Resolve the document trailer to the root value's position.
fn root_pos(doc: &[u8]) -> usize {
    assert!(doc.len() >= 2 && doc.len() % 2 == 0);
    let at = doc.len() - 2;
    let word = u16::from_be_bytes([doc[at], doc[at + 1]]);
    if word & 0x8000 != 0 {
        at - (word & 0x7FFF) as usize * 2
    } else {
        at
    }
}

/// Parse a container header: (count, wide, first slot position).
fn container_header(doc: &[u8], pos: usize) -> (u32, bool, usize) {
    let count = (u32::from(doc[pos] & 0x07) << 8) | u32::from(doc[pos + 1]);
    let wide = doc[pos] & 0x08 != 0;
    (count, wide, pos + 2)
}

#[test]
fn test_empty_dict_is_two_bytes() {
    let doc = encode(|e| {
        e.begin_dict(0).unwrap();
        e.end_dict().unwrap();
    });
    assert_eq!(doc, [0x70, 0x00]);
    assert_eq!(root_pos(&doc), 0);
}

#[test]
fn test_single_short_int() {
    let doc = encode(|e| e.write_int(42).unwrap());
    assert_eq!(doc, [0x00, 0x2A]);
    assert_eq!(root_pos(&doc), 0);
}

#[test]
fn test_repeated_key_is_interned_once() {
    let doc = encode(|e| {
        e.begin_dict(2).unwrap();
        e.write_key("hello").unwrap();
        e.write_int(1).unwrap();
        e.write_key("hello").unwrap();
        e.write_int(2).unwrap();
        e.end_dict().unwrap();
    });
    assert_eq!(
        doc,
        [
            0x45, b'h', b'e', b'l', b'l', b'o', // single body copy
            0x70, 0x02, // dict header, count 2
            0x80, 0x04, 0x00, 0x01, // key ptr -> 0, value 1
            0x80, 0x06, 0x00, 0x02, // key ptr -> 0, value 2 (stable order)
            0x80, 0x05, // trailer -> dict header
        ]
    );
    let body_copies = doc.windows(5).filter(|w| w == b"hello").count();
    assert_eq!(body_copies, 1);
    assert_eq!(root_pos(&doc), 6);
}

#[test]
fn test_repeated_string_values_share_one_body() {
    let doc = encode(|e| {
        e.begin_array(10).unwrap();
        for _ in 0..10 {
            e.write_string("shared").unwrap();
        }
        e.end_array().unwrap();
    });
    let body_copies = doc.windows(6).filter(|w| w == b"shared").count();
    assert_eq!(body_copies, 1);
}

#[test]
fn test_unique_strings_off_duplicates_bodies() {
    let doc = encode(|e| {
        e.set_unique_strings(false).unwrap();
        e.begin_array(2).unwrap();
        e.write_string("twice").unwrap();
        e.write_string("twice").unwrap();
        e.end_array().unwrap();
    });
    let body_copies = doc.windows(5).filter(|w| w == b"twice").count();
    assert_eq!(body_copies, 2);
}

#[test]
fn test_long_strings_are_not_interned() {
    // 16 bytes is past the shareable window
    let s = "abcdefghijklmnop";
    let doc = encode(|e| {
        e.begin_array(2).unwrap();
        e.write_string(s).unwrap();
        e.write_string(s).unwrap();
        e.end_array().unwrap();
    });
    let body_copies = doc.windows(s.len()).filter(|w| *w == s.as_bytes()).count();
    assert_eq!(body_copies, 2);
}

#[test]
fn test_sorted_keys() {
    let doc = encode(|e| {
        e.begin_dict(2).unwrap();
        e.write_key("beta").unwrap();
        e.write_int(1).unwrap();
        e.write_key("alpha").unwrap();
        e.write_int(2).unwrap();
        e.end_dict().unwrap();
    });
    assert_eq!(
        doc,
        [
            0x44, b'b', b'e', b't', b'a', 0x00, // "beta" body + pad
            0x45, b'a', b'l', b'p', b'h', b'a', // "alpha" body
            0x70, 0x02, // dict header
            0x80, 0x04, 0x00, 0x02, // "alpha" first
            0x80, 0x09, 0x00, 0x01, // then "beta"
            0x80, 0x05, // trailer
        ]
    );
}

#[test]
fn test_sorted_keys_mix_inline_and_stream() {
    // "b" packs inline, "aa" goes out of line; sorting must compare both
    let doc = encode(|e| {
        e.begin_dict(2).unwrap();
        e.write_key("b").unwrap();
        e.write_int(1).unwrap();
        e.write_key("aa").unwrap();
        e.write_int(2).unwrap();
        e.end_dict().unwrap();
    });
    let root = root_pos(&doc);
    let (count, wide, slots) = container_header(&doc, root);
    assert_eq!(count, 2);
    assert!(!wide);
    // first key slot must be the pointer to "aa"
    let first_key = u16::from_be_bytes([doc[slots], doc[slots + 1]]);
    assert!(first_key & 0x8000 != 0);
    let target = slots - (first_key & 0x7FFF) as usize * 2;
    assert_eq!(&doc[target..target + 3], &[0x42, b'a', b'a']);
    // second key slot is the inline "b"
    assert_eq!(&doc[slots + 4..slots + 6], &[0x41, b'b']);
}

#[test]
fn test_sort_disabled_preserves_write_order() {
    let doc = encode(|e| {
        e.set_sort_keys(false).unwrap();
        e.begin_dict(2).unwrap();
        e.write_key("b").unwrap();
        e.write_int(1).unwrap();
        e.write_key("a").unwrap();
        e.write_int(2).unwrap();
        e.end_dict().unwrap();
    });
    let root = root_pos(&doc);
    let (_, _, slots) = container_header(&doc, root);
    assert_eq!(&doc[slots..slots + 2], &[0x41, b'b']);
    assert_eq!(&doc[slots + 4..slots + 6], &[0x41, b'a']);
}

#[test]
fn test_wide_pointer_promotion() {
    let blob = vec![0u8; 70000];
    let doc = encode(|e| {
        e.begin_array(2).unwrap();
        e.write_data(&blob).unwrap();
        e.write_int(0).unwrap();
        e.end_array().unwrap();
    });
    // binary header: nibble saturated + varint(70000) + payload
    assert_eq!(doc[0], 0x5F);
    assert_eq!(&doc[1..4], &[0xF0, 0xA2, 0x04]);

    let root = root_pos(&doc);
    assert_eq!(root, 70004);
    let (count, wide, slots) = container_header(&doc, root);
    assert_eq!(count, 2);
    assert!(wide, "a >64K back-pointer must widen the array");

    // the first wide slot points back to the blob at position 0
    let word = u32::from_be_bytes(doc[slots..slots + 4].try_into().unwrap());
    assert!(word & 0x8000_0000 != 0);
    assert_eq!(slots - (word & 0x7FFF_FFFF) as usize * 2, 0);
    // narrow scalars widen to four zero-padded bytes
    assert_eq!(&doc[slots + 4..slots + 8], &[0x00, 0x00, 0x00, 0x00]);
}

#[test]
fn test_large_count_gets_varint() {
    let doc = encode(|e| {
        e.begin_array(4100).unwrap();
        for i in 0..4100 {
            e.write_int(i & 0x7FF).unwrap();
        }
        e.end_array().unwrap();
    });
    // header count saturates at 0x7FF; the varint carries the real count
    assert_eq!(&doc[..4], &[0x67, 0xFF, 0x84, 0x20]);
    assert_eq!(doc.len(), 4 + 4100 * 2 + 2);
    assert_eq!(root_pos(&doc), 0);
}

#[test]
fn test_deep_nesting_round_trips_depth() {
    let doc = encode(|e| {
        for _ in 0..64 {
            e.begin_array(1).unwrap();
        }
        e.write_int(1).unwrap();
        for _ in 0..64 {
            e.end_array().unwrap();
        }
    });
    // walk down: every level is a one-element array whose slot leads deeper
    let mut pos = root_pos(&doc);
    for _ in 0..64 {
        let (count, wide, slots) = container_header(&doc, pos);
        assert_eq!(count, 1);
        assert!(!wide);
        let word = u16::from_be_bytes([doc[slots], doc[slots + 1]]);
        if word & 0x8000 != 0 {
            pos = slots - (word & 0x7FFF) as usize * 2;
        } else {
            assert_eq!(word, 0x0001); // innermost short int
            return;
        }
    }
    let innermost = u16::from_be_bytes([doc[pos], doc[pos + 1]]);
    assert_eq!(innermost, 0x0001);
}

#[test]
fn test_key_table_snapshot() {
    let doc = encode(|e| {
        e.begin_array(2).unwrap();
        e.begin_dict(2).unwrap();
        e.write_key("first").unwrap();
        e.write_int(1).unwrap();
        e.write_key("second").unwrap();
        e.write_string("first").unwrap(); // value use does not add a key
        e.end_dict().unwrap();
        e.write_key_table().unwrap();
        e.end_array().unwrap();
    });

    let root = root_pos(&doc);
    let (count, _, slots) = container_header(&doc, root);
    assert_eq!(count, 2);

    // second element of the root array is the key table
    let word = u16::from_be_bytes([doc[slots + 2], doc[slots + 3]]);
    assert!(word & 0x8000 != 0);
    let table_pos = slots + 2 - (word & 0x7FFF) as usize * 2;
    let (table_len, wide, entries) = container_header(&doc, table_pos);
    assert!(!wide);
    assert!(table_len >= 2);

    let mut nulls = 0;
    let mut pointers = 0;
    for i in 0..table_len as usize {
        let at = entries + 2 * i;
        let word = u16::from_be_bytes([doc[at], doc[at + 1]]);
        if word & 0x8000 != 0 {
            // a key string, deduplicated into a back-pointer
            let target = at - (word & 0x7FFF) as usize * 2;
            assert_eq!(doc[target] >> 4, 0x4, "key table entries are strings");
            pointers += 1;
        } else {
            assert_eq!(word, 0x3000); // null filler
            nulls += 1;
        }
    }
    assert_eq!(pointers, 2, "both dict keys appear");
    assert_eq!(nulls, table_len - 2);
}

#[test]
fn test_wide_root_gets_narrow_trailer() {
    let doc = encode(|e| e.write_int(4660).unwrap()); // 0x1234, 2-byte body
    assert_eq!(doc, [0x11, 0x34, 0x12, 0x00, 0x80, 0x02]);
    assert_eq!(root_pos(&doc), 0);
}

#[test]
fn test_huge_top_level_blob_widens_root() {
    let blob = vec![0xAB; 70000];
    let doc = encode(|e| e.write_data(&blob).unwrap());
    // narrow trailer -> wide root pointer -> blob header
    let at = doc.len() - 2;
    let trailer = u16::from_be_bytes([doc[at], doc[at + 1]]);
    assert_eq!(trailer, 0x8002);
    let root = at - 4;
    let word = u32::from_be_bytes(doc[root..root + 4].try_into().unwrap());
    assert!(word & 0x8000_0000 != 0);
    assert_eq!(root - (word & 0x7FFF_FFFF) as usize * 2, 0);
    assert_eq!(doc[0], 0x5F);
}

#[test]
fn test_every_out_of_line_value_starts_even() {
    // odd-length bodies force pad bytes; all back-pointer targets stay even
    let doc = encode(|e| {
        e.begin_array(3).unwrap();
        e.write_string("odd").unwrap();
        e.write_data(&[1, 2, 3, 4, 5]).unwrap();
        e.write_double(2.25).unwrap();
        e.end_array().unwrap();
    });
    let root = root_pos(&doc);
    assert_eq!(root % 2, 0);
    let (count, wide, slots) = container_header(&doc, root);
    assert_eq!(count, 3);
    assert!(!wide);
    for i in 0..3 {
        let at = slots + 2 * i;
        let word = u16::from_be_bytes([doc[at], doc[at + 1]]);
        assert!(word & 0x8000 != 0);
        let target = at - (word & 0x7FFF) as usize * 2;
        assert_eq!(target % 2, 0, "value {i} starts on an odd offset");
        assert!(target < at);
    }
}
