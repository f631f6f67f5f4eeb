//! Structural walk over a v1 update before it reaches yrs.
//!
//! yrs trusts the wire when decoding: strings are taken as UTF-8 without
//! checking, nested `Any` values recurse without a depth limit, and a few
//! collections are sized from wire counts. A frame is walked here first,
//! with the same cursor primitives yrs uses, and rejected if any string is
//! not UTF-8, nesting is too deep, or a count exceeds the bytes left.
//!
//! ```text
//! update      = varu32 clients, client*, delete_set
//! client      = varu32 blocks, varu32 client_id, varu32 clock, block*
//! block       = u8 info, (gc | skip | item)
//! item        = [left id] [right id] [parent [parent_sub]] content(info & 0x0F)
//! delete_set  = varu32 clients, (varu32 client, ranges)*
//! ```

use std::str;

use yrs::block::{
    BLOCK_GC_REF_NUMBER, BLOCK_ITEM_ANY_REF_NUMBER, BLOCK_ITEM_BINARY_REF_NUMBER,
    BLOCK_ITEM_DELETED_REF_NUMBER, BLOCK_ITEM_DOC_REF_NUMBER, BLOCK_ITEM_EMBED_REF_NUMBER,
    BLOCK_ITEM_FORMAT_REF_NUMBER, BLOCK_ITEM_JSON_REF_NUMBER, BLOCK_ITEM_MOVE_REF_NUMBER,
    BLOCK_ITEM_STRING_REF_NUMBER, BLOCK_ITEM_TYPE_REF_NUMBER, BLOCK_SKIP_REF_NUMBER, HAS_ORIGIN,
    HAS_PARENT_SUB, HAS_RIGHT_ORIGIN,
};
use yrs::encoding::read::{Cursor, Error, Read};
use yrs::types::{
    TYPE_REFS_ARRAY, TYPE_REFS_DOC, TYPE_REFS_MAP, TYPE_REFS_TEXT, TYPE_REFS_UNDEFINED,
    TYPE_REFS_XML_ELEMENT, TYPE_REFS_XML_FRAGMENT, TYPE_REFS_XML_HOOK, TYPE_REFS_XML_TEXT,
};

/// Deepest `Any` array/map nesting accepted.
pub const MAX_ANY_DEPTH: usize = 64;

/// Check that `update` is a v1 update yrs can decode safely.
pub fn validate_update_v1(update: &[u8]) -> Result<(), Error> {
    let mut cursor = Cursor::new(update);

    let clients: u32 = cursor.read_var()?;
    bounded(&cursor, clients as u64, 3)?;
    for _ in 0..clients {
        let blocks: u32 = cursor.read_var()?;
        let _client: u32 = cursor.read_var()?;
        let _clock: u32 = cursor.read_var()?;
        bounded(&cursor, blocks as u64, 1)?;
        for _ in 0..blocks {
            block(&mut cursor)?;
        }
    }

    delete_set(&mut cursor)
}

/// Reject `count` entries of at least `min_len` bytes when fewer bytes remain.
fn bounded(cursor: &Cursor, count: u64, min_len: u64) -> Result<(), Error> {
    let remaining = (cursor.buf.len() - cursor.next) as u64;
    let needed = count.saturating_mul(min_len);
    if needed > remaining {
        return Err(Error::EndOfBuffer(needed.min(usize::MAX as u64) as usize));
    }
    Ok(())
}

fn string(cursor: &mut Cursor) -> Result<(), Error> {
    let bytes = cursor.read_buf()?;
    str::from_utf8(bytes)
        .map(|_| ())
        .map_err(|e| Error::Custom(format!("invalid UTF-8 in string field: {e}")))
}

fn id(cursor: &mut Cursor) -> Result<(), Error> {
    let _client: u32 = cursor.read_var()?;
    let _clock: u32 = cursor.read_var()?;
    Ok(())
}

fn block(cursor: &mut Cursor) -> Result<(), Error> {
    let info = cursor.read_u8()?;
    if info == BLOCK_SKIP_REF_NUMBER || info == BLOCK_GC_REF_NUMBER {
        let _len: u32 = cursor.read_var()?;
        return Ok(());
    }

    let has_origin = info & HAS_ORIGIN != 0;
    let has_right_origin = info & HAS_RIGHT_ORIGIN != 0;
    if has_origin {
        id(cursor)?;
    }
    if has_right_origin {
        id(cursor)?;
    }
    if !has_origin && !has_right_origin {
        let parent_info: u32 = cursor.read_var()?;
        if parent_info == 1 {
            string(cursor)?;
        } else {
            id(cursor)?;
        }
        if info & HAS_PARENT_SUB != 0 {
            string(cursor)?;
        }
    }

    content(cursor, info & 0b1111)
}

fn content(cursor: &mut Cursor, ref_number: u8) -> Result<(), Error> {
    match ref_number {
        BLOCK_ITEM_DELETED_REF_NUMBER => {
            let _len: u32 = cursor.read_var()?;
        }
        BLOCK_ITEM_JSON_REF_NUMBER => {
            // yrs reads `len + 1` strings here.
            let len: u32 = cursor.read_var()?;
            if len > i32::MAX as u32 {
                return Err(Error::UnexpectedValue);
            }
            let strings = len as u64 + 1;
            bounded(cursor, strings, 1)?;
            for _ in 0..strings {
                string(cursor)?;
            }
        }
        BLOCK_ITEM_BINARY_REF_NUMBER => {
            cursor.read_buf()?;
        }
        BLOCK_ITEM_STRING_REF_NUMBER | BLOCK_ITEM_EMBED_REF_NUMBER => string(cursor)?,
        BLOCK_ITEM_FORMAT_REF_NUMBER => {
            string(cursor)?;
            string(cursor)?;
        }
        BLOCK_ITEM_TYPE_REF_NUMBER => type_ref(cursor)?,
        BLOCK_ITEM_ANY_REF_NUMBER => {
            let len: u32 = cursor.read_var()?;
            bounded(cursor, len as u64, 1)?;
            for _ in 0..len {
                any(cursor, 0)?;
            }
        }
        BLOCK_ITEM_MOVE_REF_NUMBER => {
            let flags: i32 = cursor.read_var()?;
            let _start_client: u64 = cursor.read_var()?;
            let _start_clock: u32 = cursor.read_var()?;
            if flags & 0b0000_0001 == 0 {
                let _end_client: u64 = cursor.read_var()?;
                let _end_clock: u32 = cursor.read_var()?;
            }
        }
        BLOCK_ITEM_DOC_REF_NUMBER => {
            string(cursor)?;
            any(cursor, 0)?;
        }
        _ => return Err(Error::UnexpectedValue),
    }
    Ok(())
}

fn type_ref(cursor: &mut Cursor) -> Result<(), Error> {
    match cursor.read_u8()? {
        TYPE_REFS_XML_ELEMENT => string(cursor),
        TYPE_REFS_ARRAY | TYPE_REFS_MAP | TYPE_REFS_TEXT | TYPE_REFS_XML_FRAGMENT
        | TYPE_REFS_XML_HOOK | TYPE_REFS_XML_TEXT | TYPE_REFS_DOC | TYPE_REFS_UNDEFINED => Ok(()),
        // Weak links are not compiled into yrs here.
        _ => Err(Error::UnexpectedValue),
    }
}

fn any(cursor: &mut Cursor, depth: usize) -> Result<(), Error> {
    if depth > MAX_ANY_DEPTH {
        return Err(Error::Custom(format!(
            "value nesting deeper than {MAX_ANY_DEPTH}"
        )));
    }

    match cursor.read_u8()? {
        // undefined, null, false, true
        127 | 126 | 121 | 120 => {}
        125 => {
            let _int: i64 = cursor.read_var()?;
        }
        124 => {
            cursor.read_exact(4)?;
        }
        123 | 122 => {
            cursor.read_exact(8)?;
        }
        119 => string(cursor)?,
        118 => {
            let len: usize = cursor.read_var()?;
            bounded(cursor, len as u64, 2)?;
            for _ in 0..len {
                string(cursor)?;
                any(cursor, depth + 1)?;
            }
        }
        117 => {
            let len: usize = cursor.read_var()?;
            bounded(cursor, len as u64, 1)?;
            for _ in 0..len {
                any(cursor, depth + 1)?;
            }
        }
        116 => {
            cursor.read_buf()?;
        }
        _ => return Err(Error::UnexpectedValue),
    }
    Ok(())
}

fn delete_set(cursor: &mut Cursor) -> Result<(), Error> {
    let clients: u32 = cursor.read_var()?;
    bounded(cursor, clients as u64, 2)?;
    for _ in 0..clients {
        let _client: u32 = cursor.read_var()?;
        let ranges: u32 = cursor.read_var()?;
        bounded(cursor, ranges as u64, 2)?;
        for _ in 0..ranges {
            let _clock: u32 = cursor.read_var()?;
            let _len: u32 = cursor.read_var()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use yrs::types::Attrs;
    use yrs::{Any, Array, Doc, Map, ReadTxn, Text, Transact, XmlElementPrelim, XmlFragment};

    fn encode_edit(doc: &Doc, edit: impl FnOnce(&mut yrs::TransactionMut)) -> Vec<u8> {
        let mut txn = doc.transact_mut();
        edit(&mut txn);
        txn.encode_update_v1()
    }

    /// Locate `needle` in `haystack` and overwrite its first byte.
    fn corrupt(frame: &[u8], needle: &[u8], byte: u8) -> Vec<u8> {
        let pos = frame
            .windows(needle.len())
            .position(|w| w == needle)
            .expect("needle present in frame");
        let mut out = frame.to_vec();
        out[pos] = byte;
        out
    }

    /// A frame with one `Any` item nested `depth` arrays deep.
    fn nested_any_frame(depth: usize) -> Vec<u8> {
        // 1 client, 1 block, client 1, clock 0, info ANY with parent by name "m"
        let mut frame = vec![1, 1, 1, 0, BLOCK_ITEM_ANY_REF_NUMBER, 1, 1, b'm', 1];
        for _ in 0..depth {
            frame.extend_from_slice(&[117, 1]);
        }
        frame.push(126);
        frame.push(0);
        frame
    }

    #[test]
    fn test_accepts_text_edits() {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("root");
        let frames = [
            encode_edit(&doc, |txn| text.insert(txn, 0, "héllo wörld 🎉")),
            encode_edit(&doc, |txn| {
                let mut attrs = Attrs::new();
                attrs.insert("bold".into(), Any::Bool(true));
                text.format(txn, 0, 5, attrs);
            }),
            encode_edit(&doc, |txn| text.remove_range(txn, 1, 3)),
        ];
        for frame in &frames {
            validate_update_v1(frame).unwrap();
        }
    }

    #[test]
    fn test_accepts_map_array_and_xml_edits() {
        let doc = Doc::new();
        let map = doc.get_or_insert_map("meta");
        let list = doc.get_or_insert_array("list");
        let xml = doc.get_or_insert_xml_fragment("xml");

        let frame = encode_edit(&doc, |txn| {
            map.insert(txn, "title", "Notes ✎");
            map.insert(txn, "tags", vec!["a", "ß"]);
            map.insert(txn, "ratio", 0.5f64);
            map.insert(txn, "owner", HashMap::from([("name".to_string(), "Zoë")]));
            list.insert(txn, 0, true);
            list.insert(txn, 1, 42i32);
            xml.insert(txn, 0, XmlElementPrelim::empty("paragraph"));
        });
        validate_update_v1(&frame).unwrap();

        let snapshot = doc.transact().encode_state_as_update_v1(&yrs::StateVector::default());
        validate_update_v1(&snapshot).unwrap();
    }

    #[test]
    fn test_rejects_invalid_utf8_in_text_content() {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("root");
        let frame = encode_edit(&doc, |txn| text.insert(txn, 0, "hello"));

        let err = validate_update_v1(&corrupt(&frame, b"hello", 0xFF)).unwrap_err();
        assert!(matches!(err, Error::Custom(_)), "got {err:?}");
    }

    #[test]
    fn test_rejects_invalid_utf8_in_type_name() {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("root");
        let frame = encode_edit(&doc, |txn| text.insert(txn, 0, "hi"));

        assert!(validate_update_v1(&corrupt(&frame, b"root", 0xC0)).is_err());
    }

    #[test]
    fn test_rejects_invalid_utf8_in_map_key_and_value() {
        let doc = Doc::new();
        let map = doc.get_or_insert_map("meta");
        let frame = encode_edit(&doc, |txn| {
            map.insert(txn, "title", "draft");
        });

        assert!(validate_update_v1(&corrupt(&frame, b"title", 0xFE)).is_err());
        assert!(validate_update_v1(&corrupt(&frame, b"draft", 0x80)).is_err());
    }

    #[test]
    fn test_nesting_limit() {
        validate_update_v1(&nested_any_frame(MAX_ANY_DEPTH)).unwrap();

        let err = validate_update_v1(&nested_any_frame(10_000)).unwrap_err();
        assert!(matches!(err, Error::Custom(_)), "got {err:?}");
    }

    #[test]
    fn test_rejects_counts_larger_than_frame() {
        // One client claiming u32::MAX blocks.
        assert!(matches!(
            validate_update_v1(&[1, 0xFF, 0xFF, 0xFF, 0xFF, 0x0F, 1, 0]),
            Err(Error::EndOfBuffer(_))
        ));
        // Empty block list, delete set claiming u32::MAX ranges for one client.
        assert!(matches!(
            validate_update_v1(&[0, 1, 1, 0xFF, 0xFF, 0xFF, 0xFF, 0x0F]),
            Err(Error::EndOfBuffer(_))
        ));
    }

    #[test]
    fn test_rejects_truncation_and_unknown_content() {
        assert!(validate_update_v1(&[]).is_err());
        assert!(validate_update_v1(&[0x80]).is_err());
        // Item with content ref 15.
        assert!(matches!(
            validate_update_v1(&[1, 1, 1, 0, 0x0F, 1, 1, b'm', 0]),
            Err(Error::UnexpectedValue)
        ));
    }

    #[test]
    fn test_accepts_empty_update() {
        validate_update_v1(&[0, 0]).unwrap();
    }
}
