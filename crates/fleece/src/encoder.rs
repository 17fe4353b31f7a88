//! Streaming encoder producing self-describing, random-accessible
//! documents.
//!
//! Values are buffered per open container as 2- or 4-byte slots and
//! committed when the container closes: the header goes out first, then the
//! slots, with absolute positions rewritten as relative back-pointers. A
//! container stays narrow unless one of its slots needs 4 bytes. The last
//! two bytes of a finished document always resolve to the root value.
//!
//! # Example
//!
//! ```
//! use fleece::encoder::Encoder;
//! use fleece::writer::Writer;
//!
//! let mut out = Writer::new();
//! let mut enc = Encoder::new(&mut out);
//! enc.begin_dict(1).unwrap();
//! enc.write_key("answer").unwrap();
//! enc.write_int(42).unwrap();
//! enc.end_dict().unwrap();
//! enc.end().unwrap();
//! drop(enc);
//! assert_eq!(out.len() % 2, 0);
//! ```

use crate::error::{Error, Result};
use crate::strings::{Probe, StringInfo, StringTable};
use crate::tag::{self, Tag};
use crate::value::Slot;
use crate::writer::Writer;

/// Where a dictionary key's bytes can be found for sorting.
#[derive(Debug, Clone, Copy)]
enum KeyRef {
    /// Payload bytes live in the output stream.
    Stream { pos: u32, len: u32 },
    /// Key packed inline; its bytes sit in the paired slot.
    Inline,
}

/// An open-container accumulator. Frames live in a stack whose storage is
/// reused across pushes.
#[derive(Debug)]
struct Frame {
    tag: Tag,
    slots: Vec<Slot>,
    wide: bool,
    /// Parallel to the key slots, only filled while key sorting is on.
    keys: Vec<KeyRef>,
}

impl Frame {
    fn new(tag: Tag) -> Self {
        Frame {
            tag,
            slots: Vec::new(),
            wide: false,
            keys: Vec::new(),
        }
    }

    fn reset(&mut self, tag: Tag) {
        self.tag = tag;
        self.slots.clear();
        self.keys.clear();
        self.wide = false;
    }
}

/// Absolute position of an out-of-line string's payload, given the value
/// position: one header byte, plus a length varint once the nibble
/// saturates.
fn string_payload_pos(offset: u32, len: usize) -> u32 {
    let header = 1 + if len >= 0x0F {
        tag::uvarint_len(len as u64)
    } else {
        0
    };
    offset + header as u32
}

fn dict_key<'a>(frame: &'a Frame, out: &'a [u8], i: usize) -> &'a [u8] {
    match frame.keys[i] {
        KeyRef::Stream { pos, len } => &out[pos as usize..(pos + len) as usize],
        KeyRef::Inline => frame.slots[2 * i].inline_string_bytes(),
    }
}

/// Streaming document encoder.
///
/// Borrows its output [`Writer`], which must outlive it. Dropping a
/// non-finalized encoder flushes via [`end`](Encoder::end), discarding any
/// error; call `end` explicitly to observe failures.
pub struct Encoder<'w> {
    out: &'w mut Writer,
    stack: Vec<Frame>,
    depth: usize,
    strings: StringTable,
    unique_strings: bool,
    sort_keys: bool,
    writing_key: bool,
    blocked_on_key: bool,
    done: bool,
}

impl<'w> Encoder<'w> {
    pub fn new(out: &'w mut Writer) -> Self {
        let mut enc = Encoder {
            out,
            stack: Vec::new(),
            depth: 0,
            strings: StringTable::with_capacity(100),
            unique_strings: true,
            sort_keys: true,
            writing_key: false,
            blocked_on_key: false,
            done: false,
        };
        // the synthetic top-level frame holds exactly the document root
        enc.push(Tag::Special, 1);
        enc
    }

    /// Enable or disable string deduplication. Default on.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotIdle` once encoding has started.
    pub fn set_unique_strings(&mut self, unique: bool) -> Result<()> {
        self.ensure_idle()?;
        self.unique_strings = unique;
        Ok(())
    }

    /// Enable or disable lexicographic dictionary key sorting. Default on.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotIdle` once encoding has started.
    pub fn set_sort_keys(&mut self, sort: bool) -> Result<()> {
        self.ensure_idle()?;
        self.sort_keys = sort;
        Ok(())
    }

    // --- Scalars ---

    pub fn write_null(&mut self) -> Result<()> {
        self.begin_value()?;
        self.add_item(Slot::inline(Tag::Special, tag::SPECIAL_NULL));
        Ok(())
    }

    pub fn write_bool(&mut self, b: bool) -> Result<()> {
        self.begin_value()?;
        let bits = if b { tag::SPECIAL_TRUE } else { tag::SPECIAL_FALSE };
        self.add_item(Slot::inline(Tag::Special, bits));
        Ok(())
    }

    pub fn write_int(&mut self, i: i64) -> Result<()> {
        self.write_int_raw(i as u64, (-2048..2048).contains(&i), false)
    }

    pub fn write_uint(&mut self, i: u64) -> Result<()> {
        self.write_int_raw(i, i < 2048, true)
    }

    fn write_int_raw(&mut self, i: u64, short: bool, unsigned: bool) -> Result<()> {
        self.begin_value()?;
        if short {
            self.add_item(Slot::inline2(
                Tag::ShortInt,
                ((i >> 8) & 0x0F) as u8,
                (i & 0xFF) as u8,
            ));
            return Ok(());
        }
        let mut body = [0u8; 8];
        let len = tag::put_int_of_length(&mut body, i as i64, unsigned);
        let mut buf = [0u8; 10];
        buf[0] = (len - 1) as u8 | if unsigned { 0x08 } else { 0 };
        buf[1..=len].copy_from_slice(&body[..len]);
        let mut size = 1 + len;
        if size & 1 != 0 {
            buf[size] = 0; // pad to even size
            size += 1;
        }
        self.write_value(Tag::Int, &mut buf[..size], true)
    }

    /// Writes a double, downgrading to an integer when the value is one.
    ///
    /// # Errors
    ///
    /// Returns `Error::NaNFloat` for NaN; nothing is emitted.
    pub fn write_double(&mut self, n: f64) -> Result<()> {
        if n.is_nan() {
            return Err(Error::NaNFloat);
        }
        if n == (n as i64) as f64 {
            return self.write_int(n as i64);
        }
        self.begin_value()?;
        let mut buf = [0u8; 10];
        buf[0] = 0x08; // 'double' size flag
        buf[2..10].copy_from_slice(&n.to_le_bytes());
        self.write_value(Tag::Float, &mut buf, true)
    }

    /// Writes a float, downgrading to an integer when the value is one.
    ///
    /// # Errors
    ///
    /// Returns `Error::NaNFloat` for NaN; nothing is emitted.
    pub fn write_float(&mut self, n: f32) -> Result<()> {
        if n.is_nan() {
            return Err(Error::NaNFloat);
        }
        if n == (n as i32) as f32 {
            return self.write_int(i64::from(n as i32));
        }
        self.begin_value()?;
        let mut buf = [0u8; 6];
        buf[0] = 0x00; // 'float' size flag
        buf[2..6].copy_from_slice(&n.to_le_bytes());
        self.write_value(Tag::Float, &mut buf, true)
    }

    // --- Strings and binary ---

    pub fn write_string(&mut self, s: &str) -> Result<()> {
        self.begin_value()?;
        self.write_string_bytes(s.as_bytes(), false)?;
        Ok(())
    }

    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.begin_value()?;
        self.write_data_value(Tag::Binary, data)?;
        Ok(())
    }

    /// Writes a string value, deduplicating through the intern table when
    /// its length falls in the shareable window. Returns where the payload
    /// bytes can be read back for key sorting.
    fn write_string_bytes(&mut self, s: &[u8], as_key: bool) -> Result<KeyRef> {
        let shareable = self.unique_strings
            && (tag::MIN_SHARED_STRING..=tag::MAX_SHARED_STRING).contains(&s.len());
        if !shareable {
            return Ok(match self.write_data_value(Tag::String, s)? {
                Some(pos) => KeyRef::Stream {
                    pos,
                    len: s.len() as u32,
                },
                None => KeyRef::Inline,
            });
        }
        match self.strings.find(s) {
            Probe::Found(slot) => {
                let offset = self.strings.info(slot).offset;
                self.write_pointer(offset as usize)?;
                if as_key {
                    self.strings.mark_key(slot);
                }
                Ok(KeyRef::Stream {
                    pos: string_payload_pos(offset, s.len()),
                    len: s.len() as u32,
                })
            }
            Probe::Vacant(slot) => {
                let offset = self.next_write_pos() as u32;
                let pos = self
                    .write_data_value(Tag::String, s)?
                    .unwrap_or_else(|| string_payload_pos(offset, s.len()));
                self.strings.add_at(
                    slot,
                    s,
                    StringInfo {
                        offset,
                        used_as_key: as_key,
                    },
                );
                Ok(KeyRef::Stream {
                    pos,
                    len: s.len() as u32,
                })
            }
        }
    }

    /// Shared string/binary body writer. Returns the payload's absolute
    /// position, or `None` when the body packed into the value itself.
    fn write_data_value(&mut self, tag: Tag, s: &[u8]) -> Result<Option<u32>> {
        if s.len() < tag::NARROW {
            let mut buf = [0u8; 2];
            buf[0] = s.len() as u8;
            if let Some(&b) = s.first() {
                buf[1] = b;
            }
            self.write_value(tag, &mut buf[..1 + s.len()], true)?;
            Ok(None)
        } else {
            let mut header = [0u8; 1 + tag::MAX_VARINT_LEN64];
            header[0] = s.len().min(0x0F) as u8;
            let mut n = 1;
            if s.len() >= 0x0F {
                n += tag::put_uvarint(&mut header[1..], s.len() as u64);
            }
            self.write_value(tag, &mut header[..n], false)?;
            let pos = self.out.append(s);
            Ok(Some(pos as u32))
        }
    }

    // --- Arrays and dictionaries ---

    pub fn begin_array(&mut self, reserve: usize) -> Result<()> {
        self.begin_value()?;
        self.push(Tag::Array, reserve);
        Ok(())
    }

    pub fn end_array(&mut self) -> Result<()> {
        self.end_collection(Tag::Array)
    }

    pub fn begin_dict(&mut self, reserve: usize) -> Result<()> {
        self.begin_value()?;
        self.push(Tag::Dict, 2 * reserve);
        self.writing_key = true;
        self.blocked_on_key = true;
        Ok(())
    }

    /// Writes a dictionary key. Must alternate with values while a
    /// dictionary is open.
    ///
    /// # Errors
    ///
    /// Returns `Error::NeedValue` if a value is due, `Error::NotWritingDict`
    /// outside a dictionary.
    pub fn write_key(&mut self, key: &str) -> Result<()> {
        if self.done {
            return Err(Error::Finalized);
        }
        if !self.blocked_on_key {
            return Err(if self.stack[self.depth - 1].tag == Tag::Dict {
                Error::NeedValue
            } else {
                Error::NotWritingDict
            });
        }
        self.blocked_on_key = false;
        let key_ref = self.write_string_bytes(key.as_bytes(), true)?;
        if self.sort_keys {
            self.stack[self.depth - 1].keys.push(key_ref);
        }
        Ok(())
    }

    pub fn end_dict(&mut self) -> Result<()> {
        if self.depth > 1 && self.stack[self.depth - 1].tag == Tag::Dict && !self.writing_key {
            return Err(Error::NeedValue);
        }
        self.end_collection(Tag::Dict)
    }

    /// Writes the strings that served as dictionary keys as one array
    /// mirroring the intern table's hash layout; empty slots become nulls,
    /// so readers can probe the array like the table it snapshots.
    pub fn write_key_table(&mut self) -> Result<()> {
        let key_count = self
            .strings
            .iter()
            .filter(|(_, info)| info.used_as_key)
            .count();
        let mut table = StringTable::with_capacity(key_count);
        for (bytes, info) in self.strings.iter() {
            if info.used_as_key {
                if let Probe::Vacant(slot) = table.find(bytes) {
                    table.add_at(slot, bytes, info);
                }
            }
        }
        let slots: Vec<Option<Vec<u8>>> = table
            .raw_slots()
            .map(|s| s.map(|(bytes, _)| bytes.to_vec()))
            .collect();

        self.begin_array(slots.len())?;
        for slot in &slots {
            match slot {
                Some(bytes) => {
                    self.begin_value()?;
                    self.write_string_bytes(bytes, false)?;
                }
                None => self.write_null()?,
            }
        }
        self.end_array()
    }

    // --- Finalization ---

    /// Commits the document root and trailer. Idempotent; the final two
    /// output bytes resolve to the root value.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnclosedCollection` or `Error::MultipleRoots` when
    /// the call sequence left the document malformed.
    pub fn end(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        if self.depth > 1 {
            return Err(Error::UnclosedCollection);
        }
        if self.stack[0].slots.len() > 1 {
            return Err(Error::MultipleRoots);
        }
        if !self.stack[0].slots.is_empty() {
            let len = self.out.len();
            let base = len + (len & 1);
            self.check_pointer_widths(0, base);
            let wide = self.stack[0].wide;
            self.next_write_pos();
            self.fix_and_flush(0, base)?;
            if wide {
                // the trailer must stay two bytes: point it at the 4-byte root
                let trailer = Slot::Pointer(base as u32).to_narrow(self.out.len())?;
                self.out.append(&trailer);
            }
            self.stack[0].slots.clear();
        }
        self.done = true;
        Ok(())
    }

    /// Returns the encoder to its initial state and discards all output,
    /// so a fresh document can reuse the allocations.
    pub fn reset(&mut self) {
        self.depth = 0;
        self.out.clear();
        self.strings.clear();
        self.writing_key = false;
        self.blocked_on_key = false;
        self.done = false;
        self.push(Tag::Special, 1);
    }

    // --- Internals ---

    fn ensure_idle(&self) -> Result<()> {
        if self.done || self.depth != 1 || !self.stack[0].slots.is_empty() {
            return Err(Error::NotIdle);
        }
        Ok(())
    }

    fn begin_value(&self) -> Result<()> {
        if self.done {
            return Err(Error::Finalized);
        }
        if self.blocked_on_key {
            return Err(Error::NeedKey);
        }
        Ok(())
    }

    /// Appends a slot to the open frame and advances the dictionary
    /// key/value alternation.
    fn add_item(&mut self, slot: Slot) {
        if self.writing_key {
            self.writing_key = false;
        } else if self.stack[self.depth - 1].tag == Tag::Dict {
            self.writing_key = true;
            self.blocked_on_key = true;
        }
        self.stack[self.depth - 1].slots.push(slot);
    }

    /// Inline `buf` into the open frame when permitted and small enough,
    /// otherwise write it out of line behind a back-pointer.
    fn write_value(&mut self, tag: Tag, buf: &mut [u8], can_inline: bool) -> Result<()> {
        if can_inline && buf.len() <= tag::WIDE {
            let slot = Slot::from_body(tag, buf);
            let wide = slot.is_wide_inline();
            self.add_item(slot);
            if wide {
                self.stack[self.depth - 1].wide = true;
            }
            Ok(())
        } else {
            buf[0] |= tag.high_nibble();
            let pos = self.next_write_pos();
            self.write_pointer(pos)?;
            self.out.append(buf);
            Ok(())
        }
    }

    /// Position of the next out-of-line write, padding the stream to an
    /// even offset first.
    fn next_write_pos(&mut self) -> usize {
        if self.out.len() & 1 != 0 {
            self.out.append(&[0]);
        }
        self.out.len()
    }

    fn write_pointer(&mut self, pos: usize) -> Result<()> {
        let pos = u32::try_from(pos).map_err(|_| Error::PointerTooLarge)?;
        self.add_item(Slot::Pointer(pos));
        Ok(())
    }

    fn push(&mut self, tag: Tag, reserve: usize) {
        if self.depth == self.stack.len() {
            self.stack.push(Frame::new(tag));
        }
        let frame = &mut self.stack[self.depth];
        self.depth += 1;
        frame.reset(tag);
        frame.slots.reserve(reserve);
    }

    fn end_collection(&mut self, tag: Tag) -> Result<()> {
        if self.done {
            return Err(Error::Finalized);
        }
        if self.depth < 2 || self.stack[self.depth - 1].tag != tag {
            return Err(Error::WrongCollection);
        }
        self.depth -= 1;
        let closed = self.depth;
        self.writing_key = false;
        self.blocked_on_key = false;

        if self.sort_keys && tag == Tag::Dict {
            self.sort_dict(closed);
        }

        let mut count = self.stack[closed].slots.len() as u32;
        if tag == Tag::Dict {
            count /= 2;
        }

        let mut buf = [0u8; 2 + tag::MAX_VARINT_LEN32 + 1];
        let inline_count = count.min(tag::MAX_INLINE_COUNT);
        buf[0] = (inline_count >> 8) as u8;
        buf[1] = (inline_count & 0xFF) as u8;
        let mut header_len = 2;
        if count >= tag::VARINT_COUNT {
            header_len += tag::put_uvarint(&mut buf[2..], u64::from(count));
            if header_len & 1 != 0 {
                buf[header_len] = 0;
                header_len += 1;
            }
        }

        if count == 0 {
            // an empty container packs whole into the parent slot
            return self.write_value(tag, &mut buf[..header_len], true);
        }

        let base = self.slots_base(header_len);
        self.check_pointer_widths(closed, base);
        if self.stack[closed].wide {
            buf[0] |= 0x08;
        }
        self.write_value(tag, &mut buf[..header_len], false)?;
        debug_assert_eq!(self.out.len(), base);
        self.fix_and_flush(closed, base)
    }

    /// Absolute position the frame's first slot will land at, given the
    /// container header still to be written.
    fn slots_base(&self, header_len: usize) -> usize {
        let len = self.out.len();
        len + (len & 1) + header_len
    }

    /// Promote the frame to wide if any narrow back-pointer would not
    /// reach its target.
    fn check_pointer_widths(&mut self, idx: usize, base: usize) {
        let frame = &mut self.stack[idx];
        if frame.wide {
            return;
        }
        let mut at = base;
        for slot in &frame.slots {
            if let Slot::Pointer(abs) = slot {
                if at - *abs as usize >= 0x10000 {
                    frame.wide = true;
                    return;
                }
            }
            at += tag::NARROW;
        }
    }

    /// Rewrite absolute positions as relative back-pointers and append the
    /// frame's slots to the output.
    fn fix_and_flush(&mut self, idx: usize, base: usize) -> Result<()> {
        let frame = &self.stack[idx];
        let width = if frame.wide { tag::WIDE } else { tag::NARROW };
        let mut bytes = Vec::with_capacity(frame.slots.len() * width);
        let mut at = base;
        for slot in &frame.slots {
            if width == tag::WIDE {
                bytes.extend_from_slice(&slot.to_wide(at)?);
            } else {
                bytes.extend_from_slice(&slot.to_narrow(at)?);
            }
            at += width;
        }
        self.out.append(&bytes);
        Ok(())
    }

    /// Stable-sort the frame's (key, value) pairs by key bytes.
    fn sort_dict(&mut self, idx: usize) {
        let n = self.stack[idx].keys.len();
        if n < 2 {
            return;
        }
        debug_assert_eq!(self.stack[idx].slots.len(), 2 * n);

        let mut order: Vec<usize> = (0..n).collect();
        {
            let frame = &self.stack[idx];
            let out = self.out.as_bytes();
            order.sort_by(|&a, &b| dict_key(frame, out, a).cmp(dict_key(frame, out, b)));
        }

        let frame = &mut self.stack[idx];
        let old = frame.slots.clone();
        for (i, &j) in order.iter().enumerate() {
            frame.slots[2 * i] = old[2 * j];
            frame.slots[2 * i + 1] = old[2 * j + 1];
        }
    }
}

impl Drop for Encoder<'_> {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.end();
        }
    }
}
