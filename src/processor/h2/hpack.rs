//! Header block compression.
//!
//! # Design Decisions
//! - Decoding uses the `hpack` crate; one decoder per connection keeps each
//!   peer's dynamic table in sync with what that peer encoded
//! - Every block is walked once before it reaches the crate: integers must
//!   terminate, string lengths must fit, and table size updates may only
//!   lead the block and stay within `DEFAULT_TABLE_SIZE`. The crate's size
//!   update path does not tolerate a truncated integer.
//! - Encoding is done here so the table policy can differ per direction:
//!   towards the frontend a regular dynamic table is used, towards backends
//!   the encoder is literal-only and never inserts anything. Backends never
//!   see table state derived from another backend's (or the client's) headers.

use std::collections::VecDeque;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use super::frame::FrameError;

/// Decoded header list: (name, value) pairs in wire order.
pub type HeaderList = Vec<(Vec<u8>, Vec<u8>)>;

pub const DEFAULT_TABLE_SIZE: usize = 4096;
const ENTRY_OVERHEAD: usize = 32;
/// Longest integer encoding accepted, prefix octet included.
const MAX_INT_OCTETS: usize = 5;

static STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// Never added to a dynamic table.
const SENSITIVE: [&[u8]; 4] = [b"authorization", b"proxy-authorization", b"cookie", b"set-cookie"];

pub struct HeaderDecoder {
    inner: ::hpack::Decoder<'static>,
    max_table_size: usize,
}

impl HeaderDecoder {
    pub fn new() -> Self {
        Self {
            inner: ::hpack::Decoder::new(),
            max_table_size: DEFAULT_TABLE_SIZE,
        }
    }

    pub fn decode(&mut self, block: &[u8]) -> Result<HeaderList, FrameError> {
        check_block(block, self.max_table_size)?;
        self.inner
            .decode(block)
            .map_err(|e| FrameError::Compression(format!("{e:?}")))
    }
}

fn compression(reason: &str) -> FrameError {
    FrameError::Compression(reason.to_string())
}

/// Walk the representations of `block` without decoding them.
fn check_block(block: &[u8], max_table_size: usize) -> Result<(), FrameError> {
    let mut pos = 0;
    let mut fields = false;
    while let Some(&first) = block.get(pos) {
        let rest = &block[pos..];
        pos += if first & 0x80 != 0 {
            fields = true;
            read_int(rest, 7)?.1
        } else if first & 0x40 != 0 {
            fields = true;
            literal_len(rest, 6)?
        } else if first & 0x20 != 0 {
            if fields {
                return Err(compression("table size update after a header field"));
            }
            let (size, used) = read_int(rest, 5)?;
            if size > max_table_size {
                return Err(FrameError::Compression(format!(
                    "table size update to {size} exceeds {max_table_size}"
                )));
            }
            used
        } else {
            fields = true;
            literal_len(rest, 4)?
        };
    }
    Ok(())
}

fn literal_len(buf: &[u8], prefix_bits: u8) -> Result<usize, FrameError> {
    let (index, mut used) = read_int(buf, prefix_bits)?;
    if index == 0 {
        used += string_len(&buf[used..])?;
    }
    used += string_len(&buf[used..])?;
    Ok(used)
}

fn string_len(buf: &[u8]) -> Result<usize, FrameError> {
    let (len, used) = read_int(buf, 7)?;
    if len > buf.len() - used {
        return Err(compression("string literal runs past the block"));
    }
    Ok(used + len)
}

/// Returns the value and the number of octets it occupied.
fn read_int(buf: &[u8], prefix_bits: u8) -> Result<(usize, usize), FrameError> {
    let max = (1usize << prefix_bits) - 1;
    let first = buf.first().ok_or_else(|| compression("truncated integer"))?;
    let mut value = usize::from(*first) & max;
    if value < max {
        return Ok((value, 1));
    }
    for (i, &b) in buf.iter().enumerate().skip(1).take(MAX_INT_OCTETS - 1) {
        value += usize::from(b & 0x7f) << (7 * (i - 1));
        if b & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if buf.len() < MAX_INT_OCTETS {
        Err(compression("truncated integer"))
    } else {
        Err(compression("integer encoding too long"))
    }
}

impl Default for HeaderDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HeaderDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderDecoder").finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct DynamicTable {
    entries: VecDeque<(Vec<u8>, Vec<u8>)>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    fn insert(&mut self, name: &[u8], value: &[u8]) {
        let entry = name.len() + value.len() + ENTRY_OVERHEAD;
        if entry > self.max_size {
            self.entries.clear();
            self.size = 0;
            return;
        }
        while self.size + entry > self.max_size {
            self.evict();
        }
        self.entries.push_front((name.to_vec(), value.to_vec()));
        self.size += entry;
    }

    fn resize(&mut self, max_size: usize) {
        self.max_size = max_size;
        while self.size > self.max_size {
            self.evict();
        }
    }

    fn evict(&mut self) {
        if let Some((name, value)) = self.entries.pop_back() {
            self.size -= name.len() + value.len() + ENTRY_OVERHEAD;
        }
    }

    /// 1-based position of an exact match, else of a name match.
    fn find(&self, name: &[u8], value: &[u8]) -> (Option<usize>, Option<usize>) {
        let mut by_name = None;
        for (i, (n, v)) in self.entries.iter().enumerate() {
            if n == name {
                if v == value {
                    return (Some(i + 1), Some(i + 1));
                }
                by_name.get_or_insert(i + 1);
            }
        }
        (None, by_name)
    }
}

/// Stateful header encoder for one outbound direction.
#[derive(Debug)]
pub struct HeaderEncoder {
    table: DynamicTable,
    indexing: bool,
    pending_update: Option<usize>,
}

impl HeaderEncoder {
    pub fn new(max_table_size: usize) -> Self {
        Self {
            table: DynamicTable::new(max_table_size.min(DEFAULT_TABLE_SIZE)),
            indexing: true,
            pending_update: None,
        }
    }

    /// Static-table references and literals only; the dynamic table stays empty.
    pub fn literal_only() -> Self {
        Self {
            table: DynamicTable::new(0),
            indexing: false,
            pending_update: None,
        }
    }

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE. The change is signalled
    /// at the start of the next block.
    pub fn set_max_table_size(&mut self, size: usize) {
        if !self.indexing {
            return;
        }
        let size = size.min(DEFAULT_TABLE_SIZE);
        if size != self.table.max_size {
            self.table.resize(size);
            self.pending_update = Some(size);
        }
    }

    pub fn max_table_size(&self) -> usize {
        self.table.max_size
    }

    /// Current dynamic table occupancy in HPACK size units.
    pub fn table_size(&self) -> usize {
        self.table.size
    }

    pub fn table_len(&self) -> usize {
        self.table.entries.len()
    }

    pub fn encode(&mut self, headers: &[(Vec<u8>, Vec<u8>)]) -> Bytes {
        let mut dst = BytesMut::new();
        if let Some(size) = self.pending_update.take() {
            encode_int(size, 5, 0x20, &mut dst);
        }
        for (name, value) in headers {
            self.encode_field(name, value, &mut dst);
        }
        dst.freeze()
    }

    fn encode_field(&mut self, name: &[u8], value: &[u8], dst: &mut BytesMut) {
        let (static_exact, static_name) = static_lookup(name, value);
        if let Some(index) = static_exact {
            encode_int(index, 7, 0x80, dst);
            return;
        }

        let (dynamic_exact, dynamic_name) = if self.indexing {
            self.table.find(name, value)
        } else {
            (None, None)
        };
        if let Some(index) = dynamic_exact {
            encode_int(STATIC_TABLE.len() + index, 7, 0x80, dst);
            return;
        }
        let name_index = static_name.or(dynamic_name.map(|i| STATIC_TABLE.len() + i));

        if self.indexing && !SENSITIVE.contains(&name) {
            encode_int(name_index.unwrap_or(0), 6, 0x40, dst);
            if name_index.is_none() {
                encode_str(name, dst);
            }
            encode_str(value, dst);
            self.table.insert(name, value);
        } else {
            encode_int(name_index.unwrap_or(0), 4, 0x00, dst);
            if name_index.is_none() {
                encode_str(name, dst);
            }
            encode_str(value, dst);
        }
    }
}

fn static_lookup(name: &[u8], value: &[u8]) -> (Option<usize>, Option<usize>) {
    let mut by_name = None;
    for (i, (n, v)) in STATIC_TABLE.iter().enumerate() {
        if n.as_bytes() == name {
            if v.as_bytes() == value {
                return (Some(i + 1), Some(i + 1));
            }
            by_name.get_or_insert(i + 1);
        }
    }
    (None, by_name)
}

fn encode_int(value: usize, prefix_bits: u8, flags: u8, dst: &mut BytesMut) {
    let max = (1usize << prefix_bits) - 1;
    if value < max {
        dst.put_u8(flags | value as u8);
        return;
    }
    dst.put_u8(flags | max as u8);
    let mut rest = value - max;
    while rest >= 128 {
        dst.put_u8((rest % 128 + 128) as u8);
        rest /= 128;
    }
    dst.put_u8(rest as u8);
}

fn encode_str(s: &[u8], dst: &mut BytesMut) {
    encode_int(s.len(), 7, 0x00, dst);
    dst.put_slice(s);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(pairs: &[(&str, &str)]) -> HeaderList {
        pairs
            .iter()
            .map(|(n, v)| (n.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn integers_use_continuation_bytes() {
        let mut dst = BytesMut::new();
        encode_int(1337, 5, 0, &mut dst);
        assert_eq!(&dst[..], &[31, 154, 10]);

        let mut dst = BytesMut::new();
        encode_int(10, 5, 0, &mut dst);
        assert_eq!(&dst[..], &[10]);
    }

    #[test]
    fn static_matches_are_single_bytes() {
        let mut encoder = HeaderEncoder::literal_only();
        let block = encoder.encode(&list(&[(":method", "GET"), (":status", "200")]));
        assert_eq!(&block[..], &[0x82, 0x88]);
    }

    #[test]
    fn frontend_encoder_indexes_and_reuses() {
        let mut encoder = HeaderEncoder::new(DEFAULT_TABLE_SIZE);
        let mut decoder = HeaderDecoder::new();
        let headers = list(&[(":status", "200"), ("x-trace", "abc123")]);

        let first = encoder.encode(&headers);
        assert_eq!(encoder.table_len(), 1);
        let second = encoder.encode(&headers);
        assert!(second.len() < first.len());

        assert_eq!(decoder.decode(&first).unwrap(), headers);
        assert_eq!(decoder.decode(&second).unwrap(), headers);
    }

    #[test]
    fn literal_only_encoder_never_grows() {
        let mut encoder = HeaderEncoder::literal_only();
        let headers = list(&[(":path", "/a"), ("x-custom", "1"), ("host", "a.test")]);
        for _ in 0..3 {
            let block = encoder.encode(&headers);
            assert_eq!(HeaderDecoder::new().decode(&block).unwrap(), headers);
        }
        assert_eq!(encoder.table_size(), 0);
        encoder.set_max_table_size(4096);
        assert_eq!(encoder.max_table_size(), 0);
    }

    #[test]
    fn sensitive_headers_are_not_indexed() {
        let mut encoder = HeaderEncoder::new(DEFAULT_TABLE_SIZE);
        encoder.encode(&list(&[("cookie", "session=1")]));
        assert_eq!(encoder.table_len(), 0);
    }

    #[test]
    fn integers_round_trip_through_the_reader() {
        for value in [0, 30, 31, 1337, 1 << 20] {
            let mut dst = BytesMut::new();
            encode_int(value, 5, 0x20, &mut dst);
            assert_eq!(read_int(&dst, 5).unwrap(), (value, dst.len()));
        }
    }

    #[test]
    fn malformed_blocks_are_errors() {
        let blocks: [&[u8]; 8] = [
            // size update with its integer cut short
            &[0x3f],
            &[0x3f, 0xe1],
            // indexed field with its integer cut short
            &[0xff],
            // integer longer than five octets
            &[0xff, 0x80, 0x80, 0x80, 0x80, 0x01],
            // literal value shorter than its length
            &[0x00, 0x01, b'a', 0x05, b'b'],
            // huffman string with non-EOS padding
            &[0x00, 0x81, 0x00, 0x00],
            // huffman string containing EOS
            &[0x00, 0x84, 0xff, 0xff, 0xff, 0xff, 0x00],
            // size update after a field
            &[0x82, 0x20],
        ];
        for block in blocks {
            let result = HeaderDecoder::new().decode(block);
            assert!(
                matches!(result, Err(FrameError::Compression(_))),
                "{block:02x?} gave {result:?}"
            );
        }
    }

    #[test]
    fn table_size_update_is_bounded() {
        // 4096 = 31 + 97 + (31 << 7)
        let mut block = vec![0x3f, 0xe1, 0x1f, 0x82];
        assert_eq!(
            HeaderDecoder::new().decode(&block).unwrap(),
            list(&[(":method", "GET")])
        );

        block[1] = 0xe2;
        assert!(HeaderDecoder::new().decode(&block).is_err());
    }

    #[test]
    fn shrinking_table_evicts_and_signals() {
        let mut encoder = HeaderEncoder::new(DEFAULT_TABLE_SIZE);
        let mut decoder = HeaderDecoder::new();
        let headers = list(&[("x-a", "1"), ("x-b", "2")]);
        decoder.decode(&encoder.encode(&headers)).unwrap();
        assert_eq!(encoder.table_len(), 2);

        encoder.set_max_table_size(40);
        assert_eq!(encoder.table_len(), 1);
        let block = encoder.encode(&headers);
        assert_eq!(block[0] & 0xe0, 0x20);
        assert_eq!(decoder.decode(&block).unwrap(), headers);
    }
}
