//! Incremental decoder for annotation dumps
//!
//! The envelope is walked with a small byte scanner that only tracks nesting
//! depth and string boundaries. Each element of `positions` is cut out as one
//! byte slice and handed to serde, so memory stays proportional to the
//! largest single position rather than to the file.

use crate::error::{IngestError, Result};
use crate::nirvana::model::{PositionEntry, RawAnnotationUnit};
use flate2::read::MultiGzDecoder;
use serde_json::Value;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Read};
use std::path::Path;
use tracing::{debug, info};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const READ_BUFFER: usize = 64 * 1024;
/// Give up on finding the first key after this many bytes
const LAYOUT_PROBE_LIMIT: usize = 4096;

/// How positions are laid out in the input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputLayout {
    /// `{"header": {...}, "positions": [...], "genes": [...]}`
    Envelope,
    /// One position object per line
    JsonLines,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Start,
    Streaming,
    Finished,
}

/// Byte cursor over a buffered reader with just enough JSON awareness to
/// find where one value ends
struct ByteCursor {
    inner: Box<dyn BufRead + Send>,
    offset: u64,
}

impl ByteCursor {
    fn peek(&mut self) -> Result<Option<u8>> {
        Ok(self.inner.fill_buf()?.first().copied())
    }

    fn bump(&mut self) {
        self.inner.consume(1);
        self.offset += 1;
    }

    fn next_byte(&mut self) -> Result<Option<u8>> {
        let byte = self.peek()?;
        if byte.is_some() {
            self.bump();
        }
        Ok(byte)
    }

    fn skip_ws(&mut self) -> Result<Option<u8>> {
        loop {
            match self.peek()? {
                Some(b) if b.is_ascii_whitespace() => self.bump(),
                other => return Ok(other),
            }
        }
    }

    fn expect_byte(&mut self, want: u8, what: &str) -> Result<()> {
        match self.skip_ws()? {
            Some(b) if b == want => {
                self.bump();
                Ok(())
            }
            Some(b) => Err(IngestError::malformed(format!(
                "expected {what} at byte {}, found '{}'",
                self.offset,
                b as char
            ))),
            None => Err(self.truncated(what)),
        }
    }

    fn truncated(&self, what: &str) -> IngestError {
        IngestError::malformed(format!(
            "input ends at byte {} while expecting {what}",
            self.offset
        ))
    }

    fn read_key(&mut self) -> Result<String> {
        let mut raw = Vec::new();
        self.capture_value(Some(&mut raw))?;
        serde_json::from_slice(&raw).map_err(|e| {
            IngestError::malformed(format!("invalid object key near byte {}: {e}", self.offset))
        })
    }

    /// Copy (or skip, when `out` is `None`) exactly one JSON value
    fn capture_value(&mut self, mut out: Option<&mut Vec<u8>>) -> Result<()> {
        let first = match self.skip_ws()? {
            Some(b) => b,
            None => return Err(self.truncated("a value")),
        };

        match first {
            b'"' => {
                self.bump();
                push(&mut out, first);
                self.capture_string_tail(&mut out)
            }
            b'{' | b'[' => {
                self.bump();
                push(&mut out, first);
                let mut depth = 1usize;
                while depth > 0 {
                    let byte = self
                        .next_byte()?
                        .ok_or_else(|| self.truncated("the end of a nested value"))?;
                    push(&mut out, byte);
                    match byte {
                        b'"' => self.capture_string_tail(&mut out)?,
                        b'{' | b'[' => depth += 1,
                        b'}' | b']' => depth -= 1,
                        _ => {}
                    }
                }
                Ok(())
            }
            b',' | b'}' | b']' | b':' => Err(IngestError::malformed(format!(
                "expected a value at byte {}, found '{}'",
                self.offset, first as char
            ))),
            _ => {
                // number, true, false, null
                while let Some(byte) = self.peek()? {
                    if matches!(byte, b',' | b'}' | b']') || byte.is_ascii_whitespace() {
                        break;
                    }
                    push(&mut out, byte);
                    self.bump();
                }
                Ok(())
            }
        }
    }

    /// Consume the rest of a string whose opening quote was already read
    fn capture_string_tail(&mut self, out: &mut Option<&mut Vec<u8>>) -> Result<()> {
        loop {
            let byte = self
                .next_byte()?
                .ok_or_else(|| self.truncated("a closing quote"))?;
            push(out, byte);
            match byte {
                b'"' => return Ok(()),
                b'\\' => {
                    let escaped = self
                        .next_byte()?
                        .ok_or_else(|| self.truncated("an escape sequence"))?;
                    push(out, escaped);
                }
                _ => {}
            }
        }
    }
}

fn push(out: &mut Option<&mut Vec<u8>>, byte: u8) {
    if let Some(buf) = out.as_mut() {
        buf.push(byte);
    }
}

/// Pick the layout from the first object key
///
/// `None` means the prefix ends before the key does and more input is needed.
fn detect_layout(prefix: &[u8], at_eof: bool) -> Option<InputLayout> {
    let undecided = || at_eof.then_some(InputLayout::Envelope);

    let mut rest = prefix.iter().skip_while(|b| b.is_ascii_whitespace());
    match rest.next() {
        Some(b'{') => {}
        Some(_) => return Some(InputLayout::Envelope),
        None => return undecided(),
    }
    let mut rest = rest.skip_while(|b| b.is_ascii_whitespace());
    match rest.next() {
        Some(b'"') => {}
        Some(_) => return Some(InputLayout::Envelope),
        None => return undecided(),
    }
    let tail: Vec<u8> = rest.copied().collect();
    let Some(end) = tail.iter().position(|b| *b == b'"') else {
        return undecided();
    };
    Some(match &tail[..end] {
        b"header" | b"positions" | b"" => InputLayout::Envelope,
        _ => InputLayout::JsonLines,
    })
}

/// Read ahead until the layout is known, then put the bytes back in front
fn probe_layout(
    mut inner: Box<dyn BufRead + Send>,
) -> Result<(InputLayout, Box<dyn BufRead + Send>)> {
    let mut prefix = Vec::new();
    let layout = loop {
        let chunk = inner.fill_buf()?;
        let read = chunk.len();
        prefix.extend_from_slice(chunk);
        inner.consume(read);
        if let Some(layout) = detect_layout(&prefix, read == 0) {
            break layout;
        }
        if prefix.len() >= LAYOUT_PROBE_LIMIT {
            break InputLayout::Envelope;
        }
    };
    Ok((layout, Box::new(Cursor::new(prefix).chain(inner))))
}

/// Lazy, single-pass sequence of [`RawAnnotationUnit`] in input order
///
/// Yields `Err` items for recoverable per-position failures
/// ([`IngestError::RecordParse`]) and keeps going; a fatal error is yielded
/// once and then the stream ends.
pub struct AnnotationStreamParser {
    cursor: ByteCursor,
    layout: InputLayout,
    compressed: bool,
    state: ScanState,
    header: Option<Value>,
    positions_read: u64,
    max_positions: Option<u64>,
    pending: VecDeque<RawAnnotationUnit>,
    element: Vec<u8>,
}

impl AnnotationStreamParser {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let parser = Self::from_reader(file)?;
        info!(
            path = %path.display(),
            layout = ?parser.layout,
            compressed = parser.compressed,
            "Opened annotation input"
        );
        Ok(parser)
    }

    pub fn from_reader<R: Read + Send + 'static>(reader: R) -> Result<Self> {
        let mut buffered = BufReader::with_capacity(READ_BUFFER, reader);
        let compressed = buffered.fill_buf()?.starts_with(&GZIP_MAGIC);

        let inner: Box<dyn BufRead + Send> = if compressed {
            Box::new(BufReader::with_capacity(
                READ_BUFFER,
                MultiGzDecoder::new(buffered),
            ))
        } else {
            Box::new(buffered)
        };
        let (layout, inner) = probe_layout(inner)?;

        Ok(Self {
            cursor: ByteCursor { inner, offset: 0 },
            layout,
            compressed,
            state: ScanState::Start,
            header: None,
            positions_read: 0,
            max_positions: None,
            pending: VecDeque::new(),
            element: Vec::new(),
        })
    }

    /// Stop after this many positions
    pub fn with_max_positions(mut self, max_positions: Option<u64>) -> Self {
        self.max_positions = max_positions;
        self
    }

    pub fn layout(&self) -> InputLayout {
        self.layout
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// The envelope's `header` object, available once streaming has started
    pub fn header(&self) -> Option<&Value> {
        self.header.as_ref()
    }

    pub fn positions_read(&self) -> u64 {
        self.positions_read
    }

    fn start(&mut self) -> Result<()> {
        match self.layout {
            InputLayout::Envelope => self.open_envelope(),
            InputLayout::JsonLines => match self.cursor.skip_ws()? {
                Some(b'{') | None => Ok(()),
                Some(b) => Err(IngestError::malformed(format!(
                    "expected one JSON object per line, found '{}'",
                    b as char
                ))),
            },
        }
    }

    fn open_envelope(&mut self) -> Result<()> {
        self.cursor
            .expect_byte(b'{', "'{' opening the annotation envelope")?;

        loop {
            match self.cursor.skip_ws()? {
                Some(b'"') => {}
                Some(b'}') => {
                    return Err(IngestError::malformed(
                        "annotation envelope has no 'positions' array",
                    ))
                }
                Some(b) => {
                    return Err(IngestError::malformed(format!(
                        "expected an object key at byte {}, found '{}'",
                        self.cursor.offset, b as char
                    )))
                }
                None => return Err(self.cursor.truncated("an object key")),
            }

            let key = self.cursor.read_key()?;
            self.cursor.expect_byte(b':', "':' after an object key")?;

            match key.as_str() {
                "positions" => {
                    self.cursor
                        .expect_byte(b'[', "'[' opening the positions array")?;
                    return Ok(());
                }
                "header" => {
                    let mut raw = Vec::new();
                    self.cursor.capture_value(Some(&mut raw))?;
                    let header: Value = serde_json::from_slice(&raw)
                        .map_err(|e| IngestError::malformed(format!("invalid header: {e}")))?;
                    let annotator = header.get("annotator").and_then(|v| v.as_str());
                    let assembly = header.get("genomeAssembly").and_then(|v| v.as_str());
                    debug!(annotator, assembly, "Read annotation header");
                    self.header = Some(header);
                }
                other => {
                    debug!(key = other, "Skipping envelope member");
                    self.cursor.capture_value(None)?;
                }
            }

            match self.cursor.skip_ws()? {
                Some(b',') => self.cursor.bump(),
                Some(b'}') => {}
                Some(b) => {
                    return Err(IngestError::malformed(format!(
                        "expected ',' or '}}' at byte {}, found '{}'",
                        self.cursor.offset, b as char
                    )))
                }
                None => return Err(self.cursor.truncated("',' or '}'")),
            }
        }
    }

    /// Walk whatever follows `positions` (normally `genes`) without keeping it
    fn close_envelope(&mut self) -> Result<()> {
        loop {
            match self.cursor.skip_ws()? {
                Some(b'}') => {
                    self.cursor.bump();
                    return Ok(());
                }
                Some(b',') => {
                    self.cursor.bump();
                    let key = self.cursor.read_key()?;
                    self.cursor.expect_byte(b':', "':' after an object key")?;
                    debug!(key = %key, "Skipping envelope member");
                    self.cursor.capture_value(None)?;
                }
                Some(b) => {
                    return Err(IngestError::malformed(format!(
                        "expected ',' or '}}' at byte {}, found '{}'",
                        self.cursor.offset, b as char
                    )))
                }
                None => return Err(self.cursor.truncated("the end of the envelope")),
            }
        }
    }

    /// Load the next raw position into `self.element`; `false` at end of input
    fn read_element(&mut self) -> Result<bool> {
        self.element.clear();
        match self.layout {
            InputLayout::Envelope => {
                match self.cursor.skip_ws()? {
                    Some(b']') => {
                        self.cursor.bump();
                        self.close_envelope()?;
                        return Ok(false);
                    }
                    None => return Err(self.cursor.truncated("a position or ']'")),
                    Some(_) => {}
                }

                self.cursor.capture_value(Some(&mut self.element))?;

                match self.cursor.skip_ws()? {
                    Some(b',') => self.cursor.bump(),
                    Some(b']') => {}
                    Some(b) => {
                        return Err(IngestError::malformed(format!(
                            "expected ',' or ']' after position at byte {}, found '{}'",
                            self.cursor.offset, b as char
                        )))
                    }
                    None => return Err(self.cursor.truncated("',' or ']'")),
                }
                Ok(true)
            }
            InputLayout::JsonLines => loop {
                self.element.clear();
                let read = self.cursor.inner.read_until(b'\n', &mut self.element)?;
                if read == 0 {
                    return Ok(false);
                }
                self.cursor.offset += read as u64;
                if !self.element.iter().all(u8::is_ascii_whitespace) {
                    return Ok(true);
                }
            },
        }
    }

    fn decode_element(&mut self) -> Result<()> {
        let index = self.positions_read;
        self.positions_read += 1;

        let entry: PositionEntry =
            serde_json::from_slice(&self.element).map_err(|e| IngestError::RecordParse {
                index,
                message: e.to_string(),
            })?;
        self.pending.extend(entry.into_units(index));
        Ok(())
    }
}

impl Iterator for AnnotationStreamParser {
    type Item = Result<RawAnnotationUnit>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(unit) = self.pending.pop_front() {
                return Some(Ok(unit));
            }

            match self.state {
                ScanState::Finished => return None,
                ScanState::Start => match self.start() {
                    Ok(()) => self.state = ScanState::Streaming,
                    Err(e) => {
                        self.state = ScanState::Finished;
                        return Some(Err(e));
                    }
                },
                ScanState::Streaming => {
                    if self
                        .max_positions
                        .is_some_and(|limit| self.positions_read >= limit)
                    {
                        debug!(limit = self.positions_read, "Position limit reached");
                        self.state = ScanState::Finished;
                        return None;
                    }

                    match self.read_element() {
                        Ok(true) => {
                            if let Err(e) = self.decode_element() {
                                return Some(Err(e));
                            }
                        }
                        Ok(false) => {
                            self.state = ScanState::Finished;
                            return None;
                        }
                        Err(e) => {
                            self.state = ScanState::Finished;
                            return Some(Err(e));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::{Cursor, Write};

    fn parser(input: &str) -> AnnotationStreamParser {
        AnnotationStreamParser::from_reader(Cursor::new(input.as_bytes().to_vec())).unwrap()
    }

    const ENVELOPE: &str = r#"{"header":{"annotator":"Nirvana 3.18","genomeAssembly":"GRCh38"},
        "positions":[
          {"chromosome":"chr1","position":100,"refAllele":"A","altAlleles":["G"],
           "variants":[{"altAllele":"G","hgvsg":"NC_000001.11:g.100A>G \"quoted\" ]}"}]},
          {"chromosome":"chr1","position":200,"refAllele":"C","altAlleles":["T","G"]}
        ],
        "genes":[{"name":"BRCA1","omim":[{"phenotypes":[]}]}]}"#;

    #[test]
    fn test_envelope_streams_units_in_order() {
        let mut p = parser(ENVELOPE);
        let units: Vec<_> = p.by_ref().map(|u| u.unwrap()).collect();

        assert_eq!(p.layout(), InputLayout::Envelope);
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].context.position, Some(100));
        assert_eq!(units[1].alt_allele.as_deref(), Some("T"));
        assert_eq!(units[2].alt_allele.as_deref(), Some("G"));
        assert_eq!(units[2].position_index, 1);
        assert_eq!(p.positions_read(), 2);
        assert_eq!(
            p.header().and_then(|h| h.get("genomeAssembly")).unwrap(),
            "GRCh38"
        );
    }

    #[test]
    fn test_gzip_input_is_detected() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(ENVELOPE.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let p = AnnotationStreamParser::from_reader(Cursor::new(compressed)).unwrap();
        assert!(p.is_compressed());
        assert_eq!(p.count(), 3);
    }

    #[test]
    fn test_json_lines_layout() {
        let input = "{\"chromosome\":\"2\",\"position\":5,\"refAllele\":\"C\",\"altAlleles\":[\"A\"]}\n\n\
                     {\"chromosome\":\"2\",\"position\":9,\"refAllele\":\"G\",\"altAlleles\":[\"T\"]}\n";
        let mut p = parser(input);
        let units: Vec<_> = p.by_ref().map(|u| u.unwrap()).collect();
        assert_eq!(p.layout(), InputLayout::JsonLines);
        assert_eq!(units.len(), 2);
        assert_eq!(units[1].context.position, Some(9));
    }

    #[test]
    fn test_bad_element_is_recoverable() {
        let input = r#"{"positions":[{"position":1,"altAlleles":["A"]},{"position":"oops"},{"position":3,"altAlleles":["C"]}]}"#;
        let items: Vec<_> = parser(input).collect();
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        let err = items[1].as_ref().unwrap_err();
        assert!(matches!(err, IngestError::RecordParse { index: 1, .. }));
        assert!(!err.is_fatal());
        assert_eq!(items[2].as_ref().unwrap().context.position, Some(3));
    }

    #[test]
    fn test_wrong_envelope_is_fatal() {
        let items: Vec<_> = parser("[1, 2, 3]").collect();
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(IngestError::MalformedInput(_))));

        let items: Vec<_> = parser(r#"{"header":{}}"#).collect();
        assert!(matches!(items[0], Err(IngestError::MalformedInput(_))));

        let items: Vec<_> = parser(r#"{"header":{},"positions":{}}"#).collect();
        assert!(matches!(items[0], Err(IngestError::MalformedInput(_))));
    }

    #[test]
    fn test_truncated_stream_is_fatal_after_complete_positions() {
        let input = r#"{"header":{},"positions":[{"position":1,"altAlleles":["A"]},{"position":2,"alt"#;
        let items: Vec<_> = parser(input).collect();
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].as_ref().unwrap_err().is_fatal());
    }

    #[test]
    fn test_max_positions_stops_early() {
        let p = parser(ENVELOPE).with_max_positions(Some(1));
        assert_eq!(p.count(), 1);
    }

    #[test]
    fn test_empty_positions_array() {
        let mut p = parser(r#"{"header":{"annotator":"x"},"positions":[],"genes":[]}"#);
        assert!(p.next().is_none());
        assert!(p.header().is_some());
    }

    #[test]
    fn test_detect_layout() {
        let envelope = Some(InputLayout::Envelope);
        assert_eq!(detect_layout(b"  {\"header\":{}", false), envelope);
        assert_eq!(detect_layout(b"{\"positions\":[", false), envelope);
        assert_eq!(
            detect_layout(b"{\"chromosome\":\"1\"}", false),
            Some(InputLayout::JsonLines)
        );
        assert_eq!(detect_layout(b"[]", false), envelope);
        assert_eq!(detect_layout(b"", true), envelope);
        // key cut off: wait for more input
        assert_eq!(detect_layout(b"{\"hea", false), None);
        assert_eq!(detect_layout(b" {", false), None);
        assert_eq!(detect_layout(b"{\"hea", true), envelope);
    }

    /// Hands out a few bytes per read, like a decoder at a block boundary
    struct Trickle(Cursor<Vec<u8>>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let limit = buf.len().min(3);
            self.0.read(&mut buf[..limit])
        }
    }

    #[test]
    fn test_first_key_split_across_reads() {
        let mut p = AnnotationStreamParser::from_reader(Trickle(Cursor::new(
            ENVELOPE.as_bytes().to_vec(),
        )))
        .unwrap();
        assert_eq!(p.layout(), InputLayout::Envelope);

        let units: Vec<_> = p.by_ref().collect::<Result<_>>().unwrap();
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].context.position, Some(100));
        assert!(p.header().is_some());
    }
}
