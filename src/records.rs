//! Lazy extraction of records from multi-record documents
//!
//! Archive files concatenate many records of the same type (e.g. all server
//! descriptors published in one month). [`RecordStream`] reads such a file
//! line by line, cuts it into the line spans of individual records and hands
//! every span to a [`FieldDecoder`], so the whole file never has to be held in
//! memory.
//!
//! A record starts at a line with the decoder's start keyword and ends right
//! before the next such line. A record that fails to decode is reported in its
//! own [`Entry`] and the stream carries on; a broken stream framing ends the
//! iteration with a [`StreamError`].

use std::io::BufRead;
use std::iter::FusedIterator;

use crate::annotation::{check_annotation, AcceptanceSet};
use crate::error::{AnnotationError, DocumentParseError, StreamError};

//
// External dependencies
//
use memchr::memchr2;
use tracing::{debug, warn};

const OBJECT_BEGIN: &[u8] = b"-----BEGIN ";
const OBJECT_END: &[u8] = b"-----END ";

/// Turns the line span of one record into a typed record.
pub trait FieldDecoder {
    type Record;

    /// Keyword of the first line of every record, e.g. `router`
    fn start_keyword(&self) -> &str;

    /// Whether lines before the first record are a document header rather than
    /// a framing error.
    fn has_preamble(&self) -> bool {
        false
    }

    /// Whether `keyword` starts the footer that ends the list of records.
    fn is_terminator(&self, _keyword: &str) -> bool {
        false
    }

    fn decode(&self, span: &Span) -> Result<Self::Record, DocumentParseError>;
}

impl<D: FieldDecoder + ?Sized> FieldDecoder for &D {
    type Record = D::Record;

    fn start_keyword(&self) -> &str {
        (**self).start_keyword()
    }

    fn has_preamble(&self) -> bool {
        (**self).has_preamble()
    }

    fn is_terminator(&self, keyword: &str) -> bool {
        (**self).is_terminator(keyword)
    }

    fn decode(&self, span: &Span) -> Result<Self::Record, DocumentParseError> {
        (**self).decode(span)
    }
}

/// The raw lines making up one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    first_line: usize,
    raw: Vec<u8>,
}

impl Span {
    pub fn new(first_line: usize, raw: impl Into<Vec<u8>>) -> Span {
        Span {
            first_line,
            raw: raw.into(),
        }
    }

    /// Line number of the record's first line within its file
    pub fn first_line(&self) -> usize {
        self.first_line
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn text(&self) -> Result<&str, DocumentParseError> {
        Ok(std::str::from_utf8(&self.raw)?)
    }
}

/// One slot of a record stream: the decoded record, or why decoding failed
#[derive(Debug)]
pub struct Entry<T> {
    pub first_line: usize,
    pub record: Result<T, DocumentParseError>,
}

/// A lazy, single-pass sequence of records read from `R`.
///
/// The reader is dropped as soon as the stream ends or breaks, and with the
/// stream itself if it is abandoned early.
pub struct RecordStream<R, D> {
    reader: Option<R>,
    decoder: D,
    line_no: usize,
    // start line of the next record, already read
    lookahead: Option<(usize, Vec<u8>)>,
    preamble: Vec<u8>,
    seen_record: bool,
    reached_footer: bool,
}

impl<R: BufRead, D: FieldDecoder> RecordStream<R, D> {
    /// Stream records from a document body (without its annotation line).
    pub fn new(reader: R, decoder: D) -> Self {
        RecordStream {
            reader: Some(reader),
            decoder,
            line_no: 0,
            lookahead: None,
            preamble: Vec::new(),
            seen_record: false,
            reached_footer: false,
        }
    }

    /// Check the annotation of a full document against `accepted` and stream
    /// the records of its body.
    pub fn open(
        mut reader: R,
        decoder: D,
        accepted: &AcceptanceSet,
    ) -> Result<Self, AnnotationError> {
        check_annotation(&mut reader, accepted)?;
        let mut stream = RecordStream::new(reader, decoder);
        stream.line_no = 1;
        Ok(stream)
    }

    /// Header lines seen before the first record. Complete once the first
    /// record has been pulled.
    pub fn preamble(&self) -> &[u8] {
        &self.preamble
    }

    /// Whether the underlying reader has been released.
    pub fn is_closed(&self) -> bool {
        self.reader.is_none()
    }

    fn close(&mut self) {
        self.reader = None;
        self.lookahead = None;
    }

    fn read_line(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return Ok(None),
        };
        let mut line = Vec::new();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }
        self.line_no += 1;
        Ok(Some(line))
    }

    /// Skip to the start line of the next record.
    fn find_start(&mut self) -> Result<Option<(usize, Vec<u8>)>, StreamError> {
        if let Some(start) = self.lookahead.take() {
            return Ok(Some(start));
        }
        while !self.reached_footer {
            let line = match self.read_line()? {
                Some(line) => line,
                None => break,
            };
            if is_blank(&line) || line.starts_with(b"@") {
                continue;
            }
            let keyword = line_keyword(&line);
            if keyword == self.decoder.start_keyword().as_bytes() {
                self.seen_record = true;
                return Ok(Some((self.line_no, line)));
            }
            if self.is_terminator(keyword) {
                self.reached_footer = true;
                break;
            }
            if self.decoder.has_preamble() && !self.seen_record {
                self.preamble.extend_from_slice(&line);
                continue;
            }
            return Err(StreamError::UnexpectedKeyword {
                keyword: String::from_utf8_lossy(keyword).into_owned(),
                line: self.line_no,
            });
        }
        Ok(None)
    }

    fn next_span(&mut self) -> Result<Option<Span>, StreamError> {
        let (first_line, mut raw) = match self.find_start()? {
            Some(start) => start,
            None => return Ok(None),
        };
        // keyword and line of the object we are inside of, if any
        let mut object: Option<(String, usize)> = None;

        loop {
            let line = match self.read_line()? {
                Some(line) => line,
                None => match object {
                    Some((keyword, line)) => {
                        return Err(StreamError::UnterminatedObject { keyword, line })
                    }
                    None => break,
                },
            };
            if object.is_some() {
                if line.starts_with(OBJECT_END) {
                    object = None;
                }
                raw.extend_from_slice(&line);
                continue;
            }
            if line.starts_with(OBJECT_BEGIN) {
                let keyword = String::from_utf8_lossy(object_keyword(&line)).into_owned();
                object = Some((keyword, self.line_no));
                raw.extend_from_slice(&line);
                continue;
            }
            // annotation of the following record
            if line.starts_with(b"@") {
                break;
            }
            let keyword = line_keyword(&line);
            if keyword == self.decoder.start_keyword().as_bytes() {
                self.lookahead = Some((self.line_no, line));
                break;
            }
            if self.is_terminator(keyword) {
                self.reached_footer = true;
                break;
            }
            raw.extend_from_slice(&line);
        }

        Ok(Some(Span::new(first_line, raw)))
    }

    fn is_terminator(&self, keyword: &[u8]) -> bool {
        std::str::from_utf8(keyword).map_or(false, |k| self.decoder.is_terminator(k))
    }
}

impl<R: BufRead, D: FieldDecoder> Iterator for RecordStream<R, D> {
    type Item = Result<Entry<D::Record>, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_closed() {
            return None;
        }
        match self.next_span() {
            Ok(Some(span)) => {
                let record = self.decoder.decode(&span);
                if let Err(e) = &record {
                    debug!(line = span.first_line(), error = %e, "record could not be decoded");
                }
                Some(Ok(Entry {
                    first_line: span.first_line(),
                    record,
                }))
            }
            Ok(None) => {
                self.close();
                None
            }
            Err(e) => {
                warn!(line = self.line_no, error = %e, "aborting record stream");
                self.close();
                Some(Err(e))
            }
        }
    }
}

impl<R: BufRead, D: FieldDecoder> FusedIterator for RecordStream<R, D> {}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(|c| c.is_ascii_whitespace())
}

/// The keyword a line starts with, skipping a leading `opt`
fn line_keyword(line: &[u8]) -> &[u8] {
    let line = trim_line_end(line);
    let first = match memchr2(b' ', b'\t', line) {
        Some(end) => &line[..end],
        None => return line,
    };
    if first == b"opt" {
        let rest = &line[first.len()..];
        let spaces = rest.iter().take_while(|c| **c == b' ' || **c == b'\t').count();
        return line_keyword(&rest[spaces..]);
    }
    first
}

/// `X` in `-----BEGIN X-----`
fn object_keyword(line: &[u8]) -> &[u8] {
    let rest = &trim_line_end(line)[OBJECT_BEGIN.len()..];
    rest.strip_suffix(b"-----").unwrap_or(rest)
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::{BufReader, Read};
    use std::rc::Rc;

    /// Decodes a record to its lines, failing on lines containing "bad"
    struct Lines;

    impl FieldDecoder for Lines {
        type Record = Vec<String>;

        fn start_keyword(&self) -> &str {
            "router"
        }

        fn decode(&self, span: &Span) -> Result<Self::Record, DocumentParseError> {
            let text = span.text()?;
            if text.contains("bad") {
                return Err(DocumentParseError::args_missing("bad"));
            }
            Ok(text.lines().map(str::to_string).collect())
        }
    }

    struct Statuses;

    impl FieldDecoder for Statuses {
        type Record = String;

        fn start_keyword(&self) -> &str {
            "r"
        }

        fn has_preamble(&self) -> bool {
            true
        }

        fn is_terminator(&self, keyword: &str) -> bool {
            keyword == "directory-footer"
        }

        fn decode(&self, span: &Span) -> Result<Self::Record, DocumentParseError> {
            Ok(span.text()?.to_string())
        }
    }

    fn records<D: FieldDecoder>(
        text: &str,
        decoder: D,
    ) -> Vec<Result<Entry<D::Record>, StreamError>> {
        RecordStream::new(text.as_bytes(), decoder).collect()
    }

    #[test]
    fn splits_at_start_keyword() {
        let text = "router a\nplatform x\nrouter b\n\nrouter c\nbandwidth 1 2 3\n";
        let entries = records(text, Lines);
        let lines: Vec<Vec<String>> = entries
            .into_iter()
            .map(|e| e.unwrap().record.unwrap())
            .collect();
        assert_eq!(
            lines,
            vec![
                vec!["router a", "platform x"],
                vec!["router b", ""],
                vec!["router c", "bandwidth 1 2 3"],
            ]
        );
    }

    #[test]
    fn field_errors_are_isolated() {
        let text = "router a\nrouter bad\nrouter c\n";
        let entries: Vec<_> = records(text, Lines).into_iter().map(Result::unwrap).collect();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].record.is_ok());
        assert!(entries[1].record.is_err());
        assert_eq!(entries[1].first_line, 2);
        assert!(entries[2].record.is_ok());
    }

    #[test]
    fn objects_are_opaque() {
        let text = "router a\nrouter-signature\n-----BEGIN SIGNATURE-----\nrouter fake\n-----END SIGNATURE-----\nrouter b\n";
        let entries = records(text, Lines);
        assert_eq!(entries.len(), 2);
        let first = entries.into_iter().next().unwrap().unwrap().record.unwrap();
        assert_eq!(first.len(), 5);
        assert_eq!(first[3], "router fake");
    }

    #[test]
    fn unterminated_object_is_fatal() {
        let text = "router a\nrouter b\nonion-key\n-----BEGIN RSA PUBLIC KEY-----\nMIG\n";
        let mut stream = RecordStream::new(text.as_bytes(), Lines);
        assert!(stream.next().unwrap().unwrap().record.is_ok());
        match stream.next() {
            Some(Err(StreamError::UnterminatedObject { keyword, line })) => {
                assert_eq!(keyword, "RSA PUBLIC KEY");
                assert_eq!(line, 4);
            }
            other => panic!("unexpected {:?}", other.map(|r| r.map(|e| e.first_line))),
        }
        assert!(stream.is_closed());
        assert!(stream.next().is_none());
    }

    #[test]
    fn unknown_leading_keyword_is_fatal() {
        let entries = records("platform x\nrouter a\n", Lines);
        assert_eq!(entries.len(), 1);
        assert!(matches!(
            entries[0],
            Err(StreamError::UnexpectedKeyword { line: 1, .. })
        ));
    }

    #[test]
    fn annotations_and_opt_prefix() {
        let text = "@downloaded-at 2014-12-01 00:00:00\nopt router a\n@source \"1.2.3.4\"\nrouter b\n";
        let entries = records(text, Lines);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].as_ref().unwrap().first_line, 2);
        assert_eq!(entries[1].as_ref().unwrap().first_line, 4);
    }

    #[test]
    fn preamble_and_footer() {
        let text = "network-status-version 3\nvalid-after 2014-12-01 00:00:00\nr a\ns Fast\nr b\ndirectory-footer\nbandwidth-weights Wbd=0\nr c\n";
        let mut stream = RecordStream::new(text.as_bytes(), Statuses);
        let first = stream.next().unwrap().unwrap().record.unwrap();
        assert_eq!(first, "r a\ns Fast\n");
        assert_eq!(
            stream.preamble(),
            b"network-status-version 3\nvalid-after 2014-12-01 00:00:00\n"
        );
        assert_eq!(stream.next().unwrap().unwrap().record.unwrap(), "r b\n");
        assert!(stream.next().is_none());
        assert!(stream.is_closed());
    }

    #[test]
    fn open_checks_annotation() {
        let text = "@type server-descriptor 1.0\nrouter a\n";
        let stream =
            RecordStream::open(text.as_bytes(), Lines, &AcceptanceSet::server_descriptor()).unwrap();
        let entries: Vec<_> = stream.map(Result::unwrap).collect();
        assert_eq!(entries[0].first_line, 2);

        assert!(RecordStream::open(text.as_bytes(), Lines, &AcceptanceSet::consensus()).is_err());
    }

    /// A reader that records how often it was read and whether it was dropped
    struct Probe {
        inner: &'static [u8],
        reads: Rc<Cell<usize>>,
        dropped: Rc<Cell<bool>>,
    }

    impl Read for Probe {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.reads.set(self.reads.get() + 1);
            self.inner.read(buf)
        }
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            self.dropped.set(true);
        }
    }

    #[test]
    fn abandoning_releases_reader() {
        let reads = Rc::new(Cell::new(0));
        let dropped = Rc::new(Cell::new(false));
        let probe = Probe {
            inner: b"router a\nrouter b\nrouter c\n",
            reads: reads.clone(),
            dropped: dropped.clone(),
        };
        // tiny buffer so that every line needs its own read
        let mut stream = RecordStream::new(BufReader::with_capacity(4, probe), Lines);
        assert!(stream.next().unwrap().is_ok());
        assert!(!dropped.get());

        let reads_before = reads.get();
        drop(stream);
        assert!(dropped.get());
        assert_eq!(reads.get(), reads_before);
    }

    #[test]
    fn exhaustion_releases_reader() {
        let dropped = Rc::new(Cell::new(false));
        let probe = Probe {
            inner: b"router a\n",
            reads: Rc::new(Cell::new(0)),
            dropped: dropped.clone(),
        };
        let mut stream = RecordStream::new(BufReader::new(probe), Lines);
        assert!(stream.next().is_some());
        assert!(stream.next().is_none());
        assert!(dropped.get());
    }
}
