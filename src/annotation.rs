//! The `@type` annotation in the first line of every archived document
//!
//! CollecTor prefixes each document with a line such as
//! `@type server-descriptor 1.0`, naming the document type and the version of
//! its grammar. Nothing else in a file is parsed before this line has been
//! checked.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use crate::error::AnnotationError;

//
// External dependencies
//
use lazy_static::lazy_static;
use phf::phf_map;
use regex::Regex;
use tracing::trace;

/// Longest first line we are willing to read while looking for an annotation
const MAX_ANNOTATION_LENGTH: u64 = 1024;

lazy_static! {
    static ref ANNOTATION_REGEX: Regex =
        Regex::new(r"^@type ([A-Za-z0-9-]+) ([0-9]+)\.([0-9]+)$").expect("valid annotation regex");
}

/// Grammar version (major, minor) we accept for each known document type
static KNOWN_DOCUMENT_KINDS: phf::Map<&'static str, (&'static str, &'static str)> = phf_map! {
    "server-descriptor" => ("1", "0"),
    "extra-info" => ("1", "0"),
    "network-status-consensus-3" => ("1", "0"),
    "network-status-microdesc-consensus-3" => ("1", "0"),
};

/// A parsed type annotation.
///
/// The versions are kept as they appear in the text, so equality is exact
/// string equality of all three parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Annotation {
    doc_type: String,
    major: String,
    minor: String,
}

impl Annotation {
    fn from_parts(doc_type: &str, major: &str, minor: &str) -> Annotation {
        Annotation {
            doc_type: doc_type.to_string(),
            major: major.to_string(),
            minor: minor.to_string(),
        }
    }

    pub fn doc_type(&self) -> &str {
        &self.doc_type
    }

    pub fn major(&self) -> &str {
        &self.major
    }

    pub fn minor(&self) -> &str {
        &self.minor
    }
}

impl FromStr for Annotation {
    type Err = AnnotationError;

    /// Parse `@type <type> <major>.<minor>` without any line terminator.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = ANNOTATION_REGEX
            .captures(s)
            .ok_or_else(|| AnnotationError::Malformed {
                line: s.to_string(),
            })?;
        // all three groups are mandatory in the regex
        let group = |i| captures.get(i).map_or("", |m| m.as_str());
        Ok(Annotation::from_parts(group(1), group(2), group(3)))
    }
}

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "@type {} {}.{}", self.doc_type, self.major, self.minor)
    }
}

/// A named set of annotations that are valid for one kind of document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptanceSet {
    name: String,
    accepted: Vec<Annotation>,
}

impl AcceptanceSet {
    pub fn new(name: impl Into<String>, accepted: impl IntoIterator<Item = Annotation>) -> Self {
        AcceptanceSet {
            name: name.into(),
            accepted: accepted.into_iter().collect(),
        }
    }

    /// Look up the built-in set for a document kind, e.g. `"extra-info"`.
    pub fn named(name: &str) -> Option<AcceptanceSet> {
        KNOWN_DOCUMENT_KINDS.get_entry(name).map(|(doc_type, (major, minor))| {
            AcceptanceSet::new(
                *doc_type,
                [Annotation::from_parts(doc_type, major, minor)],
            )
        })
    }

    /// Relay server descriptors
    pub fn server_descriptor() -> AcceptanceSet {
        AcceptanceSet::new(
            "server-descriptor",
            [Annotation::from_parts("server-descriptor", "1", "0")],
        )
    }

    /// Network status consensus documents
    pub fn consensus() -> AcceptanceSet {
        AcceptanceSet::new(
            "network-status-consensus-3",
            [Annotation::from_parts("network-status-consensus-3", "1", "0")],
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn accepts(&self, annotation: &Annotation) -> bool {
        self.accepted.iter().any(|a| a == annotation)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
        self.accepted.iter()
    }
}

/// Read the annotation from the first line of `reader`.
///
/// Exactly the first line (including its `\n`) is consumed, so the returned
/// reader continues with the document body.
pub fn read_annotation<R: BufRead>(mut reader: R) -> Result<(Annotation, R), AnnotationError> {
    let mut line = Vec::new();
    reader
        .by_ref()
        .take(MAX_ANNOTATION_LENGTH)
        .read_until(b'\n', &mut line)?;

    if line.last() == Some(&b'\n') {
        line.pop();
    } else if line.len() as u64 >= MAX_ANNOTATION_LENGTH {
        return Err(AnnotationError::TooLong {
            limit: MAX_ANNOTATION_LENGTH as usize,
        });
    }

    let line = String::from_utf8(line).map_err(|e| AnnotationError::Malformed {
        line: String::from_utf8_lossy(e.as_bytes()).into_owned(),
    })?;
    let annotation = line.parse::<Annotation>()?;
    trace!(%annotation, "read type annotation");
    Ok((annotation, reader))
}

/// Read the annotation of the file at `path`.
pub fn get_annotation(path: impl AsRef<Path>) -> Result<Annotation, AnnotationError> {
    let file = File::open(path.as_ref())?;
    let (annotation, _) = read_annotation(BufReader::new(file))?;
    Ok(annotation)
}

/// Read the annotation from `reader` and make sure it is one of `accepted`.
///
/// On success the reader is positioned at the start of the document body.
pub fn check_annotation<R: BufRead>(
    reader: &mut R,
    accepted: &AcceptanceSet,
) -> Result<Annotation, AnnotationError> {
    let (annotation, _) = read_annotation(reader)?;
    if !accepted.accepts(&annotation) {
        return Err(AnnotationError::NotAccepted {
            annotation,
            expected: accepted.name().to_string(),
        });
    }
    Ok(annotation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Seek, SeekFrom};

    fn annotation(s: &str) -> Annotation {
        s.parse().unwrap()
    }

    #[test]
    fn display_is_canonical() {
        let a = Annotation::from_parts("foobar", "0", "0");
        assert_eq!(a.to_string(), "@type foobar 0.0");
    }

    #[test]
    fn equality_compares_all_fields() {
        let a = Annotation::from_parts("a", "b", "c");
        let b = Annotation::from_parts("a", "b", "c");
        let z = Annotation::from_parts("x", "y", "z");

        assert_eq!(a, b);
        assert_eq!(b, a);
        assert_ne!(a, z);
        assert_ne!(z, b);
        // versions are compared as text
        assert_ne!(annotation("@type t 1.0"), annotation("@type t 01.0"));
    }

    #[test]
    fn parse_good_annotations() {
        let good = [
            ("@type server-descriptor 1.0", ("server-descriptor", "1", "0")),
            ("@type server-descriptor 1.2", ("server-descriptor", "1", "2")),
            ("@type server-descriptor 2.0", ("server-descriptor", "2", "0")),
            ("@type extra-info 2.0", ("extra-info", "2", "0")),
            ("@type CASE 1.0", ("CASE", "1", "0")),
        ];
        for (line, (t, major, minor)) in good {
            let parsed = annotation(line);
            assert_eq!(parsed, Annotation::from_parts(t, major, minor));
            assert_eq!(parsed.to_string(), line);
        }
    }

    #[test]
    fn parse_bad_annotations() {
        let bad = [
            "",
            "@type test",
            "@type 1.0",
            "@type test 1",
            "@type test 1.",
            "@type test .0",
            "@type test 1.0 more",
            "@TYPE test 1.0",
            "@typo test 1.0",
            "type test 1.0",
            "@type test 1.0 ",
            "@type  test 1.0",
            "@type test a.0",
        ];
        for line in bad {
            assert!(
                matches!(
                    line.parse::<Annotation>(),
                    Err(AnnotationError::Malformed { .. })
                ),
                "{:?} was accepted",
                line
            );
        }
    }

    #[test]
    fn read_leaves_body_untouched() {
        let body = "12345678\n";
        let input = format!("@type test 1.0\n{}", body);

        let (parsed, mut rest) = read_annotation(input.as_bytes()).unwrap();
        assert_eq!(parsed, annotation("@type test 1.0"));

        let mut remainder = String::new();
        rest.read_to_string(&mut remainder).unwrap();
        assert_eq!(remainder, body);

        assert!(read_annotation("bad first line\nmore data\n".as_bytes()).is_err());
    }

    #[test]
    fn read_rejects_endless_line() {
        let zeros = std::io::repeat(0).take(1 << 20);
        let result = read_annotation(BufReader::new(zeros));
        assert!(matches!(result, Err(AnnotationError::TooLong { .. })));
    }

    #[test]
    fn get_annotation_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consensus");
        std::fs::write(&path, "@type network-status-consensus-3 1.0\nnetwork-status-version 3\n")
            .unwrap();

        let parsed = get_annotation(&path).unwrap();
        assert_eq!(parsed, annotation("@type network-status-consensus-3 1.0"));

        assert!(matches!(
            get_annotation(dir.path().join("missing")),
            Err(AnnotationError::Io(_))
        ));
    }

    #[test]
    #[cfg(unix)]
    fn dev_zero_is_rejected() {
        assert!(get_annotation("/dev/zero").is_err());

        let mut zero = BufReader::new(File::open("/dev/zero").unwrap());
        assert!(check_annotation(&mut zero, &AcceptanceSet::server_descriptor()).is_err());
    }

    #[test]
    fn check_against_acceptance_sets() {
        let mut doc = Cursor::new(b"@type server-descriptor 1.0\nrouter x\n".to_vec());

        check_annotation(&mut doc, &AcceptanceSet::server_descriptor()).unwrap();

        doc.seek(SeekFrom::Start(0)).unwrap();
        let err = check_annotation(&mut doc, &AcceptanceSet::consensus()).unwrap_err();
        assert!(matches!(err, AnnotationError::NotAccepted { .. }));

        doc.seek(SeekFrom::Start(0)).unwrap();
        check_annotation(&mut doc, &AcceptanceSet::server_descriptor()).unwrap();

        let mut rest = String::new();
        doc.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "router x\n");
    }

    #[test]
    fn named_sets_match_builtins() {
        assert_eq!(
            AcceptanceSet::named("server-descriptor"),
            Some(AcceptanceSet::server_descriptor())
        );
        assert_eq!(
            AcceptanceSet::named("network-status-consensus-3"),
            Some(AcceptanceSet::consensus())
        );
        let extra = AcceptanceSet::named("extra-info").unwrap();
        assert!(extra.accepts(&annotation("@type extra-info 1.0")));
        assert!(!extra.accepts(&annotation("@type extra-info 2.0")));
        assert!(AcceptanceSet::named("bridge-pool-assignment").is_none());
    }
}
