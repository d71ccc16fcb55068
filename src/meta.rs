//! The generic item grammar shared by all directory documents
//!
//! Every document is a sequence of items: a keyword line with optional
//! arguments, optionally followed by a `-----BEGIN X-----` object.

use crate::error::DocumentParseError;

//
// External dependencies
//
use memchr::memmem;
use nom::{
    branch::alt,
    bytes::complete::{tag, take_until, take_while, take_while1},
    character::complete::{line_ending, not_line_ending},
    combinator::{eof, opt, verify},
    multi::many0,
    sequence::{delimited, pair, preceded, terminated},
    IResult,
};

/// An object block attached to an item, e.g. a signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object<'a> {
    pub keyword: &'a str,
    pub content: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item<'a> {
    pub keyword: &'a str,
    pub arguments: Option<&'a str>,
    pub object: Option<Object<'a>>,
}

impl<'a> Item<'a> {
    /// All arguments as one string; fails if there are none.
    pub fn get_argument(&self) -> Result<&'a str, DocumentParseError> {
        self.arguments
            .ok_or_else(|| DocumentParseError::args_missing(self.keyword))
    }

    /// Arguments split at whitespace; fails if there are none.
    pub fn split_arguments(&self) -> Result<Vec<&'a str>, DocumentParseError> {
        Ok(self.get_argument()?.split_whitespace().collect())
    }
}

/// A document, broken up into items
#[derive(Debug)]
pub struct Document<'a> {
    pub items: Vec<Item<'a>>,
}

impl<'a> Document<'a> {
    /// Parse a complete document; trailing garbage is an error.
    pub fn parse_single(text: &'a str) -> Result<Document<'a>, DocumentParseError> {
        let (rest, items) = many0(item)(text).map_err(|e| match e {
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                DocumentParseError::Internal(nom::error::Error::new(e.input.to_string(), e.code))
            }
            nom::Err::Incomplete(_) => DocumentParseError::remaining(text, ""),
        })?;
        let rest = skip_blank_lines(rest);
        if !rest.is_empty() {
            return Err(DocumentParseError::remaining(text, rest));
        }
        Ok(Document { items })
    }

    /// The first item with the given keyword
    pub fn find(&self, keyword: &str) -> Option<&Item<'a>> {
        self.items.iter().find(|x| x.keyword == keyword)
    }
}

fn skip_blank_lines(input: &str) -> &str {
    let mut rest = input;
    while let Ok((r, _)) = line_ending::<&str, nom::error::Error<&str>>(rest) {
        rest = r;
    }
    rest
}

fn is_keyword_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-'
}

fn is_space(c: char) -> bool {
    c == ' ' || c == '\t'
}

fn keyword(input: &str) -> IResult<&str, &str> {
    verify(take_while1(is_keyword_char), |k: &str| !k.starts_with('-'))(input)
}

fn arguments(input: &str) -> IResult<&str, Option<&str>> {
    let (input, args) = opt(preceded(take_while1(is_space), not_line_ending))(input)?;
    Ok((input, args.map(str::trim_end).filter(|a| !a.is_empty())))
}

fn object(input: &str) -> IResult<&str, Object> {
    let (input, keyword) = delimited(
        tag("-----BEGIN "),
        take_until("-----"),
        pair(tag("-----"), line_ending),
    )(input)?;
    let (input, content) = take_until("-----END ")(input)?;
    let (input, _) = delimited(
        tag("-----END "),
        tag(keyword),
        pair(tag("-----"), alt((line_ending, eof))),
    )(input)?;
    Ok((input, Object { keyword, content }))
}

fn item(input: &str) -> IResult<&str, Item> {
    let (input, _) = take_while(|c: char| c == '\n' || c == '\r')(input)?;
    let (input, (keyword, arguments)) =
        terminated(pair(keyword, arguments), alt((line_ending, eof)))(input)?;
    let (input, object) = opt(object)(input)?;

    // "opt" marks items that older parsers may ignore; the real keyword follows
    let (keyword, arguments) = match (keyword, arguments) {
        ("opt", Some(args)) => match args.split_once(is_space) {
            Some((kw, rest)) => (kw, Some(rest.trim_start()).filter(|a| !a.is_empty())),
            None => (args, None),
        },
        other => other,
    };

    Ok((
        input,
        Item {
            keyword,
            arguments,
            object,
        },
    ))
}

/// The raw bytes from the first occurence of `from` up to and including the
/// following `to`.
pub fn raw_content_between<'r>(
    raw: &'r [u8],
    from: &str,
    to: &str,
) -> Result<&'r [u8], DocumentParseError> {
    let not_found = || DocumentParseError::ContentRangeNotFound {
        from: from.to_string(),
        to: to.to_string(),
    };
    let start = memmem::find(raw, from.as_bytes()).ok_or_else(not_found)?;
    let length = memmem::find(&raw[start..], to.as_bytes()).ok_or_else(not_found)?;
    Ok(&raw[start..start + length + to.len()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_with_arguments_and_objects() {
        let text = "router test 10.0.0.1 9001 0 0\n\
                    platform Tor 0.4.8.9 on Linux\n\
                    hibernating\n\
                    onion-key\n\
                    -----BEGIN RSA PUBLIC KEY-----\n\
                    MIGJAoGBAK\n\
                    -----END RSA PUBLIC KEY-----\n\
                    \n\
                    opt fingerprint AAAA BBBB\n";
        let doc = Document::parse_single(text).unwrap();
        let keywords: Vec<_> = doc.items.iter().map(|x| x.keyword).collect();
        assert_eq!(
            keywords,
            vec!["router", "platform", "hibernating", "onion-key", "fingerprint"]
        );

        let router = doc.find("router").unwrap();
        assert_eq!(
            router.split_arguments().unwrap(),
            vec!["test", "10.0.0.1", "9001", "0", "0"]
        );
        assert!(doc.find("hibernating").unwrap().get_argument().is_err());

        let key = doc.find("onion-key").unwrap().object.as_ref().unwrap();
        assert_eq!(key.keyword, "RSA PUBLIC KEY");
        assert_eq!(key.content, "MIGJAoGBAK\n");

        assert_eq!(
            doc.find("fingerprint").unwrap().get_argument().unwrap(),
            "AAAA BBBB"
        );
    }

    #[test]
    fn mismatched_object_is_rejected() {
        let text = "onion-key\n-----BEGIN RSA PUBLIC KEY-----\nMIG\n-----END SIGNATURE-----\n";
        assert!(Document::parse_single(text).is_err());
    }

    #[test]
    fn raw_range() {
        let raw = b"router a\nbandwidth 1 2 3\nrouter-signature\n-----BEGIN SIGNATURE-----\n";
        let signed = raw_content_between(raw, "router", "\nrouter-signature\n").unwrap();
        assert_eq!(signed, b"router a\nbandwidth 1 2 3\nrouter-signature\n");
        assert!(raw_content_between(raw, "router", "\nrouter-sig\n\n").is_err());
    }
}
