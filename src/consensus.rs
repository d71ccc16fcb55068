//! Tor consensus documents

use std::io::BufRead;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::annotation::AcceptanceSet;
use crate::archive::{ArchiveResolver, Digested};
use crate::descriptor::{parse_time, Descriptor, DescriptorDecoder};
use crate::error::{ArchiveError, DocumentError, DocumentParseError};
use crate::fingerprint::{string_to_port, Fingerprint};
use crate::meta::Document;
use crate::records::{FieldDecoder, RecordStream, Span};

//
// External dependencies
//
use chrono::{DateTime, Utc};
use derive_builder::Builder;
use strum::{EnumString, EnumVariantNames, IntoStaticStr, VariantNames};
use tracing::warn;

/// A relay flag in the consensus
#[derive(Debug, Clone, Copy, EnumString, EnumVariantNames, IntoStaticStr, PartialEq, Eq)]
pub enum Flag {
    Authority,
    BadExit,
    Exit,
    Fast,
    Guard,
    HSDir,
    Named,
    Unnamed,
    NoEdConsensus,
    Running,
    Stable,
    StaleDesc,
    Sybil,
    V2Dir,
    Valid,
}

impl Flag {
    pub fn known_flags_string() -> String {
        Flag::VARIANTS.join(" ")
    }
}

/// A parsed consensus document ("network status").
#[derive(Debug)]
pub struct Consensus {
    pub valid_after: DateTime<Utc>,
    pub fresh_until: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub relays: Vec<RouterStatus>,
}

/// A relay entry within the consensus, containing only these sparse information
/// instead of the full server descriptor
#[derive(Debug, Clone, Builder)]
#[builder(private)]
pub struct RouterStatus {
    pub nickname: String,
    pub fingerprint: Fingerprint,
    /// Digest of the relay's current server descriptor
    pub digest: Fingerprint,
    pub published: DateTime<Utc>,
    pub address: Ipv4Addr,
    pub or_port: u16,
    pub dir_port: Option<u16>,
    #[builder(default)]
    pub flags: Vec<Flag>,
    #[builder(default)]
    pub version_line: Option<String>,
    #[builder(default)]
    pub bandwidth_weight: Option<u64>,
    /// The `p` line as is, e.g. `accept 80,443`
    #[builder(default)]
    pub exit_policy_summary: Option<String>,
}

impl Digested for RouterStatus {
    fn digest(&self) -> &Fingerprint {
        &self.digest
    }
}

impl RouterStatus {
    fn from_doc(doc: &Document) -> Result<RouterStatus, DocumentParseError> {
        let mut relay = RouterStatusBuilder::default();

        for item in doc.items.iter() {
            match item.keyword {
                "r" => {
                    let splits = item.split_arguments()?;
                    match splits[..] {
                        [nickname, identity, digest, published_1, published_2, ip, or_port, dir_port, ..] =>
                        {
                            relay.nickname(nickname.to_string());
                            relay.fingerprint(Fingerprint::from_str_b64(identity)?);
                            relay.digest(Fingerprint::from_str_b64(digest)?);
                            relay.published(parse_time(&format!("{published_1} {published_2}"))?);
                            relay.address(Ipv4Addr::from_str(ip).map_err(|_| {
                                DocumentParseError::InvalidIpAddress(ip.to_string())
                            })?);
                            relay.or_port(string_to_port(or_port));
                            relay.dir_port(match string_to_port(dir_port) {
                                0 => None,
                                x => Some(x),
                            });
                        }
                        _ => return Err(DocumentParseError::args_missing(item.keyword)),
                    }
                }
                "s" => {
                    let flags = item
                        .arguments
                        .unwrap_or("")
                        .split_whitespace()
                        .map(|x| {
                            x.parse::<Flag>()
                                .map_err(|_| DocumentParseError::UnknownFlag {
                                    flag: x.to_string(),
                                })
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    relay.flags(flags);
                }
                "v" => {
                    relay.version_line(item.arguments.map(str::to_string));
                }
                "w" => {
                    for arg in item.split_arguments()? {
                        let (k, v) = arg
                            .split_once('=')
                            .ok_or(DocumentParseError::InvalidBandwidthWeight)?;
                        if k == "Bandwidth" {
                            relay.bandwidth_weight(Some(
                                v.parse::<u64>()
                                    .map_err(|_| DocumentParseError::InvalidBandwidthWeight)?,
                            ));
                        }
                    }
                }
                "p" => {
                    relay.exit_policy_summary(Some(item.get_argument()?.to_string()));
                }
                // "a", "m", "pr" and friends are not needed here
                _ => {}
            }
        }

        relay
            .build()
            .map_err(|err| DocumentParseError::Incomplete(Box::new(err)))
    }
}

/// Decodes the router status entries of a consensus
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterStatusDecoder;

impl FieldDecoder for RouterStatusDecoder {
    type Record = RouterStatus;

    fn start_keyword(&self) -> &str {
        "r"
    }

    fn has_preamble(&self) -> bool {
        true
    }

    fn is_terminator(&self, keyword: &str) -> bool {
        keyword == "directory-footer"
    }

    fn decode(&self, span: &Span) -> Result<RouterStatus, DocumentParseError> {
        RouterStatus::from_doc(&Document::parse_single(span.text()?)?)
    }
}

impl Consensus {
    /// Parse a consensus document from raw text, including its `@type` line.
    pub fn from_str(text: impl AsRef<str>) -> Result<Consensus, DocumentError> {
        Self::from_reader(text.as_ref().as_bytes())
    }

    /// Parse a consensus document from a reader, including its `@type` line.
    ///
    /// Router status entries that cannot be decoded are skipped.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Consensus, DocumentError> {
        let mut entries =
            RecordStream::open(reader, RouterStatusDecoder, &AcceptanceSet::consensus())?;

        let mut relays = Vec::new();
        for entry in entries.by_ref() {
            let entry = entry?;
            match entry.record {
                Ok(relay) => relays.push(relay),
                Err(e) => {
                    warn!(line = entry.first_line, error = %e, "skipping router status entry")
                }
            }
        }

        let header = std::str::from_utf8(entries.preamble()).map_err(DocumentParseError::from)?;
        let header = Document::parse_single(header)?;
        let header_time = |keyword: &str| -> Result<DateTime<Utc>, DocumentParseError> {
            let item = header
                .find(keyword)
                .ok_or_else(|| DocumentParseError::ItemMissing {
                    keyword: keyword.to_string(),
                })?;
            parse_time(item.get_argument()?)
        };

        Ok(Consensus {
            valid_after: header_time("valid-after")?,
            fresh_until: header_time("fresh-until")?,
            valid_until: header_time("valid-until")?,
            relays,
        })
    }

    /// Retrieve the descriptors referenced in this consensus from an archive.
    ///
    /// Descriptors are looked up in the month of `valid-after` and the month
    /// before. Descriptors missing from the archive are skipped.
    pub fn retrieve_descriptors(
        &self,
        resolver: &ArchiveResolver,
    ) -> Result<Vec<Descriptor>, ArchiveError> {
        let mut descriptors = Vec::new();
        for relay in self.relays.iter() {
            let digest = format!("{:x}", relay.digest);
            match resolver.load_from_digest(&DescriptorDecoder, &digest, &self.valid_after) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(ArchiveError::NotFound { .. }) => {
                    warn!(nickname = %relay.nickname, %digest, "descriptor not in archive");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(descriptors)
    }
}
