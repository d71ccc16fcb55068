//! Tor server descriptor documents

use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::str::FromStr;

use crate::annotation::AcceptanceSet;
use crate::error::{AnnotationError, DocumentError, DocumentParseError, ErrorContext};
use crate::fingerprint::{sanitise_fingerprint, string_to_port, Fingerprint};
use crate::meta::{raw_content_between, Document};
use crate::records::{FieldDecoder, RecordStream, Span};

//
// External dependencies
//
use chrono::{offset::TimeZone, DateTime, NaiveDateTime, Utc};
use derive_builder::Builder;
use sha1::{Digest, Sha1};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FamilyMember {
    Fingerprint(Fingerprint),
    Nickname(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrAddress {
    pub ip: IpAddr,
    pub port: u16,
}

/// A relay server descriptor.
///
/// Only the fields needed to identify and characterize a relay are decoded;
/// exit policies, keys and signatures are left alone.
#[derive(Debug, Clone, Builder)]
#[builder(private)]
pub struct Descriptor {
    pub nickname: String,
    pub address: Ipv4Addr,
    pub or_port: u16,
    /// 0 if the relay has no directory port
    pub dir_port: u16,
    /// Additional addresses from `or-address` lines
    #[builder(setter(custom), default)]
    pub or_addresses: Vec<OrAddress>,
    #[builder(default)]
    pub platform: Option<String>,
    pub published: DateTime<Utc>,
    pub fingerprint: Fingerprint,
    #[builder(default)]
    pub uptime: Option<u64>,
    pub bandwidth_avg: u64,
    pub bandwidth_burst: u64,
    pub bandwidth_observed: u64,
    #[builder(default)]
    pub family_members: Vec<FamilyMember>,
    #[builder(default)]
    pub contact: Option<String>,
    #[builder(default)]
    pub hibernating: bool,
    /// SHA-1 over the signed part of the descriptor; the name the descriptor
    /// is archived under
    pub digest: Fingerprint,
}

impl DescriptorBuilder {
    fn add_or_address(&mut self, or: OrAddress) {
        self.or_addresses.get_or_insert_with(Vec::new).push(or);
    }
}

impl Descriptor {
    /// Parse a single descriptor (without type annotation) from raw text.
    pub fn from_str(text: impl AsRef<str>) -> Result<Descriptor, DocumentParseError> {
        DescriptorDecoder.decode(&Span::new(1, text.as_ref()))
    }

    /// Parse a descriptor from the raw bytes of its record.
    pub(crate) fn from_raw(raw: &[u8]) -> Result<Descriptor, DocumentParseError> {
        let text = std::str::from_utf8(raw)?;
        let doc = Document::parse_single(text)?;
        let mut builder = DescriptorBuilder::default();

        builder.digest(digest_from_raw(raw_content_between(
            raw,
            "router ",
            "\nrouter-signature\n",
        )?));

        for item in doc.items.iter() {
            match item.keyword {
                "router" => {
                    let splits = item.split_arguments()?;
                    match splits[..] {
                        // nickname address ORPort SOCKSPort DirPort
                        [nickname, ip, or_port, _socks_port, dir_port, ..] => {
                            builder.nickname(nickname.to_string());
                            builder.address(Ipv4Addr::from_str(ip).map_err(|_| {
                                DocumentParseError::InvalidIpAddress(ip.to_string())
                            })?);
                            builder.or_port(string_to_port(or_port));
                            builder.dir_port(string_to_port(dir_port));
                        }
                        _ => return Err(DocumentParseError::args_missing(item.keyword)),
                    }
                }
                "fingerprint" => {
                    // groups of four hex characters
                    let joined = item.split_arguments()?.concat();
                    builder.fingerprint(Fingerprint::from_str_hex(&sanitise_fingerprint(
                        &joined,
                    ))?);
                }
                "platform" => {
                    builder.platform(Some(item.get_argument()?.to_string()));
                }
                "published" => {
                    builder.published(parse_time(item.get_argument()?)?);
                }
                "uptime" => {
                    builder.uptime(Some(item.get_argument()?.parse::<u64>().context("uptime")?));
                }
                "bandwidth" => {
                    let splits = item.split_arguments()?;
                    match splits[..] {
                        // bandwidth-avg bandwidth-burst bandwidth-observed
                        [bandwidth_avg, bandwidth_burst, bandwidth_observed, ..] => {
                            builder.bandwidth_avg(
                                bandwidth_avg.parse::<u64>().context("bandwidth")?,
                            );
                            builder.bandwidth_burst(
                                bandwidth_burst.parse::<u64>().context("bandwidth")?,
                            );
                            builder.bandwidth_observed(
                                bandwidth_observed.parse::<u64>().context("bandwidth")?,
                            );
                        }
                        _ => return Err(DocumentParseError::args_missing(item.keyword)),
                    }
                }
                "family" => {
                    let family_members = item
                        .split_arguments()?
                        .iter()
                        .map(|x| -> Result<FamilyMember, DocumentParseError> {
                            match x.strip_prefix('$') {
                                // "$fingerprint" or "$fingerprint=nickname"
                                Some(hex) => {
                                    let hex = hex.split(['=', '~']).next().unwrap_or(hex);
                                    Ok(FamilyMember::Fingerprint(Fingerprint::from_str_hex(hex)?))
                                }
                                None => Ok(FamilyMember::Nickname(x.to_string())),
                            }
                        })
                        .collect::<Result<Vec<FamilyMember>, DocumentParseError>>()?;
                    builder.family_members(family_members);
                }
                "contact" => {
                    builder.contact(item.arguments.map(str::to_string));
                }
                "hibernating" => {
                    builder.hibernating(item.get_argument()? == "1");
                }
                "or-address" => {
                    builder.add_or_address(parse_or_address(item.get_argument()?)?);
                }
                _ => {}
            }
        }

        builder
            .build()
            .map_err(|e| DocumentParseError::Incomplete(Box::new(e)))
    }
}

/// Parse `[IPv6]:port` or `IPv4:port`.
fn parse_or_address(arg: &str) -> Result<OrAddress, DocumentParseError> {
    let (ip, port) = arg
        .rsplit_once(':')
        .ok_or_else(|| DocumentParseError::args_missing("or-address"))?;
    let ip_str = ip.trim_start_matches('[').trim_end_matches(']');
    let ip = IpAddr::from_str(ip_str)
        .map_err(|_| DocumentParseError::InvalidIpAddress(ip_str.to_string()))?;
    Ok(OrAddress {
        ip,
        port: port.parse::<u16>().context("or-address port")?,
    })
}

pub(crate) fn parse_time(s: &str) -> Result<DateTime<Utc>, DocumentParseError> {
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// Compute a descriptor's digest given the extracted raw content
pub fn digest_from_raw<R: AsRef<[u8]>>(raw: R) -> Fingerprint {
    let mut hasher = Sha1::new();
    hasher.update(raw.as_ref());
    let result = hasher.finalize();
    Fingerprint::from_u8(&result)
}

/// Decodes the records of a server descriptor archive
#[derive(Debug, Clone, Copy, Default)]
pub struct DescriptorDecoder;

impl FieldDecoder for DescriptorDecoder {
    type Record = Descriptor;

    fn start_keyword(&self) -> &str {
        "router"
    }

    fn decode(&self, span: &Span) -> Result<Descriptor, DocumentParseError> {
        Descriptor::from_raw(span.raw())
    }
}

/// Lazily read all descriptors of a server descriptor file.
pub fn open_descriptor_file(
    path: impl AsRef<Path>,
) -> Result<RecordStream<BufReader<File>, DescriptorDecoder>, DocumentError> {
    let file = File::open(path.as_ref()).map_err(AnnotationError::Io)?;
    Ok(RecordStream::open(
        BufReader::new(file),
        DescriptorDecoder,
        &AcceptanceSet::server_descriptor(),
    )?)
}
