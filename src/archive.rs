//! Looking up archived documents by digest
//!
//! CollecTor publishes descriptors in monthly archives. A consensus (or any
//! other reference) names a descriptor only by its digest, and the descriptor
//! may have been published in the month before the reference date. The
//! [`ArchiveResolver`] therefore searches the reference month first and then
//! exactly one month back.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::annotation::AcceptanceSet;
use crate::descriptor::{Descriptor, DescriptorDecoder};
use crate::error::{AnnotationError, ArchiveError};
use crate::fingerprint::{sanitise_fingerprint, Fingerprint};
use crate::records::{FieldDecoder, RecordStream};

//
// External dependencies
//
use chrono::Datelike;
use derive_builder::Builder;
use tracing::{debug, trace};

/// Records that can be looked up by their digest
pub trait Digested {
    fn digest(&self) -> &Fingerprint;
}

impl Digested for Descriptor {
    fn digest(&self) -> &Fingerprint {
        &self.digest
    }
}

/// A calendar month
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn of(date: &impl Datelike) -> Period {
        Period {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn previous(self) -> Period {
        if self.month <= 1 {
            Period {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Period {
                year: self.year,
                month: self.month - 1,
            }
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Where in an archive the records of a month are kept
pub trait ArchiveLayout: fmt::Debug {
    /// Path of the file that holds `digest` if it was published in `period`.
    fn locate(&self, root: &Path, period: Period, digest: &str) -> PathBuf;
}

/// One file per month holding all descriptors of that month,
/// e.g. `server-descriptors-2014-12`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthlyFiles {
    pub prefix: String,
}

impl Default for MonthlyFiles {
    fn default() -> Self {
        MonthlyFiles {
            prefix: "server-descriptors".to_string(),
        }
    }
}

impl ArchiveLayout for MonthlyFiles {
    fn locate(&self, root: &Path, period: Period, _digest: &str) -> PathBuf {
        root.join(format!("{}-{}", self.prefix, period))
    }
}

/// An extracted CollecTor tarball: one file per descriptor, sharded by the
/// first two characters of the digest,
/// e.g. `server-descriptors-2014-12/7/a/7aef...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardedDirectories {
    pub prefix: String,
}

impl Default for ShardedDirectories {
    fn default() -> Self {
        ShardedDirectories {
            prefix: "server-descriptors".to_string(),
        }
    }
}

impl ArchiveLayout for ShardedDirectories {
    fn locate(&self, root: &Path, period: Period, digest: &str) -> PathBuf {
        let digest = digest.to_lowercase();
        let mut path = root.join(format!("{}-{}", self.prefix, period));
        for shard in digest.chars().take(2) {
            path.push(shard.to_string());
        }
        path.join(digest)
    }
}

/// Finds records in a dated archive by their digest.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct ArchiveResolver {
    root: PathBuf,
    #[builder(setter(custom), default = "Arc::new(MonthlyFiles::default())")]
    layout: Arc<dyn ArchiveLayout + Send + Sync>,
    #[builder(default = "AcceptanceSet::server_descriptor()")]
    accepted: AcceptanceSet,
}

impl ArchiveResolverBuilder {
    pub fn layout(&mut self, layout: impl ArchiveLayout + Send + Sync + 'static) -> &mut Self {
        self.layout = Some(Arc::new(layout));
        self
    }
}

impl ArchiveResolver {
    /// A resolver for monthly server descriptor files below `root`.
    pub fn new(root: impl Into<PathBuf>) -> ArchiveResolver {
        ArchiveResolver {
            root: root.into(),
            layout: Arc::new(MonthlyFiles::default()),
            accepted: AcceptanceSet::server_descriptor(),
        }
    }

    pub fn builder() -> ArchiveResolverBuilder {
        ArchiveResolverBuilder::default()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Find the record with the given digest, published in the month of
    /// `date` or the month before.
    ///
    /// `digest` is compared case-insensitively. Only the two archive files of
    /// these months are read. A digest that is not 40 hex characters is never
    /// found and touches no file.
    pub fn load_from_digest<D>(
        &self,
        decoder: &D,
        digest: &str,
        date: &impl Datelike,
    ) -> Result<D::Record, ArchiveError>
    where
        D: FieldDecoder,
        D::Record: Digested,
    {
        let wanted = sanitise_fingerprint(digest);
        let current = Period::of(date);
        let mut searched = Vec::new();

        if Fingerprint::from_str_hex(&wanted).is_err() {
            debug!(digest = %wanted, "not a hex digest, nothing to search");
        } else {
            for period in [current, current.previous()] {
                let path = self.layout.locate(&self.root, period, &wanted);
                trace!(%period, path = %path.display(), "searching archive");
                if let Some(record) = self.search_file(decoder, &path, &wanted)? {
                    return Ok(record);
                }
                searched.push(path);
            }
        }

        Err(ArchiveError::NotFound {
            digest: wanted,
            searched,
        })
    }

    /// Scan one archive file; `Ok(None)` if it is absent or lacks the digest.
    fn search_file<D>(
        &self,
        decoder: &D,
        path: &Path,
        wanted: &str,
    ) -> Result<Option<D::Record>, ArchiveError>
    where
        D: FieldDecoder,
        D::Record: Digested,
    {
        let io_error = |source: io::Error| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        };

        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "archive file not present");
                return Ok(None);
            }
            Err(e) => return Err(io_error(e)),
        };
        let metadata = file.metadata().map_err(io_error)?;
        if metadata.is_file() && metadata.len() == 0 {
            debug!(path = %path.display(), "archive file is empty");
            return Ok(None);
        }

        let records = RecordStream::open(BufReader::new(file), decoder, &self.accepted)
            .map_err(|e| match e {
                AnnotationError::Io(source) => io_error(source),
                other => ArchiveError::Annotation(other),
            })?;
        for entry in records {
            let entry = entry?;
            match entry.record {
                Ok(record) if record.digest().matches(wanted) => return Ok(Some(record)),
                Ok(_) => {}
                Err(e) => {
                    debug!(path = %path.display(), line = entry.first_line, error = %e, "skipping undecodable record")
                }
            }
        }
        Ok(None)
    }
}

/// Find the server descriptor with `digest` in the monthly descriptor files
/// below `root`, searching the month of `date` and the month before.
///
/// Extracted CollecTor tarballs (one file per descriptor, sharded by digest)
/// need an [`ArchiveResolver`] with the [`ShardedDirectories`] layout instead.
pub fn load_descriptor_from_digest(
    root: impl AsRef<Path>,
    digest: &str,
    date: &impl Datelike,
) -> Result<Descriptor, ArchiveError> {
    ArchiveResolver::new(root.as_ref()).load_from_digest(&DescriptorDecoder, digest, date)
}
