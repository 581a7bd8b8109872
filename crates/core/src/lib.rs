//! lpx core types: archive resources, build states and the shared error taxonomy.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Deployment channel within a series.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Pocket {
    Release,
    Security,
    Updates,
    Proposed,
    Backports,
}

impl Pocket {
    /// Every pocket, in the order the exporter walks them.
    pub const ALL: [Pocket; 5] = [
        Pocket::Release,
        Pocket::Security,
        Pocket::Updates,
        Pocket::Proposed,
        Pocket::Backports,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Pocket::Release => "Release",
            Pocket::Security => "Security",
            Pocket::Updates => "Updates",
            Pocket::Proposed => "Proposed",
            Pocket::Backports => "Backports",
        }
    }
}

impl fmt::Display for Pocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Pocket {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pocket::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| ArchiveError::Decode(format!("unknown pocket: {s}")))
    }
}

/// Upload queue states the exporter counts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueueStatus {
    New,
    Unapproved,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 2] = [QueueStatus::New, QueueStatus::Unapproved];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::New => "New",
            QueueStatus::Unapproved => "Unapproved",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Lifecycle status of a series, as reported by the archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeriesStatus {
    ActiveDevelopment,
    Current,
    Future,
    PreReleaseFreeze,
    Supported,
    Obsolete,
    Experimental,
    Other(String),
}

impl SeriesStatus {
    /// Series in one of these states are exported when no explicit list is configured.
    pub fn is_current(&self) -> bool {
        matches!(
            self,
            SeriesStatus::ActiveDevelopment
                | SeriesStatus::Current
                | SeriesStatus::Future
                | SeriesStatus::PreReleaseFreeze
                | SeriesStatus::Supported
        )
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "Active Development" => SeriesStatus::ActiveDevelopment,
            "Current Stable Release" | "Current" => SeriesStatus::Current,
            "Future" => SeriesStatus::Future,
            "Pre-release Freeze" => SeriesStatus::PreReleaseFreeze,
            "Supported" => SeriesStatus::Supported,
            "Obsolete" => SeriesStatus::Obsolete,
            "Experimental" => SeriesStatus::Experimental,
            other => SeriesStatus::Other(other.to_string()),
        }
    }
}

/// Per-architecture build outcome.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildState {
    SuccessfullyBuilt,
    FailedToBuild,
    NeedsBuilding,
    CurrentlyBuilding,
    UploadingBuild,
    GatheringBuildOutput,
    DependencyWait,
    ChrootProblem,
    SupersededSource,
    FailedToUpload,
    CancellingBuild,
    CancelledBuild,
    Other(String),
}

impl BuildState {
    pub fn parse(s: &str) -> Self {
        match s {
            "Successfully built" => BuildState::SuccessfullyBuilt,
            "Failed to build" => BuildState::FailedToBuild,
            "Needs building" => BuildState::NeedsBuilding,
            "Currently building" => BuildState::CurrentlyBuilding,
            "Uploading build" => BuildState::UploadingBuild,
            "Gathering build output" => BuildState::GatheringBuildOutput,
            "Dependency wait" => BuildState::DependencyWait,
            "Chroot problem" => BuildState::ChrootProblem,
            "Build for superseded Source" => BuildState::SupersededSource,
            "Failed to upload" => BuildState::FailedToUpload,
            "Cancelling build" => BuildState::CancellingBuild,
            "Cancelled build" => BuildState::CancelledBuild,
            other => BuildState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            BuildState::SuccessfullyBuilt => "Successfully built",
            BuildState::FailedToBuild => "Failed to build",
            BuildState::NeedsBuilding => "Needs building",
            BuildState::CurrentlyBuilding => "Currently building",
            BuildState::UploadingBuild => "Uploading build",
            BuildState::GatheringBuildOutput => "Gathering build output",
            BuildState::DependencyWait => "Dependency wait",
            BuildState::ChrootProblem => "Chroot problem",
            BuildState::SupersededSource => "Build for superseded Source",
            BuildState::FailedToUpload => "Failed to upload",
            BuildState::CancellingBuild => "Cancelling build",
            BuildState::CancelledBuild => "Cancelled build",
            BuildState::Other(s) => s.as_str(),
        }
    }

    pub fn is_successful(&self) -> bool { matches!(self, BuildState::SuccessfullyBuilt) }
    pub fn is_failed(&self) -> bool { matches!(self, BuildState::FailedToBuild) }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Distribution {
    pub name: String,
    /// API link of the distribution resource
    pub link: String,
}

/// Primary archive of a distribution; published sources are looked up here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Archive {
    pub name: String,
    pub link: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Series {
    pub name: String,
    pub status: SeriesStatus,
    pub link: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Packageset {
    pub name: String,
    /// Name of the series this packageset belongs to
    pub series: String,
    pub link: String,
}

/// One pending upload in a series queue. Only the count is consumed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueEntry {
    pub display_name: String,
    pub link: String,
}

/// A source package version accepted into a pocket at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishedSource {
    pub source_name: String,
    pub version: String,
    pub pocket: Pocket,
    pub date_created: DateTime<Utc>,
    pub link: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildRecord {
    pub arch: String,
    pub version: String,
    pub state: BuildState,
}

/// A binary published from some build; used when a source has no builds of its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BinaryPublication {
    pub arch: String,
    pub state: BuildState,
}

/// Errors surfaced by archive clients.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ArchiveError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("http {status}: {url}")]
    Http { status: u16, url: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
}

impl ArchiveError {
    pub fn is_not_found(&self) -> bool { matches!(self, ArchiveError::NotFound(_)) }
    pub fn is_unauthorized(&self) -> bool { matches!(self, ArchiveError::Unauthorized(_)) }
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

pub mod prelude {
    pub use super::{
        Archive, ArchiveError, ArchiveResult, BinaryPublication, BuildRecord, BuildState,
        Distribution, Packageset, Pocket, PublishedSource, QueueEntry, QueueStatus, Series,
        SeriesStatus,
    };
}
