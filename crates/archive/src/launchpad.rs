//! Anonymous Launchpad REST client (read-only).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lpx_core::prelude::*;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::ArchiveClient;

/// Connection settings for [`LaunchpadClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchpadConfig {
    /// API root including the version segment, e.g. `https://api.launchpad.net/devel/`
    pub api_root: String,
    /// Per-request timeout; a hung request would otherwise stall a refresh loop
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for LaunchpadConfig {
    fn default() -> Self {
        Self {
            api_root: "https://api.launchpad.net/devel/".to_string(),
            timeout_secs: 60,
            user_agent: concat!("launchpad-exporter/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

pub struct LaunchpadClient {
    http: Client,
    root: String,
}

#[derive(Debug, Deserialize)]
struct Collection<T> {
    #[serde(default = "Vec::new")]
    entries: Vec<T>,
    #[serde(default)]
    next_collection_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedLink {
    name: String,
    self_link: String,
}

#[derive(Debug, Deserialize)]
struct SeriesEntry {
    name: String,
    status: String,
    self_link: String,
}

#[derive(Debug, Deserialize)]
struct UploadEntry {
    #[serde(default)]
    display_name: String,
    self_link: String,
}

#[derive(Debug, Deserialize)]
struct PublicationEntry {
    source_package_name: String,
    source_package_version: String,
    pocket: String,
    date_created: DateTime<Utc>,
    self_link: String,
}

#[derive(Debug, Deserialize)]
struct BuildEntry {
    arch_tag: String,
    buildstate: String,
}

#[derive(Debug, Deserialize)]
struct BinaryEntry {
    build_link: String,
    distro_arch_series_link: String,
}

fn map_status(status: StatusCode, url: &str) -> ArchiveError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ArchiveError::Unauthorized(url.to_string()),
        StatusCode::NOT_FOUND => ArchiveError::NotFound(url.to_string()),
        other => ArchiveError::Http { status: other.as_u16(), url: url.to_string() },
    }
}

/// Last path segment of an API link (`.../noble/amd64` → `amd64`).
fn last_segment(link: &str) -> &str {
    link.trim_end_matches('/').rsplit('/').next().unwrap_or(link)
}

impl LaunchpadClient {
    pub fn new(cfg: &LaunchpadConfig) -> ArchiveResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .user_agent(cfg.user_agent.clone())
            .build()
            .map_err(|e| ArchiveError::Transport(e.to_string()))?;
        let mut root = cfg.api_root.clone();
        if !root.ends_with('/') {
            root.push('/');
        }
        Ok(Self { http, root })
    }

    fn get<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> ArchiveResult<T> {
        trace!(url = %url, ?query, "GET");
        let resp = self
            .http
            .get(url)
            .header("Accept", "application/json")
            .query(query)
            .send()
            .map_err(|e| ArchiveError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(map_status(status, url));
        }
        resp.json::<T>().map_err(|e| ArchiveError::Decode(format!("{url}: {e}")))
    }

    /// Fetch every page of a collection.
    fn collect_all<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> ArchiveResult<Vec<T>> {
        let mut page: Collection<T> = self.get(url, query)?;
        let mut out = std::mem::take(&mut page.entries);
        let mut next = page.next_collection_link.take();
        while let Some(link) = next {
            // next_collection_link already carries the original query
            let mut page: Collection<T> = self.get(&link, &[])?;
            out.append(&mut page.entries);
            next = page.next_collection_link;
        }
        Ok(out)
    }
}

impl ArchiveClient for LaunchpadClient {
    fn resolve_distribution(&self, name: &str) -> ArchiveResult<Distribution> {
        let e: NamedLink = self.get(&format!("{}{}", self.root, name), &[])?;
        Ok(Distribution { name: e.name, link: e.self_link })
    }

    fn resolve_series(&self, distribution: &Distribution, name: &str) -> ArchiveResult<Series> {
        let e: SeriesEntry = self.get(
            &distribution.link,
            &[("ws.op", "getSeries".into()), ("name_or_version", name.to_string())],
        )?;
        Ok(Series { name: e.name, status: SeriesStatus::parse(&e.status), link: e.self_link })
    }

    fn list_current_series_names(&self, distribution: &Distribution) -> ArchiveResult<Vec<String>> {
        let all: Vec<SeriesEntry> = self.collect_all(&format!("{}/series", distribution.link), &[])?;
        debug!(distribution = %distribution.name, total = all.len(), "listed series");
        Ok(all
            .into_iter()
            .filter(|s| SeriesStatus::parse(&s.status).is_current())
            .map(|s| s.name)
            .collect())
    }

    fn resolve_archive(&self, distribution: &Distribution) -> ArchiveResult<Archive> {
        let e: NamedLink = self.get(&format!("{}/+archive/primary", distribution.link), &[])?;
        Ok(Archive { name: e.name, link: e.self_link })
    }

    fn list_packagesets(&self, series: &Series) -> ArchiveResult<Vec<String>> {
        let sets: Vec<NamedLink> = self.collect_all(
            &format!("{}package-sets", self.root),
            &[("ws.op", "getBySeries".into()), ("distroseries", series.link.clone())],
        )?;
        Ok(sets.into_iter().map(|p| p.name).collect())
    }

    fn resolve_packageset(&self, series: &Series, name: &str) -> ArchiveResult<Packageset> {
        let e: NamedLink = self.get(
            &format!("{}package-sets", self.root),
            &[("ws.op", "getByName".into()), ("distroseries", series.link.clone()), ("name", name.to_string())],
        )?;
        Ok(Packageset { name: e.name, series: series.name.clone(), link: e.self_link })
    }

    fn list_packageset_sources(&self, packageset: &Packageset) -> ArchiveResult<Vec<String>> {
        self.get(&packageset.link, &[("ws.op", "getSourcesIncluded".into())])
    }

    fn list_queue(&self, series: &Series, status: QueueStatus, pocket: Pocket) -> ArchiveResult<Vec<QueueEntry>> {
        let uploads: Vec<UploadEntry> = self.collect_all(
            &series.link,
            &[
                ("ws.op", "getPackageUploads".into()),
                ("status", status.as_str().to_string()),
                ("pocket", pocket.as_str().to_string()),
            ],
        )?;
        Ok(uploads
            .into_iter()
            .map(|u| QueueEntry { display_name: u.display_name, link: u.self_link })
            .collect())
    }

    fn latest_published_source(
        &self,
        archive: &Archive,
        series: &Series,
        pocket: Pocket,
        source_name: &str,
        created_since: Option<DateTime<Utc>>,
    ) -> ArchiveResult<Option<PublishedSource>> {
        let mut query = vec![
            ("ws.op", "getPublishedSources".to_string()),
            ("source_name", source_name.to_string()),
            ("exact_match", "true".to_string()),
            ("pocket", pocket.as_str().to_string()),
            ("distro_series", series.link.clone()),
            ("order_by_date", "true".to_string()),
            ("ws.size", "1".to_string()),
        ];
        if let Some(since) = created_since {
            query.push(("created_since_date", since.to_rfc3339()));
        }
        let page: Collection<PublicationEntry> = self.get(&archive.link, &query)?;
        let Some(e) = page.entries.into_iter().next() else { return Ok(None) };
        Ok(Some(PublishedSource {
            source_name: e.source_package_name,
            version: e.source_package_version,
            pocket: e.pocket.parse().unwrap_or(pocket),
            date_created: e.date_created,
            link: e.self_link,
        }))
    }

    fn build_records(&self, source: &PublishedSource) -> ArchiveResult<Vec<BuildRecord>> {
        let builds: Vec<BuildEntry> = self.collect_all(&source.link, &[("ws.op", "getBuilds".into())])?;
        Ok(builds
            .into_iter()
            .map(|b| BuildRecord { arch: b.arch_tag, version: source.version.clone(), state: BuildState::parse(&b.buildstate) })
            .collect())
    }

    fn binary_publications(&self, source: &PublishedSource) -> ArchiveResult<Vec<BinaryPublication>> {
        let bins: Vec<BinaryEntry> = self.collect_all(&source.link, &[("ws.op", "getPublishedBinaries".into())])?;
        // Many binaries share one build; look each build up once.
        let mut states: HashMap<String, BuildState> = HashMap::new();
        let mut out = Vec::with_capacity(bins.len());
        for b in bins {
            let state = match states.get(&b.build_link) {
                Some(s) => s.clone(),
                None => {
                    let build: BuildEntry = self.get(&b.build_link, &[])?;
                    let s = BuildState::parse(&build.buildstate);
                    states.insert(b.build_link.clone(), s.clone());
                    s
                }
            };
            out.push(BinaryPublication { arch: last_segment(&b.distro_arch_series_link).to_string(), state });
        }
        Ok(out)
    }
}
