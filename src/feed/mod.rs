// src/feed/mod.rs

//! Package feed capability and registry
//!
//! Feeds supply candidate packages for identity queries. Parsing feed formats
//! is an external collaborator concern; the core consumes only the
//! `PackageFeed` trait. The `FeedRegistry` owns the set of known feeds and
//! the one-time system feed load: the first caller pays for the load behind a
//! lock, every later caller takes a cheap already-loaded fast path without
//! acquiring it.

use crate::error::Result;
use crate::identity::CanonicalIdentity;
use crate::package::Package;
use crate::version::PackageVersion;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A query against the feed layer
///
/// Matches by name plus any of the optional narrowing fields.
#[derive(Debug, Clone, Default)]
pub struct IdentityQuery {
    pub name: String,
    pub version: Option<PackageVersion>,
    pub architecture: Option<crate::identity::Architecture>,
    pub public_key_token: Option<String>,
}

impl IdentityQuery {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// A query matching every member of an identity's family
    pub fn family_of(identity: &CanonicalIdentity) -> Self {
        Self {
            name: identity.name.clone(),
            version: None,
            architecture: Some(identity.architecture.clone()),
            public_key_token: Some(identity.public_key_token.clone()),
        }
    }

    /// Whether a concrete identity satisfies this query
    pub fn matches(&self, identity: &CanonicalIdentity) -> bool {
        if identity.name != self.name {
            return false;
        }
        if let Some(ref version) = self.version {
            if identity.version != *version {
                return false;
            }
        }
        if let Some(ref arch) = self.architecture {
            if identity.architecture != *arch {
                return false;
            }
        }
        if let Some(ref token) = self.public_key_token {
            if identity.public_key_token != *token {
                return false;
            }
        }
        true
    }
}

/// Capability supplied by each feed implementation
#[async_trait]
pub trait PackageFeed: Send + Sync {
    /// Candidate packages for a query. A stale feed rescans its backing
    /// source before answering and clears its stale flag.
    async fn find_packages(&self, query: &IdentityQuery) -> Result<Vec<Arc<Package>>>;

    /// Whether a location string refers to this feed
    fn is_location_match(&self, location: &str) -> bool;

    /// Where this feed's content comes from
    fn location(&self) -> &str;

    fn is_stale(&self) -> bool;

    /// Force a rescan on the next query
    fn set_stale(&self, stale: bool);
}

/// The set of feeds the daemon consults
pub struct FeedRegistry {
    feeds: RwLock<Vec<Arc<dyn PackageFeed>>>,
    loaded: AtomicBool,
    load_lock: Mutex<()>,
}

impl FeedRegistry {
    pub fn new() -> Self {
        Self {
            feeds: RwLock::new(Vec::new()),
            loaded: AtomicBool::new(false),
            load_lock: Mutex::new(()),
        }
    }

    /// Run the one-time system feed load
    ///
    /// The first caller executes `load` while holding the load lock;
    /// concurrent callers block behind it until the load completes. Once
    /// loaded, callers return on the atomic fast path without the lock.
    pub async fn ensure_loaded<F, Fut>(&self, load: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<Arc<dyn PackageFeed>>>>,
    {
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }

        let _guard = self.load_lock.lock().await;
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }

        let feeds = load().await?;
        info!(count = feeds.len(), "system feeds loaded");
        self.feeds.write().extend(feeds);
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn add_feed(&self, feed: Arc<dyn PackageFeed>) {
        self.feeds.write().push(feed);
    }

    pub fn feeds(&self) -> Vec<Arc<dyn PackageFeed>> {
        self.feeds.read().clone()
    }

    /// Query every feed and concatenate candidates, deduplicated by identity
    pub async fn find_packages(&self, query: &IdentityQuery) -> Result<Vec<Arc<Package>>> {
        let feeds = self.feeds();
        let mut seen = std::collections::HashSet::new();
        let mut results = Vec::new();
        for feed in feeds {
            for package in feed.find_packages(query).await? {
                if seen.insert(package.identity().clone()) {
                    results.push(package);
                }
            }
        }
        Ok(results)
    }

    /// Mark feeds matching a location as stale
    pub fn set_stale_matching(&self, location: &str) {
        for feed in self.feeds.read().iter() {
            if feed.is_location_match(location) {
                debug!(feed = feed.location(), "marking feed stale");
                feed.set_stale(true);
            }
        }
    }

    /// Mark every feed stale (e.g. after a package installed)
    pub fn set_all_stale(&self) {
        for feed in self.feeds.read().iter() {
            feed.set_stale(true);
        }
    }
}

impl Default for FeedRegistry {
    fn default() -> Self {
        Self::new()
    }
}
