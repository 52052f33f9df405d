// src/resolver/engine.rs

//! Install graph resolution
//!
//! Turns "install package X" into the ordered, conflict-free set of packages
//! that must actually be installed, or determines the request is already
//! satisfied. Supersedence is applied before installability: a package that
//! cannot itself be acquired can still be silently satisfied by an installed
//! compatible update.
//!
//! Resolution recurses over dependency edges (identities, looked up through
//! the registry) with an explicit in-progress stack, so malformed metadata
//! that declares a cycle fails closed instead of overflowing. Dependency
//! subtree failures are aggregated rather than first-failure-wins, so one
//! pass hands the client complete diagnostics.
//!
//! Hypothetical resolution probes whether a candidate supersedent could be
//! installed. Probes never emit user-visible notifications; only the
//! outermost non-hypothetical call reports.

use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::feed::{FeedRegistry, IdentityQuery};
use crate::identity::CanonicalIdentity;
use crate::package::Package;
use crate::registry::PackageRegistry;
use crate::resolver::plan::InstallGraph;
use crate::resolver::supersedence::{ScanRule, supersedes};
use crate::session::message::Event;
use crate::signature::{SignatureVerifier, validated_local_path};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

type ResolveFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<Arc<Package>>>> + Send + 'a>>;

/// The install graph resolver
pub struct Resolver {
    registry: Arc<PackageRegistry>,
    feeds: Arc<FeedRegistry>,
    verifier: Arc<dyn SignatureVerifier>,
}

impl Resolver {
    pub fn new(
        registry: Arc<PackageRegistry>,
        feeds: Arc<FeedRegistry>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            registry,
            feeds,
            verifier,
        }
    }

    /// Resolve the ordered install graph for a package
    ///
    /// Returns an empty graph when the request is already satisfied. Raises
    /// `Unsatisfiable` when no valid graph exists; by then the diagnostic
    /// notices have been emitted on the request context.
    pub async fn resolve(
        &self,
        ctx: &RequestContext,
        package: &Arc<Package>,
    ) -> Result<InstallGraph> {
        let mut stack = Vec::new();
        let sequence = self
            .resolve_package(ctx, package.clone(), false, &mut stack)
            .await?;
        Ok(InstallGraph::from_sequence(sequence))
    }

    fn resolve_package<'a>(
        &'a self,
        ctx: &'a RequestContext,
        package: Arc<Package>,
        hypothetical: bool,
        stack: &'a mut Vec<CanonicalIdentity>,
    ) -> ResolveFuture<'a> {
        Box::pin(async move {
            ctx.check_canceled()?;
            let identity = package.identity().clone();

            // Malformed metadata can declare a dependency cycle; fail closed.
            if stack.contains(&identity) {
                warn!(package = %identity, "dependency cycle detected");
                if !hypothetical {
                    ctx.record_failure(format!("dependency cycle through {}", identity));
                }
                return Err(Error::Unsatisfiable(identity.to_string()));
            }

            // Already installed: nothing to install.
            if self.registry.is_installed(&package) {
                if !hypothetical {
                    ctx.notify_satisfied(&identity, &identity);
                }
                return Ok(Vec::new());
            }

            let data = ctx.session_data().read(&identity);

            if !data.do_not_supersede {
                let rule = ScanRule::for_request(data.client_specified, hypothetical);

                // An installed family member may already satisfy the request.
                if let Some(winner) = self
                    .registry
                    .installed_in_family(&identity)
                    .into_iter()
                    .find(|member| supersedes(member, &package, rule))
                {
                    debug!(package = %identity, by = %winner.identity(), "satisfied by installed supersedent");
                    if !hypothetical {
                        ctx.notify_satisfied(&identity, winner.identity());
                    }
                    ctx.session_data().update(&identity, |d| {
                        d.supersedent = Some(winner.identity().clone());
                    });
                    return Ok(Vec::new());
                }

                let supersedents = self.visible_supersedents(&package, rule).await?;
                if !supersedents.is_empty() {
                    let installable = self.is_potentially_installable(ctx, &package);
                    if !data.allowed_to_supersede(package.is_wanted(), installable) {
                        // The client must re-issue the request with a choice.
                        if !hypothetical {
                            ctx.emit(Event::PackageHasPotentialUpgrades {
                                package: identity.clone(),
                                supersedents: supersedents
                                    .iter()
                                    .map(|p| p.identity().clone())
                                    .collect(),
                            });
                            ctx.record_failure(format!(
                                "{} has potential upgrades requiring explicit consent",
                                identity
                            ));
                        }
                        return Err(Error::Unsatisfiable(identity.to_string()));
                    }

                    // Probe candidates newest first. Supersedence is
                    // exclusive: a successful probe replaces this package
                    // entirely.
                    for candidate in supersedents {
                        ctx.check_canceled()?;
                        match self
                            .resolve_package(ctx, candidate.clone(), true, stack)
                            .await
                        {
                            Ok(children) if !children.is_empty() => {
                                debug!(package = %identity, by = %candidate.identity(), "superseded");
                                ctx.session_data().update(&identity, |d| {
                                    d.supersedent = Some(candidate.identity().clone());
                                });
                                return Ok(children);
                            }
                            // An empty probe result means the candidate has
                            // nothing installable behind it; try the next.
                            Ok(_) => continue,
                            Err(Error::Canceled) => return Err(Error::Canceled),
                            Err(_) => continue,
                        }
                    }
                    // No candidate panned out; fall through to the package
                    // itself.
                }
            }

            // Installability and prior-failure gate.
            let installable = self.is_potentially_installable(ctx, &package);
            if !installable || data.could_not_download || data.failed_install {
                if hypothetical {
                    // Let the caller try another candidate.
                    return Ok(Vec::new());
                }
                let reason = if data.failed_install {
                    "a previous install attempt failed"
                } else if data.could_not_download {
                    "a previous download attempt failed"
                } else if package.is_blocked() {
                    "the package is blocked by policy"
                } else {
                    "no usable local file and no viable remote location"
                };
                ctx.record_failure(format!("{}: {}", identity, reason));
                ctx.emit(Event::UnableToResolve {
                    package: identity.clone(),
                    reason: reason.to_string(),
                });
                return Err(Error::Unsatisfiable(identity.to_string()));
            }

            // Resolve every dependency subtree; aggregate failures instead of
            // stopping at the first so the client sees the whole picture.
            stack.push(identity.clone());
            let mut sequence = Vec::new();
            let mut children_failed = false;
            for dep_identity in package.dependencies() {
                let dep = self.registry.get_or_add(dep_identity.clone());
                dep.set_is_dependency(true);
                match self
                    .resolve_package(ctx, dep, hypothetical, stack)
                    .await
                {
                    Ok(mut resolved) => sequence.append(&mut resolved),
                    Err(Error::Canceled) => {
                        stack.pop();
                        return Err(Error::Canceled);
                    }
                    Err(err) => {
                        warn!(package = %identity, dependency = %dep_identity, error = %err, "dependency subtree failed");
                        children_failed = true;
                    }
                }
            }
            stack.pop();

            if children_failed {
                if !hypothetical {
                    ctx.record_failure(format!(
                        "{}: one or more dependencies could not be resolved",
                        identity
                    ));
                }
                return Err(Error::Unsatisfiable(identity.to_string()));
            }

            // Dependencies first, this package last.
            sequence.push(package);
            Ok(sequence)
        })
    }

    /// All visible packages that supersede `package` under `rule`, newest
    /// first: registry family members plus whatever the feeds offer
    async fn visible_supersedents(
        &self,
        package: &Arc<Package>,
        rule: ScanRule,
    ) -> Result<Vec<Arc<Package>>> {
        let identity = package.identity();
        let mut seen: HashSet<CanonicalIdentity> = HashSet::new();
        let mut candidates = Vec::new();

        for member in self.registry.family_members(identity) {
            if seen.insert(member.identity().clone()) {
                candidates.push(member);
            }
        }
        let fed = self
            .feeds
            .find_packages(&IdentityQuery::family_of(identity))
            .await?;
        for member in fed {
            if seen.insert(member.identity().clone()) {
                candidates.push(member);
            }
        }

        let mut supersedents: Vec<Arc<Package>> = candidates
            .into_iter()
            .filter(|candidate| supersedes(candidate, package, rule))
            .collect();
        supersedents.sort_by(|a, b| b.version().cmp(&a.version()));
        Ok(supersedents)
    }

    /// Whether the package could be installed some way during this request:
    /// not blocked, no recorded install failure, and either a
    /// signature-validated local file or at least one remote location
    fn is_potentially_installable(&self, ctx: &RequestContext, package: &Arc<Package>) -> bool {
        if package.is_blocked() {
            return false;
        }
        if ctx.session_data().read(package.identity()).failed_install {
            return false;
        }
        validated_local_path(package, ctx.session_data(), self.verifier.as_ref()).is_some()
            || package.has_remote_locations()
    }
}
