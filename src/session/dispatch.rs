// src/session/dispatch.rs

//! Inbound request dispatch
//!
//! Routes parsed requests from a session's processing worker into the
//! resolver/orchestrator core. Failures inside a handler are captured here
//! and reported back as a structured `unexpected-failure` event scoped to the
//! request's correlation id; one bad request never ends the session.

use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::feed::{FeedRegistry, IdentityQuery};
use crate::identity::CanonicalIdentity;
use crate::orchestrator::{Completed, InstallRequest, Orchestrator};
use crate::registry::PackageRegistry;
use crate::session::message::{Event, OutboundMessage, Request, RequestOutcome, START_SESSION};
use crate::session::{Session, SessionKey};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Policy names used by the dispatcher
pub mod policy {
    pub const CONNECT: &str = "session/connect";
    pub const INSTALL: &str = "package/install";
    pub const QUERY: &str = "package/query";
}

/// Permission-policy capability
///
/// The policy store itself is an external collaborator; the core only asks
/// yes/no questions about a session identity and a policy name.
pub trait PermissionCheck: Send + Sync {
    fn is_allowed(&self, key: &SessionKey, policy: &str) -> bool;
}

/// Permissive default used by tests and single-user deployments
pub struct AllowAll;

impl PermissionCheck for AllowAll {
    fn is_allowed(&self, _key: &SessionKey, _policy: &str) -> bool {
        true
    }
}

/// Routes session requests into the daemon core
pub struct Dispatcher {
    registry: Arc<PackageRegistry>,
    feeds: Arc<FeedRegistry>,
    orchestrator: Arc<Orchestrator>,
    permissions: Arc<dyn PermissionCheck>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<PackageRegistry>,
        feeds: Arc<FeedRegistry>,
        orchestrator: Arc<Orchestrator>,
        permissions: Arc<dyn PermissionCheck>,
    ) -> Self {
        Self {
            registry,
            feeds,
            orchestrator,
            permissions,
        }
    }

    pub fn permissions(&self) -> &Arc<dyn PermissionCheck> {
        &self.permissions
    }

    /// Dispatch one request, containing any handler failure
    pub async fn dispatch(&self, session: Arc<Session>, request: Request) {
        let correlation_id = request.correlation_id.clone();
        debug!(session = %session.key().session_id, command = %request.command, "dispatch");

        match self.handle(session.clone(), &request).await {
            Ok(()) => {}
            Err(Error::PermissionDenied(policy)) => {
                session.enqueue(OutboundMessage::new(
                    correlation_id,
                    Event::PermissionRequired { policy },
                ));
            }
            Err(err) => {
                warn!(session = %session.key().session_id, command = %request.command,
                      error = %err, "dispatch failure");
                session.enqueue(OutboundMessage::new(
                    correlation_id,
                    Event::UnexpectedFailure {
                        failure_type: error_kind(&err).to_string(),
                        message: err.to_string(),
                    },
                ));
            }
        }
    }

    async fn handle(&self, session: Arc<Session>, request: &Request) -> Result<()> {
        match request.command.as_str() {
            // A start-session on an already-started session is benign; the
            // handshake proper happens before the session exists.
            START_SESSION => {
                session.enqueue(OutboundMessage::new(
                    request.correlation_id.clone(),
                    Event::SessionStarted {
                        session_id: session.key().session_id.clone(),
                    },
                ));
                Ok(())
            }
            "install-package" => self.handle_install(session, request),
            "find-packages" => self.handle_find(session, request).await,
            "cancel-request" => {
                let target = request
                    .param_str("request_id")
                    .ok_or_else(|| Error::Dispatch("cancel-request needs request_id".into()))?;
                let canceled = session.cancel_request(target);
                session.enqueue(OutboundMessage::new(
                    request.correlation_id.clone(),
                    Event::Done {
                        outcome: if canceled {
                            RequestOutcome::Success
                        } else {
                            RequestOutcome::Failed
                        },
                    },
                ));
                Ok(())
            }
            "end-session" => {
                session.end().await;
                Ok(())
            }
            other => Err(Error::Dispatch(format!("unknown command '{}'", other))),
        }
    }

    /// Start an install orchestration as a worker owned by the session
    fn handle_install(&self, session: Arc<Session>, request: &Request) -> Result<()> {
        if !self
            .permissions
            .is_allowed(session.key(), policy::INSTALL)
        {
            return Err(Error::PermissionDenied(policy::INSTALL.to_string()));
        }

        let name = request
            .param_str("canonical_name")
            .ok_or_else(|| Error::Dispatch("install-package needs canonical_name".into()))?;
        let identity = CanonicalIdentity::parse(name)?;

        let mut install = InstallRequest::new(identity);
        install.auto_upgrade = request.param_bool("auto_upgrade");
        install.exact = request.param_bool("exact") || request.param_bool("force");
        install.download_only = request.param_bool("download_only");
        install.pretend = request.param_bool("pretend");

        let correlation_id = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let token = session.track_request(correlation_id.clone());
        let ctx = RequestContext::new(
            Some(correlation_id.clone()),
            session.clone().outbound_sender(),
            token,
        );

        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            let completed = orchestrator.install(&ctx, install).await;
            ctx.emit(Event::Done {
                outcome: match completed {
                    Completed::Success => RequestOutcome::Success,
                    Completed::Canceled => RequestOutcome::Canceled,
                    Completed::Failed => RequestOutcome::Failed,
                    Completed::RestartRequired => RequestOutcome::RestartRequired,
                },
            });
            session.finish_request(&correlation_id);
        });

        Ok(())
    }

    /// Answer a find query from the feeds, memoized per session
    async fn handle_find(&self, session: Arc<Session>, request: &Request) -> Result<()> {
        if !self.permissions.is_allowed(session.key(), policy::QUERY) {
            return Err(Error::PermissionDenied(policy::QUERY.to_string()));
        }

        let name = request
            .param_str("name")
            .ok_or_else(|| Error::Dispatch("find-packages needs name".into()))?;

        let cache_key = format!("find:{}", name);
        let identities: Vec<CanonicalIdentity> = match session.cache_get(&cache_key) {
            Some(cached) => serde_json::from_value(cached)?,
            None => {
                let found = self
                    .feeds
                    .find_packages(&IdentityQuery::by_name(name))
                    .await?;
                let identities: Vec<CanonicalIdentity> =
                    found.iter().map(|p| p.identity().clone()).collect();
                session.cache_put(cache_key, serde_json::to_value(&identities)?);
                identities
            }
        };

        for identity in identities {
            let package = self.registry.get_or_add(identity.clone());
            session.enqueue(OutboundMessage::new(
                request.correlation_id.clone(),
                Event::PackageFound {
                    installed: self.registry.is_installed(&package),
                    local_location: package.local_location().map(|p| p.display().to_string()),
                    package: identity,
                },
            ));
        }
        session.enqueue(OutboundMessage::new(
            request.correlation_id.clone(),
            Event::Done {
                outcome: RequestOutcome::Success,
            },
        ));
        Ok(())
    }
}

/// Short classification of an error for the unexpected-failure event
fn error_kind(err: &Error) -> &'static str {
    match err {
        Error::Unsatisfiable(_) => "unsatisfiable",
        Error::Canceled => "canceled",
        Error::PermissionDenied(_) => "permission-denied",
        Error::Io(_) => "io",
        Error::InvalidIdentity { .. } => "invalid-identity",
        Error::InvalidVersion(_) => "invalid-version",
        Error::Dispatch(_) => "dispatch",
        Error::Serialization(_) => "serialization",
        Error::LockHeld => "lock-held",
        Error::DownloadFailed(_) => "download-failed",
        Error::InstallFailed { .. } => "install-failed",
    }
}

/// Parse the handshake fields out of a first message, if it is one
///
/// Returns the session key and whether the client asked for a synchronous
/// transport. Anything other than a well-formed start-session yields `None`,
/// and the caller abandons the connection silently.
pub fn parse_handshake(request: &Request, peer_uid: u32, peer_elevated: bool) -> Option<(SessionKey, bool)> {
    if request.command != START_SESSION {
        return None;
    }
    let client_id = request.param_str("client_id")?.to_string();
    let session_id = request.param_str("session_id")?.to_string();
    if client_id.is_empty() || session_id.is_empty() {
        return None;
    }
    let synchronous = request.param_bool("synchronous");
    Some((
        SessionKey {
            client_id,
            session_id,
            elevated: peer_elevated,
            user_id: peer_uid,
        },
        synchronous,
    ))
}
