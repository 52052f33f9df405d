// src/session/message.rs

//! Wire protocol shapes
//!
//! Messages travel as one JSON object per line. Requests carry a command
//! name, a request-correlation id, and named parameters; responses are tagged
//! events, optionally scoped to the correlation id of the request that caused
//! them. The exact transport framing lives with the session; these types only
//! define the shapes.

use crate::identity::CanonicalIdentity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use url::Url;

/// An inbound client request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub params: BTreeMap<String, Value>,
}

impl Request {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            correlation_id: None,
            params: BTreeMap::new(),
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Fetch a string parameter
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// Fetch a boolean parameter, absent meaning false
    pub fn param_bool(&self, key: &str) -> bool {
        self.params
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Command name of the mandatory first message on a fresh connection
pub const START_SESSION: &str = "start-session";

/// Terminal result of an install request, reported in the `done` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestOutcome {
    Success,
    Failed,
    Canceled,
    RestartRequired,
}

/// Events the daemon sends to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    /// Handshake accepted; the session is live
    SessionStarted { session_id: String },

    /// A package matched a find query
    PackageFound {
        package: CanonicalIdentity,
        installed: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        local_location: Option<String>,
    },

    /// The request is already satisfied, by the package itself or by an
    /// installed compatible substitute
    PackageSatisfiedBy {
        requested: CanonicalIdentity,
        satisfied_by: CanonicalIdentity,
    },

    /// Progress for one package plus overall progress for the request
    InstallingProgress {
        package: CanonicalIdentity,
        percent: u8,
        overall_percent: u8,
    },

    /// A package finished installing
    Installed { package: CanonicalIdentity },

    /// A package was removed
    Removed { package: CanonicalIdentity },

    /// Installing a package failed
    FailedInstall {
        package: CanonicalIdentity,
        reason: String,
    },

    /// Removing a package failed
    FailedRemoval {
        package: CanonicalIdentity,
        reason: String,
    },

    /// The daemon needs a file it cannot acquire itself; the client may
    /// deliver it to `destination` or authorize the listed locations
    RequireRemoteFile {
        package: CanonicalIdentity,
        locations: Vec<Url>,
        destination: String,
    },

    /// The requested package has newer candidates the client must choose from
    PackageHasPotentialUpgrades {
        package: CanonicalIdentity,
        supersedents: Vec<CanonicalIdentity>,
    },

    /// The package cannot be installed as asked
    UnableToResolve { package: CanonicalIdentity, reason: String },

    /// The request observed its cancellation signal and stopped
    OperationCanceled,

    /// The daemon's own binary was superseded; a service restart is scheduled
    RestartRequired { active_version: CanonicalIdentity },

    /// A permission check rejected the request
    PermissionRequired { policy: String },

    /// A handler failed unexpectedly; the session continues
    UnexpectedFailure {
        #[serde(rename = "type")]
        failure_type: String,
        message: String,
    },

    /// Idle keep-alive for synchronous transports
    KeepAlive,

    /// Terminal event for a request
    Done { outcome: RequestOutcome },
}

/// An outbound message: an event scoped to the request that caused it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub event: Event,
}

impl OutboundMessage {
    pub fn new(correlation_id: Option<String>, event: Event) -> Self {
        Self {
            correlation_id,
            event,
        }
    }

    /// An event not tied to any particular request
    pub fn broadcast(event: Event) -> Self {
        Self {
            correlation_id: None,
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Architecture;
    use crate::version::PackageVersion;

    fn identity() -> CanonicalIdentity {
        CanonicalIdentity::new(
            "app",
            PackageVersion::parse("1.0.0.0").unwrap(),
            Architecture::X86,
            "aa",
        )
    }

    #[test]
    fn test_request_round_trip() {
        let json = r#"{"command":"install-package","correlation_id":"r-1","canonical_name":"app-1.0.0.0-x86-aa","auto_upgrade":true}"#;
        let request: Request = serde_json::from_str(json).unwrap();
        assert_eq!(request.command, "install-package");
        assert_eq!(request.correlation_id.as_deref(), Some("r-1"));
        assert_eq!(request.param_str("canonical_name"), Some("app-1.0.0.0-x86-aa"));
        assert!(request.param_bool("auto_upgrade"));
        assert!(!request.param_bool("force"));
    }

    #[test]
    fn test_event_tagging() {
        let message = OutboundMessage::new(
            Some("r-1".to_string()),
            Event::InstallingProgress {
                package: identity(),
                percent: 40,
                overall_percent: 10,
            },
        );
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"event\":\"installing-progress\""));
        assert!(json.contains("\"correlation_id\":\"r-1\""));
        assert!(json.contains("\"app-1.0.0.0-x86-aa\""));

        let back: OutboundMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_unexpected_failure_field_name() {
        let message = OutboundMessage::broadcast(Event::UnexpectedFailure {
            failure_type: "Dispatch".to_string(),
            message: "boom".to_string(),
        });
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"type\":\"Dispatch\""));
    }

    #[test]
    fn test_outcome_names() {
        assert_eq!(
            serde_json::to_string(&RequestOutcome::RestartRequired).unwrap(),
            "\"restart-required\""
        );
    }
}
