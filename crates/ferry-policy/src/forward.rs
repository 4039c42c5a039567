//! Cross-session forwarding through gateway sessions.
//!
//! A source that cannot inject into its target directly may ask a gateway to
//! relay the message. The request waits in `pending` until an owner approves
//! or rejects it; nothing is forwarded implicitly.

use chrono::{DateTime, Duration, Utc};
use ferry_core::{Decision, InjectMessage, InjectionSource, TrustLevel};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

use crate::context::{SecurityContext, create_forwarded_context};
use crate::resolver::{GatewayRoute, PolicyEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardStatus {
    Pending,
    Approved,
    Rejected,
    Completed,
    Expired,
}

impl ForwardStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Completed | Self::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for ForwardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("forward request {0} not found")]
    NotFound(Uuid),
    #[error("forward request {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: ForwardStatus,
        to: ForwardStatus,
    },
    #[error("not authorized: {0}")]
    NotAuthorized(String),
    #[error("forward request {0} expired")]
    Expired(Uuid),
}

/// A message waiting to be relayed through a gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRequest {
    pub id: Uuid,
    pub from: InjectionSource,
    pub gateway: String,
    pub to: String,
    pub message: InjectMessage,
    pub status: ForwardStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// How an injection reaches its target session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    ViaGateway(String),
    Deny(String),
}

/// Owns the pending-forward set.
#[derive(Debug)]
pub struct ForwardManager {
    engine: PolicyEngine,
    requests: Mutex<HashMap<Uuid, ForwardRequest>>,
}

impl ForwardManager {
    pub fn new(engine: PolicyEngine) -> Self {
        Self {
            engine,
            requests: Mutex::new(HashMap::new()),
        }
    }

    /// First configured gateway that accepts this source type and is marked as a gateway session.
    pub fn find_gateway_for_source(&self, source: &InjectionSource) -> Option<GatewayRoute> {
        self.engine.gateways().into_iter().find(|gateway| {
            gateway.accepts(source.source_type)
                && self.engine.session_policy(&gateway.session).gateway
        })
    }

    /// Whether `source` can only reach `target` through a gateway.
    pub fn requires_gateway(&self, source: &InjectionSource, target: &str) -> bool {
        !self.engine.check_direct(source, target).is_allowed()
            && self.find_gateway_for_source(source).is_some()
    }

    /// Whether a gateway would relay `source` to `target`.
    pub fn can_forward_to(&self, source: &InjectionSource, target: &str) -> Decision {
        match self.gateway_for(source, target) {
            Ok(_) => Decision::Allowed,
            Err(reason) => Decision::deny(reason),
        }
    }

    /// Direct, via a gateway, or denied, with the reason for denial.
    pub fn route(&self, source: &InjectionSource, target: &str) -> Route {
        let direct = self.engine.check_direct(source, target);
        if direct.is_allowed() {
            return Route::Direct;
        }
        if self.find_gateway_for_source(source).is_none() {
            let reason = direct.reason().unwrap_or("not allowed");
            return Route::Deny(reason.to_owned());
        }
        match self.gateway_for(source, target) {
            Ok(gateway) => Route::ViaGateway(gateway.session),
            Err(reason) => Route::Deny(reason),
        }
    }

    /// First gateway that accepts `source` and has a rule for `target`.
    ///
    /// When none qualifies, the error explains why the first candidate refused.
    fn gateway_for(&self, source: &InjectionSource, target: &str) -> Result<GatewayRoute, String> {
        let mut refusal = None;
        for gateway in self.engine.gateways() {
            if !gateway.accepts(source.source_type)
                || !self.engine.session_policy(&gateway.session).gateway
            {
                continue;
            }
            let policy = self.engine.resolve(source, &gateway.session);
            let reason = if !policy.is_gateway || !policy.can_forward {
                format!(
                    "gateway '{}' does not forward for {} sources",
                    gateway.session, source.trust_level
                )
            } else if !gateway.allows(source.trust_level, target) {
                format!(
                    "gateway '{}' has no rule forwarding {} sources to '{target}'",
                    gateway.session, source.trust_level
                )
            } else {
                return Ok(gateway);
            };
            refusal.get_or_insert(reason);
        }
        let no_gateway = || format!("no gateway accepts {} sources", source.source_type);
        Err(refusal.unwrap_or_else(no_gateway))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ForwardRequest>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a forward for approval.
    pub fn create_request(
        &self,
        source: InjectionSource,
        target: &str,
        message: InjectMessage,
    ) -> Result<ForwardRequest, ForwardError> {
        let gateway = self
            .gateway_for(&source, target)
            .map_err(ForwardError::NotAuthorized)?;

        let now = Utc::now();
        let request = ForwardRequest {
            id: Uuid::new_v4(),
            from: source,
            gateway: gateway.session,
            to: target.to_owned(),
            message,
            status: ForwardStatus::Pending,
            created_at: now,
            updated_at: now,
            reason: None,
        };
        info!(
            request_id = %request.id,
            gateway = %request.gateway,
            target = %request.to,
            source = %request.from.label(),
            "forward request pending approval"
        );
        self.lock().insert(request.id, request.clone());
        Ok(request)
    }

    fn ttl_for(&self, gateway: &str) -> Option<Duration> {
        self.engine
            .gateways()
            .into_iter()
            .find(|route| route.session == gateway)
            .and_then(|route| i64::try_from(route.request_ttl_secs).ok())
            .map(Duration::seconds)
    }

    fn require_owner(approver: &SecurityContext) -> Result<(), ForwardError> {
        if approver.trust_level() == TrustLevel::Owner {
            Ok(())
        } else {
            Err(ForwardError::NotAuthorized(format!(
                "approving forwards requires owner trust, approver is {}",
                approver.trust_level()
            )))
        }
    }

    /// Move a pending request to `to`, expiring it first if its TTL has passed.
    fn decide(
        &self,
        id: Uuid,
        to: ForwardStatus,
        reason: Option<String>,
    ) -> Result<ForwardRequest, ForwardError> {
        let now = Utc::now();
        let ttl = {
            let requests = self.lock();
            let request = requests.get(&id).ok_or(ForwardError::NotFound(id))?;
            self.ttl_for(&request.gateway)
        };

        let mut requests = self.lock();
        let request = requests.get_mut(&id).ok_or(ForwardError::NotFound(id))?;
        if request.status != ForwardStatus::Pending {
            return Err(ForwardError::InvalidTransition {
                id,
                from: request.status,
                to,
            });
        }
        if ttl.is_some_and(|ttl| now - request.created_at > ttl) {
            request.status = ForwardStatus::Expired;
            request.updated_at = now;
            return Err(ForwardError::Expired(id));
        }
        request.status = to;
        request.updated_at = now;
        request.reason = reason;
        Ok(request.clone())
    }

    pub fn approve_request(
        &self,
        id: Uuid,
        approver: &SecurityContext,
    ) -> Result<ForwardRequest, ForwardError> {
        Self::require_owner(approver)?;
        let request = self.decide(id, ForwardStatus::Approved, None)?;
        info!(
            request_id = %id,
            approver = %approver.source().label(),
            "forward request approved"
        );
        Ok(request)
    }

    pub fn reject_request(
        &self,
        id: Uuid,
        approver: &SecurityContext,
        reason: Option<String>,
    ) -> Result<ForwardRequest, ForwardError> {
        Self::require_owner(approver)?;
        let reason = reason.unwrap_or_else(|| "rejected by owner".to_owned());
        let request = self.decide(id, ForwardStatus::Rejected, Some(reason))?;
        info!(
            request_id = %id,
            approver = %approver.source().label(),
            "forward request rejected"
        );
        Ok(request)
    }

    /// Mark an approved request completed and build the context to inject it with.
    ///
    /// The caller submits `request.message` to the target session's queue under
    /// the returned context.
    pub fn complete_request(
        &self,
        id: Uuid,
    ) -> Result<(ForwardRequest, SecurityContext), ForwardError> {
        let request = {
            let mut requests = self.lock();
            let request = requests.get_mut(&id).ok_or(ForwardError::NotFound(id))?;
            if request.status != ForwardStatus::Approved {
                return Err(ForwardError::InvalidTransition {
                    id,
                    from: request.status,
                    to: ForwardStatus::Completed,
                });
            }
            request.status = ForwardStatus::Completed;
            request.updated_at = Utc::now();
            request.clone()
        };

        let context = create_forwarded_context(
            &self.engine,
            &request.to,
            &request.gateway,
            request.id,
            request.from.clone(),
        );
        info!(
            request_id = %id,
            target = %request.to,
            trust = %context.trust_level(),
            "forward request completed"
        );
        Ok((request, context))
    }

    pub fn get_request(&self, id: Uuid) -> Option<ForwardRequest> {
        self.lock().get(&id).cloned()
    }

    /// Pending requests, oldest first.
    pub fn get_pending_requests(&self) -> Vec<ForwardRequest> {
        let mut pending: Vec<_> = self
            .lock()
            .values()
            .filter(|request| request.status == ForwardStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|request| request.created_at);
        pending
    }

    /// Expire pending requests older than their gateway's TTL. Returns the expired ids.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let ttls: HashMap<String, Duration> = self
            .engine
            .gateways()
            .into_iter()
            .filter_map(|route| {
                i64::try_from(route.request_ttl_secs)
                    .ok()
                    .map(|secs| (route.session, Duration::seconds(secs)))
            })
            .collect();

        let mut expired = Vec::new();
        for request in self.lock().values_mut() {
            if request.status != ForwardStatus::Pending {
                continue;
            }
            let Some(ttl) = ttls.get(&request.gateway) else {
                continue;
            };
            if now - request.created_at > *ttl {
                request.status = ForwardStatus::Expired;
                request.updated_at = now;
                expired.push(request.id);
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired stale forward requests");
        }
        expired
    }

    /// Drop requests in a terminal state. Returns how many were removed.
    pub fn prune_terminal(&self) -> usize {
        let mut requests = self.lock();
        let before = requests.len();
        requests.retain(|_, request| !request.status.is_terminal());
        let removed = before - requests.len();
        drop(requests);
        if removed > 0 {
            debug!(removed, "pruned finished forward requests");
        }
        removed
    }
}
