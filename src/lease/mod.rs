// SPDX-License-Identifier: MPL-2.0

//! Camera lease management
//!
//! A lease grants one user's viewer a UDP destination on the egress branch
//! for a bounded period. Clients renew before expiry; unrenewed leases are
//! swept once per second and their destinations removed from the graph.

pub mod clock;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::constants::lease::{DEFAULT_MAX_LEASES_PER_USER, GUID_LENGTH, MAX_LEASE};
use crate::errors::LeaseError;
use crate::net::Endpoint;
use crate::pipeline::SharedPipeline;
pub use clock::{Clock, ManualClock, SystemClock};

pub type SharedLeaseManager = Arc<Mutex<LeaseManager>>;

/// Limits applied to lease requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasePolicy {
    pub max_lease: Duration,
    pub max_leases_per_user: usize,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            max_lease: MAX_LEASE,
            max_leases_per_user: DEFAULT_MAX_LEASES_PER_USER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub guid: String,
    pub username: String,
    pub endpoint: Endpoint,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct User {
    pub username: String,
    pub leases: HashMap<String, Lease>,
}

impl User {
    fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            leases: HashMap::new(),
        }
    }
}

/// Body of a lease request
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LeaseRequest {
    /// Empty for a new lease
    pub lease_guid: String,
    pub udp_address: String,
    pub udp_port: i64,
    /// Requested lease length in milliseconds; zero ends the lease
    pub lease_time: i64,
}

impl LeaseRequest {
    fn endpoint(&self) -> Result<Endpoint, LeaseError> {
        let host = self.udp_address.trim();
        if host.is_empty() {
            return Err(LeaseError::InvalidRequest("udp_address is empty".into()));
        }
        let port = u16::try_from(self.udp_port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| {
                LeaseError::InvalidRequest(format!("udp_port {} out of range", self.udp_port))
            })?;
        Ok(Endpoint::new(host, port))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    Granted,
    Renewed,
    Released,
    /// Lease end for a lease that no longer exists
    NotFound,
}

/// Successful lease operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGrant {
    pub guid: String,
    pub status: LeaseStatus,
    pub expires_at: Option<DateTime<Utc>>,
}

/// JSON reply of the lease endpoint
#[derive(Debug, Clone, Serialize)]
pub struct LeaseResponse {
    pub guid: String,
    pub status: LeaseStatus,
}

impl From<LeaseGrant> for LeaseResponse {
    fn from(grant: LeaseGrant) -> Self {
        Self {
            guid: grant.guid,
            status: grant.status,
        }
    }
}

fn generate_guid() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(GUID_LENGTH)
        .map(char::from)
        .collect()
}

pub struct LeaseManager {
    users: HashMap<String, User>,
    pipeline: SharedPipeline,
    policy: LeasePolicy,
    clock: Arc<dyn Clock>,
}

impl LeaseManager {
    pub fn new(pipeline: SharedPipeline, policy: LeasePolicy) -> Self {
        Self::with_clock(pipeline, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(pipeline: SharedPipeline, policy: LeasePolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            users: HashMap::new(),
            pipeline,
            policy,
            clock,
        }
    }

    pub fn into_shared(self) -> SharedLeaseManager {
        Arc::new(Mutex::new(self))
    }

    pub fn policy(&self) -> &LeasePolicy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: LeasePolicy) {
        info!(
            max_lease_ms = policy.max_lease.as_millis() as u64,
            max_leases_per_user = policy.max_leases_per_user,
            "Lease policy updated"
        );
        self.policy = policy;
    }

    pub fn lease(&self, username: &str, guid: &str) -> Option<&Lease> {
        self.users.get(username)?.leases.get(guid)
    }

    pub fn lease_count(&self, username: &str) -> usize {
        self.users
            .get(username)
            .map_or(0, |user| user.leases.len())
    }

    pub fn total_leases(&self) -> usize {
        self.users.values().map(|user| user.leases.len()).sum()
    }

    /// Dispatch a validated request from an authenticated user
    ///
    /// The destination is only checked when granting or renewing; ending a
    /// lease ignores it.
    pub fn handle_request(
        &mut self,
        username: &str,
        request: &LeaseRequest,
    ) -> Result<LeaseGrant, LeaseError> {
        let guid = request.lease_guid.trim();

        match request.lease_time {
            t if t < 0 => Err(LeaseError::InvalidRequest(format!(
                "lease_time {t} is negative"
            ))),
            0 if guid.is_empty() => Err(LeaseError::InvalidRequest(
                "lease_time 0 needs a lease_guid".into(),
            )),
            0 => self.end_lease(username, guid),
            t => {
                let endpoint = request.endpoint()?;
                self.lease_camera(guid, username, endpoint, Duration::from_millis(t.unsigned_abs()))
            }
        }
    }

    /// Grant a new lease (empty `guid`) or renew an existing one
    pub fn lease_camera(
        &mut self,
        guid: &str,
        username: &str,
        endpoint: Endpoint,
        requested: Duration,
    ) -> Result<LeaseGrant, LeaseError> {
        if username.is_empty() {
            error!("Lease request without a username");
            return Err(LeaseError::MissingCredentials);
        }

        let granted = if requested > self.policy.max_lease {
            info!(
                user = %username,
                requested_ms = requested.as_millis() as u64,
                max_ms = self.policy.max_lease.as_millis() as u64,
                "Clamping lease time"
            );
            self.policy.max_lease
        } else {
            requested
        };
        let span = chrono::Duration::from_std(granted)
            .map_err(|e| LeaseError::InvalidRequest(format!("lease_time: {e}")))?;
        let expires_at = self.clock.now() + span;
        let max_leases = self.policy.max_leases_per_user;

        let user = self
            .users
            .entry(username.to_string())
            .or_insert_with(|| User::new(username));

        if guid.is_empty() {
            if user.leases.len() >= max_leases {
                return Err(LeaseError::LimitReached {
                    username: username.to_string(),
                    max: max_leases,
                });
            }

            let guid = loop {
                let candidate = generate_guid();
                if !user.leases.contains_key(&candidate) {
                    break candidate;
                }
            };

            self.pipeline.lock().add_endpoint(&endpoint)?;

            info!(
                user = %username,
                lease = %guid,
                endpoint = %endpoint,
                expires_at = %expires_at,
                "Lease granted"
            );
            user.leases.insert(
                guid.clone(),
                Lease {
                    guid: guid.clone(),
                    username: username.to_string(),
                    endpoint,
                    expires_at,
                },
            );
            return Ok(LeaseGrant {
                guid,
                status: LeaseStatus::Granted,
                expires_at: Some(expires_at),
            });
        }

        let Some(lease) = user.leases.get_mut(guid) else {
            return Err(LeaseError::UnknownLease(guid.to_string()));
        };

        lease.expires_at = expires_at;
        if lease.endpoint != endpoint {
            self.pipeline
                .lock()
                .change_endpoint(&lease.endpoint, &endpoint)?;
            info!(
                user = %username,
                lease = %guid,
                old = %lease.endpoint,
                new = %endpoint,
                "Lease destination moved"
            );
            lease.endpoint = endpoint;
        }

        info!(user = %username, lease = %guid, expires_at = %expires_at, "Lease renewed");
        Ok(LeaseGrant {
            guid: guid.to_string(),
            status: LeaseStatus::Renewed,
            expires_at: Some(expires_at),
        })
    }

    /// End a lease and remove its destination
    ///
    /// Ending a lease that no longer exists succeeds without touching the
    /// graph. The table entry is removed before the graph is, and stays
    /// removed if the graph mutation fails.
    pub fn end_lease(&mut self, username: &str, guid: &str) -> Result<LeaseGrant, LeaseError> {
        let not_found = || LeaseGrant {
            guid: guid.to_string(),
            status: LeaseStatus::NotFound,
            expires_at: None,
        };

        let Some(user) = self.users.get_mut(username) else {
            info!(user = %username, lease = %guid, "Lease end for unknown user");
            return Ok(not_found());
        };
        let Some(lease) = user.leases.remove(guid) else {
            info!(user = %username, lease = %guid, "Lease end for unknown lease");
            return Ok(not_found());
        };

        info!(user = %username, lease = %guid, endpoint = %lease.endpoint, "Lease ended");
        self.pipeline.lock().remove_endpoint(&lease.endpoint)?;

        Ok(LeaseGrant {
            guid: lease.guid,
            status: LeaseStatus::Released,
            expires_at: None,
        })
    }

    /// End every lease whose expiry has passed; returns how many were ended
    pub fn sweep_expired(&mut self) -> usize {
        let now = self.clock.now();
        let expired: Vec<(String, String)> = self
            .users
            .values()
            .flat_map(|user| {
                user.leases
                    .values()
                    .filter(|lease| lease.expires_at <= now)
                    .map(|lease| (lease.username.clone(), lease.guid.clone()))
            })
            .collect();

        for (username, guid) in &expired {
            warn!(user = %username, lease = %guid, "Lease expired");
            if let Err(e) = self.end_lease(username, guid) {
                error!(user = %username, lease = %guid, error = %e, "Failed to end expired lease");
            }
        }
        self.pipeline.lock().reap_orphans();
        expired.len()
    }
}
