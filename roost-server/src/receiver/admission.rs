use http::StatusCode;
use parking_lot::Mutex;
use uuid::Uuid;

use roost_config::{CredentialKind, StreamCredentials};

use crate::constants::{
    START_STREAMING_ERROR_ALREADY_STREAMING, START_STREAMING_ERROR_BUSY_TRY_LATER,
    START_STREAMING_ERROR_NOT_PERMITTED,
};
use crate::receiver::state::{ReceiverState, StreamStatus};

/// How a rejected connection is answered.
///
/// Every credential failure maps to the same `Denied` response so that a
/// probing client cannot learn which gate it tripped; the differences live in
/// the logs only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    /// HTTP 401 with the opaque not-permitted token.
    Denied,
    /// HTTP 503 with the opaque busy token.
    Busy,
    /// HTTP 409: another receiver serves this host.
    Conflict,
}

/// A rejection decision of the admission gate.
#[derive(Debug)]
pub struct Rejection {
    pub kind: RejectKind,
    pub status: StreamStatus,
    pub message: String,
}

impl Rejection {
    pub fn denied(status: StreamStatus, message: impl Into<String>) -> Self {
        Self {
            kind: RejectKind::Denied,
            status,
            message: message.into(),
        }
    }

    pub fn busy(status: StreamStatus, message: impl Into<String>) -> Self {
        Self {
            kind: RejectKind::Busy,
            status,
            message: message.into(),
        }
    }

    pub fn conflict(status: StreamStatus, message: impl Into<String>) -> Self {
        Self {
            kind: RejectKind::Conflict,
            status,
            message: message.into(),
        }
    }

    /// The HTTP status for this rejection.
    pub fn http_status(&self) -> StatusCode {
        match self.kind {
            RejectKind::Denied => StatusCode::UNAUTHORIZED,
            RejectKind::Busy => StatusCode::SERVICE_UNAVAILABLE,
            RejectKind::Conflict => StatusCode::CONFLICT,
        }
    }

    /// The fixed response body for this rejection.
    pub fn token(&self) -> &'static str {
        match self.kind {
            RejectKind::Denied => START_STREAMING_ERROR_NOT_PERMITTED,
            RejectKind::Busy => START_STREAMING_ERROR_BUSY_TRY_LATER,
            RejectKind::Conflict => START_STREAMING_ERROR_ALREADY_STREAMING,
        }
    }
}

/// Validates the identity a connection presented, in fixed order.
///
/// On success the parsed key and machine identity are stored on the state.
/// Every failure is `Denied`: same status code, same body.
pub fn validate_identity(
    rpt: &mut ReceiverState,
    credentials: &StreamCredentials,
) -> Result<(), Rejection> {
    let key = match rpt.key.as_deref() {
        Some(key) if !key.is_empty() => key,
        _ => {
            return Err(Rejection::denied(
                StreamStatus::NoApiKey,
                "rejecting streaming connection; request without an API key",
            ))
        }
    };

    if rpt.hostname.as_deref().unwrap_or("").is_empty() {
        return Err(Rejection::denied(
            StreamStatus::NoHostname,
            "rejecting streaming connection; request without a hostname",
        ));
    }

    let machine_guid = match rpt.machine_guid.as_deref() {
        Some(guid) if !guid.is_empty() => guid,
        _ => {
            return Err(Rejection::denied(
                StreamStatus::NoMachineGuid,
                "rejecting streaming connection; request without a machine identity",
            ))
        }
    };

    let key_id = match Uuid::parse_str(key) {
        Ok(id) => id,
        Err(_) => {
            return Err(Rejection::denied(
                StreamStatus::InvalidApiKey,
                "rejecting streaming connection; API key is not a valid UUID",
            ))
        }
    };

    let machine_id = match Uuid::parse_str(machine_guid) {
        Ok(id) => id,
        Err(_) => {
            return Err(Rejection::denied(
                StreamStatus::InvalidMachineGuid,
                "rejecting streaming connection; machine identity is not a valid UUID",
            ))
        }
    };

    if !credentials.is_kind(&key_id, CredentialKind::Api) {
        return Err(Rejection::denied(
            StreamStatus::InvalidApiKey,
            "rejecting streaming connection; API key provided is a machine identity (did you mix them up?)",
        ));
    }

    // API keys must be enabled explicitly.
    if !credentials.is_enabled(&key_id, false) {
        return Err(Rejection::denied(
            StreamStatus::ApiKeyDisabled,
            "rejecting streaming connection; API key is not enabled",
        ));
    }

    if !credentials.allows_client(&key_id, &rpt.client_ip) {
        return Err(Rejection::denied(
            StreamStatus::NotAllowedIp,
            "rejecting streaming connection; API key is not allowed from this IP",
        ));
    }

    if !credentials.is_kind(&machine_id, CredentialKind::Machine) {
        return Err(Rejection::denied(
            StreamStatus::InvalidMachineGuid,
            "rejecting streaming connection; machine identity is an API key (did you mix them up?)",
        ));
    }

    // Machine identities are enabled unless switched off.
    if !credentials.is_enabled(&machine_id, true) {
        return Err(Rejection::denied(
            StreamStatus::MachineGuidDisabled,
            "rejecting streaming connection; machine identity is not enabled",
        ));
    }

    if !credentials.allows_client(&machine_id, &rpt.client_ip) {
        return Err(Rejection::denied(
            StreamStatus::NotAllowedIp,
            "rejecting streaming connection; machine identity is not allowed from this IP",
        ));
    }

    rpt.key_id = Some(key_id);
    rpt.machine_id = Some(machine_id);
    Ok(())
}

/// Process-wide gate limiting how often streams are accepted.
///
/// The contract is one serialized read-modify-write over the last-accepted
/// timestamp; the lock is held for a handful of instructions.
#[derive(Debug, Default)]
pub struct RateGate {
    last_accepted: Mutex<i64>,
}

impl RateGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits or rejects a connection at `now`.
    ///
    /// With a non-positive interval the gate is disabled. The gate seeds
    /// itself on first use, so the first connection after startup is told to
    /// retry. On rejection, returns the seconds until the next admission.
    pub fn check(&self, now: i64, min_interval: i64) -> Result<(), i64> {
        if min_interval <= 0 {
            return Ok(());
        }

        let mut last = self.last_accepted.lock();

        if *last == 0 {
            *last = now;
        }

        if now - *last < min_interval {
            return Err(min_interval - (now - *last));
        }

        *last = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_config::{Config, CredentialSection, ReceiverOverrides};

    const API_KEY: &str = "11111111-2222-3333-4444-555555555555";
    const MACHINE: &str = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";

    fn credentials() -> StreamCredentials {
        let mut creds = StreamCredentials::default();
        creds.insert(
            API_KEY.parse().unwrap(),
            CredentialSection {
                kind: CredentialKind::Api,
                enabled: Some(true),
                allow_from: None,
                overrides: ReceiverOverrides::default(),
            },
        );
        creds
    }

    fn valid_state() -> Box<ReceiverState> {
        let mut rpt = ReceiverState::new("10.0.0.1".into(), "39000".into(), &Config::default());
        rpt.key = Some(API_KEY.to_owned());
        rpt.hostname = Some("child".to_owned());
        rpt.machine_guid = Some(MACHINE.to_owned());
        rpt
    }

    #[test]
    fn valid_identity_passes_and_is_parsed() {
        let mut rpt = valid_state();
        validate_identity(&mut rpt, &credentials()).unwrap();
        assert_eq!(rpt.key_id, Some(API_KEY.parse().unwrap()));
        assert_eq!(rpt.machine_id, Some(MACHINE.parse().unwrap()));
    }

    /// Every credential failure yields byte-identical responses; only the
    /// logged status differs.
    #[test]
    fn rejections_are_indistinguishable_on_the_wire() {
        let creds = credentials();

        let mut broken: Vec<Box<ReceiverState>> = Vec::new();

        // No API key.
        let mut rpt = valid_state();
        rpt.key = None;
        broken.push(rpt);

        // No hostname.
        let mut rpt = valid_state();
        rpt.hostname = None;
        broken.push(rpt);

        // No machine identity.
        let mut rpt = valid_state();
        rpt.machine_guid = None;
        broken.push(rpt);

        // Malformed key and machine identity.
        let mut rpt = valid_state();
        rpt.key = Some("not-a-uuid".to_owned());
        broken.push(rpt);
        let mut rpt = valid_state();
        rpt.machine_guid = Some("not-a-uuid".to_owned());
        broken.push(rpt);

        // Unknown API key.
        let mut rpt = valid_state();
        rpt.key = Some("99999999-9999-9999-9999-999999999999".to_owned());
        broken.push(rpt);

        // The machine identity of another section typed `api`.
        let mut rpt = valid_state();
        rpt.machine_guid = Some(API_KEY.to_owned());
        broken.push(rpt);

        let mut statuses = Vec::new();
        for mut rpt in broken {
            let rejection = validate_identity(&mut rpt, &creds).unwrap_err();
            assert_eq!(rejection.kind, RejectKind::Denied);
            assert_eq!(rejection.http_status(), StatusCode::UNAUTHORIZED);
            assert_eq!(rejection.token(), START_STREAMING_ERROR_NOT_PERMITTED);
            statuses.push(rejection.status);
        }

        // The logs do tell the failures apart.
        statuses.dedup();
        assert!(statuses.len() > 1);
    }

    #[test]
    fn disabled_api_key_is_denied() {
        let mut creds = StreamCredentials::default();
        creds.insert(
            API_KEY.parse().unwrap(),
            CredentialSection {
                kind: CredentialKind::Api,
                enabled: None,
                allow_from: None,
                overrides: ReceiverOverrides::default(),
            },
        );

        let mut rpt = valid_state();
        let rejection = validate_identity(&mut rpt, &creds).unwrap_err();
        assert_eq!(rejection.status, StreamStatus::ApiKeyDisabled);
        assert_eq!(rejection.kind, RejectKind::Denied);
    }

    #[test]
    fn acl_rejects_foreign_clients() {
        let mut creds = StreamCredentials::default();
        creds.insert(
            API_KEY.parse().unwrap(),
            CredentialSection {
                kind: CredentialKind::Api,
                enabled: Some(true),
                allow_from: Some("192.168.*".parse().unwrap()),
                overrides: ReceiverOverrides::default(),
            },
        );

        let mut rpt = valid_state();
        let rejection = validate_identity(&mut rpt, &creds).unwrap_err();
        assert_eq!(rejection.status, StreamStatus::NotAllowedIp);
    }

    #[test]
    fn rate_gate_is_disabled_at_zero() {
        let gate = RateGate::new();
        for now in 0..10 {
            assert!(gate.check(now, 0).is_ok());
        }
    }

    #[test]
    fn rate_gate_seeds_on_first_use() {
        let gate = RateGate::new();
        // The first connection seeds the timestamp and is rejected.
        assert_eq!(gate.check(100, 5), Err(5));
        // Within the interval, rejected with the remaining time.
        assert_eq!(gate.check(103, 5), Err(2));
        // After the interval, admitted.
        assert!(gate.check(105, 5).is_ok());
        assert_eq!(gate.check(106, 5), Err(4));
    }

    /// Over any window W with rate R, admissions are bounded by W/R + 1.
    #[test]
    fn rate_gate_admissions_are_bounded() {
        let rate = 3;
        let window = 60;
        let gate = RateGate::new();

        let mut admitted = 0;
        for now in 1..=window {
            if gate.check(now, rate).is_ok() {
                admitted += 1;
            }
        }

        assert!(admitted <= window / rate + 1);
        assert!(admitted >= window / rate - 1);
    }
}
