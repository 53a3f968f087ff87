//! The connection-acceptance flow.
//!
//! A streaming request passes, in order: admission, duplicate resolution,
//! socket takeover, host binding, capability negotiation, and handoff to a
//! streaming worker. Rejections before takeover answer over HTTP and free the
//! state; after takeover the socket is ours, so failures speak in-band on it.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use tokio::runtime::Handle;

use crate::clock::{now_monotonic_secs, now_realtime_secs};
use crate::connection::Connection;
use crate::constants::{
    NODE_STATE_UPDATE_DELAY, STALE_RECEIVER_AGE_SECS, STALE_RECEIVER_STOP_TIMEOUT,
    START_STREAMING_ERROR_ALREADY_STREAMING, START_STREAMING_ERROR_BUSY_TRY_LATER,
    START_STREAMING_ERROR_INITIALIZATION, START_STREAMING_ERROR_INTERNAL_ERROR,
    START_STREAMING_ERROR_SAME_LOCALHOST,
};
use crate::http::WebClient;
use crate::receiver::admission::{validate_identity, RejectKind, Rejection};
use crate::receiver::params::{parse_query, parse_user_agent};
use crate::receiver::state::{LogPriority, ReceiverState, StreamHandshake, StreamStatus};
use crate::registry::{CreateHost, Host, HostFlags, HostInfo};
use crate::service::ServiceState;
use crate::services::streaming::AddReceiver;
use crate::statsd::RoostCounters;

/// Accepts or rejects one streaming request.
///
/// The returned status is written by the HTTP surface only while the web
/// client still owns its socket; once the connection is taken over, the
/// status is informational and the handshake continues on a worker thread.
pub async fn accept_stream_connection(
    svc: &ServiceState,
    web: &mut WebClient,
    query: &str,
) -> StatusCode {
    if !svc.streaming_running() {
        web.set_response(START_STREAMING_ERROR_BUSY_TRY_LATER);
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    let mut rpt = ReceiverState::new(
        web.client_ip().to_owned(),
        web.client_port().to_owned(),
        svc.config(),
    );

    parse_query(&mut rpt, query);
    parse_user_agent(&mut rpt, web.user_agent());

    if let Err(rejection) = validate_identity(&mut rpt, svc.credentials()) {
        return reject(web, &rpt, rejection);
    }

    // A child presenting our own identity must hear the reason on the stream
    // socket, so this rejection still takes the connection over.
    if rpt.machine_id == Some(svc.registry().localhost_guid()) {
        return reject_same_localhost(svc, web, rpt);
    }

    if let Err(remaining) = svc
        .rate_gate()
        .check(now_realtime_secs(), svc.config().streaming_rate_limit_secs())
    {
        let rejection = Rejection::busy(
            StreamStatus::RateLimit,
            format!(
                "rejecting streaming connection; rate limit, will accept new connection in {remaining} secs"
            ),
        );
        return reject(web, &rpt, rejection);
    }

    if let Err(rejection) = resolve_duplicate(svc, &rpt).await {
        return reject(web, &rpt, rejection);
    }

    if let Err(err) = takeover_web_connection(web, &mut rpt) {
        rpt.log_status(
            &format!("rejecting streaming connection; cannot take over the socket: {err}"),
            StreamStatus::InternalError,
            LogPriority::Error,
        );
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    // The socket is ours from here on; the HTTP status no longer reaches the
    // child.

    if let (Some(key), Some(machine)) = (rpt.key_id, rpt.machine_id) {
        rpt.config = svc
            .credentials()
            .receiver_config(rpt.config.clone(), &key, &machine);
    }

    let svc = svc.clone();
    tokio::task::spawn_blocking(move || finish_connection(svc, rpt));

    StatusCode::OK
}

/// Answers a pre-takeover rejection and frees the state.
fn reject(web: &mut WebClient, rpt: &ReceiverState, rejection: Rejection) -> StatusCode {
    let priority = match rejection.kind {
        RejectKind::Denied => LogPriority::Warning,
        RejectKind::Busy => LogPriority::Notice,
        RejectKind::Conflict => LogPriority::Debug,
    };

    rpt.log_status(&rejection.message, rejection.status, priority);
    roost_statsd::metric!(
        counter(RoostCounters::StreamRejected) += 1,
        reason = rejection.status.as_str()
    );

    web.set_response(rejection.token());
    rejection.http_status()
}

/// Takes the connection over only to tell the child it is streaming to
/// itself.
fn reject_same_localhost(
    svc: &ServiceState,
    web: &mut WebClient,
    mut rpt: Box<ReceiverState>,
) -> StatusCode {
    if let Err(err) = takeover_web_connection(web, &mut rpt) {
        rpt.log_status(
            &format!("rejecting streaming connection; cannot take over the socket: {err}"),
            StreamStatus::InternalError,
            LogPriority::Error,
        );
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    rpt.log_status(
        "rejecting streaming connection; machine identity is my own",
        StreamStatus::Localhost,
        LogPriority::Debug,
    );
    roost_statsd::metric!(
        counter(RoostCounters::StreamRejected) += 1,
        reason = StreamStatus::Localhost.as_str()
    );

    let send_timeout = svc.config().send_timeout();
    tokio::task::spawn_blocking(move || {
        let token = START_STREAMING_ERROR_SAME_LOCALHOST;
        let sent = rpt.connection.send_timeout(token.as_bytes(), send_timeout);

        if !matches!(sent, Ok(n) if n == token.len()) {
            roost_log::error!(
                "STREAM RECEIVE '{}' [from [{}]:{}]: failed to reply",
                rpt.hostname_or_empty(),
                rpt.client_ip,
                rpt.client_port,
            );
        }
    });

    StatusCode::OK
}

/// Classifies a previous receiver for the same host and preempts it when
/// stale.
///
/// The registry and slot locks are held only to classify; the wait for a
/// preempted receiver happens with no lock held.
async fn resolve_duplicate(svc: &ServiceState, rpt: &ReceiverState) -> Result<(), Rejection> {
    let Some(machine_id) = rpt.machine_id else {
        return Ok(());
    };

    let host = svc
        .registry()
        .find_by_guid(&machine_id)
        .filter(|host| !host.flag_check(HostFlags::ARCHIVED));

    let mut age = 0;
    let mut working = false;
    let mut stale = false;

    if let Some(host) = &host {
        if let Some(prev) = host.receiver_handle() {
            age = now_monotonic_secs() - prev.last_msg_secs();
            if age < STALE_RECEIVER_AGE_SECS {
                working = true;
            } else {
                stale = true;
            }
        }
    }

    if stale {
        if let Some(host) = &host {
            let stopped = svc
                .registry()
                .signal_to_stop_and_wait(
                    host,
                    StreamHandshake::DisconnectStaleReceiver,
                    STALE_RECEIVER_STOP_TIMEOUT,
                )
                .await;

            if stopped {
                stale = false;
                roost_log::info!(
                    "STREAM '{}' [receive from [{}]:{}]: stopped previous stale receiver to accept this one",
                    rpt.hostname_or_empty(),
                    rpt.client_ip,
                    rpt.client_port,
                );
            }
        }
    }

    if working || stale {
        let suffix = if stale {
            " (signaled old receiver to stop)"
        } else {
            " (new connection not accepted)"
        };

        return Err(Rejection::conflict(
            StreamStatus::AlreadyConnected,
            format!(
                "rejecting streaming connection; multiple connections for same host, \
                 old connection was last used {age} secs ago{suffix}"
            ),
        ));
    }

    Ok(())
}

/// Moves the socket and its TLS session from the web client into the
/// receiver state.
fn takeover_web_connection(web: &mut WebClient, rpt: &mut ReceiverState) -> io::Result<()> {
    let (stream, tls) = web
        .take_transport()
        .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

    rpt.connection = Connection::from_accepted(stream, tls)?;
    Ok(())
}

/// Everything after takeover: bind, negotiate, hand off.
///
/// Runs on a blocking thread; the socket operations below block under their
/// timeouts.
fn finish_connection(svc: ServiceState, mut rpt: Box<ReceiverState>) {
    if !send_first_response(&svc, &mut rpt) {
        // The child has been notified in-band, or we could not reach it.
        // Dropping the state closes the socket and releases everything.
        return;
    }

    rpt.log_status(
        "connected and ready to receive data",
        StreamStatus::Connected,
        LogPriority::Info,
    );
    roost_statsd::metric!(counter(RoostCounters::StreamAccepted) += 1);

    if let Some(host) = rpt.host.clone() {
        schedule_node_state_update(host.clone(), NODE_STATE_UPDATE_DELAY);
        svc.registry().set_is_parent_label();

        if rpt.config.ephemeral {
            host.flag_set(HostFlags::EPHEMERAL);
        }

        // Let the forwarding link reconnect to the next parent right away.
        host.stream_parents_reset(StreamHandshake::Preparing);
    }

    svc.streaming().send(AddReceiver(rpt));
}

/// Binds the host and sends the initial handshake response.
///
/// Each post-condition failure answers in-band on the owned socket and
/// reports failure, leaving cleanup to the caller.
fn send_first_response(svc: &ServiceState, rpt: &mut ReceiverState) -> bool {
    let create = create_host_request(rpt);

    let host = match svc.registry().find_or_create(create, &mut rpt.system_info) {
        Ok(host) => host,
        Err(_) => {
            rpt.log_status(
                "rejecting streaming connection; failed to find or create the required host structure",
                StreamStatus::InternalError,
                LogPriority::Error,
            );
            send_error_on_taken_over_connection(svc, rpt, START_STREAMING_ERROR_INTERNAL_ERROR);
            return false;
        }
    };

    // The system-info bag belongs to the host from this point on.
    debug_assert!(rpt.system_info.is_none());

    if host.flag_check(HostFlags::PENDING_CONTEXT_LOAD) {
        rpt.log_status(
            "rejecting streaming connection; host is initializing, retry later",
            StreamStatus::Initialization,
            LogPriority::Notice,
        );
        send_error_on_taken_over_connection(svc, rpt, START_STREAMING_ERROR_INITIALIZATION);
        return false;
    }

    if !svc.registry().children_should_be_accepted() {
        rpt.log_status(
            "rejecting streaming connection; the system is backfilling higher tiers with high-resolution data, retry later",
            StreamStatus::Initialization,
            LogPriority::Notice,
        );
        send_error_on_taken_over_connection(svc, rpt, START_STREAMING_ERROR_INITIALIZATION);
        return false;
    }

    if !svc.registry().set_receiver(&host, rpt.handle.clone()) {
        rpt.log_status(
            "rejecting streaming connection; host is already served by another receiver",
            StreamStatus::DuplicateReceiver,
            LogPriority::Info,
        );
        send_error_on_taken_over_connection(svc, rpt, START_STREAMING_ERROR_ALREADY_STREAMING);
        return false;
    }

    rpt.host = Some(host.clone());

    rpt.compression = rpt.capabilities.select_compression();
    let response = rpt.capabilities.initial_response();

    // The accept surface runs sockets non-blocking; the stream runs blocking
    // under a receive timeout. Failures here are logged but not fatal.
    if let Err(err) = rpt.connection.make_blocking(svc.config().receive_timeout()) {
        roost_log::error!(
            "STREAM RECEIVE '{}' [from [{}]:{}]: cannot switch the socket to blocking mode: {err}",
            rpt.hostname_or_empty(),
            rpt.client_ip,
            rpt.client_port,
        );
    }

    roost_log::debug!(
        "initial response to [{}]:{}: {response}",
        rpt.client_ip,
        rpt.client_port,
    );

    match rpt.connection.send_timeout(response.as_bytes(), svc.config().send_timeout()) {
        Ok(sent) if sent == response.len() => true,
        _ => {
            rpt.log_status(
                "cannot reply back, dropping connection",
                StreamStatus::CantReply,
                LogPriority::Error,
            );
            svc.registry().clear_receiver(&host, &rpt.handle);
            rpt.host = None;
            false
        }
    }
}

fn create_host_request(rpt: &ReceiverState) -> CreateHost {
    CreateHost {
        machine_guid: rpt.machine_id.unwrap_or_default(),
        info: HostInfo {
            hostname: rpt.hostname.clone().unwrap_or_default(),
            registry_hostname: rpt.registry_hostname.clone().unwrap_or_default(),
            os: rpt.os.clone().unwrap_or_default(),
            timezone: rpt.timezone.clone().unwrap_or_default(),
            abbrev_timezone: rpt.abbrev_timezone.clone().unwrap_or_default(),
            utc_offset: rpt.utc_offset,
            program_name: rpt.program_name.clone().unwrap_or_default(),
            program_version: rpt.program_version.clone().unwrap_or_default(),
            update_every: rpt.config.update_every,
            history: rpt.config.history,
            memory_mode: rpt.config.memory_mode,
            health: rpt.config.health,
        },
    }
}

/// Best-effort in-band error token on a socket we own.
fn send_error_on_taken_over_connection(svc: &ServiceState, rpt: &mut ReceiverState, token: &str) {
    rpt.connection
        .send_timeout(token.as_bytes(), svc.config().error_send_timeout())
        .ok();
}

/// Tells the cloud connector about a newly connected child, delayed so that
/// quick reconnect cycles collapse into one update.
fn schedule_node_state_update(host: Arc<Host>, delay: Duration) {
    let Ok(handle) = Handle::try_current() else {
        return;
    };

    handle.spawn(async move {
        tokio::time::sleep(delay).await;
        roost_log::debug!(
            hostname = %host.hostname(),
            machine_guid = %host.machine_guid(),
            "publishing node state update",
        );
    });
}
