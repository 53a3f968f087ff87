use url::form_urlencoded;

use crate::capabilities::StreamCapabilities;
use crate::receiver::state::ReceiverState;

/// Rewrites the variable names sent by old children to their current form.
fn normalize_legacy_name(name: &str) -> &str {
    match name {
        "NETDATA_SYSTEM_OS_NAME" => "NETDATA_HOST_OS_NAME",
        "NETDATA_SYSTEM_OS_ID" => "NETDATA_HOST_OS_ID",
        "NETDATA_SYSTEM_OS_ID_LIKE" => "NETDATA_HOST_OS_ID_LIKE",
        "NETDATA_SYSTEM_OS_VERSION" => "NETDATA_HOST_OS_VERSION",
        "NETDATA_SYSTEM_OS_VERSION_ID" => "NETDATA_HOST_OS_VERSION_ID",
        "NETDATA_SYSTEM_OS_DETECTION" => "NETDATA_HOST_OS_DETECTION",
        other => other,
    }
}

/// Decodes the handshake parameters into the receiver state.
///
/// Pairs with an empty name or value are skipped, identity fields keep their
/// first occurrence, and anything unrecognized lands in the system-info bag.
/// After this returns, the capabilities are never the invalid sentinel and
/// the registry hostname has its default.
pub fn parse_query(rpt: &mut ReceiverState, query: &str) {
    for (name, value) in form_urlencoded::parse(query.as_bytes()) {
        let name = name.as_ref();
        let value = value.as_ref();

        if name.is_empty() || value.is_empty() {
            continue;
        }

        match name {
            "key" if rpt.key.is_none() => rpt.key = Some(value.to_owned()),
            "hostname" if rpt.hostname.is_none() => rpt.hostname = Some(value.to_owned()),
            "registry_hostname" if rpt.registry_hostname.is_none() => {
                rpt.registry_hostname = Some(value.to_owned())
            }
            "machine_guid" if rpt.machine_guid.is_none() => {
                rpt.machine_guid = Some(value.to_owned())
            }
            "update_every" => rpt.config.update_every = value.parse().unwrap_or(0),
            "os" if rpt.os.is_none() => rpt.os = Some(value.to_owned()),
            "timezone" if rpt.timezone.is_none() => rpt.timezone = Some(value.to_owned()),
            "abbrev_timezone" if rpt.abbrev_timezone.is_none() => {
                rpt.abbrev_timezone = Some(value.to_owned())
            }
            "utc_offset" => rpt.utc_offset = value.parse().unwrap_or(0),
            "hops" => {
                rpt.hops = value.parse().unwrap_or(0);
                if let Some(info) = rpt.system_info.as_mut() {
                    info.hops = rpt.hops;
                }
            }
            "ml_capable" => {
                if let Some(info) = rpt.system_info.as_mut() {
                    info.ml_capable = value.parse().ok();
                }
            }
            "ml_enabled" => {
                if let Some(info) = rpt.system_info.as_mut() {
                    info.ml_enabled = value.parse().ok();
                }
            }
            "mc_version" => {
                if let Some(info) = rpt.system_info.as_mut() {
                    info.mc_version = value.parse().ok();
                }
            }
            "ver" if rpt.capabilities.contains(StreamCapabilities::INVALID) => {
                rpt.capabilities = StreamCapabilities::from_version(value.parse().unwrap_or(0));
            }
            name => {
                let name = normalize_legacy_name(name);

                // Old children announce themselves with a protocol version
                // variable instead of `ver`.
                if name == "NETDATA_PROTOCOL_VERSION"
                    && rpt.capabilities.contains(StreamCapabilities::INVALID)
                {
                    rpt.capabilities = StreamCapabilities::from_version(1);
                }

                let stored = match rpt.system_info.as_mut() {
                    Some(info) => info.set(name, value),
                    None => Ok(()),
                };

                if stored.is_err() {
                    roost_log::info!(
                        "STREAM RECEIVE '{}' [from [{}]:{}]: request has parameter '{name}' = '{value}', which is not used",
                        rpt.hostname.as_deref().unwrap_or("-"),
                        rpt.client_ip,
                        rpt.client_port,
                    );
                }
            }
        }
    }

    if rpt.capabilities.contains(StreamCapabilities::INVALID) {
        // No version supplied, assume the oldest protocol.
        rpt.capabilities = StreamCapabilities::from_version(0);
    }

    if rpt.registry_hostname.is_none() {
        rpt.registry_hostname = rpt.hostname.clone();
    }
}

/// Splits the `User-Agent` header into program name and version.
pub fn parse_user_agent(rpt: &mut ReceiverState, user_agent: &str) {
    if user_agent.is_empty() {
        return;
    }

    match user_agent.split_once('/') {
        Some((name, version)) => {
            rpt.program_name = Some(name.to_owned());
            if !version.is_empty() {
                rpt.program_version = Some(version.to_owned());
            }
        }
        None => rpt.program_name = Some(user_agent.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_config::Config;

    fn state() -> Box<ReceiverState> {
        ReceiverState::new("10.0.0.1".into(), "39000".into(), &Config::default())
    }

    #[test]
    fn first_value_wins_for_identity_fields() {
        let mut rpt = state();
        parse_query(
            &mut rpt,
            "key=first&key=second&hostname=one&hostname=two&os=linux&os=bsd",
        );

        assert_eq!(rpt.key.as_deref(), Some("first"));
        assert_eq!(rpt.hostname.as_deref(), Some("one"));
        assert_eq!(rpt.os.as_deref(), Some("linux"));
    }

    #[test]
    fn numeric_fields_take_the_last_value() {
        let mut rpt = state();
        parse_query(&mut rpt, "update_every=2&update_every=5&utc_offset=-7200");

        assert_eq!(rpt.config.update_every, 5);
        assert_eq!(rpt.utc_offset, -7200);
    }

    #[test]
    fn missing_version_defaults_to_version_zero() {
        let mut rpt = state();
        parse_query(&mut rpt, "hostname=h");

        assert!(!rpt.capabilities.contains(StreamCapabilities::INVALID));
        assert_eq!(rpt.capabilities, StreamCapabilities::from_version(0));
    }

    #[test]
    fn ver_parameter_wins_over_legacy_version() {
        let mut rpt = state();
        parse_query(&mut rpt, "ver=3&NETDATA_PROTOCOL_VERSION=1");
        assert_eq!(rpt.capabilities, StreamCapabilities::from_version(3));
    }

    #[test]
    fn legacy_version_before_ver_keeps_the_first() {
        let mut rpt = state();
        parse_query(&mut rpt, "NETDATA_PROTOCOL_VERSION=1&ver=3");

        // The legacy variable resolved the capabilities first. The late
        // `ver` loses its guard, falls into the catch-all, and is reported
        // as unused rather than stored.
        assert_eq!(rpt.capabilities, StreamCapabilities::from_version(1));
        assert_eq!(rpt.system_info.as_ref().unwrap().get("ver"), None);
    }

    #[test]
    fn legacy_protocol_version_maps_to_version_one() {
        let mut rpt = state();
        parse_query(&mut rpt, "hostname=h&NETDATA_PROTOCOL_VERSION=1");

        assert_eq!(rpt.capabilities, StreamCapabilities::from_version(1));
        assert!(!rpt.capabilities.contains(StreamCapabilities::INVALID));
    }

    #[test]
    fn legacy_os_names_are_rewritten() {
        let mut rpt = state();
        parse_query(&mut rpt, "NETDATA_SYSTEM_OS_NAME=debian");

        let info = rpt.system_info.as_ref().unwrap();
        assert_eq!(info.get("NETDATA_HOST_OS_NAME"), Some("debian"));
        assert_eq!(info.get("NETDATA_SYSTEM_OS_NAME"), None);
    }

    #[test]
    fn hops_are_mirrored_into_system_info() {
        let mut rpt = state();
        parse_query(&mut rpt, "hops=3");

        assert_eq!(rpt.hops, 3);
        assert_eq!(rpt.system_info.as_ref().unwrap().hops, 3);
    }

    #[test]
    fn ml_fields_land_in_system_info() {
        let mut rpt = state();
        parse_query(&mut rpt, "ml_capable=1&ml_enabled=0&mc_version=2");

        let info = rpt.system_info.as_ref().unwrap();
        assert_eq!(info.ml_capable, Some(1));
        assert_eq!(info.ml_enabled, Some(0));
        assert_eq!(info.mc_version, Some(2));
    }

    #[test]
    fn empty_pairs_and_separators_are_skipped() {
        let mut rpt = state();
        parse_query(&mut rpt, "&&key=abc&&=orphan&novalue=&&hostname=h&");

        assert_eq!(rpt.key.as_deref(), Some("abc"));
        assert_eq!(rpt.hostname.as_deref(), Some("h"));
    }

    #[test]
    fn registry_hostname_defaults_to_hostname() {
        let mut rpt = state();
        parse_query(&mut rpt, "hostname=child-7");
        assert_eq!(rpt.registry_hostname.as_deref(), Some("child-7"));

        let mut rpt = state();
        parse_query(&mut rpt, "hostname=child-7&registry_hostname=display");
        assert_eq!(rpt.registry_hostname.as_deref(), Some("display"));
    }

    #[test]
    fn url_encoding_is_decoded() {
        let mut rpt = state();
        parse_query(&mut rpt, "timezone=Europe%2FAthens&abbrev_timezone=EET");
        assert_eq!(rpt.timezone.as_deref(), Some("Europe/Athens"));
    }

    #[test]
    fn user_agent_splits_on_first_slash() {
        let mut rpt = state();
        parse_user_agent(&mut rpt, "child-agent/1.44.0/extra");
        assert_eq!(rpt.program_name.as_deref(), Some("child-agent"));
        assert_eq!(rpt.program_version.as_deref(), Some("1.44.0/extra"));

        let mut rpt = state();
        parse_user_agent(&mut rpt, "curl");
        assert_eq!(rpt.program_name.as_deref(), Some("curl"));
        assert_eq!(rpt.program_version, None);
    }
}
