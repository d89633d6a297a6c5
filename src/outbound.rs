//! RFC 5626 outbound support: flow tokens, Path and Record-Route
//! synthesis, Contact decoration.
//!
//! A flow token pins a live pooled connection by (index, epoch)
//! identity inside the user part of a URI we generate. Decoding a
//! token of a dead connection is `flow_failed`, which surfaces as 430
//! at the proxy/registrar boundary.

use crate::auth::md5_hex;
use crate::config::ServiceConfig;
use crate::transport::{SipAddr, TransportHandle, TransportPool};
use crate::{Error, Result};
use base64::{engine::general_purpose, Engine};
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Header, Param, Request};

/// URI user prefix of an encoded live flow.
pub const FLOW_TOKEN_PREFIX: &str = "NkF";
/// URI user prefix of the branch-derived token used when no flow is
/// recorded.
pub const QUOTED_TOKEN_PREFIX: &str = "NkQ";

pub fn encode_flow_token(handle: TransportHandle) -> String {
    let raw = format!("{}:{}", handle.index, handle.epoch);
    format!(
        "{}{}",
        FLOW_TOKEN_PREFIX,
        general_purpose::URL_SAFE_NO_PAD.encode(raw.as_bytes())
    )
}

/// Decode a `NkF` user part back to its connection.
///
/// `InvalidFlowToken` for garbage, `FlowFailed` when the referenced
/// connection is no longer alive (the epoch guards reused slots).
pub fn decode_flow_token(pool: &TransportPool, user: &str) -> Result<TransportHandle> {
    let encoded = user
        .strip_prefix(FLOW_TOKEN_PREFIX)
        .ok_or(Error::InvalidFlowToken)?;
    let raw = general_purpose::URL_SAFE_NO_PAD
        .decode(encoded.as_bytes())
        .map_err(|_| Error::InvalidFlowToken)?;
    let raw = String::from_utf8(raw).map_err(|_| Error::InvalidFlowToken)?;
    let (index, epoch) = raw.split_once(':').ok_or(Error::InvalidFlowToken)?;
    let handle = TransportHandle {
        index: index.parse().map_err(|_| Error::InvalidFlowToken)?,
        epoch: epoch.parse().map_err(|_| Error::InvalidFlowToken)?,
    };
    if pool.is_alive(handle) {
        Ok(handle)
    } else {
        Err(Error::FlowFailed)
    }
}

/// The `NkQ` variant: a stable hash of (global id, service, branch).
pub fn quoted_token(global_id: &str, service: &str, branch: &str) -> String {
    format!(
        "{}{}",
        QUOTED_TOKEN_PREFIX,
        md5_hex(format!("{}:{}:{}", global_id, service, branch).as_bytes())
    )
}

pub fn is_flow_user(user: &str) -> bool {
    user.starts_with(FLOW_TOKEN_PREFIX)
}

fn flow_uri(user: &str, local: &SipAddr, ob: bool) -> String {
    let ob = if ob { ";ob" } else { "" };
    format!("<sip:{}@{};lr{}>", user, local.addr, ob)
}

/// Record-Route carrying either the recorded flow or the quoted
/// branch token.
pub fn make_record_route(user: &str, local: &SipAddr) -> Header {
    Header::RecordRoute(flow_uri(user, local, false).into())
}

/// Path for REGISTER, `lr` always, `ob` when the flow was annotated
/// as the first hop (RFC 3327 / RFC 5626 §5).
pub fn make_path(user: &str, local: &SipAddr, ob: bool) -> Header {
    Header::Other("Path".into(), flow_uri(user, local, ob))
}

/// What the top Route of an inbound request tells us about flows.
#[derive(Default)]
pub struct FlowRoute {
    /// Connection the request must continue over.
    pub route_flow: Option<TransportHandle>,
    /// Flow to advertise in generated Record-Route/Path, with its
    /// `ob` annotation.
    pub record_flow: Option<(TransportHandle, bool)>,
}

fn has_ob(params: &[Param]) -> bool {
    params.iter().any(|param| match param {
        Param::Other(name, _) => name.value().eq_ignore_ascii_case("ob"),
        _ => false,
    })
}

fn contact_has_ob(request: &Request) -> bool {
    request
        .contact_header()
        .ok()
        .and_then(|contact| contact.typed().ok())
        .map(|contact| has_ob(&contact.params) || has_ob(&contact.uri.params))
        .unwrap_or(false)
}

/// Inspect the top Route of an inbound request (RFC 5626 §5.3).
///
/// A route carrying one of our flow tokens either confirms the
/// current connection (record only) or switches the outgoing
/// transport to the decoded flow; it is consumed either way. A
/// token-less route with `ob` records the current connection.
pub fn route_analysis(
    pool: &TransportPool,
    request: &mut Request,
    current: TransportHandle,
) -> Result<FlowRoute> {
    let top = match request.route_header() {
        Some(route) => match route.typed()?.uris().first().cloned() {
            Some(top) => top,
            None => return Ok(FlowRoute::default()),
        },
        None => return Ok(FlowRoute::default()),
    };
    let user = top.uri.auth.as_ref().map(|auth| auth.user.clone());

    // tokens are only meaningful in routes addressed to us; a route
    // towards another hop is left for plain forwarding
    if !pool.is_local(&top.uri.host_with_port) {
        return Ok(FlowRoute::default());
    }

    match user {
        Some(user) if is_flow_user(&user) => {
            let decoded = decode_flow_token(pool, &user)?;
            crate::header_pop!(request.headers, Header::Route);
            if decoded == current {
                Ok(FlowRoute {
                    route_flow: None,
                    record_flow: Some((current, false)),
                })
            } else {
                let record = has_ob(&top.uri.params) || contact_has_ob(request);
                Ok(FlowRoute {
                    route_flow: Some(decoded),
                    record_flow: record.then_some((decoded, false)),
                })
            }
        }
        _ => {
            if has_ob(&top.uri.params) {
                Ok(FlowRoute {
                    route_flow: None,
                    record_flow: Some((current, false)),
                })
            } else {
                Ok(FlowRoute::default())
            }
        }
    }
}

/// Build a local Contact, decorated per RFC 5626: `ob` on
/// dialog-forming requests when the UA supports outbound, `reg-id`
/// on REGISTER when configured, and a `+sip.instance` UUID.
pub fn make_contact(
    config: &ServiceConfig,
    local: &SipAddr,
    dialog_forming: bool,
    is_register: bool,
    outbound_supported: bool,
    reg_id: Option<u32>,
) -> rsip::typed::Contact {
    let uri = rsip::Uri {
        scheme: Some(rsip::Scheme::Sip),
        auth: Some(rsip::auth::Auth {
            user: config.name.clone(),
            password: None,
        }),
        host_with_port: local.addr.clone(),
        ..Default::default()
    };
    let mut params = vec![];
    if dialog_forming && outbound_supported {
        params.push(Param::Other(rsip::param::OtherParam::new("ob"), None));
    }
    if is_register {
        if let Some(reg_id) = reg_id.or(config.reg_id) {
            params.push(Param::Other(
                rsip::param::OtherParam::new("reg-id"),
                Some(rsip::param::OtherParamValue::new(reg_id.to_string())),
            ));
        }
    }
    if let Some(instance) = config.instance_id.as_ref() {
        params.push(Param::Other(
            rsip::param::OtherParam::new("+sip.instance"),
            Some(rsip::param::OtherParamValue::new(format!(
                "\"<urn:uuid:{}>\"",
                instance
            ))),
        ));
    }
    rsip::typed::Contact {
        display_name: None,
        uri,
        params,
    }
}

pub fn contact_param(contact: &rsip::typed::Contact, name: &str) -> Option<Option<String>> {
    contact.params.iter().find_map(|param| match param {
        Param::Other(param_name, value) if param_name.value().eq_ignore_ascii_case(name) => {
            Some(value.as_ref().map(|v| v.value().to_string()))
        }
        _ => None,
    })
}

pub fn contact_reg_id(contact: &rsip::typed::Contact) -> Option<u32> {
    contact_param(contact, "reg-id")
        .flatten()
        .and_then(|value| value.parse().ok())
}

pub fn contact_instance(contact: &rsip::typed::Contact) -> Option<String> {
    contact_param(contact, "+sip.instance")
        .flatten()
        .map(|value| value.trim_matches('"').to_string())
}
