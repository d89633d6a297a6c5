//! Contact binding store with RFC 5626 outbound indexing and RFC 3327
//! path replay.

use crate::auth::md5_hex;
use crate::config::{Plugin, ServiceConfig};
use crate::outbound;
use crate::rsip_ext::{header_contains_token, header_values};
use crate::service::SipReply;
use crate::transport::{TransportHandle, TransportPool};
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, Request, StatusCode};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const DEFAULT_EXPIRES: u32 = 3600;

/// How a binding is keyed: pre-outbound contacts by their concrete
/// address, outbound contacts by (instance hash, reg-id) so one
/// device can hold several flows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactIndex {
    Generic {
        scheme: String,
        transport: String,
        user: String,
        host: String,
        port: u16,
    },
    Outbound {
        instance: String,
        reg_id: u32,
    },
}

#[derive(Clone)]
pub struct RegContact {
    pub index: ContactIndex,
    pub contact: rsip::typed::Contact,
    /// Route set to replay through proxies back to the UA, verbatim.
    pub path: Vec<String>,
    pub connection: Option<TransportHandle>,
    pub expires_at: Instant,
    pub call_id: String,
    pub cseq: u32,
}

struct RegistrarInner {
    bindings: RwLock<HashMap<String, Vec<RegContact>>>,
}

/// The binding store. All writers funnel through `process_register`,
/// keeping the single-logical-writer discipline.
#[derive(Clone)]
pub struct Registrar {
    inner: Arc<RegistrarInner>,
}

impl Default for Registrar {
    fn default() -> Self {
        Self::new()
    }
}

pub fn aor_of(uri: &rsip::Uri) -> String {
    let scheme = uri
        .scheme
        .as_ref()
        .map(|s| s.to_string().to_lowercase())
        .unwrap_or_else(|| "sip".to_string());
    let user = uri
        .auth
        .as_ref()
        .map(|auth| auth.user.clone())
        .unwrap_or_default();
    format!("{}:{}@{}", scheme, user, uri.host_with_port.host)
}

/// Percent-encode a path list into a single URI parameter value.
pub fn encode_route_param(paths: &[String]) -> String {
    let joined = paths.join(",");
    let mut encoded = String::with_capacity(joined.len());
    for byte in joined.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

pub fn decode_route_param(value: &str) -> Vec<String> {
    let mut decoded = Vec::new();
    let mut bytes = value.bytes();
    let mut current = Vec::new();
    while let Some(byte) = bytes.next() {
        if byte == b'%' {
            let hi = bytes.next().unwrap_or(b'0');
            let lo = bytes.next().unwrap_or(b'0');
            let hex = [hi, lo];
            if let Ok(value) =
                u8::from_str_radix(std::str::from_utf8(&hex).unwrap_or("0"), 16)
            {
                current.push(value);
            }
        } else {
            current.push(byte);
        }
    }
    for part in String::from_utf8_lossy(&current).split(',') {
        if !part.is_empty() {
            decoded.push(part.to_string());
        }
    }
    decoded
}

impl Registrar {
    pub fn new() -> Self {
        Registrar {
            inner: Arc::new(RegistrarInner {
                bindings: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Live bindings for an AOR, most recently refreshed first. Each
    /// contact URI carries its path list as a `route` URI parameter
    /// so a proxy can replay the hops.
    pub fn find(&self, aor: &str) -> Vec<rsip::Uri> {
        let now = Instant::now();
        let bindings = self.inner.bindings.read().unwrap();
        bindings
            .get(aor)
            .map(|list| {
                list.iter()
                    .filter(|binding| binding.expires_at > now)
                    .map(|binding| {
                        let mut uri = binding.contact.uri.clone();
                        if !binding.path.is_empty() {
                            uri.params.push(rsip::Param::Other(
                                rsip::param::OtherParam::new("route"),
                                Some(rsip::param::OtherParamValue::new(encode_route_param(
                                    &binding.path,
                                ))),
                            ));
                        }
                        uri
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn bindings(&self, aor: &str) -> Vec<RegContact> {
        let now = Instant::now();
        let bindings = self.inner.bindings.read().unwrap();
        bindings
            .get(aor)
            .map(|list| {
                list.iter()
                    .filter(|binding| binding.expires_at > now)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        self.inner.bindings.write().unwrap().clear();
    }

    fn sweep(&self, aor: &str) {
        let now = Instant::now();
        let mut bindings = self.inner.bindings.write().unwrap();
        if let Some(list) = bindings.get_mut(aor) {
            list.retain(|binding| binding.expires_at > now);
        }
    }

    /// Handle a REGISTER per §10 plus RFC 5626 registrar behaviour.
    /// All failures are folded into the reply.
    pub fn process_register(
        &self,
        config: &ServiceConfig,
        pool: &TransportPool,
        request: &Request,
        connection: TransportHandle,
    ) -> SipReply {
        let to_uri = match request.to_header().ok().and_then(|to| to.typed().ok()) {
            Some(typed) => typed.uri,
            None => return SipReply::new(StatusCode::BadRequest).with_reason("Invalid To"),
        };
        let aor = aor_of(&to_uri);
        self.sweep(&aor);

        let call_id = request
            .call_id_header()
            .map(|header| header.to_string())
            .unwrap_or_default();
        let cseq = request
            .cseq_header()
            .ok()
            .and_then(|header| header.seq().ok())
            .unwrap_or(0);
        let default_expires = request
            .expires_header()
            .and_then(|header| header.seconds().ok())
            .unwrap_or(DEFAULT_EXPIRES);

        // star contact wipes every binding for the AOR
        let star = request.headers.iter().any(|header| {
            matches!(header, Header::Contact(contact) if contact.value().trim() == "*")
        });
        if star {
            if default_expires == 0 {
                self.inner.bindings.write().unwrap().remove(&aor);
                return SipReply::new(StatusCode::OK);
            }
            return SipReply::new(StatusCode::BadRequest).with_reason("Invalid Contact");
        }

        let mut contacts = Vec::new();
        for header in request.headers.iter() {
            if let Header::Contact(contact) = header {
                match contact.typed() {
                    Ok(typed) => contacts.push(typed),
                    Err(_) => {
                        return SipReply::new(StatusCode::BadRequest)
                            .with_reason("Invalid Contact")
                    }
                }
            }
        }

        let contact_expires = |contact: &rsip::typed::Contact| -> u32 {
            contact
                .expires()
                .and_then(|expires| expires.seconds().ok())
                .or_else(|| {
                    outbound::contact_param(contact, "expires")
                        .flatten()
                        .and_then(|value| value.parse().ok())
                })
                .unwrap_or(default_expires)
        };

        // several live reg-ids in one REGISTER are not allowed
        let live_reg_ids = contacts
            .iter()
            .filter(|contact| contact_expires(contact) > 0)
            .filter(|contact| outbound::contact_reg_id(contact).is_some())
            .count();
        if live_reg_ids > 1 {
            return SipReply::new(StatusCode::BadRequest)
                .with_reason("Several 'reg-id' Options");
        }

        let outbound_plugin = config.has_plugin(Plugin::Outbound);
        let outbound_supported = outbound_plugin
            && header_contains_token(&request.headers, "Supported", "outbound");
        let via_count = request
            .headers
            .iter()
            .filter(|header| matches!(header, Header::Via(_)))
            .count();
        let mut paths = header_values(&request.headers, "path");
        let uses_reg_id = contacts
            .iter()
            .any(|contact| outbound::contact_reg_id(contact).is_some());

        let mut outbound_applies = false;
        let mut reply_headers: Vec<Header> = Vec::new();

        if outbound_supported && via_count == 1 {
            // direct client: we are the first hop, record the flow
            let local = pool
                .get(connection)
                .map(|conn| conn.get_addr().clone())
                .unwrap_or_default();
            let token = outbound::encode_flow_token(connection);
            let path = outbound::make_path(&token, &local, true);
            if let Header::Other(_, value) = &path {
                paths.push(value.clone());
            }
            reply_headers.push(path);
            outbound_applies = uses_reg_id;
        } else if outbound_supported {
            if paths.iter().any(|path| !path.contains('<')) {
                return SipReply::new(StatusCode::BadRequest).with_reason("Invalid Path");
            }
            // proxied client: the first hop towards the UA is the
            // last Path element and must have committed to outbound
            match paths.last() {
                Some(last) => {
                    let ob = last.contains(";ob");
                    if !ob && uses_reg_id {
                        return SipReply::new(crate::rsip_ext::status_code_by_number(439))
                            .with_reason("First Hop Lacks Outbound Support");
                    }
                    outbound_applies = ob && uses_reg_id;
                }
                None => {
                    if uses_reg_id {
                        return SipReply::new(crate::rsip_ext::status_code_by_number(439))
                            .with_reason("First Hop Lacks Outbound Support");
                    }
                }
            }
        }

        let transport = pool
            .get(connection)
            .and_then(|conn| conn.get_addr().r#type)
            .map(|t| t.to_string().to_lowercase())
            .unwrap_or_else(|| "udp".to_string());

        for contact in contacts.iter() {
            let expires = contact_expires(contact);
            let index = match (
                outbound_applies,
                outbound::contact_reg_id(contact),
                outbound::contact_instance(contact),
            ) {
                (true, Some(reg_id), Some(instance)) => ContactIndex::Outbound {
                    instance: md5_hex(instance.as_bytes()),
                    reg_id,
                },
                _ => ContactIndex::Generic {
                    scheme: contact
                        .uri
                        .scheme
                        .as_ref()
                        .map(|s| s.to_string().to_lowercase())
                        .unwrap_or_else(|| "sip".to_string()),
                    transport: transport.clone(),
                    user: contact
                        .uri
                        .auth
                        .as_ref()
                        .map(|auth| auth.user.clone())
                        .unwrap_or_default(),
                    host: contact.uri.host_with_port.host.to_string(),
                    port: contact
                        .uri
                        .host_with_port
                        .port
                        .map(|port| *port.value())
                        .unwrap_or(5060),
                },
            };

            let mut bindings = self.inner.bindings.write().unwrap();
            let list = bindings.entry(aor.clone()).or_default();
            if let Some(existing) = list.iter().find(|binding| binding.index == index) {
                if existing.call_id == call_id && existing.cseq >= cseq {
                    return SipReply::new(StatusCode::BadRequest).with_reason("Invalid CSeq");
                }
            }
            list.retain(|binding| binding.index != index);
            if expires > 0 {
                // refreshed bindings move to the front
                list.insert(
                    0,
                    RegContact {
                        index,
                        contact: contact.clone(),
                        path: paths.clone(),
                        connection: Some(connection),
                        expires_at: Instant::now() + Duration::from_secs(expires as u64),
                        call_id: call_id.clone(),
                        cseq,
                    },
                );
                debug!(aor = %aor, "binding stored");
            } else {
                info!(aor = %aor, "binding removed");
            }
        }

        let mut reply = SipReply::new(StatusCode::OK);
        for binding in self.bindings(&aor) {
            let remaining = binding
                .expires_at
                .saturating_duration_since(Instant::now())
                .as_secs();
            let mut contact = binding.contact.clone();
            contact
                .params
                .retain(|param| !matches!(param, rsip::Param::Other(name, _) if name.value().eq_ignore_ascii_case("expires")));
            contact.params.push(rsip::Param::Other(
                rsip::param::OtherParam::new("expires"),
                Some(rsip::param::OtherParamValue::new(remaining.to_string())),
            ));
            reply.headers.push(Header::Contact(contact.into()));
        }
        for header in reply_headers {
            reply.headers.push(header);
        }
        if outbound_applies {
            reply
                .headers
                .push(Header::Other("Require".into(), "outbound".into()));
            reply
                .headers
                .push(Header::Other("Supported".into(), "outbound".into()));
        }
        reply
    }
}
