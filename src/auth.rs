use crate::service::PasswordReply;
use crate::transaction::{random_text, CNONCE_LEN, NONCE_LEN};
use crate::Result;
use rsip::headers::auth::{self, AuthQop};
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::services::DigestGenerator;
use rsip::typed::{Authorization, ProxyAuthorization};
use rsip::{Header, Method, Request, Response};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Passwords beginning with this prefix are stored HA1 hashes, not
/// clear text.
pub const HA1_PREFIX: &str = "HA1!";

#[derive(Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

pub fn md5_hex(bytes: &[u8]) -> String {
    format!("{:032x}", md5::compute(bytes))
}

/// The `opaque` challenge value identifying this service.
pub fn opaque_for(service: &str) -> String {
    md5_hex(service.as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    /// Digest verified.
    Ok,
    /// Stale or missing nonce but the opaque matched this service:
    /// the client should retry against a fresh challenge.
    Invalid,
    /// Malformed or unsupported Authorization header.
    InvalidAuthHeader,
    /// Nonce unknown and opaque does not belong to us.
    UnknownNonce,
    /// `sip_get_user_pass` had no password for the user.
    NoPass,
    /// Recomputed digest did not match.
    Failed,
}

/// Digest verification outcome plus the identity it applies to.
#[derive(Debug, Clone)]
pub struct DigestStatus {
    pub user: String,
    pub realm: String,
    pub result: AuthResult,
}

struct NonceEntry {
    ip: Option<IpAddr>,
    issued: Instant,
}

/// Time-bounded nonce table. One per call, so the (service, call-id)
/// key components of the challenge are implicit.
pub struct NonceCache {
    entries: HashMap<String, NonceEntry>,
    timeout: Duration,
}

impl NonceCache {
    pub fn new(timeout: Duration) -> Self {
        NonceCache {
            entries: HashMap::new(),
            timeout,
        }
    }

    pub fn issue(&mut self, ip: Option<IpAddr>) -> String {
        let nonce = random_text(NONCE_LEN);
        self.entries.insert(
            nonce.clone(),
            NonceEntry {
                ip,
                issued: Instant::now(),
            },
        );
        nonce
    }

    fn lookup(&self, nonce: &str, now: Instant) -> Option<&NonceEntry> {
        let entry = self.entries.get(nonce)?;
        if now.duration_since(entry.issued) > self.timeout {
            return None;
        }
        Some(entry)
    }

    pub fn sweep(&mut self, now: Instant) {
        let timeout = self.timeout;
        self.entries
            .retain(|_, entry| now.duration_since(entry.issued) <= timeout);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Build a 401/407 Digest challenge header.
pub fn challenge(proxy: bool, realm: &str, nonce: String, opaque: String) -> Header {
    let www = rsip::typed::WwwAuthenticate {
        scheme: auth::Scheme::Digest,
        realm: realm.to_string(),
        domain: None,
        nonce,
        opaque: Some(opaque),
        stale: None,
        algorithm: Some(auth::Algorithm::Md5),
        qop: Some(auth::Qop::Auth),
        charset: None,
    };
    if proxy {
        Header::ProxyAuthenticate(rsip::typed::ProxyAuthenticate(www).into())
    } else {
        Header::WwwAuthenticate(www.into())
    }
}

fn extract_authorization(req: &Request) -> Option<std::result::Result<Authorization, rsip::Error>> {
    for header in req.headers.iter() {
        match header {
            Header::Authorization(value) => return Some(value.typed()),
            Header::ProxyAuthorization(value) => {
                return Some(value.typed().map(|typed| typed.0))
            }
            _ => {}
        }
    }
    None
}

fn ha1_for(user: &str, realm: &str, password: &str) -> String {
    if let Some(ha1) = password.strip_prefix(HA1_PREFIX) {
        return ha1.to_string();
    }
    md5_hex(format!("{}:{}:{}", user, realm, password).as_bytes())
}

/// Verify the Digest credentials of `req` against the per-call nonce
/// table. Returns None when the request carries no Digest at all.
///
/// The source IP must match the one the nonce was issued to; ACK is
/// waived because it can arrive on a different connection.
pub fn check_digest<F>(
    req: &Request,
    source_ip: Option<IpAddr>,
    nonces: &NonceCache,
    service_opaque: &str,
    get_pass: F,
) -> Option<DigestStatus>
where
    F: Fn(&str, &str) -> PasswordReply,
{
    let authorization = match extract_authorization(req)? {
        Ok(authorization) => authorization,
        Err(_) => {
            return Some(DigestStatus {
                user: String::new(),
                realm: String::new(),
                result: AuthResult::InvalidAuthHeader,
            })
        }
    };

    let user = authorization.username.clone();
    let realm = authorization.realm.clone();
    let fail = |result: AuthResult| {
        Some(DigestStatus {
            user: user.clone(),
            realm: realm.clone(),
            result,
        })
    };

    if authorization.scheme != auth::Scheme::Digest {
        return fail(AuthResult::InvalidAuthHeader);
    }
    if let Some(algorithm) = authorization.algorithm {
        if algorithm != auth::Algorithm::Md5 {
            return fail(AuthResult::InvalidAuthHeader);
        }
    }
    let (cnonce, nc) = match &authorization.qop {
        Some(AuthQop::Auth { cnonce, nc }) => (cnonce.clone(), *nc),
        _ => return fail(AuthResult::InvalidAuthHeader),
    };

    match nonces.lookup(&authorization.nonce, Instant::now()) {
        Some(entry) => {
            // the nonce is pinned to the IP it was issued to; ACK may
            // legitimately arrive from elsewhere
            if req.method != Method::Ack {
                if let (Some(stored), Some(seen)) = (entry.ip, source_ip) {
                    if stored != seen {
                        return fail(AuthResult::UnknownNonce);
                    }
                }
            }
        }
        None => {
            let ours = authorization
                .opaque
                .as_deref()
                .map(|opaque| opaque == service_opaque)
                .unwrap_or(false);
            return fail(if ours {
                AuthResult::Invalid
            } else {
                AuthResult::UnknownNonce
            });
        }
    }

    let password = match get_pass(&user, &realm) {
        PasswordReply::True => return fail(AuthResult::Ok),
        PasswordReply::False => return fail(AuthResult::NoPass),
        PasswordReply::Password(password) => password,
        PasswordReply::Ha1(ha1) => format!("{}{}", HA1_PREFIX, ha1),
    };

    let ha1 = ha1_for(&user, &realm, &password);
    // ACK re-uses the INVITE credentials
    let method = match req.method {
        Method::Ack => Method::Invite,
        ref method => method.clone(),
    };
    let ha2 = md5_hex(format!("{}:{}", method, authorization.uri).as_bytes());
    let expected = md5_hex(
        format!(
            "{}:{}:{:08x}:{}:auth:{}",
            ha1, authorization.nonce, nc, cnonce, ha2
        )
        .as_bytes(),
    );

    fail(if expected == authorization.response {
        AuthResult::Ok
    } else {
        AuthResult::Failed
    })
}

/// Build the Authorization/Proxy-Authorization answer to a 401/407
/// challenge, for the UAC retry path.
pub fn make_client_auth(
    resp: &Response,
    req: &Request,
    credential: &Credential,
) -> Result<Header> {
    let (challenge, proxy) = match resp.www_authenticate_header() {
        Some(header) => (header.typed()?, false),
        None => {
            let mut found = None;
            for header in resp.headers.iter() {
                if let Header::ProxyAuthenticate(value) = header {
                    found = Some(value.typed()?.0.clone());
                    break;
                }
            }
            match found {
                Some(challenge) => (challenge, true),
                None => return Err(crate::Error::Invalid("challenge")),
            }
        }
    };

    let auth_qop = AuthQop::Auth {
        cnonce: random_text(CNONCE_LEN),
        nc: 1,
    };
    let generator = DigestGenerator {
        username: credential.username.as_str(),
        password: credential.password.as_str(),
        algorithm: challenge.algorithm.unwrap_or_default(),
        nonce: challenge.nonce.as_str(),
        method: &req.method,
        qop: Some(&auth_qop),
        uri: &req.uri,
        realm: challenge.realm.as_str(),
    };
    let authorization = Authorization {
        scheme: challenge.scheme,
        username: credential.username.clone(),
        realm: challenge.realm.clone(),
        nonce: challenge.nonce.clone(),
        uri: req.uri.clone(),
        response: generator.compute(),
        algorithm: challenge.algorithm,
        opaque: challenge.opaque.clone(),
        qop: Some(auth_qop),
    };
    Ok(if proxy {
        Header::ProxyAuthorization(ProxyAuthorization(authorization).into())
    } else {
        Header::Authorization(authorization.into())
    })
}
