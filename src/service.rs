use crate::{auth::DigestStatus, transaction::RequestOpts, transport::SipAddr};

/// A reply the application hands back to the engine: status plus
/// whatever extra headers/body the response should carry. The
/// optional `reason` lands in an RFC 3326 Reason header since the
/// status line phrase is fixed by the status code.
#[derive(Clone)]
pub struct SipReply {
    pub status: rsip::StatusCode,
    pub headers: Vec<rsip::Header>,
    pub body: Option<Vec<u8>>,
    pub reason: Option<String>,
}

impl SipReply {
    pub fn new(status: rsip::StatusCode) -> Self {
        SipReply {
            status,
            headers: vec![],
            body: None,
            reason: None,
        }
    }

    pub fn with_header(mut self, header: rsip::Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }
}

impl From<rsip::StatusCode> for SipReply {
    fn from(status: rsip::StatusCode) -> Self {
        SipReply::new(status)
    }
}

/// Pre-parsed authentication state handed to `sip_authorize`.
pub struct AuthorizeData {
    pub source: SipAddr,
    /// Digest verification outcome, when the request carried one.
    pub digest: Option<DigestStatus>,
    /// The source already authorized earlier in this dialog.
    pub dialog_authorized: bool,
}

pub enum AuthorizeReply {
    Ok,
    Forbidden,
    Authenticate { realm: Option<String> },
    ProxyAuthenticate { realm: Option<String> },
}

/// Routing decision for a UAS request.
pub enum RouteReply {
    Reply(SipReply),
    ReplyStateless(SipReply),
    Process,
    ProcessStateless,
    Proxy {
        uriset: Vec<Vec<rsip::Uri>>,
        opts: RequestOpts,
    },
    ProxyStateless {
        uris: Vec<rsip::Uri>,
        opts: RequestOpts,
    },
    StrictProxy {
        opts: RequestOpts,
    },
}

pub enum ProcessReply {
    Reply(SipReply),
    /// The engine's default handling applies.
    NoReply,
}

pub enum PasswordReply {
    /// Accept without checking the digest.
    True,
    /// Unknown user; authentication fails.
    False,
    Password(String),
    /// Pre-hashed HA1 for this (user, realm).
    Ha1(String),
}

/// Callbacks the host application implements.
///
/// All callbacks are synchronous and return enumerated variants so
/// the core can be unit tested without a host application. Every
/// method has a default, so `impl SipService for MyApp {}` is a
/// valid passive service.
pub trait SipService: Send + Sync + 'static {
    fn sip_authorize(&self, _auth: &AuthorizeData, _req: &rsip::Request) -> AuthorizeReply {
        AuthorizeReply::Ok
    }

    fn sip_route(
        &self,
        _scheme: Option<&rsip::Scheme>,
        _user: &str,
        _host: &str,
        _req: &rsip::Request,
    ) -> RouteReply {
        RouteReply::Process
    }

    /// Application-level answer for requests dispatched as `process`.
    /// `NoReply` falls through to the engine defaults: 200 for
    /// OPTIONS, 603 for INVITE, dialog handling for BYE, 405 for the
    /// rest.
    fn sip_process(&self, _req: &rsip::Request) -> ProcessReply {
        ProcessReply::NoReply
    }

    /// Notification only: the INVITE identified by `_invite` was
    /// cancelled by `_cancel`.
    fn sip_cancel(&self, _invite: &rsip::Request, _cancel: &rsip::Request) {}

    fn sip_get_user_pass(&self, _user: &str, _realm: &str, _req: &rsip::Request) -> PasswordReply {
        PasswordReply::False
    }

    /// Observational hook: a frame was parsed on a connection.
    fn on_connection_recv(&self, _msg: &rsip::SipMessage, _raw: &[u8]) {}
}

/// The all-defaults service.
pub struct DefaultService;

impl SipService for DefaultService {}
