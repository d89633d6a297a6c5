use crate::auth::Credential;
use crate::transport::{SipAddr, TransportHandle};
use key::TransactionKey;
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Header, Method, Param, Request, Response, StatusCode};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub mod key;
pub mod uac;
pub mod uas;
#[cfg(test)]
mod tests;

pub const TO_TAG_LEN: usize = 8;
pub const BRANCH_LEN: usize = 12;
pub const CNONCE_LEN: usize = 8;
pub const NONCE_LEN: usize = 16;
pub const CALL_ID_LEN: usize = 22;

pub fn random_text(count: usize) -> String {
    use rand::Rng;
    rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(count)
        .map(char::from)
        .collect::<String>()
}

pub fn make_via_branch() -> rsip::Param {
    rsip::Param::Branch(format!("z9hG4bK{}", random_text(BRANCH_LEN)).into())
}

pub fn make_tag() -> rsip::param::Tag {
    random_text(TO_TAG_LEN).into()
}

pub fn make_call_id(domain: Option<&str>) -> rsip::headers::CallId {
    format!(
        "{}@{}",
        random_text(CALL_ID_LEN),
        domain.unwrap_or("localhost")
    )
    .into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Uac,
    Uas,
}

impl std::fmt::Display for TransactionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionRole::Uac => write!(f, "uac"),
            TransactionRole::Uas => write!(f, "uas"),
        }
    }
}

/// RFC 3261 §17 transaction states, both classes merged into one
/// enum. A status never moves backward; `rank` is the partial order
/// the FSMs enforce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    InviteCalling,
    InviteProceeding,
    InviteAccepted,
    InviteCompleted,
    InviteConfirmed,
    Trying,
    Proceeding,
    Completed,
    Finished,
}

impl TransactionStatus {
    pub fn rank(&self) -> u8 {
        match self {
            TransactionStatus::InviteCalling => 0,
            TransactionStatus::InviteProceeding => 1,
            TransactionStatus::InviteAccepted => 2,
            TransactionStatus::InviteCompleted => 2,
            TransactionStatus::InviteConfirmed => 3,
            TransactionStatus::Trying => 0,
            TransactionStatus::Proceeding => 1,
            TransactionStatus::Completed => 2,
            TransactionStatus::Finished => 9,
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionStatus::InviteCalling => "invite_calling",
            TransactionStatus::InviteProceeding => "invite_proceeding",
            TransactionStatus::InviteAccepted => "invite_accepted",
            TransactionStatus::InviteCompleted => "invite_completed",
            TransactionStatus::InviteConfirmed => "invite_confirmed",
            TransactionStatus::Trying => "trying",
            TransactionStatus::Proceeding => "proceeding",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Finished => "finished",
        };
        write!(f, "{}", name)
    }
}

/// Responses delivered back to whoever initiated a UAC transaction.
#[derive(Debug)]
pub enum UacEvent {
    Provisional(Response),
    Final(Response),
}

pub type UacSender = UnboundedSender<UacEvent>;
pub type UacReceiver = UnboundedReceiver<UacEvent>;

/// Where replies for a transaction go: the originating caller, the
/// fork that launched it (by id, never an owning reference), or
/// nobody (ACK, stateless work).
#[derive(Clone)]
pub enum TransactionUser {
    Caller(UacSender),
    Fork(u32),
    None,
}

impl TransactionUser {
    pub fn fork_id(&self) -> Option<u32> {
        match self {
            TransactionUser::Fork(id) => Some(*id),
            _ => None,
        }
    }
}

impl std::fmt::Debug for TransactionUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionUser::Caller(_) => write!(f, "caller"),
            TransactionUser::Fork(id) => write!(f, "fork {}", id),
            TransactionUser::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStatus {
    No,
    /// CANCEL requested before any provisional arrived; sent at the
    /// first 1xx.
    ToCancel,
    Cancelled,
}

/// Options accepted by `send_request` and the proxy/fork engine.
#[derive(Clone, Default)]
pub struct RequestOpts {
    pub stateless: bool,
    /// Do not auto-CANCEL a pending INVITE when its Expires lapses.
    pub no_auto_expire: bool,
    /// Add a locally built Contact to the request.
    pub contact: bool,
    pub supported: Vec<String>,
    pub expires: Option<u32>,
    pub headers: Vec<Header>,
    pub body: Option<Vec<u8>>,
    pub credential: Option<Credential>,
    pub reg_id: Option<u32>,
    /// Proxy: chase 3xx responses instead of collecting them.
    pub follow_redirects: bool,
    /// Proxy: stay in the path of dialog requests.
    pub record_route: bool,
    /// Proxy: insert a Path header when forwarding REGISTER
    /// (RFC 3327).
    pub path: bool,
    /// Proxy: override the service Timer C for these branches.
    pub timer_c: Option<Duration>,
}

/// One client or server transaction, owned by its call actor.
pub struct Transaction {
    pub id: u32,
    pub role: TransactionRole,
    pub method: Method,
    pub status: TransactionStatus,
    pub key: TransactionKey,
    pub request: Request,
    pub response: Option<Response>,
    pub opts: RequestOpts,
    pub from: TransactionUser,
    pub timeout_timer: Option<u64>,
    pub retrans_timer: Option<u64>,
    pub expire_timer: Option<u64>,
    pub retrans_count: u32,
    pub next_retrans: Duration,
    pub stateless: bool,
    pub connection: Option<TransportHandle>,
    pub destination: Option<SipAddr>,
    /// Where the request came from; CANCEL must match it.
    pub source: Option<SipAddr>,
    pub cancel: CancelStatus,
    pub reliable: bool,
    /// UAS: the To tag this transaction answers with.
    pub local_tag: Option<String>,
    /// A credential retry already went out for this request.
    pub auth_sent: bool,
    /// Outbound: flow to advertise in Record-Route/Path, with its
    /// first-hop `ob` annotation.
    pub record_flow: Option<(TransportHandle, bool)>,
    /// Outbound: flow the request must be sent over.
    pub route_flow: Option<TransportHandle>,
    pub touched: Instant,
}

impl Transaction {
    pub fn new(
        id: u32,
        role: TransactionRole,
        key: TransactionKey,
        request: Request,
        opts: RequestOpts,
        from: TransactionUser,
    ) -> Self {
        let method = match request.method {
            Method::Ack => Method::Invite,
            ref method => method.clone(),
        };
        let status = match (role, &method) {
            (TransactionRole::Uac, Method::Invite) => TransactionStatus::InviteCalling,
            (TransactionRole::Uas, Method::Invite) => TransactionStatus::InviteProceeding,
            _ => TransactionStatus::Trying,
        };
        let stateless = opts.stateless;
        Transaction {
            id,
            role,
            method,
            status,
            key,
            request,
            response: None,
            opts,
            from,
            timeout_timer: None,
            retrans_timer: None,
            expire_timer: None,
            retrans_count: 0,
            next_retrans: Duration::from_millis(500),
            stateless,
            connection: None,
            destination: None,
            source: None,
            cancel: CancelStatus::No,
            reliable: false,
            local_tag: None,
            auth_sent: false,
            record_flow: None,
            route_flow: None,
            touched: Instant::now(),
        }
    }

    pub fn is_invite(&self) -> bool {
        self.method == Method::Invite
    }

    pub fn is_finished(&self) -> bool {
        self.status == TransactionStatus::Finished
    }

    pub fn touch(&mut self) {
        self.touched = Instant::now();
    }

    /// Forward-only status transition; backward moves are ignored.
    pub fn set_status(&mut self, status: TransactionStatus) -> bool {
        if self.is_finished() || status.rank() < self.status.rank() {
            return false;
        }
        self.status = status;
        true
    }

    pub fn last_provisional(&self) -> Option<u16> {
        self.response.as_ref().and_then(|resp| {
            let code = u16::from(resp.status_code.clone());
            (code >= 101 && code < 200).then_some(code)
        })
    }
}

/// Build a response from a request: Via set, From, To (tagged unless
/// 100), Call-ID and CSeq are copied, everything else is up to the
/// caller. `reason` lands in an RFC 3326 Reason header.
pub fn make_response(
    req: &Request,
    status: StatusCode,
    to_tag: Option<&str>,
    reason: Option<&str>,
) -> Response {
    let mut headers = rsip::Headers::default();
    for header in req.headers.iter() {
        match header {
            Header::Via(via) => headers.push(Header::Via(via.clone())),
            Header::From(from) => headers.push(Header::From(from.clone())),
            Header::To(to) => {
                let tagged = match (to_tag, status != StatusCode::Trying) {
                    (Some(tag), true) => match to.clone().typed() {
                        Ok(typed) => {
                            if typed.params.iter().any(|p| matches!(p, Param::Tag(_))) {
                                Header::To(to.clone())
                            } else {
                                Header::To(typed.with_tag(tag.into()).into())
                            }
                        }
                        Err(_) => Header::To(to.clone()),
                    },
                    _ => Header::To(to.clone()),
                };
                headers.push(tagged);
            }
            Header::CallId(call_id) => headers.push(Header::CallId(call_id.clone())),
            Header::CSeq(cseq) => headers.push(Header::CSeq(cseq.clone())),
            _ => {}
        }
    }
    if let Some(text) = reason {
        headers.push(crate::rsip_ext::reason_header(
            u16::from(status.clone()),
            text,
        ));
    }
    headers.push(Header::ContentLength(0.into()));
    Response {
        status_code: status,
        headers,
        version: rsip::Version::V2,
        body: vec![],
    }
}

/// Build the ACK for a non-2xx INVITE answer: same branch, same
/// route, To taken from the response (RFC 3261 §17.1.1.3).
pub fn make_non_2xx_ack(req: &Request, resp: &Response) -> crate::Result<Request> {
    let mut headers = rsip::Headers::default();
    headers.push(Header::Via(req.via_header()?.clone()));
    headers.push(Header::From(req.from_header()?.clone()));
    headers.push(Header::To(resp.to_header()?.clone()));
    headers.push(Header::CallId(req.call_id_header()?.clone()));
    let cseq = rsip::typed::CSeq {
        seq: req.cseq_header()?.seq()?,
        method: Method::Ack,
    };
    headers.push(Header::CSeq(cseq.into()));
    for header in req.headers.iter() {
        if let Header::Route(route) = header {
            headers.push(Header::Route(route.clone()));
        }
    }
    headers.push(Header::MaxForwards(70.into()));
    headers.push(Header::ContentLength(0.into()));
    Ok(Request {
        method: Method::Ack,
        uri: req.uri.clone(),
        headers,
        version: rsip::Version::V2,
        body: vec![],
    })
}

/// Build the CANCEL for a pending INVITE: same branch, same RURI,
/// CSeq number kept with method CANCEL (RFC 3261 §9.1).
pub fn make_cancel(req: &Request, reason: Option<&str>) -> crate::Result<Request> {
    let mut headers = rsip::Headers::default();
    headers.push(Header::Via(req.via_header()?.clone()));
    headers.push(Header::From(req.from_header()?.clone()));
    headers.push(Header::To(req.to_header()?.clone()));
    headers.push(Header::CallId(req.call_id_header()?.clone()));
    let cseq = rsip::typed::CSeq {
        seq: req.cseq_header()?.seq()?,
        method: Method::Cancel,
    };
    headers.push(Header::CSeq(cseq.into()));
    for header in req.headers.iter() {
        if let Header::Route(route) = header {
            headers.push(Header::Route(route.clone()));
        }
    }
    if let Some(text) = reason {
        headers.push(Header::Other("Reason".into(), format!("SIP;text=\"{}\"", text)));
    }
    headers.push(Header::MaxForwards(70.into()));
    headers.push(Header::ContentLength(0.into()));
    Ok(Request {
        method: Method::Cancel,
        uri: req.uri.clone(),
        headers,
        version: rsip::Version::V2,
        body: vec![],
    })
}
