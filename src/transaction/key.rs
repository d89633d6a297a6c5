use super::TransactionRole;
use crate::{Error, Result};
use rsip::{
    prelude::{HeadersExt, ToTypedHeader},
    Method,
};

/// Transaction identity derived from the top Via.
///
/// RFC 3261 branches (`z9hG4bK...`) key on (role, method, branch).
/// Pre-RFC branches fall back to the legacy matching tuple of RFC
/// 2543. ACK folds onto the INVITE it acknowledges; CANCEL keys as
/// its own transaction and is matched to its INVITE via
/// `cancel_target`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum TransactionKey {
    Rfc3261 {
        role: TransactionRole,
        method: Method,
        branch: String,
    },
    Rfc2543 {
        role: TransactionRole,
        method: Method,
        cseq: u32,
        from_tag: String,
        call_id: String,
        via_addr: String,
    },
    Invalid,
}

pub const RFC3261_BRANCH_PREFIX: &str = "z9hG4bK";

// rsip::Method does not implement Hash
impl std::hash::Hash for TransactionKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            TransactionKey::Rfc3261 {
                role,
                method,
                branch,
            } => {
                role.hash(state);
                method.to_string().hash(state);
                branch.hash(state);
            }
            TransactionKey::Rfc2543 {
                role,
                method,
                cseq,
                from_tag,
                call_id,
                via_addr,
            } => {
                role.hash(state);
                method.to_string().hash(state);
                cseq.hash(state);
                from_tag.hash(state);
                call_id.hash(state);
                via_addr.hash(state);
            }
            TransactionKey::Invalid => state.write_u8(0),
        }
    }
}

fn key_method(method: &Method) -> Method {
    match method {
        Method::Ack => Method::Invite,
        other => other.clone(),
    }
}

impl TransactionKey {
    pub fn from_request(req: &rsip::Request, role: TransactionRole) -> Result<Self> {
        let via = req.via_header()?.typed()?;
        let method = key_method(&req.method);
        match via.branch() {
            Some(branch) if branch.to_string().starts_with(RFC3261_BRANCH_PREFIX) => {
                Ok(TransactionKey::Rfc3261 {
                    role,
                    method,
                    branch: branch.to_string(),
                })
            }
            _ => Ok(TransactionKey::Rfc2543 {
                role,
                method,
                cseq: req.cseq_header()?.seq()?,
                from_tag: req
                    .from_header()?
                    .tag()?
                    .map(|tag| tag.to_string())
                    .ok_or(Error::Invalid("from tag"))?,
                call_id: req.call_id_header()?.to_string(),
                via_addr: via.uri.host_with_port.to_string(),
            }),
        }
    }

    pub fn from_response(resp: &rsip::Response, role: TransactionRole) -> Result<Self> {
        let via = resp.via_header()?.typed()?;
        let cseq = resp.cseq_header()?;
        let method = key_method(&cseq.method()?);
        match via.branch() {
            Some(branch) if branch.to_string().starts_with(RFC3261_BRANCH_PREFIX) => {
                Ok(TransactionKey::Rfc3261 {
                    role,
                    method,
                    branch: branch.to_string(),
                })
            }
            _ => Ok(TransactionKey::Rfc2543 {
                role,
                method,
                cseq: cseq.seq()?,
                from_tag: resp
                    .from_header()?
                    .tag()?
                    .map(|tag| tag.to_string())
                    .ok_or(Error::Invalid("from tag"))?,
                call_id: resp.call_id_header()?.to_string(),
                via_addr: via.uri.host_with_port.to_string(),
            }),
        }
    }

    /// The key of the INVITE a CANCEL (or anything sharing its
    /// branch) is aimed at.
    pub fn cancel_target(cancel: &rsip::Request, role: TransactionRole) -> Result<Self> {
        let mut key = Self::from_request(cancel, role)?;
        match &mut key {
            TransactionKey::Rfc3261 { method, .. } => *method = Method::Invite,
            TransactionKey::Rfc2543 { method, .. } => *method = Method::Invite,
            TransactionKey::Invalid => {}
        }
        Ok(key)
    }
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionKey::Rfc3261 {
                role,
                method,
                branch,
            } => write!(f, "{} {} ({})", role, method, branch),
            TransactionKey::Rfc2543 {
                role,
                method,
                cseq,
                from_tag,
                call_id,
                via_addr,
            } => write!(
                f,
                "{} {}/{} {} {}[{}]",
                role, method, cseq, from_tag, call_id, via_addr
            ),
            TransactionKey::Invalid => write!(f, "INVALID"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::headers::*;

    fn request(method: Method, branch: &str) -> rsip::Request {
        rsip::Request {
            method,
            uri: rsip::Uri::try_from("sip:bob@example.com").unwrap(),
            headers: vec![
                Via::new(format!("SIP/2.0/UDP ua.example.com:5060;branch={}", branch)).into(),
                CSeq::new("7 INVITE").into(),
                From::new("<sip:alice@example.com>;tag=fromtag1").into(),
                To::new("<sip:bob@example.com>").into(),
                CallId::new("key-test@example.com").into(),
            ]
            .into(),
            version: rsip::Version::V2,
            body: vec![],
        }
    }

    #[test]
    fn test_rfc3261_key_and_ack_fold() {
        let invite = request(Method::Invite, "z9hG4bK1234");
        let invite_key = TransactionKey::from_request(&invite, TransactionRole::Uas).unwrap();
        assert!(matches!(invite_key, TransactionKey::Rfc3261 { .. }));

        let ack = request(Method::Ack, "z9hG4bK1234");
        let ack_key = TransactionKey::from_request(&ack, TransactionRole::Uas).unwrap();
        assert_eq!(invite_key, ack_key);
    }

    #[test]
    fn test_legacy_branch_uses_rfc2543_tuple() {
        let invite = request(Method::Invite, "oldstyle77");
        let key = TransactionKey::from_request(&invite, TransactionRole::Uas).unwrap();
        assert!(matches!(key, TransactionKey::Rfc2543 { .. }));
    }

    #[test]
    fn test_cancel_targets_invite() {
        let invite = request(Method::Invite, "z9hG4bKabc");
        let mut cancel = request(Method::Cancel, "z9hG4bKabc");
        cancel
            .headers
            .retain(|h| !matches!(h, rsip::Header::CSeq(_)));
        cancel.headers.push(CSeq::new("7 CANCEL").into());

        let invite_key = TransactionKey::from_request(&invite, TransactionRole::Uas).unwrap();
        let cancel_key = TransactionKey::from_request(&cancel, TransactionRole::Uas).unwrap();
        assert_ne!(invite_key, cancel_key);

        let target = TransactionKey::cancel_target(&cancel, TransactionRole::Uas).unwrap();
        assert_eq!(invite_key, target);
    }

    #[test]
    fn test_roles_do_not_collide() {
        let invite = request(Method::Invite, "z9hG4bKxyz");
        let uac = TransactionKey::from_request(&invite, TransactionRole::Uac).unwrap();
        let uas = TransactionKey::from_request(&invite, TransactionRole::Uas).unwrap();
        assert_ne!(uac, uas);
    }
}
