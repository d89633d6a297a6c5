use crate::{Error, Result};
use rsip::prelude::{HeadersExt, UntypedHeader};
use rsip::{Request, Response};

pub mod dialog;

#[cfg(test)]
mod tests;

/// SIP dialog identity: Call-ID plus both tags (RFC 3261 §12).
///
/// Identity is symmetric, so the id computed from a request equals
/// the one computed from its response no matter which side we are.
/// During early dialog establishment `to_tag` may still be empty.
#[derive(Clone, Debug)]
pub struct DialogId {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
}

impl PartialEq for DialogId {
    fn eq(&self, other: &DialogId) -> bool {
        if self.call_id != other.call_id {
            return false;
        }
        if self.from_tag == other.from_tag && self.to_tag == other.to_tag {
            return true;
        }
        if self.from_tag == other.to_tag && self.to_tag == other.from_tag {
            return true;
        }
        false
    }
}

impl Eq for DialogId {}

impl std::hash::Hash for DialogId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.call_id.hash(state);
        if self.from_tag > self.to_tag {
            self.from_tag.hash(state);
            self.to_tag.hash(state);
        } else {
            self.to_tag.hash(state);
            self.from_tag.hash(state);
        }
    }
}

impl TryFrom<&Request> for DialogId {
    type Error = crate::Error;

    fn try_from(request: &Request) -> Result<Self> {
        let call_id = request.call_id_header()?.value().to_string();
        let from_tag = match request.from_header()?.tag()? {
            Some(tag) => tag.value().to_string(),
            None => return Err(Error::Invalid("from tag")),
        };
        let to_tag = match request.to_header()?.tag()? {
            Some(tag) => tag.value().to_string(),
            None => "".to_string(),
        };
        Ok(DialogId {
            call_id,
            from_tag,
            to_tag,
        })
    }
}

impl TryFrom<&Response> for DialogId {
    type Error = crate::Error;

    fn try_from(resp: &Response) -> Result<Self> {
        let call_id = resp.call_id_header()?.value().to_string();
        let from_tag = match resp.from_header()?.tag()? {
            Some(tag) => tag.value().to_string(),
            None => return Err(Error::Invalid("from tag")),
        };
        let to_tag = match resp.to_header()?.tag()? {
            Some(tag) => tag.value().to_string(),
            None => return Err(Error::Invalid("to tag")),
        };
        Ok(DialogId {
            call_id,
            from_tag,
            to_tag,
        })
    }
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.from_tag > self.to_tag {
            write!(f, "{}-{}-{}", self.call_id, self.from_tag, self.to_tag)
        } else {
            write!(f, "{}-{}-{}", self.call_id, self.to_tag, self.from_tag)
        }
    }
}

/// Sub-state of the INVITE usage inside a dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteStatus {
    Init,
    Proceeding,
    Accepted,
    Confirmed,
    Terminated,
}

impl std::fmt::Display for InviteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InviteStatus::Init => "init",
            InviteStatus::Proceeding => "proceeding",
            InviteStatus::Accepted => "accepted",
            InviteStatus::Confirmed => "confirmed",
            InviteStatus::Terminated => "terminated",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Terminated,
}

/// One event subscription inside a dialog (RFC 6665).
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Event package plus its `id` parameter, the in-dialog key.
    pub event: String,
    pub status: SubscriptionStatus,
    pub expire_timer: Option<u64>,
}
