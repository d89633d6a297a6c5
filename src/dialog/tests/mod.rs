use super::{DialogId, InviteStatus, SubscriptionStatus};
use rsip::headers::*;

fn invite_request(from_tag: &str, to_tag: &str, call_id: &str) -> rsip::Request {
    let to = if to_tag.is_empty() {
        "Bob <sip:bob@example.com>".to_string()
    } else {
        format!("Bob <sip:bob@example.com>;tag={}", to_tag)
    };
    rsip::Request {
        method: rsip::Method::Invite,
        uri: rsip::Uri::try_from("sip:bob@example.com:5060").unwrap(),
        headers: vec![
            Via::new("SIP/2.0/UDP alice.example.com:5060;branch=z9hG4bKdlg1").into(),
            CSeq::new("1 INVITE").into(),
            From::new(&format!("Alice <sip:alice@example.com>;tag={}", from_tag)).into(),
            To::new(&to).into(),
            CallId::new(call_id).into(),
            Contact::new("<sip:alice@alice.example.com:5060>").into(),
            MaxForwards::new("70").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: vec![],
    }
}

fn response(status: rsip::StatusCode, from_tag: &str, to_tag: &str, call_id: &str) -> rsip::Response {
    rsip::Response {
        status_code: status,
        version: rsip::Version::V2,
        headers: vec![
            Via::new("SIP/2.0/UDP alice.example.com:5060;branch=z9hG4bKdlg1").into(),
            CSeq::new("1 INVITE").into(),
            From::new(&format!("Alice <sip:alice@example.com>;tag={}", from_tag)).into(),
            To::new(&format!("Bob <sip:bob@example.com>;tag={}", to_tag)).into(),
            CallId::new(call_id).into(),
            Contact::new("<sip:bob@bob.example.com:5060>").into(),
            RecordRoute::new("<sip:p1.example.com;lr>").into(),
            RecordRoute::new("<sip:p2.example.com;lr>").into(),
        ]
        .into(),
        body: vec![],
    }
}

#[test]
fn test_dialog_id_is_symmetric() {
    let id_1 = DialogId {
        call_id: "dlg-1".to_string(),
        from_tag: "aaa".to_string(),
        to_tag: "zzz".to_string(),
    };
    let id_2 = DialogId {
        call_id: "dlg-1".to_string(),
        from_tag: "zzz".to_string(),
        to_tag: "aaa".to_string(),
    };
    assert_eq!(id_1, id_2);
    assert_eq!(id_1.to_string(), id_2.to_string());

    let mut hashes = std::collections::HashSet::new();
    hashes.insert(id_1.clone());
    assert!(hashes.contains(&id_2));

    let other_call = DialogId {
        call_id: "dlg-2".to_string(),
        ..id_1
    };
    assert_ne!(other_call, id_2);
}

#[test]
fn test_dialog_id_from_messages() {
    let request = invite_request("ftag", "", "dlg-call-1");
    let id = DialogId::try_from(&request).unwrap();
    assert_eq!(id.from_tag, "ftag");
    assert_eq!(id.to_tag, "");

    let resp = response(rsip::StatusCode::OK, "ftag", "ttag", "dlg-call-1");
    let id_resp = DialogId::try_from(&resp).unwrap();
    assert_eq!(id_resp.from_tag, "ftag");
    assert_eq!(id_resp.to_tag, "ttag");

    // the early id (empty to-tag) does not equal the established one
    assert_ne!(id, id_resp);
}

#[test]
fn test_dialog_id_requires_from_tag() {
    let mut request = invite_request("ftag", "", "dlg-call-2");
    request
        .headers
        .retain(|h| !matches!(h, rsip::Header::From(_)));
    request
        .headers
        .push(From::new("Alice <sip:alice@example.com>").into());
    assert!(DialogId::try_from(&request).is_err());
}

#[test]
fn test_invite_status_display() {
    assert_eq!(InviteStatus::Init.to_string(), "init");
    assert_eq!(InviteStatus::Proceeding.to_string(), "proceeding");
    assert_eq!(InviteStatus::Accepted.to_string(), "accepted");
    assert_eq!(InviteStatus::Confirmed.to_string(), "confirmed");
    assert_eq!(InviteStatus::Terminated.to_string(), "terminated");
}

#[test]
fn test_subscription_status() {
    assert_ne!(SubscriptionStatus::Pending, SubscriptionStatus::Active);
    assert_ne!(SubscriptionStatus::Active, SubscriptionStatus::Terminated);
}
