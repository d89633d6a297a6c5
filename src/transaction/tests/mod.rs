use super::{
    key::TransactionKey, make_cancel, make_non_2xx_ack, make_response, RequestOpts, Transaction,
    TransactionRole, TransactionStatus, TransactionUser,
};
use crate::rsip_ext::reason_text;
use rsip::headers::*;
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Method, StatusCode};

fn invite() -> rsip::Request {
    rsip::Request {
        method: Method::Invite,
        uri: rsip::Uri::try_from("sip:bob@example.com:5060").unwrap(),
        headers: vec![
            Via::new("SIP/2.0/UDP alice.example.com:5060;branch=z9hG4bKtx1").into(),
            CSeq::new("314159 INVITE").into(),
            From::new("Alice <sip:alice@example.com>;tag=9fxced76sl").into(),
            To::new("Bob <sip:bob@example.com>").into(),
            CallId::new("3848276298220188511@atlanta.example.com").into(),
            Contact::new("<sip:alice@alice.example.com>").into(),
            MaxForwards::new("70").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: vec![],
    }
}

#[test]
fn test_status_never_moves_backward() {
    let request = invite();
    let key = TransactionKey::from_request(&request, TransactionRole::Uac).unwrap();
    let mut tx = Transaction::new(
        1,
        TransactionRole::Uac,
        key,
        request,
        RequestOpts::default(),
        TransactionUser::None,
    );
    assert_eq!(tx.status, TransactionStatus::InviteCalling);

    assert!(tx.set_status(TransactionStatus::InviteProceeding));
    assert!(!tx.set_status(TransactionStatus::InviteCalling));
    assert_eq!(tx.status, TransactionStatus::InviteProceeding);

    assert!(tx.set_status(TransactionStatus::InviteAccepted));
    assert!(tx.set_status(TransactionStatus::Finished));
    // terminal: nothing moves it anymore
    assert!(!tx.set_status(TransactionStatus::InviteConfirmed));
    assert_eq!(tx.status, TransactionStatus::Finished);
}

#[test]
fn test_make_response_tags_and_reason() {
    let request = invite();

    let trying = make_response(&request, StatusCode::Trying, Some("ignored"), None);
    assert!(trying.to_header().unwrap().tag().unwrap().is_none());

    let busy = make_response(&request, StatusCode::BusyHere, Some("totag1"), None);
    let tag = busy.to_header().unwrap().tag().unwrap();
    assert_eq!(tag.map(|t| t.to_string()), Some("totag1".to_string()));

    let timeout = make_response(
        &request,
        StatusCode::RequestTimeout,
        None,
        Some("Timer B Timeout"),
    );
    assert_eq!(
        reason_text(&timeout.headers).as_deref(),
        Some("Timer B Timeout")
    );
}

#[test]
fn test_cancel_keeps_branch_and_cseq_number() {
    let request = invite();
    let cancel = make_cancel(&request, Some("Call completed elsewhere")).unwrap();
    assert_eq!(cancel.method, Method::Cancel);

    let original_branch = request
        .via_header()
        .unwrap()
        .typed()
        .unwrap()
        .branch()
        .unwrap()
        .to_string();
    let cancel_branch = cancel
        .via_header()
        .unwrap()
        .typed()
        .unwrap()
        .branch()
        .unwrap()
        .to_string();
    assert_eq!(original_branch, cancel_branch);

    let cseq = cancel.cseq_header().unwrap();
    assert_eq!(cseq.seq().unwrap(), 314159);
    assert_eq!(cseq.method().unwrap(), Method::Cancel);
    assert_eq!(
        reason_text(&cancel.headers).as_deref(),
        Some("Call completed elsewhere")
    );
}

#[test]
fn test_non_2xx_ack_mirrors_response_to() {
    let request = invite();
    let response = make_response(&request, StatusCode::BusyHere, Some("uastag"), None);
    let ack = make_non_2xx_ack(&request, &response).unwrap();

    assert_eq!(ack.method, Method::Ack);
    assert_eq!(ack.uri, request.uri);
    let tag = ack.to_header().unwrap().tag().unwrap();
    assert_eq!(tag.map(|t| t.to_string()), Some("uastag".to_string()));
    let cseq = ack.cseq_header().unwrap();
    assert_eq!(cseq.seq().unwrap(), 314159);
    assert_eq!(cseq.method().unwrap(), Method::Ack);

    // same branch: the ACK belongs to the INVITE transaction
    let invite_key = TransactionKey::from_request(&request, TransactionRole::Uac).unwrap();
    let ack_key = TransactionKey::from_request(&ack, TransactionRole::Uac).unwrap();
    assert_eq!(invite_key, ack_key);
}

#[test]
fn test_ack_folds_to_invite_transaction() {
    let request = invite();
    let tx = Transaction::new(
        7,
        TransactionRole::Uas,
        TransactionKey::from_request(&request, TransactionRole::Uas).unwrap(),
        request,
        RequestOpts::default(),
        TransactionUser::None,
    );
    // UAS INVITE starts proceeding (100 may go out immediately)
    assert_eq!(tx.status, TransactionStatus::InviteProceeding);
    assert!(tx.is_invite());
}
