//! Dialog records and the call-level dialog manager (RFC 3261 §12).

use super::{DialogId, InviteStatus, Subscription, SubscriptionStatus};
use crate::call::{Call, CallTimer, TimerTag};
use crate::rsip_ext::{header_contains_token, header_values};
use crate::service::SipReply;
use crate::transaction::{make_via_branch, RequestOpts, TransactionUser};
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, Method, Param, Request, Response, StatusCode};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One dialog, owned (like everything else) by the call actor.
pub struct Dialog {
    pub num: u32,
    pub id: DialogId,
    pub local_uri: rsip::Uri,
    pub remote_uri: rsip::Uri,
    pub local_tag: String,
    pub remote_tag: String,
    pub remote_target: Option<rsip::Uri>,
    /// Stored verbatim; replayed as Route headers on in-dialog
    /// requests.
    pub route_set: Vec<rsip::headers::Route>,
    pub local_seq: u32,
    pub remote_seq: u32,
    pub invite_status: InviteStatus,
    /// CSeq of the current INVITE usage; ACK replays it.
    pub invite_seq: u32,
    pub last_ack: Option<Request>,
    pub refresh_timer: Option<u64>,
    pub session_expires: Option<Duration>,
    pub peer_supports_update: bool,
    pub subscriptions: Vec<Subscription>,
    /// Sources already authorized for this dialog.
    pub authorized: Vec<crate::transport::SipAddr>,
    pub secure: bool,
    pub touched: Instant,
}

impl Dialog {
    fn next_local_seq(&mut self) -> u32 {
        self.local_seq += 1;
        self.local_seq
    }

    pub fn is_terminated(&self) -> bool {
        self.invite_status == InviteStatus::Terminated
    }

    pub fn touch(&mut self) {
        self.touched = Instant::now();
    }
}

fn capture_route_set(headers: &rsip::Headers, reverse: bool) -> Vec<rsip::headers::Route> {
    let mut route_set = Vec::new();
    for header in headers.iter() {
        if let Header::RecordRoute(rr) = header {
            route_set.push(rsip::headers::Route::from(rr.value().to_string()));
        }
    }
    if reverse {
        route_set.reverse();
    }
    route_set
}

fn contact_uri(headers: &rsip::Headers) -> Option<rsip::Uri> {
    headers.iter().find_map(|header| match header {
        Header::Contact(contact) => contact.typed().ok().map(|typed| typed.uri),
        _ => None,
    })
}

fn session_expires_of(headers: &rsip::Headers) -> Option<Duration> {
    header_values(headers, "session-expires")
        .into_iter()
        .next()
        .and_then(|value| {
            value
                .split(';')
                .next()
                .and_then(|secs| secs.trim().parse::<u64>().ok())
        })
        .map(Duration::from_secs)
}

impl Call {
    pub(crate) fn dialog_find(&self, id: &DialogId) -> Option<usize> {
        self.dialogs.iter().position(|dialog| &dialog.id == id)
    }

    fn dialog_new(
        &mut self,
        role: crate::transaction::TransactionRole,
        request: &Request,
        response: &Response,
    ) -> Result<usize> {
        use crate::transaction::TransactionRole;

        let id = DialogId::try_from(response)?;
        let from = request.from_header()?.typed()?;
        let to = response.to_header()?.typed()?;
        let cseq = request.cseq_header()?.seq()?;

        let (local_uri, remote_uri, local_tag, remote_tag, remote_target, route_set) = match role {
            TransactionRole::Uac => (
                from.uri.clone(),
                to.uri.clone(),
                id.from_tag.clone(),
                id.to_tag.clone(),
                contact_uri(&response.headers),
                capture_route_set(&response.headers, false),
            ),
            TransactionRole::Uas => (
                to.uri.clone(),
                from.uri.clone(),
                id.to_tag.clone(),
                id.from_tag.clone(),
                contact_uri(&request.headers),
                capture_route_set(&response.headers, true),
            ),
        };

        let peer_headers = match role {
            TransactionRole::Uac => &response.headers,
            TransactionRole::Uas => &request.headers,
        };
        let num = self.next_id();
        let dialog = Dialog {
            num,
            id: id.clone(),
            secure: request
                .uri
                .scheme
                .as_ref()
                .map(|scheme| matches!(scheme, rsip::Scheme::Sips))
                .unwrap_or(false),
            local_uri,
            remote_uri,
            local_tag,
            remote_tag,
            remote_target,
            route_set,
            local_seq: cseq,
            remote_seq: match role {
                TransactionRole::Uac => 0,
                TransactionRole::Uas => cseq,
            },
            invite_status: InviteStatus::Init,
            invite_seq: cseq,
            last_ack: None,
            refresh_timer: None,
            session_expires: session_expires_of(&request.headers)
                .or_else(|| session_expires_of(&response.headers)),
            peer_supports_update: header_contains_token(peer_headers, "Supported", "update")
                || header_contains_token(peer_headers, "Allow", "UPDATE"),
            subscriptions: Vec::new(),
            authorized: Vec::new(),
            touched: Instant::now(),
        };
        info!(call_id = %self.call_id, dialog = %id, "dialog created");
        self.dialogs.push(dialog);
        Ok(self.dialogs.len() - 1)
    }

    /// UAC side: responses to dialog-forming requests create and
    /// advance dialogs; 481 on any in-dialog request kills one.
    pub(crate) async fn dialog_on_uac_response(&mut self, tx_idx: usize, resp: &Response) {
        let (request, from) = {
            let tx = &self.transactions[tx_idx];
            (tx.request.clone(), tx.from.clone())
        };
        if !matches!(from, TransactionUser::Caller(_)) {
            return;
        }
        let code = u16::from(resp.status_code.clone());
        let method = request.method.clone();

        // 481 terminates the dialog of any in-dialog request
        if code == 481 {
            if let Ok(id) = DialogId::try_from(&request) {
                if !id.to_tag.is_empty() {
                    self.dialog_destroy(&id);
                }
            }
            return;
        }

        let dialog_forming = matches!(
            method,
            Method::Invite | Method::Subscribe | Method::Refer | Method::Notify
        );

        if method == Method::Bye && (200..300).contains(&code) {
            if let Ok(id) = DialogId::try_from(&request) {
                self.dialog_destroy(&id);
            }
            return;
        }
        if !dialog_forming {
            return;
        }

        let id = match DialogId::try_from(resp) {
            Ok(id) => id,
            // no to-tag yet, nothing dialog-level to do
            Err(_) => return,
        };

        let idx = match self.dialog_find(&id) {
            Some(idx) => idx,
            None => {
                if !(101..300).contains(&code) {
                    return;
                }
                match self.dialog_new(crate::transaction::TransactionRole::Uac, &request, resp) {
                    Ok(idx) => idx,
                    Err(e) => {
                        debug!(call_id = %self.call_id, "dialog create failed: {}", e);
                        return;
                    }
                }
            }
        };

        {
            let dialog = &mut self.dialogs[idx];
            dialog.touch();
            match code {
                101..=199 => {
                    if dialog.invite_status == InviteStatus::Init {
                        dialog.invite_status = InviteStatus::Proceeding;
                    }
                }
                200..=299 => {
                    if method == Method::Invite {
                        dialog.invite_status = InviteStatus::Accepted;
                        dialog.invite_seq = request
                            .cseq_header()
                            .ok()
                            .and_then(|cseq| cseq.seq().ok())
                            .unwrap_or(dialog.invite_seq);
                    }
                    // target refresh
                    if let Some(target) = contact_uri(&resp.headers) {
                        dialog.remote_target = Some(target);
                    }
                    if dialog.route_set.is_empty() {
                        dialog.route_set = capture_route_set(&resp.headers, false);
                    }
                }
                _ => {}
            }
        }

        if method == Method::Invite && (200..300).contains(&code) {
            self.dialog_send_ack(idx, resp).await;
            self.dialogs[idx].invite_status = InviteStatus::Confirmed;
            self.dialog_arm_refresh(idx);
        }
        if method == Method::Subscribe && (200..300).contains(&code) {
            let expires = resp
                .expires_header()
                .and_then(|header| header.seconds().ok())
                .unwrap_or(3600);
            self.subscription_upsert(idx, &request, expires).await;
        }
    }

    /// UAS side: our own 1xx-with-tag/2xx answers create dialogs.
    pub(crate) async fn dialog_on_uas_response(&mut self, tx_idx: usize, resp: &Response) {
        let request = self.transactions[tx_idx].request.clone();
        let source = self.transactions[tx_idx].source.clone();
        let code = u16::from(resp.status_code.clone());
        if !(101..300).contains(&code) {
            return;
        }
        let id = match DialogId::try_from(resp) {
            Ok(id) => id,
            Err(_) => return,
        };
        let idx = match self.dialog_find(&id) {
            Some(idx) => idx,
            None => match self.dialog_new(crate::transaction::TransactionRole::Uas, &request, resp)
            {
                Ok(idx) => idx,
                Err(e) => {
                    debug!(call_id = %self.call_id, "dialog create failed: {}", e);
                    return;
                }
            },
        };

        let remote_tag = {
            let dialog = &mut self.dialogs[idx];
            dialog.touch();
            match code {
                101..=199 => {
                    if dialog.invite_status == InviteStatus::Init {
                        dialog.invite_status = InviteStatus::Proceeding;
                    }
                }
                _ => {
                    if request.method == Method::Invite {
                        dialog.invite_status = InviteStatus::Accepted;
                    }
                }
            }
            dialog.remote_tag.clone()
        };
        // remember where the peer talks from, for reversed routing
        if let Some(source) = source {
            self.dests.insert(remote_tag, source);
        }

        if request.method == Method::Subscribe && (200..300).contains(&code) {
            let expires = request
                .expires_header()
                .and_then(|header| header.seconds().ok())
                .unwrap_or(3600);
            self.subscription_upsert(idx, &request, expires).await;
        }
    }

    /// ACK to a 2xx confirms the dialog and ends the answer
    /// retransmissions of the accepted INVITE transaction.
    pub(crate) async fn dialog_uas_ack(&mut self, request: &Request) {
        let id = match DialogId::try_from(request) {
            Ok(id) => id,
            Err(_) => return,
        };
        let idx = match self.dialog_find(&id) {
            Some(idx) => idx,
            None => return,
        };
        let local_tag = {
            let dialog = &mut self.dialogs[idx];
            dialog.touch();
            if dialog.invite_status == InviteStatus::Accepted {
                dialog.invite_status = InviteStatus::Confirmed;
            }
            dialog.local_tag.clone()
        };
        let endpoint = self.endpoint.clone();
        for tx in self.transactions.iter_mut() {
            if tx.role == crate::transaction::TransactionRole::Uas
                && tx.is_invite()
                && tx.status == crate::transaction::TransactionStatus::InviteAccepted
                && tx.local_tag.as_deref() == Some(local_tag.as_str())
            {
                if let Some(slot) = tx.retrans_timer.take() {
                    endpoint.timers.cancel(slot);
                }
            }
        }
        self.dialog_arm_refresh(idx);
    }

    /// In-dialog UAS request: strict CSeq, target refresh, method
    /// effects. Replies through the transaction at `tx_idx`.
    pub(crate) async fn dialog_uas_request(&mut self, tx_idx: usize) -> Result<()> {
        let (request, source) = {
            let tx = &self.transactions[tx_idx];
            (tx.request.clone(), tx.source.clone())
        };
        let id = DialogId::try_from(&request)?;
        let idx = match self.dialog_find(&id) {
            Some(idx) => idx,
            None => {
                info!(call_id = %self.call_id, dialog = %id, "no dialog for in-dialog request");
                return self
                    .uas_reply(
                        tx_idx,
                        SipReply::new(StatusCode::CallTransactionDoesNotExist)
                            .with_reason("Unknown Dialog"),
                    )
                    .await;
            }
        };

        let cseq = request.cseq_header()?.seq()?;
        {
            let dialog = &mut self.dialogs[idx];
            if request.method != Method::Ack
                && dialog.remote_seq != 0
                && cseq <= dialog.remote_seq
            {
                warn!(call_id = %self.call_id, dialog = %dialog.id, cseq, "stale CSeq");
                return self
                    .uas_reply(
                        tx_idx,
                        SipReply::new(StatusCode::ServerInternalError)
                            .with_reason("Invalid CSeq"),
                    )
                    .await;
            }
            dialog.remote_seq = cseq;
            dialog.touch();
            if let Some(source) = source {
                let remote_tag = dialog.remote_tag.clone();
                self.dests.insert(remote_tag, source);
            }
        }

        // the application gets the first say
        match self.endpoint.service.sip_process(&request) {
            crate::service::ProcessReply::Reply(reply) => {
                return self.uas_reply(tx_idx, reply).await;
            }
            crate::service::ProcessReply::NoReply => {}
        }

        match request.method {
            Method::Bye => {
                // the 200 exchange terminates the dialog; uas_reply
                // runs the teardown
                self.uas_reply(tx_idx, SipReply::new(StatusCode::OK)).await
            }
            Method::Invite | Method::Update => {
                // target refresh
                if let Some(target) = contact_uri(&request.headers) {
                    self.dialogs[idx].remote_target = Some(target);
                }
                if request.method == Method::Invite {
                    self.dialogs[idx].invite_seq = cseq;
                }
                self.uas_reply(tx_idx, SipReply::new(StatusCode::OK)).await
            }
            Method::Notify => {
                self.subscription_notify(idx, &request).await;
                self.uas_reply(tx_idx, SipReply::new(StatusCode::OK)).await
            }
            Method::Subscribe => {
                let expires = request
                    .expires_header()
                    .and_then(|header| header.seconds().ok())
                    .unwrap_or(3600);
                self.subscription_upsert(idx, &request, expires).await;
                self.uas_reply(
                    tx_idx,
                    SipReply::new(StatusCode::OK)
                        .with_header(Header::Expires(expires.into())),
                )
                .await
            }
            _ => self.uas_reply(tx_idx, SipReply::new(StatusCode::OK)).await,
        }
    }

    /// Build an in-dialog request: RURI from the remote target, Route
    /// from the stored route set, CSeq from the dialog counter.
    pub(crate) fn dialog_make_request(
        &mut self,
        id: &DialogId,
        method: Method,
        _opts: &RequestOpts,
    ) -> Result<Request> {
        let local = self.local_via_addr();
        let idx = self
            .dialog_find(id)
            .ok_or_else(|| Error::DialogError("dialog not found".to_string(), id.clone()))?;
        let dialog = &mut self.dialogs[idx];
        if dialog.is_terminated() {
            return Err(Error::DialogError(
                "dialog terminated".to_string(),
                id.clone(),
            ));
        }
        dialog.touch();
        let seq = if method == Method::Ack {
            dialog.invite_seq
        } else {
            dialog.next_local_seq()
        };

        let uri = dialog
            .remote_target
            .clone()
            .unwrap_or_else(|| dialog.remote_uri.clone());

        let mut headers = rsip::Headers::default();
        let transport = local
            .r#type
            .map(|t| t.to_string().to_uppercase())
            .unwrap_or_else(|| "UDP".to_string());
        let branch = match make_via_branch() {
            Param::Branch(branch) => branch.to_string(),
            _ => String::new(),
        };
        headers.push(Header::Via(
            format!("SIP/2.0/{} {};branch={}", transport, local.addr, branch).into(),
        ));
        headers.push(Header::From(
            format!("<{}>;tag={}", dialog.local_uri, dialog.local_tag).into(),
        ));
        let to = if dialog.remote_tag.is_empty() {
            format!("<{}>", dialog.remote_uri)
        } else {
            format!("<{}>;tag={}", dialog.remote_uri, dialog.remote_tag)
        };
        headers.push(Header::To(to.into()));
        headers.push(Header::CallId(dialog.id.call_id.clone().into()));
        headers.push(Header::CSeq(
            rsip::typed::CSeq {
                seq,
                method: method.clone(),
            }
            .into(),
        ));
        for route in dialog.route_set.iter() {
            headers.push(Header::Route(route.clone()));
        }
        headers.push(Header::MaxForwards(70.into()));
        headers.push(Header::ContentLength(0.into()));

        Ok(Request {
            method,
            uri,
            headers,
            version: rsip::Version::V2,
            body: vec![],
        })
    }

    /// ACK for a 2xx answer travels the dialog route set.
    pub(crate) async fn dialog_send_ack(&mut self, idx: usize, resp: &Response) {
        let id = self.dialogs[idx].id.clone();
        let ack = match self.dialog_make_request(&id, Method::Ack, &RequestOpts::default()) {
            Ok(mut ack) => {
                // To mirrors the answer, it carries the remote tag
                if let Ok(to) = resp.to_header() {
                    ack.headers.retain(|h| !matches!(h, Header::To(_)));
                    ack.headers.push(Header::To(to.clone()));
                }
                ack
            }
            Err(e) => {
                debug!(call_id = %self.call_id, "ack build failed: {}", e);
                return;
            }
        };
        self.dialogs[idx].last_ack = Some(ack.clone());
        let dest = self.request_destination(&ack).ok();
        if let Err(e) = self.transport_send(None, dest.as_ref(), ack.into()).await {
            debug!(call_id = %self.call_id, "ack send failed: {}", e);
        }
    }

    /// BYE answered 200 on the UAS side closes the dialog.
    pub(crate) async fn dialog_on_bye(&mut self, request: &Request) {
        if let Ok(id) = DialogId::try_from(request) {
            self.dialog_destroy(&id);
        }
    }

    pub(crate) async fn dialog_stop(&mut self, id: &DialogId) {
        self.dialog_destroy(id);
    }

    pub(crate) fn dialog_destroy(&mut self, id: &DialogId) {
        let endpoint = self.endpoint.clone();
        if let Some(idx) = self.dialog_find(id) {
            let mut dialog = self.dialogs.remove(idx);
            if let Some(slot) = dialog.refresh_timer.take() {
                endpoint.timers.cancel(slot);
            }
            for sub in dialog.subscriptions.iter_mut() {
                if let Some(slot) = sub.expire_timer.take() {
                    endpoint.timers.cancel(slot);
                }
            }
            self.dests.remove(&dialog.remote_tag);
            info!(call_id = %self.call_id, dialog = %id, "dialog removed");
        }
    }

    fn dialog_arm_refresh(&mut self, idx: usize) {
        let (num, interval, armed) = {
            let dialog = &self.dialogs[idx];
            (
                dialog.num,
                dialog.session_expires,
                dialog.refresh_timer.is_some(),
            )
        };
        if armed {
            return;
        }
        if let Some(interval) = interval {
            let timer = self.start_timer(TimerTag::DialogRefresh, num, interval / 2);
            self.dialogs[idx].refresh_timer = Some(timer);
        }
    }

    /// Refresh and subscription expiry timers.
    pub(crate) async fn dialog_timer(&mut self, timer: CallTimer) -> Result<()> {
        match timer.tag {
            TimerTag::DialogRefresh => {
                let idx = match self
                    .dialogs
                    .iter()
                    .position(|dialog| dialog.num == timer.subject)
                {
                    Some(idx) => idx,
                    None => return Ok(()),
                };
                if self.dialogs[idx].refresh_timer != Some(timer.task_id) {
                    return Ok(());
                }
                self.dialogs[idx].refresh_timer = None;
                if self.dialogs[idx].invite_status != InviteStatus::Confirmed {
                    return Ok(());
                }
                // refresh by UPDATE when the peer supports it, else
                // by re-INVITE
                let method = if self.dialogs[idx].peer_supports_update {
                    Method::Update
                } else {
                    Method::Invite
                };
                let id = self.dialogs[idx].id.clone();
                info!(call_id = %self.call_id, dialog = %id, %method, "session refresh");
                let request = self.dialog_make_request(&id, method, &RequestOpts::default())?;
                let key = crate::transaction::key::TransactionKey::from_request(
                    &request,
                    crate::transaction::TransactionRole::Uac,
                )?;
                let tx_id = self.next_id();
                let tx = crate::transaction::Transaction::new(
                    tx_id,
                    crate::transaction::TransactionRole::Uac,
                    key,
                    request,
                    RequestOpts::default(),
                    TransactionUser::None,
                );
                let tx_idx = self.insert_transaction(tx);
                self.uac_send(tx_idx).await;
                self.dialog_arm_refresh(idx);
                Ok(())
            }
            TimerTag::SubExpire => {
                let idx = match self
                    .dialogs
                    .iter()
                    .position(|dialog| dialog.num == timer.subject)
                {
                    Some(idx) => idx,
                    None => return Ok(()),
                };
                let dialog = &mut self.dialogs[idx];
                dialog.subscriptions.retain_mut(|sub| {
                    if sub.expire_timer == Some(timer.task_id) {
                        info!(event = %sub.event, "subscription expired");
                        false
                    } else {
                        true
                    }
                });
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn subscription_upsert(&mut self, idx: usize, request: &Request, expires: u32) {
        let event = header_values(&request.headers, "event")
            .into_iter()
            .next()
            .unwrap_or_else(|| "dialog".to_string());
        let num = self.dialogs[idx].num;
        let timer = self.start_timer(
            TimerTag::SubExpire,
            num,
            Duration::from_secs(expires as u64),
        );
        let endpoint = self.endpoint.clone();
        let dialog = &mut self.dialogs[idx];
        match dialog
            .subscriptions
            .iter_mut()
            .find(|sub| sub.event == event)
        {
            Some(sub) => {
                if let Some(slot) = sub.expire_timer.take() {
                    endpoint.timers.cancel(slot);
                }
                sub.expire_timer = Some(timer);
            }
            None => {
                dialog.subscriptions.push(Subscription {
                    event,
                    status: SubscriptionStatus::Pending,
                    expire_timer: Some(timer),
                });
            }
        }
    }

    /// NOTIFY drives the subscription sub-state via its
    /// Subscription-State header.
    async fn subscription_notify(&mut self, idx: usize, request: &Request) {
        let state = header_values(&request.headers, "subscription-state")
            .into_iter()
            .next()
            .unwrap_or_default();
        let state = state
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_lowercase();
        let event = header_values(&request.headers, "event")
            .into_iter()
            .next()
            .unwrap_or_else(|| "dialog".to_string());
        let endpoint = self.endpoint.clone();
        let dialog = &mut self.dialogs[idx];
        match state.as_str() {
            "active" => {
                if let Some(sub) = dialog
                    .subscriptions
                    .iter_mut()
                    .find(|sub| sub.event == event)
                {
                    sub.status = SubscriptionStatus::Active;
                }
            }
            "terminated" => {
                dialog.subscriptions.retain_mut(|sub| {
                    if sub.event == event {
                        if let Some(slot) = sub.expire_timer.take() {
                            endpoint.timers.cancel(slot);
                        }
                        false
                    } else {
                        true
                    }
                });
            }
            _ => {}
        }
    }
}
