//! UAC transaction state machines, RFC 3261 §17.1.
//!
//! All functions run inside the owning call actor; there is no
//! locking because the actor is the single writer.

use super::{
    key::TransactionKey, make_cancel, make_non_2xx_ack, make_response, make_via_branch,
    CancelStatus, RequestOpts, Transaction, TransactionRole, TransactionStatus, TransactionUser,
    UacEvent,
};
use crate::call::{Call, CallTimer, TimerTag};
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Header, Method, Param, Request, Response, StatusCode};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

impl Call {
    /// Complete a caller-built request before it becomes a
    /// transaction: Via with a fresh branch when missing, Contact and
    /// option headers per opts, outbound decoration.
    pub(crate) fn prepare_uac_request(
        &mut self,
        request: &mut Request,
        opts: &RequestOpts,
    ) -> Result<()> {
        if request.via_header().is_err() {
            let local = self.local_via_addr();
            let via = format!(
                "SIP/2.0/{} {};branch=z9hG4bK{}",
                local
                    .r#type
                    .map(|t| t.to_string().to_uppercase())
                    .unwrap_or_else(|| "UDP".to_string()),
                local.addr,
                super::random_text(super::BRANCH_LEN),
            );
            crate::rsip_ext::RsipHeadersExt::push_front(
                &mut request.headers,
                Header::Via(via.into()),
            );
        }

        for token in opts.supported.iter() {
            request
                .headers
                .push(Header::Other("Supported".into(), token.clone()));
        }
        if let Some(expires) = opts.expires {
            if request.expires_header().is_none() {
                request.headers.push(Header::Expires(expires.into()));
            }
        }
        if opts.contact && request.contact_header().is_err() {
            let contact = crate::outbound::make_contact(
                &self.endpoint.config,
                &self.local_via_addr(),
                request.method == Method::Invite
                    || request.method == Method::Subscribe
                    || request.method == Method::Refer,
                request.method == Method::Register,
                crate::rsip_ext::header_contains_token(&request.headers, "Supported", "outbound"),
                opts.reg_id,
            );
            request.headers.push(Header::Contact(contact.into()));
        }
        for header in opts.headers.iter() {
            request.headers.push(header.clone());
        }
        if let Some(body) = opts.body.as_ref() {
            request.body = body.clone();
            request
                .headers
                .retain(|h| !matches!(h, Header::ContentLength(_)));
            request
                .headers
                .push(Header::ContentLength((body.len() as u32).into()));
        }
        Ok(())
    }

    pub(crate) fn local_via_addr(&self) -> crate::transport::SipAddr {
        self.endpoint
            .pool
            .any()
            .and_then(|handle| self.endpoint.pool.get(handle))
            .map(|conn| conn.get_addr().clone())
            .unwrap_or_default()
    }

    /// Send (or give up on) the UAC transaction at `idx` and arm its
    /// timers. Errors are folded into synthetic final responses so
    /// the caller always sees an answer.
    pub(crate) async fn uac_send(&mut self, idx: usize) {
        let (id, request, route_flow, destination) = {
            let tx = &self.transactions[idx];
            (
                tx.id,
                tx.request.clone(),
                tx.route_flow,
                tx.destination.clone(),
            )
        };
        let dest = match destination {
            Some(dest) => Some(dest),
            None => self.request_destination(&request).ok(),
        };

        match self
            .transport_send(route_flow, dest.as_ref(), request.clone().into())
            .await
        {
            Ok((handle, reliable)) => {
                let is_fork = {
                    let tx = &mut self.transactions[idx];
                    tx.connection = Some(handle);
                    tx.reliable = reliable;
                    tx.destination = dest;
                    tx.touch();
                    matches!(tx.from, TransactionUser::Fork(_))
                };
                self.uac_start_timers(idx, is_fork);
                if self.transactions[idx].stateless {
                    // matched later by branch only, never stored
                    self.remove_transaction(id);
                }
                trace!(call_id = %self.call_id, id, "request sent");
            }
            Err(e) => {
                warn!(call_id = %self.call_id, id, "send failed: {}", e);
                let (status, reason) = match e {
                    Error::FlowFailed => (crate::rsip_ext::status_code_by_number(430), "Flow Failed"),
                    _ => (StatusCode::ServiceUnavailable, "Transport Failure"),
                };
                let resp = make_response(&request, status, None, Some(reason));
                self.uac_finish_with(idx, resp).await;
            }
        }
    }

    fn uac_start_timers(&mut self, idx: usize, is_fork: bool) {
        let t1 = self.endpoint.config.sip_timer_t1;
        let timer_b = self.endpoint.config.timer_b();
        let timer_c = self.transactions[idx]
            .opts
            .timer_c
            .unwrap_or(self.endpoint.config.sip_timer_c);
        let no_auto_expire = self.transactions[idx].opts.no_auto_expire;
        let expires = {
            let tx = &self.transactions[idx];
            tx.opts.expires.or_else(|| {
                tx.request
                    .expires_header()
                    .and_then(|h| h.seconds().ok())
            })
        };

        let (tx_id, invite, reliable) = {
            let tx = &self.transactions[idx];
            (tx.id, tx.is_invite(), tx.reliable)
        };

        if invite {
            if !reliable {
                let timer_a = self.start_timer(TimerTag::TimerA, tx_id, t1);
                self.transactions[idx].retrans_timer = Some(timer_a);
                self.transactions[idx].next_retrans = t1;
            }
            // proxy branches run Timer C instead of B so the C-vs-B
            // race is settled at arm time
            let timeout = if is_fork {
                self.start_timer(TimerTag::TimerC, tx_id, timer_c)
            } else {
                self.start_timer(TimerTag::TimerB, tx_id, timer_b)
            };
            self.transactions[idx].timeout_timer = Some(timeout);
            if let Some(secs) = expires {
                if !no_auto_expire {
                    let expire = self.start_timer(
                        TimerTag::Expire,
                        tx_id,
                        Duration::from_secs(secs as u64),
                    );
                    self.transactions[idx].expire_timer = Some(expire);
                }
            }
        } else {
            if !reliable {
                let timer_e = self.start_timer(TimerTag::TimerE, tx_id, t1);
                self.transactions[idx].retrans_timer = Some(timer_e);
                self.transactions[idx].next_retrans = t1;
            }
            let timer_f = self.start_timer(TimerTag::TimerF, tx_id, timer_b);
            self.transactions[idx].timeout_timer = Some(timer_f);
        }
    }

    /// Entry point for every inbound response.
    pub(crate) async fn uac_response(&mut self, resp: Response) -> Result<()> {
        let key = TransactionKey::from_response(&resp, TransactionRole::Uac)?;
        match self.find_by_key(&key) {
            Some(idx) => {
                self.uac_process_response(idx, resp).await;
                Ok(())
            }
            None => {
                // stateless work: ours is the top Via, the rest of
                // the stack routes by the next one
                self.proxy_response_stateless(resp).await
            }
        }
    }

    async fn uac_process_response(&mut self, idx: usize, resp: Response) {
        let code = u16::from(resp.status_code.clone());
        let (tx_id, invite, status, cancel) = {
            let tx = &mut self.transactions[idx];
            tx.touch();
            (tx.id, tx.is_invite(), tx.status, tx.cancel)
        };
        trace!(call_id = %self.call_id, tx_id, code, %status, "uac response");

        match code {
            100..=199 => {
                if invite && status == TransactionStatus::InviteCalling {
                    let endpoint = self.endpoint.clone();
                    let tx = &mut self.transactions[idx];
                    tx.set_status(TransactionStatus::InviteProceeding);
                    self.stop_retrans_and_timeout(idx);
                    // a proxy branch keeps its no-final-response
                    // horizon running while ringing
                    if matches!(self.transactions[idx].from, TransactionUser::Fork(_)) {
                        let timer_c = self.transactions[idx]
                            .opts
                            .timer_c
                            .unwrap_or(endpoint.config.sip_timer_c);
                        let timeout = self.start_timer(TimerTag::TimerC, tx_id, timer_c);
                        self.transactions[idx].timeout_timer = Some(timeout);
                    }
                }
                if code > 100 {
                    self.provisionals.insert(tx_id, code);
                    if invite && cancel == CancelStatus::ToCancel {
                        self.uac_send_cancel_now(idx, None).await;
                    }
                    self.transactions[idx].response = Some(resp.clone());
                    self.dialog_on_uac_response(idx, &resp).await;
                    self.uac_deliver(idx, false, resp).await;
                }
            }
            200..=299 => {
                if invite {
                    match status {
                        TransactionStatus::InviteCalling
                        | TransactionStatus::InviteProceeding => {
                            self.stop_retrans_and_timeout(idx);
                            self.transactions[idx].set_status(TransactionStatus::InviteAccepted);
                            self.transactions[idx].response = Some(resp.clone());
                            let timer_m = self.start_timer(
                                TimerTag::TimerM,
                                tx_id,
                                self.endpoint.config.timer_b(),
                            );
                            self.transactions[idx].timeout_timer = Some(timer_m);
                            self.dialog_on_uac_response(idx, &resp).await;
                            self.uac_deliver(idx, true, resp).await;
                        }
                        TransactionStatus::InviteAccepted => {
                            // a retransmitted 2xx needs its ACK again; a
                            // 2xx with a new to-tag is another forked
                            // dialog and gets its own
                            self.dialog_on_uac_response(idx, &resp).await;
                        }
                        _ => {}
                    }
                } else if matches!(
                    status,
                    TransactionStatus::Trying | TransactionStatus::Proceeding
                ) {
                    self.uac_complete_non_invite(idx, resp).await;
                }
            }
            _ => {
                if self.uac_auth_retry(idx, &resp).await {
                    return;
                }
                if invite {
                    match status {
                        TransactionStatus::InviteCalling
                        | TransactionStatus::InviteProceeding => {
                            self.stop_retrans_and_timeout(idx);
                            self.transactions[idx].set_status(TransactionStatus::InviteCompleted);
                            self.transactions[idx].response = Some(resp.clone());
                            self.uac_send_ack(idx, &resp).await;
                            let wait = if self.transactions[idx].reliable {
                                Duration::from_millis(0)
                            } else {
                                Duration::from_secs(32)
                            };
                            let timer_d = self.start_timer(TimerTag::TimerD, tx_id, wait);
                            self.transactions[idx].timeout_timer = Some(timer_d);
                            self.dialog_on_uac_response(idx, &resp).await;
                            self.uac_deliver(idx, true, resp).await;
                        }
                        TransactionStatus::InviteCompleted => {
                            // retransmitted final answer only re-ACKs
                            self.uac_send_ack(idx, &resp).await;
                        }
                        _ => {}
                    }
                } else if matches!(
                    status,
                    TransactionStatus::Trying | TransactionStatus::Proceeding
                ) {
                    self.uac_complete_non_invite(idx, resp).await;
                }
            }
        }
    }

    async fn uac_complete_non_invite(&mut self, idx: usize, resp: Response) {
        let tx_id = self.transactions[idx].id;
        self.stop_retrans_and_timeout(idx);
        self.transactions[idx].set_status(TransactionStatus::Completed);
        self.transactions[idx].response = Some(resp.clone());
        let wait = if self.transactions[idx].reliable {
            Duration::from_millis(0)
        } else {
            self.endpoint.config.sip_timer_t4
        };
        let timer_k = self.start_timer(TimerTag::TimerK, tx_id, wait);
        self.transactions[idx].timeout_timer = Some(timer_k);
        self.dialog_on_uac_response(idx, &resp).await;
        self.uac_deliver(idx, true, resp).await;
    }

    fn stop_retrans_and_timeout(&mut self, idx: usize) {
        let endpoint = self.endpoint.clone();
        let tx = &mut self.transactions[idx];
        if let Some(slot) = tx.retrans_timer.take() {
            endpoint.timers.cancel(slot);
        }
        if let Some(slot) = tx.timeout_timer.take() {
            endpoint.timers.cancel(slot);
        }
    }

    /// Route a response to whoever owns the transaction.
    async fn uac_deliver(&mut self, idx: usize, is_final: bool, resp: Response) {
        let (tx_id, from) = {
            let tx = &self.transactions[idx];
            (tx.id, tx.from.clone())
        };
        match from {
            TransactionUser::Caller(sender) => {
                let event = if is_final {
                    UacEvent::Final(resp)
                } else {
                    UacEvent::Provisional(resp)
                };
                sender.send(event).ok();
            }
            TransactionUser::Fork(fork_id) => {
                // fork_uac_response returns a boxed future: the fork
                // may launch further branches, which sends again,
                // which can come back here
                self.fork_uac_response(fork_id, tx_id, resp).await;
            }
            TransactionUser::None => {}
        }
    }

    /// Terminate with a synthetic final response (timeouts, transport
    /// failures).
    async fn uac_finish_with(&mut self, idx: usize, resp: Response) {
        let tx_id = self.transactions[idx].id;
        self.stop_retrans_and_timeout(idx);
        self.transactions[idx].set_status(TransactionStatus::Finished);
        self.uac_deliver(idx, true, resp).await;
        self.remove_transaction(tx_id);
    }

    async fn uac_send_ack(&mut self, idx: usize, resp: &Response) {
        let (request, connection, destination) = {
            let tx = &self.transactions[idx];
            (tx.request.clone(), tx.connection, tx.destination.clone())
        };
        match make_non_2xx_ack(&request, resp) {
            Ok(ack) => {
                if let Err(e) = self
                    .transport_send(connection, destination.as_ref(), ack.into())
                    .await
                {
                    debug!(call_id = %self.call_id, "ack send failed: {}", e);
                }
            }
            Err(e) => debug!(call_id = %self.call_id, "ack build failed: {}", e),
        }
    }

    /// External cancellation of a pending INVITE. In
    /// `invite_proceeding` the CANCEL goes out at once; in
    /// `invite_calling` it is deferred until the first provisional.
    pub(crate) async fn uac_cancel(&mut self, request_id: u32) -> Result<()> {
        let idx = self
            .transaction_index(request_id)
            .ok_or_else(|| Error::CallError(format!("no transaction {}", request_id)))?;
        let tx = &mut self.transactions[idx];
        if tx.role != TransactionRole::Uac || !tx.is_invite() {
            return Err(Error::CallError("not a pending INVITE".to_string()));
        }
        match tx.status {
            TransactionStatus::InviteCalling => {
                tx.cancel = CancelStatus::ToCancel;
                Ok(())
            }
            TransactionStatus::InviteProceeding => {
                self.uac_send_cancel_now(idx, None).await;
                Ok(())
            }
            _ => Err(Error::CallError("INVITE already answered".to_string())),
        }
    }

    pub(crate) async fn uac_send_cancel_now(&mut self, idx: usize, reason: Option<&str>) {
        let (request, connection, destination, already) = {
            let tx = &mut self.transactions[idx];
            let already = tx.cancel == CancelStatus::Cancelled;
            tx.cancel = CancelStatus::Cancelled;
            (
                tx.request.clone(),
                tx.connection,
                tx.destination.clone(),
                already,
            )
        };
        if already {
            return;
        }
        match make_cancel(&request, reason) {
            Ok(cancel) => {
                info!(call_id = %self.call_id, "cancelling branch");
                if let Err(e) = self
                    .transport_send(connection, destination.as_ref(), cancel.into())
                    .await
                {
                    debug!(call_id = %self.call_id, "cancel send failed: {}", e);
                }
            }
            Err(e) => debug!(call_id = %self.call_id, "cancel build failed: {}", e),
        }
    }

    /// Single-shot credential retry on 401/407.
    async fn uac_auth_retry(&mut self, idx: usize, resp: &Response) -> bool {
        let code = u16::from(resp.status_code.clone());
        if code != 401 && code != 407 {
            return false;
        }
        let (request, opts, from, auth_sent) = {
            let tx = &self.transactions[idx];
            (
                tx.request.clone(),
                tx.opts.clone(),
                tx.from.clone(),
                tx.auth_sent,
            )
        };
        let credential = match (&opts.credential, auth_sent, &from) {
            (Some(credential), false, TransactionUser::Caller(_)) => credential.clone(),
            _ => return false,
        };
        let auth_header = match crate::auth::make_client_auth(resp, &request, &credential) {
            Ok(header) => header,
            Err(e) => {
                debug!(call_id = %self.call_id, "auth header build failed: {}", e);
                return false;
            }
        };

        let mut retry = request;
        retry.headers.retain(|h| {
            !matches!(
                h,
                Header::Authorization(_) | Header::ProxyAuthorization(_)
            )
        });
        retry.headers.push(auth_header);
        // new attempt: fresh branch, next CSeq
        if let Ok(cseq) = retry.cseq_header_mut() {
            let seq = cseq.seq().map(|s| s + 1).unwrap_or(1);
            cseq.mut_seq(seq).ok();
        }
        if let Ok(via) = retry.via_header() {
            if let Ok(mut typed) = via.typed() {
                typed.params.retain(|p| !matches!(p, Param::Branch(_)));
                typed.params.push(make_via_branch());
                let rebuilt: rsip::headers::Via = typed.into();
                crate::header_pop!(retry.headers, Header::Via);
                crate::rsip_ext::RsipHeadersExt::push_front(
                    &mut retry.headers,
                    Header::Via(rebuilt),
                );
            }
        }

        let old_id = self.transactions[idx].id;
        self.stop_retrans_and_timeout(idx);
        self.remove_transaction(old_id);

        let key = match TransactionKey::from_request(&retry, TransactionRole::Uac) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let id = self.next_id();
        let mut tx = Transaction::new(id, TransactionRole::Uac, key, retry, opts, from);
        tx.auth_sent = true;
        let new_idx = self.insert_transaction(tx);
        info!(call_id = %self.call_id, "retrying with credentials");
        self.uac_send(new_idx).await;
        true
    }

    /// UAC side of the timer set: A/B/C/D/E/F/K/M plus the Expires
    /// auto-CANCEL.
    pub(crate) async fn uac_timer(&mut self, timer: CallTimer) -> Result<()> {
        let idx = match self.transaction_index(timer.subject) {
            Some(idx) => idx,
            None => return Ok(()),
        };
        let slot_matches = {
            let tx = &self.transactions[idx];
            match timer.tag {
                TimerTag::TimerA | TimerTag::TimerE => tx.retrans_timer == Some(timer.task_id),
                TimerTag::Expire => tx.expire_timer == Some(timer.task_id),
                _ => tx.timeout_timer == Some(timer.task_id),
            }
        };
        if !slot_matches {
            return Ok(());
        }

        match timer.tag {
            TimerTag::TimerA => {
                if self.transactions[idx].status == TransactionStatus::InviteCalling {
                    self.uac_retransmit(idx, false).await;
                }
            }
            TimerTag::TimerE => {
                if matches!(
                    self.transactions[idx].status,
                    TransactionStatus::Trying | TransactionStatus::Proceeding
                ) {
                    self.uac_retransmit(idx, true).await;
                }
            }
            TimerTag::TimerB => {
                if self.transactions[idx].status == TransactionStatus::InviteCalling {
                    let resp = make_response(
                        &self.transactions[idx].request,
                        StatusCode::RequestTimeout,
                        None,
                        Some("Timer B Timeout"),
                    );
                    info!(call_id = %self.call_id, "Timer B fired");
                    self.uac_finish_with(idx, resp).await;
                }
            }
            TimerTag::TimerF => {
                if !self.transactions[idx].is_finished() {
                    let resp = make_response(
                        &self.transactions[idx].request,
                        StatusCode::RequestTimeout,
                        None,
                        Some("Timer F Timeout"),
                    );
                    info!(call_id = %self.call_id, "Timer F fired");
                    self.uac_finish_with(idx, resp).await;
                }
            }
            TimerTag::TimerC => {
                if matches!(
                    self.transactions[idx].status,
                    TransactionStatus::InviteCalling | TransactionStatus::InviteProceeding
                ) {
                    info!(call_id = %self.call_id, "Timer C fired");
                    self.uac_send_cancel_now(idx, Some("Timer C Timeout")).await;
                    let resp = make_response(
                        &self.transactions[idx].request,
                        StatusCode::RequestTimeout,
                        None,
                        Some("Timer C Timeout"),
                    );
                    self.uac_finish_with(idx, resp).await;
                }
            }
            TimerTag::TimerD | TimerTag::TimerK | TimerTag::TimerM => {
                let tx_id = self.transactions[idx].id;
                self.transactions[idx].set_status(TransactionStatus::Finished);
                self.remove_transaction(tx_id);
            }
            TimerTag::Expire => {
                let (invite, status) = {
                    let tx = &self.transactions[idx];
                    (tx.is_invite(), tx.status)
                };
                if invite {
                    match status {
                        TransactionStatus::InviteCalling => {
                            self.transactions[idx].cancel = CancelStatus::ToCancel;
                        }
                        TransactionStatus::InviteProceeding => {
                            self.uac_send_cancel_now(idx, Some("Expired")).await;
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn uac_retransmit(&mut self, idx: usize, cap_at_t2: bool) {
        let t2 = self.endpoint.config.sip_timer_t2;
        let (tx_id, request, connection, destination, next) = {
            let tx = &mut self.transactions[idx];
            tx.retrans_count += 1;
            let next = tx.next_retrans * 2;
            tx.next_retrans = if cap_at_t2 { next.min(t2) } else { next };
            (
                tx.id,
                tx.request.clone(),
                tx.connection,
                tx.destination.clone(),
                tx.next_retrans,
            )
        };
        if let Err(e) = self
            .transport_send(connection, destination.as_ref(), request.into())
            .await
        {
            debug!(call_id = %self.call_id, "retransmit failed: {}", e);
        }
        let tag = if cap_at_t2 {
            TimerTag::TimerE
        } else {
            TimerTag::TimerA
        };
        let timer = self.start_timer(tag, tx_id, next);
        self.transactions[idx].retrans_timer = Some(timer);
    }

    /// A response that matches no local transaction: stateless proxy
    /// handling, forwarded along the remaining Via set.
    async fn proxy_response_stateless(&mut self, mut resp: Response) -> Result<()> {
        crate::header_pop!(resp.headers, Header::Via);
        let via = match resp.via_header() {
            Ok(via) => via.clone(),
            Err(_) => {
                debug!(call_id = %self.call_id, "dropping unmatched response");
                return Ok(());
            }
        };
        let typed = via.typed()?;
        let mut addr = crate::transport::SipAddr {
            r#type: Some(typed.transport),
            addr: typed.uri.host_with_port.clone(),
        };
        for param in typed.params.iter() {
            if let Param::Received(received) = param {
                if let Ok(host) = received.parse() {
                    addr.addr.host = host.into();
                }
            }
        }
        self.transport_send(None, Some(&addr), resp.into()).await?;
        Ok(())
    }
}
