//! UAS transaction state machines, RFC 3261 §17.2.

use super::{
    key::TransactionKey, make_response, make_tag, CancelStatus, RequestOpts, Transaction,
    TransactionRole, TransactionStatus, TransactionUser,
};
use crate::call::{Call, CallTimer, TimerTag};
use crate::service::SipReply;
use crate::transport::{SipAddr, TransportHandle};
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, Method, Request, Response, StatusCode};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

impl Call {
    /// Entry point for every inbound request.
    pub(crate) async fn uas_request(
        &mut self,
        request: Request,
        connection: TransportHandle,
        source: SipAddr,
    ) -> Result<()> {
        if request.method == Method::Ack {
            return self.uas_ack(request).await;
        }
        if request.method == Method::Cancel {
            return self.uas_cancel(request, connection, source).await;
        }

        let key = TransactionKey::from_request(&request, TransactionRole::Uas)?;
        if let Some(idx) = self.find_by_key(&key) {
            // retransmitted request: replay the last answer
            let (response, conn, src) = {
                let tx = &mut self.transactions[idx];
                tx.touch();
                (tx.response.clone(), tx.connection, tx.source.clone())
            };
            if let Some(response) = response {
                trace!(call_id = %self.call_id, "replaying answer for retransmission");
                self.transport_send(conn, src.as_ref(), response.into())
                    .await
                    .ok();
            }
            return Ok(());
        }

        let mut request = request;
        // a flow token in the top Route pins the outgoing connection
        let flow = match self.uas_check_route_flow(&mut request, connection) {
            Ok(flow) => flow,
            Err(Error::InvalidFlowToken) => {
                info!(call_id = %self.call_id, "invalid flow token");
                return self
                    .reply_stateless(
                        &request,
                        SipReply::new(StatusCode::Forbidden).with_reason("Invalid Flow Token"),
                        connection,
                        &source,
                    )
                    .await;
            }
            Err(Error::FlowFailed) => {
                info!(call_id = %self.call_id, "flow failed");
                return self
                    .reply_stateless(
                        &request,
                        SipReply::new(crate::rsip_ext::status_code_by_number(430))
                            .with_reason("Flow Failed"),
                        connection,
                        &source,
                    )
                    .await;
            }
            Err(e) => return Err(e),
        };

        let to_tag = request
            .to_header()?
            .tag()?
            .map(|tag| tag.value().to_string());
        let id = self.next_id();
        let mut tx = Transaction::new(
            id,
            TransactionRole::Uas,
            key,
            request,
            RequestOpts::default(),
            TransactionUser::None,
        );
        tx.connection = Some(connection);
        tx.source = Some(source);
        tx.reliable = self
            .endpoint
            .pool
            .get(connection)
            .map(|conn| conn.is_reliable())
            .unwrap_or(false);
        tx.local_tag = Some(to_tag.clone().unwrap_or_else(|| make_tag().to_string()));
        tx.route_flow = flow.route_flow;
        tx.record_flow = flow.record_flow;
        let idx = self.insert_transaction(tx);

        // INVITE answers 100 at once unless configured away or the
        // request is already in-dialog
        if self.transactions[idx].is_invite() && !self.endpoint.config.no_100 && to_tag.is_none() {
            let trying = make_response(
                &self.transactions[idx].request,
                StatusCode::Trying,
                None,
                None,
            );
            self.uas_do_reply(idx, trying).await?;
        }

        self.route_pipeline(idx).await
    }

    fn uas_check_route_flow(
        &self,
        request: &mut Request,
        connection: TransportHandle,
    ) -> Result<crate::outbound::FlowRoute> {
        if !self
            .endpoint
            .config
            .has_plugin(crate::config::Plugin::Outbound)
        {
            return Ok(crate::outbound::FlowRoute::default());
        }
        crate::outbound::route_analysis(&self.endpoint.pool, request, connection)
    }

    async fn uas_ack(&mut self, request: Request) -> Result<()> {
        let key = TransactionKey::from_request(&request, TransactionRole::Uas)?;
        if let Some(idx) = self.find_by_key(&key) {
            if self.transactions[idx].status == TransactionStatus::InviteCompleted {
                let tx_id = self.transactions[idx].id;
                self.uas_stop_timers(idx);
                self.transactions[idx].set_status(TransactionStatus::InviteConfirmed);
                let wait = if self.transactions[idx].reliable {
                    Duration::from_millis(0)
                } else {
                    self.endpoint.config.sip_timer_t4
                };
                let timer_i = self.start_timer(TimerTag::TimerI, tx_id, wait);
                self.transactions[idx].timeout_timer = Some(timer_i);
                return Ok(());
            }
            if self.transactions[idx].status == TransactionStatus::InviteAccepted {
                // ACK to our 2xx stops the answer retransmissions
                let endpoint = self.endpoint.clone();
                let tx = &mut self.transactions[idx];
                if let Some(slot) = tx.retrans_timer.take() {
                    endpoint.timers.cancel(slot);
                }
            }
        }
        self.dialog_uas_ack(&request).await;
        Ok(())
    }

    /// CANCEL matching per §9.2: same INVITE branch and same source
    /// address, otherwise there is no matching transaction.
    async fn uas_cancel(
        &mut self,
        cancel: Request,
        connection: TransportHandle,
        source: SipAddr,
    ) -> Result<()> {
        let target = TransactionKey::cancel_target(&cancel, TransactionRole::Uas)?;
        let idx = self.find_by_key(&target);
        let source_matches = idx
            .map(|idx| {
                self.transactions[idx]
                    .source
                    .as_ref()
                    .map(|stored| stored.addr == source.addr)
                    .unwrap_or(false)
            })
            .unwrap_or(false);

        let idx = match (idx, source_matches) {
            (Some(idx), true) => idx,
            _ => {
                info!(call_id = %self.call_id, "no matching transaction for CANCEL");
                return self
                    .reply_stateless(
                        &cancel,
                        SipReply::new(StatusCode::CallTransactionDoesNotExist)
                            .with_reason("No Matching Transaction"),
                        connection,
                        &source,
                    )
                    .await;
            }
        };

        // the CANCEL itself succeeds whenever the INVITE exists
        self.reply_stateless(&cancel, SipReply::new(StatusCode::OK), connection, &source)
            .await?;

        if self.transactions[idx].status != TransactionStatus::InviteProceeding {
            return Ok(());
        }
        let invite_request = self.transactions[idx].request.clone();
        self.transactions[idx].cancel = CancelStatus::Cancelled;
        self.endpoint.service.sip_cancel(&invite_request, &cancel);

        let fork_id = self.transactions[idx].id;
        if self.forks.iter().any(|fork| fork.id == fork_id) {
            self.fork_cancelled_upstream(fork_id).await;
        } else {
            self.uas_reply(idx, SipReply::new(StatusCode::RequestTerminated))
                .await?;
        }
        Ok(())
    }

    /// Answer a UAS transaction with a locally built response.
    pub(crate) async fn uas_reply(&mut self, idx: usize, reply: SipReply) -> Result<()> {
        let (request, local_tag) = {
            let tx = &self.transactions[idx];
            (tx.request.clone(), tx.local_tag.clone())
        };
        let code = u16::from(reply.status.clone());
        let mut response = make_response(
            &request,
            reply.status.clone(),
            local_tag.as_deref(),
            reply.reason.as_deref(),
        );
        // extra headers may repeat (several Contacts, Paths)
        for header in reply.headers.iter() {
            response.headers.push(header.clone());
        }
        if let Some(body) = reply.body {
            response
                .headers
                .retain(|h| !matches!(h, Header::ContentLength(_)));
            response
                .headers
                .push(Header::ContentLength((body.len() as u32).into()));
            response.body = body;
        }

        let dialog_forming = matches!(
            request.method,
            Method::Invite | Method::Subscribe | Method::Refer
        );
        if dialog_forming && (101..300).contains(&code) {
            if response.contact_header().is_err() {
                let outbound_supported = crate::rsip_ext::header_contains_token(
                    &request.headers,
                    "Supported",
                    "outbound",
                );
                let contact = crate::outbound::make_contact(
                    &self.endpoint.config,
                    &self.local_via_addr(),
                    true,
                    false,
                    outbound_supported,
                    None,
                );
                response.headers.push(Header::Contact(contact.into()));
            }
        }

        self.uas_do_reply(idx, response.clone()).await?;
        if dialog_forming && (101..300).contains(&code) {
            self.dialog_on_uas_response(idx, &response).await;
        }
        if request.method == Method::Bye && (200..300).contains(&code) {
            self.dialog_on_bye(&request).await;
        }
        Ok(())
    }

    /// Forward a downstream response upstream (proxy path): our Via
    /// is already stripped; state advances exactly as for a local
    /// reply.
    pub(crate) async fn uas_forward_response(&mut self, idx: usize, response: Response) -> Result<()> {
        self.uas_do_reply(idx, response).await
    }

    /// The single point where a UAS response hits the wire and the
    /// FSM advances.
    pub(crate) async fn uas_do_reply(&mut self, idx: usize, response: Response) -> Result<()> {
        let code = u16::from(response.status_code.clone());
        let (tx_id, invite, status, conn, src, reliable) = {
            let tx = &self.transactions[idx];
            (
                tx.id,
                tx.is_invite(),
                tx.status,
                tx.connection,
                tx.source.clone(),
                tx.reliable,
            )
        };

        let acceptable = match status {
            TransactionStatus::InviteProceeding
            | TransactionStatus::Trying
            | TransactionStatus::Proceeding => true,
            // a proxy forwards every 2xx it receives; each one comes
            // from a different branch and must reach the UAC
            TransactionStatus::InviteAccepted => (200..300).contains(&code),
            _ => false,
        };
        if !acceptable {
            warn!(call_id = %self.call_id, tx_id, %status, code, "reply in invalid state ignored");
            return Err(Error::TransactionError(
                "reply in invalid state".to_string(),
                self.transactions[idx].key.clone(),
            ));
        }

        trace!(call_id = %self.call_id, tx_id, code, "reply sent");
        self.transport_send(conn, src.as_ref(), response.clone().into())
            .await?;

        let t1 = self.endpoint.config.sip_timer_t1;
        match code {
            100 => {
                if self.transactions[idx].response.is_none() {
                    self.transactions[idx].response = Some(response);
                }
            }
            101..=199 => {
                if !invite {
                    self.transactions[idx].set_status(TransactionStatus::Proceeding);
                }
                self.transactions[idx].response = Some(response);
            }
            200..=299 if invite => {
                self.transactions[idx].set_status(TransactionStatus::InviteAccepted);
                self.transactions[idx].response = Some(response);
                if !reliable {
                    let timer_g = self.start_timer(TimerTag::TimerG, tx_id, t1);
                    self.transactions[idx].retrans_timer = Some(timer_g);
                    self.transactions[idx].next_retrans = t1;
                }
                let timer_l =
                    self.start_timer(TimerTag::TimerL, tx_id, self.endpoint.config.timer_b());
                self.transactions[idx].timeout_timer = Some(timer_l);
            }
            300..=699 if invite => {
                self.transactions[idx].set_status(TransactionStatus::InviteCompleted);
                self.transactions[idx].response = Some(response);
                if !reliable {
                    let timer_g = self.start_timer(TimerTag::TimerG, tx_id, t1);
                    self.transactions[idx].retrans_timer = Some(timer_g);
                    self.transactions[idx].next_retrans = t1;
                }
                let timer_h =
                    self.start_timer(TimerTag::TimerH, tx_id, self.endpoint.config.timer_b());
                self.transactions[idx].timeout_timer = Some(timer_h);
            }
            _ => {
                // final answer to a non-INVITE
                self.transactions[idx].set_status(TransactionStatus::Completed);
                self.transactions[idx].response = Some(response);
                let wait = if reliable {
                    Duration::from_millis(0)
                } else {
                    self.endpoint.config.timer_b()
                };
                let timer_j = self.start_timer(TimerTag::TimerJ, tx_id, wait);
                self.transactions[idx].timeout_timer = Some(timer_j);
            }
        }
        Ok(())
    }

    /// Build and send a response outside any transaction.
    pub(crate) async fn reply_stateless(
        &self,
        request: &Request,
        reply: SipReply,
        connection: TransportHandle,
        source: &SipAddr,
    ) -> Result<()> {
        let mut response = make_response(
            request,
            reply.status.clone(),
            Some(make_tag().to_string()).as_deref(),
            reply.reason.as_deref(),
        );
        for header in reply.headers.iter() {
            response.headers.push(header.clone());
        }
        self.transport_send(Some(connection), Some(source), response.into())
            .await
            .map(|_| ())
    }

    fn uas_stop_timers(&mut self, idx: usize) {
        let endpoint = self.endpoint.clone();
        let tx = &mut self.transactions[idx];
        if let Some(slot) = tx.retrans_timer.take() {
            endpoint.timers.cancel(slot);
        }
        if let Some(slot) = tx.timeout_timer.take() {
            endpoint.timers.cancel(slot);
        }
    }

    /// UAS side of the timer set: G/H/I/J/L.
    pub(crate) async fn uas_timer(&mut self, timer: CallTimer) -> Result<()> {
        let idx = match self.transaction_index(timer.subject) {
            Some(idx) => idx,
            None => return Ok(()),
        };
        let slot_matches = {
            let tx = &self.transactions[idx];
            match timer.tag {
                TimerTag::TimerG => tx.retrans_timer == Some(timer.task_id),
                _ => tx.timeout_timer == Some(timer.task_id),
            }
        };
        if !slot_matches {
            return Ok(());
        }

        match timer.tag {
            TimerTag::TimerG => {
                if matches!(
                    self.transactions[idx].status,
                    TransactionStatus::InviteAccepted | TransactionStatus::InviteCompleted
                ) {
                    let t2 = self.endpoint.config.sip_timer_t2;
                    let (tx_id, response, conn, src, next) = {
                        let tx = &mut self.transactions[idx];
                        let next = (tx.next_retrans * 2).min(t2);
                        tx.next_retrans = next;
                        tx.retrans_count += 1;
                        (
                            tx.id,
                            tx.response.clone(),
                            tx.connection,
                            tx.source.clone(),
                            next,
                        )
                    };
                    if let Some(response) = response {
                        self.transport_send(conn, src.as_ref(), response.into())
                            .await
                            .ok();
                    }
                    let timer_g = self.start_timer(TimerTag::TimerG, tx_id, next);
                    self.transactions[idx].retrans_timer = Some(timer_g);
                }
            }
            TimerTag::TimerH => {
                if self.transactions[idx].status == TransactionStatus::InviteCompleted {
                    debug!(call_id = %self.call_id, "no ACK received, transaction finished");
                    self.uas_finish(idx);
                }
            }
            TimerTag::TimerI => {
                if self.transactions[idx].status == TransactionStatus::InviteConfirmed {
                    self.uas_finish(idx);
                }
            }
            TimerTag::TimerJ => {
                if self.transactions[idx].status == TransactionStatus::Completed {
                    self.uas_finish(idx);
                }
            }
            TimerTag::TimerL => {
                if self.transactions[idx].status == TransactionStatus::InviteAccepted {
                    self.uas_finish(idx);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn uas_finish(&mut self, idx: usize) {
        let tx_id = self.transactions[idx].id;
        self.transactions[idx].set_status(TransactionStatus::Finished);
        self.remove_transaction(tx_id);
    }
}
