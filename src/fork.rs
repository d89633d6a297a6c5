//! Parallel forking with best-response selection (RFC 3261 §16.6,
//! "serial-of-parallel": groups are tried in order, targets inside a
//! group in parallel).

use crate::call::Call;
use crate::registrar::decode_route_param;
use crate::rsip_ext::RsipHeadersExt;
use crate::transaction::key::TransactionKey;
use crate::transaction::{
    make_response, random_text, CancelStatus, RequestOpts, Transaction, TransactionRole,
    TransactionStatus, TransactionUser, BRANCH_LEN,
};
use crate::{Error, Result};
use rsip::prelude::{ToTypedHeader, UntypedHeader};
use rsip::{Header, Method, Param, Request, Response, StatusCode};
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkFinal {
    None,
    TwoXx,
    SixXx,
    Cancelled,
}

/// One forking operation, owned by the call actor. `id` equals the
/// originating UAS transaction id; children point back by id only.
pub struct Fork {
    pub id: u32,
    pub method: Method,
    pub request: Request,
    /// Pending target groups, serial-of-parallel.
    pub uriset: Vec<Vec<rsip::Uri>>,
    pub uacs: Vec<u32>,
    pub pending: Vec<u32>,
    pub responses: Vec<Response>,
    pub final_status: ForkFinal,
    pub opts: RequestOpts,
    pub started: Instant,
}

fn response_priority(code: u16) -> u32 {
    match code {
        401 | 407 => 100,
        415 | 420 | 484 => 200,
        503 => 300,
        600..=699 => 400 + (code as u32 - 600),
        _ => 1000 + code as u32,
    }
}

/// Pick the answer a proxy owes upstream out of everything the
/// branches returned. 401/407 win (with their challenges merged),
/// then 415/420/484, then 503 (sent upstream as 500), then 6xx, then
/// lowest code; an empty set synthesises 480.
pub fn best_response(request: &Request, responses: &[Response]) -> Response {
    let best = responses.iter().min_by_key(|resp| {
        response_priority(u16::from(resp.status_code.clone()))
    });
    let best = match best {
        Some(best) => best,
        None => {
            return make_response(
                request,
                StatusCode::TemporarilyUnavailable,
                None,
                Some("No Response"),
            )
        }
    };
    let mut chosen = best.clone();
    let code = u16::from(chosen.status_code.clone());

    if code == 401 || code == 407 {
        // merge every challenge so the UAC can pick any branch
        for resp in responses.iter() {
            let other = u16::from(resp.status_code.clone());
            if other != 401 && other != 407 {
                continue;
            }
            for header in resp.headers.iter() {
                if matches!(
                    header,
                    Header::WwwAuthenticate(_) | Header::ProxyAuthenticate(_)
                ) && !chosen.headers.iter().any(|existing| existing == header)
                {
                    chosen.headers.push(header.clone());
                }
            }
        }
    }
    if code == 503 {
        chosen.status_code = StatusCode::ServerInternalError;
    }
    chosen
}

impl Call {
    pub(crate) fn fork_find(&self, fork_id: u32) -> Option<usize> {
        self.forks.iter().position(|fork| fork.id == fork_id)
    }

    /// Enter the fork engine for the UAS transaction at `uas_idx`.
    pub(crate) async fn fork_start(
        &mut self,
        uas_idx: usize,
        uriset: Vec<Vec<rsip::Uri>>,
        opts: RequestOpts,
    ) -> Result<()> {
        let (fork_id, method, request) = {
            let tx = &self.transactions[uas_idx];
            (tx.id, tx.request.method.clone(), tx.request.clone())
        };
        info!(call_id = %self.call_id, fork_id, groups = uriset.len(), "fork started");
        self.forks.push(Fork {
            id: fork_id,
            method: method.clone(),
            request,
            uriset,
            uacs: Vec::new(),
            pending: Vec::new(),
            responses: Vec::new(),
            final_status: ForkFinal::None,
            opts,
            started: Instant::now(),
        });
        self.fork_launch_next_group(fork_id).await;

        // ACK is forwarded without waiting for anything
        if method == Method::Ack {
            if let Some(idx) = self.fork_find(fork_id) {
                self.forks.remove(idx);
            }
        }
        Ok(())
    }

    /// Launch every target of the next group as a child UAC
    /// transaction. Empty groups are skipped; running dry triggers
    /// best-response delivery.
    async fn fork_launch_next_group(&mut self, fork_id: u32) {
        loop {
            let next = {
                let idx = match self.fork_find(fork_id) {
                    Some(idx) => idx,
                    None => return,
                };
                let fork = &mut self.forks[idx];
                if fork.final_status != ForkFinal::None {
                    return;
                }
                if fork.uriset.is_empty() {
                    if !fork.pending.is_empty() {
                        return;
                    }
                    None
                } else {
                    Some((
                        fork.uriset.remove(0),
                        fork.opts.clone(),
                        fork.request.clone(),
                        fork.method.clone(),
                    ))
                }
            };
            let (group, opts, request, method) = match next {
                Some(next) => next,
                None => {
                    self.fork_deliver_best(fork_id).await;
                    return;
                }
            };
            let mut launched = 0;
            for target in group {
                match self
                    .fork_launch_target(fork_id, &request, &method, target, &opts)
                    .await
                {
                    Ok(_) => launched += 1,
                    Err(e) => {
                        debug!(call_id = %self.call_id, fork_id, "branch launch failed: {}", e);
                        // dead or bogus flows still compete in
                        // best-response selection
                        let (code, reason) = match e {
                            Error::FlowFailed => (430, "Flow Failed"),
                            Error::InvalidFlowToken => (403, "Invalid Flow Token"),
                            _ => (503, "Transport Failure"),
                        };
                        let synthetic = make_response(
                            &request,
                            crate::rsip_ext::status_code_by_number(code),
                            None,
                            Some(reason),
                        );
                        if let Some(idx) = self.fork_find(fork_id) {
                            self.forks[idx].responses.push(synthetic);
                        }
                    }
                }
            }
            if launched > 0 {
                return;
            }
        }
    }

    async fn fork_launch_target(
        &mut self,
        fork_id: u32,
        request: &Request,
        method: &Method,
        mut target: rsip::Uri,
        opts: &RequestOpts,
    ) -> Result<()> {
        let mut branch_req = request.clone();

        // a target coming out of the registrar carries its path as a
        // route parameter; replay it
        let mut routes: Vec<String> = Vec::new();
        target.params.retain(|param| match param {
            Param::Other(name, Some(value)) if name.value().eq_ignore_ascii_case("route") => {
                routes = decode_route_param(value.value());
                false
            }
            _ => true,
        });
        branch_req.uri = target;
        // the path is replayed bottom-up: last hop stored first out
        for route in routes.iter().rev() {
            branch_req
                .headers
                .push_front(Header::Route(route.clone().into()));
        }

        // Max-Forwards
        let max_forwards = branch_req
            .headers
            .iter()
            .find_map(|header| match header {
                Header::MaxForwards(mf) => mf.value().trim().parse::<u32>().ok(),
                _ => None,
            })
            .unwrap_or(70);
        if max_forwards == 0 {
            return Err(Error::CallError("too many hops".to_string()));
        }
        branch_req
            .headers
            .retain(|header| !matches!(header, Header::MaxForwards(_)));
        branch_req
            .headers
            .push(Header::MaxForwards((max_forwards - 1).into()));

        // our Via on top
        let local = self.local_via_addr();
        let branch = format!("z9hG4bK{}", random_text(BRANCH_LEN));
        let transport = local
            .r#type
            .map(|t| t.to_string().to_uppercase())
            .unwrap_or_else(|| "UDP".to_string());
        branch_req.headers.push_front(Header::Via(
            format!("SIP/2.0/{} {};branch={}", transport, local.addr, branch).into(),
        ));

        // REGISTER path recording (RFC 3327 + RFC 5626 §5.1): a UA
        // supporting path+outbound with a single reg-id contact gets
        // its receiving connection recorded; at the first hop the
        // Path also carries ob
        if opts.path && *method == Method::Register {
            let supports = crate::rsip_ext::header_contains_token(
                &request.headers,
                "Supported",
                "path",
            ) && crate::rsip_ext::header_contains_token(
                &request.headers,
                "Supported",
                "outbound",
            );
            let reg_id_contacts = request
                .headers
                .iter()
                .filter_map(|header| match header {
                    Header::Contact(contact) => contact.typed().ok(),
                    _ => None,
                })
                .filter(|contact| crate::outbound::contact_reg_id(contact).is_some())
                .count();
            // vias counted before our own went on top
            let first_hop = request
                .headers
                .iter()
                .filter(|header| matches!(header, Header::Via(_)))
                .count()
                == 1;
            let recorded = if supports && reg_id_contacts == 1 {
                self.transaction_index(fork_id)
                    .and_then(|idx| self.transactions[idx].connection)
                    .map(|flow| (flow, first_hop))
            } else {
                None
            };
            let (user, ob) = match recorded {
                Some((flow, ob)) => (crate::outbound::encode_flow_token(flow), ob),
                None => (
                    crate::outbound::quoted_token(
                        &self.endpoint.global_id,
                        &self.endpoint.config.name,
                        &branch,
                    ),
                    false,
                ),
            };
            branch_req
                .headers
                .push_front(crate::outbound::make_path(&user, &local, ob));
            if let Some(idx) = self.transaction_index(fork_id) {
                self.transactions[idx].record_flow = recorded;
            }
        }

        // stay in the path of in-dialog requests when asked to
        let dialog_forming = matches!(
            method,
            Method::Invite | Method::Subscribe | Method::Notify | Method::Refer
        );
        if opts.record_route && dialog_forming {
            let record_flow = self
                .transaction_index(fork_id)
                .and_then(|idx| self.transactions[idx].record_flow);
            let user = match record_flow {
                Some((flow, _)) => crate::outbound::encode_flow_token(flow),
                None => crate::outbound::quoted_token(
                    &self.endpoint.global_id,
                    &self.endpoint.config.name,
                    &branch,
                ),
            };
            branch_req
                .headers
                .push_front(crate::outbound::make_record_route(&user, &local));
        }

        if *method == Method::Ack {
            let dest = self.request_destination(&branch_req).ok();
            self.transport_send(None, dest.as_ref(), branch_req.into())
                .await?;
            return Ok(());
        }

        // route over a pinned flow when the replayed path names one,
        // or over the flow the incoming top Route already selected
        let parent = self.transaction_index(fork_id);
        let current = parent.and_then(|idx| self.transactions[idx].connection);
        let parent_flow = parent.and_then(|idx| self.transactions[idx].route_flow);
        let flow = match current {
            Some(current) => {
                crate::outbound::route_analysis(&self.endpoint.pool, &mut branch_req, current)?
            }
            None => Default::default(),
        };

        let key = TransactionKey::from_request(&branch_req, TransactionRole::Uac)?;
        let id = self.next_id();
        let mut opts = opts.clone();
        opts.timer_c = Some(opts.timer_c.unwrap_or(self.endpoint.config.sip_timer_c));
        let mut tx = Transaction::new(
            id,
            TransactionRole::Uac,
            key,
            branch_req,
            opts,
            TransactionUser::Fork(fork_id),
        );
        tx.route_flow = flow.route_flow.or(parent_flow);
        let tx_idx = self.insert_transaction(tx);

        if let Some(fork_idx) = self.fork_find(fork_id) {
            self.forks[fork_idx].uacs.push(id);
            self.forks[fork_idx].pending.push(id);
        }
        self.uac_send(tx_idx).await;
        Ok(())
    }

    /// A child transaction answered; classify and advance the fork.
    ///
    /// Returns a boxed future (rather than being a plain `async fn`)
    /// because this call and `Call::uac_deliver`'s dispatch back into
    /// it form a recursive cycle; boxing here gives that cycle a
    /// concrete type so the compiler can prove it `Send`.
    pub(crate) fn fork_uac_response(
        &mut self,
        fork_id: u32,
        uac_id: u32,
        resp: Response,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
        let mut resp = resp;
        // our Via is the top one on everything a branch returns
        crate::header_pop!(resp.headers, Header::Via);

        let code = u16::from(resp.status_code.clone());
        let fork_idx = match self.fork_find(fork_id) {
            Some(idx) => idx,
            None => return,
        };
        debug!(call_id = %self.call_id, fork_id, uac_id, code, "fork response");

        match code {
            100 => {}
            101..=199 => {
                if self.forks[fork_idx].final_status == ForkFinal::None {
                    self.fork_forward(fork_id, resp).await;
                }
            }
            200..=299 => {
                self.forks[fork_idx].pending.retain(|id| *id != uac_id);
                let first = self.forks[fork_idx].final_status == ForkFinal::None;
                if first {
                    self.forks[fork_idx].final_status = ForkFinal::TwoXx;
                    // no new targets once somebody answered
                    self.forks[fork_idx].uriset.clear();
                }
                self.fork_forward(fork_id, resp).await;
                if first {
                    self.fork_cancel_pending(fork_id, "Call completed elsewhere")
                        .await;
                }
            }
            300..=399 => {
                self.forks[fork_idx].pending.retain(|id| *id != uac_id);
                let follow = self.forks[fork_idx].opts.follow_redirects
                    && self.forks[fork_idx].final_status == ForkFinal::None;
                let contacts = redirect_contacts(&self.forks[fork_idx].request, &resp);
                if follow && !contacts.is_empty() {
                    info!(call_id = %self.call_id, fork_id, "following redirect");
                    self.forks[fork_idx].uriset.insert(0, contacts);
                } else {
                    self.forks[fork_idx].responses.push(resp);
                }
            }
            600..=699 => {
                self.forks[fork_idx].pending.retain(|id| *id != uac_id);
                let first = self.forks[fork_idx].final_status == ForkFinal::None;
                if first {
                    self.forks[fork_idx].final_status = ForkFinal::SixXx;
                    self.forks[fork_idx].uriset.clear();
                    self.fork_forward(fork_id, resp).await;
                    let reason = format!("SIP;cause={}", code);
                    self.fork_cancel_pending(fork_id, &reason).await;
                }
            }
            _ => {
                self.forks[fork_idx].pending.retain(|id| *id != uac_id);
                self.forks[fork_idx].responses.push(resp);
            }
        }

        let (drained, finalized) = match self.fork_find(fork_id) {
            Some(idx) => {
                let fork = &self.forks[idx];
                (
                    fork.pending.is_empty(),
                    fork.final_status != ForkFinal::None,
                )
            }
            None => return,
        };
        if drained {
            if finalized {
                self.fork_remove(fork_id);
            } else {
                self.fork_launch_next_group(fork_id).await;
            }
        }
        })
    }

    /// Push a branch response upstream through the owning UAS
    /// transaction.
    async fn fork_forward(&mut self, fork_id: u32, resp: Response) {
        let idx = match self.transaction_index(fork_id) {
            Some(idx) => idx,
            None => {
                debug!(call_id = %self.call_id, fork_id, "upstream transaction gone");
                return;
            }
        };
        if let Err(e) = self.uas_forward_response(idx, resp).await {
            debug!(call_id = %self.call_id, fork_id, "upstream forward failed: {}", e);
        }
    }

    /// CANCEL every still-pending branch.
    async fn fork_cancel_pending(&mut self, fork_id: u32, reason: &str) {
        let pending = match self.fork_find(fork_id) {
            Some(idx) => self.forks[idx].pending.clone(),
            None => return,
        };
        for uac_id in pending {
            if let Some(idx) = self.transaction_index(uac_id) {
                match self.transactions[idx].status {
                    TransactionStatus::InviteProceeding => {
                        self.uac_send_cancel_now(idx, Some(reason)).await;
                    }
                    TransactionStatus::InviteCalling => {
                        self.transactions[idx].cancel = CancelStatus::ToCancel;
                    }
                    _ => {}
                }
            }
        }
    }

    /// The proxied INVITE itself was cancelled: take the fork down
    /// and answer 487 upstream.
    pub(crate) async fn fork_cancelled_upstream(&mut self, fork_id: u32) {
        self.fork_cancel_pending(fork_id, "Call cancelled").await;
        if let Some(idx) = self.fork_find(fork_id) {
            self.forks[idx].final_status = ForkFinal::Cancelled;
            self.forks[idx].uriset.clear();
        }
        if let Some(idx) = self.transaction_index(fork_id) {
            self.uas_reply(
                idx,
                crate::service::SipReply::new(StatusCode::RequestTerminated),
            )
            .await
            .ok();
        }
    }

    /// Everything drained without a final: compute and deliver the
    /// best stored response.
    async fn fork_deliver_best(&mut self, fork_id: u32) {
        let (request, responses, method) = match self.fork_find(fork_id) {
            Some(idx) => {
                let fork = &self.forks[idx];
                (
                    fork.request.clone(),
                    fork.responses.clone(),
                    fork.method.clone(),
                )
            }
            None => return,
        };
        if method != Method::Ack {
            let best = best_response(&request, &responses);
            info!(
                call_id = %self.call_id,
                fork_id,
                code = u16::from(best.status_code.clone()),
                "best response selected"
            );
            self.fork_forward(fork_id, best).await;
        }
        self.fork_remove(fork_id);
    }

    fn fork_remove(&mut self, fork_id: u32) {
        if let Some(idx) = self.fork_find(fork_id) {
            debug!(call_id = %self.call_id, fork_id, "fork removed");
            self.forks.remove(idx);
        }
    }
}

/// Contact set of a 3xx, filtered for redirect chasing: when the
/// original target was sips, plain sip contacts would downgrade the
/// call and are dropped.
fn redirect_contacts(request: &Request, resp: &Response) -> Vec<rsip::Uri> {
    let was_sips = request
        .uri
        .scheme
        .as_ref()
        .map(|scheme| matches!(scheme, rsip::Scheme::Sips))
        .unwrap_or(false);
    resp.headers
        .iter()
        .filter_map(|header| match header {
            Header::Contact(contact) => contact.typed().ok().map(|typed| typed.uri),
            _ => None,
        })
        .filter(|uri| {
            if !was_sips {
                return true;
            }
            uri.scheme
                .as_ref()
                .map(|scheme| matches!(scheme, rsip::Scheme::Sips))
                .unwrap_or(false)
        })
        .collect()
}
