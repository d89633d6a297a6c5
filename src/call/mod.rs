use crate::auth::NonceCache;
use crate::dialog::{dialog::Dialog, DialogId};
use crate::endpoint::EndpointInnerRef;
use crate::fork::Fork;
use crate::service::SipReply;
use crate::transaction::key::TransactionKey;
use crate::transaction::{
    make_response, RequestOpts, Transaction, TransactionRole, TransactionStatus, TransactionUser,
    UacEvent, UacSender,
};
use crate::transport::{IncomingMessage, SipAddr, TransportHandle};
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Method, Request, SipMessage, StatusCode};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Timers a call can arm. A–M are the RFC 3261 transaction timers;
/// the rest belong to dialogs and call housekeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerTag {
    TimerA,
    TimerB,
    TimerC,
    TimerD,
    TimerE,
    TimerF,
    TimerG,
    TimerH,
    TimerI,
    TimerJ,
    TimerK,
    TimerL,
    TimerM,
    Expire,
    DialogRefresh,
    SubExpire,
    CheckCall,
}

/// A fired timer, posted into the owning call's mailbox.
///
/// Carries the wheel task id so the actor can verify the timer is
/// still the one stored in the subject's slot before acting.
#[derive(Debug, Clone)]
pub struct CallTimer {
    pub call_id: String,
    pub tag: TimerTag,
    pub subject: u32,
    pub task_id: u64,
}

/// Read-only transaction snapshot for apply-to-transaction.
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    pub id: u32,
    pub role: TransactionRole,
    pub method: Method,
    pub status: TransactionStatus,
    pub fork: Option<u32>,
    pub last_response: Option<u16>,
}

/// Read-only dialog snapshot for apply-to-dialog.
#[derive(Debug, Clone)]
pub struct DialogInfo {
    pub id: DialogId,
    pub invite_status: crate::dialog::InviteStatus,
    pub local_seq: u32,
    pub remote_seq: u32,
    pub route_set: Vec<rsip::Uri>,
    pub subscriptions: usize,
}

#[derive(Debug, Clone)]
pub struct CallInfo {
    pub call_id: String,
    pub transactions: usize,
    pub dialogs: usize,
    pub forks: usize,
    pub nonces: usize,
}

/// Everything a call actor can be asked to do. One item is processed
/// to completion before the next; there is no other way to touch call
/// state.
pub enum WorkItem {
    SendRequest {
        request: Request,
        opts: RequestOpts,
        reply: UacSender,
        /// Receives the assigned transaction id, for `send_cancel`.
        assigned: Option<oneshot::Sender<u32>>,
    },
    SendInDialog {
        dialog: DialogId,
        method: Method,
        opts: RequestOpts,
        reply: UacSender,
    },
    SendCancel {
        request_id: u32,
        reply: oneshot::Sender<Result<()>>,
    },
    SendReply {
        transaction_id: u32,
        reply: SipReply,
    },
    Incoming(IncomingMessage),
    ApplyToDialog {
        id: DialogId,
        reply: oneshot::Sender<Option<DialogInfo>>,
    },
    ApplyToTransaction {
        id: u32,
        reply: oneshot::Sender<Option<TransactionInfo>>,
    },
    ApplyToMessage {
        id: u32,
        reply: oneshot::Sender<Option<Request>>,
    },
    StopDialog {
        id: DialogId,
    },
    Info {
        reply: oneshot::Sender<CallInfo>,
    },
    Timer(CallTimer),
    /// Test-only: kill the actor from inside.
    Crash,
}

/// Per-Call-ID single-writer owner of transactions, dialogs, forks
/// and timers. All mutation of call state happens inside `process`.
pub struct Call {
    pub(crate) call_id: String,
    pub(crate) endpoint: EndpointInnerRef,
    pub(crate) next_id: u32,
    /// Most recently touched first.
    pub(crate) transactions: Vec<Transaction>,
    pub(crate) dialogs: Vec<Dialog>,
    pub(crate) forks: Vec<Fork>,
    /// Last provisional code seen per transaction.
    pub(crate) provisionals: HashMap<u32, u16>,
    pub(crate) nonces: NonceCache,
    /// Remote-tag -> source address, for reversed-dialog routing.
    pub(crate) dests: HashMap<String, SipAddr>,
    pub(crate) hibernate: bool,
    check_timer: u64,
}

impl Call {
    fn new(endpoint: EndpointInnerRef, call_id: String) -> Self {
        let nonce_timeout = endpoint.config.nonce_timeout;
        Call {
            call_id,
            endpoint,
            next_id: 1,
            transactions: Vec::new(),
            dialogs: Vec::new(),
            forks: Vec::new(),
            provisionals: HashMap::new(),
            nonces: NonceCache::new(nonce_timeout),
            dests: HashMap::new(),
            hibernate: false,
            check_timer: 0,
        }
    }

    pub(crate) async fn run(
        endpoint: EndpointInnerRef,
        call_id: String,
        mut mailbox: UnboundedReceiver<WorkItem>,
    ) {
        let mut call = Call::new(endpoint.clone(), call_id.clone());
        call.check_timer = call.start_timer(
            TimerTag::CheckCall,
            0,
            endpoint.config.trans_timeout,
        );
        debug!(call_id = %call.call_id, "call started");

        while let Some(item) = mailbox.recv().await {
            let crashed = matches!(item, WorkItem::Crash);
            if crashed {
                warn!(call_id = %call.call_id, "call crashed on request");
                call.crash_reply();
            } else if let Err(e) = call.process(item).await {
                debug!(call_id = %call.call_id, "work item error: {}", e);
            }
            if crashed || call.hibernate {
                break;
            }
        }

        call.shutdown();
        endpoint.router.remove(&call_id);
        debug!(call_id = %call.call_id, "call finished");
    }

    /// Fatal teardown: every in-flight caller gets a 500 before the
    /// actor disappears.
    fn crash_reply(&mut self) {
        for tx in self.transactions.iter() {
            if let TransactionUser::Caller(sender) = &tx.from {
                let resp = make_response(
                    &tx.request,
                    StatusCode::ServerInternalError,
                    None,
                    Some("Internal Error"),
                );
                sender.send(UacEvent::Final(resp)).ok();
            }
        }
    }

    fn shutdown(&mut self) {
        let endpoint = self.endpoint.clone();
        endpoint.timers.cancel(self.check_timer);
        for tx in self.transactions.iter_mut() {
            for slot in [
                tx.timeout_timer.take(),
                tx.retrans_timer.take(),
                tx.expire_timer.take(),
            ]
            .into_iter()
            .flatten()
            {
                endpoint.timers.cancel(slot);
            }
        }
        for dialog in self.dialogs.iter_mut() {
            if let Some(slot) = dialog.refresh_timer.take() {
                endpoint.timers.cancel(slot);
            }
            for sub in dialog.subscriptions.iter_mut() {
                if let Some(slot) = sub.expire_timer.take() {
                    endpoint.timers.cancel(slot);
                }
            }
        }
    }

    async fn process(&mut self, item: WorkItem) -> Result<()> {
        match item {
            WorkItem::SendRequest {
                request,
                opts,
                reply,
                assigned,
            } => self.send_request(request, opts, reply, assigned).await,
            WorkItem::SendInDialog {
                dialog,
                method,
                opts,
                reply,
            } => self.send_in_dialog(dialog, method, opts, reply).await,
            WorkItem::SendCancel { request_id, reply } => {
                let result = self.uac_cancel(request_id).await;
                reply.send(result).ok();
                Ok(())
            }
            WorkItem::SendReply {
                transaction_id,
                reply,
            } => match self.transaction_index(transaction_id) {
                Some(idx) => self.uas_reply(idx, reply).await,
                None => Err(Error::CallError(format!(
                    "no transaction {}",
                    transaction_id
                ))),
            },
            WorkItem::Incoming(incoming) => self.incoming(incoming).await,
            WorkItem::ApplyToDialog { id, reply } => {
                reply.send(self.dialog_info(&id)).ok();
                Ok(())
            }
            WorkItem::ApplyToTransaction { id, reply } => {
                reply.send(self.transaction_info(id)).ok();
                Ok(())
            }
            WorkItem::ApplyToMessage { id, reply } => {
                let request = self
                    .transaction_index(id)
                    .map(|idx| self.transactions[idx].request.clone());
                reply.send(request).ok();
                Ok(())
            }
            WorkItem::StopDialog { id } => {
                self.dialog_stop(&id).await;
                Ok(())
            }
            WorkItem::Info { reply } => {
                reply
                    .send(CallInfo {
                        call_id: self.call_id.clone(),
                        transactions: self.transactions.len(),
                        dialogs: self.dialogs.len(),
                        forks: self.forks.len(),
                        nonces: self.nonces.len(),
                    })
                    .ok();
                Ok(())
            }
            WorkItem::Timer(timer) => self.timer(timer).await,
            WorkItem::Crash => Ok(()),
        }
    }

    // ---- outbound work -------------------------------------------------

    async fn send_request(
        &mut self,
        mut request: Request,
        opts: RequestOpts,
        reply: UacSender,
        assigned: Option<oneshot::Sender<u32>>,
    ) -> Result<()> {
        if let Err(e) = self.prepare_uac_request(&mut request, &opts) {
            warn!(call_id = %self.call_id, "invalid request: {}", e);
            let resp = make_response(&request, StatusCode::ServerInternalError, None, None);
            reply.send(UacEvent::Final(resp)).ok();
            return Err(e);
        }
        let key = TransactionKey::from_request(&request, TransactionRole::Uac)?;
        let id = self.next_id();
        if let Some(assigned) = assigned {
            assigned.send(id).ok();
        }
        let tx = Transaction::new(
            id,
            TransactionRole::Uac,
            key,
            request,
            opts,
            TransactionUser::Caller(reply),
        );
        let idx = self.insert_transaction(tx);
        self.uac_send(idx).await;
        Ok(())
    }

    async fn send_in_dialog(
        &mut self,
        dialog_id: DialogId,
        method: Method,
        opts: RequestOpts,
        reply: UacSender,
    ) -> Result<()> {
        let request = match self.dialog_make_request(&dialog_id, method, &opts) {
            Ok(request) => request,
            Err(e) => {
                warn!(call_id = %self.call_id, dialog = %dialog_id, "in-dialog build failed: {}", e);
                return Err(e);
            }
        };
        self.send_request(request, opts, reply, None).await
    }

    // ---- inbound work --------------------------------------------------

    async fn incoming(&mut self, incoming: IncomingMessage) -> Result<()> {
        match incoming.message {
            SipMessage::Request(request) => {
                trace!(call_id = %self.call_id, method = %request.method, "request received");
                self.uas_request(request, incoming.connection, incoming.source)
                    .await
            }
            SipMessage::Response(response) => {
                trace!(call_id = %self.call_id, code = %response.status_code, "response received");
                self.uac_response(response).await
            }
        }
    }

    // ---- timer dispatch ------------------------------------------------

    async fn timer(&mut self, timer: CallTimer) -> Result<()> {
        match timer.tag {
            TimerTag::CheckCall => {
                if timer.task_id == self.check_timer {
                    self.check_call().await;
                }
                Ok(())
            }
            TimerTag::DialogRefresh | TimerTag::SubExpire => self.dialog_timer(timer).await,
            TimerTag::TimerA
            | TimerTag::TimerB
            | TimerTag::TimerC
            | TimerTag::TimerD
            | TimerTag::TimerE
            | TimerTag::TimerF
            | TimerTag::TimerK
            | TimerTag::TimerM
            | TimerTag::Expire => self.uac_timer(timer).await,
            TimerTag::TimerG
            | TimerTag::TimerH
            | TimerTag::TimerI
            | TimerTag::TimerJ
            | TimerTag::TimerL => self.uas_timer(timer).await,
        }
    }

    /// Periodic sweep: drop transactions and forks older than
    /// 2*trans_timeout, dialogs untouched past 2*dialog_timeout,
    /// expired nonces. Rearms itself; the call hibernates when empty.
    async fn check_call(&mut self) {
        let now = Instant::now();
        let trans_horizon = self.endpoint.config.trans_timeout * 2;
        let dialog_horizon = self.endpoint.config.dialog_timeout * 2;
        let endpoint = self.endpoint.clone();
        let call_id = self.call_id.clone();

        self.transactions.retain_mut(|tx| {
            let keep = now.duration_since(tx.touched) < trans_horizon;
            if !keep {
                info!(call_id = %call_id, key = %tx.key, "transaction dropped by check_call");
                for slot in [
                    tx.timeout_timer.take(),
                    tx.retrans_timer.take(),
                    tx.expire_timer.take(),
                ]
                .into_iter()
                .flatten()
                {
                    endpoint.timers.cancel(slot);
                }
            }
            keep
        });
        self.forks
            .retain(|fork| now.duration_since(fork.started) < trans_horizon);
        self.dialogs.retain_mut(|dialog| {
            let keep = now.duration_since(dialog.touched) < dialog_horizon;
            if !keep {
                if let Some(slot) = dialog.refresh_timer.take() {
                    endpoint.timers.cancel(slot);
                }
            }
            keep
        });
        self.nonces.sweep(now);

        if self.transactions.is_empty() && self.dialogs.is_empty() && self.forks.is_empty() {
            self.hibernate = true;
        } else {
            self.check_timer =
                self.start_timer(TimerTag::CheckCall, 0, self.endpoint.config.trans_timeout);
        }
    }

    // ---- bookkeeping ---------------------------------------------------

    pub(crate) fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Insert at the front: the transaction list is kept most
    /// recently touched first.
    pub(crate) fn insert_transaction(&mut self, tx: Transaction) -> usize {
        self.transactions.insert(0, tx);
        0
    }

    pub(crate) fn transaction_index(&self, id: u32) -> Option<usize> {
        self.transactions.iter().position(|tx| tx.id == id)
    }

    pub(crate) fn find_by_key(&self, key: &TransactionKey) -> Option<usize> {
        self.transactions.iter().position(|tx| &tx.key == key)
    }

    pub(crate) fn remove_transaction(&mut self, id: u32) {
        let endpoint = self.endpoint.clone();
        if let Some(idx) = self.transaction_index(id) {
            let tx = &mut self.transactions[idx];
            for slot in [
                tx.timeout_timer.take(),
                tx.retrans_timer.take(),
                tx.expire_timer.take(),
            ]
            .into_iter()
            .flatten()
            {
                endpoint.timers.cancel(slot);
            }
            self.provisionals.remove(&id);
            self.transactions.remove(idx);
        }
    }

    fn transaction_info(&self, id: u32) -> Option<TransactionInfo> {
        let idx = self.transaction_index(id)?;
        let tx = &self.transactions[idx];
        Some(TransactionInfo {
            id: tx.id,
            role: tx.role,
            method: tx.method.clone(),
            status: tx.status,
            fork: tx.from.fork_id(),
            last_response: tx
                .response
                .as_ref()
                .map(|r| u16::from(r.status_code.clone())),
        })
    }

    fn dialog_info(&self, id: &DialogId) -> Option<DialogInfo> {
        let dialog = self.dialogs.iter().find(|d| &d.id == id)?;
        Some(DialogInfo {
            id: dialog.id.clone(),
            invite_status: dialog.invite_status,
            local_seq: dialog.local_seq,
            remote_seq: dialog.remote_seq,
            route_set: dialog
                .route_set
                .iter()
                .filter_map(|route| route.clone().into_typed().ok())
                .flat_map(|route| route.uris().iter().map(|u| u.uri.clone()).collect::<Vec<_>>())
                .collect(),
            subscriptions: dialog.subscriptions.len(),
        })
    }

    // ---- timers --------------------------------------------------------

    pub(crate) fn start_timer(&self, tag: TimerTag, subject: u32, duration: Duration) -> u64 {
        let call_id = self.call_id.clone();
        self.endpoint.timers.schedule(duration, move |task_id| CallTimer {
            call_id,
            tag,
            subject,
            task_id,
        })
    }

    // ---- transport -----------------------------------------------------

    /// Serialize a message out: over the pinned connection when one
    /// is given, else over a pooled connection towards `dest`.
    pub(crate) async fn transport_send(
        &self,
        handle: Option<TransportHandle>,
        dest: Option<&SipAddr>,
        msg: SipMessage,
    ) -> Result<(TransportHandle, bool)> {
        let pool = &self.endpoint.pool;
        let handle = match handle {
            Some(handle) => {
                if !pool.is_alive(handle) {
                    return Err(Error::FlowFailed);
                }
                handle
            }
            None => {
                let by_remote = dest.and_then(|d| pool.lookup_remote(d));
                match by_remote.or_else(|| pool.any()) {
                    Some(handle) => handle,
                    None => {
                        return Err(Error::TransportError(
                            "no connection".to_string(),
                            dest.cloned().unwrap_or_default(),
                        ))
                    }
                }
            }
        };
        let conn = pool
            .get(handle)
            .ok_or(Error::FlowFailed)?;
        let reliable = conn.is_reliable();
        conn.send(msg, dest).await?;
        Ok((handle, reliable))
    }

    /// Next-hop address of a request: top Route when present, then
    /// the cached per-dialog source (reversed-dialog routing), then
    /// the request URI.
    pub(crate) fn request_destination(&self, request: &Request) -> Result<SipAddr> {
        if let Some(route) = request.route_header() {
            if let Some(first) = route
                .typed()
                .ok()
                .and_then(|r| r.uris().first().cloned())
            {
                return SipAddr::try_from(&first.uri);
            }
        }
        let to_tag = request
            .to_header()
            .ok()
            .and_then(|to| to.tag().ok())
            .flatten();
        if let Some(tag) = to_tag {
            if let Some(cached) = self.dests.get(tag.value()) {
                return Ok(cached.clone());
            }
        }
        SipAddr::try_from(&request.uri)
    }
}
