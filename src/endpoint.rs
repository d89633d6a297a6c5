//! The service endpoint: configuration, transport pool, timer pump
//! and the public request API, glued to the per-call actors by the
//! router.

use crate::call::{CallInfo, CallTimer, DialogInfo, TransactionInfo, WorkItem};
use crate::config::ServiceConfig;
use crate::dialog::DialogId;
use crate::registrar::Registrar;
use crate::router::{self, Router};
use crate::service::{DefaultService, SipService};
use crate::timer::Timer;
use crate::transaction::{make_call_id, make_tag, random_text, RequestOpts, UacReceiver};
use crate::transport::{IncomingMessage, SipConnection, TransportHandle, TransportPool};
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, UntypedHeader};
use rsip::{Header, Method, Request};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::select;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::info;

const TIMER_INTERVAL: Duration = Duration::from_millis(20);

pub struct EndpointInner {
    pub config: ServiceConfig,
    pub service: Arc<dyn SipService>,
    pub pool: TransportPool,
    pub timers: Timer<CallTimer>,
    pub router: Router,
    pub registrar: Registrar,
    /// Process-wide CSeq seed, touched only through `next_cseq`.
    pub cseq: AtomicU32,
    /// Stable per-endpoint id mixed into NkQ tokens.
    pub global_id: String,
    pub cancel_token: CancellationToken,
    timer_interval: Duration,
}

pub type EndpointInnerRef = Arc<EndpointInner>;

pub struct EndpointBuilder {
    config: ServiceConfig,
    service: Option<Arc<dyn SipService>>,
    cancel_token: Option<CancellationToken>,
    timer_interval: Option<Duration>,
}

/// Names a pending UAC request so it can be cancelled.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    pub call_id: String,
    pub request_id: u32,
}

pub struct Endpoint {
    pub inner: EndpointInnerRef,
    cancel_token: CancellationToken,
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointBuilder {
    pub fn new() -> Self {
        EndpointBuilder {
            config: ServiceConfig::default(),
            service: None,
            cancel_token: None,
            timer_interval: None,
        }
    }

    pub fn with_config(&mut self, config: ServiceConfig) -> &mut Self {
        self.config = config;
        self
    }

    pub fn with_service(&mut self, service: Arc<dyn SipService>) -> &mut Self {
        self.service.replace(service);
        self
    }

    pub fn with_cancel_token(&mut self, cancel_token: CancellationToken) -> &mut Self {
        self.cancel_token.replace(cancel_token);
        self
    }

    pub fn with_timer_interval(&mut self, timer_interval: Duration) -> &mut Self {
        self.timer_interval.replace(timer_interval);
        self
    }

    pub fn build(&mut self) -> Endpoint {
        let cancel_token = self.cancel_token.take().unwrap_or_default();
        let config = self.config.clone();
        let inner = Arc::new(EndpointInner {
            router: Router::new(config.msg_routers),
            registrar: Registrar::new(),
            pool: TransportPool::new(),
            timers: Timer::new(),
            service: self
                .service
                .take()
                .unwrap_or_else(|| Arc::new(DefaultService)),
            cseq: AtomicU32::new(rand::random::<u16>() as u32 + 1),
            global_id: random_text(16),
            cancel_token: cancel_token.child_token(),
            timer_interval: self.timer_interval.take().unwrap_or(TIMER_INTERVAL),
            config,
        });
        Endpoint {
            inner,
            cancel_token,
        }
    }
}

impl EndpointInner {
    pub fn next_cseq(&self) -> u32 {
        self.cseq.fetch_add(1, Ordering::Relaxed)
    }

    /// Build an out-of-dialog request with the service identity.
    pub fn make_request(&self, method: Method, uri: rsip::Uri) -> Result<Request> {
        let from = rsip::typed::From {
            display_name: None,
            uri: rsip::Uri::try_from(self.config.from.as_str())?,
            params: vec![],
        }
        .with_tag(make_tag());
        let to = rsip::typed::To {
            display_name: None,
            uri: uri.clone(),
            params: vec![],
        };
        let headers = vec![
            Header::CallId(make_call_id(None)),
            Header::From(from.into()),
            Header::To(to.into()),
            Header::CSeq(
                rsip::typed::CSeq {
                    seq: self.next_cseq(),
                    method: method.clone(),
                }
                .into(),
            ),
            Header::MaxForwards(70.into()),
            Header::UserAgent(self.config.user_agent.clone().into()),
        ];
        Ok(Request {
            method,
            uri,
            headers: headers.into(),
            version: rsip::Version::V2,
            body: vec![],
        })
    }

    pub(crate) async fn process_timer(&self) -> Result<()> {
        while !self.cancel_token.is_cancelled() {
            for timer in self.timers.poll(Instant::now()) {
                let call_id = timer.call_id.clone();
                self.router.deliver(&call_id, WorkItem::Timer(timer));
            }
            tokio::time::sleep(self.timer_interval).await;
        }
        Ok(())
    }
}

impl Endpoint {
    pub async fn serve(&self) {
        select! {
            _ = self.cancel_token.cancelled() => {
                info!("endpoint cancelled");
            },
            _ = self.inner.process_timer() => {
            }
        }
        info!("endpoint shutdown");
    }

    pub fn shutdown(&self) {
        info!("endpoint shutdown requested");
        self.cancel_token.cancel();
        self.inner.router.clear();
    }

    /// Register a connection with the shared pool.
    pub fn add_connection(&self, conn: SipConnection) -> TransportHandle {
        self.inner.pool.add(conn)
    }

    pub fn close_connection(&self, handle: TransportHandle) {
        self.inner.pool.close(handle);
    }

    pub fn registrar(&self) -> &Registrar {
        &self.inner.registrar
    }

    /// Feed a parsed inbound message into the engine; transports call
    /// this for every frame.
    pub fn inject(&self, incoming: IncomingMessage) -> Result<()> {
        self.inject_with_raw(incoming, &[])
    }

    pub fn inject_with_raw(&self, incoming: IncomingMessage, raw: &[u8]) -> Result<()> {
        self.inner
            .service
            .on_connection_recv(&incoming.message, raw);
        let call_id = match &incoming.message {
            rsip::SipMessage::Request(request) => request.call_id_header()?.value().to_string(),
            rsip::SipMessage::Response(response) => {
                response.call_id_header()?.value().to_string()
            }
        };
        router::send_work(&self.inner, &call_id, WorkItem::Incoming(incoming))
    }

    /// Build and send an out-of-dialog request; responses arrive on
    /// the returned receiver.
    pub async fn send_request(
        &self,
        method: Method,
        uri: rsip::Uri,
        opts: RequestOpts,
    ) -> Result<(RequestHandle, UacReceiver)> {
        let request = self.inner.make_request(method, uri)?;
        self.request(request, opts).await
    }

    /// Send a caller-built request.
    pub async fn request(
        &self,
        request: Request,
        opts: RequestOpts,
    ) -> Result<(RequestHandle, UacReceiver)> {
        let call_id = request.call_id_header()?.value().to_string();
        let (reply, receiver) = unbounded_channel();
        let (assigned, assigned_rx) = oneshot::channel();
        router::send_work(
            &self.inner,
            &call_id,
            WorkItem::SendRequest {
                request,
                opts,
                reply,
                assigned: Some(assigned),
            },
        )?;
        let request_id = tokio::time::timeout(self.inner.config.sync_call_time, assigned_rx)
            .await
            .map_err(|_| Error::CallError("call timeout".to_string()))?
            .map_err(|_| Error::ServiceNotStarted)?;
        Ok((
            RequestHandle {
                call_id,
                request_id,
            },
            receiver,
        ))
    }

    /// Send a request inside an established dialog.
    pub fn send_in_dialog(
        &self,
        dialog: DialogId,
        method: Method,
        opts: RequestOpts,
    ) -> Result<UacReceiver> {
        let call_id = dialog.call_id.clone();
        let (reply, receiver) = unbounded_channel();
        router::send_work(
            &self.inner,
            &call_id,
            WorkItem::SendInDialog {
                dialog,
                method,
                opts,
                reply,
            },
        )?;
        Ok(receiver)
    }

    /// CANCEL a pending INVITE; deferred until a provisional arrives
    /// when none has yet.
    pub async fn send_cancel(&self, handle: &RequestHandle) -> Result<()> {
        let (reply, receiver) = oneshot::channel();
        router::send_work(
            &self.inner,
            &handle.call_id,
            WorkItem::SendCancel {
                request_id: handle.request_id,
                reply,
            },
        )?;
        tokio::time::timeout(self.inner.config.sync_call_time, receiver)
            .await
            .map_err(|_| Error::CallError("call timeout".to_string()))?
            .map_err(|_| Error::ServiceNotStarted)?
    }

    /// Answer a UAS transaction asynchronously (the usual path is
    /// returning a reply from the service callbacks).
    pub fn send_reply(
        &self,
        call_id: &str,
        transaction_id: u32,
        reply: crate::service::SipReply,
    ) -> Result<()> {
        router::send_work(
            &self.inner,
            call_id,
            WorkItem::SendReply {
                transaction_id,
                reply,
            },
        )
    }

    pub fn stop_dialog(&self, dialog: DialogId) -> Result<()> {
        let call_id = dialog.call_id.clone();
        router::send_work(&self.inner, &call_id, WorkItem::StopDialog { id: dialog })
    }

    /// Read-only snapshot helpers; all of them run inside the call
    /// actor for consistency.
    pub async fn apply_to_transaction(
        &self,
        call_id: &str,
        id: u32,
    ) -> Result<Option<TransactionInfo>> {
        let (reply, receiver) = oneshot::channel();
        router::send_work(
            &self.inner,
            call_id,
            WorkItem::ApplyToTransaction { id, reply },
        )?;
        self.await_sync(receiver).await
    }

    pub async fn apply_to_dialog(
        &self,
        call_id: &str,
        id: DialogId,
    ) -> Result<Option<DialogInfo>> {
        let (reply, receiver) = oneshot::channel();
        router::send_work(&self.inner, call_id, WorkItem::ApplyToDialog { id, reply })?;
        self.await_sync(receiver).await
    }

    pub async fn apply_to_message(&self, call_id: &str, id: u32) -> Result<Option<Request>> {
        let (reply, receiver) = oneshot::channel();
        router::send_work(
            &self.inner,
            call_id,
            WorkItem::ApplyToMessage { id, reply },
        )?;
        self.await_sync(receiver).await
    }

    pub async fn call_info(&self, call_id: &str) -> Result<CallInfo> {
        let (reply, receiver) = oneshot::channel();
        router::send_work(&self.inner, call_id, WorkItem::Info { reply })?;
        self.await_sync(receiver).await
    }

    /// Test-only: kill a call actor from outside.
    pub fn crash_call(&self, call_id: &str) -> Result<()> {
        router::send_work(&self.inner, call_id, WorkItem::Crash)
    }

    async fn await_sync<T>(&self, receiver: oneshot::Receiver<T>) -> Result<T> {
        tokio::time::timeout(self.inner.config.sync_call_time, receiver)
            .await
            .map_err(|_| Error::CallError("call timeout".to_string()))?
            .map_err(|_| Error::ServiceNotStarted)
    }
}
