//! The UAS route pipeline (authorize -> route -> dispatch) and the
//! stateless/strict proxy paths.

use crate::auth;
use crate::call::Call;
use crate::config::Plugin;
use crate::rsip_ext::RsipHeadersExt;
use crate::service::{AuthorizeData, AuthorizeReply, ProcessReply, RouteReply, SipReply};
use crate::transaction::{random_text, RequestOpts, BRANCH_LEN};
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, Method, Request, StatusCode};
use tracing::{debug, info, warn};

impl Call {
    /// Every UAS request that is not a CANCEL or ACK goes through
    /// here: authorize, route, dispatch.
    pub(crate) async fn route_pipeline(&mut self, idx: usize) -> Result<()> {
        let (request, source) = {
            let tx = &self.transactions[idx];
            (tx.request.clone(), tx.source.clone())
        };

        // 1. authorize
        let source_ip = source
            .as_ref()
            .and_then(|addr| addr.get_socketaddr().ok())
            .map(|socket| socket.ip());
        let service = self.endpoint.service.clone();
        let opaque = auth::opaque_for(&self.endpoint.config.name);
        let digest = auth::check_digest(&request, source_ip, &self.nonces, &opaque, |user, realm| {
            service.sip_get_user_pass(user, realm, &request)
        });
        let dialog_authorized = self.dialog_source_authorized(&request, source.as_ref());
        let auth_data = AuthorizeData {
            source: source.clone().unwrap_or_default(),
            digest,
            dialog_authorized,
        };

        match service.sip_authorize(&auth_data, &request) {
            AuthorizeReply::Ok => {
                // remember the source for the rest of the dialog
                if let Some(source) = source.as_ref() {
                    self.dialog_authorize_source(&request, source);
                }
            }
            AuthorizeReply::Forbidden => {
                info!(call_id = %self.call_id, "request forbidden");
                return self
                    .uas_reply(idx, SipReply::new(StatusCode::Forbidden))
                    .await;
            }
            AuthorizeReply::Authenticate { realm } => {
                let reply = self.make_auth_challenge(false, realm, source_ip);
                return self.uas_reply(idx, reply).await;
            }
            AuthorizeReply::ProxyAuthenticate { realm } => {
                let reply = self.make_auth_challenge(true, realm, source_ip);
                return self.uas_reply(idx, reply).await;
            }
        }

        // 2. route
        let uri = request.uri.clone();
        let user = uri
            .auth
            .as_ref()
            .map(|auth| auth.user.clone())
            .unwrap_or_default();
        let host = uri.host_with_port.host.to_string();
        let route = service.sip_route(uri.scheme.as_ref(), &user, &host, &request);

        // 3. dispatch
        match route {
            RouteReply::Reply(reply) => self.uas_reply(idx, reply).await,
            RouteReply::ReplyStateless(reply) => {
                let (connection, source) = self.uas_stateless_parts(idx);
                if let (Some(connection), Some(source)) = (connection, source) {
                    self.reply_stateless(&request, reply, connection, &source)
                        .await?;
                }
                let tx_id = self.transactions[idx].id;
                self.remove_transaction(tx_id);
                Ok(())
            }
            RouteReply::Process => self.dispatch(idx).await,
            RouteReply::ProcessStateless => {
                if request.method == Method::Invite {
                    warn!(call_id = %self.call_id, "stateless INVITE processing refused");
                    return self
                        .uas_reply(
                            idx,
                            SipReply::new(StatusCode::ServerInternalError)
                                .with_reason("Invalid Service Response"),
                        )
                        .await;
                }
                self.dispatch(idx).await?;
                let tx_id = self.transactions[idx].id;
                self.remove_transaction(tx_id);
                Ok(())
            }
            RouteReply::Proxy { uriset, opts } => self.fork_start(idx, uriset, opts).await,
            RouteReply::ProxyStateless { uris, opts } => {
                let target = uris.into_iter().next();
                let tx_id = self.transactions[idx].id;
                self.remove_transaction(tx_id);
                self.proxy_stateless(request, target, &opts).await
            }
            RouteReply::StrictProxy { opts } => {
                let tx_id = self.transactions[idx].id;
                self.remove_transaction(tx_id);
                self.strict_proxy(request, &opts).await
            }
        }
    }

    fn uas_stateless_parts(
        &self,
        idx: usize,
    ) -> (
        Option<crate::transport::TransportHandle>,
        Option<crate::transport::SipAddr>,
    ) {
        let tx = &self.transactions[idx];
        (tx.connection, tx.source.clone())
    }

    fn make_auth_challenge(
        &mut self,
        proxy: bool,
        realm: Option<String>,
        source_ip: Option<std::net::IpAddr>,
    ) -> SipReply {
        let realm = realm.unwrap_or_else(|| self.endpoint.config.name.clone());
        let nonce = self.nonces.issue(source_ip);
        let opaque = auth::opaque_for(&self.endpoint.config.name);
        let status = if proxy {
            StatusCode::ProxyAuthenticationRequired
        } else {
            StatusCode::Unauthorized
        };
        SipReply::new(status).with_header(auth::challenge(proxy, &realm, nonce, opaque))
    }

    fn dialog_source_authorized(
        &self,
        request: &Request,
        source: Option<&crate::transport::SipAddr>,
    ) -> bool {
        let source = match source {
            Some(source) => source,
            None => return false,
        };
        crate::dialog::DialogId::try_from(request)
            .ok()
            .and_then(|id| self.dialog_find(&id))
            .map(|idx| self.dialogs[idx].authorized.contains(source))
            .unwrap_or(false)
    }

    fn dialog_authorize_source(&mut self, request: &Request, source: &crate::transport::SipAddr) {
        let has_to_tag = request
            .to_header()
            .ok()
            .and_then(|to| to.tag().ok())
            .flatten()
            .is_some();
        if !has_to_tag {
            return;
        }
        if let Some(idx) = crate::dialog::DialogId::try_from(request)
            .ok()
            .and_then(|id| self.dialog_find(&id))
        {
            let dialog = &mut self.dialogs[idx];
            if !dialog.authorized.contains(source) {
                dialog.authorized.push(source.clone());
            }
        }
    }

    /// `process` routing: the engine's own handlers plus the
    /// application's `sip_process`.
    async fn dispatch(&mut self, idx: usize) -> Result<()> {
        let request = self.transactions[idx].request.clone();
        let method = request.method.clone();

        if method == Method::Register {
            if !self.endpoint.config.has_plugin(Plugin::Registrar) {
                return self
                    .uas_reply(idx, SipReply::new(StatusCode::MethodNotAllowed))
                    .await;
            }
            let connection = self.transactions[idx].connection.ok_or_else(|| {
                Error::CallError("no connection for REGISTER".to_string())
            })?;
            let reply = self.endpoint.registrar.process_register(
                &self.endpoint.config,
                &self.endpoint.pool,
                &request,
                connection,
            );
            return self.uas_reply(idx, reply).await;
        }

        let in_dialog = request
            .to_header()
            .ok()
            .and_then(|to| to.tag().ok())
            .flatten()
            .is_some();
        if in_dialog {
            return self.dialog_uas_request(idx).await;
        }

        match self.endpoint.service.sip_process(&request) {
            ProcessReply::Reply(reply) => self.uas_reply(idx, reply).await,
            ProcessReply::NoReply => {
                let reply = match method {
                    Method::Options => SipReply::new(StatusCode::OK),
                    Method::Invite => SipReply::new(StatusCode::Decline),
                    Method::Bye => SipReply::new(StatusCode::CallTransactionDoesNotExist),
                    Method::Subscribe => SipReply::new(StatusCode::OK),
                    Method::Message | Method::Info => SipReply::new(StatusCode::OK),
                    _ => SipReply::new(StatusCode::MethodNotAllowed),
                };
                self.uas_reply(idx, reply).await
            }
        }
    }

    /// Forward with no fork state: Via push, Max-Forwards decrement,
    /// nothing remembered.
    pub(crate) async fn proxy_stateless(
        &mut self,
        mut request: Request,
        target: Option<rsip::Uri>,
        _opts: &RequestOpts,
    ) -> Result<()> {
        if let Some(target) = target {
            request.uri = target;
        }
        if !self.proxy_decrement_max_forwards(&mut request) {
            return Err(Error::CallError("too many hops".to_string()));
        }

        let local = self.local_via_addr();
        let transport = local
            .r#type
            .map(|t| t.to_string().to_uppercase())
            .unwrap_or_else(|| "UDP".to_string());
        // deterministic branch so retransmissions keep the same key
        let upstream_branch = request
            .via_header()
            .ok()
            .and_then(|via| via.typed().ok())
            .and_then(|via| via.branch().map(|branch| branch.to_string()))
            .unwrap_or_else(|| random_text(BRANCH_LEN));
        let branch = format!(
            "z9hG4bK{}",
            crate::auth::md5_hex(upstream_branch.as_bytes())
        );
        request.headers.push_front(Header::Via(
            format!("SIP/2.0/{} {};branch={}", transport, local.addr, branch).into(),
        ));

        let dest = self.request_destination(&request)?;
        debug!(call_id = %self.call_id, dest = %dest, "stateless forward");
        self.transport_send(None, Some(&dest), request.into())
            .await
            .map(|_| ())
    }

    /// Strict-routing peer: the target is the top Route, the RURI
    /// stays untouched (RFC 3261 §16.12.1.2).
    pub(crate) async fn strict_proxy(
        &mut self,
        mut request: Request,
        opts: &RequestOpts,
    ) -> Result<()> {
        let top = request
            .route_header()
            .and_then(|route| route.typed().ok())
            .and_then(|route| route.uris().first().cloned());
        match top {
            Some(top) => {
                crate::header_pop!(request.headers, Header::Route);
                self.proxy_stateless(request, Some(top.uri), opts).await
            }
            None => Err(Error::Invalid("route")),
        }
    }

    fn proxy_decrement_max_forwards(&self, request: &mut Request) -> bool {
        let max_forwards = request
            .headers
            .iter()
            .find_map(|header| match header {
                Header::MaxForwards(mf) => mf.value().trim().parse::<u32>().ok(),
                _ => None,
            })
            .unwrap_or(70);
        if max_forwards == 0 {
            return false;
        }
        request
            .headers
            .retain(|header| !matches!(header, Header::MaxForwards(_)));
        request
            .headers
            .push(Header::MaxForwards((max_forwards - 1).into()));
        true
    }
}
