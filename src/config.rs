use std::time::Duration;

/// Optional behaviours a service can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plugin {
    /// RFC 5626 flow management: flow tokens in Record-Route/Path,
    /// `ob` Contact decoration, flow-failure detection.
    Outbound,
    /// Contact binding store with reg-id/instance-id indexing.
    Registrar,
}

/// Per-service configuration, snapshotted into every call actor at
/// spawn time. Immutable once the endpoint is built.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub user_agent: String,
    /// Default local identity for requests built by the endpoint.
    pub from: String,
    /// Listener specs, e.g. `<sip:all:5060;transport=udp>`. Consumed
    /// by the transport component, carried here verbatim.
    pub listen: Vec<String>,
    /// Default timeout for synchronous work submitted via the router.
    pub sync_call_time: Duration,
    /// Hard cap on concurrent call actors.
    pub max_calls: usize,
    /// Shard count of the (service, call-id) router, 1..=127.
    pub msg_routers: usize,
    pub sip_timer_t1: Duration,
    pub sip_timer_t2: Duration,
    pub sip_timer_t4: Duration,
    /// Proxy INVITE "no final response" horizon (Timer C).
    pub sip_timer_c: Duration,
    /// Transaction GC horizon; `check_call` drops transactions and
    /// forks older than twice this.
    pub trans_timeout: Duration,
    /// Dialog GC horizon; untouched dialogs are dropped after twice this.
    pub dialog_timeout: Duration,
    /// Suppress the automatic 100 Trying on INVITE UAS entry.
    pub no_100: bool,
    /// Digest nonce lifetime.
    pub nonce_timeout: Duration,
    pub plugins: Vec<Plugin>,
    /// UA instance UUID for `+sip.instance`.
    pub instance_id: Option<String>,
    /// When set, REGISTER Contacts get a `reg-id` parameter.
    pub reg_id: Option<u32>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            name: "sipflow".to_string(),
            user_agent: "sipflow/0.1".to_string(),
            from: "sip:sipflow@localhost".to_string(),
            listen: vec![],
            sync_call_time: Duration::from_secs(30),
            max_calls: 100_000,
            msg_routers: 16,
            sip_timer_t1: Duration::from_millis(500),
            sip_timer_t2: Duration::from_secs(4),
            sip_timer_t4: Duration::from_secs(5),
            sip_timer_c: Duration::from_secs(180),
            trans_timeout: Duration::from_secs(900),
            dialog_timeout: Duration::from_secs(1800),
            no_100: false,
            nonce_timeout: Duration::from_secs(30),
            plugins: vec![],
            instance_id: None,
            reg_id: None,
        }
    }
}

impl ServiceConfig {
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_from(mut self, from: &str) -> Self {
        self.from = from.to_string();
        self
    }

    pub fn with_timer_t1(mut self, t1: Duration) -> Self {
        self.sip_timer_t1 = t1;
        self
    }

    pub fn with_timer_c(mut self, tc: Duration) -> Self {
        self.sip_timer_c = tc;
        self
    }

    pub fn with_msg_routers(mut self, shards: usize) -> Self {
        self.msg_routers = shards.clamp(1, 127);
        self
    }

    pub fn with_max_calls(mut self, max_calls: usize) -> Self {
        self.max_calls = max_calls;
        self
    }

    pub fn with_plugin(mut self, plugin: Plugin) -> Self {
        if !self.plugins.contains(&plugin) {
            self.plugins.push(plugin);
        }
        self
    }

    pub fn with_no_100(mut self) -> Self {
        self.no_100 = true;
        self
    }

    pub fn with_nonce_timeout(mut self, timeout: Duration) -> Self {
        self.nonce_timeout = timeout;
        self
    }

    pub fn with_instance_id(mut self, instance_id: &str) -> Self {
        self.instance_id = Some(instance_id.to_string());
        self
    }

    pub fn with_reg_id(mut self, reg_id: u32) -> Self {
        self.reg_id = Some(reg_id);
        self
    }

    pub fn has_plugin(&self, plugin: Plugin) -> bool {
        self.plugins.contains(&plugin)
    }

    /// INVITE/non-INVITE transaction timeout, 64*T1.
    pub fn timer_b(&self) -> Duration {
        self.sip_timer_t1 * 64
    }
}
