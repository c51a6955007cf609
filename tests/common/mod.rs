//! Common test utilities: two in-process gateways joined by a loopback network

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use as2_gateway::as2::{
    classify_response, As2Transport, AsyncMdnConfig, AsyncMdnDispatcher, InboundReceiver,
    OutboundRequest, ReceiverConfig, RoutingTable, TransportError, TransportResult,
};
use as2_gateway::crypto::{
    issue_certificate, CertificateTemplate, EncryptionKeyPair, InMemoryKeyStore, SigningKeyPair,
};
use as2_gateway::domain::{
    Certificate, CertificateOwner, MdnMode, Partner, PartnerCryptoConfig, PartnerSpec, Priority,
    RetryPolicy, SubmitRequest,
};
use as2_gateway::engine::{Clock, EngineConfig, ManualClock, PartnerRegistry, TransmissionEngine};
use as2_gateway::infra::{AcceptAllValidator, As2Error, LoggingRouter, SqliteAuditLog, SqliteStore};
use as2_gateway::server::AppState;

/// How the loopback network treats outbound AS2 POSTs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    Up,
    /// Every send times out
    Timeout,
    /// Every send is refused
    Down,
}

/// In-process transport routing AS2 POSTs to receivers and async MDNs to
/// engines, keyed by URL
pub struct LoopbackNetwork {
    receivers: RwLock<HashMap<String, Arc<InboundReceiver>>>,
    mdn_endpoints: RwLock<HashMap<String, Arc<TransmissionEngine>>>,
    mode: Mutex<LinkMode>,
    last_request: Mutex<Option<OutboundRequest>>,
    pub sends: AtomicUsize,
    pub mdn_deliveries: AtomicUsize,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            receivers: RwLock::new(HashMap::new()),
            mdn_endpoints: RwLock::new(HashMap::new()),
            mode: Mutex::new(LinkMode::Up),
            last_request: Mutex::new(None),
            sends: AtomicUsize::new(0),
            mdn_deliveries: AtomicUsize::new(0),
        })
    }

    pub fn set_mode(&self, mode: LinkMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn last_request(&self) -> Option<OutboundRequest> {
        self.last_request.lock().unwrap().clone()
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    fn attach(&self, gateway: &Gateway) {
        self.receivers
            .write()
            .unwrap()
            .insert(gateway.endpoint_url(), gateway.receiver.clone());
        self.mdn_endpoints
            .write()
            .unwrap()
            .insert(gateway.mdn_url(), gateway.engine.clone());
    }
}

#[async_trait]
impl As2Transport for LoopbackNetwork {
    async fn send(
        &self,
        request: OutboundRequest,
        deadline: Duration,
    ) -> Result<TransportResult, TransportError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());

        let mode = *self.mode.lock().unwrap();
        match mode {
            LinkMode::Timeout => return Err(TransportError::Timeout(deadline)),
            LinkMode::Down => {
                return Err(TransportError::Connection("connection refused".to_string()))
            }
            LinkMode::Up => {}
        }

        let receiver = self
            .receivers
            .read()
            .unwrap()
            .get(&request.url)
            .cloned()
            .ok_or_else(|| TransportError::Connection(format!("no route to {}", request.url)))?;

        let pairs = request.headers.to_pairs();
        let outcome = receiver
            .receive(pairs.iter().map(|(k, v)| (*k, v.as_str())), &request.body)
            .await
            .map_err(|e| TransportError::Http {
                status: 500,
                body: e.to_string(),
            })?;

        if outcome.http_status >= 300 {
            return Err(TransportError::Http {
                status: outcome.http_status,
                body: String::new(),
            });
        }
        Ok(classify_response(
            outcome.http_status,
            outcome.mdn_body.unwrap_or_default(),
            request.expects_async_mdn(),
        ))
    }

    async fn deliver_mdn(
        &self,
        url: String,
        _headers: Vec<(String, String)>,
        body: Vec<u8>,
        _deadline: Duration,
    ) -> Result<u16, TransportError> {
        self.mdn_deliveries.fetch_add(1, Ordering::SeqCst);
        let engine = self
            .mdn_endpoints
            .read()
            .unwrap()
            .get(&url)
            .cloned()
            .ok_or_else(|| TransportError::Connection(format!("no route to {url}")))?;

        Ok(match engine.receive_async_mdn(&body).await {
            Ok(_) => 200,
            Err(As2Error::MessageBusy(_)) => 503,
            Err(As2Error::InvalidStateTransition { .. }) => 409,
            Err(_) => 400,
        })
    }
}

/// One gateway instance with its own store, keys and clock
pub struct Gateway {
    pub as2_id: String,
    pub store: SqliteStore,
    pub clock: Arc<ManualClock>,
    pub keys: Arc<InMemoryKeyStore>,
    pub signing: SigningKeyPair,
    pub encryption: EncryptionKeyPair,
    pub own_cert: Certificate,
    pub engine: Arc<TransmissionEngine>,
    pub receiver: Arc<InboundReceiver>,
    pub dispatcher: Arc<AsyncMdnDispatcher>,
    pub registry: Arc<PartnerRegistry>,
    pub audit_log: Arc<SqliteAuditLog>,
}

impl Gateway {
    pub async fn start(as2_id: &str, network: Arc<LoopbackNetwork>, now: DateTime<Utc>) -> Self {
        let store = SqliteStore::in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::new(now));
        let keys = Arc::new(InMemoryKeyStore::new());
        let audit_log = Arc::new(SqliteAuditLog::new(store.pool().clone()));

        let signing = SigningKeyPair::generate();
        let encryption = EncryptionKeyPair::generate();
        let serial = format!("{as2_id}-1");
        let own_cert = issue_certificate(
            CertificateTemplate {
                serial: serial.clone(),
                subject_dn: format!("CN={as2_id}"),
                issuer_dn: format!("CN={as2_id}"),
                valid_from: now - chrono::Duration::days(1),
                valid_to: now + chrono::Duration::days(365),
                owner: CertificateOwner::Own,
            },
            Some(&encryption),
            Some(&signing),
            now,
        )
        .unwrap();
        store.insert_certificate(&own_cert).await.unwrap();
        keys.insert_signing(serial.clone(), signing.clone()).await;
        keys.insert_encryption(serial, encryption.clone()).await;

        let mut config = EngineConfig::new(as2_id);
        config.async_mdn_url = Some(mdn_url(as2_id));

        let engine = Arc::new(
            TransmissionEngine::new(
                store.clone(),
                Arc::new(store.clone()),
                keys.clone(),
                network.clone(),
                audit_log.clone(),
                config.clone(),
            )
            .with_clock(clock.clone()),
        );
        let receiver = Arc::new(
            InboundReceiver::new(
                store.clone(),
                Arc::new(store.clone()),
                keys.clone(),
                Arc::new(AcceptAllValidator),
                Arc::new(LoggingRouter),
                audit_log.clone(),
                RoutingTable::new(Vec::new()).with_default("edi-inbox"),
                ReceiverConfig {
                    own_as2_id: config.own_as2_id.clone(),
                    message_id_host: config.message_id_host.clone(),
                    policy: config.policy.clone(),
                },
            )
            .with_clock(clock.clone()),
        );
        let dispatcher = Arc::new(
            AsyncMdnDispatcher::new(
                store.clone(),
                network.clone(),
                audit_log.clone(),
                AsyncMdnConfig::new(as2_id),
            )
            .with_clock(clock.clone()),
        );
        let registry = Arc::new(
            PartnerRegistry::new(store.clone(), audit_log.clone()).with_clock(clock.clone()),
        );

        let gateway = Self {
            as2_id: as2_id.to_string(),
            store,
            clock,
            keys,
            signing,
            encryption,
            own_cert,
            engine,
            receiver,
            dispatcher,
            registry,
            audit_log,
        };
        network.attach(&gateway);
        gateway
    }

    pub fn endpoint_url(&self) -> String {
        endpoint_url(&self.as2_id)
    }

    pub fn mdn_url(&self) -> String {
        mdn_url(&self.as2_id)
    }

    /// Register `other` as a trading partner using its current certificate
    pub async fn add_partner(&self, other: &Gateway, mdn_mode: MdnMode) -> Partner {
        let now = self.clock.now();
        let partner = PartnerSpec {
            as2_id: other.as2_id.clone(),
            name: format!("{} Corp", other.as2_id),
            endpoint_url: other.endpoint_url(),
            encryption_cert_serial: other.own_cert.serial.clone(),
            signing_cert_serial: other.own_cert.serial.clone(),
            crypto: PartnerCryptoConfig::default(),
            mdn_mode,
            mdn_timeout_secs: 60,
            retry_policy: RetryPolicy {
                max_retries: 3,
                retry_interval_minutes: 5,
            },
            business_ack_expected: false,
            business_ack_sla_minutes: 60,
        }
        .into_partner(now);

        let mut cert = other.own_cert.clone();
        cert.owner = CertificateOwner::Partner(partner.id);
        self.store.insert_certificate(&cert).await.unwrap();
        self.store.insert_partner(&partner).await.unwrap();
        partner
    }

    pub async fn partner(&self, as2_id: &str) -> Partner {
        self.store
            .get_partner_by_as2_id(as2_id)
            .await
            .unwrap()
            .unwrap()
    }

    /// Admin API state for this gateway
    pub fn app_state(&self) -> AppState {
        AppState {
            store: self.store.clone(),
            engine: self.engine.clone(),
            receiver: self.receiver.clone(),
            registry: self.registry.clone(),
            audit_log: self.audit_log.clone(),
            worker: None,
        }
    }
}

pub fn endpoint_url(as2_id: &str) -> String {
    format!("http://{}.test/as2", as2_id.to_ascii_lowercase())
}

pub fn mdn_url(as2_id: &str) -> String {
    format!("http://{}.test/as2/mdn", as2_id.to_ascii_lowercase())
}

/// Two gateways that know each other, sharing one network and start time
pub struct Pair {
    pub network: Arc<LoopbackNetwork>,
    pub sender: Gateway,
    pub receiver: Gateway,
    pub partner: Partner,
}

impl Pair {
    pub async fn new(mdn_mode: MdnMode) -> Self {
        let network = LoopbackNetwork::new();
        let now = Utc::now();
        let sender = Gateway::start("ACME", network.clone(), now).await;
        let receiver = Gateway::start("GLOBEX", network.clone(), now).await;

        let partner = sender.add_partner(&receiver, mdn_mode).await;
        receiver.add_partner(&sender, mdn_mode).await;

        Self {
            network,
            sender,
            receiver,
            partner,
        }
    }

    pub fn invoice(&self) -> SubmitRequest {
        SubmitRequest {
            partner_id: self.partner.id,
            payload: b"ISA*00*          *00*          *ZZ*ACME*ZZ*GLOBEX~".to_vec(),
            content_type: "application/edi-x12".to_string(),
            subject: "Invoice 1001".to_string(),
            priority: Priority::Normal,
        }
    }

    /// Move both clocks forward together
    pub fn advance(&self, by: chrono::Duration) {
        self.sender.clock.advance(by);
        self.receiver.clock.advance(by);
    }
}
