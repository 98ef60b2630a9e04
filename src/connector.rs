//! Wallet connection lifecycle
//!
//! [`WalletConnector`] owns the "is a wallet attached and usable" state:
//! it requests account access, reads and switches the active chain, pushes
//! account/chain change notifications, and keeps a persisted reconnection
//! hint. The hint is informational only and is always re-validated against
//! a live provider before being trusted.

use crate::config::Registry;
use crate::provider::{ProviderEvent, WalletProvider};
use crate::types::from_token_units;
use crate::{Result, X402PayError};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// An active wallet connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletConnection {
    pub address: String,
    #[serde(rename = "chainId")]
    pub chain_id: u64,
}

/// Connection state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected(WalletConnection),
}

/// Change notification pushed to account subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Updated(WalletConnection),
    Disconnected,
}

/// Persisted reconnection hint
///
/// Never a capability: on load it is re-validated with a live `connect()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredConnection {
    #[serde(rename = "walletConnected")]
    pub connected: bool,
    #[serde(rename = "walletAddress")]
    pub address: String,
    #[serde(rename = "walletChainId")]
    pub chain_id: u64,
}

/// Local persistence for the reconnection hint
pub trait ConnectionStore: Send + Sync {
    fn load(&self) -> Option<StoredConnection>;
    fn save(&self, hint: &StoredConnection);
    fn clear(&self);
}

/// In-memory hint store
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Option<StoredConnection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConnectionStore for MemoryStore {
    fn load(&self) -> Option<StoredConnection> {
        self.inner.lock().unwrap().clone()
    }

    fn save(&self, hint: &StoredConnection) {
        *self.inner.lock().unwrap() = Some(hint.clone());
    }

    fn clear(&self) {
        *self.inner.lock().unwrap() = None;
    }
}

/// JSON-file hint store
///
/// I/O failures are logged and swallowed: losing the hint only costs the
/// user a reconnect prompt.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConnectionStore for FileStore {
    fn load(&self) -> Option<StoredConnection> {
        let bytes = std::fs::read(&self.path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(hint) => Some(hint),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "discarding unreadable connection hint");
                None
            }
        }
    }

    fn save(&self, hint: &StoredConnection) {
        match serde_json::to_vec(hint) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&self.path, bytes) {
                    tracing::warn!(path = %self.path.display(), error = %e, "failed to persist connection hint");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize connection hint"),
        }
    }

    fn clear(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to clear connection hint");
            }
        }
    }
}

/// Handle to a change-notification stream; dropping it unsubscribes
pub struct Subscription<T> {
    rx: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    /// Next event, or `None` once the connector is gone
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                // A slow subscriber only misses intermediate states; the
                // next event carries the current one.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}

/// Detects, connects and tracks the injected wallet provider
pub struct WalletConnector {
    provider: Option<Arc<dyn WalletProvider>>,
    registry: Arc<Registry>,
    store: Arc<dyn ConnectionStore>,
    state: Mutex<ConnectionState>,
    /// Bumped on every connect/disconnect/account/chain change; in-flight
    /// payments compare-and-fail against it instead of locking.
    epoch: AtomicU64,
    account_tx: broadcast::Sender<ConnectionEvent>,
    chain_tx: broadcast::Sender<u64>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl WalletConnector {
    /// Create a connector around an already-selected provider handle.
    ///
    /// Must be called within a tokio runtime: the connector spawns a task
    /// that forwards provider events into connection state.
    pub fn new(
        provider: Option<Arc<dyn WalletProvider>>,
        registry: Arc<Registry>,
        store: Arc<dyn ConnectionStore>,
    ) -> Arc<Self> {
        let (account_tx, _) = broadcast::channel(32);
        let (chain_tx, _) = broadcast::channel(32);
        let connector = Arc::new(Self {
            provider,
            registry,
            store,
            state: Mutex::new(ConnectionState::Disconnected),
            epoch: AtomicU64::new(0),
            account_tx,
            chain_tx,
            listener: Mutex::new(None),
        });
        connector.spawn_listener();
        connector
    }

    /// Create a connector by probing the discovered provider handles
    pub fn detect(
        handles: &[Arc<dyn WalletProvider>],
        registry: Arc<Registry>,
        store: Arc<dyn ConnectionStore>,
    ) -> Arc<Self> {
        Self::new(crate::provider::detect_provider(handles), registry, store)
    }

    fn spawn_listener(self: &Arc<Self>) {
        let Some(provider) = self.provider.clone() else {
            return;
        };
        let connector = Arc::downgrade(self);
        let mut events = provider.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(connector) = connector.upgrade() else {
                            break;
                        };
                        connector.apply_event(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "dropped wallet provider events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.listener.lock().unwrap() = Some(handle);
    }

    /// The selected provider handle, if any was detected
    pub fn provider_handle(&self) -> Result<Arc<dyn WalletProvider>> {
        self.provider.clone().ok_or(X402PayError::NoProvider)
    }

    /// Current state snapshot
    pub fn state(&self) -> ConnectionState {
        self.state.lock().unwrap().clone()
    }

    /// Current connection, if connected
    pub fn connection(&self) -> Option<WalletConnection> {
        match self.state() {
            ConnectionState::Connected(conn) => Some(conn),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_some()
    }

    /// Opaque token identifying the current connection generation
    pub fn connection_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Fail fast if the connection changed since `epoch` was captured
    pub fn ensure_current(&self, epoch: u64) -> Result<()> {
        if self.connection_epoch() != epoch {
            return Err(X402PayError::stale_connection(
                "wallet account or chain changed while the payment was in flight",
            ));
        }
        Ok(())
    }

    /// Request account access and the active chain from the wallet
    pub async fn connect(&self) -> Result<WalletConnection> {
        let provider = self.provider_handle()?;
        self.set_state(ConnectionState::Connecting);

        let result = self.connect_inner(&provider).await;
        if result.is_err() {
            self.set_state(ConnectionState::Disconnected);
        }
        result
    }

    async fn connect_inner(
        &self,
        provider: &Arc<dyn WalletProvider>,
    ) -> Result<WalletConnection> {
        let accounts = provider.request("eth_requestAccounts", json!([])).await?;
        let accounts: Vec<String> = serde_json::from_value(accounts)?;
        let address = accounts
            .into_iter()
            .next()
            .ok_or_else(|| X402PayError::wallet_rejected("wallet returned no accounts"))?;

        let chain_hex = provider.request("eth_chainId", json!([])).await?;
        let chain_id = parse_chain_id(&chain_hex)?;

        let connection = WalletConnection { address, chain_id };
        tracing::info!(address = %connection.address, chain_id, "wallet connected");
        self.set_connected(connection.clone());
        Ok(connection)
    }

    /// Disconnect and clear all cached and persisted connection state.
    ///
    /// The provider's own disconnect is best-effort; local hints are
    /// cleared regardless of provider cooperation.
    pub async fn disconnect(&self) {
        if let Some(provider) = &self.provider {
            if let Err(e) = provider.disconnect().await {
                tracing::debug!(error = %e, "provider disconnect not supported");
            }
        }
        self.set_state(ConnectionState::Disconnected);
        self.bump_epoch();
        self.store.clear();
        let _ = self.account_tx.send(ConnectionEvent::Disconnected);
        tracing::info!("wallet disconnected");
    }

    /// Attempt a live reconnect from a persisted hint, if one exists.
    ///
    /// A failed reconnect discards the stale hint and surfaces the ordinary
    /// connect error.
    pub async fn restore(&self) -> Result<Option<WalletConnection>> {
        match self.store.load() {
            Some(hint) if hint.connected => {
                tracing::debug!(address = %hint.address, "re-validating persisted connection hint");
                match self.connect().await {
                    Ok(connection) => Ok(Some(connection)),
                    Err(e) => {
                        self.store.clear();
                        Err(e)
                    }
                }
            }
            _ => Ok(None),
        }
    }

    /// Switch the wallet to a chain from the registry.
    ///
    /// If the wallet reports the chain as unrecognized (code 4902), the
    /// chain definition is added from the registry and the switch retried
    /// exactly once. Any other provider error propagates unchanged.
    pub async fn switch_network(&self, chain_name: &str) -> Result<()> {
        let provider = self.provider_handle()?;
        let chain = self.registry.chain(chain_name)?;
        let chain_id_hex = format!("0x{:x}", chain.chain_id);
        let switch_params = json!([{ "chainId": chain_id_hex }]);

        match provider
            .request("wallet_switchEthereumChain", switch_params.clone())
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_unrecognized_chain() => {
                tracing::info!(chain = chain_name, "adding chain definition to wallet");
                provider
                    .request(
                        "wallet_addEthereumChain",
                        json!([{
                            "chainId": chain_id_hex,
                            "chainName": chain.display_name,
                            "nativeCurrency": {
                                "name": chain.native_currency.name,
                                "symbol": chain.native_currency.symbol,
                                "decimals": chain.native_currency.decimals,
                            },
                            "rpcUrls": [chain.rpc_url],
                            "blockExplorerUrls": [chain.explorer_url],
                        }]),
                    )
                    .await?;
                provider
                    .request("wallet_switchEthereumChain", switch_params)
                    .await?;
            }
            Err(e) => return Err(e.into()),
        }

        // The wallet also emits chainChanged; applying the switch here keeps
        // the state coherent for callers that read it immediately.
        self.set_chain(chain.chain_id);
        tracing::info!(chain = chain_name, chain_id = chain.chain_id, "switched network");
        Ok(())
    }

    /// Native-currency balance of an address, in whole coins
    pub async fn native_balance(&self, address: &str) -> Result<Decimal> {
        let provider = self.provider_handle()?;
        let wei = provider
            .request("eth_getBalance", json!([address, "latest"]))
            .await?;
        let wei = hex_quantity(&wei)?;
        from_token_units(&wei.to_string(), 18)
    }

    /// Subscribe to account changes; an empty account list arrives as
    /// [`ConnectionEvent::Disconnected`]
    pub fn subscribe_account_changes(&self) -> Subscription<ConnectionEvent> {
        Subscription {
            rx: self.account_tx.subscribe(),
        }
    }

    /// Subscribe to chain-id changes
    pub fn subscribe_chain_changes(&self) -> Subscription<u64> {
        Subscription {
            rx: self.chain_tx.subscribe(),
        }
    }

    fn apply_event(&self, event: ProviderEvent) {
        match event {
            ProviderEvent::AccountsChanged(accounts) => match accounts.into_iter().next() {
                None => {
                    // An empty account list is semantically a disconnect.
                    tracing::info!("wallet reported empty account list");
                    self.set_state(ConnectionState::Disconnected);
                    self.bump_epoch();
                    self.store.clear();
                    let _ = self.account_tx.send(ConnectionEvent::Disconnected);
                }
                Some(address) => {
                    let mut state = self.state.lock().unwrap();
                    if let ConnectionState::Connected(conn) = &mut *state {
                        if conn.address != address {
                            conn.address = address;
                            let updated = conn.clone();
                            drop(state);
                            self.bump_epoch();
                            self.persist(&updated);
                            let _ = self.account_tx.send(ConnectionEvent::Updated(updated));
                        }
                    }
                    // Unsolicited accounts while disconnected carry no chain
                    // id; the next connect() will pick them up.
                }
            },
            ProviderEvent::ChainChanged(chain_id) => {
                self.set_chain(chain_id);
                let _ = self.chain_tx.send(chain_id);
            }
        }
    }

    fn set_chain(&self, chain_id: u64) {
        let mut state = self.state.lock().unwrap();
        if let ConnectionState::Connected(conn) = &mut *state {
            if conn.chain_id != chain_id {
                conn.chain_id = chain_id;
                let updated = conn.clone();
                drop(state);
                self.bump_epoch();
                self.persist(&updated);
                let _ = self.account_tx.send(ConnectionEvent::Updated(updated));
            }
        }
    }

    fn set_connected(&self, connection: WalletConnection) {
        *self.state.lock().unwrap() = ConnectionState::Connected(connection.clone());
        self.bump_epoch();
        self.persist(&connection);
        let _ = self.account_tx.send(ConnectionEvent::Updated(connection));
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn persist(&self, connection: &WalletConnection) {
        self.store.save(&StoredConnection {
            connected: true,
            address: connection.address.clone(),
            chain_id: connection.chain_id,
        });
    }
}

impl Drop for WalletConnector {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Parse a JSON-RPC hex quantity (e.g. `"0x2105"`) into a u64
fn parse_chain_id(value: &Value) -> Result<u64> {
    let hex = value
        .as_str()
        .ok_or_else(|| X402PayError::network("chain id is not a string"))?;
    u64::from_str_radix(hex.trim_start_matches("0x"), 16)
        .map_err(|_| X402PayError::network(format!("invalid chain id: {}", hex)))
}

/// Parse an arbitrary-width JSON-RPC hex quantity
pub(crate) fn hex_quantity(value: &Value) -> Result<ethereum_types::U256> {
    let hex = value
        .as_str()
        .ok_or_else(|| X402PayError::network("quantity is not a string"))?;
    let trimmed = hex.trim_start_matches("0x");
    if trimmed.is_empty() {
        return Ok(ethereum_types::U256::zero());
    }
    ethereum_types::U256::from_str_radix(trimmed, 16)
        .map_err(|_| X402PayError::network(format!("invalid quantity: {}", hex)))
}
