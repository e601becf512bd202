//! Handle types for interacting with the engine.
//!
//! [`DiagClient`] is the entry point: it owns the background scheduler and
//! hands out [`Conversation`] handles. Handles never touch sockets; they
//! send commands to the scheduler and wait on oneshot responders, so any
//! number of caller tasks can drive conversations concurrently.

use std::marker::PhantomData;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::error::{
    ConnectError, ConversationError, DisconnectError, DiscoveryError, InitError, UdsError,
};
use crate::net::{TcpStream, UdpSocket};
use crate::runtime::event_loop::scheduler_task;
use crate::runtime::Command;
use crate::{LogicalAddress, VehicleAddrInfo, VehicleInfoRequest};

/// Create a diagnostic client that reads its configuration from a JSON
/// file on [`initialize`](DiagClient::initialize).
///
/// This is the production entry point; it uses tokio sockets. Tests use
/// [`DiagClient::with_config`] with simulated socket types instead.
pub fn create_diagnostic_client(config_path: impl Into<PathBuf>) -> DiagClient {
    DiagClient::new(config_path)
}

enum ConfigSource {
    Path(PathBuf),
    Value(Box<ClientConfig>),
}

struct Initialized {
    cmd_tx: mpsc::Sender<Command>,
    config: Arc<ClientConfig>,
    scheduler: JoinHandle<()>,
}

/// The diagnostic client.
///
/// Generic over the socket implementations so the whole engine can run on
/// [turmoil](https://docs.rs/turmoil) in tests; defaults to tokio sockets.
///
/// Lifecycle: construct, [`initialize`](Self::initialize) (loads config,
/// binds the UDP endpoint, spawns the scheduler), use, then
/// [`deinitialize`](Self::deinitialize) (joins the scheduler; no engine
/// activity remains observable afterwards).
pub struct DiagClient<U: UdpSocket = tokio::net::UdpSocket, T: TcpStream = tokio::net::TcpStream>
{
    source: ConfigSource,
    state: Mutex<Option<Initialized>>,
    _socket_types: PhantomData<fn() -> (U, T)>,
}

impl<U: UdpSocket, T: TcpStream> DiagClient<U, T> {
    /// Create a client that loads its configuration from a JSON file
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            source: ConfigSource::Path(config_path.into()),
            state: Mutex::new(None),
            _socket_types: PhantomData,
        }
    }

    /// Create a client from an already-built configuration
    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            source: ConfigSource::Value(Box::new(config)),
            state: Mutex::new(None),
            _socket_types: PhantomData,
        }
    }

    /// Load the configuration, bind the UDP discovery endpoint and start
    /// the background scheduler.
    ///
    /// Must be called once before any other operation.
    pub async fn initialize(&self) -> Result<(), InitError> {
        if self.state.lock().expect("client state lock").is_some() {
            return Err(InitError::AlreadyInitialized);
        }

        tracing::info!("DiagClient initialization started");
        let config = Arc::new(match &self.source {
            ConfigSource::Path(path) => ClientConfig::load(path)?,
            ConfigSource::Value(config) => (**config).clone(),
        });

        let local = SocketAddr::new(config.udp_ip, config.udp_port);
        let udp = U::bind(local).await.map_err(InitError::BindFailed)?;
        udp.set_broadcast(true).map_err(InitError::BindFailed)?;

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let scheduler = tokio::spawn(scheduler_task::<U, T>(udp, Arc::clone(&config), cmd_rx));

        let mut state = self.state.lock().expect("client state lock");
        // A concurrent initialize could have won the race while we were
        // binding; the second one loses. No channel can exist yet on the
        // losing scheduler, so aborting it is safe.
        if state.is_some() {
            drop(state);
            scheduler.abort();
            return Err(InitError::AlreadyInitialized);
        }
        *state = Some(Initialized {
            cmd_tx,
            config,
            scheduler,
        });
        tracing::info!("DiagClient initialization completed");
        Ok(())
    }

    /// Shut the engine down.
    ///
    /// Every in-flight caller wakes with the shutdown error of its
    /// operation; all channels are closed; this call returns only after
    /// the scheduler task has been joined.
    pub async fn deinitialize(&self) -> Result<(), InitError> {
        tracing::info!("DiagClient de-initialization started");
        let initialized = self
            .state
            .lock()
            .expect("client state lock")
            .take()
            .ok_or(InitError::NotInitialized)?;

        let (ack_tx, ack_rx) = oneshot::channel();
        if initialized
            .cmd_tx
            .send(Command::Deinitialize { respond: ack_tx })
            .await
            .is_ok()
        {
            let _ = ack_rx.await;
        }
        if let Err(e) = initialized.scheduler.await {
            tracing::error!("Scheduler task panicked: {}", e);
        }
        tracing::info!("DiagClient de-initialization completed");
        Ok(())
    }

    /// Send a vehicle identification request and collect the responses for
    /// one discovery window.
    ///
    /// An empty network is a successful, empty collection.
    pub async fn send_vehicle_identification_request(
        &self,
        filter: VehicleInfoRequest,
    ) -> Result<Vec<VehicleAddrInfo>, DiscoveryError> {
        let cmd_tx = self
            .cmd_tx()
            .ok_or(DiscoveryError::NotInitialized)?;
        let (respond, result) = oneshot::channel();
        cmd_tx
            .send(Command::Discover { filter, respond })
            .await
            .map_err(|_| DiscoveryError::Shutdown)?;
        result.await.map_err(|_| DiscoveryError::Shutdown)?
    }

    /// Snapshot of every server seen so far, fed by discovery responses
    /// and unsolicited vehicle announcements.
    pub async fn get_diagnostic_server_list(
        &self,
    ) -> Result<Vec<VehicleAddrInfo>, DiscoveryError> {
        let cmd_tx = self
            .cmd_tx()
            .ok_or(DiscoveryError::NotInitialized)?;
        let (respond, result) = oneshot::channel();
        cmd_tx
            .send(Command::ServerList { respond })
            .await
            .map_err(|_| DiscoveryError::Shutdown)?;
        result.await.map_err(|_| DiscoveryError::Shutdown)
    }

    /// Get the conversation handle for a configured conversation name
    pub fn get_conversation(&self, name: &str) -> Result<Conversation, ConversationError> {
        let state = self.state.lock().expect("client state lock");
        let initialized = state.as_ref().ok_or(ConversationError::NotInitialized)?;
        let conv = initialized
            .config
            .conversation(name)
            .ok_or(ConversationError::UnknownConversation)?;
        Ok(Conversation {
            name: conv.name.clone(),
            source_address: conv.source_address,
            default_server: (conv.tcp_ip, conv.tcp_port),
            cmd_tx: initialized.cmd_tx.clone(),
        })
    }

    fn cmd_tx(&self) -> Option<mpsc::Sender<Command>> {
        self.state
            .lock()
            .expect("client state lock")
            .as_ref()
            .map(|s| s.cmd_tx.clone())
    }
}

// ============================================================================
// CONVERSATION HANDLE
// ============================================================================

/// Handle to one configured conversation (tester identity).
///
/// A conversation owns at most one channel at a time; requests on it are
/// strictly ordered (half-duplex). Operations on different conversations
/// never serialize on each other.
///
/// `Conversation` is `Clone`; clones refer to the same underlying
/// conversation.
#[derive(Clone, Debug)]
pub struct Conversation {
    name: String,
    source_address: LogicalAddress,
    default_server: (IpAddr, u16),
    cmd_tx: mpsc::Sender<Command>,
}

impl Conversation {
    /// The configured conversation name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tester source address this conversation uses
    pub fn source_address(&self) -> LogicalAddress {
        self.source_address
    }

    /// The server endpoint from the configuration
    pub fn configured_server(&self) -> (IpAddr, u16) {
        self.default_server
    }

    /// Move the conversation from `Uninit` to `Idle`. Idempotent.
    pub async fn startup(&self) -> Result<(), ConversationError> {
        let (respond, result) = oneshot::channel();
        self.cmd_tx
            .send(Command::Startup {
                name: self.name.clone(),
                respond,
            })
            .await
            .map_err(|_| ConversationError::NotInitialized)?;
        result.await.map_err(|_| ConversationError::NotInitialized)?
    }

    /// Tear the conversation down to `Uninit`, disconnecting its channel
    /// first if one is active.
    pub async fn shutdown(&self) -> Result<(), ConversationError> {
        let (respond, result) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown {
                name: self.name.clone(),
                respond,
            })
            .await
            .map_err(|_| ConversationError::NotInitialized)?;
        result.await.map_err(|_| ConversationError::NotInitialized)?
    }

    /// Open a TCP channel to the server and activate routing.
    ///
    /// The port is taken from the conversation's configured network
    /// endpoint. At most one channel may be active per
    /// `(tester source, server logical address)` pair across the whole
    /// client; a duplicate fails with [`ConnectError::AlreadyConnected`].
    pub async fn connect_to_diag_server(
        &self,
        target: LogicalAddress,
        ip: IpAddr,
    ) -> Result<(), ConnectError> {
        let (respond, result) = oneshot::channel();
        self.cmd_tx
            .send(Command::Connect {
                name: self.name.clone(),
                target,
                ip,
                respond,
            })
            .await
            .map_err(|_| ConnectError::Shutdown)?;
        result.await.map_err(|_| ConnectError::Shutdown)?
    }

    /// Send one UDS request and wait for the final response.
    ///
    /// The caller is suspended until the channel delivers a terminal
    /// outcome: the response, a negative ack, or a timer expiry. A
    /// response-pending negative response (`7F xx 78`) silently extends
    /// the wait; it is never surfaced here.
    pub async fn send_diagnostic_request(
        &self,
        request: impl AsRef<[u8]>,
    ) -> Result<Bytes, UdsError> {
        let request = request.as_ref();
        // Reject synchronously before anything is queued
        crate::runtime::uds::validate_request(request)?;

        let (respond, result) = oneshot::channel();
        self.cmd_tx
            .send(Command::SendDiagnostic {
                name: self.name.clone(),
                request: Bytes::copy_from_slice(request),
                respond,
            })
            .await
            .map_err(|_| UdsError::Shutdown)?;
        result.await.map_err(|_| UdsError::Shutdown)?
    }

    /// Close the conversation's channel and free its
    /// `(source, target)` slot.
    pub async fn disconnect_from_diag_server(&self) -> Result<(), DisconnectError> {
        let (respond, result) = oneshot::channel();
        self.cmd_tx
            .send(Command::Disconnect {
                name: self.name.clone(),
                respond,
            })
            .await
            .map_err(|_| DisconnectError::Shutdown)?;
        result.await.map_err(|_| DisconnectError::Shutdown)?
    }
}
