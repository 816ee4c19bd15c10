//! Docker Engine API client for swarm services, nodes and events.
//!
//! Talks HTTP/1.1 over the engine's Unix socket.
//!
//! Reference: https://docs.docker.com/engine/api/

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use expose_cluster::{
    ClusterApi, ClusterError, ClusterEvent, EventAction, EventKind, Node, NodeState,
    PublishedPort, Service,
};
use hyper::body::HttpBody;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::events::EventSource;

/// Default engine socket.
pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

/// `filters={"scope":["swarm"]}`, URL-encoded.
const SWARM_EVENTS_PATH: &str = "/events?filters=%7B%22scope%22%3A%5B%22swarm%22%5D%7D";

/// Docker Engine client bound to a Unix socket.
pub struct DockerClient {
    socket_path: String,
    client: Client<UnixConnector>,
}

impl DockerClient {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_string_lossy().to_string(),
            client: Client::unix(),
        }
    }

    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }

    /// Subscribe to swarm-scoped events.
    pub async fn events(&self) -> Result<DockerEventStream, ClusterError> {
        let response = self.send(SWARM_EVENTS_PATH).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(api_error(status, response.into_body()).await);
        }

        debug!("subscribed to swarm events");
        Ok(DockerEventStream::new(response.into_body()))
    }

    async fn send(&self, path: &str) -> Result<hyper::Response<Body>, ClusterError> {
        let uri: hyper::Uri = Uri::new(&self.socket_path, path).into();
        debug!(path = path, "GET request to Docker Engine API");

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("Accept", "application/json")
            .body(Body::empty())
            .map_err(|e| ClusterError::Transport(e.to_string()))?;

        self.client
            .request(request)
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))
    }

    async fn get_bytes(&self, path: &str) -> Result<Bytes, ClusterError> {
        let response = self.send(path).await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(ClusterError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            return Err(api_error(status, response.into_body()).await);
        }

        hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClusterError> {
        let body = self.get_bytes(path).await?;
        serde_json::from_slice(&body).map_err(|e| ClusterError::Decode(format!("{path}: {e}")))
    }
}

async fn api_error(status: StatusCode, body: Body) -> ClusterError {
    let body = hyper::body::to_bytes(body).await.unwrap_or_default();
    let message = serde_json::from_slice::<ErrorDto>(&body)
        .map(|e| e.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(&body).trim().to_string());

    ClusterError::Api {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl ClusterApi for DockerClient {
    async fn ping(&self) -> Result<(), ClusterError> {
        self.get_bytes("/_ping").await.map(|_| ())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        let nodes: Vec<NodeDto> = self.get("/nodes").await?;
        Ok(nodes.into_iter().map(Node::from).collect())
    }

    async fn list_services(&self) -> Result<Vec<Service>, ClusterError> {
        let services: Vec<ServiceDto> = self.get("/services").await?;
        Ok(services.into_iter().map(Service::from).collect())
    }

    async fn get_service(&self, id: &str) -> Result<Service, ClusterError> {
        let service: ServiceDto = self.get(&format!("/services/{id}")).await?;
        Ok(service.into())
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
struct ErrorDto {
    message: String,
}

#[derive(Debug, Deserialize)]
struct NodeDto {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Status", default)]
    status: NodeStatusDto,
}

#[derive(Debug, Default, Deserialize)]
struct NodeStatusDto {
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Addr", default)]
    addr: String,
}

impl From<NodeDto> for Node {
    fn from(dto: NodeDto) -> Self {
        let state = if dto.status.state == "ready" {
            NodeState::Ready
        } else {
            NodeState::NotReady
        };
        Node::new(dto.id, dto.status.addr, state)
    }
}

#[derive(Debug, Deserialize)]
struct ServiceDto {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Spec")]
    spec: ServiceSpecDto,
    #[serde(rename = "Endpoint", default)]
    endpoint: EndpointDto,
}

#[derive(Debug, Deserialize)]
struct ServiceSpecDto {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Labels", default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
struct EndpointDto {
    #[serde(rename = "Ports", default)]
    ports: Option<Vec<PortDto>>,
}

#[derive(Debug, Deserialize)]
struct PortDto {
    #[serde(rename = "TargetPort", default)]
    target_port: u16,
    #[serde(rename = "PublishedPort", default)]
    published_port: u16,
}

impl From<ServiceDto> for Service {
    fn from(dto: ServiceDto) -> Self {
        Service {
            id: dto.id,
            name: dto.spec.name,
            labels: dto.spec.labels.unwrap_or_default(),
            ports: dto.endpoint.ports.map(|ports| {
                ports
                    .into_iter()
                    .map(|p| PublishedPort {
                        target_port: p.target_port,
                        published_port: p.published_port,
                    })
                    .collect()
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventDto {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Actor", default)]
    actor: ActorDto,
}

#[derive(Debug, Default, Deserialize)]
struct ActorDto {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Attributes", default)]
    attributes: BTreeMap<String, String>,
}

impl From<EventDto> for ClusterEvent {
    fn from(dto: EventDto) -> Self {
        let mut attributes = dto.actor.attributes;
        ClusterEvent {
            kind: EventKind::parse(&dto.kind),
            action: EventAction::parse(&dto.action),
            actor_id: dto.actor.id,
            actor_name: attributes.remove("name"),
        }
    }
}

/// Decode one event line from the engine's event stream.
pub fn decode_event(line: &[u8]) -> Result<ClusterEvent, ClusterError> {
    serde_json::from_slice::<EventDto>(line)
        .map(ClusterEvent::from)
        .map_err(|e| ClusterError::Decode(e.to_string()))
}

/// Split complete newline-terminated lines off the front of `buf`.
fn take_lines(buf: &mut BytesMut) -> Vec<Bytes> {
    let mut lines = Vec::new();
    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
        let line = buf.split_to(pos + 1).freeze();
        let line = line.slice(..pos);
        if !line.iter().all(u8::is_ascii_whitespace) {
            lines.push(line);
        }
    }
    lines
}

/// Live swarm event stream.
///
/// The engine writes one JSON object per line; undecodable lines are logged
/// and skipped.
pub struct DockerEventStream {
    body: Body,
    buf: BytesMut,
    pending: VecDeque<ClusterEvent>,
}

impl DockerEventStream {
    fn new(body: Body) -> Self {
        Self {
            body,
            buf: BytesMut::new(),
            pending: VecDeque::new(),
        }
    }

    fn ingest(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        for line in take_lines(&mut self.buf) {
            match decode_event(&line) {
                Ok(event) => self.pending.push_back(event),
                Err(e) => warn!(error = %e, "skipping undecodable event"),
            }
        }
    }
}

#[async_trait]
impl EventSource for DockerEventStream {
    async fn next_event(&mut self) -> Result<Option<ClusterEvent>, ClusterError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            match self.body.data().await {
                Some(Ok(chunk)) => self.ingest(&chunk),
                Some(Err(e)) => return Err(ClusterError::Transport(e.to_string())),
                None => return Ok(None),
            }
        }
    }
}
