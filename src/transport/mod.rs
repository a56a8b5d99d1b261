//! gRPC transport layer for kyrograph.
//!
//! Requests and responses travel as JSON bytes shaped by the library's
//! serde types, so the protobuf schema stays a thin envelope.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::claim::FactKey;
use crate::entity::EntityId;
use crate::error::{GraphError, StorageError};
use crate::gap::{GapId, GapKind, GapState, GapTarget};
use crate::graph::KnowledgeGraph;
use crate::ingest::{CandidateClaim, ConsistencyMode};

/// Generated protobuf messages and service stubs.
#[allow(missing_docs)]
pub mod proto {
    tonic::include_proto!("kyrograph");
}

use proto::knowledge_service_server::{KnowledgeService, KnowledgeServiceServer};

// ----------------------------------------------------------------------------
// Limits (DoS protection)
// ----------------------------------------------------------------------------

/// Maximum size of a request JSON payload.
const MAX_REQUEST_JSON_BYTES: usize = 1024 * 1024; // 1 MiB

/// Maximum size of a response JSON payload.
const MAX_RESPONSE_JSON_BYTES: usize = 4 * 1024 * 1024; // 4 MiB

/// Maximum length of a free-form string field such as an approver name.
const MAX_NAME_BYTES: usize = 256;

/// gRPC service implementation over a shared [`KnowledgeGraph`].
pub struct KnowledgeServiceImpl {
    graph: Arc<KnowledgeGraph>,
}

impl KnowledgeServiceImpl {
    /// A service backed by `graph`.
    #[must_use]
    pub const fn new(graph: Arc<KnowledgeGraph>) -> Self {
        Self { graph }
    }

    /// Wraps the service in the generated tonic server.
    #[must_use]
    pub fn into_server(self) -> KnowledgeServiceServer<Self> {
        KnowledgeServiceServer::new(self)
    }
}

#[derive(Debug, Deserialize)]
struct FactQuery {
    #[serde(flatten)]
    key: FactKey,
    #[serde(default)]
    as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct EntityStateQuery {
    entity: EntityId,
    #[serde(default)]
    at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct GapsQuery {
    #[serde(default)]
    state: Option<GapState>,
    #[serde(default)]
    priority_min: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ReportGapRequest {
    target: GapTarget,
    kind: GapKind,
    #[serde(default)]
    priority_hint: Option<f64>,
    #[serde(default)]
    domains: Vec<String>,
}

fn invalid_argument(msg: impl Into<String>) -> Status {
    Status::invalid_argument(msg.into())
}

fn parse_gap_id(s: &str) -> Result<GapId, Status> {
    if s.len() > 64 {
        return Err(invalid_argument("gap_id too long"));
    }
    s.parse::<uuid::Uuid>()
        .map(GapId::from_uuid)
        .map_err(|_| invalid_argument("invalid gap_id UUID format"))
}

fn parse_mode(s: &str) -> Result<ConsistencyMode, Status> {
    match s {
        "" => Ok(ConsistencyMode::default()),
        "strict" => Ok(ConsistencyMode::Strict),
        "eventual" => Ok(ConsistencyMode::Eventual),
        "force" => Ok(ConsistencyMode::Force),
        other => Err(invalid_argument(format!("unknown consistency mode '{other}'"))),
    }
}

fn parse_json<T: DeserializeOwned>(bytes: &[u8], field: &str) -> Result<T, Status> {
    if bytes.is_empty() {
        return Err(invalid_argument(format!("{field} is required")));
    }
    if bytes.len() > MAX_REQUEST_JSON_BYTES {
        return Err(invalid_argument(format!("{field} exceeds maximum size")));
    }
    serde_json::from_slice(bytes).map_err(|e| invalid_argument(format!("invalid {field}: {e}")))
}

fn encode_json<T: Serialize>(value: &T) -> Result<Response<proto::JsonResponse>, Status> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| Status::internal(format!("failed to serialize response JSON: {e}")))?;
    if bytes.len() > MAX_RESPONSE_JSON_BYTES {
        return Err(Status::resource_exhausted("serialized JSON exceeds size limit"));
    }
    Ok(Response::new(proto::JsonResponse {
        response_json: bytes,
    }))
}

fn status_from_graph_error(err: GraphError) -> Status {
    match err {
        GraphError::Validation(e) => Status::invalid_argument(e.to_string()),
        GraphError::Storage(StorageError::InvariantViolation(e)) => {
            Status::invalid_argument(e.to_string())
        }
        GraphError::Storage(
            e @ (StorageError::ClaimNotFound(_)
            | StorageError::EntityNotFound(_)
            | StorageError::GapNotFound(_)),
        ) => Status::not_found(e.to_string()),
        GraphError::Storage(e @ StorageError::DuplicateKey(_)) => Status::already_exists(e.to_string()),
        GraphError::Storage(
            e @ (StorageError::AlreadySuperseded { .. } | StorageError::CycleDetected { .. }),
        ) => Status::aborted(e.to_string()),
        GraphError::Storage(e) => Status::unavailable(e.to_string()),
        GraphError::Temporal(e) => Status::data_loss(e.to_string()),
        e @ GraphError::ConflictDetected { .. } => Status::aborted(e.to_string()),
        e @ GraphError::Rail(_) => Status::resource_exhausted(e.to_string()),
        e @ GraphError::ResearchTimeout { .. } => Status::deadline_exceeded(e.to_string()),
        e @ GraphError::InvalidTransition { .. } => Status::failed_precondition(e.to_string()),
        e @ GraphError::Research { .. } => Status::unavailable(e.to_string()),
        e @ GraphError::Config { .. } => Status::failed_precondition(e.to_string()),
        e @ GraphError::Internal { .. } => Status::internal(e.to_string()),
    }
}

/// Runs a graph call that may block on locks or research off the async
/// executor.
async fn blocking<T, F>(graph: &Arc<KnowledgeGraph>, f: F) -> Result<T, Status>
where
    T: Send + 'static,
    F: FnOnce(&KnowledgeGraph) -> Result<T, GraphError> + Send + 'static,
{
    let graph = Arc::clone(graph);
    tokio::task::spawn_blocking(move || f(graph.as_ref()))
        .await
        .map_err(|e| Status::internal(format!("graph task failed: {e}")))?
        .map_err(status_from_graph_error)
}

#[tonic::async_trait]
impl KnowledgeService for KnowledgeServiceImpl {
    async fn submit(
        &self,
        request: Request<proto::SubmitRequest>,
    ) -> Result<Response<proto::JsonResponse>, Status> {
        let req = request.into_inner();
        let candidate: CandidateClaim = parse_json(&req.candidate_json, "candidate_json")?;
        let mode = parse_mode(&req.mode)?;
        debug!(predicate = %candidate.predicate, ?mode, "submit");
        let receipt = blocking(&self.graph, move |g| g.submit_with_mode(&candidate, mode)).await?;
        encode_json(&receipt)
    }

    async fn fact(
        &self,
        request: Request<proto::JsonRequest>,
    ) -> Result<Response<proto::JsonResponse>, Status> {
        let query: FactQuery = parse_json(&request.into_inner().request_json, "request_json")?;
        let fused = blocking(&self.graph, move |g| match query.as_of {
            Some(at) => g.fact_as_of(&query.key, at),
            None => g.fact_by_key(&query.key),
        })
        .await?;
        encode_json(&fused)
    }

    async fn entity_state(
        &self,
        request: Request<proto::JsonRequest>,
    ) -> Result<Response<proto::JsonResponse>, Status> {
        let query: EntityStateQuery = parse_json(&request.into_inner().request_json, "request_json")?;
        let claims = blocking(&self.graph, move |g| g.entity_state(query.entity, query.at)).await?;
        encode_json(&claims)
    }

    async fn history(
        &self,
        request: Request<proto::JsonRequest>,
    ) -> Result<Response<proto::JsonResponse>, Status> {
        let key: FactKey = parse_json(&request.into_inner().request_json, "request_json")?;
        let chain = blocking(&self.graph, move |g| g.history(&key)).await?;
        encode_json(&chain)
    }

    async fn gaps(
        &self,
        request: Request<proto::JsonRequest>,
    ) -> Result<Response<proto::JsonResponse>, Status> {
        let body = request.into_inner().request_json;
        let query = if body.is_empty() {
            GapsQuery {
                state: None,
                priority_min: None,
            }
        } else {
            parse_json(&body, "request_json")?
        };
        let gaps = blocking(&self.graph, move |g| g.gaps(query.state, query.priority_min)).await?;
        encode_json(&gaps)
    }

    async fn report_gap(
        &self,
        request: Request<proto::JsonRequest>,
    ) -> Result<Response<proto::JsonResponse>, Status> {
        let req: ReportGapRequest = parse_json(&request.into_inner().request_json, "request_json")?;
        let gap = blocking(&self.graph, move |g| {
            g.report_gap(req.target, req.kind, req.priority_hint, req.domains)
        })
        .await?;
        encode_json(&gap)
    }

    async fn approve_gap(
        &self,
        request: Request<proto::ApproveGapRequest>,
    ) -> Result<Response<proto::JsonResponse>, Status> {
        let req = request.into_inner();
        let id = parse_gap_id(&req.gap_id)?;
        let approver = req.approver.trim().to_string();
        if approver.is_empty() {
            return Err(invalid_argument("approver is required"));
        }
        if approver.len() > MAX_NAME_BYTES {
            return Err(invalid_argument("approver too long"));
        }
        let gap = blocking(&self.graph, move |g| g.approve_gap(id, &approver)).await?;
        encode_json(&gap)
    }

    async fn research_gap(
        &self,
        request: Request<proto::GapRequest>,
    ) -> Result<Response<proto::JsonResponse>, Status> {
        let id = parse_gap_id(&request.into_inner().gap_id)?;
        let gap = blocking(&self.graph, move |g| g.research_gap(id)).await?;
        encode_json(&gap)
    }
}

pub use proto::knowledge_service_client::KnowledgeServiceClient;
