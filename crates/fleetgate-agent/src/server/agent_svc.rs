//! `AgentService` gRPC implementation.
//!
//! The gateway dials this service to push packages and commands. Command
//! IDs are deduplicated so a redelivered command is acknowledged without
//! running twice.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tonic::{Request, Response, Status};
use tracing::{info, instrument, warn};

use fleetgate_proto::v1::agent_service_server::AgentService;
use fleetgate_proto::v1::{
    PushCommandRequest, PushCommandResponse, PushPackageRequest, PushPackageResponse, PushStatus,
};

use crate::executor::{InboundPackage, OfferDecision, UpdateExecutor};

pub struct AgentServiceImpl {
    executor: Arc<UpdateExecutor>,
    seen_commands: Mutex<HashSet<String>>,
}

impl AgentServiceImpl {
    pub fn new(executor: Arc<UpdateExecutor>) -> Self {
        Self {
            executor,
            seen_commands: Mutex::new(HashSet::new()),
        }
    }

    fn already_seen(&self, command_id: &str) -> bool {
        self.seen_commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(command_id)
    }

    /// Only executed commands count as seen, so a busy rejection can be
    /// retried under the same id.
    fn mark_seen(&self, command_id: &str) {
        self.seen_commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(command_id.to_string());
    }
}

#[tonic::async_trait]
impl AgentService for AgentServiceImpl {
    #[instrument(skip(self, request), fields(rpc = "PushPackage"))]
    async fn push_package(
        &self,
        request: Request<PushPackageRequest>,
    ) -> Result<Response<PushPackageResponse>, Status> {
        let req = request.into_inner();
        let package = req
            .package
            .ok_or_else(|| Status::invalid_argument("Missing package"))?;

        let package = match InboundPackage::from_proto(package) {
            Ok(package) => package,
            Err(e) => {
                return Ok(Response::new(PushPackageResponse {
                    status: PushStatus::Rejected as i32,
                    detail: format!("unparseable version: {e}"),
                }));
            }
        };

        let (status, detail) = match Arc::clone(&self.executor).offer(package, req.force) {
            OfferDecision::Accepted => (PushStatus::Accepted, String::new()),
            OfferDecision::Busy => (PushStatus::Busy, "update session active".to_string()),
            OfferDecision::Rejected(reason) => (PushStatus::Rejected, reason),
        };

        Ok(Response::new(PushPackageResponse {
            status: status as i32,
            detail,
        }))
    }

    #[instrument(skip(self, request), fields(rpc = "PushCommand"))]
    async fn push_command(
        &self,
        request: Request<PushCommandRequest>,
    ) -> Result<Response<PushCommandResponse>, Status> {
        let req = request.into_inner();
        let command = req
            .command
            .ok_or_else(|| Status::invalid_argument("Missing command"))?;

        if self.already_seen(&command.command_id) {
            info!(command = %command.command_id, "Duplicate command acknowledged without re-run");
            return Ok(Response::new(PushCommandResponse {
                accepted: true,
                detail: "duplicate".to_string(),
            }));
        }

        match command.command_type.as_str() {
            "rollback" => match self.executor.manual_rollback().await {
                Ok(()) => {
                    self.mark_seen(&command.command_id);
                    Ok(Response::new(PushCommandResponse {
                        accepted: true,
                        detail: String::new(),
                    }))
                }
                Err(reason) => Ok(Response::new(PushCommandResponse {
                    accepted: false,
                    detail: reason,
                })),
            },
            other => {
                warn!(command_type = %other, "Unknown command type");
                Ok(Response::new(PushCommandResponse {
                    accepted: false,
                    detail: format!("unknown command type: {other}"),
                }))
            }
        }
    }
}
