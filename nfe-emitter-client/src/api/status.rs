use nfe_emitter::{
    requests,
    response::{self, ServiceStatus},
    soap::Service,
    types::Environment,
};
use tracing::{info, warn};

use crate::{NfeEmitterClient, Result};

impl NfeEmitterClient {
    pub(crate) async fn handle_service_status(
        &self,
        environment: Environment,
    ) -> Result<ServiceStatus> {
        let session = self.open_session(environment)?;
        let uf = self.config().issuer.address.uf;
        let body = session
            .call(
                Service::StatusService,
                &requests::status_query(environment, uf),
            )
            .await?;

        let status = response::interpret_status(&body)?;
        if status.in_operation {
            info!(code = %status.code, "Service in operation");
        } else {
            warn!(code = %status.code, reason = %status.reason, returns_at = ?status.returns_at, "Service unavailable");
        }
        Ok(status)
    }
}
