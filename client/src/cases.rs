//! Case catalogue, admission and the draw call.

use crate::{
    gateway::{decode, error_detail},
    ApiRequest, Client, Error, Result,
};
use casebox_types::{api::paths, Admission, CaseDefinition, OpenRequest, SpinResult};
use tracing::{debug, warn};

impl Client {
    pub async fn list_cases(&self) -> Result<Vec<CaseDefinition>> {
        self.fetch(ApiRequest::get(paths::CASE_LIST)).await
    }

    /// Case metadata including the nonce of the last draw.
    pub async fn case(&self, case_id: &str) -> Result<CaseDefinition> {
        self.fetch(ApiRequest::get(paths::CASE_GET_ONE).query("case_id", case_id))
            .await
    }

    /// Admission check. A denial is data here, not an error.
    pub async fn precheck(&self, case_id: &str) -> Result<Admission> {
        let admission: Admission = self
            .fetch(ApiRequest::get(paths::CASE_PRECHECK).query("case_id", case_id))
            .await?;
        debug!(case_id, spin = admission.spin, reason = ?admission.reason, "admission checked");
        Ok(admission)
    }

    /// Spend a commitment on a draw. Any non-success response is a
    /// [`Error::DrawRejected`] carrying the server's message verbatim.
    pub async fn open_case(&self, request: &OpenRequest) -> Result<SpinResult> {
        let api_request = ApiRequest::post(paths::CASE_OPEN).json(request)?;
        let response = self.gateway().send(&api_request).await?;
        if !response.status().is_success() {
            let (status, message) = error_detail(response).await;
            warn!(case_id = %request.case_id, %status, %message, "open rejected");
            return Err(Error::DrawRejected { status, message });
        }
        decode(response).await
    }
}
