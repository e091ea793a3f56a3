use crate::{client::expect_success, ApiRequest, Client, Result};
use casebox_types::{api::paths, Commitment, Reveal};

impl Client {
    /// Ask the server to commit to a fresh seed.
    pub async fn commit(&self) -> Result<Commitment> {
        self.fetch(ApiRequest::post(paths::FAIRNESS_COMMIT)).await
    }

    pub async fn reveal(&self, spin_log_id: &str) -> Result<Reveal> {
        self.fetch(ApiRequest::get(paths::FAIRNESS_REVEAL).segment(spin_log_id))
            .await
    }

    /// Drop an unused commitment on the server.
    pub async fn delete_commitment(&self, server_seed_id: &str) -> Result<()> {
        let request = ApiRequest::delete(paths::FAIRNESS_COMMIT).segment(server_seed_id);
        expect_success(self.gateway().send(&request).await?).await?;
        Ok(())
    }
}
