// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use super::StagingError;

/// Terminal and in-flight states reported by the transfer service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Active,
    Succeeded,
    Failed,
}

/// Black-box boundary to the external bulk data-movement service. The
/// supervisor only initiates remote-to-remote transfers and polls them;
/// authentication and token refresh live behind this trait.
#[async_trait]
pub trait GlobusClient: Send + Sync {
    /// Start a transfer and return its opaque task id.
    async fn init_transfer(
        &self,
        src_endpoint: &str,
        src_path: &str,
        dst_endpoint: &str,
        dst_path: &str,
        label: &str,
    ) -> Result<String, StagingError>;

    async fn query_status(&self, task_id: &str) -> Result<TransferStatus, StagingError>;
}
