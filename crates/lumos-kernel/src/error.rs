//! Kernel error type and its mapping onto the outward error taxonomy.

use lumos_types::{AnalysisReport, ErrorKind, OpError};

/// Failures surfaced by kernel operations.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// Bad input.
    #[error("validation: {0}")]
    Validation(String),
    /// Critical analyzer findings halted the operation.
    #[error("analysis blocked: {} critical findings", report.critical_count)]
    AnalysisBlocked {
        /// The failing report, returned to the caller.
        report: AnalysisReport,
    },
    /// Unknown hash or app.
    #[error("not found: {0}")]
    NotFound(String),
    /// Gateway failure.
    #[error(transparent)]
    Gateway(#[from] lumos_gateway::GatewayError),
    /// Registry failure.
    #[error(transparent)]
    Registry(#[from] lumos_registry::RegistryError),
    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] lumos_storage::StorageError),
    /// Capability failure.
    #[error(transparent)]
    Capability(#[from] lumos_capability::CapabilityError),
    /// WASM sandbox failure.
    #[error(transparent)]
    Wasm(#[from] lumos_wasm::WasmError),
    /// Container manager failure.
    #[error(transparent)]
    Container(#[from] lumos_container::ContainerError),
    /// The container engine is not attached.
    #[error("container engine disabled")]
    ContainersDisabled,
    /// Scheduler failure.
    #[error(transparent)]
    Scheduler(#[from] lumos_scheduler::SchedulerError),
}

impl KernelError {
    /// The outward error kind for status mapping.
    pub fn kind(&self) -> ErrorKind {
        use lumos_container::ContainerError;
        use lumos_gateway::GatewayError;
        use lumos_storage::StorageError;
        use lumos_wasm::WasmError;

        match self {
            KernelError::Validation(_) => ErrorKind::Validation,
            KernelError::AnalysisBlocked { .. } => ErrorKind::AnalysisBlocked,
            KernelError::NotFound(_) => ErrorKind::NotFound,
            KernelError::Gateway(GatewayError::NoProviderAvailable) => {
                ErrorKind::ProviderUnavailable
            }
            KernelError::Gateway(GatewayError::ProviderFailed { .. }) => ErrorKind::ProviderFailed,
            KernelError::Gateway(GatewayError::MalformedProcessOutput) => ErrorKind::Validation,
            KernelError::Registry(lumos_registry::RegistryError::NotFound(_)) => {
                ErrorKind::NotFound
            }
            KernelError::Registry(_) => ErrorKind::Internal,
            KernelError::Storage(StorageError::QuotaExceeded { .. }) => ErrorKind::QuotaExceeded,
            KernelError::Storage(_) => ErrorKind::Internal,
            KernelError::Capability(_) => ErrorKind::CapabilityDenied,
            KernelError::Wasm(WasmError::CpuTimeout) => ErrorKind::Timeout,
            KernelError::Wasm(WasmError::Conflict(_)) => ErrorKind::Conflict,
            KernelError::Wasm(WasmError::CapabilityNotGranted(_)) => ErrorKind::CapabilityDenied,
            KernelError::Wasm(_) => ErrorKind::Validation,
            KernelError::Container(ContainerError::ResourceExhausted(_)) => {
                ErrorKind::ResourceExhausted
            }
            KernelError::Container(ContainerError::NotFound(_)) => ErrorKind::NotFound,
            KernelError::Container(ContainerError::Conflict(_)) => ErrorKind::Conflict,
            KernelError::Container(_) => ErrorKind::Internal,
            KernelError::ContainersDisabled => ErrorKind::ProviderUnavailable,
            KernelError::Scheduler(lumos_scheduler::SchedulerError::UnknownTask(_)) => {
                ErrorKind::NotFound
            }
            KernelError::Scheduler(_) => ErrorKind::Validation,
        }
    }

    /// Structured envelope for the API surface.
    pub fn to_op_error(&self) -> OpError {
        OpError::new(self.kind(), self.to_string())
    }
}
