#[derive(Debug, thiserror::Error)]
pub enum KernelctlError {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Connection(#[from] netservice::Error),

    #[error("{failed} of {total} connections failed")]
    Partial { failed: usize, total: usize },
}

pub type KernelctlResult<T> = Result<T, KernelctlError>;
