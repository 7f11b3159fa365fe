#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Settings(#[from] edgesocks_settings::SettingsError),

    #[error("{0}")]
    Proxy(#[from] edgesocks_proxy::ProxyError),

    #[error("{0}")]
    Selector(#[from] edgesocks_proxy::InvalidSelector),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
