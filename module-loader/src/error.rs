#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The module name was empty or contained a nul byte
    #[error("the module name is invalid")]
    InvalidName,
    #[error("unable to load module '{name}': {reason}")]
    NotFound { name: String, reason: String },
    #[error("symbol '{symbol}' was not found in module '{module}'")]
    SymbolNotFound { module: String, symbol: String },
    /// The handle doesn't refer to a currently loaded module
    #[error("the module handle is invalid")]
    InvalidHandle,
    /// The registration or entry point callback of the module failed, the
    /// module was unloaded again
    #[error("the {callback} callback of module '{name}' failed")]
    InitFailed {
        name: String,
        callback: &'static str,
    },
}
