use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("invalid options for plugin {0}: {1}")]
    InvalidOptions(&'static str, String),

    #[error("no plugins configured")]
    NoPlugins,

    #[error("artifact from another plugin handed to {0}")]
    ArtifactType(&'static str),

    #[error("unable to name output file for plugin {0}: {1}")]
    OutputName(&'static str, String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
