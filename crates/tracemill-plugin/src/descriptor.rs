use serde::Deserialize;

/// One entry of the `active_plugins` configuration list: a plugin name
/// plus whatever options that plugin understands. The options are kept
/// as raw YAML and interpreted by the plugin itself at start time.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    #[serde(default)]
    pub options: serde_yaml::Value,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: serde_yaml::Value::Null,
        }
    }

    pub fn with_options(name: impl Into<String>, options: serde_yaml::Value) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }
}
