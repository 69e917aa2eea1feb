use thiserror::Error;

/// A structured remediation hint attached to type-not-found errors.
///
/// Opaque to the core; diagnostic layers render these for the operator.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedAction {
    pub title: String,
    pub description: String,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("resource type not found: {resource_type}")]
    TypeNotFound {
        resource_type: String,
        suggested_actions: Vec<SuggestedAction>,
    },

    #[error("plugin call failed for {resource_type}: {message}")]
    PluginCallFailed {
        resource_type: String,
        message: String,
        /// Transient failures are retried under the configured policy.
        retryable: bool,
    },

    #[error("plugin returned an empty spec definition for {0}")]
    EmptySpecDefinition(String),

    #[error("resource lock acquisition cancelled for {key}")]
    LockAcquisitionTimedOut { key: String },

    #[error("duplicate transformer prefix: {0}")]
    DuplicateTransformerPrefix(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal provider error: {0}")]
    Internal(String),
}

impl ProviderError {
    /// A type-not-found error with the standard remediation hints.
    pub fn type_not_found(resource_type: impl Into<String>) -> Self {
        let resource_type = resource_type.into();
        let suggested_actions = vec![
            SuggestedAction {
                title: "Install the provider".to_string(),
                description: format!(
                    "No installed provider or transformer serves '{resource_type}'. \
                     Install the plugin that owns this type."
                ),
            },
            SuggestedAction {
                title: "Update the provider".to_string(),
                description: format!(
                    "An installed provider may predate '{resource_type}'. \
                     Updating it may add support."
                ),
            },
            SuggestedAction {
                title: "Check the type name".to_string(),
                description: "Resource types are namespaced as namespace/category/kind."
                    .to_string(),
            },
        ];
        ProviderError::TypeNotFound {
            resource_type,
            suggested_actions,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::PluginCallFailed {
                retryable: true,
                ..
            }
        )
    }
}
