use thiserror::Error;

pub mod buffer;
pub mod metadata;
pub mod request;
pub mod stream;

pub use buffer::{BufferHandle, BufferStatus, Fence, StreamBuffer};
pub use metadata::{HdrUsageMode, Metadata, MetadataValue, OutputIntent, ProcessingMode};
pub use request::{
    CaptureRequest, CaptureResult, ErrorCode, ErrorMessage, NotifyMessage, RequestTemplate,
    ShutterMessage,
};
pub use stream::{
    DataSpace, HalStream, PixelFormat, Stream, StreamConfiguration, StreamConfigurationMode,
    StreamRotation, StreamType,
};

/// Erreur liée au modèle de données
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Flux invalide: {0}")]
    InvalidStream(String),

    #[error("Configuration de flux invalide: {0}")]
    InvalidConfiguration(String),

    #[error("Requête invalide: {0}")]
    InvalidRequest(String),
}

/// Vérifie qu'une configuration de flux est cohérente: identifiants uniques,
/// dimensions non nulles, et flux physiques correctement étiquetés.
pub fn validate_stream_configuration(config: &StreamConfiguration) -> Result<(), CoreError> {
    if config.streams.is_empty() {
        return Err(CoreError::InvalidConfiguration(
            "Aucun flux configuré".to_string(),
        ));
    }

    let mut seen_ids = std::collections::HashSet::new();
    for stream in &config.streams {
        if !seen_ids.insert(stream.id) {
            return Err(CoreError::InvalidConfiguration(format!(
                "Identifiant de flux dupliqué: {}",
                stream.id
            )));
        }

        if stream.width == 0 || stream.height == 0 {
            return Err(CoreError::InvalidStream(format!(
                "Dimensions nulles pour le flux {}: {}x{}",
                stream.id, stream.width, stream.height
            )));
        }
    }

    Ok(())
}
