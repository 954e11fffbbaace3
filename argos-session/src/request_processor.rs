use std::sync::Arc;

use argos_core::{CaptureRequest, StreamConfiguration};

use crate::internal_stream_manager::InternalStreamManager;
use crate::process_block::ProcessBlock;
use crate::SessionError;

/// Contrat d'un processeur de requêtes. Il transforme chaque requête
/// entrante en une ou plusieurs requêtes pour son bloc de traitement, et
/// peut enregistrer des flux internes à la configuration. Ces flux
/// apparaissent dans la configuration renvoyée au bloc mais jamais dans
/// celle du framework.
pub trait RequestProcessor: Send + Sync {
    /// Configure les flux du processeur et renvoie la configuration à
    /// donner au bloc de traitement connecté. Exactement une fois.
    fn configure_streams(
        &self,
        internal_stream_manager: &Arc<InternalStreamManager>,
        stream_config: &StreamConfiguration,
    ) -> Result<StreamConfiguration, SessionError>;

    /// Installe le bloc de traitement destinataire. Exactement une fois.
    fn set_process_block(&self, process_block: Box<dyn ProcessBlock>) -> Result<(), SessionError>;

    /// Traite une requête de capture
    fn process_request(&self, request: &CaptureRequest) -> Result<(), SessionError>;

    /// Purge les requêtes en attente
    fn flush(&self) -> Result<(), SessionError>;
}
